//! Option changes. Several `update_option` calls for the same option in one
//! request collapse into a single record at commit time.
//!
//! Payload: `{ "option": <name>, "old_value": <any>, "value": <any> }`.

use serde_json::Value;

use super::{changed_keys, payload_str, Connector, ConnectorError, HookContext};
use crate::logger::LogEntry;

pub const SLUG: &str = "settings";

/// Internal options that change on nearly every request.
const IGNORED_OPTIONS: [&str; 5] = [
    "cron",
    "rewrite_rules",
    "recently_edited",
    "doing_cron",
    "auto_updater.lock",
];

const IGNORED_PREFIXES: [&str; 2] = ["_transient_", "_site_transient_"];

fn is_ignored(option: &str) -> bool {
    IGNORED_OPTIONS.contains(&option)
        || IGNORED_PREFIXES.iter().any(|prefix| option.starts_with(prefix))
}

/// Settings screen an option belongs to.
pub fn context_for(option: &str) -> &'static str {
    match option {
        "blogname" | "blogdescription" | "siteurl" | "home" | "admin_email"
        | "users_can_register" | "default_role" | "timezone_string" | "date_format"
        | "time_format" | "start_of_week" | "WPLANG" => "general",
        "default_category" | "default_post_format" | "use_smilies" | "ping_sites" => "writing",
        "show_on_front" | "page_on_front" | "page_for_posts" | "posts_per_page"
        | "posts_per_rss" | "blog_public" => "reading",
        "default_comment_status" | "default_ping_status" | "comment_moderation"
        | "comments_per_page" | "comment_registration" | "require_name_email" => "discussion",
        "thumbnail_size_w" | "thumbnail_size_h" | "medium_size_w" | "medium_size_h"
        | "large_size_w" | "large_size_h" | "uploads_use_yearmonth_folders" => "media",
        "permalink_structure" | "category_base" | "tag_base" => "permalinks",
        _ => "settings",
    }
}

fn on_update_option(ctx: &HookContext<'_>, payload: &Value) -> Result<(), ConnectorError> {
    let option = payload_str(payload, "option")
        .filter(|o| !o.is_empty())
        .ok_or_else(|| ConnectorError::Payload("missing option".into()))?;
    if is_ignored(&option) {
        return Ok(());
    }

    let old_value = payload.get("old_value").cloned().unwrap_or(Value::Null);
    let new_value = payload.get("value").cloned().unwrap_or(Value::Null);
    if old_value == new_value {
        return Ok(());
    }

    let mut entry = LogEntry::new("\"%s\" setting was updated", context_for(&option), "updated")
        .arg("option", option.as_str());
    let changed = changed_keys(&old_value, &new_value, 1);
    if changed.is_empty() {
        entry = entry.arg("old_value", old_value).arg("value", new_value);
    } else {
        entry = entry.arg("changed_keys", changed);
    }

    ctx.delayed_log(option, entry);
    Ok(())
}

pub fn connector() -> Connector {
    Connector::new(SLUG, "Settings")
        .context("settings", "Settings")
        .context("general", "General")
        .context("writing", "Writing")
        .context("reading", "Reading")
        .context("discussion", "Discussion")
        .context("media", "Media")
        .context("permalinks", "Permalinks")
        .action("updated", "Updated")
        .on("update_option", on_update_option)
}
