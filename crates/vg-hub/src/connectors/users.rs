//! User account lifecycle: registration, profile edits, deletion, login.
//!
//! Payloads carry `user_id` plus optional `user_login`, `display_name` and
//! `role`.

use serde_json::Value;
use vg_core::Actor;

use super::{payload_i64, payload_str, ActionLink, Connector, ConnectorError, HookContext};
use crate::logger::LogEntry;

pub const SLUG: &str = "users";

struct UserRef {
    id: i64,
    name: String,
    login: String,
    role: String,
}

fn user_ref(payload: &Value) -> Result<UserRef, ConnectorError> {
    let id = payload_i64(payload, "user_id")
        .ok_or_else(|| ConnectorError::Payload("missing user_id".into()))?;
    let login = payload_str(payload, "user_login").unwrap_or_default();
    let name = payload_str(payload, "display_name")
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| login.clone());
    Ok(UserRef {
        id,
        name,
        login,
        role: payload_str(payload, "role").unwrap_or_default(),
    })
}

fn entry(user: &UserRef, message: &str, context: &str, action: &str) -> LogEntry {
    LogEntry::new(message, context, action)
        .arg("display_name", user.name.as_str())
        .object(user.id)
}

fn on_register(ctx: &HookContext<'_>, payload: &Value) -> Result<(), ConnectorError> {
    let user = user_ref(payload)?;
    let self_registered = ctx.actor.is_system() || ctx.actor.id == user.id;
    let log = if self_registered {
        LogEntry::new("New user registration", "users", "created")
            .arg("display_name", user.name.as_str())
            .object(user.id)
    } else {
        entry(&user, "New user account created for %s (%s)", "users", "created")
            .arg("role", user.role.as_str())
    };
    ctx.log(log.arg("user_login", user.login.as_str()))?;
    Ok(())
}

fn on_profile_update(ctx: &HookContext<'_>, payload: &Value) -> Result<(), ConnectorError> {
    let user = user_ref(payload)?;
    ctx.log(entry(&user, "%s's profile was updated", "users", "updated"))?;
    Ok(())
}

fn on_delete(ctx: &HookContext<'_>, payload: &Value) -> Result<(), ConnectorError> {
    let user = user_ref(payload)?;
    ctx.log(
        entry(&user, "%s's account was deleted (%s)", "users", "deleted")
            .arg("role", user.role.as_str()),
    )?;
    Ok(())
}

fn on_login(ctx: &HookContext<'_>, payload: &Value) -> Result<(), ConnectorError> {
    let user = user_ref(payload)?;
    let mut actor = Actor::user(user.id, user.role.as_str());
    actor.ip = ctx.actor.ip.clone();
    ctx.log(entry(&user, "%s logged in", "sessions", "login").actor(actor))?;
    Ok(())
}

pub fn connector() -> Connector {
    Connector::new(SLUG, "Users")
        .context("users", "Users")
        .context("sessions", "Sessions")
        .action("created", "Created")
        .action("updated", "Updated")
        .action("deleted", "Deleted")
        .action("login", "Log In")
        .on("user_register", on_register)
        .on("profile_update", on_profile_update)
        .on("delete_user", on_delete)
        .on("wp_login", on_login)
        .action_links(|record| match (record.object_id, record.action.as_str()) {
            (Some(id), action) if action != "deleted" => {
                vec![ActionLink::new("Edit User", format!("/users/{id}/edit"))]
            }
            _ => Vec::new(),
        })
}
