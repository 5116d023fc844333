//! # Record Query
//!
//! Full read query over the `records` table: context filters, per-column
//! filters, meta groups, search, date bounds, ordering, paging and
//! projection. Built from raw args with [`RecordQuery::from_args`] and
//! compiled into a select plus a matching count statement.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vg_core::TIMESTAMP_FORMAT;

use super::compiler::{Clause, Compiler, Dialect, FieldMap};
use super::parser::{self, scalar_text};
use super::{CompareOp, Node, Predicate, PredicateGroup};

pub const DEFAULT_PER_PAGE: u64 = 20;

/// Flat shorthand keys for record columns: `(arg key, filter field)`.
const RECORD_KEYS: [(&str, &str); 5] = [
    ("record", "id"),
    ("object_id", "object_id"),
    ("user_id", "actor_id"),
    ("user_role", "actor_role"),
    ("ip", "ip"),
];

// =============================================================================
// Columns
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    Id,
    ObjectId,
    ActorId,
    ActorRole,
    CreatedAt,
    Summary,
    Connector,
    Context,
    Action,
    Ip,
}

impl RecordField {
    pub const ALL: [RecordField; 10] = [
        Self::Id,
        Self::ObjectId,
        Self::ActorId,
        Self::ActorRole,
        Self::CreatedAt,
        Self::Summary,
        Self::Connector,
        Self::Context,
        Self::Action,
        Self::Ip,
    ];

    pub const fn column(self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::ObjectId => "object_id",
            Self::ActorId => "actor_id",
            Self::ActorRole => "actor_role",
            Self::CreatedAt => "created_at",
            Self::Summary => "summary",
            Self::Connector => "connector",
            Self::Context => "context",
            Self::Action => "action",
            Self::Ip => "ip",
        }
    }

    /// Column names plus the public aliases (`record`, `user_id`, `date`...).
    pub fn from_name(name: &str) -> Option<Self> {
        let field = match name.trim().to_ascii_lowercase().as_str() {
            "id" | "record" => Self::Id,
            "object_id" => Self::ObjectId,
            "actor_id" | "user_id" | "author" => Self::ActorId,
            "actor_role" | "user_role" | "author_role" => Self::ActorRole,
            "created_at" | "created" | "date" => Self::CreatedAt,
            "summary" => Self::Summary,
            "connector" => Self::Connector,
            "context" => Self::Context,
            "action" => Self::Action,
            "ip" => Self::Ip,
            _ => return None,
        };
        Some(field)
    }

    fn searchable(self) -> bool {
        matches!(
            self,
            Self::Summary | Self::Connector | Self::Context | Self::Action | Self::Ip
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn from_raw(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("asc") {
            Self::Asc
        } else {
            Self::Desc
        }
    }

    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

// =============================================================================
// Search & dates
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Search {
    pub field: RecordField,
    pub term: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateOp {
    /// `>`
    After,
    /// `>=`
    From,
    /// `<`
    Before,
}

impl DateOp {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::After => ">",
            Self::From => ">=",
            Self::Before => "<",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateBound {
    pub op: DateOp,
    pub at: NaiveDateTime,
}

impl DateBound {
    fn new(op: DateOp, at: NaiveDateTime) -> Self {
        Self { op, at }
    }
}

fn parse_day(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

fn day_start(day: NaiveDate) -> NaiveDateTime {
    day.and_time(NaiveTime::MIN)
}

fn next_day_start(day: NaiveDate) -> NaiveDateTime {
    day_start(day) + Duration::days(1)
}

/// `YYYY-MM-DD` with an optional ` HH:MM:SS` (or `T`-separated) time.
fn parse_moment(raw: &str) -> Option<(NaiveDateTime, bool)> {
    let raw = raw.trim();
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(at) = NaiveDateTime::parse_from_str(raw, format) {
            return Some((at, true));
        }
    }
    parse_day(raw).map(|day| (day_start(day), false))
}

fn date_bounds(args: &Map<String, Value>) -> Vec<DateBound> {
    let text = |key: &str| args.get(key).and_then(scalar_text).filter(|s| !s.is_empty());
    let mut bounds = Vec::new();

    if let Some(day) = text("date").as_deref().and_then(parse_day) {
        bounds.push(DateBound::new(DateOp::From, day_start(day)));
        bounds.push(DateBound::new(DateOp::Before, next_day_start(day)));
    }
    if let Some(day) = text("date_from").as_deref().and_then(parse_day) {
        bounds.push(DateBound::new(DateOp::From, day_start(day)));
    }
    if let Some(day) = text("date_to").as_deref().and_then(parse_day) {
        bounds.push(DateBound::new(DateOp::Before, next_day_start(day)));
    }
    // A bare day in `date_after` means after that whole day.
    if let Some((at, has_time)) = text("date_after").as_deref().and_then(parse_moment) {
        if has_time {
            bounds.push(DateBound::new(DateOp::After, at));
        } else {
            bounds.push(DateBound::new(DateOp::From, at + Duration::days(1)));
        }
    }
    if let Some((at, _)) = text("date_before").as_deref().and_then(parse_moment) {
        bounds.push(DateBound::new(DateOp::Before, at));
    }
    bounds
}

// =============================================================================
// Query
// =============================================================================

/// Select + count statements sharing one parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub select_sql: String,
    pub count_sql: String,
    pub params: Vec<String>,
    pub fields: Vec<RecordField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    /// Connector / context / action filters.
    pub filters: PredicateGroup,
    /// Per-column shorthand filters, always ANDed.
    pub record_filters: PredicateGroup,
    /// `meta_query` groups.
    pub meta_filters: PredicateGroup,
    pub search: Option<Search>,
    pub dates: Vec<DateBound>,
    pub order_by: RecordField,
    pub order: SortOrder,
    /// `None` is unlimited.
    pub limit: Option<u64>,
    pub offset: u64,
    pub fields: Vec<RecordField>,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            filters: PredicateGroup::default(),
            record_filters: PredicateGroup::default(),
            meta_filters: PredicateGroup::default(),
            search: None,
            dates: Vec::new(),
            order_by: RecordField::CreatedAt,
            order: SortOrder::Desc,
            limit: Some(DEFAULT_PER_PAGE),
            offset: 0,
            fields: RecordField::ALL.to_vec(),
        }
    }
}

/// Integer from a JSON number or numeric string.
/// Largest offset SQL engines accept as a signed 64-bit literal.
const MAX_OFFSET: u64 = i64::MAX as u64;

fn int_arg(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl RecordQuery {
    /// Build from raw args. Never fails: bad values fall back to defaults.
    pub fn from_args(raw: &Value) -> Self {
        let mut query = Self::default();
        let Some(args) = raw.as_object() else {
            return query;
        };

        query.filters = parser::parse(raw);
        query.record_filters.members = parser::parse_flat(args, &RECORD_KEYS);

        if let Some(meta) = args.get("meta_query") {
            let (relation, groups) = parser::parse_nested(meta, |key| {
                (!key.is_empty()).then(|| format!("meta.{key}"))
            });
            query.meta_filters = PredicateGroup {
                relation,
                members: groups.into_iter().map(Node::Group).collect(),
            };
        }

        if let Some(term) = args.get("search").and_then(scalar_text).filter(|t| !t.is_empty()) {
            let field = args
                .get("search_field")
                .and_then(Value::as_str)
                .and_then(RecordField::from_name)
                .filter(|f| f.searchable())
                .unwrap_or(RecordField::Summary);
            query.search = Some(Search { field, term });
        }

        query.dates = date_bounds(args);

        if let Some(order_by) = args
            .get("orderby")
            .and_then(Value::as_str)
            .and_then(RecordField::from_name)
            .filter(|f| *f != RecordField::ActorRole)
        {
            query.order_by = order_by;
        }
        if let Some(order) = args.get("order").and_then(Value::as_str) {
            query.order = SortOrder::from_raw(order);
        }

        match int_arg(args.get("records_per_page")) {
            Some(n) if n < 0 => query.limit = None,
            Some(n) if n > 0 => query.limit = Some(n as u64),
            _ => {}
        }
        match (int_arg(args.get("offset")), int_arg(args.get("paged"))) {
            (Some(offset), _) if offset >= 0 => query.offset = offset as u64,
            (_, Some(paged)) if paged > 1 => {
                if let Some(limit) = query.limit {
                    query.offset = (paged as u64 - 1).saturating_mul(limit).min(MAX_OFFSET);
                }
            }
            _ => {}
        }

        let requested: Vec<String> = match args.get("fields") {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
            Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
            _ => Vec::new(),
        };
        let mut fields: Vec<RecordField> = Vec::new();
        for field in requested.iter().filter_map(|name| RecordField::from_name(name)) {
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        if !fields.is_empty() {
            query.fields = fields;
        }

        tracing::debug!(
            "Record query: {} filter groups, {} dates, limit {:?}, offset {}",
            query.filters.len() + query.record_filters.len() + query.meta_filters.len(),
            query.dates.len(),
            query.limit,
            query.offset
        );
        query
    }

    /// Compile against the `records` table.
    pub fn compile(&self, dialect: Dialect) -> CompiledQuery {
        self.compile_for(&FieldMap::records(), "records", dialect)
    }

    pub fn compile_for(&self, fields: &FieldMap, table: &str, dialect: Dialect) -> CompiledQuery {
        let mut compiler = Compiler::new(fields, dialect);
        let mut clause = Clause::default();

        compiler.compile_into(&self.filters, &mut clause);
        compiler.compile_into(&self.record_filters, &mut clause);
        compiler.compile_into(&self.meta_filters, &mut clause);

        if let Some(search) = &self.search {
            let predicate =
                Predicate::with_compare(search.field.column(), CompareOp::Like, search.term.as_str());
            compiler.compile_into(&PredicateGroup::single(predicate), &mut clause);
        }

        let created = compiler.column_ref(RecordField::CreatedAt.column());
        for bound in &self.dates {
            clause.and_where(
                &format!("{created} {} ?", bound.op.as_sql()),
                [bound.at.format(TIMESTAMP_FORMAT).to_string()],
            );
        }

        let id = compiler.column_ref(&fields.id_column);
        let from = format!(
            "FROM {} AS {}{} WHERE 1=1{}",
            dialect.quote_ident(table),
            fields.table_alias,
            clause.join,
            clause.where_sql
        );

        let columns = self
            .fields
            .iter()
            .map(|f| compiler.column_ref(f.column()))
            .collect::<Vec<_>>()
            .join(", ");
        let group_by = if clause.join.is_empty() {
            String::new()
        } else {
            format!(" GROUP BY {id}")
        };
        let direction = self.order.as_sql();
        let mut order_by = format!(
            "{} {direction}",
            compiler.column_ref(self.order_by.column())
        );
        if self.order_by != RecordField::Id {
            order_by.push_str(&format!(", {id} {direction}"));
        }

        CompiledQuery {
            select_sql: format!(
                "SELECT {columns} {from}{group_by} ORDER BY {order_by}{}",
                dialect.limit_clause(self.limit, self.offset)
            ),
            count_sql: format!("SELECT COUNT(DISTINCT {id}) {from}"),
            params: clause.params(),
            fields: self.fields.clone(),
        }
    }

    /// True when no filter of any kind is set.
    pub fn is_unfiltered(&self) -> bool {
        self.filters.is_empty()
            && self.record_filters.is_empty()
            && self.meta_filters.is_empty()
            && self.search.is_none()
            && self.dates.is_empty()
    }
}
