//! # Clause Compiler
//!
//! Turns a [`PredicateGroup`] tree into SQL fragments. Every value is bound
//! through a `?` placeholder; only whitelisted operators, whitelisted cast
//! types and quoted identifiers ever reach the SQL text.

use std::collections::HashMap;

use super::{CastType, CompareOp, Node, Predicate, PredicateGroup};

// =============================================================================
// Dialect
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Sqlite,
    MySql,
}

impl Dialect {
    /// Quote an identifier, doubling any embedded quote character.
    pub fn quote_ident(self, ident: &str) -> String {
        match self {
            Self::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
            Self::MySql => format!("`{}`", ident.replace('`', "``")),
        }
    }

    /// SQL text of an operator. SQLite has no `RLIKE`.
    pub fn operator(self, op: CompareOp) -> &'static str {
        match (self, op) {
            (Self::Sqlite, CompareOp::RLike) => "REGEXP",
            (_, op) => op.as_sql(),
        }
    }

    /// Cast target as understood by the engine.
    pub fn cast_type(self, cast: &CastType) -> String {
        match self {
            Self::MySql => cast.as_str().to_string(),
            Self::Sqlite => {
                let name = cast.as_str();
                let affinity = if name.starts_with("SIGNED") || name.starts_with("UNSIGNED") {
                    "INTEGER"
                } else if name.starts_with("NUMERIC") || name.starts_with("DECIMAL") {
                    "REAL"
                } else {
                    "TEXT"
                };
                affinity.to_string()
            }
        }
    }

    /// `LIMIT` clause. `None` means unlimited; an offset still applies.
    pub fn limit_clause(self, limit: Option<u64>, offset: u64) -> String {
        match (self, limit) {
            (_, Some(limit)) => format!(" LIMIT {limit} OFFSET {offset}"),
            (Self::Sqlite, None) if offset == 0 => String::new(),
            (Self::Sqlite, None) => format!(" LIMIT -1 OFFSET {offset}"),
            (Self::MySql, None) if offset == 0 => String::new(),
            (Self::MySql, None) => format!(" LIMIT {} OFFSET {offset}", u64::MAX),
        }
    }
}

// =============================================================================
// Field mapping
// =============================================================================

/// Where a filter field lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldTarget {
    Column(String),
    /// A key of the meta table, joined per predicate.
    Meta(String),
}

/// Field name → column mapping for one table.
#[derive(Debug, Clone)]
pub struct FieldMap {
    pub table_alias: String,
    pub id_column: String,
    pub meta_table: Option<String>,
    columns: HashMap<String, String>,
}

impl FieldMap {
    /// Empty mapping for a table aliased `table_alias` with primary key
    /// `id_column`. Meta fields stay disabled until [`FieldMap::meta_table`].
    pub fn new(table_alias: impl Into<String>, id_column: impl Into<String>) -> Self {
        Self {
            table_alias: table_alias.into(),
            id_column: id_column.into(),
            meta_table: None,
            columns: HashMap::new(),
        }
    }

    /// Map filter field `field` to `column` of the aliased table.
    pub fn column(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
        self.columns.insert(field.into(), column.into());
        self
    }

    /// Enable `meta.<key>` fields, joined from `table`.
    pub fn meta_table(mut self, table: impl Into<String>) -> Self {
        self.meta_table = Some(table.into());
        self
    }

    /// Mapping for the `records` table (alias `r`) and its `record_meta`.
    pub fn records() -> Self {
        let columns = [
            "id",
            "object_id",
            "actor_id",
            "actor_role",
            "created_at",
            "summary",
            "connector",
            "context",
            "action",
            "ip",
        ];
        columns
            .into_iter()
            .fold(Self::new("r", "id"), |map, name| map.column(name, name))
            .meta_table("record_meta")
    }

    /// Mapped columns first, then `meta.<key>` when a meta table exists.
    /// Anything else is taken as a column name verbatim.
    pub fn resolve(&self, field: &str) -> FieldTarget {
        if let Some(column) = self.columns.get(field) {
            return FieldTarget::Column(column.clone());
        }
        match (field.strip_prefix("meta."), &self.meta_table) {
            (Some(key), Some(_)) if !key.is_empty() => FieldTarget::Meta(key.to_string()),
            _ => FieldTarget::Column(field.to_string()),
        }
    }
}

// =============================================================================
// Clause
// =============================================================================

/// Compiled fragments plus their bound values.
///
/// `join_params` bind the placeholders of `join`, `where_params` those of
/// `where_sql`. Join fragments precede the where clause in a statement, so
/// [`Clause::params`] lists join values first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Clause {
    pub join: String,
    pub join_params: Vec<String>,
    pub where_sql: String,
    pub where_params: Vec<String>,
}

impl Clause {
    /// True when nothing was compiled.
    pub fn is_empty(&self) -> bool {
        self.join.is_empty() && self.where_sql.is_empty()
    }

    /// Every bound value in placeholder order.
    pub fn params(&self) -> Vec<String> {
        self.join_params
            .iter()
            .chain(&self.where_params)
            .cloned()
            .collect()
    }

    /// Append a raw ` AND <sql>` fragment with its values.
    pub fn and_where(&mut self, sql: &str, params: impl IntoIterator<Item = String>) {
        self.where_sql.push_str(" AND ");
        self.where_sql.push_str(sql);
        self.where_params.extend(params);
    }
}

// =============================================================================
// Compiler
// =============================================================================

/// Compiles groups against one [`FieldMap`]. Meta join aliases are numbered
/// per compiler, so one compiler should build one statement.
pub struct Compiler<'a> {
    fields: &'a FieldMap,
    dialect: Dialect,
    meta_aliases: usize,
}

impl<'a> Compiler<'a> {
    /// Compiler with no meta joins emitted yet.
    pub fn new(fields: &'a FieldMap, dialect: Dialect) -> Self {
        Self {
            fields,
            dialect,
            meta_aliases: 0,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Quoted `<alias>.<column>` for a mapped or verbatim column.
    pub fn column_ref(&self, column: &str) -> String {
        format!("{}.{}", self.fields.table_alias, self.dialect.quote_ident(column))
    }

    /// Compile `group` into a fresh clause whose `where_sql` is ` AND (...)`,
    /// or empty for an empty group.
    pub fn compile(&mut self, group: &PredicateGroup) -> Clause {
        let mut clause = Clause::default();
        self.compile_into(group, &mut clause);
        clause
    }

    /// Append `group` to `clause` as ` AND (...)`. An empty group adds nothing.
    pub fn compile_into(&mut self, group: &PredicateGroup, clause: &mut Clause) {
        let sql = self.group_sql(group, clause);
        if !sql.is_empty() {
            clause.where_sql.push_str(" AND ");
            clause.where_sql.push_str(&sql);
        }
    }

    fn group_sql(&mut self, group: &PredicateGroup, clause: &mut Clause) -> String {
        let mut parts = Vec::with_capacity(group.len());
        for member in &group.members {
            let sql = match member {
                Node::Predicate(predicate) => self.predicate_sql(predicate, clause),
                Node::Group(inner) => self.group_sql(inner, clause),
            };
            if !sql.is_empty() {
                parts.push(sql);
            }
        }
        if parts.is_empty() {
            return String::new();
        }
        let glue = format!("\n{} ", group.relation.as_sql());
        format!("({})", parts.join(&glue))
    }

    fn predicate_sql(&mut self, predicate: &Predicate, clause: &mut Clause) -> String {
        let target = match self.fields.resolve(&predicate.field) {
            FieldTarget::Column(column) => self.column_ref(&column),
            FieldTarget::Meta(key) => self.join_meta(key, clause),
        };
        let operand = format!(
            "CAST({} AS {})",
            target,
            self.dialect.cast_type(&predicate.cast)
        );
        let op = self.dialect.operator(predicate.compare);

        if predicate.compare.takes_list() {
            let values = predicate.value.to_list();
            if values.is_empty() {
                return match predicate.compare {
                    CompareOp::In => "1 = 0".to_string(),
                    _ => "1 = 1".to_string(),
                };
            }
            let placeholders = vec!["?"; values.len()].join(", ");
            clause.where_params.extend(values);
            return format!("{operand} {op} ({placeholders})");
        }

        let value = predicate.value.first();
        if predicate.compare.is_like() {
            clause.where_params.push(format!("%{}%", escape_like(value)));
            return format!("{operand} {op} ? ESCAPE '!'");
        }
        clause.where_params.push(value.to_string());
        format!("{operand} {op} ?")
    }

    /// Adds one meta join and returns the joined value column.
    fn join_meta(&mut self, key: String, clause: &mut Clause) -> String {
        self.meta_aliases += 1;
        let alias = format!("mt{}", self.meta_aliases);
        let q = |ident: &str| self.dialect.quote_ident(ident);
        let table = self.fields.meta_table.as_deref().unwrap_or("record_meta");
        clause.join.push_str(&format!(
            " LEFT JOIN {} AS {alias} ON ({alias}.{} = {}.{} AND {alias}.{} = ?)",
            q(table),
            q("record_id"),
            self.fields.table_alias,
            q(&self.fields.id_column),
            q("meta_key"),
        ));
        clause.join_params.push(key);
        format!("{alias}.{}", q("meta_value"))
    }
}

/// Compile `group` in one shot.
pub fn compile(group: &PredicateGroup, fields: &FieldMap, dialect: Dialect) -> Clause {
    Compiler::new(fields, dialect).compile(group)
}

/// Escape LIKE wildcards with `!`, matching the `ESCAPE '!'` clause.
pub fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '!' | '%' | '_') {
            escaped.push('!');
        }
        escaped.push(c);
    }
    escaped
}
