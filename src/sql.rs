use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    UpsertResource {
        id: Ulid,
        name: String,
        capacity: u32,
        description: Option<String>,
    },
    DeactivateResource {
        id: Ulid,
    },
    SelectResources {
        id: Option<Ulid>,
    },
    InsertBooking {
        request: BookingRequest,
    },
    /// `user_id: None` cancels as a privileged actor.
    CancelBooking {
        id: Ulid,
        user_id: Option<Ulid>,
    },
    SelectBookingById {
        id: Ulid,
    },
    SelectUserBookings {
        user_id: Ulid,
        include_past: bool,
    },
    SelectSlotBookings {
        key: SlotKey,
    },
    SelectSlotAvailability {
        key: SlotKey,
        user_id: Option<Ulid>,
    },
    SelectBookingStats {
        resource_id: Option<Ulid>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
    /// Inclusive date range, one row per (date, slot).
    SelectResourceSchedule {
        resource_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        user_id: Option<Ulid>,
    },
    SelectSlotTimes,
    SetSetting {
        key: String,
        value: u32,
    },
    SelectSettings,
}

/// Column layout a statement answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowShape {
    Resources,
    Bookings,
    SlotAvailability,
    BookingStats,
    SlotTimes,
    Settings,
}

impl Command {
    /// `None` for commands answered with a bare tag.
    pub fn row_shape(&self) -> Option<RowShape> {
        match self {
            Command::UpsertResource { .. }
            | Command::DeactivateResource { .. }
            | Command::SetSetting { .. } => None,
            Command::SelectResources { .. } => Some(RowShape::Resources),
            Command::InsertBooking { .. }
            | Command::CancelBooking { .. }
            | Command::SelectBookingById { .. }
            | Command::SelectUserBookings { .. }
            | Command::SelectSlotBookings { .. } => Some(RowShape::Bookings),
            Command::SelectSlotAvailability { .. } | Command::SelectResourceSchedule { .. } => {
                Some(RowShape::SlotAvailability)
            }
            Command::SelectBookingStats { .. } => Some(RowShape::BookingStats),
            Command::SelectSlotTimes => Some(RowShape::SlotTimes),
            Command::SelectSettings => Some(RowShape::Settings),
        }
    }
}

/// Row shape of a prepared statement, which may still hold `$N` placeholders.
pub fn statement_row_shape(sql: &str) -> Option<RowShape> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    match stmts.first()? {
        Statement::Insert(insert) => {
            (insert_table_name(insert).ok()? == "bookings").then_some(RowShape::Bookings)
        }
        Statement::Delete(delete) => {
            (delete_table_name(delete).ok()? == "bookings").then_some(RowShape::Bookings)
        }
        Statement::Query(query) => {
            let SetExpr::Select(select) = query.body.as_ref() else {
                return None;
            };
            let table = table_factor_name(&select.from.first()?.relation).ok()?;
            match table.as_str() {
                "resources" => Some(RowShape::Resources),
                "bookings" => Some(RowShape::Bookings),
                "slot_availability" | "resource_schedule" => Some(RowShape::SlotAvailability),
                "booking_stats" => Some(RowShape::BookingStats),
                "slot_times" => Some(RowShape::SlotTimes),
                "settings" => Some(RowShape::Settings),
                _ => None,
            }
        }
        _ => None,
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const RESOURCE_COLUMNS: &[&str] = &["id", "name", "capacity", "description"];
const BOOKING_COLUMNS: &[&str] = &["id", "user_id", "resource_id", "date", "slot"];
const SETTING_COLUMNS: &[&str] = &["key", "value"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "resources" => {
            let row = named_row(insert, "resources", RESOURCE_COLUMNS)?;
            Ok(Command::UpsertResource {
                id: parse_ulid_expr(row.require("id")?)?,
                name: parse_string_expr(row.require("name")?)?,
                capacity: parse_u32(row.require("capacity")?)?,
                description: match row.get("description") {
                    Some(expr) => parse_string_or_null(expr)?,
                    None => None,
                },
            })
        }
        "bookings" => {
            let row = named_row(insert, "bookings", BOOKING_COLUMNS)?;
            Ok(Command::InsertBooking {
                request: BookingRequest {
                    id: parse_ulid_expr(row.require("id")?)?,
                    user_id: parse_ulid_expr(row.require("user_id")?)?,
                    resource_id: parse_ulid_expr(row.require("resource_id")?)?,
                    date: parse_date_expr(row.require("date")?)?,
                    slot: parse_slot(row.require("slot")?)?,
                },
            })
        }
        "settings" => {
            let row = named_row(insert, "settings", SETTING_COLUMNS)?;
            Ok(Command::SetSetting {
                key: parse_string_expr(row.require("key")?)?,
                value: parse_u32(row.require("value")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::collect(delete.selection.as_ref())?;
    let id = parse_ulid_expr(filters.require_eq("id")?)?;

    match table.as_str() {
        "resources" => Ok(Command::DeactivateResource { id }),
        "bookings" => Ok(Command::CancelBooking {
            id,
            user_id: filters.eq("user_id").map(parse_ulid_expr).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;
    let filters = Filters::collect(select.selection.as_ref())?;

    match table.as_str() {
        "resources" => Ok(Command::SelectResources {
            id: filters.eq("id").map(parse_ulid_expr).transpose()?,
        }),
        "bookings" => {
            if let Some(id) = filters.eq("id") {
                return Ok(Command::SelectBookingById {
                    id: parse_ulid_expr(id)?,
                });
            }
            if let Some(user_id) = filters.eq("user_id") {
                return Ok(Command::SelectUserBookings {
                    user_id: parse_ulid_expr(user_id)?,
                    include_past: filters
                        .eq("include_past")
                        .map(parse_bool)
                        .transpose()?
                        .unwrap_or(false),
                });
            }
            if filters.eq("resource_id").is_some() {
                return Ok(Command::SelectSlotBookings {
                    key: slot_key(&filters)?,
                });
            }
            Err(SqlError::MissingFilter("user_id"))
        }
        "slot_availability" => Ok(Command::SelectSlotAvailability {
            key: slot_key(&filters)?,
            user_id: filters.eq("user_id").map(parse_ulid_expr).transpose()?,
        }),
        "booking_stats" => {
            let (from, to) = date_range(&filters)?;
            Ok(Command::SelectBookingStats {
                resource_id: filters.eq("resource_id").map(parse_ulid_expr).transpose()?,
                from,
                to,
            })
        }
        "resource_schedule" => {
            let (Some(from), Some(to)) = date_range(&filters)? else {
                return Err(SqlError::MissingFilter("date"));
            };
            Ok(Command::SelectResourceSchedule {
                resource_id: parse_ulid_expr(filters.require_eq("resource_id")?)?,
                from,
                to,
                user_id: filters.eq("user_id").map(parse_ulid_expr).transpose()?,
            })
        }
        "slot_times" => Ok(Command::SelectSlotTimes),
        "settings" => Ok(Command::SelectSettings),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn slot_key(filters: &Filters) -> Result<SlotKey, SqlError> {
    Ok(SlotKey::new(
        parse_ulid_expr(filters.require_eq("resource_id")?)?,
        parse_date_expr(filters.require_eq("date")?)?,
        parse_slot(filters.require_eq("slot")?)?,
    ))
}

/// `"date" = d` pins both ends; otherwise `>=` and `<=` bound each side.
fn date_range(filters: &Filters) -> Result<(Option<NaiveDate>, Option<NaiveDate>), SqlError> {
    let exact = filters.eq("date").map(parse_date_expr).transpose()?;
    let from = filters.bound("date", FilterOp::GtEq).map(parse_date_expr).transpose()?;
    let to = filters.bound("date", FilterOp::LtEq).map(parse_date_expr).transpose()?;
    Ok((exact.or(from), exact.or(to)))
}

// ── WHERE clauses ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    GtEq,
    LtEq,
}

/// Conjunction of `column <op> value` terms.
struct Filters {
    terms: Vec<(String, FilterOp, Expr)>,
}

impl Filters {
    fn collect(selection: Option<&Expr>) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        Ok(Self { terms })
    }

    fn bound(&self, column: &str, op: FilterOp) -> Option<&Expr> {
        self.terms
            .iter()
            .find(|(c, o, _)| c == column && *o == op)
            .map(|(_, _, value)| value)
    }

    fn eq(&self, column: &str) -> Option<&Expr> {
        self.bound(column, FilterOp::Eq)
    }

    fn require_eq(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.eq(column).ok_or(SqlError::MissingFilter(column))
    }
}

fn collect_terms(expr: &Expr, terms: &mut Vec<(String, FilterOp, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, terms),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_terms(left, terms)?;
                    return collect_terms(right, terms);
                }
                ast::BinaryOperator::Eq => FilterOp::Eq,
                ast::BinaryOperator::GtEq => FilterOp::GtEq,
                ast::BinaryOperator::LtEq => FilterOp::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            terms.push((column, op, right.as_ref().clone()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// One VALUES row keyed by column name. Without an explicit column list the
/// table's default order applies.
struct NamedRow {
    values: Vec<(String, Expr)>,
}

impl NamedRow {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.values
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, value)| value)
    }

    fn require(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn named_row(
    insert: &ast::Insert,
    table: &'static str,
    default_columns: &[&str],
) -> Result<NamedRow, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    Ok(NamedRow {
        values: columns.into_iter().zip(values).collect(),
    })
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

/// Range checks are the engine's business. Any integer parses; values that
/// do not fit a `u8` saturate so the engine still reports them as an
/// invalid slot.
fn parse_slot(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64_expr(expr)?;
    Ok(v.clamp(0, i64::from(u8::MAX)) as u8)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

/// `'YYYY-MM-DD'`.
fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date '{s}': {e}")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
