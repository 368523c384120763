use chrono::NaiveDate;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::ReservationRequest;
use crate::model::*;

/// Which interval an availability query asks about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityWindow {
    Slot(String),
    Interval { start: SlotTime, end: SlotTime },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationFilter {
    Item(Ulid),
    Id(Ulid),
    BookingCode(String),
}

/// Parsed command from one input line.
#[derive(Debug, PartialEq)]
pub enum Command {
    Use {
        tenant: String,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
    InsertTenant {
        profile: TenantProfile,
    },
    DeleteTenant {
        slug: String,
    },
    UpdateSettings {
        settings: TenantSettings,
    },
    /// With an `ON CONFLICT` clause an existing item is replaced.
    InsertItem {
        item: InventoryItem,
        upsert: bool,
    },
    DeleteItem {
        id: Ulid,
    },
    SelectItems,
    SelectSlots,
    SelectAvailability {
        date: NaiveDate,
        window: AvailabilityWindow,
    },
    SelectReservations {
        filter: ReservationFilter,
    },
    InsertReservation {
        request: ReservationRequest,
    },
    InsertConfirmation {
        token: String,
        accepted_terms: bool,
    },
    InsertStatusChange {
        id: Ulid,
        status: TerminalStatus,
    },
    InsertPayment {
        id: Ulid,
        amount_cents: u64,
    },
    InsertLinkRequest {
        id: Ulid,
    },
    /// Cancels; reservations are never physically removed.
    DeleteReservation {
        id: Ulid,
    },
}

/// `KEYWORD rest` with a case-insensitive keyword; returns `rest` trimmed.
fn strip_keyword<'a>(input: &'a str, keyword: &str) -> Option<&'a str> {
    let head = input.get(..keyword.len())?;
    let rest = &input[keyword.len()..];
    if head.eq_ignore_ascii_case(keyword) && (rest.is_empty() || rest.starts_with(char::is_whitespace)) {
        Some(rest.trim())
    } else {
        None
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err(SqlError::Empty);
    }
    if let Some(rest) = strip_keyword(trimmed, "USE") {
        let tenant = rest.trim_matches('"').to_string();
        if tenant.is_empty() {
            return Err(SqlError::Parse("USE needs a tenant".into()));
        }
        return Ok(Command::Use { tenant });
    }
    if let Some(rest) = strip_keyword(trimmed, "UNLISTEN") {
        return Ok(match rest {
            "*" => Command::UnlistenAll,
            "" => return Err(SqlError::Parse("UNLISTEN needs a channel or *".into())),
            channel => Command::Unlisten {
                channel: channel.to_string(),
            },
        });
    }
    if let Some(rest) = strip_keyword(trimmed, "LISTEN") {
        if rest.is_empty() {
            return Err(SqlError::Parse("LISTEN needs a channel".into()));
        }
        return Ok(Command::Listen {
            channel: rest.to_string(),
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, trimmed).map_err(|e| SqlError::Parse(e.to_string()))?;
    match stmts.first() {
        None => Err(SqlError::Empty),
        Some(Statement::Insert(insert)) => parse_insert(insert),
        Some(Statement::Delete(delete)) => parse_delete(delete),
        Some(Statement::Query(query)) => parse_select(query),
        Some(other) => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn require_arity(table: &'static str, values: &[Expr], min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "tenants" => {
            require_arity("tenants", &values, 3)?;
            let settings = match values.get(4) {
                Some(expr) => match parse_string_or_null(expr)? {
                    Some(json) => parse_settings_json(&json)?,
                    None => TenantSettings::default(),
                },
                None => TenantSettings::default(),
            };
            Ok(Command::InsertTenant {
                profile: TenantProfile {
                    slug: parse_string(&values[0])?,
                    name: parse_string(&values[1])?,
                    timezone: parse_string(&values[2])?,
                    admin_email: values.get(3).map(parse_string_or_null).transpose()?.flatten(),
                    settings,
                },
            })
        }
        "settings" => {
            require_arity("settings", &values, 1)?;
            Ok(Command::UpdateSettings {
                settings: parse_settings_json(&parse_string(&values[0])?)?,
            })
        }
        "items" => {
            require_arity("items", &values, 3)?;
            Ok(Command::InsertItem {
                item: InventoryItem {
                    id: parse_ulid(&values[0])?,
                    name: parse_string(&values[1])?,
                    total_stock: parse_u32(&values[2])?,
                    broken_count: values.get(3).map(parse_u32).transpose()?.unwrap_or(0),
                    hourly_cost_cents: values.get(4).map(parse_u64_or_null).transpose()?.flatten(),
                },
                upsert: insert.on.is_some(),
            })
        }
        "reservations" => {
            require_arity("reservations", &values, 6)?;
            Ok(Command::InsertReservation {
                request: ReservationRequest {
                    item_id: parse_ulid(&values[0])?,
                    date: parse_date(&values[1])?,
                    slot_id: parse_string(&values[2])?,
                    quantity: parse_u32(&values[3])?,
                    customer: CustomerContact {
                        name: parse_string(&values[4])?,
                        email: parse_string(&values[5])?,
                        phone: values.get(6).map(parse_string_or_null).transpose()?.flatten(),
                    },
                },
            })
        }
        "confirmations" => {
            require_arity("confirmations", &values, 2)?;
            Ok(Command::InsertConfirmation {
                token: parse_string(&values[0])?,
                accepted_terms: parse_bool(&values[1])?,
            })
        }
        "status_changes" => {
            require_arity("status_changes", &values, 2)?;
            let raw = parse_string(&values[1])?;
            Ok(Command::InsertStatusChange {
                id: parse_ulid(&values[0])?,
                status: raw.parse().map_err(SqlError::Parse)?,
            })
        }
        "payments" => {
            require_arity("payments", &values, 2)?;
            Ok(Command::InsertPayment {
                id: parse_ulid(&values[0])?,
                amount_cents: parse_u64(&values[1])?,
            })
        }
        "link_requests" => {
            require_arity("link_requests", &values, 1)?;
            Ok(Command::InsertLinkRequest {
                id: parse_ulid(&values[0])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "tenants" => Ok(Command::DeleteTenant {
            slug: parse_string(required(&filters, "slug")?)?,
        }),
        "items" => Ok(Command::DeleteItem {
            id: parse_ulid(required(&filters, "id")?)?,
        }),
        "reservations" => Ok(Command::DeleteReservation {
            id: parse_ulid(required(&filters, "id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let first = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&first.relation)?;
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "items" => Ok(Command::SelectItems),
        "slots" => Ok(Command::SelectSlots),
        "availability" => {
            let date = parse_date(required(&filters, "booking_date")?)?;
            let window = if let Some(slot) = lookup(&filters, "slot_id") {
                AvailabilityWindow::Slot(parse_string(slot)?)
            } else {
                AvailabilityWindow::Interval {
                    start: parse_slot_time(required(&filters, "start_time")?)?,
                    end: parse_slot_time(required(&filters, "end_time")?)?,
                }
            };
            Ok(Command::SelectAvailability { date, window })
        }
        "reservations" => {
            let filter = if let Some(expr) = lookup(&filters, "id") {
                ReservationFilter::Id(parse_ulid(expr)?)
            } else if let Some(expr) = lookup(&filters, "booking_code") {
                ReservationFilter::BookingCode(parse_string(expr)?)
            } else {
                ReservationFilter::Item(parse_ulid(required(&filters, "item_id")?)?)
            };
            Ok(Command::SelectReservations { filter })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE clauses ─────────────────────────────────────────────

/// Flatten `a = x AND b = y ...` into `(column, value)` pairs.
fn where_filters(selection: Option<&Expr>) -> Result<Vec<(String, Expr)>, SqlError> {
    let mut out = Vec::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut out)?;
    }
    Ok(out)
}

fn collect_eq_filters(expr: &Expr, out: &mut Vec<(String, Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq_filters(left, out)?;
                collect_eq_filters(right, out)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                out.push((col, (**right).clone()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
        other => Err(SqlError::Unsupported(format!("WHERE clause {other}"))),
    }
}

fn lookup<'a>(filters: &'a [(String, Expr)], column: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == column).map(|(_, e)| e)
}

fn required<'a>(filters: &'a [(String, Expr)], column: &'static str) -> Result<&'a Expr, SqlError> {
    lookup(filters, column).ok_or(SqlError::MissingFilter(column))
}

// ── Helpers ───────────────────────────────────────────────────

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
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
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
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.clone()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    s.parse::<NaiveDate>()
        .map_err(|e| SqlError::Parse(format!("bad date {s:?} (want YYYY-MM-DD): {e}")))
}

fn parse_slot_time(expr: &Expr) -> Result<SlotTime, SqlError> {
    parse_string(expr)?.parse().map_err(SqlError::Parse)
}

fn parse_settings_json(json: &str) -> Result<TenantSettings, SqlError> {
    serde_json::from_str(json).map_err(|e| SqlError::Parse(format!("bad settings: {e}")))
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse::<i64>()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64_expr(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u64(expr: &Expr) -> Result<u64, SqlError> {
    let v = parse_i64_expr(expr)?;
    u64::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_u64_or_null(expr: &Expr) -> Result<Option<u64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_u64(expr).map(Some),
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "yes" | "1" => Ok(true),
            "false" | "f" | "no" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(other) => Err(SqlError::Parse(format!("expected bool, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing WHERE filter: {0}")]
    MissingFilter(&'static str),
}

impl SqlError {
    pub fn code(&self) -> &'static str {
        "syntax_error"
    }
}
