use std::collections::BTreeMap;

use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Status given to bookings inserted without one.
pub const DEFAULT_BOOKING_STATUS: &str = "confirmed";

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertResource {
        id: Ulid,
        name: Option<String>,
        description: Option<String>,
        /// `None` is unlimited.
        capacity: Option<u32>,
        schedule: ScheduleInput,
    },
    UpdateResource {
        id: Ulid,
        update: ResourceUpdate,
    },
    DeleteResource {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        status: String,
        metadata: Metadata,
    },
    UpdateBooking {
        id: Ulid,
        update: BookingUpdate,
    },
    DeleteBooking {
        id: Ulid,
    },
    InsertUnavailability {
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
    },
    UpdateUnavailability {
        id: Ulid,
        update: UnavailabilityUpdate,
    },
    DeleteUnavailability {
        id: Ulid,
    },
    SelectResources {
        filter: ResourceFilter,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectUnavailabilities {
        filter: UnavailabilityFilter,
    },
    SelectAvailability {
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("multiple statements".into()));
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT / upsert ───────────────────────────────────────────

const RESOURCE_COLUMNS: &[&str] = &["id", "name", "capacity", "description", "timezone", "slots"];
const BOOKING_COLUMNS: &[&str] = &["id", "resource_id", "start", "end", "status", "metadata"];
const UNAVAILABILITY_COLUMNS: &[&str] = &["id", "resource_id", "start", "end"];

/// One VALUES row keyed by column name.
struct Row<'a> {
    table: &'static str,
    values: BTreeMap<String, &'a Expr>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        allowed: &[&str],
        columns: &[String],
        exprs: &'a [Expr],
    ) -> Result<Self, SqlError> {
        // Without a column list, values are positional in declaration order.
        let columns: Vec<String> = if columns.is_empty() {
            if exprs.len() > allowed.len() {
                return Err(SqlError::WrongArity(table, allowed.len(), exprs.len()));
            }
            allowed.iter().map(|c| c.to_string()).collect()
        } else {
            if columns.len() != exprs.len() {
                return Err(SqlError::WrongArity(table, columns.len(), exprs.len()));
            }
            columns.to_vec()
        };

        let mut values = BTreeMap::new();
        for (column, expr) in columns.into_iter().zip(exprs) {
            if !allowed.contains(&column.as_str()) {
                return Err(SqlError::UnknownColumn(table, column));
            }
            if values.insert(column.clone(), expr).is_some() {
                return Err(SqlError::Parse(format!("column {column} given twice")));
            }
        }
        Ok(Self { table, values })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.values.get(column).copied()
    }

    fn has(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    /// True when nothing but the id is given.
    fn is_id_only(&self) -> bool {
        self.values.keys().all(|c| c == "id")
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(column_label).collect();
    let rows = extract_insert_rows(insert)?;
    if rows.len() > 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let upsert = insert.on.is_some();

    match table.as_str() {
        "resources" => {
            let row = Row::new("resources", RESOURCE_COLUMNS, &columns, &rows[0])?;
            let id = parse_ulid_expr(row.required("id")?)?;
            if upsert {
                return resource_update(id, &row);
            }
            let capacity = match row.get("capacity") {
                Some(expr) => parse_u32_or_null(expr)?,
                None => None,
            };
            Ok(Command::InsertResource {
                id,
                name: optional_text(row.get("name"))?,
                description: optional_text(row.get("description"))?,
                capacity,
                schedule: ScheduleInput {
                    timezone: optional_text(row.get("timezone"))?,
                    slots: match row.get("slots") {
                        Some(expr) => parse_slots_expr(expr)?,
                        None => Vec::new(),
                    },
                },
            })
        }
        "bookings" => {
            let row = Row::new("bookings", BOOKING_COLUMNS, &columns, &rows[0])?;
            let id = parse_ulid_expr(row.required("id")?)?;
            if upsert {
                return booking_update(id, &row);
            }
            let status = match row.get("status") {
                Some(expr) => parse_string_expr(expr)?,
                None => DEFAULT_BOOKING_STATUS.to_string(),
            };
            let metadata = match row.get("metadata") {
                Some(expr) => parse_metadata_expr(expr)?,
                None => Metadata::new(),
            };
            Ok(Command::InsertBooking {
                id,
                resource_id: parse_ulid_expr(row.required("resource_id")?)?,
                start: parse_i64_expr(row.required("start")?)?,
                end: parse_i64_expr(row.required("end")?)?,
                status,
                metadata,
            })
        }
        "unavailabilities" => {
            let row = Row::new("unavailabilities", UNAVAILABILITY_COLUMNS, &columns, &rows[0])?;
            let id = parse_ulid_expr(row.required("id")?)?;
            if upsert {
                return unavailability_update(id, &row);
            }
            Ok(Command::InsertUnavailability {
                id,
                resource_id: parse_ulid_expr(row.required("resource_id")?)?,
                start: parse_i64_expr(row.required("start")?)?,
                end: parse_i64_expr(row.required("end")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn resource_update(id: Ulid, row: &Row<'_>) -> Result<Command, SqlError> {
    if row.is_id_only() {
        return Err(SqlError::Parse("nothing to update".into()));
    }
    let update = ResourceUpdate {
        name: row.get("name").map(|e| optional_text(Some(e))).transpose()?,
        description: row
            .get("description")
            .map(|e| optional_text(Some(e)))
            .transpose()?,
        capacity: row.get("capacity").map(parse_u32_or_null).transpose()?,
        timezone: row.get("timezone").map(|e| optional_text(Some(e))).transpose()?,
        slots: row.get("slots").map(parse_slots_expr).transpose()?,
    };
    Ok(Command::UpdateResource { id, update })
}

fn booking_update(id: Ulid, row: &Row<'_>) -> Result<Command, SqlError> {
    if row.has("resource_id") {
        return Err(SqlError::Unsupported("moving a booking to another resource".into()));
    }
    if row.is_id_only() {
        return Err(SqlError::Parse("nothing to update".into()));
    }
    let update = BookingUpdate {
        span: span_update(row)?,
        status: row.get("status").map(parse_string_expr).transpose()?,
        metadata: row.get("metadata").map(parse_metadata_expr).transpose()?,
    };
    Ok(Command::UpdateBooking { id, update })
}

fn unavailability_update(id: Ulid, row: &Row<'_>) -> Result<Command, SqlError> {
    if row.is_id_only() {
        return Err(SqlError::Parse("nothing to update".into()));
    }
    let update = UnavailabilityUpdate {
        resource_id: row.get("resource_id").map(parse_ulid_expr).transpose()?,
        span: span_update(row)?,
    };
    Ok(Command::UpdateUnavailability { id, update })
}

/// A new span needs both endpoints.
fn span_update(row: &Row<'_>) -> Result<Option<Span>, SqlError> {
    match (row.get("start"), row.get("end")) {
        (Some(start), Some(end)) => Ok(Some(Span::new(
            parse_i64_expr(start)?,
            parse_i64_expr(end)?,
        ))),
        (None, None) => Ok(None),
        (Some(_), None) => Err(SqlError::MissingColumn(row.table, "end")),
        (None, Some(_)) => Err(SqlError::MissingColumn(row.table, "start")),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "resources" => Ok(Command::DeleteResource { id }),
        "bookings" => Ok(Command::DeleteBooking { id }),
        "unavailabilities" => Ok(Command::DeleteUnavailability { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

/// Conjunctive `column op value` predicates from a WHERE clause.
#[derive(Default)]
struct Filters<'a> {
    eq: BTreeMap<String, &'a Expr>,
    gte: BTreeMap<String, &'a Expr>,
    lte: BTreeMap<String, &'a Expr>,
}

impl<'a> Filters<'a> {
    fn collect(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut filters = Self::default();
        if let Some(expr) = selection {
            filters.walk(expr)?;
        }
        Ok(filters)
    }

    fn walk(&mut self, expr: &'a Expr) -> Result<(), SqlError> {
        match expr {
            Expr::Nested(inner) => self.walk(inner),
            Expr::BinaryOp { left, op, right } => {
                let target = match op {
                    ast::BinaryOperator::And => {
                        self.walk(left)?;
                        return self.walk(right);
                    }
                    ast::BinaryOperator::Eq => &mut self.eq,
                    ast::BinaryOperator::GtEq => &mut self.gte,
                    ast::BinaryOperator::LtEq => &mut self.lte,
                    other => return Err(SqlError::Unsupported(format!("operator {other}"))),
                };
                let column = expr_column_name(left)
                    .ok_or_else(|| SqlError::Parse(format!("expected column, got {left}")))?;
                if target.insert(column.clone(), &**right).is_some() {
                    return Err(SqlError::Parse(format!("duplicate filter on {column}")));
                }
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
        }
    }

    fn take_eq(&mut self, column: &str) -> Option<&'a Expr> {
        self.eq.remove(column)
    }

    fn take_gte(&mut self, column: &str) -> Option<&'a Expr> {
        self.gte.remove(column)
    }

    fn take_lte(&mut self, column: &str) -> Option<&'a Expr> {
        self.lte.remove(column)
    }

    fn page(&mut self) -> Result<Page, SqlError> {
        let offset = self
            .take_eq("offset")
            .map(parse_usize_expr)
            .transpose()?
            .unwrap_or(0);
        let limit = self.take_eq("limit").map(parse_usize_expr).transpose()?;
        Ok(Page { offset, limit })
    }

    /// Anything not consumed is a filter this table does not support.
    fn finish(self) -> Result<(), SqlError> {
        let leftover = self
            .eq
            .keys()
            .chain(self.gte.keys())
            .chain(self.lte.keys())
            .next();
        match leftover {
            Some(column) => Err(SqlError::Unsupported(format!("filter on {column}"))),
            None => Ok(()),
        }
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
    let mut filters = Filters::collect(select.selection.as_ref())?;

    let command = match table.as_str() {
        "resources" => Command::SelectResources {
            filter: ResourceFilter {
                id: filters.take_eq("id").map(parse_ulid_expr).transpose()?,
                name: filters.take_eq("name").map(parse_string_expr).transpose()?,
                page: filters.page()?,
            },
        },
        "bookings" => Command::SelectBookings {
            filter: BookingFilter {
                id: filters.take_eq("id").map(parse_ulid_expr).transpose()?,
                resource_id: filters
                    .take_eq("resource_id")
                    .map(parse_ulid_expr)
                    .transpose()?,
                status: filters.take_eq("status").map(parse_string_expr).transpose()?,
                start_after: filters.take_gte("start").map(parse_i64_expr).transpose()?,
                end_before: filters.take_lte("end").map(parse_i64_expr).transpose()?,
                page: filters.page()?,
            },
        },
        "unavailabilities" => Command::SelectUnavailabilities {
            filter: UnavailabilityFilter {
                id: filters.take_eq("id").map(parse_ulid_expr).transpose()?,
                resource_id: filters
                    .take_eq("resource_id")
                    .map(parse_ulid_expr)
                    .transpose()?,
                start_after: filters.take_gte("start").map(parse_i64_expr).transpose()?,
                end_before: filters.take_lte("end").map(parse_i64_expr).transpose()?,
                page: filters.page()?,
            },
        },
        "availability" => Command::SelectAvailability {
            resource_id: parse_ulid_expr(
                filters
                    .take_eq("resource_id")
                    .ok_or(SqlError::MissingFilter("resource_id"))?,
            )?,
            start: parse_i64_expr(filters.take_gte("start").ok_or(SqlError::MissingFilter("start"))?)?,
            end: parse_i64_expr(filters.take_lte("end").ok_or(SqlError::MissingFilter("end"))?)?,
            min_duration: filters
                .take_eq("min_duration")
                .map(parse_i64_expr)
                .transpose()?,
        },
        _ => return Err(SqlError::UnknownTable(table)),
    };
    filters.finish()?;
    Ok(command)
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

/// Column name as written in an INSERT column list, without quotes or qualifier.
fn column_label(column: &impl std::fmt::Display) -> String {
    let text = column.to_string();
    let last = text.rsplit('.').next().unwrap_or(&text);
    last.trim_matches('"').to_lowercase()
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(&values.rows)
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid_expr(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
        _ => Err(SqlError::MissingFilter("id")),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
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
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("i64 overflow".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_usize_expr(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64_expr(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} must not be negative")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    let v = parse_i64_expr(expr)?;
    u32::try_from(v)
        .map(Some)
        .map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn optional_text(expr: Option<&Expr>) -> Result<Option<String>, SqlError> {
    match expr {
        Some(e) if is_null(e) => Ok(None),
        Some(e) => parse_string_expr(e).map(Some),
        None => Ok(None),
    }
}

/// Metadata is a JSON object of strings; NULL is empty.
fn parse_metadata_expr(expr: &Expr) -> Result<Metadata, SqlError> {
    if is_null(expr) {
        return Ok(Metadata::new());
    }
    let text = parse_string_expr(expr)?;
    serde_json::from_str(&text).map_err(|e| SqlError::Parse(format!("bad metadata: {e}")))
}

/// Slots are a JSON array of `{"day", "start", "end", "quantity"}`; NULL is none.
fn parse_slots_expr(expr: &Expr) -> Result<Vec<SlotInput>, SqlError> {
    if is_null(expr) {
        return Ok(Vec::new());
    }
    let text = parse_string_expr(expr)?;
    serde_json::from_str(&text).map_err(|e| SqlError::Parse(format!("bad slots: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
