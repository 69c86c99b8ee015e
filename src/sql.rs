use std::path::PathBuf;

use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::NewRate;

/// Which records a `SELECT ... FROM rates` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateFilter {
    All,
    Id(Ulid),
    Unit(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertRate {
        rate: NewRate,
    },
    BatchInsertRates {
        rates: Vec<NewRate>,
    },
    UpdateRate {
        id: Ulid,
        rate: NewRate,
    },
    CloseRate {
        id: Ulid,
        book_to: NaiveDate,
    },
    DeleteRate {
        id: Ulid,
    },
    SelectRates {
        filter: RateFilter,
    },
    SelectQuote {
        unit_id: Ulid,
        arrival: NaiveDate,
        departure: NaiveDate,
        booking_date: NaiveDate,
    },
    ExportRates {
        path: PathBuf,
    },
    ImportRates {
        path: PathBuf,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(prefix) = trimmed.get(..5)
        && prefix.eq_ignore_ascii_case("COPY ")
    {
        return parse_copy(&trimmed[5..]);
    }

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

/// `COPY rates TO '<path>'` / `COPY rates FROM '<path>'`. Paths are read and
/// written on the server side.
fn parse_copy(rest: &str) -> Result<Command, SqlError> {
    let rest = rest.trim().trim_end_matches(';').trim_end();
    let (table, rest) = rest
        .split_once(char::is_whitespace)
        .ok_or_else(|| SqlError::Parse("COPY without direction".into()))?;
    let table = table.to_lowercase();
    if table != "rates" {
        return Err(SqlError::UnknownTable(table));
    }
    let (direction, target) = rest
        .trim_start()
        .split_once(char::is_whitespace)
        .ok_or_else(|| SqlError::Parse("COPY without path".into()))?;
    let path = target
        .trim()
        .strip_prefix('\'')
        .and_then(|p| p.strip_suffix('\''))
        .ok_or_else(|| SqlError::Parse("COPY path must be a quoted string".into()))?
        .replace("''", "'");
    if path.is_empty() {
        return Err(SqlError::Parse("empty COPY path".into()));
    }

    match direction.to_uppercase().as_str() {
        "TO" => Ok(Command::ExportRates { path: path.into() }),
        "FROM" => Ok(Command::ImportRates { path: path.into() }),
        other => Err(SqlError::Unsupported(format!("COPY ... {other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "rates" => {
            let all_rows = extract_all_insert_rows(insert)?;
            if all_rows.len() == 1 {
                return Ok(Command::InsertRate { rate: parse_new_rate(&all_rows[0])? });
            }
            let mut rates = Vec::with_capacity(all_rows.len());
            for (i, row) in all_rows.iter().enumerate() {
                rates.push(parse_new_rate(row).map_err(|e| SqlError::Parse(format!("row {i}: {e}")))?);
            }
            Ok(Command::BatchInsertRates { rates })
        }
        "rate_updates" => {
            let values = extract_insert_values(insert)?;
            if values.len() < 6 {
                return Err(SqlError::WrongArity("rate_updates", 6, values.len()));
            }
            Ok(Command::UpdateRate {
                id: parse_ulid(&values[0])?,
                rate: parse_new_rate(&values[1..])?,
            })
        }
        "rate_closures" => {
            let values = extract_insert_values(insert)?;
            if values.len() < 2 {
                return Err(SqlError::WrongArity("rate_closures", 2, values.len()));
            }
            Ok(Command::CloseRate {
                id: parse_ulid(&values[0])?,
                book_to: parse_date(&values[1])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(unit_id, stay_from, stay_to, nights, value[, book_from[, book_to]])`
fn parse_new_rate(values: &[Expr]) -> Result<NewRate, SqlError> {
    if values.len() < 5 {
        return Err(SqlError::WrongArity("rates", 5, values.len()));
    }
    Ok(NewRate {
        unit_id: parse_ulid(&values[0])?,
        stay_from: parse_date(&values[1])?,
        stay_to: parse_date(&values[2])?,
        nights: parse_u32(&values[3])?,
        value: parse_f64(&values[4])?,
        book_from: match values.get(5) {
            Some(expr) => parse_date_or_null(expr)?,
            None => None,
        },
        book_to: match values.get(6) {
            Some(expr) => parse_date_or_null(expr)?,
            None => None,
        },
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "rates" => Ok(Command::DeleteRate { id }),
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "rates" => {
            let filter = if let Some(expr) = find_filter(&filters, "id") {
                RateFilter::Id(parse_ulid(expr)?)
            } else if let Some(expr) = find_filter(&filters, "unit_id") {
                RateFilter::Unit(parse_ulid(expr)?)
            } else if let Some((col, _)) = filters.first() {
                return Err(SqlError::Unsupported(format!("filter on {col}")));
            } else {
                RateFilter::All
            };
            Ok(Command::SelectRates { filter })
        }
        "quote" => {
            let required = |col: &'static str| find_filter(&filters, col).ok_or(SqlError::MissingFilter(col));
            Ok(Command::SelectQuote {
                unit_id: parse_ulid(required("unit_id")?)?,
                arrival: parse_date(required("arrival")?)?,
                departure: parse_date(required("departure")?)?,
                booking_date: parse_date(required("booking_date")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)?;
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let col = expr_column_name(left).ok_or_else(|| SqlError::Unsupported(format!("filter {expr}")))?;
            out.push((col, right.as_ref()));
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out)?,
        other => return Err(SqlError::Unsupported(format!("filter {other}"))),
    }
    Ok(())
}

fn find_filter<'a>(filters: &[(String, &'a Expr)], col: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
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
    let mut rows = extract_all_insert_rows(insert)?;
    if rows.len() > 1 {
        return Err(SqlError::Unsupported("multi-row VALUES".into()));
    }
    Ok(rows.swap_remove(0))
}

fn extract_all_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
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
                parse_ulid(right)
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// ISO calendar date, `'YYYY-MM-DD'`.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected date string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_date_or_null(expr: &Expr) -> Result<Option<NaiveDate>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => Ok(Some(parse_date(expr)?)),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => {
                let v: f64 = s
                    .parse()
                    .map_err(|e| SqlError::Parse(format!("bad number {s:?}: {e}")))?;
                if !v.is_finite() {
                    return Err(SqlError::Parse(format!("non-finite number {s:?}")));
                }
                Ok(v)
            }
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_f64(expr)?)
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
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
