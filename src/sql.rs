use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, LimitClause, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertItem {
        item: NewItem,
    },
    UpdateItem {
        id: Ulid,
        patch: ItemPatch,
    },
    DeleteItem {
        id: Ulid,
    },
    SelectItems {
        window: Window,
        skip: usize,
        limit: Option<usize>,
    },
    SelectItem {
        id: Ulid,
    },
    SelectAvailability {
        item_id: Ulid,
        window: Window,
    },
    InsertRental {
        id: Ulid,
        item_id: Ulid,
        range: DateRange,
        quantity: u32,
    },
    EndRental {
        id: Ulid,
    },
    ConfirmRental {
        id: Ulid,
    },
    SelectRental {
        id: Ulid,
    },
    SelectActiveRentals,
}

/// Column order assumed when an INSERT omits its column list.
const ITEM_COLUMNS: [&str; 7] = [
    "id",
    "name",
    "price_per_day",
    "total_stock",
    "available_stock",
    "description",
    "is_active",
];
const RENTAL_COLUMNS: [&str; 5] = ["id", "item_id", "start_date", "end_date", "quantity"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "items" => {
            let row = InsertRow::new(insert, &values, &ITEM_COLUMNS)?;
            let item = NewItem {
                id: parse_ulid(row.required("id")?)?,
                name: parse_string(row.required("name")?)?,
                price_per_day: parse_i64(row.required("price_per_day")?)?,
                total_stock: parse_u32(row.required("total_stock")?)?,
                available_stock: row.get("available_stock").map(parse_u32_or_null).transpose()?.flatten(),
                description: row.get("description").map(parse_string_or_null).transpose()?.flatten(),
                is_active: row.get("is_active").map(parse_bool).transpose()?.unwrap_or(true),
            };
            Ok(Command::InsertItem { item })
        }
        "rentals" => {
            let row = InsertRow::new(insert, &values, &RENTAL_COLUMNS)?;
            Ok(Command::InsertRental {
                id: parse_ulid(row.required("id")?)?,
                item_id: parse_ulid(row.required("item_id")?)?,
                range: DateRange::new(
                    parse_date(row.required("start_date")?)?,
                    parse_date(row.required("end_date")?)?,
                ),
                quantity: parse_u32(row.required("quantity")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// INSERT values keyed by column name, from the explicit column list or
/// the table's default order.
struct InsertRow<'a> {
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> InsertRow<'a> {
    fn new(insert: &ast::Insert, values: &'a [Expr], defaults: &[&str]) -> Result<Self, SqlError> {
        let names: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > names.len() || (!insert.columns.is_empty() && values.len() != names.len()) {
            return Err(SqlError::WrongArity("INSERT", names.len(), values.len()));
        }
        for name in &names {
            if !defaults.contains(&name.as_str()) {
                return Err(SqlError::UnknownColumn(name.clone()));
            }
        }
        Ok(Self {
            cells: names.into_iter().zip(values.iter()).collect(),
        })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(name, _)| name == column).map(|(_, expr)| *expr)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(column))
    }
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    match table.as_str() {
        "items" => {
            let mut patch = ItemPatch::default();
            for assignment in assignments {
                let column = assignment_column(&assignment.target)?;
                let value = &assignment.value;
                match column.as_str() {
                    "name" => patch.name = Some(parse_string(value)?),
                    "description" => patch.description = Some(parse_string_or_null(value)?),
                    "price_per_day" => patch.price_per_day = Some(parse_i64(value)?),
                    "total_stock" => patch.total_stock = Some(parse_u32(value)?),
                    "available_stock" => patch.available_stock = Some(parse_u32(value)?),
                    "is_active" => patch.is_active = Some(parse_bool(value)?),
                    _ => return Err(SqlError::UnknownColumn(column)),
                }
            }
            Ok(Command::UpdateItem { id, patch })
        }
        "rentals" => {
            // Each transition is a single flag flip.
            let [assignment] = assignments else {
                return Err(SqlError::Unsupported("rentals: one SET column at a time".into()));
            };
            let column = assignment_column(&assignment.target)?;
            let flag = parse_bool(&assignment.value)?;
            match (column.as_str(), flag) {
                ("is_active", false) => Ok(Command::EndRental { id }),
                ("owner_received", true) => Ok(Command::ConfirmRental { id }),
                ("is_active" | "owner_received", _) => Err(SqlError::Unsupported(format!(
                    "rentals: cannot set {column} = {flag}"
                ))),
                _ => Err(SqlError::UnknownColumn(column)),
            }
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "items" => Ok(Command::DeleteItem { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Filters gathered from a conjunction of `col = v`, `start >= d`, `"end" <= d`.
#[derive(Default)]
struct Filters {
    id: Option<Ulid>,
    item_id: Option<Ulid>,
    window: Window,
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

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    let paged = query.limit_clause.is_some();
    let windowed = filters.window != Window::UNBOUNDED;

    match table.as_str() {
        "items" => {
            reject(filters.item_id.is_some(), "items: item_id filter")?;
            if let Some(id) = filters.id {
                reject(windowed, "items: window on a single item")?;
                reject(paged, "items: LIMIT/OFFSET on a single item")?;
                return Ok(Command::SelectItem { id });
            }
            let (limit, skip) = extract_limit_offset(query)?;
            Ok(Command::SelectItems {
                window: filters.window,
                skip: skip.unwrap_or(0),
                limit,
            })
        }
        "availability" => {
            reject(filters.id.is_some(), "availability: id filter")?;
            reject(paged, "availability: LIMIT/OFFSET")?;
            Ok(Command::SelectAvailability {
                item_id: filters.item_id.ok_or(SqlError::MissingFilter("item_id"))?,
                window: filters.window,
            })
        }
        "rentals" => {
            reject(filters.item_id.is_some(), "rentals: item_id filter")?;
            reject(windowed, "rentals: start/end filter")?;
            reject(paged, "rentals: LIMIT/OFFSET")?;
            Ok(match filters.id {
                Some(id) => Command::SelectRental { id },
                None => Command::SelectActiveRentals,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// A filter or clause the table cannot honour is an error, never dropped.
fn reject(present: bool, what: &str) -> Result<(), SqlError> {
    if present {
        return Err(SqlError::Unsupported(what.into()));
    }
    Ok(())
}

fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters)?,
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_filters(left, filters)?;
                extract_filters(right, filters)?;
            }
            ast::BinaryOperator::Eq => match expr_column_name(left).as_deref() {
                Some("id") => filters.id = Some(parse_ulid(right)?),
                Some("item_id") => filters.item_id = Some(parse_ulid(right)?),
                _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
            },
            ast::BinaryOperator::GtEq if expr_column_name(left).as_deref() == Some("start") => {
                filters.window.start = Some(parse_date(right)?);
            }
            ast::BinaryOperator::LtEq if expr_column_name(left).as_deref() == Some("end") => {
                filters.window.end = Some(parse_date(right)?);
            }
            _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
        },
        _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
    }
    Ok(())
}

fn extract_limit_offset(query: &ast::Query) -> Result<(Option<usize>, Option<usize>), SqlError> {
    match &query.limit_clause {
        None => Ok((None, None)),
        Some(LimitClause::LimitOffset { limit, offset, .. }) => Ok((
            limit.as_ref().map(parse_usize).transpose()?,
            offset.as_ref().map(|o| parse_usize(&o.value)).transpose()?,
        )),
        Some(LimitClause::OffsetCommaLimit { offset, limit }) => {
            Ok((Some(parse_usize(limit)?), Some(parse_usize(offset)?)))
        }
    }
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

fn assignment_column(target: &AssignmentTarget) -> Result<String, SqlError> {
    match target {
        AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

/// `YYYY-MM-DD` string literal.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
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
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

fn parse_usize(expr: &Expr) -> Result<usize, SqlError> {
    let v = parse_i64(expr)?;
    usize::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
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
    UnknownColumn(String),
    MissingColumn(&'static str),
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
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
