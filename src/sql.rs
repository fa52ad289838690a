use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SelectItem, SetExpr, Statement,
    TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::keywords::Keyword;
use sqlparser::parser::{Parser, ParserError};
use sqlparser::tokenizer::Token;
use ulid::Ulid;

use crate::model::Money;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertLot {
        id: Ulid,
        name: String,
        address: String,
        postal_code: String,
        price: Money,
        capacity: i64,
    },
    ResizeLot {
        id: Ulid,
        capacity: i64,
    },
    DeleteLot {
        id: Ulid,
    },
    /// Allocate a spot in `lot_id` for the session user.
    InsertReservation {
        lot_id: Ulid,
        returning: bool,
    },
    /// Release and settle a reservation owned by the session user.
    ReleaseReservation {
        id: Ulid,
        returning: bool,
    },
    SelectLots {
        id: Option<Ulid>,
    },
    SelectSpots {
        lot_id: Ulid,
    },
    SelectReservations,
    SelectHistory,
}

const LOT_COLUMNS: &[&str] = &["id", "name", "address", "postal_code", "price", "capacity"];
const RESERVATION_COLUMNS: &[&str] = &["lot_id"];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() || trimmed.trim_matches(';').trim().is_empty() {
        return Err(SqlError::Empty);
    }

    let dialect = PostgreSqlDialect {};
    if leading_keyword(&dialect, trimmed)? == Keyword::UPDATE {
        return parse_update(trimmed);
    }

    let stmts = Parser::parse_sql(&dialect, sql)?;
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

/// First keyword of the statement, skipping whitespace and comments.
fn leading_keyword(dialect: &PostgreSqlDialect, sql: &str) -> Result<Keyword, SqlError> {
    let parser = Parser::new(dialect).try_with_sql(sql)?;
    Ok(match parser.peek_token().token {
        Token::Word(word) => word.keyword,
        _ => Keyword::NoKeyword,
    })
}

/// `RETURNING *` is the only projection offered, and only where rows come back.
fn returning_all(returning: Option<&Vec<SelectItem>>, table: &str) -> Result<bool, SqlError> {
    match returning.map(Vec::as_slice) {
        None => Ok(false),
        Some([SelectItem::Wildcard(_)]) if table == "reservations" => Ok(true),
        Some([SelectItem::Wildcard(_)]) => {
            Err(SqlError::Unsupported(format!("RETURNING on {table}")))
        }
        Some(_) => Err(SqlError::Unsupported(
            "RETURNING with a column list; use RETURNING *".into(),
        )),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let returning = returning_all(insert.returning.as_ref(), &table)?;

    match table.as_str() {
        "lots" => {
            let row = InsertRow::new(insert, "lots", LOT_COLUMNS)?;
            Ok(Command::InsertLot {
                id: parse_ulid_expr(row.required("id")?)?,
                name: parse_string_expr(row.required("name")?)?,
                address: row
                    .optional("address")
                    .map(parse_string_expr)
                    .transpose()?
                    .unwrap_or_default(),
                postal_code: row
                    .optional("postal_code")
                    .map(parse_string_expr)
                    .transpose()?
                    .unwrap_or_default(),
                price: parse_money_expr(row.required("price")?)?,
                capacity: parse_i64_expr(row.required("capacity")?)?,
            })
        }
        "reservations" => {
            let row = InsertRow::new(insert, "reservations", RESERVATION_COLUMNS)?;
            Ok(Command::InsertReservation {
                lot_id: parse_ulid_expr(row.required("lot_id")?)?,
                returning,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_ulid(delete.selection.as_ref(), "id")?;

    match table.as_str() {
        "lots" => {
            returning_all(delete.returning.as_ref(), &table)?;
            Ok(Command::DeleteLot { id })
        }
        "reservations" => Ok(Command::ReleaseReservation {
            id,
            returning: returning_all(delete.returning.as_ref(), &table)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `UPDATE lots SET capacity = N WHERE id = '...'`, read straight off the token stream.
fn parse_update(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut parser = Parser::new(&dialect).try_with_sql(sql)?;
    parser.expect_keyword_is(Keyword::UPDATE)?;
    let table = object_name_last(&parser.parse_object_name(false)?)
        .ok_or_else(|| SqlError::Parse("empty table name".into()))?;
    if table != "lots" {
        return Err(SqlError::UnknownTable(table));
    }

    parser.expect_keyword_is(Keyword::SET)?;
    let assignments = parser.parse_comma_separated(Parser::parse_assignment)?;
    let selection = if parser.parse_keyword(Keyword::WHERE) {
        Some(parser.parse_expr()?)
    } else {
        None
    };
    while parser.consume_token(&Token::SemiColon) {}
    let trailing = parser.peek_token().token;
    if trailing != Token::EOF {
        return Err(SqlError::Parse(format!("unexpected {trailing}")));
    }

    let mut capacity = None;
    for assignment in &assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        };
        match column.as_deref() {
            Some("capacity") => capacity = Some(parse_i64_expr(&assignment.value)?),
            Some(other) => return Err(SqlError::Unsupported(format!("UPDATE of column {other}"))),
            None => return Err(SqlError::Unsupported("tuple assignment".into())),
        }
    }

    Ok(Command::ResizeLot {
        id: extract_where_ulid(selection.as_ref(), "id")?,
        capacity: capacity.ok_or(SqlError::MissingFilter("capacity"))?,
    })
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
    let selection = select.selection.as_ref();

    match table.as_str() {
        "lots" => Ok(Command::SelectLots {
            id: selection
                .map(|s| extract_where_ulid(Some(s), "id"))
                .transpose()?,
        }),
        "spots" => Ok(Command::SelectSpots {
            lot_id: extract_where_ulid(selection, "lot_id")?,
        }),
        "reservations" => Ok(Command::SelectReservations),
        "history" => Ok(Command::SelectHistory),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── Helpers ───────────────────────────────────────────────────

/// The first VALUES row of an INSERT, addressable by column name.
/// Without an explicit column list, values bind to `defaults` positionally.
struct InsertRow<'a> {
    table: &'static str,
    fields: Vec<(String, &'a Expr)>,
}

impl<'a> InsertRow<'a> {
    fn new(
        insert: &'a ast::Insert,
        table: &'static str,
        defaults: &'static [&'static str],
    ) -> Result<Self, SqlError> {
        let values = extract_insert_values(insert)?;
        let columns: Vec<String> = if insert.columns.is_empty() {
            defaults.iter().map(|c| c.to_string()).collect()
        } else {
            insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
        };
        if values.len() > columns.len() || (!insert.columns.is_empty() && values.len() != columns.len()) {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        if let Some(unknown) = columns.iter().find(|c| !defaults.contains(&c.as_str())) {
            return Err(SqlError::Parse(format!("unknown column: {unknown}")));
        }
        Ok(Self {
            table,
            fields: columns.into_iter().zip(values.iter()).collect(),
        })
    }

    fn optional(&self, column: &str) -> Option<&'a Expr> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, expr)| *expr)
    }

    fn required(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.optional(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Pull `column = '<ulid>'` out of a WHERE clause, looking through ANDs.
fn extract_where_ulid(selection: Option<&Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    fn find<'e>(expr: &'e Expr, column: &str) -> Option<&'e Expr> {
        match expr {
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::And,
                right,
            } => find(left, column).or_else(|| find(right, column)),
            Expr::BinaryOp {
                left,
                op: ast::BinaryOperator::Eq,
                right,
            } if expr_column_name(left).as_deref() == Some(column) => Some(right),
            Expr::Nested(inner) => find(inner, column),
            _ => None,
        }
    }

    let sel = selection.ok_or(SqlError::MissingFilter(column))?;
    let value = find(sel, column).ok_or(SqlError::MissingFilter(column))?;
    parse_ulid_expr(value)
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
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Null) => Ok(String::new()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse("integer out of range".into()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

/// Prices arrive as `20.00` or `'20.00'`; both parse to exact cents.
fn parse_money_expr(expr: &Expr) -> Result<Money, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad price {s}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected price, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        let price = parse_money_expr(expr)?;
        Ok(Money::from_cents(-price.cents()))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
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
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
}

impl From<ParserError> for SqlError {
    fn from(e: ParserError) -> Self {
        SqlError::Parse(e.to_string())
    }
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
            SqlError::MissingColumn(t, col) => write!(f, "{t}: missing column {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
