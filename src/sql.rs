use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, OnConflictAction, OnInsert, SetExpr,
    Statement, TableFactor, TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Which bookings a `SELECT ... FROM bookings` wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    All,
    Id(Ulid),
    Subject {
        subject_id: Ulid,
        range: Option<(NaiveDate, NaiveDate)>,
    },
    Between(NaiveDate, NaiveDate),
    Activity(Ulid),
}

/// Who an effort report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportScope {
    Subject(Ulid),
    Supervisor(Ulid),
    AllSmes,
}

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    InsertBooking {
        draft: BookingDraft,
    },
    /// Multi-row insert, made on behalf of the connected subject.
    BulkInsertBookings {
        drafts: Vec<BookingDraft>,
        skip_conflicts: bool,
    },
    UpdateBooking {
        id: Ulid,
        patch: BookingPatch,
    },
    DeleteBooking {
        id: Ulid,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    SelectConflict {
        subject_id: Ulid,
        window: Window,
    },
    SelectAvailability {
        query: AvailabilityQuery,
        only_available: bool,
    },
    SelectEffort {
        subject_id: Ulid,
        month: Option<MonthYear>,
    },
    SelectEffortTotals {
        subject_id: Ulid,
        month: MonthYear,
        category: Option<ActivityCategory>,
    },
    SelectEffortDistribution {
        subject_id: Ulid,
        month: MonthYear,
    },
    SelectActiveSubjects {
        month: MonthYear,
    },
    SelectEffortReport {
        month: MonthYear,
        scope: ReportScope,
    },
}

/// Row layout a statement produces; `None` means a bare command tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    None,
    Bookings,
    BulkOutcome,
    Conflict,
    Availability,
    Effort,
    EffortTotals,
    EffortDistribution,
    ActiveSubjects,
    EffortReport,
}

impl Command {
    pub fn shape(&self) -> ResultShape {
        match self {
            Command::InsertBooking { .. }
            | Command::UpdateBooking { .. }
            | Command::SelectBookings { .. } => ResultShape::Bookings,
            Command::BulkInsertBookings { .. } => ResultShape::BulkOutcome,
            Command::DeleteBooking { .. } => ResultShape::None,
            Command::SelectConflict { .. } => ResultShape::Conflict,
            Command::SelectAvailability { .. } => ResultShape::Availability,
            Command::SelectEffort { .. } => ResultShape::Effort,
            Command::SelectEffortTotals { .. } => ResultShape::EffortTotals,
            Command::SelectEffortDistribution { .. } => ResultShape::EffortDistribution,
            Command::SelectActiveSubjects { .. } => ResultShape::ActiveSubjects,
            Command::SelectEffortReport { .. } => ResultShape::EffortReport,
        }
    }
}

const BOOKING_COLUMNS: [&str; 8] = [
    "subject_id",
    "from_date",
    "to_date",
    "from_time",
    "to_time",
    "activity_id",
    "description",
    "activity_name",
];

fn parse_statements(sql: &str) -> Result<Statement, SqlError> {
    let dialect = PostgreSqlDialect {};
    let mut stmts =
        Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.swap_remove(0))
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    match parse_statements(sql)? {
        Statement::Insert(insert) => parse_insert(&insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(&table, &assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(&delete),
        Statement::Query(query) => parse_select(&query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Result layout of a statement that may still contain `$n` placeholders.
pub fn describe(sql: &str) -> ResultShape {
    let Ok(stmt) = parse_statements(sql) else {
        return ResultShape::None;
    };
    match stmt {
        Statement::Insert(insert) => {
            let rows = extract_insert_rows(&insert).map_or(1, |r| r.len());
            if rows > 1 || insert.on.is_some() {
                ResultShape::BulkOutcome
            } else {
                ResultShape::Bookings
            }
        }
        Statement::Update { .. } => ResultShape::Bookings,
        Statement::Query(query) => match select_parts(&query) {
            Ok((table, _)) => match table.as_str() {
                "bookings" => ResultShape::Bookings,
                "conflicts" => ResultShape::Conflict,
                "availability" => ResultShape::Availability,
                "effort" => ResultShape::Effort,
                "effort_totals" => ResultShape::EffortTotals,
                "effort_distribution" => ResultShape::EffortDistribution,
                "active_subjects" => ResultShape::ActiveSubjects,
                "effort_report" => ResultShape::EffortReport,
                _ => ResultShape::None,
            },
            Err(_) => ResultShape::None,
        },
        _ => ResultShape::None,
    }
}

// ── INSERT / UPDATE / DELETE ──────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let columns: Vec<String> = if insert.columns.is_empty() {
        BOOKING_COLUMNS.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if let Some(unknown) = columns.iter().find(|c| !BOOKING_COLUMNS.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn("bookings", unknown.clone()));
    }

    let skip_conflicts = match &insert.on {
        None => false,
        Some(OnInsert::OnConflict(on_conflict))
            if matches!(on_conflict.action, OnConflictAction::DoNothing) =>
        {
            true
        }
        Some(_) => {
            return Err(SqlError::Unsupported(
                "only ON CONFLICT DO NOTHING is supported".into(),
            ));
        }
    };

    let rows = extract_insert_rows(insert)?;
    let mut drafts = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let draft = parse_draft(&columns, row).map_err(|e| {
            if rows.len() > 1 {
                SqlError::Parse(format!("row {i}: {e}"))
            } else {
                e
            }
        })?;
        drafts.push(draft);
    }

    if drafts.len() == 1 && !skip_conflicts {
        Ok(Command::InsertBooking {
            draft: drafts.swap_remove(0),
        })
    } else {
        Ok(Command::BulkInsertBookings {
            drafts,
            skip_conflicts,
        })
    }
}

fn parse_draft(columns: &[String], row: &[Expr]) -> Result<BookingDraft, SqlError> {
    if row.len() != columns.len() {
        return Err(SqlError::WrongArity("bookings", columns.len(), row.len()));
    }
    let value = |name| column_value(columns, row, name);
    let activity_name = match columns.iter().position(|c| c == "activity_name") {
        Some(i) => parse_text_or_null(&row[i])?,
        None => None,
    };
    Ok(BookingDraft {
        subject_id: parse_ulid(value("subject_id")?)?,
        window: Window::new(
            parse_date(value("from_date")?)?,
            parse_date(value("to_date")?)?,
            parse_time(value("from_time")?)?,
            parse_time(value("to_time")?)?,
        ),
        activity_id: parse_ulid(value("activity_id")?)?,
        activity_name,
        description: parse_text(value("description")?)?.to_string(),
    })
}

fn column_value<'r>(
    columns: &[String],
    row: &'r [Expr],
    name: &'static str,
) -> Result<&'r Expr, SqlError> {
    columns
        .iter()
        .position(|c| c == name)
        .map(|i| &row[i])
        .ok_or(SqlError::MissingColumn(name))
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "bookings" {
        return Err(SqlError::UnknownTable(name));
    }

    let mut patch = BookingPatch::default();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(col) => object_name_last(col)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        let value = &assignment.value;
        match column.as_str() {
            "subject_id" => patch.subject_id = Some(parse_ulid(value)?),
            "from_date" => patch.from_date = Some(parse_date(value)?),
            "to_date" => patch.to_date = Some(parse_date(value)?),
            "from_time" => patch.from_time = Some(parse_time(value)?),
            "to_time" => patch.to_time = Some(parse_time(value)?),
            "activity_id" => patch.activity_id = Some(parse_ulid(value)?),
            "activity_name" => patch.activity_name = Some(parse_text(value)?.to_string()),
            "description" => patch.description = Some(parse_text(value)?.to_string()),
            _ => return Err(SqlError::UnknownColumn("bookings", column)),
        }
    }

    Ok(Command::UpdateBooking {
        id: extract_where_id(selection)?,
        patch,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    Ok(Command::DeleteBooking {
        id: extract_where_id(delete.selection.as_ref())?,
    })
}

// ── SELECT ────────────────────────────────────────────────────

fn select_parts(query: &ast::Query) -> Result<(String, Option<&Expr>), SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let first = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    Ok((table_factor_name(&first.relation)?, select.selection.as_ref()))
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let (table, selection) = select_parts(query)?;
    match table.as_str() {
        "bookings" => {
            let p = Predicates::collect(
                "bookings",
                selection,
                &["id", "subject_id", "activity_id", "from_date", "to_date"],
            )?;
            Ok(Command::SelectBookings {
                filter: booking_filter(&p)?,
            })
        }
        "conflicts" => {
            let p = Predicates::collect(
                "conflicts",
                selection,
                &["subject_id", "from_date", "to_date", "from_time", "to_time"],
            )?;
            Ok(Command::SelectConflict {
                subject_id: parse_ulid(p.required(Op::Eq, "subject_id")?)?,
                window: Window::new(
                    parse_date(p.required(Op::Eq, "from_date")?)?,
                    parse_date(p.required(Op::Eq, "to_date")?)?,
                    parse_time(p.required(Op::Eq, "from_time")?)?,
                    parse_time(p.required(Op::Eq, "to_time")?)?,
                ),
            })
        }
        "availability" => {
            let p = Predicates::collect(
                "availability",
                selection,
                &["date", "from_time", "to_time", "role", "subject_id", "available"],
            )?;
            let mut query = AvailabilityQuery::new(
                parse_date(p.required(Op::Eq, "date")?)?,
                parse_time(p.required(Op::Eq, "from_time")?)?,
                parse_time(p.required(Op::Eq, "to_time")?)?,
            );
            query.roles = p
                .list("role")
                .into_iter()
                .map(|e| parse_text(e).map(str::to_string))
                .collect::<Result<_, _>>()?;
            query.subject_ids = p
                .list("subject_id")
                .into_iter()
                .map(parse_ulid)
                .collect::<Result<_, _>>()?;
            let only_available = match p.get(Op::Eq, "available") {
                Some(e) => parse_bool(e)?,
                None => false,
            };
            Ok(Command::SelectAvailability {
                query,
                only_available,
            })
        }
        "effort" => {
            let p = Predicates::collect("effort", selection, &["subject_id", "month"])?;
            Ok(Command::SelectEffort {
                subject_id: parse_ulid(p.required(Op::Eq, "subject_id")?)?,
                month: p.get(Op::Eq, "month").map(parse_month).transpose()?,
            })
        }
        "effort_totals" => {
            let p = Predicates::collect(
                "effort_totals",
                selection,
                &["subject_id", "month", "category"],
            )?;
            Ok(Command::SelectEffortTotals {
                subject_id: parse_ulid(p.required(Op::Eq, "subject_id")?)?,
                month: parse_month(p.required(Op::Eq, "month")?)?,
                category: p.get(Op::Eq, "category").map(parse_category).transpose()?,
            })
        }
        "effort_distribution" => {
            let p = Predicates::collect("effort_distribution", selection, &["subject_id", "month"])?;
            Ok(Command::SelectEffortDistribution {
                subject_id: parse_ulid(p.required(Op::Eq, "subject_id")?)?,
                month: parse_month(p.required(Op::Eq, "month")?)?,
            })
        }
        "active_subjects" => {
            let p = Predicates::collect("active_subjects", selection, &["month"])?;
            Ok(Command::SelectActiveSubjects {
                month: parse_month(p.required(Op::Eq, "month")?)?,
            })
        }
        "effort_report" => {
            let p = Predicates::collect(
                "effort_report",
                selection,
                &["month", "subject_id", "supervisor_id"],
            )?;
            let subject = p.get(Op::Eq, "subject_id").map(parse_ulid).transpose()?;
            let supervisor = p.get(Op::Eq, "supervisor_id").map(parse_ulid).transpose()?;
            let scope = match (subject, supervisor) {
                (Some(_), Some(_)) => {
                    return Err(SqlError::Unsupported(
                        "effort_report takes subject_id or supervisor_id, not both".into(),
                    ));
                }
                (Some(id), None) => ReportScope::Subject(id),
                (None, Some(id)) => ReportScope::Supervisor(id),
                (None, None) => ReportScope::AllSmes,
            };
            Ok(Command::SelectEffortReport {
                month: parse_month(p.required(Op::Eq, "month")?)?,
                scope,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn booking_filter(p: &Predicates<'_>) -> Result<BookingFilter, SqlError> {
    if let Some(id) = p.get(Op::Eq, "id") {
        return Ok(BookingFilter::Id(parse_ulid(id)?));
    }
    if let Some(activity_id) = p.get(Op::Eq, "activity_id") {
        return Ok(BookingFilter::Activity(parse_ulid(activity_id)?));
    }
    let start = p.get(Op::GtEq, "from_date").map(parse_date).transpose()?;
    let end = p.get(Op::LtEq, "to_date").map(parse_date).transpose()?;
    let range = match (start, end) {
        (Some(s), Some(e)) => Some((s, e)),
        (None, None) => None,
        (None, Some(_)) => return Err(SqlError::MissingFilter("from_date")),
        (Some(_), None) => return Err(SqlError::MissingFilter("to_date")),
    };
    match (p.get(Op::Eq, "subject_id"), range) {
        (Some(subject), range) => Ok(BookingFilter::Subject {
            subject_id: parse_ulid(subject)?,
            range,
        }),
        (None, Some((s, e))) => Ok(BookingFilter::Between(s, e)),
        (None, None) => Ok(BookingFilter::All),
    }
}

// ── WHERE clause ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    GtEq,
    LtEq,
    In,
}

/// A conjunction of `column <op> value` terms.
struct Predicates<'a> {
    terms: Vec<(String, Op, Vec<&'a Expr>)>,
}

impl<'a> Predicates<'a> {
    fn collect(
        table: &'static str,
        selection: Option<&'a Expr>,
        allowed: &[&str],
    ) -> Result<Self, SqlError> {
        let mut terms = Vec::new();
        if let Some(expr) = selection {
            collect_terms(expr, &mut terms)?;
        }
        if let Some((col, _, _)) = terms.iter().find(|(c, _, _)| !allowed.contains(&c.as_str())) {
            return Err(SqlError::UnknownColumn(table, col.clone()));
        }
        Ok(Self { terms })
    }

    fn get(&self, op: Op, column: &str) -> Option<&'a Expr> {
        self.terms
            .iter()
            .rev()
            .find(|(c, o, _)| *o == op && c == column)
            .and_then(|(_, _, values)| values.first().copied())
    }

    fn required(&self, op: Op, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(op, column).ok_or(SqlError::MissingFilter(column))
    }

    /// Values from `column IN (...)` and `column = ...` terms.
    fn list(&self, column: &str) -> Vec<&'a Expr> {
        self.terms
            .iter()
            .filter(|(c, o, _)| c == column && matches!(o, Op::Eq | Op::In))
            .flat_map(|(_, _, values)| values.iter().copied())
            .collect()
    }
}

fn collect_terms<'a>(expr: &'a Expr, out: &mut Vec<(String, Op, Vec<&'a Expr>)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_terms(inner, out),
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                ast::BinaryOperator::And => {
                    collect_terms(left, out)?;
                    return collect_terms(right, out);
                }
                ast::BinaryOperator::Eq => Op::Eq,
                ast::BinaryOperator::GtEq => Op::GtEq,
                ast::BinaryOperator::LtEq => Op::LtEq,
                other => return Err(SqlError::Unsupported(format!("operator {other}"))),
            };
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push((column, op, vec![right.as_ref()]));
            Ok(())
        }
        Expr::InList {
            expr: inner,
            list,
            negated: false,
        } => {
            let column = expr_column_name(inner)
                .ok_or_else(|| SqlError::Unsupported(format!("predicate {expr}")))?;
            out.push((column, Op::In, list.iter().collect()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("predicate {other}"))),
    }
}

fn extract_where_id(selection: Option<&Expr>) -> Result<Ulid, SqlError> {
    match selection {
        Some(Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        }) if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
        _ => Err(SqlError::MissingFilter("id")),
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
    let tables = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let first = tables
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match source.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
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

fn parse_text(expr: &Expr) -> Result<&str, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_text(expr).map(|s| Some(s.to_string())),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_text(expr)?;
    Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_text(expr)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
}

/// `HH:MM` or `HH:MM:SS`.
fn parse_time(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_text(expr)?;
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| SqlError::Parse(format!("bad time {s:?}: {e}")))
}

fn parse_month(expr: &Expr) -> Result<MonthYear, SqlError> {
    parse_text(expr)?
        .parse()
        .map_err(|e: UnknownToken| SqlError::Parse(e.to_string()))
}

fn parse_category(expr: &Expr) -> Result<ActivityCategory, SqlError> {
    parse_text(expr)?
        .parse()
        .map_err(|e: UnknownToken| SqlError::Parse(e.to_string()))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
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
            SqlError::UnknownColumn(t, c) => write!(f, "unknown column {c} for {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}

#[cfg(test)]
mod tests {
    use super::*;

    const SUBJECT: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";
    const ACTIVITY: &str = "01BX5ZZKBKACTAV9WEVGEMMVS0";

    fn ulid(s: &str) -> Ulid {
        Ulid::from_string(s).unwrap()
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn t(s: &str) -> NaiveTime {
        NaiveTime::parse_from_str(s, "%H:%M").unwrap()
    }

    fn insert_row(from_time: &str, to_time: &str) -> String {
        format!(
            "('{SUBJECT}', '2025-07-15', '2025-07-15', '{from_time}', '{to_time}', '{ACTIVITY}', 'review')"
        )
    }

    const INSERT_HEAD: &str = "INSERT INTO bookings (subject_id, from_date, to_date, from_time, to_time, activity_id, description) VALUES ";

    #[test]
    fn parse_single_insert() {
        let sql = format!("{INSERT_HEAD}{}", insert_row("09:00", "10:30:00"));
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { draft } => {
                assert_eq!(draft.subject_id, ulid(SUBJECT));
                assert_eq!(draft.activity_id, ulid(ACTIVITY));
                assert_eq!(
                    draft.window,
                    Window::single_day(d("2025-07-15"), t("09:00"), t("10:30"))
                );
                assert_eq!(draft.description, "review");
                assert_eq!(draft.activity_name, None);
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_with_activity_name_and_reordered_columns() {
        let sql = format!(
            "INSERT INTO bookings (description, activity_name, activity_id, subject_id, from_date, to_date, from_time, to_time) \
             VALUES ('demo', 'Kickoff', '{ACTIVITY}', '{SUBJECT}', '2025-07-14', '2025-07-16', '22:00', '06:00')"
        );
        match parse_sql(&sql).unwrap() {
            Command::InsertBooking { draft } => {
                assert_eq!(draft.activity_name.as_deref(), Some("Kickoff"));
                assert_eq!(draft.window.from_date, d("2025-07-14"));
                assert_eq!(draft.window.to_time, t("06:00"));
            }
            cmd => panic!("expected InsertBooking, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_multi_row_insert_is_bulk() {
        let sql = format!(
            "{INSERT_HEAD}{}, {}",
            insert_row("09:00", "10:00"),
            insert_row("11:00", "12:00")
        );
        match parse_sql(&sql).unwrap() {
            Command::BulkInsertBookings {
                drafts,
                skip_conflicts,
            } => {
                assert_eq!(drafts.len(), 2);
                assert!(!skip_conflicts);
                assert_eq!(drafts[1].window.from_time, t("11:00"));
            }
            cmd => panic!("expected BulkInsertBookings, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_on_conflict_do_nothing_skips_conflicts() {
        let sql = format!("{INSERT_HEAD}{} ON CONFLICT DO NOTHING", insert_row("09:00", "10:00"));
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::BulkInsertBookings {
                skip_conflicts: true,
                ..
            }
        ));
        assert_eq!(describe(&sql), ResultShape::BulkOutcome);
    }

    #[test]
    fn insert_errors() {
        let missing = format!(
            "INSERT INTO bookings (subject_id, from_date) VALUES ('{SUBJECT}', '2025-07-15')"
        );
        assert!(matches!(parse_sql(&missing), Err(SqlError::MissingColumn(_))));

        let unknown = "INSERT INTO bookings (colour) VALUES ('red')";
        assert!(matches!(parse_sql(unknown), Err(SqlError::UnknownColumn(_, _))));

        let bad_date = format!("{INSERT_HEAD}('{SUBJECT}', '15/07/2025', '2025-07-15', '09:00', '10:00', '{ACTIVITY}', 'x')");
        assert!(matches!(parse_sql(&bad_date), Err(SqlError::Parse(_))));

        assert!(matches!(
            parse_sql("INSERT INTO rooms (id) VALUES ('x')"),
            Err(SqlError::UnknownTable(_))
        ));
    }

    #[test]
    fn parse_update() {
        let sql = format!(
            "UPDATE bookings SET to_time = '12:00', description = 'longer' WHERE id = '{SUBJECT}'"
        );
        match parse_sql(&sql).unwrap() {
            Command::UpdateBooking { id, patch } => {
                assert_eq!(id, ulid(SUBJECT));
                assert_eq!(patch.to_time, Some(t("12:00")));
                assert_eq!(patch.description.as_deref(), Some("longer"));
                assert_eq!(patch.from_date, None);
            }
            cmd => panic!("expected UpdateBooking, got {cmd:?}"),
        }
        assert!(matches!(
            parse_sql("UPDATE bookings SET description = 'x'"),
            Err(SqlError::MissingFilter("id"))
        ));
    }

    #[test]
    fn parse_delete() {
        let sql = format!("DELETE FROM bookings WHERE id = '{SUBJECT}'");
        assert_eq!(
            parse_sql(&sql).unwrap(),
            Command::DeleteBooking { id: ulid(SUBJECT) }
        );
    }

    #[test]
    fn parse_booking_listings() {
        let by_subject = format!(
            "SELECT * FROM bookings WHERE subject_id = '{SUBJECT}' AND from_date >= '2025-07-01' AND to_date <= '2025-07-31'"
        );
        assert_eq!(
            parse_sql(&by_subject).unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::Subject {
                    subject_id: ulid(SUBJECT),
                    range: Some((d("2025-07-01"), d("2025-07-31"))),
                }
            }
        );

        let between = "SELECT * FROM bookings WHERE from_date >= '2025-07-01' AND to_date <= '2025-07-31'";
        assert_eq!(
            parse_sql(between).unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::Between(d("2025-07-01"), d("2025-07-31"))
            }
        );

        let half_open = "SELECT * FROM bookings WHERE from_date >= '2025-07-01'";
        assert!(matches!(parse_sql(half_open), Err(SqlError::MissingFilter("to_date"))));

        assert_eq!(
            parse_sql("SELECT * FROM bookings").unwrap(),
            Command::SelectBookings {
                filter: BookingFilter::All
            }
        );
    }

    #[test]
    fn parse_conflict_probe() {
        let sql = format!(
            "SELECT * FROM conflicts WHERE subject_id = '{SUBJECT}' AND from_date = '2025-07-15' \
             AND to_date = '2025-07-15' AND from_time = '09:00' AND to_time = '10:00'"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectConflict { subject_id, window } => {
                assert_eq!(subject_id, ulid(SUBJECT));
                assert_eq!(window, Window::single_day(d("2025-07-15"), t("09:00"), t("10:00")));
            }
            cmd => panic!("expected SelectConflict, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_availability_filters() {
        let sql = format!(
            "SELECT * FROM availability WHERE date = '2025-07-15' AND from_time = '09:00' AND to_time = '10:00' \
             AND role IN ('SME', 'LEAD') AND subject_id IN ('{SUBJECT}') AND available = true"
        );
        match parse_sql(&sql).unwrap() {
            Command::SelectAvailability {
                query,
                only_available,
            } => {
                assert!(only_available);
                assert_eq!(query.date, d("2025-07-15"));
                assert_eq!(query.roles, vec!["SME".to_string(), "LEAD".to_string()]);
                assert_eq!(query.subject_ids, vec![ulid(SUBJECT)]);
            }
            cmd => panic!("expected SelectAvailability, got {cmd:?}"),
        }

        let missing = "SELECT * FROM availability WHERE date = '2025-07-15' AND from_time = '09:00'";
        assert!(matches!(parse_sql(missing), Err(SqlError::MissingFilter("to_time"))));

        let stray = "SELECT * FROM availability WHERE floor = 3";
        assert!(matches!(parse_sql(stray), Err(SqlError::UnknownColumn(_, _))));
    }

    #[test]
    fn parse_effort_reads() {
        let rows = format!("SELECT * FROM effort WHERE subject_id = '{SUBJECT}'");
        assert_eq!(
            parse_sql(&rows).unwrap(),
            Command::SelectEffort {
                subject_id: ulid(SUBJECT),
                month: None
            }
        );

        let totals = format!(
            "SELECT * FROM effort_totals WHERE subject_id = '{SUBJECT}' AND month = '2025-07' AND category = 'Byte Sized'"
        );
        assert_eq!(
            parse_sql(&totals).unwrap(),
            Command::SelectEffortTotals {
                subject_id: ulid(SUBJECT),
                month: "2025-07".parse().unwrap(),
                category: Some(ActivityCategory::ByteSized),
            }
        );

        let bad_month = "SELECT * FROM active_subjects WHERE month = '2025-13'";
        assert!(matches!(parse_sql(bad_month), Err(SqlError::Parse(_))));

        let report = format!(
            "SELECT * FROM effort_report WHERE month = '2025-07' AND supervisor_id = '{SUBJECT}'"
        );
        assert_eq!(
            parse_sql(&report).unwrap(),
            Command::SelectEffortReport {
                month: "2025-07".parse().unwrap(),
                scope: ReportScope::Supervisor(ulid(SUBJECT)),
            }
        );
        let everyone = "SELECT * FROM effort_report WHERE month = '2025-07'";
        assert!(matches!(
            parse_sql(everyone).unwrap(),
            Command::SelectEffortReport {
                scope: ReportScope::AllSmes,
                ..
            }
        ));
    }

    #[test]
    fn describe_handles_placeholders() {
        assert_eq!(
            describe("SELECT * FROM availability WHERE date = $1 AND from_time = $2 AND to_time = $3"),
            ResultShape::Availability
        );
        assert_eq!(describe("DELETE FROM bookings WHERE id = $1"), ResultShape::None);
        assert_eq!(describe("UPDATE bookings SET description = $1 WHERE id = $2"), ResultShape::Bookings);
        assert_eq!(describe("not sql"), ResultShape::None);
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
