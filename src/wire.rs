use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::SharedPasswordAuth;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, BookingFilter, Command, ReportScope, ResultShape, SqlError};

pub struct SlotLedgerHandler {
    engine: Arc<Engine>,
    query_parser: Arc<SlotLedgerQueryParser>,
}

impl SlotLedgerHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(SlotLedgerQueryParser),
        }
    }

    /// The login user, read as the id of the subject acting on this connection.
    fn caller<C: ClientInfo>(client: &C) -> PgWireResult<Ulid> {
        let user = client.metadata().get("user").cloned().unwrap_or_default();
        Ulid::from_string(&user).map_err(|_| {
            user_error(
                "28000",
                format!("login user {user:?} is not a subject id; bulk inserts act as the caller"),
            )
        })
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(client, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command<C: ClientInfo>(
        &self,
        client: &C,
        cmd: Command,
    ) -> PgWireResult<Response> {
        let engine = &self.engine;
        let shape = cmd.shape();
        match cmd {
            Command::InsertBooking { draft } => {
                let booking = engine.create_booking(draft).await.map_err(engine_err)?;
                booking_response(shape, vec![booking])
            }
            Command::BulkInsertBookings {
                drafts,
                skip_conflicts,
            } => {
                let caller = Self::caller(client)?;
                let result = engine
                    .bulk_create(caller, drafts, skip_conflicts)
                    .await
                    .map_err(engine_err)?;
                bulk_response(shape, result)
            }
            Command::UpdateBooking { id, patch } => {
                let booking = engine.update_booking(id, patch).await.map_err(engine_err)?;
                booking_response(shape, vec![booking])
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::All => engine.all_bookings().await,
                    BookingFilter::Id(id) => vec![engine.get_booking(id).await.map_err(engine_err)?],
                    BookingFilter::Subject {
                        subject_id,
                        range: None,
                    } => engine.bookings_for_subject(subject_id).await,
                    BookingFilter::Subject {
                        subject_id,
                        range: Some((start, end)),
                    } => {
                        engine
                            .bookings_for_subject_between(subject_id, start, end)
                            .await
                    }
                    BookingFilter::Between(start, end) => engine.bookings_between(start, end).await,
                    BookingFilter::Activity(activity_id) => {
                        engine.bookings_for_activity(activity_id).await
                    }
                };
                booking_response(shape, bookings)
            }
            Command::SelectConflict { subject_id, window } => {
                window.validate().map_err(|e| engine_err(e.into()))?;
                let conflicts = engine.conflicts_for(subject_id, &window).await;
                let ids: Vec<String> = conflicts.iter().map(|b| b.id.to_string()).collect();
                encode_rows(shape, vec![ids], |encoder, ids| {
                    encoder.encode_field(&!ids.is_empty())?;
                    encoder.encode_field(&ids.join(","))
                })
            }
            Command::SelectAvailability {
                query,
                only_available,
            } => {
                let found = if only_available {
                    engine.search_available(&query).await
                } else {
                    engine.search_availability(&query).await
                }
                .map_err(engine_err)?;
                encode_rows(shape, found, |encoder, s| {
                    let conflicts = serde_json::to_string(&s.conflicts)
                        .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                    encoder.encode_field(&s.subject_id.to_string())?;
                    encoder.encode_field(&s.name)?;
                    encoder.encode_field(&s.email)?;
                    encoder.encode_field(&s.role.to_string())?;
                    encoder.encode_field(&s.available)?;
                    encoder.encode_field(&conflicts)
                })
            }
            Command::SelectEffort { subject_id, month } => {
                let rows = engine.aggregates_for(subject_id, month).await;
                encode_rows(shape, rows, |encoder, row| {
                    encoder.encode_field(&row.subject_id.to_string())?;
                    encoder.encode_field(&row.activity_id.to_string())?;
                    encoder.encode_field(&row.month.to_string())?;
                    encoder.encode_field(&row.category.to_string())?;
                    encoder.encode_field(&row.total_hours)?;
                    encoder.encode_field(&(row.total_sessions as i64))?;
                    encoder.encode_field(&row.updated_at.to_rfc3339())
                })
            }
            Command::SelectEffortTotals {
                subject_id,
                month,
                category,
            } => {
                let hours = match category {
                    Some(c) => engine.total_hours_in_category(subject_id, month, c).await,
                    None => engine.total_hours(subject_id, month).await,
                };
                encode_rows(shape, vec![hours], |encoder, hours| {
                    encoder.encode_field(&subject_id.to_string())?;
                    encoder.encode_field(&month.to_string())?;
                    encoder.encode_field(&category.map(|c| c.to_string()))?;
                    encoder.encode_field(&hours)
                })
            }
            Command::SelectEffortDistribution { subject_id, month } => {
                let summaries = engine.category_distribution(subject_id, month).await;
                encode_rows(shape, summaries, |encoder, s| {
                    encoder.encode_field(&s.category.to_string())?;
                    encoder.encode_field(&s.category.display_name().to_string())?;
                    encoder.encode_field(&(s.activity_count as i64))?;
                    encoder.encode_field(&s.total_hours)?;
                    encoder.encode_field(&(s.total_sessions as i64))?;
                    encoder.encode_field(&s.average_hours_per_session())
                })
            }
            Command::SelectActiveSubjects { month } => {
                let ids = engine.active_subjects(month).await;
                encode_rows(shape, ids, |encoder, id| encoder.encode_field(&id.to_string()))
            }
            Command::SelectEffortReport { month, scope } => {
                let subjects = match scope {
                    ReportScope::Subject(id) => {
                        vec![engine.effort_details(id, month).await.map_err(engine_err)?]
                    }
                    ReportScope::Supervisor(id) => {
                        engine
                            .consolidated_effort_for_supervisor(id, month)
                            .await
                            .map_err(engine_err)?
                            .subjects
                    }
                    ReportScope::AllSmes => {
                        engine
                            .consolidated_effort(month)
                            .await
                            .map_err(engine_err)?
                            .subjects
                    }
                };
                encode_rows(shape, subjects, |encoder, details| {
                    let sessions: serde_json::Map<String, serde_json::Value> = details
                        .sessions_by_category
                        .iter()
                        .map(|(c, n)| (c.as_str().to_string(), (*n).into()))
                        .collect();
                    encoder.encode_field(&details.subject_id.to_string())?;
                    encoder.encode_field(&details.name)?;
                    encoder.encode_field(&details.email)?;
                    encoder.encode_field(&details.month.to_string())?;
                    encoder.encode_field(&details.total_hours)?;
                    encoder.encode_field(&(details.total_sessions as i64))?;
                    encoder.encode_field(&serde_json::Value::Object(sessions).to_string())
                })
            }
        }
    }
}

// ── Result encoding ──────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn schema_for(shape: ResultShape) -> Vec<FieldInfo> {
    match shape {
        ResultShape::None => vec![],
        ResultShape::Bookings => vec![
            field("id", Type::VARCHAR),
            field("subject_id", Type::VARCHAR),
            field("from_date", Type::VARCHAR),
            field("to_date", Type::VARCHAR),
            field("from_time", Type::VARCHAR),
            field("to_time", Type::VARCHAR),
            field("activity_id", Type::VARCHAR),
            field("activity_name", Type::VARCHAR),
            field("description", Type::VARCHAR),
            field("created_at", Type::VARCHAR),
            field("updated_at", Type::VARCHAR),
        ],
        ResultShape::BulkOutcome => vec![
            field("index", Type::INT8),
            field("status", Type::VARCHAR),
            field("booking_id", Type::VARCHAR),
            field("message", Type::VARCHAR),
            field("request", Type::VARCHAR),
        ],
        ResultShape::Conflict => vec![
            field("has_conflict", Type::BOOL),
            field("conflicting_ids", Type::VARCHAR),
        ],
        ResultShape::Availability => vec![
            field("subject_id", Type::VARCHAR),
            field("name", Type::VARCHAR),
            field("email", Type::VARCHAR),
            field("role", Type::VARCHAR),
            field("available", Type::BOOL),
            field("conflicts", Type::VARCHAR),
        ],
        ResultShape::Effort => vec![
            field("subject_id", Type::VARCHAR),
            field("activity_id", Type::VARCHAR),
            field("month", Type::VARCHAR),
            field("category", Type::VARCHAR),
            field("total_hours", Type::FLOAT8),
            field("total_sessions", Type::INT8),
            field("updated_at", Type::VARCHAR),
        ],
        ResultShape::EffortTotals => vec![
            field("subject_id", Type::VARCHAR),
            field("month", Type::VARCHAR),
            field("category", Type::VARCHAR),
            field("total_hours", Type::FLOAT8),
        ],
        ResultShape::EffortDistribution => vec![
            field("category", Type::VARCHAR),
            field("display_name", Type::VARCHAR),
            field("activity_count", Type::INT8),
            field("total_hours", Type::FLOAT8),
            field("total_sessions", Type::INT8),
            field("average_hours_per_session", Type::FLOAT8),
        ],
        ResultShape::ActiveSubjects => vec![field("subject_id", Type::VARCHAR)],
        ResultShape::EffortReport => vec![
            field("subject_id", Type::VARCHAR),
            field("name", Type::VARCHAR),
            field("email", Type::VARCHAR),
            field("month", Type::VARCHAR),
            field("total_hours", Type::FLOAT8),
            field("total_sessions", Type::INT8),
            field("sessions_by_category", Type::VARCHAR),
        ],
    }
}

fn encode_rows<T>(
    shape: ResultShape,
    items: Vec<T>,
    mut encode: impl FnMut(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> PgWireResult<Response> {
    let schema = Arc::new(schema_for(shape));
    let mut rows: Vec<PgWireResult<_>> = Vec::with_capacity(items.len());
    for item in items {
        let mut encoder = DataRowEncoder::new(schema.clone());
        encode(&mut encoder, item)?;
        rows.push(Ok(encoder.take_row()));
    }
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn booking_response(shape: ResultShape, bookings: Vec<Booking>) -> PgWireResult<Response> {
    encode_rows(shape, bookings, |encoder, b| {
        encoder.encode_field(&b.id.to_string())?;
        encoder.encode_field(&b.subject_id.to_string())?;
        encoder.encode_field(&b.window.from_date.to_string())?;
        encoder.encode_field(&b.window.to_date.to_string())?;
        encoder.encode_field(&b.window.from_time.format("%H:%M:%S").to_string())?;
        encoder.encode_field(&b.window.to_time.format("%H:%M:%S").to_string())?;
        encoder.encode_field(&b.activity_id.to_string())?;
        encoder.encode_field(&b.activity_name)?;
        encoder.encode_field(&b.description)?;
        encoder.encode_field(&b.created_at.to_rfc3339())?;
        encoder.encode_field(&b.updated_at.to_rfc3339())
    })
}

/// One row per requested item, in request order. Failed rows echo the
/// submitted booking as JSON.
fn bulk_response(shape: ResultShape, result: BulkResult) -> PgWireResult<Response> {
    let mut created = result.created.into_iter();
    let mut errors = result.errors.into_iter().peekable();
    let mut outcomes = Vec::with_capacity(result.total_requested);
    for index in 0..result.total_requested {
        match errors.next_if(|e| e.index == index) {
            Some(e) => {
                let request = serde_json::to_string(&e.request)
                    .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                outcomes.push((index, "failed", None, Some(e.message), Some(request)));
            }
            None => {
                let id = created.next().map(|b| b.id.to_string());
                outcomes.push((index, "created", id, None, None));
            }
        }
    }
    encode_rows(shape, outcomes, |encoder, (index, status, id, message, request)| {
        encoder.encode_field(&(index as i64))?;
        encoder.encode_field(&status.to_string())?;
        encoder.encode_field(&id)?;
        encoder.encode_field(&message)?;
        encoder.encode_field(&request)
    })
}

#[async_trait]
impl SimpleQueryHandler for SlotLedgerHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotLedgerQueryParser;

#[async_trait]
impl QueryParser for SlotLedgerQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(schema_for(sql::describe(stmt)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotLedgerHandler {
    type Statement = String;
    type QueryParser = SlotLedgerQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        self.run(client, &sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            schema_for(sql::describe(&target.statement)),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(schema_for(sql::describe(
            &target.statement.statement,
        ))))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text-format parameters as quoted literals, highest index first
/// so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotLedgerFactory {
    handler: Arc<SlotLedgerHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuth, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotLedgerFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(SlotLedgerHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPasswordAuth::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotLedgerFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(SlotLedgerFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for each engine failure class.
fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidRange => "22007",
        ErrorKind::InvalidInput => "22023",
        ErrorKind::Conflict => "23P01",
        ErrorKind::NotFound => "02000",
        ErrorKind::ValidationFailed => "23514",
        ErrorKind::Unavailable => "08006",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(e.kind()), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
