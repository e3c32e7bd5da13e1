use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat,
    FieldInfo, QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SharedPasswordAuthSource;
use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct BookdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<BookdQueryParser>,
}

impl BookdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(BookdQueryParser),
        }
    }

    /// The connection's database name selects the organization.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            tracing::warn!("organization {db} unavailable: {e}");
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("organization error: {e}"),
            )))
        })
    }

    /// Parse and execute one statement, recording query metrics.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        let started = Instant::now();
        let result = execute_command(&engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);

        result
    }
}

async fn execute_command(engine: &Engine, cmd: Command) -> PgWireResult<Response> {
    match cmd {
        Command::InsertResource {
            id,
            name,
            description,
            capacity,
            schedule,
        } => {
            engine
                .create_scheduled_resource(id, name, description, capacity, schedule)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::UpdateResource { id, update } => {
            engine.update_resource(id, update).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::DeleteResource { id } => {
            engine.delete_resource(id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::InsertBooking {
            id,
            resource_id,
            start,
            end,
            status,
            metadata,
        } => {
            engine
                .create_booking(id, resource_id, Span::new(start, end), status, metadata)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::UpdateBooking { id, update } => {
            engine.update_booking(id, update).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::DeleteBooking { id } => {
            engine.delete_booking(id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::InsertUnavailability {
            id,
            resource_id,
            start,
            end,
        } => {
            engine
                .create_unavailability(id, resource_id, Span::new(start, end))
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::UpdateUnavailability { id, update } => {
            engine
                .update_unavailability(id, update)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::DeleteUnavailability { id } => {
            engine.delete_unavailability(id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::SelectResources { filter } => {
            let (resources, total) = engine.list_resources(filter).await.map_err(engine_err)?;
            let schema = Arc::new(resources_schema());
            let total = total as i64;
            let rows: Vec<PgWireResult<_>> = resources
                .into_iter()
                .map(|r| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&r.id.to_string())?;
                    encoder.encode_field(&r.name)?;
                    encoder.encode_field(&r.capacity.map(i64::from))?;
                    encoder.encode_field(&r.description)?;
                    encoder.encode_field(&r.schedule.timezone_label())?;
                    let slots = serde_json::to_string(&r.schedule.slot_inputs())
                        .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                    encoder.encode_field(&slots)?;
                    encoder.encode_field(&total)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectBookings { filter } => {
            let (bookings, total) = engine.find_bookings(filter).await.map_err(engine_err)?;
            let schema = Arc::new(bookings_schema());
            let total = total as i64;
            let rows: Vec<PgWireResult<_>> = bookings
                .into_iter()
                .map(|b| {
                    let metadata = serde_json::to_string(&b.metadata)
                        .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&b.id.to_string())?;
                    encoder.encode_field(&b.resource_id.to_string())?;
                    encoder.encode_field(&b.start)?;
                    encoder.encode_field(&b.end)?;
                    encoder.encode_field(&b.status)?;
                    encoder.encode_field(&metadata)?;
                    encoder.encode_field(&total)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectUnavailabilities { filter } => {
            let (windows, total) = engine
                .find_unavailabilities(filter)
                .await
                .map_err(engine_err)?;
            let schema = Arc::new(unavailabilities_schema());
            let total = total as i64;
            let rows: Vec<PgWireResult<_>> = windows
                .into_iter()
                .map(|u| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&u.id.to_string())?;
                    encoder.encode_field(&u.resource_id.to_string())?;
                    encoder.encode_field(&u.start)?;
                    encoder.encode_field(&u.end)?;
                    encoder.encode_field(&total)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectAvailability {
            resource_id,
            start,
            end,
            min_duration,
        } => {
            let slots = engine
                .compute_availability(resource_id, start, end, min_duration)
                .await
                .map_err(engine_err)?;

            let schema = Arc::new(availability_schema());

            let rid_str = resource_id.to_string();
            let rows: Vec<PgWireResult<_>> = slots
                .into_iter()
                .map(|slot| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&rid_str)?;
                    encoder.encode_field(&slot.start)?;
                    encoder.encode_field(&slot.end)?;
                    Ok(encoder.take_row())
                })
                .collect();

            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

/// List results carry the number of matches before pagination in `total`.
fn resources_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        int_field("capacity"),
        text_field("description"),
        text_field("timezone"),
        text_field("slots"),
        int_field("total"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("resource_id"),
        int_field("start"),
        int_field("end"),
        text_field("status"),
        text_field("metadata"),
        int_field("total"),
    ]
}

fn unavailabilities_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("resource_id"),
        int_field("start"),
        int_field("end"),
        int_field("total"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text_field("resource_id"), int_field("start"), int_field("end")]
}

/// Row description for a statement that may still hold `$N` placeholders.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let mut tokens = upper.split_whitespace();
    if tokens.next() != Some("SELECT") {
        return vec![];
    }
    let table = tokens
        .skip_while(|t| *t != "FROM")
        .nth(1)
        .map(|t| t.trim_matches(|c| c == '"' || c == ';').to_string());
    match table.as_deref() {
        Some("RESOURCES") => resources_schema(),
        Some("BOOKINGS") => bookings_schema(),
        Some("UNAVAILABILITIES") => unavailabilities_schema(),
        Some("AVAILABILITY") => availability_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for BookdHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
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
pub struct BookdQueryParser;

#[async_trait]
impl QueryParser for BookdQueryParser {
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
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for BookdHandler {
    type Statement = String;
    type QueryParser = BookdQueryParser;

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
            result_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => quote_literal(&String::from_utf8_lossy(bytes)),
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

// ── Factory ──────────────────────────────────────────────────────

pub struct BookdFactory {
    handler: Arc<BookdHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl BookdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SharedPasswordAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(BookdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for BookdFactory {
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
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = BookdFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::ResourceNotFound(_)
        | EngineError::BookingNotFound(_)
        | EngineError::UnavailabilityNotFound(_) => "P0002",
        EngineError::BookingConflict { .. } | EngineError::UnavailabilityConflict { .. } => {
            "23P01"
        }
        EngineError::AlreadyExists(_) => "23505",
        EngineError::HasDependents(_) => "23503",
        EngineError::InvalidInput(_) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Cancelled | EngineError::TimedOut => "57014",
        EngineError::WalError(_) | EngineError::Internal(_) => "XX000",
    }
}

/// Storage failures are logged here and reach the client without detail.
fn engine_err(e: EngineError) -> PgWireError {
    let message = if e.kind() == ErrorKind::Internal {
        tracing::error!("internal error: {e}");
        "internal error".to_string()
    } else {
        e.to_string()
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        message,
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) => "42703",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}
