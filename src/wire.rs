use std::fmt::Debug;
use std::io;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tracing::debug;

use crate::auth::SlotbookAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, RowShape, SqlError};
use crate::tenant::TenantManager;

/// Serve one client connection until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = SlotbookFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

pub struct SlotbookHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Parse, execute and record RED metrics for one statement.
    async fn run<C: ClientInfo>(
        &self,
        client: &C,
        query: &str,
        format: &Format,
    ) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(&engine, cmd, format).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        debug!(command = label, status, "query executed");
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        let schema = cmd.row_shape().map(|shape| Arc::new(schema(shape, format)));
        match cmd {
            Command::UpsertResource {
                id,
                name,
                capacity,
                description,
            } => {
                engine
                    .upsert_resource(id, name, description, capacity)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeactivateResource { id } => {
                engine.deactivate_resource(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SetSetting { key, value } => {
                engine.set_setting(&key, value).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectResources { id } => {
                let resources: Vec<Resource> = match id {
                    Some(id) => engine.resource(&id).into_iter().collect(),
                    None => engine.list_resources(),
                };
                let schema = shaped(schema)?;
                let rows = resources
                    .iter()
                    .map(|r| encode_resource(&schema, r))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::InsertBooking { request } => {
                let outcome = engine.create_booking(request).await.map_err(engine_err)?;
                let schema = shaped(schema)?;
                let rows = vec![encode_booking(&schema, &outcome.booking, Some(&outcome.message))];
                Ok(query_response(schema, rows))
            }
            Command::CancelBooking { id, user_id } => {
                let requester = user_id.map_or(Requester::Privileged, Requester::User);
                let outcome = engine
                    .cancel_booking(id, requester)
                    .await
                    .map_err(engine_err)?;
                let schema = shaped(schema)?;
                let mut rows = vec![encode_booking(&schema, &outcome.cancelled, Some("Booking cancelled"))];
                if let Some(promoted) = &outcome.promoted {
                    rows.push(encode_booking(&schema, promoted, Some("Promoted from waitlist")));
                }
                Ok(query_response(schema, rows))
            }
            Command::SelectBookingById { id } => {
                let booking = engine.booking(&id).await;
                bookings_response(shaped(schema)?, booking.iter())
            }
            Command::SelectUserBookings {
                user_id,
                include_past,
            } => {
                let bookings = engine.user_bookings(user_id, include_past).await;
                bookings_response(shaped(schema)?, bookings.iter())
            }
            Command::SelectSlotBookings { key } => {
                let bookings = engine.slot_bookings(&key).await;
                bookings_response(shaped(schema)?, bookings.iter())
            }
            Command::SelectSlotAvailability { key, user_id } => {
                let availability = engine
                    .slot_availability(&key, user_id)
                    .await
                    .map_err(engine_err)?;
                let schema = shaped(schema)?;
                let rows = vec![encode_availability(&schema, &availability)];
                Ok(query_response(schema, rows))
            }
            Command::SelectResourceSchedule {
                resource_id,
                from,
                to,
                user_id,
            } => {
                let schedule = engine
                    .resource_schedule(resource_id, from, to, user_id)
                    .await
                    .map_err(engine_err)?;
                let schema = shaped(schema)?;
                let rows = schedule
                    .iter()
                    .map(|cell| encode_availability(&schema, &cell.availability))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectBookingStats {
                resource_id,
                from,
                to,
            } => {
                let stats = engine.booking_stats(resource_id, from, to).await;
                let schema = shaped(schema)?;
                let rows = stats.iter().map(|s| encode_stats(&schema, s)).collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectSlotTimes => {
                let schema = shaped(schema)?;
                let rows: Vec<PgWireResult<DataRow>> = (1..=8u8)
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&i16::from(slot))?;
                        encoder.encode_field(&slot_label(slot))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectSettings => {
                let schema = shaped(schema)?;
                let rows: Vec<PgWireResult<DataRow>> = engine
                    .settings()
                    .into_iter()
                    .map(|(key, value)| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&key)?;
                        encoder.encode_field(&to_i32(value))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

const RESOURCE_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("name", Type::VARCHAR),
    ("description", Type::VARCHAR),
    ("capacity", Type::INT4),
    ("active", Type::BOOL),
];

const BOOKING_COLUMNS: &[(&str, Type)] = &[
    ("id", Type::VARCHAR),
    ("user_id", Type::VARCHAR),
    ("resource_id", Type::VARCHAR),
    ("date", Type::VARCHAR),
    ("slot", Type::INT2),
    ("slot_time", Type::VARCHAR),
    ("status", Type::VARCHAR),
    ("waitlist_position", Type::INT4),
    ("created_at", Type::INT8),
    ("message", Type::VARCHAR),
];

const AVAILABILITY_COLUMNS: &[(&str, Type)] = &[
    ("resource_id", Type::VARCHAR),
    ("date", Type::VARCHAR),
    ("slot", Type::INT2),
    ("slot_time", Type::VARCHAR),
    ("capacity", Type::INT4),
    ("confirmed", Type::INT4),
    ("waitlisted", Type::INT4),
    ("available_spots", Type::INT4),
    ("is_available", Type::BOOL),
    ("user_booking_id", Type::VARCHAR),
    ("user_booking_status", Type::VARCHAR),
    ("can_book_more", Type::BOOL),
];

const STATS_COLUMNS: &[(&str, Type)] = &[
    ("resource_id", Type::VARCHAR),
    ("total", Type::INT4),
    ("confirmed", Type::INT4),
    ("waitlisted", Type::INT4),
];

const SLOT_TIME_COLUMNS: &[(&str, Type)] = &[("slot", Type::INT2), ("label", Type::VARCHAR)];

const SETTING_COLUMNS: &[(&str, Type)] = &[("key", Type::VARCHAR), ("value", Type::INT4)];

fn schema(shape: RowShape, format: &Format) -> Vec<FieldInfo> {
    let columns = match shape {
        RowShape::Resources => RESOURCE_COLUMNS,
        RowShape::Bookings => BOOKING_COLUMNS,
        RowShape::SlotAvailability => AVAILABILITY_COLUMNS,
        RowShape::BookingStats => STATS_COLUMNS,
        RowShape::SlotTimes => SLOT_TIME_COLUMNS,
        RowShape::Settings => SETTING_COLUMNS,
    };
    columns
        .iter()
        .enumerate()
        .map(|(idx, (name, ty))| {
            FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(idx))
        })
        .collect()
}

fn statement_schema(statement: &str, format: &Format) -> Vec<FieldInfo> {
    sql::statement_row_shape(statement)
        .map(|shape| schema(shape, format))
        .unwrap_or_default()
}

fn shaped(schema: Option<Arc<Vec<FieldInfo>>>) -> PgWireResult<Arc<Vec<FieldInfo>>> {
    schema.ok_or_else(|| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "XX000".into(),
            "command has no result set".into(),
        )))
    })
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn bookings_response<'a>(
    schema: Arc<Vec<FieldInfo>>,
    bookings: impl Iterator<Item = &'a Booking>,
) -> PgWireResult<Response> {
    let rows = bookings.map(|b| encode_booking(&schema, b, None)).collect();
    Ok(query_response(schema, rows))
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn encode_resource(schema: &Arc<Vec<FieldInfo>>, r: &Resource) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.name)?;
    encoder.encode_field(&r.description)?;
    encoder.encode_field(&to_i32(r.capacity))?;
    encoder.encode_field(&r.active)?;
    Ok(encoder.take_row())
}

fn encode_booking(
    schema: &Arc<Vec<FieldInfo>>,
    b: &Booking,
    message: Option<&str>,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.user_id.to_string())?;
    encoder.encode_field(&b.resource_id.to_string())?;
    encoder.encode_field(&b.date.to_string())?;
    encoder.encode_field(&i16::from(b.slot))?;
    encoder.encode_field(&slot_label(b.slot))?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.waitlist_position.map(to_i32))?;
    encoder.encode_field(&b.created_at)?;
    encoder.encode_field(&message)?;
    Ok(encoder.take_row())
}

fn encode_availability(schema: &Arc<Vec<FieldInfo>>, a: &SlotAvailability) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&a.key.resource_id.to_string())?;
    encoder.encode_field(&a.key.date.to_string())?;
    encoder.encode_field(&i16::from(a.key.slot))?;
    encoder.encode_field(&slot_label(a.key.slot))?;
    encoder.encode_field(&to_i32(a.capacity))?;
    encoder.encode_field(&to_i32(a.confirmed))?;
    encoder.encode_field(&to_i32(a.waitlisted))?;
    encoder.encode_field(&to_i32(a.available_spots))?;
    encoder.encode_field(&a.is_available)?;
    encoder.encode_field(&a.user_booking.as_ref().map(|b| b.id.to_string()))?;
    encoder.encode_field(&a.user_booking.as_ref().map(|b| b.status.as_str()))?;
    encoder.encode_field(&a.can_book_more)?;
    Ok(encoder.take_row())
}

fn encode_stats(schema: &Arc<Vec<FieldInfo>>, s: &ResourceStats) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&s.resource_id.to_string())?;
    encoder.encode_field(&to_i32(s.total))?;
    encoder.encode_field(&to_i32(s.confirmed))?;
    encoder.encode_field(&to_i32(s.waitlisted))?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
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
        let response = self.run(client, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(
            stmt,
            column_format.unwrap_or(&Format::UnifiedText),
        ))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

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
        self.run(client, &sql, &portal.result_column_format).await
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
        // Result formats are only known at bind time.
        let fields = statement_schema(&target.statement, &Format::UnifiedText);
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
            &target.result_column_format,
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
/// Walks backwards so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let values: Vec<String> = portal
        .parameters
        .iter()
        .map(|param| match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        })
        .collect();
    substitute_values(&portal.statement.statement, &values)
}

fn substitute_values(sql: &str, values: &[String]) -> String {
    let mut result = sql.to_string();
    for (i, value) in values.iter().enumerate().rev() {
        result = result.replace(&format!("${}", i + 1), value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::ResourceUnavailable(_)
        | EngineError::InvalidDate(_)
        | EngineError::InvalidSlot(_)
        | EngineError::AlreadyCancelled(_)
        | EngineError::UnknownSetting(_)
        | EngineError::LimitExceeded(_) => "22023",
        EngineError::ConcurrentLimitExceeded(_)
        | EngineError::DuplicateBooking
        | EngineError::AlreadyExists(_)
        | EngineError::NameTaken(_) => "23505",
        EngineError::NotFound(_) => "02000",
        EngineError::Unauthorized(_) => "42501",
        EngineError::WriteConflict(_) | EngineError::Transient(_) => "40001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
