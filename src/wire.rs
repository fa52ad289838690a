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
use tracing::debug;

use crate::auth::{Credentials, ParkdAuthSource};
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct ParkdHandler {
    tenant_manager: Arc<TenantManager>,
    admin_user: String,
    query_parser: Arc<ParkdQueryParser>,
}

impl ParkdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, admin_user: String) -> Self {
        Self {
            tenant_manager,
            admin_user,
            query_parser: Arc::new(ParkdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Parse, run and meter one statement on behalf of the connected user.
    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let user = session_user(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        let started = Instant::now();
        let result = self.execute_command(&engine, &user, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        debug!("{user}: {label} -> {status}");
        result
    }

    fn require_admin(&self, user: &str) -> PgWireResult<()> {
        if user == self.admin_user {
            Ok(())
        } else {
            Err(user_error(
                "42501",
                format!("permission denied: {user} may not manage lots"),
            ))
        }
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        user: &str,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertLot {
                id,
                name,
                address,
                postal_code,
                price,
                capacity,
            } => {
                self.require_admin(user)?;
                engine
                    .create_lot(NewLot {
                        id,
                        name,
                        address,
                        postal_code,
                        unit_price: price,
                        capacity,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::ResizeLot { id, capacity } => {
                self.require_admin(user)?;
                engine.resize_lot(id, capacity).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteLot { id } => {
                self.require_admin(user)?;
                engine.delete_lot(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertReservation { lot_id, returning } => {
                let reservation = engine.allocate(lot_id, user).await.map_err(engine_err)?;
                if returning {
                    Ok(vec![rows_response(
                        reservation_schema(),
                        [reservation],
                        encode_reservation,
                    )])
                } else {
                    Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
                }
            }
            Command::ReleaseReservation { id, returning } => {
                let settlement = engine.release(id, user).await.map_err(engine_err)?;
                if returning {
                    Ok(vec![rows_response(
                        history_schema(),
                        [settlement],
                        encode_settlement,
                    )])
                } else {
                    Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
                }
            }
            Command::SelectLots { id } => {
                let lots = match id {
                    Some(id) => vec![engine.get_lot(id).await.map_err(engine_err)?],
                    None => engine.list_lots().await,
                };
                Ok(vec![rows_response(lot_schema(), lots, encode_lot)])
            }
            Command::SelectSpots { lot_id } => {
                let spots = engine.list_spots(lot_id).await.map_err(engine_err)?;
                Ok(vec![rows_response(spot_schema(), spots, encode_spot)])
            }
            Command::SelectReservations => {
                let open = engine.list_open_reservations_for(user).await;
                Ok(vec![rows_response(
                    reservation_schema(),
                    open,
                    encode_reservation,
                )])
            }
            Command::SelectHistory => {
                let history = engine.list_history_for(user).await;
                Ok(vec![rows_response(history_schema(), history, encode_history)])
            }
        }
    }
}

fn session_user<C: ClientInfo>(client: &C) -> PgWireResult<String> {
    client
        .metadata()
        .get("user")
        .filter(|u| !u.is_empty())
        .cloned()
        .ok_or_else(|| user_error("28000", "no session user".into()))
}

// ── Result rows ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn lot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("address", Type::VARCHAR),
        text_field("postal_code", Type::VARCHAR),
        text_field("price", Type::VARCHAR),
        text_field("capacity", Type::INT8),
        text_field("available", Type::INT8),
    ]
}

fn spot_schema() -> Vec<FieldInfo> {
    vec![
        text_field("lot_id", Type::VARCHAR),
        text_field("number", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("reservation_id", Type::VARCHAR),
    ]
}

fn reservation_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("lot_id", Type::VARCHAR),
        text_field("spot", Type::INT8),
        text_field("requester", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("cost", Type::VARCHAR),
    ]
}

/// Shared by `SELECT * FROM history` and `DELETE FROM reservations ... RETURNING *`.
fn history_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("reservation_id", Type::VARCHAR),
        text_field("lot_id", Type::VARCHAR),
        text_field("spot", Type::INT8),
        text_field("requester", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("cost", Type::VARCHAR),
    ]
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    encode: fn(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_lot(encoder: &mut DataRowEncoder, lot: LotInfo) -> PgWireResult<()> {
    encoder.encode_field(&lot.id.to_string())?;
    encoder.encode_field(&lot.name)?;
    encoder.encode_field(&lot.address)?;
    encoder.encode_field(&lot.postal_code)?;
    encoder.encode_field(&lot.unit_price.to_string())?;
    encoder.encode_field(&i64::from(lot.capacity))?;
    encoder.encode_field(&i64::from(lot.available))
}

fn encode_spot(encoder: &mut DataRowEncoder, spot: SpotInfo) -> PgWireResult<()> {
    let holder = match spot.status {
        SpotStatus::Free => None,
        SpotStatus::Occupied { reservation_id } => Some(reservation_id.to_string()),
    };
    encoder.encode_field(&spot.lot_id.to_string())?;
    encoder.encode_field(&i64::from(spot.number))?;
    encoder.encode_field(&spot.status.label().to_string())?;
    encoder.encode_field(&holder)
}

fn encode_reservation(encoder: &mut DataRowEncoder, r: Reservation) -> PgWireResult<()> {
    encoder.encode_field(&r.id.to_string())?;
    encoder.encode_field(&r.lot_id.to_string())?;
    encoder.encode_field(&i64::from(r.spot))?;
    encoder.encode_field(&r.requester)?;
    encoder.encode_field(&r.start)?;
    encoder.encode_field(&r.end)?;
    encoder.encode_field(&r.cost.map(|c| c.to_string()))
}

fn encode_history(encoder: &mut DataRowEncoder, h: HistoryRecord) -> PgWireResult<()> {
    encoder.encode_field(&h.id.to_string())?;
    encoder.encode_field(&h.reservation_id.to_string())?;
    encoder.encode_field(&h.lot_id.to_string())?;
    encoder.encode_field(&i64::from(h.spot))?;
    encoder.encode_field(&h.requester)?;
    encoder.encode_field(&h.start)?;
    encoder.encode_field(&h.end)?;
    encoder.encode_field(&h.cost.to_string())
}

fn encode_settlement(encoder: &mut DataRowEncoder, s: Settlement) -> PgWireResult<()> {
    encode_history(
        encoder,
        HistoryRecord {
            id: s.history_id,
            reservation_id: s.reservation_id,
            lot_id: s.lot_id,
            spot: s.spot,
            requester: s.requester,
            start: s.start,
            end: s.end,
            cost: s.cost,
        },
    )
}

/// Result columns a statement will produce, judged from its text alone
/// (parameters are not bound yet when a client asks to describe it).
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    let returning = normalized.contains(" RETURNING ");
    if normalized.starts_with("SELECT") {
        if normalized.contains(" FROM LOTS") {
            lot_schema()
        } else if normalized.contains(" FROM SPOTS") {
            spot_schema()
        } else if normalized.contains(" FROM RESERVATIONS") {
            reservation_schema()
        } else if normalized.contains(" FROM HISTORY") {
            history_schema()
        } else {
            vec![]
        }
    } else if returning && normalized.starts_with("INSERT INTO RESERVATIONS") {
        reservation_schema()
    } else if returning && normalized.starts_with("DELETE FROM RESERVATIONS") {
        history_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for ParkdHandler {
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
        self.run(&*client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ParkdQueryParser;

#[async_trait]
impl QueryParser for ParkdQueryParser {
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
impl ExtendedQueryHandler for ParkdHandler {
    type Statement = String;
    type QueryParser = ParkdQueryParser;

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
        let mut responses = self.run(&*client, &sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
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

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ParkdFactory {
    handler: Arc<ParkdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<ParkdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ParkdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, credentials: Credentials) -> Self {
        let admin_user = credentials.admin_user.clone();
        let auth_source = ParkdAuthSource::new(credentials);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(ParkdHandler::new(tenant_manager, admin_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ParkdFactory {
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
    credentials: Credentials,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = ParkdFactory::new(tenant_manager, credentials);
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

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::NoCapacity(_)
        | EngineError::CapacityConflict { .. }
        | EngineError::Conflict { .. } => "23514",
        EngineError::Forbidden(_) => "42501",
        EngineError::InvalidArgument(_) => "22023",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Unavailable(_) => "58030",
        EngineError::LedgerViolation(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
