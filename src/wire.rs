use std::fmt::Debug;
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

use crate::auth::FleetbayAuthSource;
use crate::engine::{Engine, EngineError};
use crate::history::TimelineEntry;
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command};
use crate::tenant::TenantManager;

pub struct FleetbayHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<FleetbayQueryParser>,
}

impl FleetbayHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(FleetbayQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            user_error("08006", format!("workshop error: {e}"))
        })
    }

    /// Execute one command, recording its outcome and latency.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result.map_err(engine_err)
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> Result<Response, EngineError> {
        let inserted = || Response::Execution(Tag::new("INSERT").with_rows(1));
        match cmd {
            Command::InsertVehicle { id, label } => {
                engine.register_vehicle(id, label).await?;
                Ok(inserted())
            }
            Command::InsertRequest(new) => {
                engine.submit_request(new).await?;
                Ok(inserted())
            }
            Command::InsertConfirmation { request_id, confirm } => {
                engine.confirm_request(request_id, confirm).await?;
                Ok(inserted())
            }
            Command::InsertRejection { request_id, reason } => {
                engine.reject_request(request_id, reason).await?;
                Ok(inserted())
            }
            Command::InsertWorkOrder {
                id,
                vehicle_id,
                work_type,
                description,
                assignments,
            } => {
                engine
                    .create_work_order(id, vehicle_id, work_type, description, assignments)
                    .await?;
                Ok(inserted())
            }
            Command::InsertAdvance { work_order_id, status } => {
                engine.advance(work_order_id, status).await?;
                Ok(inserted())
            }
            Command::InsertClosure { work_order_id, signoff } => {
                engine.close(work_order_id, signoff).await?;
                Ok(inserted())
            }
            Command::InsertOverride {
                work_order_id,
                status,
                actor,
                reason,
            } => {
                engine.force_status(work_order_id, status, actor, reason).await?;
                Ok(inserted())
            }
            Command::SelectAvailableBlocks { date } => {
                let blocks = engine.available_blocks(date).await?;
                let day = date.to_string();
                Ok(rows(View::AvailableBlocks, blocks, |enc, block| {
                    enc.encode_field(&day)?;
                    enc.encode_field(&block.to_string())
                }))
            }
            Command::SelectAvailableDates => {
                let dates = engine.available_dates().await;
                Ok(rows(View::AvailableDates, dates, |enc, date| enc.encode_field(&date.to_string())))
            }
            Command::SelectTimeline { request_id } => {
                let timeline = engine.timeline(request_id).await?;
                Ok(rows(View::Timeline, timeline, encode_timeline_entry))
            }
            Command::SelectRequest { id } => {
                let request = engine.get_request(id).await?;
                Ok(rows(View::Requests, vec![request], encode_request))
            }
            Command::SelectWorkOrder { id } => {
                let wo = engine.get_work_order(id).await?;
                Ok(rows(View::WorkOrders, vec![wo], encode_work_order))
            }
            Command::SelectPendingRequests => {
                let pending = engine.pending_queue().await;
                Ok(rows(View::Requests, pending, encode_request))
            }
            Command::SelectTransitions { entity_id } => {
                let log = engine.transition_log(entity_id);
                Ok(rows(View::Transitions, log, encode_transition))
            }
            Command::SelectVehicles => {
                let vehicles = engine.list_vehicles();
                Ok(rows(View::Vehicles, vehicles, |enc, v| {
                    enc.encode_field(&v.id.to_string())?;
                    enc.encode_field(&v.label)?;
                    enc.encode_field(&v.status.to_string())
                }))
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

/// The readable views and their column layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    AvailableBlocks,
    AvailableDates,
    Timeline,
    Requests,
    WorkOrders,
    Transitions,
    Vehicles,
}

impl View {
    /// Resolve the view a statement reads from, if it is a SELECT.
    /// Works on unbound statements, so it never parses `$n` values.
    fn of_statement(stmt: &str) -> Option<View> {
        let lower = stmt.to_lowercase();
        let mut words = lower
            .split(|c: char| c.is_whitespace() || c == ';' || c == '(')
            .filter(|w| !w.is_empty());
        if words.next()? != "select" {
            return None;
        }
        words.find(|w| *w == "from")?;
        match words.next()? {
            "available_blocks" => Some(View::AvailableBlocks),
            "available_dates" => Some(View::AvailableDates),
            "timeline" => Some(View::Timeline),
            "requests" | "pending_requests" => Some(View::Requests),
            "work_orders" => Some(View::WorkOrders),
            "transitions" => Some(View::Transitions),
            "vehicles" => Some(View::Vehicles),
            _ => None,
        }
    }

    fn columns(&self) -> &'static [(&'static str, Type)] {
        match self {
            View::AvailableBlocks => &[("date", Type::VARCHAR), ("block", Type::VARCHAR)],
            View::AvailableDates => &[("date", Type::VARCHAR)],
            View::Timeline => &[
                ("milestone", Type::VARCHAR),
                ("status", Type::VARCHAR),
                ("at", Type::INT8),
            ],
            View::Requests => &[
                ("id", Type::VARCHAR),
                ("vehicle_id", Type::VARCHAR),
                ("requester_id", Type::VARCHAR),
                ("category", Type::VARCHAR),
                ("priority", Type::VARCHAR),
                ("requested_date", Type::VARCHAR),
                ("requested_block", Type::VARCHAR),
                ("notes", Type::VARCHAR),
                ("attachments", Type::VARCHAR),
                ("status", Type::VARCHAR),
                ("confirmed_date", Type::VARCHAR),
                ("confirmed_block", Type::VARCHAR),
                ("work_order_id", Type::VARCHAR),
                ("submitted_at", Type::INT8),
                ("decided_at", Type::INT8),
                ("rejection_reason", Type::VARCHAR),
            ],
            View::WorkOrders => &[
                ("id", Type::VARCHAR),
                ("request_id", Type::VARCHAR),
                ("vehicle_id", Type::VARCHAR),
                ("employee_id", Type::VARCHAR),
                ("work_type", Type::VARCHAR),
                ("description", Type::VARCHAR),
                ("bay", Type::VARCHAR),
                ("technician", Type::VARCHAR),
                ("status", Type::VARCHAR),
                ("closure", Type::VARCHAR),
                ("created_at", Type::INT8),
                ("started_at", Type::INT8),
                ("repair_started_at", Type::INT8),
                ("completed_at", Type::INT8),
                ("closed_at", Type::INT8),
                ("signoff_technician", Type::VARCHAR),
                ("signoff_note", Type::VARCHAR),
            ],
            View::Transitions => &[
                ("entity", Type::VARCHAR),
                ("id", Type::VARCHAR),
                ("from_status", Type::VARCHAR),
                ("to_status", Type::VARCHAR),
                ("at", Type::INT8),
                ("kind", Type::VARCHAR),
                ("actor", Type::VARCHAR),
                ("reason", Type::VARCHAR),
            ],
            View::Vehicles => &[
                ("id", Type::VARCHAR),
                ("label", Type::VARCHAR),
                ("status", Type::VARCHAR),
            ],
        }
    }

    fn schema(&self) -> Vec<FieldInfo> {
        self.columns()
            .iter()
            .map(|(name, ty)| FieldInfo::new((*name).into(), None, None, ty.clone(), FieldFormat::Text))
            .collect()
    }
}

fn schema_of(stmt: &str) -> Vec<FieldInfo> {
    View::of_statement(stmt).map(|v| v.schema()).unwrap_or_default()
}

fn rows<T>(
    view: View,
    items: Vec<T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(view.schema());
    let data: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(data)))
}

fn text<T: ToString>(value: Option<T>) -> Option<String> {
    value.map(|v| v.to_string())
}

fn encode_timeline_entry(enc: &mut DataRowEncoder, entry: &TimelineEntry) -> PgWireResult<()> {
    enc.encode_field(&entry.milestone.as_str().to_string())?;
    enc.encode_field(&entry.status.as_str().to_string())?;
    enc.encode_field(&entry.at)
}

fn encode_request(enc: &mut DataRowEncoder, r: &DiagnosticRequest) -> PgWireResult<()> {
    let attachments =
        serde_json::to_string(&r.attachments).map_err(|e| PgWireError::ApiError(Box::new(e)))?;
    enc.encode_field(&r.id.to_string())?;
    enc.encode_field(&r.vehicle_id.to_string())?;
    enc.encode_field(&r.requester_id.to_string())?;
    enc.encode_field(&r.category)?;
    enc.encode_field(&r.priority.to_string())?;
    enc.encode_field(&r.requested_date.to_string())?;
    enc.encode_field(&r.requested_block.to_string())?;
    enc.encode_field(&r.notes)?;
    enc.encode_field(&attachments)?;
    enc.encode_field(&r.status.to_string())?;
    enc.encode_field(&text(r.confirmed_date))?;
    enc.encode_field(&text(r.confirmed_block))?;
    enc.encode_field(&text(r.work_order_id))?;
    enc.encode_field(&r.submitted_at)?;
    enc.encode_field(&r.decided_at)?;
    enc.encode_field(&r.rejection_reason)
}

fn encode_work_order(enc: &mut DataRowEncoder, wo: &WorkOrder) -> PgWireResult<()> {
    enc.encode_field(&wo.id.to_string())?;
    enc.encode_field(&text(wo.request_id))?;
    enc.encode_field(&wo.vehicle_id.to_string())?;
    enc.encode_field(&text(wo.employee_id))?;
    enc.encode_field(&wo.work_type)?;
    enc.encode_field(&wo.description)?;
    enc.encode_field(&wo.bay)?;
    enc.encode_field(&wo.technician)?;
    enc.encode_field(&wo.status.to_string())?;
    enc.encode_field(&wo.closure.to_string())?;
    enc.encode_field(&wo.created_at)?;
    enc.encode_field(&wo.started_at)?;
    enc.encode_field(&wo.repair_started_at)?;
    enc.encode_field(&wo.completed_at)?;
    enc.encode_field(&wo.closed_at)?;
    enc.encode_field(&wo.signoff.as_ref().map(|s| s.technician.clone()))?;
    enc.encode_field(&wo.signoff.as_ref().and_then(|s| s.note.clone()))
}

fn encode_transition(enc: &mut DataRowEncoder, t: &Transition) -> PgWireResult<()> {
    let (kind, actor, reason) = match &t.kind {
        TransitionKind::Normal => ("normal", None, None),
        TransitionKind::Override { actor, reason } => ("override", Some(actor.clone()), Some(reason.clone())),
    };
    enc.encode_field(&t.entity.to_string())?;
    enc.encode_field(&t.id.to_string())?;
    enc.encode_field(&text(t.from))?;
    enc.encode_field(&t.to.to_string())?;
    enc.encode_field(&t.at)?;
    enc.encode_field(&kind.to_string())?;
    enc.encode_field(&actor)?;
    enc.encode_field(&reason)
}

#[async_trait]
impl SimpleQueryHandler for FleetbayHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.run(&engine, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct FleetbayQueryParser;

#[async_trait]
impl QueryParser for FleetbayQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
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
        Ok(schema_of(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for FleetbayHandler {
    type Statement = String;
    type QueryParser = FleetbayQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd).await
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
        Ok(DescribeStatementResponse::new(param_types, schema_of(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_of(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    sql.split('$')
        .skip(1)
        .filter_map(|rest| {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            digits.parse::<usize>().ok()
        })
        .max()
        .unwrap_or(0)
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Replace `$N` placeholders with bound text values in a single pass over
/// the statement. Bound values are never rescanned, and placeholders inside
/// quoted literals are left alone.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.char_indices().peekable();
    let mut in_literal = false;
    while let Some((i, c)) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c != '$' || in_literal {
            out.push(c);
            continue;
        }
        let mut end = i + 1;
        while let Some(&(j, d)) = chars.peek() {
            if !d.is_ascii_digit() {
                break;
            }
            end = j + 1;
            chars.next();
        }
        let param = sql[i + 1..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|n| params.get(n));
        match param {
            Some(Some(bytes)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(bytes.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[i..end]),
        }
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct FleetbayFactory {
    handler: Arc<FleetbayHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<FleetbayAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl FleetbayFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = FleetbayAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(FleetbayHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for FleetbayFactory {
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
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = FleetbayFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for each engine failure class.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) => "22023",
        EngineError::CapacityConflict { .. } => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::Persistence(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;
    use crate::engine::ValidationError;

    #[test]
    fn view_resolved_from_unbound_statement() {
        assert_eq!(
            View::of_statement("SELECT * FROM available_blocks WHERE date = $1"),
            Some(View::AvailableBlocks)
        );
        assert_eq!(View::of_statement("select * from pending_requests;"), Some(View::Requests));
        assert_eq!(View::of_statement("SELECT * FROM\n  transitions WHERE entity_id = $1"), Some(View::Transitions));
        assert_eq!(View::of_statement("INSERT INTO vehicles (id) VALUES ($1)"), None);
        assert!(schema_of("INSERT INTO advances VALUES ($1, $2)").is_empty());
        assert_eq!(schema_of("SELECT * FROM work_orders WHERE id = $1").len(), 17);
    }

    #[test]
    fn count_params_takes_highest_index() {
        assert_eq!(count_params("SELECT * FROM vehicles"), 0);
        assert_eq!(count_params("INSERT INTO advances VALUES ($1, $2)"), 2);
        assert_eq!(count_params("INSERT INTO requests VALUES ($10, $2, $1)"), 10);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "INSERT INTO overrides (work_order_id, status, actor, reason) VALUES ($1, $2, $3, $4)";
        let params = [
            Some("01ARZ3NDEKTSV4RRFFQ69G5FAV"),
            Some("in_repair"),
            Some("ops $2"),
            Some("costs $1 o'clock"),
        ];
        assert_eq!(
            bind_params(sql, &params),
            "INSERT INTO overrides (work_order_id, status, actor, reason) VALUES \
             ('01ARZ3NDEKTSV4RRFFQ69G5FAV', 'in_repair', 'ops $2', 'costs $1 o''clock')"
        );
    }

    #[test]
    fn bind_handles_wide_indexes_nulls_and_literals() {
        let mut params = vec![Some("a"); 10];
        params[1] = None;
        params[9] = Some("j");
        assert_eq!(bind_params("VALUES ($10, $1, $2)", &params), "VALUES ('j', 'a', NULL)");
        assert_eq!(bind_params("VALUES ('$1', $1)", &params), "VALUES ('$1', 'a')");
        assert_eq!(bind_params("VALUES ($11, $0, $)", &params), "VALUES ($11, $0, $)");
    }

    #[test]
    fn engine_errors_map_to_sqlstate() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(sqlstate(&ValidationError::Empty("category").into()), "22023");
        assert_eq!(sqlstate(&EngineError::Persistence("disk".into())), "58030");
        assert_eq!(
            sqlstate(&EngineError::InvalidTransition {
                entity: EntityKind::Request,
                id,
                from: StatusTag::Request(RequestStatus::Rejected),
                to: StatusTag::Request(RequestStatus::Confirmed),
            }),
            "55000"
        );
    }
}
