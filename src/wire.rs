use std::fmt::Debug;
use std::ops::Range;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::RentdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct RentdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RentdQueryParser>,
}

impl RentdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RentdQueryParser),
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

    /// The authenticated login name; every command runs on its behalf.
    fn resolve_caller<C: ClientInfo>(&self, client: &C) -> PgWireResult<UserId> {
        client
            .metadata()
            .get("user")
            .filter(|u| !u.is_empty())
            .cloned()
            .ok_or_else(|| {
                PgWireError::UserError(Box::new(ErrorInfo::new(
                    "ERROR".into(),
                    "28000".into(),
                    "no authenticated user on this connection".into(),
                )))
            })
    }

    async fn run<C: ClientInfo>(&self, client: &C, query: &str) -> PgWireResult<Vec<Response>> {
        let engine = self.resolve_engine(client)?;
        let caller = self.resolve_caller(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;

        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(&engine, &caller, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label).record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        caller: &str,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertItem { item } => {
                engine.create_item(caller, item).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateItem { id, patch } => {
                engine.update_item(caller, id, patch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteItem { id } => {
                engine.delete_item(caller, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectItems { window, skip, limit } => {
                let views = engine.list_items(window, skip, limit).await.map_err(engine_err)?;
                let schema = Arc::new(items_schema());
                let rows: Vec<PgWireResult<DataRow>> = views
                    .iter()
                    .map(|v| encode_item(&schema, &v.item, Some(v.real_available_stock)))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectItem { id } => {
                let item = engine.get_item(id).await.map_err(engine_err)?;
                let schema = Arc::new(items_schema());
                let rows = vec![encode_item(&schema, &item, None)];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAvailability { item_id, window } => {
                let view = engine
                    .item_availability(item_id, window)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(items_schema());
                let rows = vec![encode_item(&schema, &view.item, Some(view.real_available_stock))];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertRental {
                id,
                item_id,
                range,
                quantity,
            } => {
                engine
                    .create_rental(caller, id, item_id, range, quantity)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::EndRental { id } => {
                engine.end_rental(caller, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::ConfirmRental { id } => {
                engine.confirm_received(caller, id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectRental { id } => {
                let rental = engine.get_rental(caller, id).await.map_err(engine_err)?;
                let schema = Arc::new(rentals_schema());
                let rows = vec![encode_rental(&schema, &rental)];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectActiveRentals => {
                let rentals = engine.list_active_rentals(caller).await;
                let schema = Arc::new(rentals_schema());
                let rows: Vec<PgWireResult<DataRow>> =
                    rentals.iter().map(|r| encode_rental(&schema, r)).collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

/// `real_available_stock` is NULL unless the row came from a window query.
fn items_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("owner_id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("description", Type::VARCHAR),
        text_field("price_per_day", Type::INT8),
        text_field("total_stock", Type::INT8),
        text_field("available_stock", Type::INT8),
        text_field("is_active", Type::BOOL),
        text_field("real_available_stock", Type::INT8),
        text_field("created_at", Type::INT8),
        text_field("updated_at", Type::INT8),
    ]
}

/// Dates go out as `YYYY-MM-DD` text.
fn rentals_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("item_id", Type::VARCHAR),
        text_field("renter_id", Type::VARCHAR),
        text_field("start_date", Type::VARCHAR),
        text_field("end_date", Type::VARCHAR),
        text_field("quantity", Type::INT8),
        text_field("total_price", Type::INT8),
        text_field("is_active", Type::BOOL),
        text_field("owner_received", Type::BOOL),
        text_field("created_at", Type::INT8),
        text_field("updated_at", Type::INT8),
    ]
}

fn encode_item(schema: &Arc<Vec<FieldInfo>>, item: &ItemInfo, real_available: Option<i64>) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&item.id.to_string())?;
    encoder.encode_field(&item.owner_id)?;
    encoder.encode_field(&item.name)?;
    encoder.encode_field(&item.description)?;
    encoder.encode_field(&item.price_per_day)?;
    encoder.encode_field(&i64::from(item.total_stock))?;
    encoder.encode_field(&i64::from(item.available_stock))?;
    encoder.encode_field(&item.is_active)?;
    encoder.encode_field(&real_available)?;
    encoder.encode_field(&item.created_at)?;
    encoder.encode_field(&item.updated_at)?;
    Ok(encoder.take_row())
}

fn encode_rental(schema: &Arc<Vec<FieldInfo>>, rental: &Rental) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&rental.id.to_string())?;
    encoder.encode_field(&rental.item_id.to_string())?;
    encoder.encode_field(&rental.renter_id)?;
    encoder.encode_field(&rental.range.start.to_string())?;
    encoder.encode_field(&rental.range.end.to_string())?;
    encoder.encode_field(&i64::from(rental.quantity))?;
    encoder.encode_field(&rental.total_price)?;
    encoder.encode_field(&rental.is_active())?;
    encoder.encode_field(&rental.status.owner_received())?;
    encoder.encode_field(&rental.created_at)?;
    encoder.encode_field(&rental.updated_at)?;
    Ok(encoder.take_row())
}

/// Result columns for a statement, decided from its text without executing it.
fn result_schema_for(sql: &str) -> Vec<FieldInfo> {
    match sql::parse_sql(sql) {
        Ok(Command::SelectItems { .. } | Command::SelectItem { .. } | Command::SelectAvailability { .. }) => {
            items_schema()
        }
        Ok(Command::SelectRental { .. } | Command::SelectActiveRentals) => rentals_schema(),
        _ => fallback_schema(sql),
    }
}

/// Placeholders like `$1` don't parse as literals, so fall back to keywords.
fn fallback_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("RENTALS") {
        rentals_schema()
    } else if upper.contains("ITEMS") || upper.contains("AVAILABILITY") {
        items_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for RentdHandler {
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
        self.run(client, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RentdQueryParser;

#[async_trait]
impl QueryParser for RentdQueryParser {
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
        Ok(result_schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RentdHandler {
    type Statement = String;
    type QueryParser = RentdQueryParser;

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
        let mut responses = self.run(client, &sql).await?;
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
            result_schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(result_schema_for(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, n)| n).max().unwrap_or(0)
}

/// Byte span and index of every `$N` outside quoted literals and identifiers.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            // A doubled quote closes and reopens, so it stays inside.
            Some(q) => {
                if b == q {
                    quote = None;
                }
                i += 1;
            }
            None if b == b'\'' || b == b'"' => {
                quote = Some(b);
                i += 1;
            }
            None if b == b'$' => {
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[i + 1..end].parse::<usize>() {
                    found.push((i..end, n));
                }
                i = end;
            }
            None => i += 1,
        }
    }
    found
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute(&portal.statement.statement, &params)
}

/// One pass over the original statement. Bound values are never rescanned,
/// so `$1` inside a value stays literal text.
fn substitute(sql: &str, params: &[Option<String>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    for (span, n) in placeholders(sql) {
        out.push_str(&sql[copied..span.start]);
        match n.checked_sub(1).and_then(|i| params.get(i)) {
            Some(Some(text)) => {
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[span.clone()]),
        }
        copied = span.end;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RentdFactory {
    handler: Arc<RentdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RentdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RentdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = RentdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RentdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RentdFactory {
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
    let factory = Arc::new(RentdFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::Forbidden(_) => "42501",
        EngineError::InsufficientStock { .. } => "23P01",
        EngineError::InvalidRange { .. } | EngineError::InvalidQuantity(_) | EngineError::InvalidItem(_) => "22023",
        EngineError::AlreadyTerminal(_) => "55000",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::HasActiveRentals(_) => "23503",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if let EngineError::WalError(msg) = &e {
        tracing::error!("WAL failure surfaced to client: {msg}");
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM items"), 0);
        assert_eq!(count_params("SELECT * FROM items WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO rentals (id, item_id, start_date, end_date, quantity) VALUES ($1, $2, $3, $4, $5)"),
            5
        );
        assert_eq!(count_params("SELECT $12"), 12);
    }

    #[test]
    fn substitute_quotes_and_nulls() {
        let sql = "UPDATE items SET name = $1, description = $2 WHERE id = $3";
        let params = vec![Some("O'Brien's bike".to_string()), None, Some("X".to_string())];
        assert_eq!(
            substitute(sql, &params),
            "UPDATE items SET name = 'O''Brien''s bike', description = NULL WHERE id = 'X'"
        );
    }

    #[test]
    fn substitute_double_digit_placeholders() {
        let params: Vec<Option<String>> = (1..=10).map(|i| Some(i.to_string())).collect();
        assert_eq!(substitute("$1 $10", &params), "'1' '10'");
    }

    #[test]
    fn substitute_leaves_placeholders_in_values_alone() {
        let sql = "INSERT INTO items (id, name) VALUES ($1, $2)";
        let params = vec![Some("01HX".to_string()), Some("Tent $1 deluxe".to_string())];
        assert_eq!(
            substitute(sql, &params),
            "INSERT INTO items (id, name) VALUES ('01HX', 'Tent $1 deluxe')"
        );

        let bound = substitute(
            "INSERT INTO items (id, name, price_per_day, total_stock) VALUES ($1, $2, $3, $4)",
            &[
                Some(Ulid::nil().to_string()),
                Some("costs $3, or $10 for two".to_string()),
                Some("3".to_string()),
                Some("1".to_string()),
            ],
        );
        let Ok(Command::InsertItem { item }) = sql::parse_sql(&bound) else {
            panic!("expected item insert from {bound}");
        };
        assert_eq!(item.name, "costs $3, or $10 for two");
        assert_eq!(item.price_per_day, 3);
    }

    #[test]
    fn placeholders_inside_literals_are_text() {
        let sql = r#"UPDATE items SET name = '$1 ''$3''', "$4" = $1 WHERE id = $2"#;
        assert_eq!(count_params(sql), 2);
        let params = vec![Some("a".to_string()), Some("b".to_string())];
        assert_eq!(
            substitute(sql, &params),
            r#"UPDATE items SET name = '$1 ''$3''', "$4" = 'a' WHERE id = 'b'"#
        );
    }

    #[test]
    fn unbound_placeholder_kept() {
        assert_eq!(substitute("SELECT $2, $0, $", &[Some("x".to_string())]), "SELECT $2, $0, $");
    }

    #[test]
    fn schema_by_statement() {
        assert_eq!(result_schema_for("SELECT * FROM items").len(), items_schema().len());
        assert_eq!(result_schema_for("SELECT * FROM rentals WHERE id = $1").len(), rentals_schema().len());
        assert!(result_schema_for("DELETE FROM items WHERE id = $1").is_empty());
    }

    #[test]
    fn sqlstates_per_error_kind() {
        let id = Ulid::new();
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::Forbidden(id)), "42501");
        assert_eq!(
            sqlstate(&EngineError::InsufficientStock {
                item_id: id,
                requested: 3,
                available: 2
            }),
            "23P01"
        );
        assert_eq!(sqlstate(&EngineError::InvalidQuantity(0)), "22023");
        assert_eq!(sqlstate(&EngineError::AlreadyTerminal(id)), "55000");
        assert_eq!(sqlstate(&EngineError::HasActiveRentals(id)), "23503");
    }
}
