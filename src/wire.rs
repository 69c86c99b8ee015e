use std::fmt::Debug;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
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
use tokio::net::TcpStream;
use tracing::debug;

use crate::engine::{Engine, EngineError};
use crate::model::Rate;
use crate::observability;
use crate::sheet::{self, SheetError};
use crate::sql::{self, Command, RateFilter, SqlError};

// ── Auth ─────────────────────────────────────────────────────────

/// Single shared password, any user name.
#[derive(Debug)]
pub struct RatebookAuthSource {
    password: String,
}

impl RatebookAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for RatebookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!("login attempt user={:?}", login.user());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

pub struct RatebookHandler {
    engine: Arc<Engine>,
    query_parser: Arc<RatebookQueryParser>,
    /// COPY reads and writes sheets only below this directory.
    sheet_dir: PathBuf,
}

impl RatebookHandler {
    pub fn new(engine: Arc<Engine>, sheet_dir: PathBuf) -> Self {
        Self {
            engine,
            query_parser: Arc::new(RatebookQueryParser),
            sheet_dir,
        }
    }

    /// Parse and run one statement, recording query count and latency.
    async fn run(&self, query: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd, format).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command, format: &Format) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRate { rate } => {
                engine.create_rate(rate).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::BatchInsertRates { rates } => {
                // each row is its own atomic create
                let count = rates.len();
                for rate in rates {
                    engine.create_rate(rate).await.map_err(engine_err)?;
                }
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::UpdateRate { id, rate } => {
                engine.update_rate(id, rate).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CloseRate { id, book_to } => {
                engine.close_rate(id, book_to).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteRate { id } => {
                engine.delete_rate(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectRates { filter } => {
                let rates = match filter {
                    RateFilter::All => engine.list_rates().await,
                    RateFilter::Unit(unit_id) => engine.list_unit_rates(unit_id).await,
                    RateFilter::Id(id) => match engine.get_rate(id).await {
                        Ok(rate) => vec![rate],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    },
                };
                rates_response(&rates, format)
            }
            Command::SelectQuote {
                unit_id,
                arrival,
                departure,
                booking_date,
            } => {
                let total = engine
                    .quote(unit_id, arrival, departure, booking_date)
                    .await
                    .map_err(engine_err)?;

                let schema = Arc::new(quote_schema(format));
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&unit_id.to_string())?;
                encoder.encode_field(&arrival.to_string())?;
                encoder.encode_field(&departure.to_string())?;
                encoder.encode_field(&booking_date.to_string())?;
                encoder.encode_field(&total)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::ExportRates { path } => {
                let path = sheet::resolve_in(&self.sheet_dir, &path).map_err(sheet_err)?;
                let count = sheet::export_file(engine, &path).await.map_err(sheet_err)?;
                Ok(Response::Execution(Tag::new("COPY").with_rows(count)))
            }
            Command::ImportRates { path } => {
                let path = sheet::resolve_in(&self.sheet_dir, &path).map_err(sheet_err)?;
                let count = sheet::import_file(engine, &path).await.map_err(sheet_err)?;
                Ok(Response::Execution(Tag::new("COPY").with_rows(count)))
            }
        }
    }
}

fn rates_response(rates: &[Rate], format: &Format) -> PgWireResult<Response> {
    let schema = Arc::new(rates_schema(format));
    let rows: Vec<PgWireResult<_>> = rates
        .iter()
        .map(|rate| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&rate.id.to_string())?;
            encoder.encode_field(&rate.unit_id.to_string())?;
            encoder.encode_field(&rate.stay.from.to_string())?;
            encoder.encode_field(&rate.stay.to.to_string())?;
            encoder.encode_field(&i64::from(rate.nights))?;
            encoder.encode_field(&rate.value)?;
            encoder.encode_field(&rate.booking.opens().to_string())?;
            encoder.encode_field(&rate.booking.closes().map(|d| d.to_string()))?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn field(name: &str, ty: Type, idx: usize, format: &Format) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, format.format_for(idx))
}

fn rates_schema(format: &Format) -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR, 0, format),
        field("unit_id", Type::VARCHAR, 1, format),
        field("stay_from", Type::VARCHAR, 2, format),
        field("stay_to", Type::VARCHAR, 3, format),
        field("nights", Type::INT8, 4, format),
        field("value", Type::FLOAT8, 5, format),
        field("book_from", Type::VARCHAR, 6, format),
        field("book_to", Type::VARCHAR, 7, format),
    ]
}

fn quote_schema(format: &Format) -> Vec<FieldInfo> {
    vec![
        field("unit_id", Type::VARCHAR, 0, format),
        field("arrival", Type::VARCHAR, 1, format),
        field("departure", Type::VARCHAR, 2, format),
        field("booking_date", Type::VARCHAR, 3, format),
        field("total", Type::FLOAT8, 4, format),
    ]
}

/// Result columns of a statement, judged from its text before parameters
/// are bound.
fn result_schema(stmt: &str, format: &Format) -> Vec<FieldInfo> {
    let upper = stmt.trim_start().to_uppercase();
    if !upper.starts_with("SELECT") {
        vec![]
    } else if upper.contains("QUOTE") {
        quote_schema(format)
    } else {
        rates_schema(format)
    }
}

#[async_trait]
impl SimpleQueryHandler for RatebookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(vec![self.run(query, &Format::UnifiedText).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RatebookQueryParser;

#[async_trait]
impl QueryParser for RatebookQueryParser {
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
        Ok(result_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for RatebookHandler {
    type Statement = String;
    type QueryParser = RatebookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
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
        self.run(&sql, &portal.result_column_format).await
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
            result_schema(&target.statement, &Format::UnifiedText),
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

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, portal.parameters.as_slice())
}

/// Replace `$1`, `$2`, ... with bound values (text format) in one pass over
/// the statement. Bound text is never rescanned, and placeholders inside
/// string literals are left as written.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;

    while let Some(c) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
        } else if c == '$' && !in_literal {
            let mut digits = String::new();
            while let Some(d) = chars.next_if(char::is_ascii_digit) {
                digits.push(d);
            }
            let index = digits.parse::<usize>().ok().and_then(|n| n.checked_sub(1));
            match index.and_then(|i| params.get(i)) {
                Some(Some(bytes)) => {
                    let text = String::from_utf8_lossy(bytes.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                Some(None) => out.push_str("NULL"),
                None => {
                    out.push('$');
                    out.push_str(&digits);
                }
            }
            continue;
        }
        out.push(c);
    }

    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RatebookFactory {
    handler: Arc<RatebookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RatebookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RatebookFactory {
    pub fn new(engine: Arc<Engine>, password: String, sheet_dir: PathBuf) -> Self {
        let auth_source = RatebookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RatebookHandler::new(engine, sheet_dir)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RatebookFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    sheet_dir: PathBuf,
) -> io::Result<()> {
    let factory = Arc::new(RatebookFactory::new(engine, password, sheet_dir));
    pgwire::tokio::process_socket(socket, None, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
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

fn sheet_err(e: SheetError) -> PgWireError {
    let code = match e {
        SheetError::Io(_) => "58030",
        SheetError::OutsideSheetDir(_) => "42501",
        _ => "P0001",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}
