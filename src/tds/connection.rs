//! TDS connection.
//!
//! This module provides the connection type that handles:
//! - transport establishment through a pluggable [`Connector`]
//! - the PRELOGIN, TLS and LOGIN7 handshake, including NTLM and federated logins
//! - rerouting and transient-failure retries
//! - SQL batches and procedure calls, with ATTENTION on request timeout
//!
//! The handshake itself lives in the state tables of [`super::state`]. The
//! connection owns the data those handlers work on and runs the loop that
//! feeds their [`Step`]s back in.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Local;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::auth::{ntlm_negotiate, Authentication, NtlmResponder, TokenProvider};
use super::config::Config;
use super::decoder::{BuiltinDecoder, TextDecoder};
use super::error::{codes, ConnectionError, ConnectionResult, RequestError};
use super::message::{Message, MessageIo};
use super::protocol::{packet_type, FedAuthFeature, FrontendMessage, Login7, RpcRequest, SqlBatch};
use super::state::{Edition, Event, State, StateTable, Step};
use super::token::{
    Collation, ColumnValue, Done, EnvChange, FeatureAck, FedAuthInfo, LoginAck, ReturnValue, RoutingData, ServerMessage,
    SharedColumns, Token, TokenParser,
};
use super::transport::{BoxStream, Connector, TcpConnector};
use super::types::{EncodeOptions, LocalTimeZone, Parameter};

/// How long a closing connection waits for the stream shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Suspension guard
// ============================================================================

/// Why a guarded wait ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupt {
    Cancelled,
    Deadline,
}

/// Race `fut` against the cancellation token and an optional deadline.
pub(crate) async fn guarded<F: Future>(
    cancel: &CancellationToken,
    deadline: Option<Instant>,
    fut: F,
) -> Result<F::Output, Interrupt> {
    let expiry = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        _ = expiry => Err(Interrupt::Deadline),
        output = fut => Ok(output),
    }
}

// ============================================================================
// Request results
// ============================================================================

/// Rows of one result set together with their column metadata.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub columns: SharedColumns,
    pub rows: Vec<Vec<ColumnValue>>,
}

/// Everything the server returned for one batch or procedure call.
#[derive(Debug, Clone, Default)]
pub struct RequestOutcome {
    pub result_sets: Vec<ResultSet>,
    /// Sum of the DONE row counts, `None` if no DONE carried one
    pub rows_affected: Option<u64>,
    pub return_status: Option<i32>,
    pub output_parameters: Vec<ReturnValue>,
    /// INFO messages (PRINT output, warnings)
    pub messages: Vec<ServerMessage>,
}

impl RequestOutcome {
    /// Rows of all result sets in order.
    pub fn rows(&self) -> impl Iterator<Item = &Vec<ColumnValue>> {
        self.result_sets.iter().flat_map(|set| set.rows.iter())
    }
}

/// The request currently owned by `SentClientRequest` / `SentAttention`.
pub(crate) struct PendingRequest {
    pub message_type: u8,
    pub payload: Bytes,
    pub outcome: Option<Result<RequestOutcome, RequestError>>,
}

// ============================================================================
// Builder
// ============================================================================

/// Connection options beyond [`Config`]: transport and credential capabilities.
pub struct ConnectionBuilder {
    config: Config,
    connector: Arc<dyn Connector>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    ntlm_responder: Option<Arc<dyn NtlmResponder>>,
    decoder: Arc<dyn TextDecoder>,
    edition: Edition,
    cancel: CancellationToken,
}

impl ConnectionBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            connector: Arc::new(TcpConnector),
            token_provider: None,
            ntlm_responder: None,
            decoder: Arc::new(BuiltinDecoder),
            edition: Edition::Full,
            cancel: CancellationToken::new(),
        }
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn ntlm_responder(mut self, responder: Arc<dyn NtlmResponder>) -> Self {
        self.ntlm_responder = Some(responder);
        self
    }

    pub fn text_decoder(mut self, decoder: Arc<dyn TextDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn edition(mut self, edition: Edition) -> Self {
        self.edition = edition;
        self
    }

    /// Cancelling this token closes the connection at its next suspension point.
    pub fn cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the handshake and return a logged-in connection.
    pub async fn connect(self) -> ConnectionResult<Connection> {
        self.config.validate()?;
        let (outcome_tx, mut outcome_rx) = oneshot::channel();
        let mut conn = Connection::new(self, outcome_tx);
        conn.drive(Step::Transition(State::Connecting)).await;

        match outcome_rx.try_recv() {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                // A handler stopped on an event its state ignores
                let err = ConnectionError::protocol(format!("Handshake stalled in state {}", conn.state));
                conn.connect_outcome = None;
                conn.close().await;
                Err(err)
            }
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A TDS connection.
pub struct Connection {
    pub(crate) state: State,
    table: &'static StateTable,
    pub(crate) config: Config,
    pub(crate) io: Option<MessageIo<BoxStream>>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) token_provider: Option<Arc<dyn TokenProvider>>,
    pub(crate) ntlm_responder: Option<Arc<dyn NtlmResponder>>,
    decoder: Arc<dyn TextDecoder>,

    /// Pending login error, carrying its transience
    pub(crate) login_error: Option<ConnectionError>,
    pub(crate) login_ack: Option<LoginAck>,
    pub(crate) fed_auth_info: Option<FedAuthInfo>,
    /// Server's FEDAUTHREQUIRED answer, echoed in LOGIN7
    pub(crate) fed_auth_echo: bool,
    pub(crate) fed_auth_acknowledged: bool,
    pub(crate) pending_feature_acks: Option<Vec<FeatureAck>>,
    pub(crate) ntlm_challenge: Option<Bytes>,
    /// Redirect target of the next connect
    pub(crate) routing_data: Option<RoutingData>,
    /// Routing received during the current login
    pub(crate) pending_routing: Option<RoutingData>,
    pub(crate) retry_count: u32,

    database: Option<String>,
    language: Option<String>,
    collation: Option<Collation>,
    pub(crate) transaction_descriptor: u64,

    connect_outcome: Option<oneshot::Sender<ConnectionResult<()>>>,
    pub(crate) request: Option<PendingRequest>,
    pub(crate) cancel: CancellationToken,
    /// Deadline applied to every guarded wait
    pub(crate) deadline: Option<Instant>,

    #[cfg(test)]
    pub(crate) visited: Vec<State>,
}

impl Connection {
    /// Connect with the default TCP transport and no credential capabilities.
    pub async fn connect(config: Config) -> ConnectionResult<Self> {
        ConnectionBuilder::new(config).connect().await
    }

    pub fn builder(config: Config) -> ConnectionBuilder {
        ConnectionBuilder::new(config)
    }

    fn new(builder: ConnectionBuilder, connect_outcome: oneshot::Sender<ConnectionResult<()>>) -> Self {
        Self {
            state: State::Initialized,
            table: StateTable::for_edition(builder.edition),
            config: builder.config,
            io: None,
            connector: builder.connector,
            token_provider: builder.token_provider,
            ntlm_responder: builder.ntlm_responder,
            decoder: builder.decoder,
            login_error: None,
            login_ack: None,
            fed_auth_info: None,
            fed_auth_echo: false,
            fed_auth_acknowledged: false,
            pending_feature_acks: None,
            ntlm_challenge: None,
            routing_data: None,
            pending_routing: None,
            retry_count: 0,
            database: None,
            language: None,
            collation: None,
            transaction_descriptor: 0,
            connect_outcome: Some(connect_outcome),
            request: None,
            cancel: builder.cancel,
            deadline: None,
            #[cfg(test)]
            visited: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_logged_in(&self) -> bool {
        self.state == State::LoggedIn
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_final()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current database, as reported by the server.
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    pub fn collation(&self) -> Option<&Collation> {
        self.collation.as_ref()
    }

    pub fn packet_size(&self) -> Option<usize> {
        self.io.as_ref().map(|io| io.packet_size())
    }

    pub fn login_ack(&self) -> Option<&LoginAck> {
        self.login_ack.as_ref()
    }

    /// The server this connection was redirected to, if any.
    pub fn routing_data(&self) -> Option<&RoutingData> {
        self.routing_data.as_ref()
    }

    /// Transient-failure retries used by the handshake.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_descriptor != 0
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // ------------------------------------------------------------------
    // State machine plumbing
    // ------------------------------------------------------------------

    /// Run steps until a handler leaves nothing further to do.
    pub(crate) async fn drive(&mut self, mut step: Step) {
        loop {
            step = match step {
                Step::Idle => return,
                Step::Transition(next) => self.transition_to(next).await,
                Step::Dispatch(event) => self.dispatch(event).await,
            };
        }
    }

    /// Hand an event to the current state's handler.
    pub(crate) async fn dispatch(&mut self, event: Event) -> Step {
        let handler = self.table.get(self.state).handler(&event);
        match handler {
            Some(handler) => handler(self, event).await,
            None => {
                trace!("Event {} ignored in state {}", event.name(), self.state);
                Step::Idle
            }
        }
    }

    /// Exit the current state, switch, and run the new state's entry action.
    pub(crate) async fn transition_to(&mut self, next: State) -> Step {
        if self.state.is_final() {
            debug!("Ignoring transition to {} after Final", next);
            return Step::Idle;
        }
        let exit = self.table.get(self.state).exit;
        if let Some(exit) = exit {
            exit(self, next);
        }
        debug!("State change: {} -> {}", self.state, next);
        self.state = next;
        #[cfg(test)]
        self.visited.push(next);

        let enter = self.table.get(next).enter;
        match enter {
            Some(enter) => enter(self).await,
            None => Step::Idle,
        }
    }

    /// Report a fatal error through whichever channel is waiting, at most once.
    pub(crate) fn surface_error(&mut self, err: ConnectionError) {
        if let Some(tx) = self.connect_outcome.take() {
            warn!("Connection failed: {}", err);
            let _ = tx.send(Err(err));
            return;
        }
        match self.request.as_mut() {
            Some(request) if request.outcome.is_none() => {
                warn!("Request failed: {}", err);
                request.outcome = Some(Err(err.into()));
            }
            _ => debug!("No caller waiting for: {}", err),
        }
    }

    pub(crate) fn emit_connected(&mut self) {
        if let Some(tx) = self.connect_outcome.take() {
            info!("Logged in to {}", self.config.server);
            let _ = tx.send(Ok(()));
        }
    }

    pub(crate) fn interrupt_event(&self, interrupt: Interrupt) -> Event {
        match interrupt {
            Interrupt::Cancelled => {
                Event::SocketError(ConnectionError::transport(codes::ECANCEL, "Connection was cancelled"))
            }
            Interrupt::Deadline => Event::ConnectTimeout,
        }
    }

    pub(crate) fn connect_timeout_error(&self) -> ConnectionError {
        let (host, port) = self.target();
        ConnectionError::transport(
            codes::ETIMEOUT,
            format!(
                "Failed to connect to {}:{} in {}ms",
                host, port, self.config.connect_timeout
            ),
        )
    }

    pub(crate) fn closed_error() -> ConnectionError {
        ConnectionError::transport(codes::ECLOSED, "Connection is closed")
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Host and port of the next connect: the routing target if set.
    pub(crate) fn target(&self) -> (String, u16) {
        match &self.routing_data {
            Some(routing) => (routing.host.clone(), routing.port),
            None => (self.config.server.clone(), self.config.port),
        }
    }

    pub(crate) fn attach(&mut self, stream: BoxStream) {
        self.io = Some(MessageIo::new(stream));
    }

    pub(crate) async fn close_stream(&mut self) {
        if let Some(mut io) = self.io.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, io.shutdown()).await {
                Ok(Ok(())) => trace!("Stream shut down"),
                Ok(Err(e)) => trace!("Stream shutdown failed: {}", e),
                Err(_) => trace!("Stream shutdown timed out"),
            }
        }
    }

    pub(crate) async fn write(&mut self, message_type: u8, payload: &[u8]) -> Result<(), Event> {
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| Event::SocketError(Self::closed_error()))?;
        match guarded(&self.cancel, self.deadline, io.write_message(message_type, payload)).await {
            Ok(result) => result.map_err(Event::SocketError),
            Err(interrupt) => Err(self.interrupt_event(interrupt)),
        }
    }

    pub(crate) async fn send<M: FrontendMessage + Sync>(&mut self, msg: &M) -> Result<(), Event> {
        let payload = msg.encode();
        self.write(msg.message_type(), &payload).await
    }

    pub(crate) async fn read_message(&mut self) -> Result<Message, Event> {
        let io = self
            .io
            .as_mut()
            .ok_or_else(|| Event::SocketError(Self::closed_error()))?;
        match guarded(&self.cancel, self.deadline, io.read_message()).await {
            Ok(result) => result.map_err(Event::SocketError),
            Err(interrupt) => Err(self.interrupt_event(interrupt)),
        }
    }

    // ------------------------------------------------------------------
    // Login
    // ------------------------------------------------------------------

    /// Forget everything learned during the previous connect attempt.
    pub(crate) fn reset_login_state(&mut self) {
        self.login_error = None;
        self.login_ack = None;
        self.fed_auth_info = None;
        self.fed_auth_echo = false;
        self.fed_auth_acknowledged = false;
        self.pending_feature_acks = None;
        self.ntlm_challenge = None;
        self.pending_routing = None;
    }

    /// LOGIN7 for the configured authentication.
    pub(crate) fn login7(&self) -> Login7 {
        let hostname = client_hostname();
        let mut login = Login7::new(self.config.packet_size);
        login.hostname = hostname.clone();
        login.app_name = self
            .config
            .app_name
            .clone()
            .unwrap_or_else(|| "tdskit".to_string());
        login.server_name = self.config.server.clone();
        login.language = self.config.language.clone();
        login.database = self.config.database.clone().unwrap_or_default();
        // Minutes west of UTC
        login.client_time_zone = -(Local::now().offset().local_minus_utc() / 60);

        match &self.config.authentication {
            Authentication::Default { user_name, password } => {
                login.username = user_name.clone();
                login.password = password.clone();
            }
            Authentication::Ntlm { domain, .. } => {
                login = login.with_sspi(ntlm_negotiate(domain, &hostname));
            }
            federated => {
                login.fed_auth = federated.fed_auth_workflow().map(|workflow| FedAuthFeature {
                    workflow,
                    echo: self.fed_auth_echo,
                });
            }
        }
        login
    }

    /// The state that awaits the server's answer to LOGIN7.
    pub(crate) fn login_state(&self) -> State {
        match &self.config.authentication {
            Authentication::Default { .. } => State::SentLogin7Standard,
            Authentication::Ntlm { .. } => State::SentLogin7Ntlm,
            _ => State::SentLogin7FedAuth,
        }
    }

    /// Read one login response and record what it carried.
    pub(crate) async fn read_login_message(&mut self) -> Result<(), Event> {
        let message = self.read_message().await?;
        self.absorb_login_message(&message).map_err(Event::SocketError)
    }

    fn absorb_login_message(&mut self, message: &Message) -> ConnectionResult<()> {
        expect_tabular(message)?;
        let mut parser = TokenParser::new(message.payload.clone(), self.decoder.clone());
        while let Some(token) = parser.next_token()? {
            match token {
                Token::LoginAck(ack) => {
                    debug!(
                        "Login acknowledged by {} {}.{}.{}",
                        ack.prog_name, ack.prog_version.0, ack.prog_version.1, ack.prog_version.2
                    );
                    self.login_ack = Some(ack);
                }
                Token::EnvChange(change) => self.apply_env_change(change),
                Token::Error(msg) => {
                    warn!("Login error {}: {}", msg.number, msg.message);
                    self.login_error = Some(msg.to_login_error());
                }
                Token::Info(msg) => debug!("Server message {}: {}", msg.number, msg.message),
                Token::Sspi(challenge) => self.ntlm_challenge = Some(challenge),
                Token::FedAuthInfo(info) => self.fed_auth_info = Some(info),
                Token::FeatureExtAck(acks) => self.pending_feature_acks = Some(acks),
                Token::Done(_) | Token::DoneProc(_) | Token::DoneInProc(_) => {}
                _ => trace!("Ignoring unexpected token during login"),
            }
        }
        Ok(())
    }

    /// The NTLM AUTHENTICATE message for a server challenge.
    pub(crate) fn ntlm_response(&self, challenge: &[u8]) -> ConnectionResult<Vec<u8>> {
        let Authentication::Ntlm {
            domain,
            user_name,
            password,
        } = &self.config.authentication
        else {
            return Err(ConnectionError::authentication(
                codes::EAUTHKIND,
                "NTLM challenge received for a non-NTLM login",
            ));
        };
        let responder = self
            .ntlm_responder
            .as_ref()
            .ok_or_else(|| ConnectionError::authentication(codes::ENTLM, "No NTLM responder configured"))?;
        responder
            .respond(challenge, domain, user_name, password)
            .map_err(|cause| {
                ConnectionError::aggregate(
                    ConnectionError::authentication(codes::ENTLM, "NTLM response could not be computed"),
                    cause,
                )
            })
    }

    fn apply_env_change(&mut self, change: EnvChange) {
        match change {
            EnvChange::Database { new, .. } => {
                debug!("Database changed to {}", new);
                self.database = Some(new);
            }
            EnvChange::Language { new, .. } => self.language = Some(new),
            EnvChange::Charset { new, .. } => trace!("Charset changed to {}", new),
            EnvChange::PacketSize { new, .. } => {
                if let Some(io) = self.io.as_mut() {
                    io.set_packet_size(new as usize);
                }
            }
            EnvChange::Collation(collation) => self.collation = collation,
            EnvChange::BeginTransaction { descriptor } => self.transaction_descriptor = descriptor,
            EnvChange::CommitTransaction | EnvChange::RollbackTransaction => self.transaction_descriptor = 0,
            EnvChange::ResetConnection => debug!("Connection reset acknowledged"),
            EnvChange::Routing(routing) => self.pending_routing = Some(routing),
            EnvChange::Other(kind) => trace!("Ignoring ENVCHANGE type {}", kind),
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Execute a SQL batch.
    pub async fn execute_batch(&mut self, sql: &str) -> Result<RequestOutcome, RequestError> {
        let batch = SqlBatch {
            sql: sql.to_string(),
            transaction_descriptor: self.transaction_descriptor,
        };
        self.request(batch.message_type(), batch.encode()).await
    }

    /// Call a stored procedure with positional or named parameters.
    pub async fn call_procedure(
        &mut self,
        procedure: &str,
        parameters: &[Parameter],
    ) -> Result<RequestOutcome, RequestError> {
        let rpc = RpcRequest {
            procedure,
            parameters,
            options: self.encode_options(),
            transaction_descriptor: self.transaction_descriptor,
        };
        let payload = rpc.encode();
        self.request(packet_type::RPC_REQUEST, payload).await
    }

    fn encode_options(&self) -> EncodeOptions {
        EncodeOptions {
            use_utc: self.config.use_utc,
            time_zone: self.config.local_time_zone().unwrap_or(LocalTimeZone::System),
        }
    }

    async fn request(&mut self, message_type: u8, payload: BytesMut) -> Result<RequestOutcome, RequestError> {
        if self.state != State::LoggedIn {
            return Err(RequestError::new(
                codes::EINVALIDSTATE,
                format!(
                    "Requests can only be made in the {} state, not the {} state",
                    State::LoggedIn,
                    self.state
                ),
            ));
        }
        self.request = Some(PendingRequest {
            message_type,
            payload: payload.freeze(),
            outcome: None,
        });
        self.drive(Step::Transition(State::SentClientRequest)).await;

        self.request
            .take()
            .and_then(|request| request.outcome)
            .unwrap_or_else(|| {
                Err(RequestError::new(
                    codes::ECLOSED,
                    "Connection closed before the request completed",
                ))
            })
    }

    /// Collect the tokens of a request response.
    ///
    /// The outer error is a malformed stream. The inner one is the first ERROR
    /// token the server sent.
    pub(crate) fn process_response(
        &mut self,
        message: &Message,
    ) -> ConnectionResult<Result<RequestOutcome, RequestError>> {
        expect_tabular(message)?;
        let mut outcome = RequestOutcome::default();
        let mut error: Option<RequestError> = None;
        let mut current: Option<ResultSet> = None;

        let mut parser = TokenParser::new(message.payload.clone(), self.decoder.clone());
        while let Some(token) = parser.next_token()? {
            match token {
                Token::ColMetadata(columns) => {
                    outcome.result_sets.extend(current.take());
                    current = Some(ResultSet {
                        columns,
                        rows: Vec::new(),
                    });
                }
                Token::Row(row) => match current.as_mut() {
                    Some(set) => set.rows.push(row),
                    None => return Err(ConnectionError::protocol("ROW token without column metadata")),
                },
                Token::Error(msg) => {
                    debug!("Server error {}: {}", msg.number, msg.message);
                    if error.is_none() {
                        error = Some(msg.into());
                    }
                }
                Token::Info(msg) => outcome.messages.push(msg),
                Token::EnvChange(change) => self.apply_env_change(change),
                Token::ReturnStatus(status) => outcome.return_status = Some(status),
                Token::ReturnValue(value) => outcome.output_parameters.push(value),
                Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) => {
                    if let Some(count) = done.row_count() {
                        *outcome.rows_affected.get_or_insert(0) += count;
                    }
                }
                Token::LoginAck(_)
                | Token::FedAuthInfo(_)
                | Token::FeatureExtAck(_)
                | Token::Sspi(_)
                | Token::Order(_) => {}
            }
        }
        outcome.result_sets.extend(current);

        Ok(match error {
            Some(err) => Err(err),
            None => Ok(outcome),
        })
    }

    pub(crate) fn complete_request(&mut self, result: Result<RequestOutcome, RequestError>) {
        if let Some(request) = self.request.as_mut() {
            if request.outcome.is_none() {
                request.outcome = Some(result);
            }
        }
    }

    /// Record the timeout as the request's result and cancel it on the server.
    pub(crate) fn request_timed_out(&mut self) -> Step {
        warn!("Request timed out after {}ms, sending attention", self.config.request_timeout);
        let err = RequestError::new(
            codes::ETIMEOUT,
            format!(
                "Timeout: Request failed to complete in {}ms",
                self.config.request_timeout
            ),
        );
        self.complete_request(Err(err));
        Step::Dispatch(Event::Attention)
    }

    /// Whether a message contains the DONE acknowledging an ATTENTION.
    ///
    /// Responses being drained may hold tokens the parser rejects. Those are
    /// only checked for a trailing acknowledgement.
    pub(crate) fn is_attention_ack(&mut self, message: &Message) -> bool {
        let mut acknowledged = false;
        let mut parser = TokenParser::new(message.payload.clone(), self.decoder.clone());
        loop {
            match parser.next_token() {
                Ok(Some(Token::EnvChange(change))) => self.apply_env_change(change),
                Ok(Some(token)) => {
                    if token.as_done().is_some_and(|done| done.is_attention_ack()) {
                        acknowledged = true;
                    }
                }
                Ok(None) => return acknowledged,
                Err(err) => {
                    debug!("Skipping unparseable response while draining: {}", err);
                    return acknowledged || Done::trails_attention_ack(&message.payload);
                }
            }
        }
    }

    /// Close the connection. Further requests fail.
    pub async fn close(&mut self) {
        if !self.state.is_final() {
            self.drive(Step::Transition(State::Final)).await;
        }
    }
}

fn expect_tabular(message: &Message) -> ConnectionResult<()> {
    if message.message_type != packet_type::TABULAR_RESULT {
        return Err(ConnectionError::protocol(format!(
            "Expected a tabular result, got message type 0x{:02x}",
            message.message_type
        )));
    }
    Ok(())
}

fn client_hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
impl Connection {
    /// A connection parked in `state` with no transport, plus its connect-outcome receiver.
    pub(crate) fn parked(
        state: State,
        edition: Edition,
    ) -> (Self, oneshot::Receiver<ConnectionResult<()>>) {
        let (tx, rx) = oneshot::channel();
        let builder = ConnectionBuilder::new(Config::new("db.example")).edition(edition);
        let mut conn = Connection::new(builder, tx);
        conn.state = state;
        (conn, rx)
    }
}
