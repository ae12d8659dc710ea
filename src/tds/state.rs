//! Connection lifecycle state machine.
//!
//! Every state owns a [`StateSpec`]: an optional entry action, an optional exit
//! action, and handlers for the events it accepts. Events a state does not
//! handle are ignored. The tables are built once and never mutated:
//! - the `lite` edition refuses NTLM and federated logins
//! - the `full` edition copies the lite entries and replaces the two login states
//!
//! Handlers never call each other. Each returns a [`Step`] telling
//! [`Connection::drive`](super::connection::Connection) what to do next, so
//! `transition_to` stays the only place where the state changes.

use std::fmt;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use once_cell::sync::Lazy;

use super::auth::token_scope;
use super::connection::{guarded, Connection};
use super::error::{codes, ConnectionError};
use super::protocol::{
    feature_id, packet_type, AttentionMessage, Encryption, FedAuthTokenMessage, Prelogin, SqlBatch, SspiMessage,
};
use super::token::{FeatureAck, FedAuthInfo, RoutingData};
use super::tls;

/// Upper bound on waiting for the server to acknowledge an ATTENTION.
const ATTENTION_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// States and events
// ============================================================================

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Initialized,
    Connecting,
    SentPrelogin,
    Rerouting,
    TransientFailureRetry,
    SentTlsNegotiation,
    SentLogin7Standard,
    SentLogin7Ntlm,
    SentLogin7FedAuth,
    LoggedInSendingInitialSql,
    LoggedIn,
    SentClientRequest,
    SentAttention,
    Final,
}

const STATE_COUNT: usize = 14;

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Initialized => "Initialized",
            State::Connecting => "Connecting",
            State::SentPrelogin => "SentPrelogin",
            State::Rerouting => "ReRouting",
            State::TransientFailureRetry => "TRANSIENT_FAILURE_RETRY",
            State::SentTlsNegotiation => "SentTLSSSLNegotiation",
            State::SentLogin7Standard => "SentLogin7WithStandardLogin",
            State::SentLogin7Ntlm => "SentLogin7WithNTLMLogin",
            State::SentLogin7FedAuth => "SentLogin7WithFedauth",
            State::LoggedInSendingInitialSql => "LoggedInSendingInitialSql",
            State::LoggedIn => "LoggedIn",
            State::SentClientRequest => "SentClientRequest",
            State::SentAttention => "SentAttention",
            State::Final => "Final",
        }
    }

    pub fn is_final(&self) -> bool {
        *self == State::Final
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Events delivered to the current state's handlers.
#[derive(Debug)]
pub enum Event {
    SocketError(ConnectionError),
    ConnectTimeout,
    SocketConnect,
    Message,
    Retry,
    RoutingChange(RoutingData),
    Reconnect,
    FeatureExtAck(Vec<FeatureAck>),
    FedAuthInfo(FedAuthInfo),
    Attention,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::SocketError(_) => "socketError",
            Event::ConnectTimeout => "connectTimeout",
            Event::SocketConnect => "socketConnect",
            Event::Message => "message",
            Event::Retry => "retry",
            Event::RoutingChange(_) => "routingChange",
            Event::Reconnect => "reconnect",
            Event::FeatureExtAck(_) => "featureExtAck",
            Event::FedAuthInfo(_) => "fedAuthInfo",
            Event::Attention => "attention",
        }
    }
}

/// What the driver does after an entry action or event handler returns.
#[derive(Debug)]
pub(crate) enum Step {
    /// Nothing left to do until the caller acts again.
    Idle,
    Transition(State),
    Dispatch(Event),
}

// ============================================================================
// State tables
// ============================================================================

pub(crate) type EnterFn = for<'a> fn(&'a mut Connection) -> BoxFuture<'a, Step>;
pub(crate) type EventFn = for<'a> fn(&'a mut Connection, Event) -> BoxFuture<'a, Step>;
pub(crate) type ExitFn = fn(&mut Connection, State);

/// Event handlers of one state.
#[derive(Clone, Copy, Default)]
pub(crate) struct Handlers {
    pub socket_error: Option<EventFn>,
    pub connect_timeout: Option<EventFn>,
    pub socket_connect: Option<EventFn>,
    pub message: Option<EventFn>,
    pub retry: Option<EventFn>,
    pub routing_change: Option<EventFn>,
    pub reconnect: Option<EventFn>,
    pub feature_ext_ack: Option<EventFn>,
    pub fed_auth_info: Option<EventFn>,
    pub attention: Option<EventFn>,
}

impl Handlers {
    /// Socket errors and connect timeouts both end the connection.
    fn fatal() -> Self {
        Self {
            socket_error: Some(on_fatal),
            connect_timeout: Some(on_fatal),
            ..Self::default()
        }
    }
}

/// Entry action, exit action and event handlers of one state.
#[derive(Clone, Copy, Default)]
pub(crate) struct StateSpec {
    pub enter: Option<EnterFn>,
    pub exit: Option<ExitFn>,
    pub on: Handlers,
}

impl StateSpec {
    pub fn handler(&self, event: &Event) -> Option<EventFn> {
        match event {
            Event::SocketError(_) => self.on.socket_error,
            Event::ConnectTimeout => self.on.connect_timeout,
            Event::SocketConnect => self.on.socket_connect,
            Event::Message => self.on.message,
            Event::Retry => self.on.retry,
            Event::RoutingChange(_) => self.on.routing_change,
            Event::Reconnect => self.on.reconnect,
            Event::FeatureExtAck(_) => self.on.feature_ext_ack,
            Event::FedAuthInfo(_) => self.on.fed_auth_info,
            Event::Attention => self.on.attention,
        }
    }
}

/// Which login flavours a table supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Edition {
    /// Standard logins only.
    Lite,
    #[default]
    Full,
}

/// Immutable map from every state to its entry, exit and event handlers.
pub(crate) struct StateTable {
    specs: [StateSpec; STATE_COUNT],
}

impl StateTable {
    pub fn get(&self, state: State) -> &StateSpec {
        &self.specs[state as usize]
    }

    pub fn for_edition(edition: Edition) -> &'static StateTable {
        match edition {
            Edition::Lite => Lazy::force(&LITE),
            Edition::Full => Lazy::force(&FULL),
        }
    }
}

static LITE: Lazy<StateTable> = Lazy::new(|| {
    let mut specs = [StateSpec::default(); STATE_COUNT];
    let fatal = Handlers::fatal();

    specs[State::Initialized as usize] = StateSpec {
        on: fatal,
        ..StateSpec::default()
    };
    specs[State::Connecting as usize] = StateSpec {
        enter: Some(enter_connecting),
        exit: None,
        on: Handlers {
            socket_connect: Some(on_socket_connect),
            ..fatal
        },
    };
    specs[State::SentPrelogin as usize] = StateSpec {
        enter: Some(enter_sent_prelogin),
        exit: None,
        on: fatal,
    };
    specs[State::Rerouting as usize] = StateSpec {
        enter: Some(enter_rerouting),
        exit: None,
        on: Handlers {
            reconnect: Some(on_reconnect),
            ..fatal
        },
    };
    specs[State::TransientFailureRetry as usize] = StateSpec {
        enter: Some(enter_transient_failure_retry),
        exit: None,
        on: Handlers {
            retry: Some(on_retry),
            ..fatal
        },
    };
    specs[State::SentTlsNegotiation as usize] = StateSpec {
        enter: Some(enter_sent_tls_negotiation),
        exit: None,
        on: fatal,
    };
    specs[State::SentLogin7Standard as usize] = StateSpec {
        enter: Some(enter_sent_login7),
        exit: None,
        on: Handlers {
            message: Some(on_standard_login_message),
            routing_change: Some(on_routing_change),
            ..fatal
        },
    };
    specs[State::SentLogin7Ntlm as usize] = StateSpec {
        enter: Some(refuse_authentication_kind),
        exit: None,
        on: fatal,
    };
    specs[State::SentLogin7FedAuth as usize] = StateSpec {
        enter: Some(refuse_authentication_kind),
        exit: None,
        on: fatal,
    };
    specs[State::LoggedInSendingInitialSql as usize] = StateSpec {
        enter: Some(enter_sending_initial_sql),
        exit: None,
        on: Handlers {
            message: Some(on_back_to_logged_in),
            ..fatal
        },
    };
    specs[State::LoggedIn as usize] = StateSpec {
        enter: Some(enter_logged_in),
        exit: None,
        on: fatal,
    };
    specs[State::SentClientRequest as usize] = StateSpec {
        enter: Some(enter_sent_client_request),
        exit: Some(clear_deadline),
        on: Handlers {
            message: Some(on_back_to_logged_in),
            attention: Some(on_attention),
            ..fatal
        },
    };
    specs[State::SentAttention as usize] = StateSpec {
        enter: Some(enter_sent_attention),
        exit: Some(clear_deadline),
        on: Handlers {
            message: Some(on_back_to_logged_in),
            ..fatal
        },
    };
    specs[State::Final as usize] = StateSpec {
        enter: Some(enter_final),
        ..StateSpec::default()
    };

    StateTable { specs }
});

static FULL: Lazy<StateTable> = Lazy::new(|| {
    let mut specs = LITE.specs;
    let fatal = Handlers::fatal();

    specs[State::SentLogin7Ntlm as usize] = StateSpec {
        enter: Some(enter_sent_login7),
        exit: None,
        on: Handlers {
            message: Some(on_ntlm_login_message),
            routing_change: Some(on_routing_change),
            ..fatal
        },
    };
    specs[State::SentLogin7FedAuth as usize] = StateSpec {
        enter: Some(enter_sent_login7),
        exit: None,
        on: Handlers {
            message: Some(on_fed_auth_login_message),
            routing_change: Some(on_routing_change),
            feature_ext_ack: Some(on_feature_ext_ack),
            fed_auth_info: Some(on_fed_auth_info),
            ..fatal
        },
    };

    StateTable { specs }
});

/// Unwrap an I/O result inside a handler, dispatching the failure event otherwise.
macro_rules! step_try {
    ($e:expr) => {
        match $e {
            Ok(value) => value,
            Err(event) => return Step::Dispatch(event),
        }
    };
}

// ============================================================================
// Shared handlers
// ============================================================================

fn on_fatal(conn: &mut Connection, event: Event) -> BoxFuture<'_, Step> {
    async move {
        let err = match event {
            Event::SocketError(err) => err,
            _ => conn.connect_timeout_error(),
        };
        conn.surface_error(err);
        Step::Transition(State::Final)
    }
    .boxed()
}

fn on_back_to_logged_in(_conn: &mut Connection, _event: Event) -> BoxFuture<'_, Step> {
    async { Step::Transition(State::LoggedIn) }.boxed()
}

fn on_routing_change(conn: &mut Connection, event: Event) -> BoxFuture<'_, Step> {
    async move {
        if let Event::RoutingChange(routing) = event {
            conn.routing_data = Some(routing);
        }
        Step::Transition(State::Rerouting)
    }
    .boxed()
}

fn clear_deadline(conn: &mut Connection, _next: State) {
    conn.deadline = None;
}

/// Login acknowledged: reroute when the server asked for it, otherwise finish logging in.
fn acknowledged_login(conn: &mut Connection) -> Option<Step> {
    conn.login_ack.as_ref()?;
    Some(match conn.pending_routing.take() {
        Some(routing) => Step::Dispatch(Event::RoutingChange(routing)),
        None => Step::Transition(State::LoggedInSendingInitialSql),
    })
}

/// No acknowledgement: retry a transient login error, otherwise fail.
fn failed_login(conn: &mut Connection) -> Step {
    match conn.login_error.take() {
        Some(err) if err.is_transient() => {
            if conn.retry_count < conn.config.max_retries_on_transient_errors {
                info!("Initiating retry on transient error: {}", err.message());
                conn.login_error = Some(err);
                return Step::Transition(State::TransientFailureRetry);
            }
            warn!("Giving up after {} transient login failures", conn.retry_count);
            conn.surface_error(err.with_transient(false));
            Step::Transition(State::Final)
        }
        Some(err) => {
            conn.surface_error(err);
            Step::Transition(State::Final)
        }
        None => {
            conn.surface_error(ConnectionError::login_failed());
            Step::Transition(State::Final)
        }
    }
}

// ============================================================================
// Handshake
// ============================================================================

fn enter_connecting(conn: &mut Connection) -> BoxFuture<'_, Step> {
    async move {
        conn.reset_login_state();
        conn.deadline = Some(tokio::time::Instant::now() + conn.config.connect_timeout());

        let (host, port) = conn.target();
        let connector = conn.connector.clone();
        match guarded(&conn.cancel, conn.deadline, connector.connect(&host, port)).await {
            Ok(Ok(stream)) => {
                conn.attach(stream);
                Step::Dispatch(Event::SocketConnect)
            }
            Ok(Err(err)) => Step::Dispatch(Event::SocketError(err)),
            Err(interrupt) => Step::Dispatch(conn.interrupt_event(interrupt)),
        }
    }
    .boxed()
}

fn on_socket_connect(_conn: &mut Connection, _event: Event) -> BoxFuture<'_, Step> {
    async { Step::Transition(State::SentPrelogin) }.boxed()
}

fn enter_sent_prelogin(conn: &mut Connection) -> BoxFuture<'_, Step> {
    async move {
        let requested = if conn.config.encrypt {
            Encryption::On
        } else {
            Encryption::NotSupported
        };
        let mut prelogin = Prelogin::new(requested).with_trace_id();
        prelogin.instance = conn.config.instance_name.clone().unwrap_or_default();
        prelogin.fed_auth_required = conn.config.authentication.is_federated();
        step_try!(conn.send(&prelogin).await);

        let message = step_try!(conn.read_message().await);
        if message.message_type != packet_type::TABULAR_RESULT {
            let err = ConnectionError::protocol(format!(
                "Unexpected message type 0x{:02x} in response to PRELOGIN",
                message.message_type
            ));
            return Step::Dispatch(Event::SocketError(err));
        }
        let response = step_try!(Prelogin::decode(&message.payload).map_err(Event::SocketError));
        let (major, minor, build, sub_build) = response.version;
        debug!(
            "PRELOGIN response: server version {}.{}.{}.{}, encryption {:?}",
            major, minor, build, sub_build, response.encryption
        );
        conn.fed_auth_echo = response.fed_auth_required;

        match (conn.config.encrypt, response.encryption) {
            (true, Encryption::On | Encryption::Required) => Step::Transition(State::SentTlsNegotiation),
            (true, _) => {
                conn.surface_error(ConnectionError::transport(
                    codes::EENCRYPT,
                    "Server does not support encryption, set 'encrypt' config option to false.",
                ));
                Step::Transition(State::Final)
            }
            (false, Encryption::On | Encryption::Required) => {
                conn.surface_error(ConnectionError::transport(
                    codes::EENCRYPT,
                    "Server requires encryption, set 'encrypt' config option to true.",
                ));
                Step::Transition(State::Final)
            }
            (false, _) => send_login7(conn).await,
        }
    }
    .boxed()
}

fn enter_sent_tls_negotiation(conn: &mut Connection) -> BoxFuture<'_, Step> {
    async move {
        let Some(io) = conn.io.take() else {
            return Step::Dispatch(Event::SocketError(Connection::closed_error()));
        };
        if io.has_buffered_input() {
            let err = ConnectionError::protocol("Unexpected data after the PRELOGIN response");
            return Step::Dispatch(Event::SocketError(err));
        }
        let packet_size = io.packet_size();
        let host = conn.config.server.clone();
        let trust = conn.config.trust_server_certificate;

        match guarded(&conn.cancel, conn.deadline, tls::upgrade(io.into_inner(), &host, trust)).await {
            Ok(Ok(stream)) => {
                conn.attach(stream);
                if let Some(io) = conn.io.as_mut() {
                    io.set_packet_size(packet_size);
                }
            }
            Ok(Err(err)) => return Step::Dispatch(Event::SocketError(err)),
            Err(interrupt) => return Step::Dispatch(conn.interrupt_event(interrupt)),
        }
        send_login7(conn).await
    }
    .boxed()
}

async fn send_login7(conn: &mut Connection) -> Step {
    let login = conn.login7();
    step_try!(conn.send(&login).await);
    Step::Transition(conn.login_state())
}

fn enter_rerouting(conn: &mut Connection) -> BoxFuture<'_, Step> {
    async move {
        if let Some(routing) = &conn.routing_data {
            info!("Rerouting to {}:{}", routing.host, routing.port);
        }
        conn.close_stream().await;
        Step::Dispatch(Event::Reconnect)
    }
    .boxed()
}

fn on_reconnect(_conn: &mut Connection, _event: Event) -> BoxFuture<'_, Step> {
    async { Step::Transition(State::Connecting) }.boxed()
}

fn enter_transient_failure_retry(conn: &mut Connection) -> BoxFuture<'_, Step> {
    async move {
        conn.retry_count += 1;
        conn.close_stream().await;
        let interval = conn.config.connection_retry_interval();
        debug!(
            "Retry {} of {} in {:?}",
            conn.retry_count, conn.config.max_retries_on_transient_errors, interval
        );
        match guarded(&conn.cancel, None, tokio::time::sleep(interval)).await {
            Ok(()) => Step::Dispatch(Event::Retry),
            Err(interrupt) => Step::Dispatch(conn.interrupt_event(interrupt)),
        }
    }
    .boxed()
}

fn on_retry(_conn: &mut Connection, _event: Event) -> BoxFuture<'_, Step> {
    async { Step::Transition(State::Connecting) }.boxed()
}

fn refuse_authentication_kind(conn: &mut Connection) -> BoxFuture<'_, Step> {
    async move {
        let err = ConnectionError::authentication(
            codes::EAUTHKIND,
            format!(
                "Authentication type {} is not supported by this client edition",
                conn.config.authentication.kind()
            ),
        );
        conn.surface_error(err);
        Step::Transition(State::Final)
    }
    .boxed()
}

// ============================================================================
// Login
// ============================================================================

/// Entry of all three login states: wait for the server's answer to LOGIN7.
fn enter_sent_login7(conn: &mut Connection) -> BoxFuture<'_, Step> {
    async move {
        step_try!(conn.read_login_message().await);
        Step::Dispatch(Event::Message)
    }
    .boxed()
}

fn on_standard_login_message(conn: &mut Connection, _event: Event) -> BoxFuture<'_, Step> {
    async move {
        if let Some(step) = acknowledged_login(conn) {
            return step;
        }
        failed_login(conn)
    }
    .boxed()
}

fn on_ntlm_login_message(conn: &mut Connection, _event: Event) -> BoxFuture<'_, Step> {
    async move {
        if let Some(step) = acknowledged_login(conn) {
            return step;
        }
        let Some(challenge) = conn.ntlm_challenge.take() else {
            return failed_login(conn);
        };

        let response = match conn.ntlm_response(&challenge) {
            Ok(response) => response,
            Err(err) => {
                conn.surface_error(err);
                return Step::Transition(State::Final);
            }
        };
        debug!("Answering NTLM challenge ({} bytes)", challenge.len());
        step_try!(conn.send(&SspiMessage { data: response }).await);
        step_try!(conn.read_login_message().await);
        Step::Dispatch(Event::Message)
    }
    .boxed()
}

fn on_fed_auth_login_message(conn: &mut Connection, _event: Event) -> BoxFuture<'_, Step> {
    async move {
        if let Some(acks) = conn.pending_feature_acks.take() {
            return Step::Dispatch(Event::FeatureExtAck(acks));
        }
        if conn.login_ack.is_some() && !conn.fed_auth_acknowledged {
            debug!("Login acknowledged without a FEDAUTH feature ack");
        }
        if let Some(step) = acknowledged_login(conn) {
            return step;
        }
        match conn.fed_auth_info.take() {
            Some(info) if info.sts_url.is_some() && info.spn.is_some() => Step::Dispatch(Event::FedAuthInfo(info)),
            _ => failed_login(conn),
        }
    }
    .boxed()
}

fn on_feature_ext_ack(conn: &mut Connection, event: Event) -> BoxFuture<'_, Step> {
    async move {
        let Event::FeatureExtAck(acks) = event else {
            return Step::Dispatch(Event::Message);
        };
        for ack in acks.iter().filter(|ack| ack.feature_id == feature_id::FEDAUTH) {
            if !ack.data.is_empty() {
                let err = ConnectionError::protocol(
                    "Federated authentication feature extension ack includes extra data",
                );
                return Step::Dispatch(Event::SocketError(err));
            }
            conn.fed_auth_acknowledged = true;
        }
        Step::Dispatch(Event::Message)
    }
    .boxed()
}

fn on_fed_auth_info(conn: &mut Connection, event: Event) -> BoxFuture<'_, Step> {
    async move {
        let Event::FedAuthInfo(FedAuthInfo {
            sts_url: Some(sts_url),
            spn: Some(spn),
        }) = event
        else {
            return failed_login(conn);
        };
        let Some(strategy) = conn.config.authentication.credential_strategy() else {
            conn.surface_error(ConnectionError::authentication(
                codes::EAUTHKIND,
                format!(
                    "Authentication type {} cannot acquire a federated token",
                    conn.config.authentication.kind()
                ),
            ));
            return Step::Transition(State::Final);
        };
        let Some(provider) = conn.token_provider.clone() else {
            conn.surface_error(ConnectionError::authentication(
                codes::EFEDAUTH,
                "No token provider configured for federated authentication",
            ));
            return Step::Transition(State::Final);
        };

        let scope = token_scope(&spn);
        debug!(
            "Requesting {} token for {} (STS {})",
            strategy.name(),
            scope,
            sts_url
        );
        let token = match guarded(&conn.cancel, conn.deadline, provider.get_token(&strategy, &scope)).await {
            Ok(Ok(token)) => token,
            Ok(Err(cause)) => {
                let primary = ConnectionError::authentication(
                    codes::EFEDAUTH,
                    "Security token could not be authenticated or authorized.",
                );
                conn.surface_error(ConnectionError::aggregate(primary, cause).with_transient(false));
                return Step::Transition(State::Final);
            }
            Err(interrupt) => return Step::Dispatch(conn.interrupt_event(interrupt)),
        };

        step_try!(conn.send(&FedAuthTokenMessage { token }).await);
        step_try!(conn.read_login_message().await);
        Step::Dispatch(Event::Message)
    }
    .boxed()
}

// ============================================================================
// Logged in
// ============================================================================

fn enter_sending_initial_sql(conn: &mut Connection) -> BoxFuture<'_, Step> {
    async move {
        let batch = SqlBatch {
            sql: conn.config.initial_sql(),
            transaction_descriptor: conn.transaction_descriptor,
        };
        step_try!(conn.send(&batch).await);
        let message = step_try!(conn.read_message().await);
        match conn.process_response(&message) {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!("Initial SQL reported an error: {}", err),
            Err(err) => return Step::Dispatch(Event::SocketError(err)),
        }
        Step::Dispatch(Event::Message)
    }
    .boxed()
}

fn enter_logged_in(conn: &mut Connection) -> BoxFuture<'_, Step> {
    async move {
        conn.deadline = None;
        conn.emit_connected();
        Step::Idle
    }
    .boxed()
}

fn enter_sent_client_request(conn: &mut Connection) -> BoxFuture<'_, Step> {
    async move {
        let Some((message_type, payload)) = conn.request.as_ref().map(|r| (r.message_type, r.payload.clone())) else {
            return Step::Transition(State::LoggedIn);
        };
        conn.deadline = conn
            .config
            .request_timeout()
            .map(|timeout| tokio::time::Instant::now() + timeout);

        match conn.write(message_type, &payload).await {
            Ok(()) => {}
            Err(Event::ConnectTimeout) => return conn.request_timed_out(),
            Err(event) => return Step::Dispatch(event),
        }
        let message = match conn.read_message().await {
            Ok(message) => message,
            Err(Event::ConnectTimeout) => return conn.request_timed_out(),
            Err(event) => return Step::Dispatch(event),
        };
        match conn.process_response(&message) {
            Ok(result) => {
                conn.complete_request(result);
                Step::Dispatch(Event::Message)
            }
            Err(err) => Step::Dispatch(Event::SocketError(err)),
        }
    }
    .boxed()
}

fn on_attention(_conn: &mut Connection, _event: Event) -> BoxFuture<'_, Step> {
    async { Step::Transition(State::SentAttention) }.boxed()
}

fn enter_sent_attention(conn: &mut Connection) -> BoxFuture<'_, Step> {
    async move {
        conn.deadline = Some(tokio::time::Instant::now() + ATTENTION_TIMEOUT);
        step_try!(conn.send(&AttentionMessage).await);
        loop {
            let message = step_try!(conn.read_message().await);
            if conn.is_attention_ack(&message) {
                break;
            }
            trace!("Discarding {} bytes while awaiting attention ack", message.payload.len());
        }
        debug!("Attention acknowledged");
        Step::Dispatch(Event::Message)
    }
    .boxed()
}

fn enter_final(conn: &mut Connection) -> BoxFuture<'_, Step> {
    async move {
        conn.deadline = None;
        conn.cancel.cancel();
        conn.close_stream().await;
        conn.surface_error(ConnectionError::transport(
            codes::ECLOSED,
            "Connection closed before login completed",
        ));
        Step::Idle
    }
    .boxed()
}
