//! Handshake and request scenarios against a scripted in-memory server.
//!
//! Each scenario queues one duplex stream per expected connect on a
//! [`ScriptedConnector`] and runs the server half of the conversation in a
//! spawned task, asserting on every client message it receives.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::auth::{Authentication, CredentialStrategy, NtlmResponder, TokenProvider};
use super::config::Config;
use super::connection::Connection;
use super::error::{codes, BoxError, ConnectionError, ConnectionResult, ErrorKind};
use super::message::{Message, MessageIo};
use super::protocol::{packet_type, string_to_utf16le, Encryption, FrontendMessage, Prelogin};
use super::state::{Edition, Event, State, Step};
use super::token::tests as tokens;
use super::token::{done_status, RoutingData};
use super::transport::{BoxStream, Connector};
use super::types::{Parameter, BIG_INT};

// ============================================================================
// Scripted transport
// ============================================================================

/// Hands out queued in-memory streams and refuses once they run out.
#[derive(Default)]
struct ScriptedConnector {
    streams: Mutex<VecDeque<DuplexStream>>,
    targets: Mutex<Vec<(String, u16)>>,
}

impl ScriptedConnector {
    fn targets(&self) -> Vec<(String, u16)> {
        self.targets.lock().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, host: &str, port: u16) -> ConnectionResult<BoxStream> {
        self.targets.lock().push((host.to_string(), port));
        let stream = self.streams.lock().pop_front();
        match stream {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(ConnectionError::transport(
                codes::ESOCKET,
                format!("Failed to connect to {}:{}", host, port),
            )),
        }
    }
}

/// Never completes a connect.
struct HangingConnector;

#[async_trait]
impl Connector for HangingConnector {
    async fn connect(&self, _host: &str, _port: u16) -> ConnectionResult<BoxStream> {
        std::future::pending().await
    }
}

/// Server half of one scripted stream.
struct Server {
    io: MessageIo<DuplexStream>,
}

impl Server {
    async fn expect(&mut self, message_type: u8) -> Message {
        let message = self.io.read_message().await.expect("client message");
        assert_eq!(
            message.message_type, message_type,
            "expected message type 0x{:02x}",
            message_type
        );
        message
    }

    async fn reply(&mut self, payload: BytesMut) {
        self.io
            .write_message(packet_type::TABULAR_RESULT, &payload)
            .await
            .expect("server write");
    }

    async fn prelogin(&mut self, encryption: Encryption) {
        self.expect(packet_type::PRELOGIN).await;
        self.reply(Prelogin::new(encryption).encode()).await;
    }

    async fn accept_login(&mut self) {
        let mut buf = BytesMut::new();
        tokens::login_ack(&mut buf);
        tokens::database_change(&mut buf, "sales");
        tokens::done(&mut buf, 0, 0);
        self.reply(buf).await;
    }

    async fn initial_sql(&mut self) {
        let batch = self.expect(packet_type::SQL_BATCH).await;
        assert!(batch.payload.len() > 22);
        let mut buf = BytesMut::new();
        tokens::done(&mut buf, 0, 0);
        self.reply(buf).await;
    }

    async fn reject_login(&mut self, number: i32, message: &str) {
        let mut buf = BytesMut::new();
        tokens::error(&mut buf, number, message);
        tokens::done(&mut buf, done_status::ERROR, 0);
        self.reply(buf).await;
    }

    /// PRELOGIN, LOGIN7 and the initial batch of a successful login.
    async fn login(&mut self) {
        self.prelogin(Encryption::NotSupported).await;
        self.expect(packet_type::LOGIN7).await;
        self.accept_login().await;
        self.initial_sql().await;
    }
}

/// Queue a stream on `connector` and run `script` as its server.
fn scripted<F, Fut>(connector: &ScriptedConnector, script: F) -> JoinHandle<()>
where
    F: FnOnce(Server) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (client, server) = tokio::io::duplex(64 * 1024);
    connector.streams.lock().push_back(client);
    tokio::spawn(script(Server {
        io: MessageIo::new(server),
    }))
}

/// A logged-in connection whose server continues with `script`.
async fn logged_in<F, Fut>(config: Config, script: F) -> (Connection, JoinHandle<()>)
where
    F: FnOnce(Server) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let connector = Arc::new(ScriptedConnector::default());
    let server = scripted(&connector, move |mut server| async move {
        server.login().await;
        script(server).await;
    });
    let conn = Connection::builder(config)
        .connector(connector)
        .connect()
        .await
        .expect("login");
    (conn, server)
}

fn config(authentication: Authentication) -> Config {
    let mut config = Config::new("db.example")
        .with_encrypt(false)
        .with_authentication(authentication);
    config.connect_timeout = 5_000;
    config.connection_retry_interval = 10;
    config
}

fn sql_login() -> Authentication {
    Authentication::Default {
        user_name: "sa".to_string(),
        password: "pw".to_string(),
    }
}

fn ntlm_login() -> Authentication {
    Authentication::Ntlm {
        domain: "CORP".to_string(),
        user_name: "svc".to_string(),
        password: "secret".to_string(),
    }
}

fn msi_login() -> Authentication {
    Authentication::AzureActiveDirectoryMsi { client_id: None }
}

// ============================================================================
// Credential capabilities
// ============================================================================

#[derive(Default)]
struct RecordingResponder {
    calls: Mutex<Vec<(Vec<u8>, String, String, String)>>,
}

impl NtlmResponder for RecordingResponder {
    fn respond(&self, challenge: &[u8], domain: &str, username: &str, password: &str) -> Result<Vec<u8>, BoxError> {
        self.calls.lock().push((
            challenge.to_vec(),
            domain.to_string(),
            username.to_string(),
            password.to_string(),
        ));
        Ok(b"NTLMSSP-AUTHENTICATE".to_vec())
    }
}

/// Returns `token`, or fails when it is `None`. Records every request.
#[derive(Default)]
struct StaticTokenProvider {
    token: Option<String>,
    requests: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, strategy: &CredentialStrategy, scope: &str) -> Result<String, BoxError> {
        self.requests
            .lock()
            .push((strategy.name().to_string(), scope.to_string()));
        match &self.token {
            Some(token) => Ok(token.clone()),
            None => Err("credential unavailable".into()),
        }
    }
}

const SPN: &str = "https://database.windows.net";
const STS_URL: &str = "https://login.example/tenant";

// ============================================================================
// Standard login
// ============================================================================

mod standard_login {
    use super::*;

    #[tokio::test]
    async fn test_login_reaches_logged_in() {
        let connector = Arc::new(ScriptedConnector::default());
        let server = scripted(&connector, |mut server| async move {
            server.prelogin(Encryption::NotSupported).await;
            let login = server.expect(packet_type::LOGIN7).await;
            let user = string_to_utf16le("sa");
            assert!(login.payload.windows(user.len()).any(|w| w == &user[..]));
            server.accept_login().await;
            server.initial_sql().await;
        });

        let conn = Connection::builder(config(sql_login()))
            .connector(connector.clone())
            .connect()
            .await
            .unwrap();
        server.await.unwrap();

        assert!(conn.is_logged_in());
        assert_eq!(conn.database(), Some("sales"));
        assert_eq!(
            conn.visited,
            vec![
                State::Connecting,
                State::SentPrelogin,
                State::SentLogin7Standard,
                State::LoggedInSendingInitialSql,
                State::LoggedIn,
            ]
        );
        assert_eq!(connector.targets(), vec![("db.example".to_string(), 1433)]);
    }

    #[tokio::test]
    async fn test_non_transient_login_error_is_final() {
        let connector = Arc::new(ScriptedConnector::default());
        let server = scripted(&connector, |mut server| async move {
            server.prelogin(Encryption::NotSupported).await;
            server.expect(packet_type::LOGIN7).await;
            server.reject_login(18456, "Login failed for user 'sa'.").await;
        });

        let err = match Connection::builder(config(sql_login()))
            .connector(connector.clone())
            .connect()
            .await
        {
            Ok(_) => panic!("login should fail"),
            Err(err) => err,
        };
        server.await.unwrap();

        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.code(), codes::ELOGIN);
        assert_eq!(err.message(), "Login failed for user 'sa'.");
        assert!(!err.is_transient());
        assert_eq!(connector.targets().len(), 1);
    }

    #[tokio::test]
    async fn test_no_ack_and_no_error_is_generic_login_failure() {
        let connector = Arc::new(ScriptedConnector::default());
        let server = scripted(&connector, |mut server| async move {
            server.prelogin(Encryption::NotSupported).await;
            server.expect(packet_type::LOGIN7).await;
            let mut buf = BytesMut::new();
            tokens::done(&mut buf, 0, 0);
            server.reply(buf).await;
        });

        let err = match Connection::builder(config(sql_login()))
            .connector(connector)
            .connect()
            .await
        {
            Ok(_) => panic!("login should fail"),
            Err(err) => err,
        };
        server.await.unwrap();
        assert_eq!(err.code(), codes::ELOGIN);
        assert_eq!(err.message(), "Login failed.");
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let connector = Arc::new(ScriptedConnector::default());
        let first = scripted(&connector, |mut server| async move {
            server.prelogin(Encryption::NotSupported).await;
            server.expect(packet_type::LOGIN7).await;
            server.reject_login(40613, "Database is not currently available.").await;
        });
        let second = scripted(&connector, |mut server| async move { server.login().await });

        let conn = Connection::builder(config(sql_login()))
            .connector(connector.clone())
            .connect()
            .await
            .unwrap();
        first.await.unwrap();
        second.await.unwrap();

        assert!(conn.is_logged_in());
        assert_eq!(conn.retry_count(), 1);
        assert_eq!(
            conn.visited,
            vec![
                State::Connecting,
                State::SentPrelogin,
                State::SentLogin7Standard,
                State::TransientFailureRetry,
                State::Connecting,
                State::SentPrelogin,
                State::SentLogin7Standard,
                State::LoggedInSendingInitialSql,
                State::LoggedIn,
            ]
        );
        assert_eq!(connector.targets().len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_fatal() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut servers = Vec::new();
        for _ in 0..2 {
            servers.push(scripted(&connector, |mut server| async move {
                server.prelogin(Encryption::NotSupported).await;
                server.expect(packet_type::LOGIN7).await;
                server.reject_login(40613, "Database is not currently available.").await;
            }));
        }
        let mut cfg = config(sql_login());
        cfg.max_retries_on_transient_errors = 1;

        let err = match Connection::builder(cfg).connector(connector.clone()).connect().await {
            Ok(_) => panic!("login should fail"),
            Err(err) => err,
        };
        for server in servers {
            server.await.unwrap();
        }

        assert_eq!(err.code(), codes::ELOGIN);
        assert!(!err.is_transient());
        assert_eq!(connector.targets().len(), 2);
    }

    #[tokio::test]
    async fn test_server_requiring_encryption_is_refused() {
        let connector = Arc::new(ScriptedConnector::default());
        let server = scripted(&connector, |mut server| async move {
            server.prelogin(Encryption::Required).await;
        });

        let err = match Connection::builder(config(sql_login()))
            .connector(connector)
            .connect()
            .await
        {
            Ok(_) => panic!("login should fail"),
            Err(err) => err,
        };
        server.await.unwrap();
        assert_eq!(err.code(), codes::EENCRYPT);
    }
}

// ============================================================================
// NTLM and routing
// ============================================================================

mod ntlm_login {
    use super::*;

    #[tokio::test]
    async fn test_challenge_is_answered_once() {
        let connector = Arc::new(ScriptedConnector::default());
        let server = scripted(&connector, |mut server| async move {
            server.prelogin(Encryption::NotSupported).await;
            let login = server.expect(packet_type::LOGIN7).await;
            assert!(login.payload.windows(8).any(|w| w == b"NTLMSSP\0"));

            let mut buf = BytesMut::new();
            tokens::sspi(&mut buf, b"CHALLENGE");
            server.reply(buf).await;

            let response = server.expect(packet_type::NTLM_AUTH).await;
            assert_eq!(&response.payload[..], b"NTLMSSP-AUTHENTICATE");
            server.accept_login().await;
            server.initial_sql().await;
        });
        let responder = Arc::new(RecordingResponder::default());

        let conn = Connection::builder(config(ntlm_login()))
            .connector(connector)
            .ntlm_responder(responder.clone())
            .connect()
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(
            conn.visited,
            vec![
                State::Connecting,
                State::SentPrelogin,
                State::SentLogin7Ntlm,
                State::LoggedInSendingInitialSql,
                State::LoggedIn,
            ]
        );
        let calls = responder.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0],
            (
                b"CHALLENGE".to_vec(),
                "CORP".to_string(),
                "svc".to_string(),
                "secret".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_challenge_message_keeps_the_state() {
        let (mut conn, _rx) = Connection::parked(State::SentLogin7Ntlm, Edition::Full);
        conn.config.authentication = ntlm_login();
        conn.ntlm_responder = Some(Arc::new(RecordingResponder::default()));
        conn.ntlm_challenge = Some(Bytes::from_static(b"CHALLENGE"));
        let (client, server_stream) = tokio::io::duplex(4096);
        conn.attach(Box::new(client));

        let server = tokio::spawn(async move {
            let mut server = Server {
                io: MessageIo::new(server_stream),
            };
            server.expect(packet_type::NTLM_AUTH).await;
            let mut buf = BytesMut::new();
            tokens::done(&mut buf, 0, 0);
            server.reply(buf).await;
            // Nothing else may arrive before the client goes away
            assert!(server.io.read_message().await.is_err());
        });

        let step = conn.dispatch(Event::Message).await;
        assert!(matches!(step, Step::Dispatch(Event::Message)));
        assert_eq!(conn.state(), State::SentLogin7Ntlm);
        assert!(conn.visited.is_empty());

        drop(conn);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_routing_reconnects_to_the_redirect_target() {
        let connector = Arc::new(ScriptedConnector::default());
        let first = scripted(&connector, |mut server| async move {
            server.prelogin(Encryption::NotSupported).await;
            server.expect(packet_type::LOGIN7).await;
            let mut buf = BytesMut::new();
            tokens::login_ack(&mut buf);
            tokens::routing(&mut buf, "redirect.example", 1500);
            tokens::done(&mut buf, 0, 0);
            server.reply(buf).await;
        });
        let second = scripted(&connector, |mut server| async move { server.login().await });

        let conn = Connection::builder(config(ntlm_login()))
            .connector(connector.clone())
            .ntlm_responder(Arc::new(RecordingResponder::default()))
            .connect()
            .await
            .unwrap();
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(
            conn.routing_data(),
            Some(&RoutingData {
                host: "redirect.example".to_string(),
                port: 1500,
            })
        );
        assert_eq!(
            connector.targets(),
            vec![
                ("db.example".to_string(), 1433),
                ("redirect.example".to_string(), 1500)
            ]
        );
        assert_eq!(
            conn.visited,
            vec![
                State::Connecting,
                State::SentPrelogin,
                State::SentLogin7Ntlm,
                State::Rerouting,
                State::Connecting,
                State::SentPrelogin,
                State::SentLogin7Ntlm,
                State::LoggedInSendingInitialSql,
                State::LoggedIn,
            ]
        );
    }

    #[tokio::test]
    async fn test_lite_edition_refuses_ntlm() {
        let connector = Arc::new(ScriptedConnector::default());
        let server = scripted(&connector, |mut server| async move {
            server.prelogin(Encryption::NotSupported).await;
            server.expect(packet_type::LOGIN7).await;
        });

        let err = match Connection::builder(config(ntlm_login()))
            .connector(connector)
            .edition(Edition::Lite)
            .connect()
            .await
        {
            Ok(_) => panic!("lite edition should refuse NTLM"),
            Err(err) => err,
        };
        server.await.unwrap();
        assert_eq!(err.code(), codes::EAUTHKIND);
        assert!(!err.is_transient());
    }
}

// ============================================================================
// Federated login
// ============================================================================

mod fed_auth_login {
    use super::*;

    /// LOGIN7 announcing FEDAUTH with the integrated workflow, then the terminator.
    const FEDAUTH_FEATURE: [u8; 8] = [0x02, 0x02, 0x00, 0x00, 0x00, 0x04, 0x02, 0xFF];

    fn send_fed_auth_info() -> BytesMut {
        let mut buf = BytesMut::new();
        tokens::fed_auth_info(&mut buf, STS_URL, SPN);
        tokens::done(&mut buf, 0, 0);
        buf
    }

    #[tokio::test]
    async fn test_provider_failure_is_a_single_aggregate_error() {
        let connector = Arc::new(ScriptedConnector::default());
        let server = scripted(&connector, |mut server| async move {
            server.prelogin(Encryption::NotSupported).await;
            let login = server.expect(packet_type::LOGIN7).await;
            assert!(login.payload.ends_with(&FEDAUTH_FEATURE));
            server.reply(send_fed_auth_info()).await;
        });
        let provider = Arc::new(StaticTokenProvider::default());

        let err = match Connection::builder(config(msi_login()))
            .connector(connector)
            .token_provider(provider.clone())
            .connect()
            .await
        {
            Ok(_) => panic!("login should fail"),
            Err(err) => err,
        };
        server.await.unwrap();

        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(err.code(), codes::EFEDAUTH);
        assert_eq!(err.message(), "Security token could not be authenticated or authorized.");
        assert!(err.is_aggregate());
        assert!(!err.is_transient());
        assert_eq!(err.cause().map(|c| c.to_string()).as_deref(), Some("credential unavailable"));
        assert_eq!(
            *provider.requests.lock(),
            vec![(
                "managed-identity".to_string(),
                "https://database.windows.net/.default".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn test_token_is_sent_and_login_completes() {
        let connector = Arc::new(ScriptedConnector::default());
        let server = scripted(&connector, |mut server| async move {
            server.prelogin(Encryption::NotSupported).await;
            server.expect(packet_type::LOGIN7).await;
            server.reply(send_fed_auth_info()).await;

            let token = server.expect(packet_type::FEDAUTH_TOKEN).await;
            assert_eq!(&token.payload[8..], &string_to_utf16le("eyJ0eXAi")[..]);

            let mut buf = BytesMut::new();
            tokens::fed_auth_ack(&mut buf);
            tokens::login_ack(&mut buf);
            tokens::done(&mut buf, 0, 0);
            server.reply(buf).await;
            server.initial_sql().await;
        });
        let provider = Arc::new(StaticTokenProvider {
            token: Some("eyJ0eXAi".to_string()),
            ..StaticTokenProvider::default()
        });

        let conn = Connection::builder(config(msi_login()))
            .connector(connector)
            .token_provider(provider)
            .connect()
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(
            conn.visited,
            vec![
                State::Connecting,
                State::SentPrelogin,
                State::SentLogin7FedAuth,
                State::LoggedInSendingInitialSql,
                State::LoggedIn,
            ]
        );
    }

    #[tokio::test]
    async fn test_login_ack_without_feature_ack_completes_login() {
        let connector = Arc::new(ScriptedConnector::default());
        let server = scripted(&connector, |mut server| async move {
            server.prelogin(Encryption::NotSupported).await;
            server.expect(packet_type::LOGIN7).await;
            server.reply(send_fed_auth_info()).await;
            server.expect(packet_type::FEDAUTH_TOKEN).await;
            server.accept_login().await;
            server.initial_sql().await;
        });
        let provider = Arc::new(StaticTokenProvider {
            token: Some("t".to_string()),
            ..StaticTokenProvider::default()
        });

        let conn = Connection::builder(config(msi_login()))
            .connector(connector)
            .token_provider(provider)
            .connect()
            .await
            .unwrap();
        server.await.unwrap();

        assert!(conn.is_logged_in());
        assert_eq!(conn.database(), Some("sales"));
        assert_eq!(
            conn.visited,
            vec![
                State::Connecting,
                State::SentPrelogin,
                State::SentLogin7FedAuth,
                State::LoggedInSendingInitialSql,
                State::LoggedIn,
            ]
        );
    }

    #[tokio::test]
    async fn test_routing_after_token_reconnects() {
        let connector = Arc::new(ScriptedConnector::default());
        let first = scripted(&connector, |mut server| async move {
            server.prelogin(Encryption::NotSupported).await;
            server.expect(packet_type::LOGIN7).await;
            server.reply(send_fed_auth_info()).await;
            server.expect(packet_type::FEDAUTH_TOKEN).await;

            let mut buf = BytesMut::new();
            tokens::fed_auth_ack(&mut buf);
            tokens::login_ack(&mut buf);
            tokens::routing(&mut buf, "replica.example", 11000);
            tokens::done(&mut buf, 0, 0);
            server.reply(buf).await;
        });
        let second = scripted(&connector, |mut server| async move { server.login().await });
        let provider = Arc::new(StaticTokenProvider {
            token: Some("t".to_string()),
            ..StaticTokenProvider::default()
        });

        let conn = Connection::builder(config(msi_login()))
            .connector(connector.clone())
            .token_provider(provider)
            .connect()
            .await
            .unwrap();
        first.await.unwrap();
        second.await.unwrap();

        assert!(conn.is_logged_in());
        assert_eq!(
            connector.targets(),
            vec![
                ("db.example".to_string(), 1433),
                ("replica.example".to_string(), 11000)
            ]
        );
        assert!(conn.visited.contains(&State::Rerouting));
    }
}

// ============================================================================
// Failures and cancellation
// ============================================================================

mod failures {
    use super::*;

    const NON_FINAL: [State; 13] = [
        State::Initialized,
        State::Connecting,
        State::SentPrelogin,
        State::Rerouting,
        State::TransientFailureRetry,
        State::SentTlsNegotiation,
        State::SentLogin7Standard,
        State::SentLogin7Ntlm,
        State::SentLogin7FedAuth,
        State::LoggedInSendingInitialSql,
        State::LoggedIn,
        State::SentClientRequest,
        State::SentAttention,
    ];

    #[tokio::test]
    async fn test_socket_error_goes_straight_to_final() {
        for state in NON_FINAL {
            let (mut conn, mut rx) = Connection::parked(state, Edition::Full);
            let err = ConnectionError::transport(codes::ESOCKET, "Connection lost - read ECONNRESET");
            conn.drive(Step::Dispatch(Event::SocketError(err))).await;

            assert_eq!(conn.state(), State::Final, "from {}", state);
            assert_eq!(conn.visited, vec![State::Final], "from {}", state);
            let surfaced = rx.try_recv().unwrap().unwrap_err();
            assert_eq!(surfaced.code(), codes::ESOCKET, "from {}", state);
            assert!(conn.cancellation_token().is_cancelled());
        }
    }

    #[tokio::test]
    async fn test_invalid_config_is_refused_before_connecting() {
        let connector = Arc::new(ScriptedConnector::default());
        let mut cfg = config(sql_login());
        cfg.packet_size = 70_000;

        let err = match Connection::builder(cfg).connector(connector.clone()).connect().await {
            Ok(_) => panic!("oversized packet size was accepted"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.code(), codes::ECONFIG);
        assert!(err.message().contains("70000"));
        assert!(connector.targets().is_empty());
    }

    #[tokio::test]
    async fn test_final_ignores_further_events() {
        let (mut conn, _rx) = Connection::parked(State::Final, Edition::Full);
        conn.drive(Step::Dispatch(Event::Message)).await;
        conn.drive(Step::Transition(State::Connecting)).await;
        assert_eq!(conn.state(), State::Final);
        assert!(conn.visited.is_empty());
    }

    #[tokio::test]
    async fn test_refused_connect_is_a_transport_error() {
        let connector = Arc::new(ScriptedConnector::default());
        let err = match Connection::builder(config(sql_login()))
            .connector(connector)
            .connect()
            .await
        {
            Ok(_) => panic!("connect should fail"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.code(), codes::ESOCKET);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let mut cfg = config(sql_login());
        cfg.connect_timeout = 50;
        let err = match Connection::builder(cfg)
            .connector(Arc::new(HangingConnector))
            .connect()
            .await
        {
            Ok(_) => panic!("connect should time out"),
            Err(err) => err,
        };
        assert_eq!(err.code(), codes::ETIMEOUT);
        assert_eq!(err.message(), "Failed to connect to db.example:1433 in 50ms");
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_a_pending_read() {
        let connector = Arc::new(ScriptedConnector::default());
        let server = scripted(&connector, |mut server| async move {
            server.expect(packet_type::PRELOGIN).await;
            // Never answer; the stream closes when the client gives up
            let _ = server.io.read_message().await;
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = match Connection::builder(config(sql_login()))
            .connector(connector)
            .cancellation_token(cancel)
            .connect()
            .await
        {
            Ok(_) => panic!("connect should be cancelled"),
            Err(err) => err,
        };
        server.await.unwrap();
        assert_eq!(err.code(), codes::ECANCEL);
    }
}

// ============================================================================
// Requests
// ============================================================================

mod requests {
    use super::*;

    #[tokio::test]
    async fn test_server_error_keeps_the_connection_logged_in() {
        let (mut conn, server) = logged_in(config(sql_login()), |mut server| async move {
            let batch = server.expect(packet_type::SQL_BATCH).await;
            // ALL_HEADERS precede the statement text
            assert_eq!(&batch.payload[22..], &string_to_utf16le("select * from nope")[..]);
            let mut buf = BytesMut::new();
            tokens::error(&mut buf, 208, "Invalid object name 'nope'.");
            tokens::done(&mut buf, done_status::ERROR, 0);
            server.reply(buf).await;

            server.expect(packet_type::SQL_BATCH).await;
            let mut buf = BytesMut::new();
            tokens::done(&mut buf, done_status::COUNT, 4);
            server.reply(buf).await;
        })
        .await;

        let err = conn.execute_batch("select * from nope").await.unwrap_err();
        assert_eq!(err.code, codes::EREQUEST);
        assert_eq!(err.number, Some(208));
        assert_eq!(err.message, "Invalid object name 'nope'.");
        assert!(conn.is_logged_in());

        let outcome = conn.execute_batch("update t set x = 1").await.unwrap();
        assert_eq!(outcome.rows_affected, Some(4));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout_sends_attention() {
        let mut cfg = config(sql_login());
        cfg.request_timeout = 50;
        let (mut conn, server) = logged_in(cfg, |mut server| async move {
            server.expect(packet_type::SQL_BATCH).await;
            let attention = server.expect(packet_type::ATTENTION).await;
            assert!(attention.payload.is_empty());
            let mut buf = BytesMut::new();
            tokens::done(&mut buf, done_status::ATTN, 0);
            server.reply(buf).await;
        })
        .await;

        let err = conn.execute_batch("waitfor delay '00:01:00'").await.unwrap_err();
        server.await.unwrap();

        assert_eq!(err.code, codes::ETIMEOUT);
        assert_eq!(err.message, "Timeout: Request failed to complete in 50ms");
        assert!(conn.is_logged_in());
        assert!(conn
            .visited
            .ends_with(&[State::SentClientRequest, State::SentAttention, State::LoggedIn]));
    }

    #[tokio::test]
    async fn test_request_timeout_mid_packet_still_drains_to_attention_ack() {
        use super::super::protocol::{packet_status, PacketHeader, HEADER_SIZE};
        use tokio::io::AsyncWriteExt;

        let mut cfg = config(sql_login());
        cfg.request_timeout = 50;
        let (mut conn, server) = logged_in(cfg, |mut server| async move {
            server.expect(packet_type::SQL_BATCH).await;

            let mut tail = BytesMut::new();
            tokens::done(&mut tail, done_status::MORE, 0);
            let head = tail.split_to(5);
            tokens::done(&mut tail, done_status::ATTN, 0);

            let mut wire = BytesMut::new();
            PacketHeader::new(
                packet_type::TABULAR_RESULT,
                packet_status::NORMAL,
                (HEADER_SIZE + head.len()) as u16,
                1,
            )
            .encode(&mut wire);
            wire.extend_from_slice(&head);
            PacketHeader::new(
                packet_type::TABULAR_RESULT,
                packet_status::END_OF_MESSAGE,
                (HEADER_SIZE + tail.len()) as u16,
                2,
            )
            .encode(&mut wire);
            wire.extend_from_slice(&tail);

            // First packet plus half a header, then stall past the timeout
            let rest = wire.split_off(HEADER_SIZE + head.len() + 4);
            server.io.get_mut().write_all(&wire).await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;

            let attention = server.expect(packet_type::ATTENTION).await;
            assert!(attention.payload.is_empty());
            server.io.get_mut().write_all(&rest).await.unwrap();
        })
        .await;

        let err = conn.execute_batch("waitfor delay '00:01:00'").await.unwrap_err();
        server.await.unwrap();

        assert_eq!(err.code, codes::ETIMEOUT);
        assert_eq!(err.message, "Timeout: Request failed to complete in 50ms");
        assert!(conn.is_logged_in());
        assert!(conn
            .visited
            .ends_with(&[State::SentClientRequest, State::SentAttention, State::LoggedIn]));
    }

    #[tokio::test]
    async fn test_procedure_call() {
        let (mut conn, server) = logged_in(config(sql_login()), |mut server| async move {
            let rpc = server.expect(packet_type::RPC_REQUEST).await;
            let name = string_to_utf16le("sp_touch");
            assert_eq!(&rpc.payload[22..24], &8u16.to_le_bytes());
            assert_eq!(&rpc.payload[24..24 + name.len()], &name[..]);
            assert!(rpc.payload.ends_with(&[0x26, 0x08, 0x08, 42, 0, 0, 0, 0, 0, 0, 0]));

            let mut buf = BytesMut::new();
            tokens::return_status(&mut buf, 0);
            tokens::done(&mut buf, 0, 0);
            server.reply(buf).await;
        })
        .await;

        let id = Parameter::new(&BIG_INT, 42i64).unwrap().named("@id");
        let outcome = conn.call_procedure("sp_touch", &[id]).await.unwrap();
        server.await.unwrap();
        assert_eq!(outcome.return_status, Some(0));
        assert!(conn.is_logged_in());
    }

    #[tokio::test]
    async fn test_lost_connection_fails_the_request() {
        let (mut conn, server) = logged_in(config(sql_login()), |mut server| async move {
            server.expect(packet_type::SQL_BATCH).await;
        })
        .await;

        let err = conn.execute_batch("select 1").await.unwrap_err();
        server.await.unwrap();
        assert_eq!(err.code, codes::ESOCKET);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_requests_after_close_are_refused() {
        let (mut conn, server) = logged_in(config(sql_login()), |_server| async {}).await;
        server.await.unwrap();

        conn.close().await;
        assert!(conn.is_closed());
        let err = conn.execute_batch("select 1").await.unwrap_err();
        assert_eq!(err.code, codes::EINVALIDSTATE);
    }
}
