//! ==============================================================================
//! session - the one live authenticated connection to the broker
//! ==============================================================================
//!
//! the SessionManager runs as its own task and is the only owner of the
//! broker link. everything else talks to it through a SessionHandle
//! (publish requests over a channel, state over a watch).
//!
//! states:
//!
//!     Disconnected -> Connecting -> Authenticated -> Subscribed
//!                         ^                              |
//!                         |          (fault / refresh)   v
//!                         +---------------------- Faulted
//!
//! rules:
//!     - every connect attempt mints a fresh credential. a credential is never
//!       presented twice, and never presented once it has expired.
//!     - the old link is disconnected and dropped before a new one is opened,
//!       so at most one session is ever live.
//!     - publish requests that arrive while not Subscribed fail fast with
//!       NotConnected. the caller decides what to do with its batch.
//!     - a publish timeout is reported, not treated as a fault.
//!
//! relationships:
//!     - mqtt.rs: rumqttc-backed Connector / BrokerLink
//!     - inbound.rs: config message queue and handler
//!     - used by: main.rs (spawns run()), publisher.rs (SessionHandle)
//!
//! ==============================================================================

pub mod inbound;
mod mqtt;

pub use inbound::{ConfigHandler, InboundMessage, LoggingConfigHandler};
pub use mqtt::MqttConnector;

use crate::config::GatewayConfig;
use crate::error::SessionError;
use crate::token::{Credential, TokenIssuer};

use async_trait::async_trait;
use chrono::Utc;
use rumqttc::QoS;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticated,
    Subscribed,
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of a publish that reached the broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Acked,
    /// no ack inside the timeout; the message may or may not have arrived
    Timeout,
}

pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        _ => QoS::AtLeastOnce,
    }
}

/// Opens transport-level connections to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect presenting `credential`. Resolves once the broker accepted
    /// it. Inbound publishes are pushed into `inbound` without blocking.
    async fn connect(
        &self,
        credential: &Credential,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<Box<dyn BrokerLink>, SessionError>;
}

/// One established broker connection.
#[async_trait]
pub trait BrokerLink: Send {
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        timeout: Duration,
    ) -> Result<PublishOutcome, SessionError>;

    /// Resolves with the reason once the connection is gone. Cancel safe.
    async fn closed(&mut self) -> SessionError;

    /// Best-effort graceful close, bounded by `timeout`.
    async fn disconnect(&mut self, timeout: Duration);
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub client_id: String,
    pub config_topic: String,
    pub subscribe_qos: QoS,
    pub connect_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub refresh_margin: chrono::Duration,
}

impl SessionSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            client_id: config.device.client_id(),
            config_topic: config.device.config_topic(),
            subscribe_qos: qos_from_level(config.broker.qos),
            connect_timeout: config.broker.connect_timeout(),
            shutdown_timeout: config.broker.shutdown_timeout(),
            reconnect_initial: Duration::from_millis(config.broker.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(config.broker.reconnect_max_ms),
            refresh_margin: chrono::Duration::seconds(config.auth.refresh_margin_secs),
        }
    }
}

pub(crate) enum Command {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        timeout: Duration,
        reply: oneshot::Sender<Result<PublishOutcome, SessionError>>,
    },
}

impl Command {
    fn reject(self, error: SessionError) {
        match self {
            Command::Publish { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Cheap, cloneable front door to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        timeout: Duration,
    ) -> Result<PublishOutcome, SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Publish {
                topic: topic.to_string(),
                payload,
                qos,
                retain,
                timeout,
                reply,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[cfg(test)]
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// A handle wired to a bare channel instead of a running manager.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Self, mpsc::Receiver<Command>, watch::Sender<SessionState>) {
        let (commands, rx) = mpsc::channel(capacity);
        let (state_tx, state) = watch::channel(SessionState::Subscribed);
        (Self { commands, state }, rx, state_tx)
    }
}

struct Session {
    link: Box<dyn BrokerLink>,
    credential: Credential,
    subscriptions: BTreeSet<String>,
}

/// Reject a credential that is already expired at `now`.
pub fn admit_credential(credential: &Credential, now: chrono::DateTime<Utc>) -> Result<(), SessionError> {
    if credential.is_expired(now) {
        return Err(SessionError::Auth(format!(
            "credential for {} expired at {}",
            credential.subject, credential.expires_at
        )));
    }
    Ok(())
}

pub struct SessionManager {
    connector: Arc<dyn Connector>,
    issuer: TokenIssuer,
    settings: SessionSettings,
    inbound: mpsc::Sender<InboundMessage>,
    commands: mpsc::Receiver<Command>,
    state: watch::Sender<SessionState>,
    session: Option<Session>,
}

impl SessionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        issuer: TokenIssuer,
        settings: SessionSettings,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> (Self, SessionHandle) {
        let (commands_tx, commands) = mpsc::channel(8);
        let (state, state_rx) = watch::channel(SessionState::Disconnected);
        let manager = Self {
            connector,
            issuer,
            settings,
            inbound,
            commands,
            state,
            session: None,
        };
        (manager, SessionHandle { commands: commands_tx, state: state_rx })
    }

    /// Drive the session until `cancel` fires or every handle is dropped.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut backoff = self.settings.reconnect_initial;

        loop {
            if self.session.is_none() {
                match self.connect_fresh(&cancel).await {
                    None => break,
                    Some(Ok(session)) => {
                        info!(
                            client_id = %self.settings.client_id,
                            expires_at = %session.credential.expires_at,
                            subscriptions = ?session.subscriptions,
                            "session established"
                        );
                        self.session = Some(session);
                        backoff = self.settings.reconnect_initial;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, retry_in_ms = backoff.as_millis() as u64, "connect failed");
                        self.set_state(SessionState::Disconnected);
                        if !self.idle(backoff, &cancel).await {
                            break;
                        }
                        backoff = (backoff * 2).min(self.settings.reconnect_max);
                        continue;
                    }
                }
            }

            let Some(session) = self.session.as_mut() else { continue };
            if session.credential.needs_refresh(Utc::now(), self.settings.refresh_margin) {
                info!("credential nearing expiry, reconnecting with a fresh one");
                self.retire(SessionState::Faulted).await;
                continue;
            }
            let refresh_in = (session.credential.expires_at - self.settings.refresh_margin - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                reason = session.link.closed() => {
                    error!(error = %reason, "connection lost");
                    self.retire(SessionState::Faulted).await;
                }
                _ = tokio::time::sleep(refresh_in) => {
                    info!("credential nearing expiry, reconnecting with a fresh one");
                    self.retire(SessionState::Faulted).await;
                }
            }
        }

        self.retire(SessionState::Disconnected).await;
        info!("session stopped");
    }

    async fn handle(&mut self, command: Command) {
        let Some(session) = self.session.as_mut() else {
            command.reject(SessionError::NotConnected);
            return;
        };

        match command {
            Command::Publish { topic, payload, qos, retain, timeout, reply } => {
                let size = payload.len();
                let result = session.link.publish(&topic, payload, qos, retain, timeout).await;
                match &result {
                    Ok(outcome) => debug!(topic = %topic, size, ?outcome, "publish finished"),
                    Err(e) if e.is_connection_fault() => {
                        error!(topic = %topic, error = %e, "publish failed, dropping connection");
                        self.retire(SessionState::Faulted).await;
                    }
                    Err(_) => {}
                }
                let _ = reply.send(result);
            }
        }
    }

    /// One connect attempt with a freshly minted credential. Publish requests
    /// arriving meanwhile are rejected. `None` means cancelled.
    async fn connect_fresh(&mut self, cancel: &CancellationToken) -> Option<Result<Session, SessionError>> {
        let attempt = establish(
            self.connector.as_ref(),
            &self.issuer,
            &self.settings,
            self.inbound.clone(),
            &self.state,
        );
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => return Some(result),
                _ = cancel.cancelled() => return None,
                Some(command) = self.commands.recv() => command.reject(SessionError::NotConnected),
            }
        }
    }

    /// Wait out a backoff period, rejecting publishes. False if cancelled.
    async fn idle(&mut self, period: Duration, cancel: &CancellationToken) -> bool {
        let sleep = tokio::time::sleep(period);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = cancel.cancelled() => return false,
                command = self.commands.recv() => match command {
                    Some(command) => command.reject(SessionError::NotConnected),
                    None => return false,
                },
            }
        }
    }

    /// Close and drop the current link before anything else can connect.
    async fn retire(&mut self, next: SessionState) {
        if let Some(mut session) = self.session.take() {
            session.link.disconnect(self.settings.shutdown_timeout).await;
            drop(session);
            debug!("previous session retired");
        }
        self.set_state(next);
    }

    fn set_state(&self, next: SessionState) {
        set_state(&self.state, next);
    }
}

fn set_state(state: &watch::Sender<SessionState>, next: SessionState) {
    let previous = state.send_replace(next);
    if previous != next {
        info!(from = %previous, to = %next, "session state");
    }
}

#[instrument(name = "session_connect", skip_all, fields(client_id = %settings.client_id))]
async fn establish(
    connector: &dyn Connector,
    issuer: &TokenIssuer,
    settings: &SessionSettings,
    inbound: mpsc::Sender<InboundMessage>,
    state: &watch::Sender<SessionState>,
) -> Result<Session, SessionError> {
    set_state(state, SessionState::Connecting);

    let credential = issuer.mint(&settings.client_id, Utc::now())?;
    admit_credential(&credential, Utc::now())?;
    debug!(expires_at = %credential.expires_at, "minted credential");

    let mut link = tokio::time::timeout(settings.connect_timeout, connector.connect(&credential, inbound))
        .await
        .map_err(|_| {
            SessionError::Transport(format!("connect timed out after {} ms", settings.connect_timeout.as_millis()))
        })??;
    set_state(state, SessionState::Authenticated);

    let subscribed = tokio::time::timeout(
        settings.connect_timeout,
        link.subscribe(&settings.config_topic, settings.subscribe_qos),
    )
    .await
    .unwrap_or_else(|_| {
        Err(SessionError::Subscribe {
            topic: settings.config_topic.clone(),
            reason: "timed out".to_string(),
        })
    });
    if let Err(e) = subscribed {
        link.disconnect(settings.shutdown_timeout).await;
        return Err(e);
    }
    info!(topic = %settings.config_topic, "subscribed to config topic");
    set_state(state, SessionState::Subscribed);

    Ok(Session {
        link,
        credential,
        subscriptions: BTreeSet::from([settings.config_topic.clone()]),
    })
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tests::test_issuer;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Clone, Copy, PartialEq)]
    enum PublishMode {
        Ack,
        Timeout,
        Fail,
    }

    /// Shared fake broker state observed by the tests.
    struct FakeBroker {
        connects: AtomicUsize,
        live: AtomicUsize,
        max_live: AtomicUsize,
        fail_connects: AtomicUsize,
        tokens: Mutex<Vec<String>>,
        published: Mutex<Vec<(String, Vec<u8>)>>,
        publish_mode: Mutex<PublishMode>,
        kill: Mutex<Option<Arc<Notify>>>,
        inbound: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    }

    impl FakeBroker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                connects: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                max_live: AtomicUsize::new(0),
                fail_connects: AtomicUsize::new(0),
                tokens: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                publish_mode: Mutex::new(PublishMode::Ack),
                kill: Mutex::new(None),
                inbound: Mutex::new(None),
            })
        }

        /// broker-initiated close of the current connection
        fn drop_connection(&self) {
            if let Some(kill) = self.kill.lock().unwrap().as_ref() {
                kill.notify_one();
            }
        }
    }

    struct FakeConnector(Arc<FakeBroker>);

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(
            &self,
            credential: &Credential,
            inbound: mpsc::Sender<InboundMessage>,
        ) -> Result<Box<dyn BrokerLink>, SessionError> {
            let broker = &self.0;
            broker.connects.fetch_add(1, Ordering::SeqCst);
            if broker
                .fail_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SessionError::Transport("connection refused".into()));
            }

            broker.tokens.lock().unwrap().push(credential.token.clone());
            let live = broker.live.fetch_add(1, Ordering::SeqCst) + 1;
            broker.max_live.fetch_max(live, Ordering::SeqCst);

            let kill = Arc::new(Notify::new());
            *broker.kill.lock().unwrap() = Some(kill.clone());
            *broker.inbound.lock().unwrap() = Some(inbound);
            Ok(Box::new(FakeLink { broker: broker.clone(), kill }))
        }
    }

    struct FakeLink {
        broker: Arc<FakeBroker>,
        kill: Arc<Notify>,
    }

    #[async_trait]
    impl BrokerLink for FakeLink {
        async fn subscribe(&mut self, _topic: &str, _qos: QoS) -> Result<(), SessionError> {
            Ok(())
        }

        async fn publish(
            &mut self,
            topic: &str,
            payload: Vec<u8>,
            _qos: QoS,
            _retain: bool,
            _timeout: Duration,
        ) -> Result<PublishOutcome, SessionError> {
            let mode = *self.broker.publish_mode.lock().unwrap();
            match mode {
                PublishMode::Ack => {
                    self.broker.published.lock().unwrap().push((topic.to_string(), payload));
                    Ok(PublishOutcome::Acked)
                }
                PublishMode::Timeout => Ok(PublishOutcome::Timeout),
                PublishMode::Fail => Err(SessionError::Transport("broken pipe".into())),
            }
        }

        async fn closed(&mut self) -> SessionError {
            self.kill.notified().await;
            SessionError::Transport("broker closed connection".into())
        }

        async fn disconnect(&mut self, _timeout: Duration) {}
    }

    impl Drop for FakeLink {
        fn drop(&mut self) {
            self.broker.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            client_id: "projects/p/locations/r/registries/g/devices/d".to_string(),
            config_topic: "devices/d/config".to_string(),
            subscribe_qos: QoS::AtLeastOnce,
            connect_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(50),
            reconnect_initial: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(40),
            refresh_margin: chrono::Duration::minutes(5),
        }
    }

    struct Harness {
        broker: Arc<FakeBroker>,
        handle: SessionHandle,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    }

    fn start(broker: Arc<FakeBroker>, settings: SessionSettings) -> Harness {
        let (inbound_tx, inbound_rx) = mpsc::channel(4);
        let (manager, handle) =
            SessionManager::new(Arc::new(FakeConnector(broker.clone())), test_issuer(), settings, inbound_tx);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(manager.run(cancel.clone()));
        Harness { broker, handle, cancel, task, inbound_rx }
    }

    async fn wait_for(handle: &SessionHandle, want: SessionState) {
        let mut rx = handle.watch_state();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| *s == want))
            .await
            .expect("state not reached")
            .unwrap();
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn publish(handle: &SessionHandle) -> Result<PublishOutcome, SessionError> {
        handle
            .publish("devices/d/events", b"m,sensor=k_30 ppm=1 1".to_vec(), QoS::AtLeastOnce, false, Duration::from_secs(5))
            .await
    }

    #[tokio::test]
    async fn test_connects_and_publishes() {
        let h = start(FakeBroker::new(), settings());
        wait_for(&h.handle, SessionState::Subscribed).await;

        assert_eq!(publish(&h.handle).await.unwrap(), PublishOutcome::Acked);
        assert_eq!(h.broker.published.lock().unwrap()[0].0, "devices/d/events");

        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(h.handle.state(), SessionState::Disconnected);
        assert_eq!(h.broker.live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_publish_timeout_keeps_connection() {
        let h = start(FakeBroker::new(), settings());
        wait_for(&h.handle, SessionState::Subscribed).await;
        *h.broker.publish_mode.lock().unwrap() = PublishMode::Timeout;

        assert_eq!(publish(&h.handle).await.unwrap(), PublishOutcome::Timeout);
        assert_eq!(publish(&h.handle).await.unwrap(), PublishOutcome::Timeout);
        assert_eq!(h.handle.state(), SessionState::Subscribed);
        assert_eq!(h.broker.connects.load(Ordering::SeqCst), 1);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_broker_close_triggers_reconnect_with_new_credential() {
        let h = start(FakeBroker::new(), settings());
        wait_for(&h.handle, SessionState::Subscribed).await;

        h.broker.drop_connection();
        let broker = h.broker.clone();
        wait_until(move || broker.connects.load(Ordering::SeqCst) == 2).await;
        wait_for(&h.handle, SessionState::Subscribed).await;

        assert_eq!(publish(&h.handle).await.unwrap(), PublishOutcome::Acked);
        assert_eq!(h.broker.max_live.load(Ordering::SeqCst), 1);
        let tokens = h.broker.tokens.lock().unwrap().clone();
        assert_eq!(tokens.len(), 2);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_fault_retires_session_and_recovers() {
        let h = start(FakeBroker::new(), settings());
        wait_for(&h.handle, SessionState::Subscribed).await;

        *h.broker.publish_mode.lock().unwrap() = PublishMode::Fail;
        let err = publish(&h.handle).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));

        *h.broker.publish_mode.lock().unwrap() = PublishMode::Ack;
        let broker = h.broker.clone();
        wait_until(move || broker.connects.load(Ordering::SeqCst) == 2).await;
        wait_for(&h.handle, SessionState::Subscribed).await;
        assert_eq!(publish(&h.handle).await.unwrap(), PublishOutcome::Acked);
        assert_eq!(h.broker.max_live.load(Ordering::SeqCst), 1);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_while_reconnecting_fails_fast() {
        let broker = FakeBroker::new();
        broker.fail_connects.store(1000, Ordering::SeqCst);
        let mut s = settings();
        s.reconnect_initial = Duration::from_millis(200);
        s.reconnect_max = Duration::from_millis(200);
        let h = start(broker, s);

        wait_for(&h.handle, SessionState::Disconnected).await;
        let started = std::time::Instant::now();
        let err = publish(&h.handle).await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected));
        assert!(started.elapsed() < Duration::from_millis(150));

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_backoff_then_success() {
        let broker = FakeBroker::new();
        broker.fail_connects.store(3, Ordering::SeqCst);
        let h = start(broker, settings());

        wait_for(&h.handle, SessionState::Subscribed).await;
        assert_eq!(h.broker.connects.load(Ordering::SeqCst), 4);
        assert_eq!(h.broker.tokens.lock().unwrap().len(), 1);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_refresh_before_expiry_reconnects() {
        let broker = FakeBroker::new();
        let mut s = settings();
        // margin larger than the 24h validity: refresh is due immediately
        s.refresh_margin = chrono::Duration::hours(25);
        let h = start(broker, s);

        let broker = h.broker.clone();
        wait_until(move || broker.connects.load(Ordering::SeqCst) >= 3).await;
        assert_eq!(h.broker.max_live.load(Ordering::SeqCst), 1);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_sender_reaches_connector() {
        let h = start(FakeBroker::new(), settings());
        wait_for(&h.handle, SessionState::Subscribed).await;

        let sender = h.broker.inbound.lock().unwrap().clone().unwrap();
        sender
            .try_send(InboundMessage::new("devices/d/config", b"{}".to_vec()))
            .unwrap();
        let mut h = h;
        let msg = h.inbound_rx.recv().await.unwrap();
        assert_eq!(msg.topic, "devices/d/config");

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[test]
    fn test_expired_credential_not_admitted() {
        let issuer = test_issuer();
        let issued = Utc::now() - chrono::Duration::hours(48);
        let stale = issuer.mint("dev", issued).unwrap();
        assert!(matches!(admit_credential(&stale, Utc::now()), Err(SessionError::Auth(_))));
        assert!(matches!(admit_credential(&stale, stale.expires_at), Err(SessionError::Auth(_))));

        let fresh = issuer.mint("dev", Utc::now()).unwrap();
        assert!(admit_credential(&fresh, Utc::now()).is_ok());
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
    }
}
