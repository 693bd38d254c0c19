//! The multi-session supervisor.
//!
//! [`Engine`] owns every registered session for the lifetime of the process: it reads a
//! configuration of named sessions, starts and stops each one independently, and is the only
//! object a caller holds a long-lived reference to. A session is looked up by its human-readable
//! name on every call -- never by a pointer into the session's own state -- so a name that no
//! longer refers to a live, logged-on session fails with [`EngineError::NotLoggedOn`] or
//! [`EngineError::UnknownSession`] rather than reaching a dead task or a stale struct field. This
//! replaces the `dict[str, QuickFixClient]` / `active_session` pattern of the Python multi-session
//! client this crate grew out of, where a reconnect could silently leave `session_id` pointing at
//! the wrong client.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::net::TcpSocket;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::fix::encode::MessageBuilder;
use crate::fix::mem::MsgBuf;
use crate::fix::router::{AcceptorRouter, RouteKey, Routed};
use crate::fix::stream::{Lingerable, TryRead};
use crate::fix::{spin_session_watched, SessionStatus, SessionStatusSnapshot};
use crate::{FixEngineType, Request, SessionSettings, SessionSettingsBuilder};

/// Identifies a FIX conversation: `BeginString` + the `SenderCompID`/`TargetCompID` pair, in that
/// order, exactly as spec'd for a FIX session. Immutable and cheaply cloned; used both as the
/// store's directory/file key and as the acceptor router's dispatch key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub begin_string: String,
    pub sender_comp_id: String,
    pub target_comp_id: String,
}

impl SessionKey {
    pub fn new(
        begin_string: impl Into<String>,
        sender_comp_id: impl Into<String>,
        target_comp_id: impl Into<String>,
    ) -> Self {
        SessionKey {
            begin_string: begin_string.into(),
            sender_comp_id: sender_comp_id.into(),
            target_comp_id: target_comp_id.into(),
        }
    }

    fn epoch(&self) -> String {
        format!(
            "{}-{}-{}",
            self.begin_string, self.sender_comp_id, self.target_comp_id
        )
    }

    fn store_file_name(&self) -> String {
        format!("{}.sqlite3", self.epoch())
    }
}

/// Which side of the TCP connection a session owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Dials `host:port`.
    Initiator,
    /// Listens on `port`; the acceptor's `TcpListener` for a given port is shared across every
    /// registered session whose [`SessionConfig::port`] matches, dispatched by inbound CompID.
    Acceptor,
}

/// Static, read-only per-session configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub key: SessionKey,
    pub role: SessionRole,
    /// Required for [`SessionRole::Initiator`]; ignored for `Acceptor`.
    pub host: Option<String>,
    pub port: u16,
    pub heartbeat_interval_seconds: u64,
    pub reconnect_interval_seconds: u64,
    pub reset_on_logon: bool,
    pub reset_on_logout: bool,
    pub reset_on_disconnect: bool,
    pub persist_messages: bool,
    pub store_path: PathBuf,
    pub log_path: PathBuf,
    /// Carried through from configuration but not otherwise interpreted -- this crate does no
    /// data-dictionary validation beyond routing admin message types.
    pub data_dictionary_version: Option<String>,
}

/// Errors raised loading or building a [`SessionConfig`]. Fatal at load time; never raised once
/// the engine is running.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("setting `{0}` is required")]
    MissingField(String),
    #[error("unknown role `{0}`, expected \"initiator\" or \"acceptor\"")]
    UnknownRole(String),
    #[error("initiator session `{0}` is missing a host")]
    MissingHost(String),
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid address for session `{0}`")]
    BadAddress(String),
}

/// One entry of the JSON document read by [`Engine::load_configs`]: a mapping of human-readable
/// session names to their configuration.
#[derive(Debug, Deserialize)]
struct SessionConfigJson {
    begin_string: String,
    sender_comp_id: String,
    target_comp_id: String,
    role: String,
    #[serde(default)]
    host: Option<String>,
    port: u16,
    #[serde(default = "default_heartbeat_interval")]
    heartbeat_interval: u64,
    #[serde(default = "default_reconnect_interval")]
    reconnect_interval: u64,
    #[serde(default)]
    reset_on_logon: bool,
    #[serde(default)]
    reset_on_logout: bool,
    #[serde(default)]
    reset_on_disconnect: bool,
    #[serde(default = "default_true")]
    persist_messages: bool,
    store_path: PathBuf,
    log_path: PathBuf,
    #[serde(default)]
    data_dictionary_version: Option<String>,
}

fn default_heartbeat_interval() -> u64 {
    30
}
fn default_reconnect_interval() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

impl TryFrom<SessionConfigJson> for SessionConfig {
    type Error = ConfigError;

    fn try_from(v: SessionConfigJson) -> Result<Self, ConfigError> {
        let role = match v.role.as_str() {
            "initiator" => SessionRole::Initiator,
            "acceptor" => SessionRole::Acceptor,
            other => return Err(ConfigError::UnknownRole(other.to_string())),
        };
        if role == SessionRole::Initiator && v.host.is_none() {
            return Err(ConfigError::MissingHost(v.sender_comp_id.clone()));
        }
        Ok(SessionConfig {
            key: SessionKey::new(v.begin_string, v.sender_comp_id, v.target_comp_id),
            role,
            host: v.host,
            port: v.port,
            heartbeat_interval_seconds: v.heartbeat_interval,
            reconnect_interval_seconds: v.reconnect_interval,
            reset_on_logon: v.reset_on_logon,
            reset_on_logout: v.reset_on_logout,
            reset_on_disconnect: v.reset_on_disconnect,
            persist_messages: v.persist_messages,
            store_path: v.store_path,
            log_path: v.log_path,
            data_dictionary_version: v.data_dictionary_version,
        })
    }
}

impl SessionConfig {
    fn socket_addr(&self) -> Result<SocketAddr, EngineError> {
        match self.role {
            SessionRole::Initiator => {
                let host = self
                    .host
                    .as_deref()
                    .ok_or_else(|| EngineError::Config(ConfigError::MissingHost(self.key.epoch())))?;
                format!("{host}:{}", self.port)
                    .parse()
                    .map_err(|_| EngineError::Config(ConfigError::BadAddress(self.key.epoch())))
            }
            SessionRole::Acceptor => format!("0.0.0.0:{}", self.port)
                .parse()
                .map_err(|_| EngineError::Config(ConfigError::BadAddress(self.key.epoch()))),
        }
    }

    fn to_session_settings(&self) -> Result<SessionSettings, EngineError> {
        let engine_type = match self.role {
            SessionRole::Initiator => FixEngineType::Client,
            SessionRole::Acceptor => FixEngineType::Server,
        };
        let builder = SessionSettingsBuilder::new()
            .with_begin_string(&self.key.begin_string)
            .with_sender_comp_id(&self.key.sender_comp_id)
            .with_target_comp_id(&self.key.target_comp_id)
            .with_epoch(&self.key.epoch())
            .with_socket_addr(self.socket_addr()?)
            .with_store_path(self.store_path.join(self.key.store_file_name()))
            .with_log_dir(self.log_path.clone())
            .with_heartbeat_timeout(Duration::from_secs(self.heartbeat_interval_seconds))
            .with_reset_on_logon(self.reset_on_logon)
            .with_reset_on_logout(self.reset_on_logout)
            .with_reset_on_disconnect(self.reset_on_disconnect)
            .with_persist_messages(self.persist_messages)
            .with_engine_type(engine_type);
        builder.build().map_err(EngineError::Application)
    }
}

/// Errors the engine's control surface can return. Per-session failures never cross session
/// boundaries; the engine logs every transition with the session's [`SessionKey`] and turns a
/// failed session into a status transition rather than propagating a panic to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no session registered under the name `{0}`")]
    UnknownSession(String),
    #[error("a session is already registered under the name `{0}`")]
    AlreadyRegistered(String),
    #[error("session `{0}` is not logged on")]
    NotLoggedOn(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Application(#[from] crate::ApplicationError),
    #[error("the engine is shutting down")]
    ShuttingDown,
}

/// A snapshot of one session's liveness, returned by [`Engine::query`].
#[derive(Debug, Clone)]
pub struct SessionQuery {
    pub status: SessionStatus,
    pub next_out: u32,
    pub next_in: u32,
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,
    pub peer_address: Option<SocketAddr>,
}

/// The callback invoked for every inbound **application** message. Admin messages never reach
/// this callback; it is invoked from the delivering session's own forwarder task and must not
/// block.
pub type AppHandler = Arc<dyn Fn(String, Arc<MsgBuf>) + Send + Sync + 'static>;

struct SessionRuntime {
    key: SessionKey,
    config: SessionConfig,
    request_tx: watch::Sender<Option<mpsc::UnboundedSender<Request>>>,
    /// Kept alive only so `request_tx` always has at least one receiver -- a `watch::Sender` with
    /// no receivers left silently drops every `send`, which would make `request_tx.borrow()`
    /// downstream (in `send`/`send_raw`/`set_next_seq`/`disconnect`) always observe `None`. Never
    /// read directly; [`SessionRuntime::request_tx`] is read via `borrow()` on the sender side.
    _request_rx: watch::Receiver<Option<mpsc::UnboundedSender<Request>>>,
    /// Replaced with a fresh receiver every reconnect, since [`spin_session_watched`] takes
    /// ownership of a new [`watch::Sender`] per connection attempt.
    status_rx: Mutex<watch::Receiver<SessionStatusSnapshot>>,
    peer_addr: watch::Sender<Option<SocketAddr>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

struct RouterState {
    router: Arc<AcceptorRouter>,
    known: Arc<Mutex<HashMap<RouteKey, String>>>,
    accept_loop: JoinHandle<()>,
}

struct Inner {
    configs: Mutex<HashMap<String, SessionConfig>>,
    sessions: Mutex<HashMap<String, Arc<SessionRuntime>>>,
    routers: Mutex<HashMap<u16, RouterState>>,
    handler: RwLock<Option<AppHandler>>,
}

/// The supervisor owning every registered session's lifecycle. Cheap to clone -- every clone
/// shares the same session table -- but there is no way to obtain a handle into an individual
/// session's internals; all access goes through `Engine`'s own methods, keyed by name.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Engine {
            inner: Arc::new(Inner {
                configs: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                routers: Mutex::new(HashMap::new()),
                handler: RwLock::new(None),
            }),
        }
    }

    /// Reads a JSON document mapping session names to configuration. Does not connect anything;
    /// callers still call [`Engine::connect`] per name, or [`Engine::connect`] every name
    /// returned here.
    pub async fn load_configs(
        source: impl AsRef<Path>,
    ) -> Result<Vec<(String, SessionConfig)>, ConfigError> {
        let raw = tokio::fs::read(source).await?;
        let parsed: HashMap<String, SessionConfigJson> = serde_json::from_slice(&raw)?;
        parsed
            .into_iter()
            .map(|(name, cfg)| Ok((name, SessionConfig::try_from(cfg)?)))
            .collect()
    }

    /// Registers `config` under `name`. Does not connect; call [`Engine::connect`] separately.
    pub async fn register_config(
        &self,
        name: impl Into<String>,
        config: SessionConfig,
    ) -> Result<(), EngineError> {
        let name = name.into();
        let mut configs = self.inner.configs.lock().await;
        if configs.contains_key(&name) {
            return Err(EngineError::AlreadyRegistered(name));
        }
        configs.insert(name, config);
        Ok(())
    }

    /// Registers the single application-message handler shared by every session. Replaces any
    /// previously registered handler.
    pub async fn subscribe(&self, handler: AppHandler) {
        *self.inner.handler.write().await = Some(handler);
    }

    /// Starts (or restarts) the named session. For an initiator, spawns a driver task that dials,
    /// runs the session to completion, and redials after `reconnect_interval_seconds` on
    /// transport loss -- until [`Engine::disconnect`] cancels it. For an acceptor, registers the
    /// session's [`SessionKey`] with the shared [`AcceptorRouter`] for its port (binding the
    /// listener on first use) and waits for a matching inbound Logon.
    pub async fn connect(&self, name: &str) -> Result<(), EngineError> {
        let config = self
            .inner
            .configs
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSession(name.to_string()))?;

        let (request_tx, request_rx): (
            watch::Sender<Option<mpsc::UnboundedSender<Request>>>,
            _,
        ) = watch::channel(None);
        let (_status_tx_init, status_rx) = watch::channel(SessionStatusSnapshot::disconnected());
        let (peer_addr, _peer_addr_rx): (watch::Sender<Option<SocketAddr>>, _) =
            watch::channel(None);
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let runtime = Arc::new(SessionRuntime {
            key: config.key.clone(),
            config: config.clone(),
            request_tx,
            _request_rx: request_rx,
            status_rx: Mutex::new(status_rx),
            peer_addr,
            driver: Mutex::new(None),
            cancelled: Arc::clone(&cancelled),
        });

        self.inner
            .sessions
            .lock()
            .await
            .insert(name.to_string(), Arc::clone(&runtime));

        match config.role {
            SessionRole::Initiator => {
                let driver = self.spawn_initiator_driver(name.to_string(), Arc::clone(&runtime));
                *runtime.driver.lock().await = Some(driver);
            }
            SessionRole::Acceptor => {
                self.register_with_router(name.to_string(), Arc::clone(&runtime))
                    .await?;
            }
        }

        Ok(())
    }

    fn spawn_initiator_driver(&self, name: String, runtime: Arc<SessionRuntime>) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                if runtime.cancelled.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                let settings = match runtime.config.to_session_settings() {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(session = %name, error = ?e, "bad session configuration");
                        return;
                    }
                };
                let addr = match runtime.config.socket_addr() {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::error!(session = %name, error = ?e, "bad session address");
                        return;
                    }
                };
                let socket = match TcpSocket::new_v4() {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(session = %name, error = ?e, "socket creation failed");
                        sleep_reconnect(&runtime).await;
                        continue;
                    }
                };
                let stream = match socket.connect(addr).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(session = %name, error = ?e, "dial failed, will retry");
                        sleep_reconnect(&runtime).await;
                        continue;
                    }
                };
                let _ = stream.set_nodelay(true);
                let _ = runtime.peer_addr.send(stream.peer_addr().ok());

                engine
                    .run_session_to_completion(name.clone(), Arc::clone(&runtime), stream, settings)
                    .await;

                if runtime.cancelled.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                sleep_reconnect(&runtime).await;
            }
        })
    }

    /// Drives one TCP connection's worth of `spin_session_watched` to completion, wiring up the
    /// request channel, status watch, and application-message forwarding this `SessionRuntime`
    /// exposes to [`Engine::send`]/[`Engine::query`]/the subscribed handler.
    async fn run_session_to_completion<S>(
        &self,
        name: String,
        runtime: Arc<SessionRuntime>,
        stream: S,
        settings: SessionSettings,
    ) where
        S: TryRead + tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Lingerable + Send + 'static,
    {
        let (request_sender, request_receiver) = mpsc::unbounded_channel::<Request>();
        let (status_tx, status_rx) = watch::channel(SessionStatusSnapshot::disconnected());
        let (producer, consumer) = rtrb::RingBuffer::<Arc<MsgBuf>>::new(1000);

        let _ = runtime.request_tx.send(Some(request_sender));
        *runtime.status_rx.lock().await = status_rx;

        let forwarder = spawn_app_forwarder(name.clone(), consumer, Arc::clone(&self.inner));

        if let Err(e) =
            spin_session_watched(stream, request_receiver, producer, settings, status_tx).await
        {
            tracing::warn!(session = %name, error = ?e, "session ended");
        }
        forwarder.abort();
        let _ = runtime.request_tx.send(None);
    }

    async fn register_with_router(
        &self,
        name: String,
        runtime: Arc<SessionRuntime>,
    ) -> Result<(), EngineError> {
        let port = runtime.config.port;
        let addr = runtime.config.socket_addr()?;
        let mut routers = self.inner.routers.lock().await;
        if !routers.contains_key(&port) {
            let router = Arc::new(
                AcceptorRouter::bind(addr)
                    .await
                    .map_err(|e| EngineError::Application(crate::ApplicationError::IoError(e)))?,
            );
            let known: Arc<Mutex<HashMap<RouteKey, String>>> = Arc::new(Mutex::new(HashMap::new()));
            let accept_loop = self.spawn_acceptor_loop(Arc::clone(&router), Arc::clone(&known));
            routers.insert(
                port,
                RouterState {
                    router,
                    known,
                    accept_loop,
                },
            );
        }
        let entry = routers.get(&port).expect("just inserted");
        let route_key = RouteKey {
            sender_comp_id: runtime.key.sender_comp_id.clone().into_bytes(),
            target_comp_id: runtime.key.target_comp_id.clone().into_bytes(),
        };
        entry.known.lock().await.insert(route_key, name);
        Ok(())
    }

    fn spawn_acceptor_loop(
        &self,
        router: Arc<AcceptorRouter>,
        known: Arc<Mutex<HashMap<RouteKey, String>>>,
    ) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                let known_set: std::collections::HashSet<RouteKey> =
                    known.lock().await.keys().cloned().collect();
                match router.accept(&known_set).await {
                    Ok(Routed::Matched(key, stream)) => {
                        let name = known.lock().await.get(&key).cloned();
                        let Some(name) = name else { continue };
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            engine.handle_accepted(name, stream).await;
                        });
                    }
                    Ok(Routed::Unmatched(_)) => {
                        tracing::warn!("rejected inbound connection with unknown CompID pair");
                    }
                    Err(e) => {
                        tracing::warn!(error = ?e, "acceptor error");
                        break;
                    }
                }
            }
        })
    }

    async fn handle_accepted(
        &self,
        name: String,
        stream: crate::fix::router::PeekedStream<tokio::net::TcpStream>,
    ) {
        let runtime = self.inner.sessions.lock().await.get(&name).cloned();
        let Some(runtime) = runtime else { return };
        let settings = match runtime.config.to_session_settings() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(session = %name, error = ?e, "bad session configuration");
                return;
            }
        };
        self.run_session_to_completion(name, runtime, stream, settings)
            .await;
    }

    /// Submits `msg` for transmission on the named session. Rejected with
    /// [`EngineError::NotLoggedOn`] before the request ever reaches the session's mailbox if the
    /// session is not currently `LOGGED_ON` -- a stale or never-connected name can never block on
    /// a dead task.
    pub async fn send(&self, name: &str, msg: MessageBuilder) -> Result<(), EngineError> {
        let runtime = self.require_logged_on(name).await?;
        let tx = runtime
            .request_tx
            .borrow()
            .clone()
            .ok_or_else(|| EngineError::NotLoggedOn(name.to_string()))?;
        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(Request::SendMessage {
            resp_sender: resp_tx,
            builder: msg,
        })
        .map_err(|_| EngineError::NotLoggedOn(name.to_string()))?;
        match resp_rx.await {
            Ok(true) => Ok(()),
            _ => Err(EngineError::NotLoggedOn(name.to_string())),
        }
    }

    /// Identical to [`Engine::send`], but the caller supplies raw body tags directly; header
    /// fields (8/34/49/52/56) remain owned by the session and are applied/overridden regardless
    /// of what the caller pushed onto `msg`.
    pub async fn send_raw(&self, name: &str, msg: MessageBuilder) -> Result<(), EngineError> {
        self.send(name, msg).await
    }

    /// Administratively overrides the sequence counters. Valid only while the session is outside
    /// `LOGGED_ON`; the session itself rejects the request otherwise.
    pub async fn set_next_seq(
        &self,
        name: &str,
        next_out: Option<u32>,
        next_in: Option<u32>,
    ) -> Result<bool, EngineError> {
        let runtime = self.session_runtime(name).await?;
        let tx = runtime
            .request_tx
            .borrow()
            .clone()
            .ok_or_else(|| EngineError::UnknownSession(name.to_string()))?;
        let (resp_tx, resp_rx) = oneshot::channel();
        tx.send(Request::SetNextSeq {
            next_outgoing: next_out,
            next_incoming: next_in,
            resp_sender: resp_tx,
        })
        .map_err(|_| EngineError::UnknownSession(name.to_string()))?;
        Ok(resp_rx.await.unwrap_or(false))
    }

    /// Returns the current status/sequence/address snapshot for the named session without
    /// entering that session's own execution context.
    pub async fn query(&self, name: &str) -> Result<SessionQuery, EngineError> {
        let runtime = self.session_runtime(name).await?;
        let snapshot = runtime.status_rx.lock().await.borrow().clone();
        let peer_address = *runtime.peer_addr.borrow();
        Ok(SessionQuery {
            status: snapshot.status,
            next_out: snapshot.next_out,
            next_in: snapshot.next_in,
            last_activity: snapshot.last_activity,
            peer_address,
        })
    }

    /// Cancels the named session's driver, timer, and any pending writes; the store is flushed by
    /// the session's own disconnect path, and a best-effort Logout is attempted if the state
    /// permits.
    pub async fn disconnect(&self, name: &str) -> Result<(), EngineError> {
        let runtime = self.session_runtime(name).await?;
        runtime
            .cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(tx) = runtime.request_tx.borrow().clone() {
            let (resp_tx, resp_rx) = oneshot::channel();
            if tx.send(Request::Logout { resp_sender: resp_tx }).is_ok() {
                let _ = tokio::time::timeout(Duration::from_secs(5), resp_rx).await;
            }
        }
        if let Some(driver) = runtime.driver.lock().await.take() {
            driver.abort();
        }
        Ok(())
    }

    /// Cancels every registered session and awaits their termination up to a bounded deadline,
    /// aborting anything still running after that. Never panics on an individual session's
    /// failure.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.inner.sessions.lock().await.keys().cloned().collect();
        for name in names {
            let _ = tokio::time::timeout(Duration::from_secs(10), self.disconnect(&name)).await;
        }
        for router in self.inner.routers.lock().await.values() {
            router.accept_loop.abort();
        }
    }

    async fn session_runtime(&self, name: &str) -> Result<Arc<SessionRuntime>, EngineError> {
        self.inner
            .sessions
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSession(name.to_string()))
    }

    async fn require_logged_on(&self, name: &str) -> Result<Arc<SessionRuntime>, EngineError> {
        let runtime = self.session_runtime(name).await?;
        let status = runtime.status_rx.lock().await.borrow().status;
        if status != SessionStatus::LoggedOn {
            return Err(EngineError::NotLoggedOn(name.to_string()));
        }
        Ok(runtime)
    }
}

async fn sleep_reconnect(runtime: &SessionRuntime) {
    tokio::time::sleep(Duration::from_secs(runtime.config.reconnect_interval_seconds)).await;
}

fn spawn_app_forwarder(
    name: String,
    mut consumer: rtrb::Consumer<Arc<MsgBuf>>,
    inner: Arc<Inner>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match consumer.pop() {
                Ok(msg) => {
                    let handler = inner.handler.read().await.clone();
                    if let Some(handler) = handler {
                        handler(name.clone(), msg);
                    }
                }
                Err(rtrb::PopError::Empty) => {
                    if consumer.is_abandoned() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_session_key_epoch_is_stable() {
        let key = SessionKey::new("FIX.4.2", "S", "T");
        assert_eq!(key.epoch(), "FIX.4.2-S-T");
        assert_eq!(key.store_file_name(), "FIX.4.2-S-T.sqlite3");
    }

    #[test]
    fn test_config_json_requires_host_for_initiator() {
        let json = SessionConfigJson {
            begin_string: "FIX.4.2".into(),
            sender_comp_id: "S".into(),
            target_comp_id: "T".into(),
            role: "initiator".into(),
            host: None,
            port: 5001,
            heartbeat_interval: 30,
            reconnect_interval: 5,
            reset_on_logon: false,
            reset_on_logout: false,
            reset_on_disconnect: false,
            persist_messages: true,
            store_path: PathBuf::from("."),
            log_path: PathBuf::from("."),
            data_dictionary_version: None,
        };
        assert!(matches!(
            SessionConfig::try_from(json),
            Err(ConfigError::MissingHost(_))
        ));
    }

    #[test]
    fn test_config_json_rejects_unknown_role() {
        let json = SessionConfigJson {
            begin_string: "FIX.4.2".into(),
            sender_comp_id: "S".into(),
            target_comp_id: "T".into(),
            role: "passive-aggressive".into(),
            host: Some("localhost".into()),
            port: 5001,
            heartbeat_interval: 30,
            reconnect_interval: 5,
            reset_on_logon: false,
            reset_on_logout: false,
            reset_on_disconnect: false,
            persist_messages: true,
            store_path: PathBuf::from("."),
            log_path: PathBuf::from("."),
            data_dictionary_version: None,
        };
        assert!(matches!(
            SessionConfig::try_from(json),
            Err(ConfigError::UnknownRole(_))
        ));
    }
}
