//! An opinionated FIX 4.2 client/acceptor library for the buy-side.
//!
//! fixtrunk supervises many concurrent FIX sessions, each running the FIX session protocol (logon,
//! heartbeats, resend/gap-fill, sequence recovery) independently of the others. [`engine::Engine`]
//! is the supervisor and the only object a caller holds onto; it owns a session's transport, store
//! and timers for its whole lifetime, and a caller always addresses a session by its human-readable
//! name rather than by a handle into that session's internals.
//!
//! ## Terminology
//! * `FIX Connection` -- A single connection to a FIX Session. A network connection is made over TCP,
//! then a FIX logon handshake is performed to establish the FIX connection. The FIX connection
//! ends properly with a FIX logout, but is considered ended if the TCP connection breaks.
//!     * Note, the term 'connection' is overloaded and can also mean TCP connection. When unclear, a
//! 'connection' will be specified as TCP or FIX.
//!
//! * `FIX Session` -- A conceptual construct that represents the bidirectional stream of ordered
//! messages between two peers. A FIX Session can live across multiple instances of a FIX
//! connection; [`engine::Engine`] redials (or re-listens) and resumes the same session after a
//! transport loss, without handing the caller a new identity to track.
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use fixtrunk::engine::Engine;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = Engine::new();
//!     for (name, config) in Engine::load_configs("sessions.json").await? {
//!         engine.register_config(name, config).await?;
//!     }
//!     engine
//!         .subscribe(Arc::new(|name, msg| println!("[{name}] <- {msg}")))
//!         .await;
//!
//!     engine.connect("my-session").await?;
//!
//!     // send messages, query status, disconnect by name...
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod fix;
use fix::encode::MessageBuilder;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use chrono::naive::NaiveTime;

enum Request {
    Logon {
        resp_sender: oneshot::Sender<bool>,
    },
    SendMessage {
        resp_sender: oneshot::Sender<bool>,
        builder: MessageBuilder,
    },
    Logout {
        resp_sender: oneshot::Sender<bool>,
    },
    SetNextSeq {
        next_outgoing: Option<u32>,
        next_incoming: Option<u32>,
        resp_sender: oneshot::Sender<bool>,
    },
}

/// Errors that can occur while running fixtrunk.
#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("An I/O error occured: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Session ended unexpectedly")]
    SessionEnded,
    #[error("Logon has failed")]
    LogonFailed,
    #[error("Logout has failed")]
    LogoutFailed,
    #[error("MessageSend has failed")]
    SendMessageFailed,
    #[error("setting `{0}` is required")]
    SettingRequired(String),
}

/// A collection of settings used to configurate a FIX session.
///
/// Built internally by [`engine::SessionConfig::to_session_settings`] -- callers configure a
/// session through [`engine::SessionConfig`] and never construct this directly.
#[derive(Clone)]
pub(crate) struct SessionSettings {
    begin_string: Arc<String>,
    engine_type: FixEngineType,
    sender_comp_id: String,
    target_comp_id: String,
    addr: SocketAddr,
    epoch: Arc<String>,
    store_path: PathBuf,
    log_dir: PathBuf,
    heartbeat_timeout: Duration,
    start_time: NaiveTime,
    reset_on_logon: bool,
    reset_on_logout: bool,
    reset_on_disconnect: bool,
    persist_messages: bool,
}

/// A builder for easily configuring all the fields of a [`SessionSettings`]
///
/// The following settings are required to be set:
/// * sender comp id
/// * target comp id
/// * addr
/// * store path
/// * log dir
#[derive(Default)]
pub(crate) struct SessionSettingsBuilder {
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    addr: Option<SocketAddr>,
    begin_string: Option<String>,
    epoch: Option<String>,
    store_path: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    heartbeat_timeout: Option<Duration>,
    start_time: Option<NaiveTime>,
    reset_on_logon: Option<bool>,
    reset_on_logout: Option<bool>,
    reset_on_disconnect: Option<bool>,
    persist_messages: Option<bool>,
    engine_type: Option<FixEngineType>,
}

impl SessionSettingsBuilder {
    pub fn new() -> SessionSettingsBuilder {
        Default::default()
    }

    /// The time the FIX session starts each day.
    pub fn with_start_time(mut self, start_time: NaiveTime) -> Self {
        self.set_start_time(start_time);
        self
    }
    pub fn set_start_time(&mut self, start_time: NaiveTime) {
        self.start_time = Some(start_time);
    }

    /// The `SenderCompID(49)` that will be included in each message.
    pub fn with_sender_comp_id(mut self, sender_comp_id: &str) -> Self {
        self.set_sender_comp_id(sender_comp_id);
        self
    }
    pub fn set_sender_comp_id(&mut self, sender_comp_id: &str) {
        self.sender_comp_id = Some(sender_comp_id.to_string());
    }

    /// The `TargetCompID(56)` that will be included in each message.
    pub fn with_target_comp_id(mut self, target_comp_id: &str) -> Self {
        self.set_target_comp_id(target_comp_id);
        self
    }
    pub fn set_target_comp_id(&mut self, target_comp_id: &str) {
        self.target_comp_id = Some(target_comp_id.to_string());
    }

    /// The address to initiate a connection to, or accept connections on.
    pub fn with_socket_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = Some(addr);
        self
    }
    pub fn set_socket_addr(&mut self, addr: SocketAddr) {
        self.addr = Some(addr);
    }

    /// The `BeginString(8)` that will be included in each message.
    pub fn with_begin_string(mut self, begin_string: &str) -> Self {
        self.set_begin_string(begin_string);
        self
    }
    pub fn set_begin_string(&mut self, begin_string: &str) {
        self.begin_string = Some(begin_string.to_string());
    }

    /// A local unique identifier for this FIX session.
    pub fn with_epoch(mut self, epoch: &str) -> Self {
        self.set_epoch(epoch);
        self
    }
    pub fn set_epoch(&mut self, epoch: &str) {
        self.epoch = Some(epoch.to_string());
    }

    /// The file that should be used as the sqlite database file.
    pub fn with_store_path(mut self, store_path: PathBuf) -> Self {
        self.set_store_path(store_path);
        self
    }
    pub fn set_store_path(&mut self, store_path: PathBuf) {
        self.store_path = Some(store_path);
    }

    /// The directory that should be used to create log files.
    pub fn with_log_dir(mut self, log_dir: PathBuf) -> Self {
        self.set_log_dir(log_dir);
        self
    }
    pub fn set_log_dir(&mut self, log_dir: PathBuf) {
        self.log_dir = Some(log_dir);
    }

    /// The timeout length used for sending `Heartbeat<0>` messages.
    pub fn with_heartbeat_timeout(mut self, hb_timeout: Duration) -> Self {
        self.set_heartbeat_timeout(hb_timeout);
        self
    }
    pub fn set_heartbeat_timeout(&mut self, hb_timeout: Duration) {
        self.heartbeat_timeout = Some(hb_timeout);
    }

    /// Whether an inbound Logon with `ResetSeqNumFlag(141)=Y`, or this side initiating with the
    /// flag set, forces both sequence counters back to 1. Independent of `reset_on_logout` and
    /// `reset_on_disconnect` -- each flag fires only at its own trigger point.
    pub fn with_reset_on_logon(mut self, reset: bool) -> Self {
        self.set_reset_on_logon(reset);
        self
    }
    pub fn set_reset_on_logon(&mut self, reset: bool) {
        self.reset_on_logon = Some(reset);
    }

    /// Whether the store is reset to sequence 1 when this session completes a clean Logout.
    pub fn with_reset_on_logout(mut self, reset: bool) -> Self {
        self.set_reset_on_logout(reset);
        self
    }
    pub fn set_reset_on_logout(&mut self, reset: bool) {
        self.reset_on_logout = Some(reset);
    }

    /// Whether the store is reset to sequence 1 whenever the transport drops, independent of
    /// whether a Logout was exchanged.
    pub fn with_reset_on_disconnect(mut self, reset: bool) -> Self {
        self.set_reset_on_disconnect(reset);
        self
    }
    pub fn set_reset_on_disconnect(&mut self, reset: bool) {
        self.reset_on_disconnect = Some(reset);
    }

    /// Whether outbound application messages are persisted to the store for resend. When `false`,
    /// every `ResendRequest` is answered with gap fills regardless of message type.
    pub fn with_persist_messages(mut self, persist: bool) -> Self {
        self.set_persist_messages(persist);
        self
    }
    pub fn set_persist_messages(&mut self, persist: bool) {
        self.persist_messages = Some(persist);
    }

    /// Whether this session dials out (`initiator`, sends the first Logon) or listens and waits
    /// for one (`acceptor`). Defaults to the initiator role if never set.
    pub(crate) fn with_engine_type(mut self, engine_type: FixEngineType) -> Self {
        self.engine_type = Some(engine_type);
        self
    }

    /// Build the [`SessionSettings`] struct.
    ///
    /// Returns an `Err(ApplicationError::SettingRequired)` if not all of the required fields
    /// were set.
    pub fn build(self) -> Result<SessionSettings, ApplicationError> {
        let sender_comp_id = self
            .sender_comp_id
            .ok_or(ApplicationError::SettingRequired(
                "sender_comp_id".to_string(),
            ))?;
        let target_comp_id = self
            .target_comp_id
            .ok_or(ApplicationError::SettingRequired(
                "target_comp_id".to_string(),
            ))?;
        let addr = self
            .addr
            .ok_or(ApplicationError::SettingRequired("addr".to_string()))?;
        let store_path = self
            .store_path
            .ok_or(ApplicationError::SettingRequired("store_path".to_string()))?;
        let log_dir = self
            .log_dir
            .ok_or(ApplicationError::SettingRequired("log_dir".to_string()))?;

        Ok(SessionSettings {
            engine_type: self.engine_type.unwrap_or(FixEngineType::Client),
            begin_string: Arc::new(self.begin_string.unwrap_or(String::from("FIX.4.2"))),
            epoch: Arc::new(
                self.epoch
                    .unwrap_or(format!("{}_{}", &sender_comp_id, &target_comp_id)),
            ),
            heartbeat_timeout: self.heartbeat_timeout.unwrap_or(Duration::from_secs(30)),
            start_time: self.start_time.unwrap_or_default(),
            reset_on_logon: self.reset_on_logon.unwrap_or(false),
            reset_on_logout: self.reset_on_logout.unwrap_or(false),
            reset_on_disconnect: self.reset_on_disconnect.unwrap_or(false),
            persist_messages: self.persist_messages.unwrap_or(true),
            sender_comp_id,
            target_comp_id,
            addr,
            store_path,
            log_dir,
        })
    }
}

impl SessionSettings {
    /// Creates a new [`SessionSettingsBuilder`]
    pub fn builder() -> SessionSettingsBuilder {
        SessionSettingsBuilder::new()
    }

    fn expected_sender_comp_id(&self) -> &str {
        &self.target_comp_id
    }

    fn expected_target_comp_id(&self) -> &str {
        &self.sender_comp_id
    }
}

/// Which side of the TCP connection a session owns -- whether it dials `host:port` (initiator,
/// sends the first Logon) or listens and waits for one (acceptor). [`engine::SessionRole`] is the
/// public-facing counterpart read out of configuration; this is the internal flag threaded through
/// to [`fix::spin_session_watched`] so it knows which half of the Logon handshake to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FixEngineType {
    Client,
    Server,
}
