//! One-to-one call pairing relay.
//!
//! Users register a signaling socket under a username. A call request takes
//! two registered users out of the directory, asks the caller for an offer
//! and then forwards every signal between the two sockets until either side
//! hangs up. No media passes through here.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use canvascast_common::{Result, Signal, SignalingChannel};
use serde::Deserialize;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const WS_MAX_TEXT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairError {
    #[error("username cannot be empty")]
    EmptyUsername,
    #[error("username of caller and callee cannot be empty")]
    EmptyCallParty,
    #[error("the username '{0}' is already taken")]
    UsernameTaken(String),
    #[error("user '{0}' not found")]
    NotFound(String),
    #[error("caller and callee must be different users")]
    SelfCall,
}

impl PairError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for PairError {
    fn into_response(self) -> Response {
        (self.status(), format!("error: {self}")).into_response()
    }
}

struct Registration {
    channel: Arc<SignalingChannel>,
    /// Woken when the user is taken into a call.
    claimed: Arc<Notify>,
}

/// Users waiting to be called, by username.
#[derive(Default)]
pub struct PairingDirectory {
    users: RwLock<HashMap<String, Registration>>,
}

impl PairingDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.users.read().await.is_empty()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.users.read().await.contains_key(username)
    }

    /// Fails if `username` is empty or held by an open socket.
    pub async fn check_available(&self, username: &str) -> std::result::Result<(), PairError> {
        if username.is_empty() {
            return Err(PairError::EmptyUsername);
        }
        match self.users.read().await.get(username) {
            Some(existing) if !existing.channel.is_closed() => {
                Err(PairError::UsernameTaken(username.to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Adds a user and returns the notifier fired when they are called.
    pub async fn register(
        &self,
        username: &str,
        channel: Arc<SignalingChannel>,
    ) -> std::result::Result<Arc<Notify>, PairError> {
        if username.is_empty() {
            return Err(PairError::EmptyUsername);
        }
        let mut users = self.users.write().await;
        if let Some(existing) = users.get(username) {
            if !existing.channel.is_closed() {
                return Err(PairError::UsernameTaken(username.to_string()));
            }
        }
        let claimed = Arc::new(Notify::new());
        users.insert(
            username.to_string(),
            Registration {
                channel,
                claimed: claimed.clone(),
            },
        );
        info!(username, "user registered");
        Ok(claimed)
    }

    /// Drops `username` only if it is still bound to `channel`.
    pub async fn remove_if_same(&self, username: &str, channel: &Arc<SignalingChannel>) -> bool {
        let mut users = self.users.write().await;
        match users.get(username) {
            Some(entry) if Arc::ptr_eq(&entry.channel, channel) => {
                users.remove(username);
                info!(username, "user left");
                true
            }
            _ => false,
        }
    }

    /// Takes both parties out of the directory. Nothing is removed unless
    /// both are present.
    pub async fn take_pair(
        &self,
        caller: &str,
        callee: &str,
    ) -> std::result::Result<(Arc<SignalingChannel>, Arc<SignalingChannel>), PairError> {
        if caller.is_empty() || callee.is_empty() {
            return Err(PairError::EmptyCallParty);
        }
        if caller == callee {
            return Err(PairError::SelfCall);
        }

        let mut users = self.users.write().await;
        for name in [caller, callee] {
            if !users.contains_key(name) {
                return Err(PairError::NotFound(name.to_string()));
            }
        }
        let (Some(from), Some(to)) = (users.remove(caller), users.remove(callee)) else {
            return Err(PairError::NotFound(caller.to_string()));
        };
        from.claimed.notify_one();
        to.claimed.notify_one();
        Ok((from.channel, to.channel))
    }
}

/// Keeps a registered socket alive until it is called or hangs up.
pub async fn hold_until_called(
    directory: Arc<PairingDirectory>,
    username: String,
    channel: Arc<SignalingChannel>,
    claimed: Arc<Notify>,
) {
    loop {
        tokio::select! {
            biased;
            _ = claimed.notified() => return,
            received = channel.receive() => match received {
                Ok(signal) => {
                    debug!(username = %username, event = signal.event.as_str(), "ignoring signal before a call");
                }
                Err(err) => {
                    debug!(username = %username, "registered socket ended: {}", err);
                    directory.remove_if_same(&username, &channel).await;
                    channel.close().await;
                    return;
                }
            },
        }
    }
}

/// Pairs two registered users and starts forwarding between them.
pub async fn start_call(
    directory: &PairingDirectory,
    caller: &str,
    callee: &str,
) -> std::result::Result<JoinHandle<()>, PairError> {
    let (from, to) = directory.take_pair(caller, callee).await?;
    info!(caller, callee, "call started");
    let caller = caller.to_string();
    let callee = callee.to_string();
    Ok(tokio::spawn(async move {
        if let Err(err) = from.send(&Signal::offer_request()).await {
            warn!(caller = %caller, "offer-request not delivered: {}", err);
        }
        bridge(&from, &to).await;
        info!(caller = %caller, callee = %callee, "call ended");
    }))
}

/// Forwards signals both ways until either side ends, then closes both.
pub async fn bridge(a: &SignalingChannel, b: &SignalingChannel) {
    let outcome = tokio::select! {
        result = forward(a, b) => result,
        result = forward(b, a) => result,
    };
    if let Err(err) = outcome {
        debug!("call forwarding stopped: {}", err);
    }
    a.close().await;
    b.close().await;
}

async fn forward(from: &SignalingChannel, to: &SignalingChannel) -> Result<()> {
    loop {
        let signal = from.receive().await?;
        to.send(&signal).await?;
    }
}

#[derive(Debug, Deserialize)]
struct RegisterParams {
    #[serde(default)]
    username: String,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    #[serde(default)]
    caller: String,
    #[serde(default)]
    callee: String,
}

pub fn router(directory: Arc<PairingDirectory>, frontend_dir: Option<PathBuf>) -> Router {
    let app = Router::new()
        .route("/register", get(register))
        .route("/call", get(call))
        .layer(TraceLayer::new_for_http())
        .with_state(directory);

    match frontend_dir {
        Some(dir) => app.fallback_service(ServeDir::new(dir)),
        None => app,
    }
}

async fn register(
    ws: WebSocketUpgrade,
    Query(params): Query<RegisterParams>,
    State(directory): State<Arc<PairingDirectory>>,
) -> Response {
    if let Err(err) = directory.check_available(&params.username).await {
        return err.into_response();
    }
    let username = params.username;
    ws.max_message_size(WS_MAX_TEXT_BYTES)
        .on_upgrade(move |socket| async move {
            let channel = Arc::new(SignalingChannel::from_websocket(socket));
            match directory.register(&username, channel.clone()).await {
                Ok(claimed) => hold_until_called(directory, username, channel, claimed).await,
                Err(err) => {
                    warn!(username = %username, "registration lost a race: {}", err);
                    channel.close().await;
                }
            }
        })
        .into_response()
}

async fn call(
    Query(params): Query<CallParams>,
    State(directory): State<Arc<PairingDirectory>>,
) -> Response {
    match start_call(&directory, &params.caller, &params.callee).await {
        Ok(_) => (StatusCode::OK, "connected").into_response(),
        Err(err) => err.into_response(),
    }
}
