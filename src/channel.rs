//! Caller side of the render protocol.
//!
//! Every [`RenderChannel`] owns its own correlation table: requests are
//! registered under a fresh id before they are sent, and removed when the
//! matching response is routed, when they time out, when the caller stops
//! waiting, or when the channel is torn down.

use log::{debug, error, warn};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ChannelError;
use crate::sandbox::{self, RenderOutcome, RenderRequest, RenderResponse};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How many timed-out ids are remembered so their late responses can be
/// told apart from a desync.
const EXPIRED_ID_MEMORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    pub request_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

type Settle = oneshot::Sender<Result<String, ChannelError>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Longest message text quoted in a log line.
const PREVIEW_CHARS: usize = 200;

/// Compact JSON text of `message`, cut to [`PREVIEW_CHARS`] characters.
fn preview(message: &Value) -> String {
    let text = message.to_string();
    match text.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text,
    }
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<String, Settle>>,
    expired: Mutex<VecDeque<String>>,
    desync: Mutex<Option<String>>,
    ready: AtomicBool,
}

impl Shared {
    fn deliver(&self, message: &Value) -> Result<(), ChannelError> {
        if sandbox::is_handshake(message) {
            debug!("render channel: sandbox ready");
            self.ready.store(true, Ordering::SeqCst);
            return Ok(());
        }
        let response = match RenderResponse::from_message(message) {
            Ok(Some(response)) => response,
            Ok(None) => return Ok(()),
            Err(err) => {
                // A malformed reply still settles its request if the id survived.
                let settle = sandbox::response_id(message)
                    .and_then(|id| lock(&self.pending).remove(&id));
                if let Some(settle) = settle {
                    let _ = settle.send(Err(err.clone()));
                }
                return Err(err);
            }
        };

        let settle = lock(&self.pending).remove(&response.id);
        match settle {
            Some(settle) => {
                let result = match response.outcome {
                    RenderOutcome::Rendered(text) => Ok(text),
                    RenderOutcome::Failed(message) => Err(ChannelError::Template { message }),
                };
                // The caller may have stopped waiting; nothing left to do then.
                let _ = settle.send(result);
                Ok(())
            }
            None if self.forget_expired(&response.id) => {
                warn!(
                    "render channel: dropping late response for expired request {}",
                    response.id
                );
                Ok(())
            }
            None => {
                error!(
                    "render channel: PROTOCOL DESYNC, response for unknown request {}",
                    response.id
                );
                let mut desync = lock(&self.desync);
                if desync.is_none() {
                    *desync = Some(response.id.clone());
                }
                Err(ChannelError::ProtocolDesync { id: response.id })
            }
        }
    }

    fn remember_expired(&self, id: String) {
        let mut expired = lock(&self.expired);
        if expired.len() == EXPIRED_ID_MEMORY {
            expired.pop_front();
        }
        expired.push_back(id);
    }

    fn forget_expired(&self, id: &str) -> bool {
        let mut expired = lock(&self.expired);
        match expired.iter().position(|e| e == id) {
            Some(index) => {
                expired.remove(index);
                true
            }
            None => false,
        }
    }

    fn fail_all(&self, err: ChannelError) {
        let drained: Vec<Settle> = lock(&self.pending).drain().map(|(_, s)| s).collect();
        if !drained.is_empty() {
            debug!("render channel: rejecting {} pending requests", drained.len());
        }
        for settle in drained {
            let _ = settle.send(Err(err.clone()));
        }
    }
}

/// Evicts a request's table entry if it is still there when the waiting
/// future finishes or is dropped.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if lock(&self.shared.pending).remove(&self.id).is_some() {
            self.shared.remember_expired(self.id.clone());
        }
    }
}

/// Sends templates to an isolated sandbox and routes the answers back.
pub struct RenderChannel {
    shared: Arc<Shared>,
    outbound: Mutex<Option<UnboundedSender<Value>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    config: ChannelConfig,
}

impl RenderChannel {
    /// Start a sandbox thread and connect a channel to it. Must be called
    /// from within a tokio runtime.
    pub fn spawn(config: ChannelConfig) -> Result<Self, ChannelError> {
        let (to_sandbox, sandbox_inbound) = mpsc::unbounded_channel();
        let (sandbox_outbound, from_sandbox) = mpsc::unbounded_channel();
        sandbox::spawn(sandbox_inbound, sandbox_outbound)?;
        Ok(Self::connect(to_sandbox, from_sandbox, config))
    }

    /// Connect to a sandbox over an existing message transport. Must be
    /// called from within a tokio runtime.
    pub fn connect(
        outbound: UnboundedSender<Value>,
        mut inbound: UnboundedReceiver<Value>,
        config: ChannelConfig,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        let listener_shared = Arc::clone(&shared);
        let listener = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                match listener_shared.deliver(&message) {
                    Ok(()) | Err(ChannelError::ProtocolDesync { .. }) => {}
                    Err(e) => warn!("render channel: {} in {}", e, preview(&message)),
                }
            }
            debug!("render channel: sandbox disconnected");
            listener_shared.fail_all(ChannelError::Closed);
        });

        Self {
            shared,
            outbound: Mutex::new(Some(outbound)),
            listener: Mutex::new(Some(listener)),
            config,
        }
    }

    /// Render `template` against `context` in the sandbox.
    ///
    /// Concurrent calls are independent. Compile and helper failures come
    /// back as [`ChannelError::Template`].
    pub async fn send(
        &self,
        template: impl Into<String>,
        context: Value,
    ) -> Result<String, ChannelError> {
        if let Some(id) = lock(&self.shared.desync).clone() {
            return Err(ChannelError::ProtocolDesync { id });
        }

        let request = RenderRequest::new(template.into(), context);
        let (settle, mut outcome) = oneshot::channel();
        lock(&self.shared.pending).insert(request.id.clone(), settle);
        let guard = PendingGuard {
            shared: self.shared.as_ref(),
            id: request.id.clone(),
        };

        let sent = lock(&self.outbound)
            .as_ref()
            .is_some_and(|tx| tx.send(request.to_message()).is_ok());
        if !sent {
            lock(&self.shared.pending).remove(&request.id);
            return Err(ChannelError::Closed);
        }
        debug!("render channel: sent request {}", request.id);

        match tokio::time::timeout(self.config.request_timeout, &mut outcome).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                drop(guard);
                // Routed between the deadline and the eviction above.
                if let Ok(result) = outcome.try_recv() {
                    return result;
                }
                warn!(
                    "render channel: request {} timed out after {:?}",
                    request.id, self.config.request_timeout
                );
                Err(ChannelError::Timeout {
                    id: request.id,
                    after: self.config.request_timeout,
                })
            }
        }
    }

    /// Route one message from the sandbox. This is what the listener runs for
    /// every inbound message; transports that bypass the listener call it
    /// directly.
    ///
    /// A response whose id has no pending entry is a protocol desync: it is
    /// logged, poisons the channel for new requests, and leaves every other
    /// pending request untouched.
    pub fn deliver(&self, message: &Value) -> Result<(), ChannelError> {
        self.shared.deliver(message)
    }

    /// Reject every pending request with [`ChannelError::Closed`] and stop
    /// the listener and the sandbox. Idempotent.
    pub fn shutdown(&self) {
        lock(&self.outbound).take();
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        self.shared.fail_all(ChannelError::Closed);
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Whether the sandbox handshake has been seen. Advisory only.
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    pub fn is_desynchronized(&self) -> bool {
        lock(&self.shared.desync).is_some()
    }
}

impl Drop for RenderChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
