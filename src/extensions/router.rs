//! Message router.
//!
//! Implements `runtime.sendMessage` / `runtime.onMessage` between contexts:
//!
//! - payloads are structured-cloned once, before delivery
//! - receivers are every live context of the destination extension that
//!   has a matching listener and that the routing matrix allows; messages
//!   from another extension go to `onMessageExternal`, the rest to
//!   `onMessage`
//! - [`MessageRouter::send_message`] delivers on the sender's operation
//!   queue, so one context's messages reach receivers in the order sent
//! - receivers run one after another, in registration order, each on its
//!   own turn queue
//! - the first `respond` wins; later ones are ignored
//! - a listener that returns [`ListenerReply::KeepChannelOpen`] keeps the
//!   request pending until someone responds, every such context is torn
//!   down, or the response timeout elapses
//!
//! The router also owns the broadcast primitive used for storage change
//! events.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::context::{
    ContextFilter, ContextHandle, ContextRegistry, ContextSnapshot, ExecutionContext, Liveness,
    RoleKind, TabInfo, TeardownObserver, TurnJob,
};
use super::error::{ExtensionError, ExtensionResult, Reply};
use super::value::{clone_member, structured_clone, ClonePolicy, ScriptValue};
use super::ExtensionId;
use crate::config::RouterConfig;

/// What a message listener tells the router after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerReply {
    /// The listener is done; it may or may not have responded.
    Done,
    /// The listener will respond later (the `return true` convention).
    KeepChannelOpen,
}

/// A `runtime.onMessage` listener. An `Err` is the listener throwing.
pub type MessageListener =
    Arc<dyn Fn(&Value, &MessageSender, Responder) -> anyhow::Result<ListenerReply> + Send + Sync>;

/// Correlates a request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageOptions {
    /// Accepted for compatibility. No TLS channel id is ever reported.
    pub include_tls_channel_id: bool,
}

/// A message on its way from one context to a set of receivers.
#[derive(Debug, Clone)]
pub struct Message {
    pub sender: ContextHandle,
    pub request_id: Option<RequestId>,
    /// Destination extension. `None` means the sender's own extension.
    pub target_extension: Option<ExtensionId>,
    pub payload: ScriptValue,
    pub options: MessageOptions,
}

impl Message {
    pub fn new(sender: ContextHandle, payload: impl Into<ScriptValue>) -> Self {
        Self {
            sender,
            request_id: None,
            target_extension: None,
            payload: payload.into(),
            options: MessageOptions::default(),
        }
    }

    pub fn with_target(mut self, extension: ExtensionId) -> Self {
        self.target_extension = Some(extension);
        self
    }

    pub fn with_request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn with_options(mut self, options: MessageOptions) -> Self {
        self.options = options;
        self
    }
}

/// The `sender` argument handed to `onMessage` listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSender {
    pub id: ExtensionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<TabInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_channel_id: Option<String>,
}

impl MessageSender {
    fn from_context(context: &ExecutionContext) -> Self {
        Self {
            id: context.owning_extension.clone(),
            tab: context.sender.tab.clone(),
            frame_id: context.sender.frame_id,
            url: context.sender.url.clone(),
            origin: context.sender.origin.clone(),
            tls_channel_id: None,
        }
    }
}

/// Which roles may deliver to which.
pub struct RoutingPolicy;

impl RoutingPolicy {
    pub const fn allows(from: RoleKind, to: RoleKind) -> bool {
        match (from, to) {
            (RoleKind::BackgroundScript, RoleKind::BackgroundScript) => true,
            // Background scripts reach tabs through tabs.sendMessage only.
            (RoleKind::BackgroundScript, RoleKind::UserFacing) => false,
            (RoleKind::UserFacing, RoleKind::BackgroundScript) => true,
            (RoleKind::UserFacing, RoleKind::UserFacing) => true,
        }
    }
}

enum Outcome {
    Responded(Option<Value>),
    Failed(ExtensionError),
}

/// Single-assignment cell for a request's result.
struct ResponseSlot {
    tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl ResponseSlot {
    fn new() -> (Arc<Self>, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Returns `false` if the slot was already filled.
    fn fill(&self, outcome: Outcome) -> bool {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    fn is_filled(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// The `sendResponse` function handed to a listener.
#[derive(Clone)]
pub struct Responder {
    slot: Arc<ResponseSlot>,
    liveness: Liveness,
    request_id: RequestId,
}

impl Responder {
    /// Send the response. Returns `true` if this call settled the request.
    ///
    /// Ignored when the responding context is gone, when someone already
    /// responded, or when the value cannot be cloned.
    pub fn respond(&self, value: impl Into<ScriptValue>) -> bool {
        if !self.liveness.is_alive() {
            debug!(request_id = %self.request_id, "response from torn-down context ignored");
            return false;
        }
        let value = match clone_member(&value.into(), ClonePolicy::Strict) {
            Ok(value) => value,
            Err(e) => {
                warn!(request_id = %self.request_id, "response could not be cloned: {}", e);
                return false;
            }
        };
        let settled = self.slot.fill(Outcome::Responded(value));
        if !settled {
            debug!(request_id = %self.request_id, "late response ignored");
        }
        settled
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn is_settled(&self) -> bool {
        self.slot.is_filled()
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("request_id", &self.request_id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RequestKey {
    sender: ContextHandle,
    request_id: RequestId,
}

struct InflightRequest {
    slot: Arc<ResponseSlot>,
    // Contexts whose listener asked to keep the channel open.
    keepers: HashSet<ContextHandle>,
    waiting: bool,
}

struct PendingRequest {
    guard: InflightGuard,
    key: RequestKey,
    sender: Arc<ExecutionContext>,
    target: Option<ExtensionId>,
    payload: Value,
    slot: Arc<ResponseSlot>,
    rx: oneshot::Receiver<Outcome>,
}

struct RouterShared {
    registry: ContextRegistry,
    response_timeout: Duration,
    inflight: Mutex<HashMap<RequestKey, InflightRequest>>,
    next_request: AtomicU64,
}

/// Routes messages between contexts. Cloning is cheap.
#[derive(Clone)]
pub struct MessageRouter {
    shared: Arc<RouterShared>,
}

impl MessageRouter {
    pub fn new(registry: ContextRegistry, config: &RouterConfig) -> Self {
        let shared = Arc::new(RouterShared {
            registry: registry.clone(),
            response_timeout: config.response_timeout(),
            inflight: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(1),
        });
        let observer: Arc<dyn TeardownObserver> = shared.clone();
        registry.add_teardown_observer(Arc::downgrade(&observer));
        Self { shared }
    }

    /// Deliver a message and wait for the first response.
    ///
    /// `Ok(None)` means every receiver finished without responding.
    pub async fn publish(&self, message: Message) -> ExtensionResult<Option<Value>> {
        let pending = self.shared.prepare(message)?;
        self.shared.deliver(pending).await.finish().await
    }

    /// Callback form of [`publish`](Self::publish).
    ///
    /// Argument errors are returned immediately. Otherwise `callback` always
    /// runs later, on the sender's turn queue, unless the sender is torn
    /// down first. Delivery waits for the sender's earlier operations; the
    /// wait for a response does not hold up its later ones.
    pub fn send_message<F>(&self, message: Message, callback: F) -> ExtensionResult<RequestId>
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        let sender = message.sender;
        let pending = self.shared.prepare(message)?;
        let request_id = pending.key.request_id.clone();

        let shared = self.shared.clone();
        let operation = async move {
            let awaiting = shared.deliver(pending).await;
            let registry = shared.registry.clone();
            shared.registry.runtime().spawn(async move {
                let reply = Reply::from_result(awaiting.finish().await);
                if !registry.schedule(sender, Box::new(move || callback(reply))) {
                    debug!(context = %sender, "sender gone, reply dropped");
                }
            });
        }
        .boxed();
        if !self.shared.registry.enqueue_operation(sender, operation) {
            return Err(ExtensionError::NoReceiver);
        }
        Ok(request_id)
    }

    /// Schedule an event on every live context of `extension` that passes
    /// `eligible`. `build` returns the job for one context, or `None` to
    /// skip it. Returns how many contexts were scheduled.
    pub fn broadcast<E, B>(&self, extension: &ExtensionId, eligible: E, build: B) -> usize
    where
        E: Fn(&ExecutionContext) -> bool,
        B: Fn(&ContextSnapshot) -> Option<TurnJob>,
    {
        self.shared
            .registry
            .live_contexts(&ContextFilter::for_extension(extension.clone()))
            .iter()
            .filter(|target| eligible(&target.context))
            .filter_map(|target| build(target).map(|job| target.schedule(job)))
            .filter(|scheduled| *scheduled)
            .count()
    }

    /// Requests currently awaiting a result.
    pub fn inflight_count(&self) -> usize {
        self.shared.lock_inflight().len()
    }
}

impl RouterShared {
    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<RequestKey, InflightRequest>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Synchronous half: clone the payload and claim the request id.
    fn prepare(self: &Arc<Self>, message: Message) -> ExtensionResult<PendingRequest> {
        let payload = structured_clone(&message.payload, ClonePolicy::Strict)?;
        let sender = self
            .registry
            .context(message.sender)
            .ok_or(ExtensionError::NoReceiver)?;
        if message.options.include_tls_channel_id {
            debug!("includeTlsChannelId requested; no TLS channel id is available");
        }

        let request_id = message.request_id.unwrap_or_else(|| {
            RequestId(format!(
                "req-{}",
                self.next_request.fetch_add(1, Ordering::Relaxed)
            ))
        });
        let key = RequestKey {
            sender: message.sender,
            request_id,
        };

        let (slot, rx) = ResponseSlot::new();
        let mut inflight = self.lock_inflight();
        if inflight.contains_key(&key) {
            return Err(ExtensionError::InvalidArgument(format!(
                "request id '{}' is already in flight",
                key.request_id
            )));
        }
        inflight.insert(
            key.clone(),
            InflightRequest {
                slot: slot.clone(),
                keepers: HashSet::new(),
                waiting: false,
            },
        );
        drop(inflight);

        Ok(PendingRequest {
            guard: InflightGuard {
                shared: self.clone(),
                key: key.clone(),
            },
            key,
            sender,
            target: message.target_extension,
            payload,
            slot,
            rx,
        })
    }

    /// Run every receiver's listeners, one receiver after another. The
    /// returned request still has to wait for its response.
    async fn deliver(&self, pending: PendingRequest) -> AwaitingResponse {
        let PendingRequest {
            guard,
            key,
            sender,
            target,
            payload,
            slot,
            rx,
        } = pending;
        let destination = target.unwrap_or_else(|| sender.owning_extension.clone());
        let external = destination != sender.owning_extension;
        let from = sender.role.kind();
        let awaiting = AwaitingResponse {
            _guard: guard,
            request_id: key.request_id.clone(),
            response_timeout: self.response_timeout,
            rx,
        };

        let receivers: Vec<(ContextSnapshot, Vec<MessageListener>)> = self
            .registry
            .live_contexts(&ContextFilter::for_extension(destination.clone()))
            .into_iter()
            .filter(|c| RoutingPolicy::allows(from, c.context.role.kind()))
            .filter_map(|c| {
                let listeners = if external {
                    c.external_message_listeners.clone()
                } else {
                    c.message_listeners.clone()
                };
                (!listeners.is_empty()).then_some((c, listeners))
            })
            .collect();

        if receivers.is_empty() {
            debug!(request_id = %key.request_id, extension = %destination, external, "no receiver");
            slot.fill(Outcome::Failed(ExtensionError::NoReceiver));
            return awaiting;
        }

        let message_sender = Arc::new(MessageSender::from_context(&sender));
        let payload = Arc::new(payload);
        let mut delivered = 0usize;
        let mut keepers = Vec::new();

        for (receiver, listeners) in receivers {
            let responder = Responder {
                slot: slot.clone(),
                liveness: receiver.liveness(),
                request_id: key.request_id.clone(),
            };
            let payload = payload.clone();
            let message_sender = message_sender.clone();
            let (done_tx, done_rx) = oneshot::channel();

            let scheduled = receiver.schedule(Box::new(move || {
                let keep_open = run_message_listeners(&listeners, &payload, &message_sender, &responder);
                let _ = done_tx.send(keep_open);
            }));
            if !scheduled {
                continue;
            }
            // The job is dropped unrun if the receiver dies first.
            if let Ok(keep_open) = done_rx.await {
                delivered += 1;
                if keep_open {
                    keepers.push(receiver.handle);
                }
            }
        }

        if delivered == 0 {
            debug!(request_id = %key.request_id, "every receiver went away before delivery");
            slot.fill(Outcome::Failed(ExtensionError::NoReceiver));
        } else if keepers.is_empty() {
            // Silent acknowledgement, unless a response already landed.
            slot.fill(Outcome::Responded(None));
        } else {
            self.await_keepers(&key, &slot, keepers);
        }
        awaiting
    }

    fn await_keepers(&self, key: &RequestKey, slot: &ResponseSlot, keepers: Vec<ContextHandle>) {
        let mut inflight = self.lock_inflight();
        let Some(request) = inflight.get_mut(key) else {
            return;
        };
        request.waiting = true;
        // Unregister flips liveness before notifying observers, so anything
        // dropped here will not be reported again.
        request.keepers = keepers
            .into_iter()
            .filter(|handle| self.registry.is_alive(*handle))
            .collect();
        if request.keepers.is_empty() {
            slot.fill(Outcome::Failed(ExtensionError::ChannelClosed));
        }
    }
}

impl TeardownObserver for RouterShared {
    fn context_torn_down(&self, handle: ContextHandle, _context: &ExecutionContext) {
        let inflight = &mut *self.lock_inflight();
        for (key, request) in inflight.iter_mut() {
            if key.sender == handle {
                if request.slot.fill(Outcome::Failed(ExtensionError::NoReceiver)) {
                    debug!(request_id = %key.request_id, "sender torn down, request abandoned");
                }
            } else if request.keepers.remove(&handle)
                && request.waiting
                && request.keepers.is_empty()
                && request.slot.fill(Outcome::Failed(ExtensionError::ChannelClosed))
            {
                debug!(request_id = %key.request_id, "last open channel closed");
            }
        }
    }
}

/// Removes the request from the in-flight table however it ends.
struct InflightGuard {
    shared: Arc<RouterShared>,
    key: RequestKey,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.shared.lock_inflight().remove(&self.key);
    }
}

/// A delivered request waiting for its outcome.
struct AwaitingResponse {
    _guard: InflightGuard,
    request_id: RequestId,
    response_timeout: Duration,
    rx: oneshot::Receiver<Outcome>,
}

impl AwaitingResponse {
    async fn finish(self) -> ExtensionResult<Option<Value>> {
        let outcome = match tokio::time::timeout(self.response_timeout, self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Outcome::Failed(ExtensionError::ChannelClosed),
            Err(_) => {
                warn!(
                    request_id = %self.request_id,
                    timeout_ms = self.response_timeout.as_millis() as u64,
                    "no response before timeout"
                );
                Outcome::Failed(ExtensionError::ChannelClosed)
            }
        };
        match outcome {
            Outcome::Responded(value) => Ok(value),
            Outcome::Failed(err) => Err(err),
        }
    }
}

/// Run every listener of one context. Returns whether any of them asked to
/// keep the channel open. A throwing or panicking listener does not stop
/// the ones after it.
fn run_message_listeners(
    listeners: &[MessageListener],
    payload: &Value,
    sender: &MessageSender,
    responder: &Responder,
) -> bool {
    let mut keep_open = false;
    for (index, listener) in listeners.iter().enumerate() {
        let result = catch_unwind(AssertUnwindSafe(|| {
            listener(payload, sender, responder.clone())
        }));
        match result {
            Ok(Ok(ListenerReply::KeepChannelOpen)) => keep_open = true,
            Ok(Ok(ListenerReply::Done)) => {}
            Ok(Err(e)) => {
                warn!(request_id = %responder.request_id, listener = index, "onMessage listener threw: {:#}", e)
            }
            Err(_) => {
                warn!(request_id = %responder.request_id, listener = index, "onMessage listener panicked")
            }
        }
    }
    keep_open
}
