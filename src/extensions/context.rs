//! Context registry.
//!
//! Every live execution context (background script, content script,
//! extension page) is registered here and addressed by a generation-checked
//! [`ContextHandle`]. A handle whose context has been torn down never
//! resolves again, even when its slot is reused.
//!
//! Each context owns a turn queue: a spawned tokio task draining an
//! unbounded channel of jobs in FIFO order. All listener invocations and
//! callback deliveries for a context run as jobs on its queue, one at a
//! time. Liveness is rechecked before each job, so nothing runs on a context
//! after [`ContextRegistry::unregister`] returns.
//!
//! Each context also owns an operation queue. Asynchronous API calls made by
//! the context (storage operations, message delivery) are awaited there one
//! after another, in the order the context issued them.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::error::{ExtensionError, ExtensionResult};
use super::router::MessageListener;
use super::storage::ChangeListener;
use super::ExtensionId;

/// What kind of script a context runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextRole {
    /// The single long-lived background script of an extension.
    BackgroundScript(ExtensionId),
    /// Content scripts and extension pages attached to a tab or frame.
    UserFacing,
}

/// Role without its payload, for routing decisions and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleKind {
    BackgroundScript,
    UserFacing,
}

impl ContextRole {
    pub fn kind(&self) -> RoleKind {
        match self {
            ContextRole::BackgroundScript(_) => RoleKind::BackgroundScript,
            ContextRole::UserFacing => RoleKind::UserFacing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trust {
    Trusted,
    Untrusted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Where a context lives, as reported to message receivers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab: Option<TabInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// A registered unit of script execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub owning_extension: ExtensionId,
    pub role: ContextRole,
    pub trust: Trust,
    pub sender: SenderMetadata,
}

impl ExecutionContext {
    pub fn background(extension: ExtensionId) -> Self {
        Self {
            role: ContextRole::BackgroundScript(extension.clone()),
            owning_extension: extension,
            trust: Trust::Trusted,
            sender: SenderMetadata::default(),
        }
    }

    /// A trusted user-facing context, such as a content script.
    pub fn content_script(extension: ExtensionId, sender: SenderMetadata) -> Self {
        Self {
            owning_extension: extension,
            role: ContextRole::UserFacing,
            trust: Trust::Trusted,
            sender,
        }
    }

    /// An untrusted user-facing context, such as a web page that was given
    /// access to extension APIs.
    pub fn page(extension: ExtensionId, sender: SenderMetadata) -> Self {
        Self {
            owning_extension: extension,
            role: ContextRole::UserFacing,
            trust: Trust::Untrusted,
            sender,
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.trust == Trust::Trusted
    }
}

/// Opaque, generation-checked reference to a registered context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}.{}", self.index, self.generation)
    }
}

/// Identifies one registered listener for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Liveness flag shared between the registry, the turn queue and anything
/// that must stop acting on a context once it is gone.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A unit of work run on a context's turn queue.
pub type TurnJob = Box<dyn FnOnce() + Send + 'static>;

/// An asynchronous API call awaited on a context's operation queue.
pub type Operation = BoxFuture<'static, ()>;

/// Selects contexts in [`ContextRegistry::live_contexts`].
#[derive(Debug, Clone, Default)]
pub struct ContextFilter {
    extension: Option<ExtensionId>,
    role: Option<RoleKind>,
    trust: Option<Trust>,
}

impl ContextFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_extension(extension: ExtensionId) -> Self {
        Self {
            extension: Some(extension),
            ..Self::default()
        }
    }

    pub fn role(mut self, role: RoleKind) -> Self {
        self.role = Some(role);
        self
    }

    pub fn trust(mut self, trust: Trust) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn matches(&self, context: &ExecutionContext) -> bool {
        self.extension
            .as_ref()
            .map_or(true, |ext| *ext == context.owning_extension)
            && self.role.map_or(true, |role| role == context.role.kind())
            && self.trust.map_or(true, |trust| trust == context.trust)
    }
}

/// Point-in-time view of a live context, including its listeners.
#[derive(Clone)]
pub struct ContextSnapshot {
    pub handle: ContextHandle,
    pub context: Arc<ExecutionContext>,
    pub message_listeners: Vec<MessageListener>,
    pub external_message_listeners: Vec<MessageListener>,
    pub change_listeners: Vec<ChangeListener>,
    liveness: Liveness,
    turns: mpsc::UnboundedSender<TurnJob>,
}

impl ContextSnapshot {
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Queue a job on this context. Returns `false` if the context is gone.
    pub fn schedule(&self, job: TurnJob) -> bool {
        self.liveness.is_alive() && self.turns.send(job).is_ok()
    }
}

impl fmt::Debug for ContextSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSnapshot")
            .field("handle", &self.handle)
            .field("context", &self.context)
            .field("message_listeners", &self.message_listeners.len())
            .field("external_message_listeners", &self.external_message_listeners.len())
            .field("change_listeners", &self.change_listeners.len())
            .finish()
    }
}

/// Notified synchronously whenever a context is unregistered.
pub trait TeardownObserver: Send + Sync {
    fn context_torn_down(&self, handle: ContextHandle, context: &ExecutionContext);
}

struct ContextEntry {
    context: Arc<ExecutionContext>,
    sequence: u64,
    liveness: Liveness,
    turns: mpsc::UnboundedSender<TurnJob>,
    operations: mpsc::UnboundedSender<Operation>,
    message_listeners: Vec<(ListenerId, MessageListener)>,
    external_message_listeners: Vec<(ListenerId, MessageListener)>,
    change_listeners: Vec<(ListenerId, ChangeListener)>,
}

fn listeners_of<L: Clone>(listeners: &[(ListenerId, L)]) -> Vec<L> {
    listeners.iter().map(|(_, l)| l.clone()).collect()
}

impl ContextEntry {
    fn snapshot(&self, handle: ContextHandle) -> ContextSnapshot {
        ContextSnapshot {
            handle,
            context: self.context.clone(),
            message_listeners: listeners_of(&self.message_listeners),
            external_message_listeners: listeners_of(&self.external_message_listeners),
            change_listeners: listeners_of(&self.change_listeners),
            liveness: self.liveness.clone(),
            turns: self.turns.clone(),
        }
    }

    fn listener_count(&self) -> usize {
        self.message_listeners.len()
            + self.external_message_listeners.len()
            + self.change_listeners.len()
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<ContextEntry>,
}

#[derive(Default)]
struct RegistryState {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_sequence: u64,
}

impl RegistryState {
    fn entry(&self, handle: ContextHandle) -> Option<&ContextEntry> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, handle: ContextHandle) -> Option<&mut ContextEntry> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
    }
}

struct RegistryInner {
    state: RwLock<RegistryState>,
    observers: RwLock<Vec<Weak<dyn TeardownObserver>>>,
    next_listener: AtomicU64,
    runtime: Handle,
}

/// Shared registry of live execution contexts. Cloning is cheap.
#[derive(Clone)]
pub struct ContextRegistry {
    inner: Arc<RegistryInner>,
}

impl ContextRegistry {
    /// Create a registry whose turn queues run on `runtime`.
    pub fn new(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: RwLock::new(RegistryState::default()),
                observers: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                runtime,
            }),
        }
    }

    /// Create a registry on the ambient tokio runtime.
    pub fn current() -> ExtensionResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| ExtensionError::NoRuntime(e.to_string()))
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Register a context and start its turn and operation queues.
    pub fn register(&self, context: ExecutionContext) -> ContextHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let liveness = Liveness::new();
        let context = Arc::new(context);

        let handle = {
            let mut state = self.write_state();
            let sequence = state.next_sequence;
            state.next_sequence += 1;

            let index = match state.free.pop() {
                Some(index) => index,
                None => {
                    state.slots.push(Slot::default());
                    (state.slots.len() - 1) as u32
                }
            };
            let slot = &mut state.slots[index as usize];
            slot.entry = Some(ContextEntry {
                context: context.clone(),
                sequence,
                liveness: liveness.clone(),
                turns: tx,
                operations: ops_tx,
                message_listeners: Vec::new(),
                external_message_listeners: Vec::new(),
                change_listeners: Vec::new(),
            });
            ContextHandle {
                index,
                generation: slot.generation,
            }
        };

        debug!(
            context = %handle,
            extension = %context.owning_extension,
            role = ?context.role.kind(),
            trust = ?context.trust,
            "registered context"
        );
        self.inner
            .runtime
            .spawn(run_operations(handle, ops_rx, liveness.clone()));
        self.inner.runtime.spawn(run_turns(handle, rx, liveness));
        handle
    }

    /// Tear down a context. Pending jobs on its queue are dropped and
    /// teardown observers run before this returns. Returns `false` if the
    /// handle was already stale.
    pub fn unregister(&self, handle: ContextHandle) -> bool {
        let entry = {
            let mut state = self.write_state();
            let Some(slot) = state.slots.get_mut(handle.index as usize) else {
                return false;
            };
            if slot.generation != handle.generation {
                return false;
            }
            let Some(entry) = slot.entry.take() else {
                return false;
            };
            slot.generation = slot.generation.wrapping_add(1);
            state.free.push(handle.index);
            entry
        };

        entry.liveness.kill();
        debug!(context = %handle, extension = %entry.context.owning_extension, "unregistered context");

        let observers: Vec<_> = self
            .inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for observer in observers {
            observer.context_torn_down(handle, &entry.context);
        }
        true
    }

    pub fn add_teardown_observer(&self, observer: Weak<dyn TeardownObserver>) {
        let mut observers = self
            .inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        observers.retain(|o| o.strong_count() > 0);
        observers.push(observer);
    }

    pub fn is_alive(&self, handle: ContextHandle) -> bool {
        self.read_state().entry(handle).is_some()
    }

    /// The context behind a handle, or `None` if it is gone.
    pub fn context(&self, handle: ContextHandle) -> Option<Arc<ExecutionContext>> {
        self.read_state().entry(handle).map(|e| e.context.clone())
    }

    pub fn snapshot(&self, handle: ContextHandle) -> Option<ContextSnapshot> {
        self.read_state().entry(handle).map(|e| e.snapshot(handle))
    }

    /// All live contexts matching `filter`, in registration order.
    pub fn live_contexts(&self, filter: &ContextFilter) -> Vec<ContextSnapshot> {
        let state = self.read_state();
        let mut matched: Vec<(u64, ContextSnapshot)> = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let entry = slot.entry.as_ref()?;
                if !filter.matches(&entry.context) {
                    return None;
                }
                let handle = ContextHandle {
                    index: index as u32,
                    generation: slot.generation,
                };
                Some((entry.sequence, entry.snapshot(handle)))
            })
            .collect();
        matched.sort_by_key(|(sequence, _)| *sequence);
        matched.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.read_state()
            .slots
            .iter()
            .filter(|slot| slot.entry.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_message_listener(
        &self,
        handle: ContextHandle,
        listener: MessageListener,
    ) -> ExtensionResult<ListenerId> {
        let id = self.next_listener_id();
        let mut state = self.write_state();
        let entry = state.entry_mut(handle).ok_or(ExtensionError::ContextGone)?;
        entry.message_listeners.push((id, listener));
        Ok(id)
    }

    /// `runtime.onMessageExternal`: messages sent by other extensions.
    pub fn add_external_message_listener(
        &self,
        handle: ContextHandle,
        listener: MessageListener,
    ) -> ExtensionResult<ListenerId> {
        let id = self.next_listener_id();
        let mut state = self.write_state();
        let entry = state.entry_mut(handle).ok_or(ExtensionError::ContextGone)?;
        entry.external_message_listeners.push((id, listener));
        Ok(id)
    }

    pub fn add_change_listener(
        &self,
        handle: ContextHandle,
        listener: ChangeListener,
    ) -> ExtensionResult<ListenerId> {
        let id = self.next_listener_id();
        let mut state = self.write_state();
        let entry = state.entry_mut(handle).ok_or(ExtensionError::ContextGone)?;
        entry.change_listeners.push((id, listener));
        Ok(id)
    }

    /// Remove a listener of either kind. Returns `false` if it was not
    /// registered on this context.
    pub fn remove_listener(&self, handle: ContextHandle, id: ListenerId) -> bool {
        let mut state = self.write_state();
        let Some(entry) = state.entry_mut(handle) else {
            return false;
        };
        let before = entry.listener_count();
        entry.message_listeners.retain(|(lid, _)| *lid != id);
        entry.external_message_listeners.retain(|(lid, _)| *lid != id);
        entry.change_listeners.retain(|(lid, _)| *lid != id);
        before != entry.listener_count()
    }

    pub fn has_listener(&self, handle: ContextHandle, id: ListenerId) -> bool {
        self.read_state().entry(handle).is_some_and(|entry| {
            entry.message_listeners.iter().any(|(lid, _)| *lid == id)
                || entry.external_message_listeners.iter().any(|(lid, _)| *lid == id)
                || entry.change_listeners.iter().any(|(lid, _)| *lid == id)
        })
    }

    pub fn has_message_listeners(&self, handle: ContextHandle) -> bool {
        self.read_state()
            .entry(handle)
            .is_some_and(|entry| !entry.message_listeners.is_empty())
    }

    pub fn has_external_message_listeners(&self, handle: ContextHandle) -> bool {
        self.read_state()
            .entry(handle)
            .is_some_and(|entry| !entry.external_message_listeners.is_empty())
    }

    pub fn has_change_listeners(&self, handle: ContextHandle) -> bool {
        self.read_state()
            .entry(handle)
            .is_some_and(|entry| !entry.change_listeners.is_empty())
    }

    /// Queue a job on a context's turn queue.
    pub fn schedule(&self, handle: ContextHandle, job: TurnJob) -> bool {
        self.snapshot(handle).is_some_and(|s| s.schedule(job))
    }

    /// Queue an asynchronous call on a context's operation queue. It starts
    /// only after every call queued before it has finished. Returns `false`
    /// if the context is gone.
    pub fn enqueue_operation(&self, handle: ContextHandle, operation: Operation) -> bool {
        let state = self.read_state();
        let Some(entry) = state.entry(handle) else {
            return false;
        };
        entry.liveness.is_alive() && entry.operations.send(operation).is_ok()
    }

    /// Run `f` on the context's turn queue and wait for its result.
    pub async fn invoke<T, F>(&self, handle: ContextHandle, f: F) -> ExtensionResult<T>
    where
        F: FnOnce(&ExecutionContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        let snapshot = self.snapshot(handle).ok_or(ExtensionError::ContextGone)?;
        let (tx, rx) = oneshot::channel();
        let context = snapshot.context.clone();
        let scheduled = snapshot.schedule(Box::new(move || {
            let _ = tx.send(f(&context));
        }));
        if !scheduled {
            return Err(ExtensionError::ContextGone);
        }
        rx.await.map_err(|_| ExtensionError::ContextGone)
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, RegistryState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, RegistryState> {
        self.inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ContextRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextRegistry")
            .field("live", &self.len())
            .finish()
    }
}

async fn run_turns(
    handle: ContextHandle,
    mut jobs: mpsc::UnboundedReceiver<TurnJob>,
    liveness: Liveness,
) {
    while let Some(job) = jobs.recv().await {
        if !liveness.is_alive() {
            break;
        }
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!(context = %handle, "job panicked on turn queue");
        }
    }
    debug!(context = %handle, "turn queue stopped");
}

async fn run_operations(
    handle: ContextHandle,
    mut operations: mpsc::UnboundedReceiver<Operation>,
    liveness: Liveness,
) {
    while let Some(operation) = operations.recv().await {
        if !liveness.is_alive() {
            break;
        }
        if AssertUnwindSafe(operation).catch_unwind().await.is_err() {
            warn!(context = %handle, "operation panicked");
        }
    }
    debug!(context = %handle, "operation queue stopped");
}
