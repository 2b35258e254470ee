//! Extension storage (`chrome.storage.local/sync/session/managed`).
//!
//! Each (extension, area) pair is a partition holding a key/value map. A
//! partition is loaded from its [`StorageProvider`] on first touch and then
//! served from memory. Mutations are serialized by the partition's write
//! lock: the new state is computed, checked against the quota, persisted,
//! committed, and its `onChanged` fanout is scheduled before the lock is
//! released. Listeners therefore see changes in commit order. Provider IO
//! runs on the blocking pool so a slow disk never stalls a runtime worker.
//!
//! Access rules, checked on every call:
//! - every area except `managed` needs the `storage` permission
//! - untrusted contexts only see areas whose access level admits them
//! - `managed` is visible to trusted contexts only and is read-only

mod area;
mod provider;

pub use area::{
    bytes_in_use, diff, entry_size, AccessLevel, StorageArea, StorageChange, StorageChanges,
    StorageKeys, StorageQuota, StoredMap,
};
pub use provider::{JsonFileStorageProvider, MemoryStorageProvider, ProviderError, StorageProvider};

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};
use tokio::sync::RwLock as AsyncRwLock;
use tracing::{debug, error, info, warn};

use super::context::{ContextHandle, ContextRegistry, ExecutionContext, TurnJob};
use super::error::{ExtensionError, ExtensionResult};
use super::permissions::{Permission, PermissionGate};
use super::router::MessageRouter;
use super::value::{clone_member, ClonePolicy, ScriptValue};
use super::ExtensionId;
use crate::config::StorageConfig;

/// A `storage.onChanged` listener. An `Err` is the listener throwing.
pub type ChangeListener =
    Arc<dyn Fn(&StorageChanges, StorageArea) -> anyhow::Result<()> + Send + Sync>;

enum PartitionState {
    Uninitialized,
    Loaded(StoredMap),
    Corrupted(String),
}

struct Partition {
    state: PartitionState,
    access_level: AccessLevel,
}

impl Partition {
    fn new(area: StorageArea) -> Self {
        Self {
            state: PartitionState::Uninitialized,
            access_level: area.default_access_level(),
        }
    }

    fn items(&self) -> ExtensionResult<&StoredMap> {
        match &self.state {
            PartitionState::Loaded(items) => Ok(items),
            PartitionState::Corrupted(reason) => Err(ExtensionError::Internal(reason.clone())),
            PartitionState::Uninitialized => Err(ExtensionError::Internal(
                "storage partition not loaded".to_string(),
            )),
        }
    }
}

type PartitionKey = (ExtensionId, StorageArea);

struct StorageInner {
    registry: ContextRegistry,
    router: MessageRouter,
    gate: PermissionGate,
    provider: Arc<dyn StorageProvider>,
    config: StorageConfig,
    partitions: RwLock<HashMap<PartitionKey, Arc<AsyncRwLock<Partition>>>>,
}

/// Serves every storage area of every extension. Cloning is cheap.
#[derive(Clone)]
pub struct StorageManager {
    inner: Arc<StorageInner>,
}

impl StorageManager {
    pub fn new(
        registry: ContextRegistry,
        router: MessageRouter,
        gate: PermissionGate,
        provider: Arc<dyn StorageProvider>,
        config: StorageConfig,
    ) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                registry,
                router,
                gate,
                provider,
                config,
                partitions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// `get`: the requested items as an object.
    pub async fn get(
        &self,
        caller: ContextHandle,
        area: StorageArea,
        keys: &StorageKeys,
    ) -> ExtensionResult<Map<String, Value>> {
        let context = self.authorize(caller, area)?;
        let partition = self.loaded_partition(&context.owning_extension, area).await?;
        let guard = partition.read().await;
        check_visibility(&context, area, guard.access_level)?;
        let items = guard.items()?;
        Ok(keys.select(items))
    }

    /// `set`: merge `items` into the area. Entries with no JSON form
    /// (functions, `undefined`) are skipped; a cycle fails the whole call.
    pub async fn set(
        &self,
        caller: ContextHandle,
        area: StorageArea,
        items: Vec<(String, ScriptValue)>,
    ) -> ExtensionResult<()> {
        let context = self.authorize(caller, area)?;
        if area.is_read_only() {
            return Err(ExtensionError::ManagedStorageReadOnly);
        }

        let mut incoming = Vec::with_capacity(items.len());
        for (key, value) in items {
            match clone_member(&value, ClonePolicy::Lenient)? {
                Some(value) => incoming.push((key, value)),
                None => debug!(key = %key, "skipping item with no JSON form"),
            }
        }

        self.mutate(&context, area, |current| {
            let mut next = current.clone();
            let written: Vec<String> = incoming.iter().map(|(k, _)| k.clone()).collect();
            next.extend(incoming);
            (next, written)
        })
        .await
    }

    /// `remove`: delete the named keys. Absent keys are ignored.
    pub async fn remove(
        &self,
        caller: ContextHandle,
        area: StorageArea,
        keys: &[String],
    ) -> ExtensionResult<()> {
        let context = self.authorize(caller, area)?;
        if area.is_read_only() {
            return Err(ExtensionError::ManagedStorageReadOnly);
        }

        self.mutate(&context, area, |current| {
            let mut next = current.clone();
            for key in keys {
                next.remove(key);
            }
            (next, Vec::new())
        })
        .await
    }

    /// `clear`: delete every key.
    pub async fn clear(&self, caller: ContextHandle, area: StorageArea) -> ExtensionResult<()> {
        let context = self.authorize(caller, area)?;
        if area.is_read_only() {
            return Err(ExtensionError::ManagedStorageReadOnly);
        }

        self.mutate(&context, area, |_| (StoredMap::new(), Vec::new()))
            .await
    }

    /// `getBytesInUse`: sum of key length plus JSON length.
    pub async fn get_bytes_in_use(
        &self,
        caller: ContextHandle,
        area: StorageArea,
        keys: &StorageKeys,
    ) -> ExtensionResult<usize> {
        let context = self.authorize(caller, area)?;
        let partition = self.loaded_partition(&context.owning_extension, area).await?;
        let guard = partition.read().await;
        check_visibility(&context, area, guard.access_level)?;

        let items = guard.items()?;
        Ok(match keys.names() {
            None => bytes_in_use(items),
            Some(names) => names
                .into_iter()
                .filter_map(|key| items.get(key).map(|value| entry_size(key, value)))
                .sum(),
        })
    }

    /// `setAccessLevel`. Only trusted contexts may call it.
    pub async fn set_access_level(
        &self,
        caller: ContextHandle,
        area: StorageArea,
        level: &str,
    ) -> ExtensionResult<()> {
        let context = self.authorize(caller, area)?;
        if !context.is_trusted() {
            return Err(ExtensionError::UntrustedSenderDenied);
        }
        if area.is_read_only() {
            return Err(ExtensionError::ManagedStorageReadOnly);
        }
        let level: AccessLevel = level.parse()?;

        let partition = self.loaded_partition(&context.owning_extension, area).await?;
        let mut guard = partition.write().await;
        guard.items()?;
        if guard.access_level != level {
            info!(
                extension = %context.owning_extension,
                area = %area,
                level = %level,
                "storage access level changed"
            );
            guard.access_level = level;
        }
        Ok(())
    }

    /// Current access level of a partition.
    pub async fn access_level(&self, extension: &ExtensionId, area: StorageArea) -> AccessLevel {
        self.partition(extension, area).read().await.access_level
    }

    /// Quota in force for `extension` in `area`.
    pub fn quota(&self, extension: &ExtensionId, area: StorageArea) -> StorageQuota {
        let unlimited = self
            .inner
            .gate
            .has_permission(extension, &Permission::UnlimitedStorage);
        StorageQuota::for_area(area, &self.inner.config, unlimited)
    }

    /// Drop every partition of an extension from memory. Persisted areas
    /// reload on next use; session data is gone.
    pub fn forget_extension(&self, extension: &ExtensionId) {
        self.inner
            .partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(ext, _), _| ext != extension);
    }

    /// Resolve the caller and apply the permission rules.
    fn authorize(
        &self,
        caller: ContextHandle,
        area: StorageArea,
    ) -> ExtensionResult<Arc<ExecutionContext>> {
        let context = self
            .inner
            .registry
            .context(caller)
            .ok_or(ExtensionError::ContextGone)?;
        if area.requires_permission() {
            self.inner
                .gate
                .require_permission(&context.owning_extension, &[Permission::Storage])?;
        }
        if area == StorageArea::Managed && !context.is_trusted() {
            return Err(ExtensionError::StorageAreaNotAvailable(area.to_string()));
        }
        Ok(context)
    }

    fn partition(&self, extension: &ExtensionId, area: StorageArea) -> Arc<AsyncRwLock<Partition>> {
        let key = (extension.clone(), area);
        if let Some(partition) = self
            .inner
            .partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return partition.clone();
        }
        self.inner
            .partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert_with(|| Arc::new(AsyncRwLock::new(Partition::new(area))))
            .clone()
    }

    /// The partition, loaded from the provider if this is its first use.
    async fn loaded_partition(
        &self,
        extension: &ExtensionId,
        area: StorageArea,
    ) -> ExtensionResult<Arc<AsyncRwLock<Partition>>> {
        let partition = self.partition(extension, area);
        if !matches!(partition.read().await.state, PartitionState::Uninitialized) {
            return Ok(partition);
        }

        let mut guard = partition.write().await;
        if matches!(guard.state, PartitionState::Uninitialized) {
            guard.state = self.load(extension, area).await?;
        }
        drop(guard);
        Ok(partition)
    }

    async fn load(
        &self,
        extension: &ExtensionId,
        area: StorageArea,
    ) -> ExtensionResult<PartitionState> {
        if !area.is_persistent() {
            return Ok(PartitionState::Loaded(StoredMap::new()));
        }
        let provider = self.inner.provider.clone();
        let owner = extension.clone();
        let loaded = tokio::task::spawn_blocking(move || provider.load(&owner, area))
            .await
            .map_err(|e| ExtensionError::Internal(format!("storage load task failed: {}", e)))?;
        match loaded {
            Ok(items) => {
                debug!(extension = %extension, area = %area, "loaded storage partition");
                Ok(PartitionState::Loaded(items.unwrap_or_default()))
            }
            Err(ProviderError::Corrupted(reason)) => {
                error!(extension = %extension, area = %area, "storage is corrupted: {}", reason);
                Ok(PartitionState::Corrupted(reason))
            }
            Err(e) => {
                warn!(extension = %extension, area = %area, "failed to load storage: {}", e);
                Err(ExtensionError::Internal(e.to_string()))
            }
        }
    }

    /// Apply a mutation under the partition's write lock.
    ///
    /// `compute` returns the next state and the keys held to the per-item
    /// quota. Nothing changes unless quota and persistence both succeed.
    async fn mutate<F>(
        &self,
        context: &ExecutionContext,
        area: StorageArea,
        compute: F,
    ) -> ExtensionResult<()>
    where
        F: FnOnce(&StoredMap) -> (StoredMap, Vec<String>),
    {
        let extension = &context.owning_extension;
        let partition = self.loaded_partition(extension, area).await?;
        let mut guard = partition.write().await;
        check_visibility(context, area, guard.access_level)?;

        let current = guard.items()?;
        let (next, written) = compute(current);
        self.quota(extension, area)
            .check(&next, written.iter().map(String::as_str))?;

        let changes = diff(current, &next);
        if changes.is_empty() {
            return Ok(());
        }

        let next = if area.is_persistent() {
            self.persist(extension, area, next).await?
        } else {
            next
        };

        let level = guard.access_level;
        guard.state = PartitionState::Loaded(next);
        self.fan_out(extension, area, level, changes);
        Ok(())
    }

    /// Write `items` through the provider on the blocking pool and hand
    /// them back once they are durable.
    async fn persist(
        &self,
        extension: &ExtensionId,
        area: StorageArea,
        items: StoredMap,
    ) -> ExtensionResult<StoredMap> {
        let provider = self.inner.provider.clone();
        let owner = extension.clone();
        let (result, items) = tokio::task::spawn_blocking(move || {
            let result = provider.persist(&owner, area, &items);
            (result, items)
        })
        .await
        .map_err(|e| ExtensionError::Internal(format!("storage persist task failed: {}", e)))?;

        result.map_err(|e| {
            warn!(extension = %extension, area = %area, "failed to persist storage: {}", e);
            ExtensionError::Internal(e.to_string())
        })?;
        Ok(items)
    }

    /// Schedule `onChanged` on every context of the extension that can see
    /// this area and has a change listener.
    fn fan_out(
        &self,
        extension: &ExtensionId,
        area: StorageArea,
        level: AccessLevel,
        changes: StorageChanges,
    ) {
        let changes = Arc::new(changes);
        let notified = self.inner.router.broadcast(
            extension,
            |context| context.is_trusted() || level.admits_untrusted(),
            |target| {
                if target.change_listeners.is_empty() {
                    return None;
                }
                let listeners = target.change_listeners.clone();
                let changes = changes.clone();
                let job: TurnJob = Box::new(move || run_change_listeners(&listeners, &changes, area));
                Some(job)
            },
        );
        debug!(
            extension = %extension,
            area = %area,
            keys = changes.len(),
            contexts = notified,
            "storage change scheduled"
        );
    }
}

fn check_visibility(
    context: &ExecutionContext,
    area: StorageArea,
    level: AccessLevel,
) -> ExtensionResult<()> {
    if context.is_trusted() || level.admits_untrusted() {
        Ok(())
    } else {
        Err(ExtensionError::StorageAreaNotAvailable(area.to_string()))
    }
}

fn run_change_listeners(listeners: &[ChangeListener], changes: &StorageChanges, area: StorageArea) {
    for (index, listener) in listeners.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| listener(changes, area))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(area = %area, listener = index, "onChanged listener threw: {:#}", e),
            Err(_) => warn!(area = %area, listener = index, "onChanged listener panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::extensions::context::SenderMetadata;
    use crate::extensions::permissions::PermissionSet;
    use crate::extensions::value::ScriptObject;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: ContextRegistry,
        storage: StorageManager,
        provider: Arc<MemoryStorageProvider>,
        gate: PermissionGate,
    }

    fn ext(id: &str) -> ExtensionId {
        ExtensionId::new(id)
    }

    fn fixture_with(config: StorageConfig) -> Fixture {
        let registry = ContextRegistry::current().unwrap();
        let router = MessageRouter::new(registry.clone(), &RouterConfig::default());
        let gate = PermissionGate::new();
        gate.grant(ext("a"), PermissionSet::from_manifest(["storage"]));
        let provider = Arc::new(MemoryStorageProvider::new());
        let storage = StorageManager::new(
            registry.clone(),
            router,
            gate.clone(),
            provider.clone(),
            config,
        );
        Fixture {
            registry,
            storage,
            provider,
            gate,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(StorageConfig::default())
    }

    fn items(value: Value) -> Vec<(String, ScriptValue)> {
        match value {
            Value::Object(map) => map.into_iter().map(|(k, v)| (k, v.into())).collect(),
            _ => panic!("expected object"),
        }
    }

    fn watch(
        registry: &ContextRegistry,
        handle: ContextHandle,
    ) -> mpsc::UnboundedReceiver<(StorageChanges, StorageArea)> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .add_change_listener(
                handle,
                Arc::new(move |changes: &StorageChanges, area: StorageArea| {
                    let _ = tx.send((changes.clone(), area));
                    Ok(())
                }),
            )
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));

        f.storage
            .set(bg, StorageArea::Local, items(json!({"k": "v", "n": {"deep": [1, 2]}})))
            .await
            .unwrap();

        let all = f.storage.get(bg, StorageArea::Local, &StorageKeys::All).await.unwrap();
        assert_eq!(Value::Object(all), json!({"k": "v", "n": {"deep": [1, 2]}}));

        let one = f
            .storage
            .get(bg, StorageArea::Local, &StorageKeys::Key("k".into()))
            .await
            .unwrap();
        assert_eq!(Value::Object(one), json!({"k": "v"}));
        assert_eq!(
            f.provider.stored(&ext("a"), StorageArea::Local).unwrap()["k"],
            json!("v")
        );
    }

    #[tokio::test]
    async fn test_set_drops_functions_and_undefined() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));

        let nested = ScriptObject::new();
        nested.set("keep", 1);
        nested.set("handler", ScriptValue::Function("h".into()));
        f.storage
            .set(
                bg,
                StorageArea::Local,
                vec![
                    ("fn".into(), ScriptValue::Function("f".into())),
                    ("undef".into(), ScriptValue::Undefined),
                    ("obj".into(), nested.into()),
                ],
            )
            .await
            .unwrap();

        let all = f.storage.get(bg, StorageArea::Local, &StorageKeys::All).await.unwrap();
        assert_eq!(Value::Object(all), json!({"obj": {"keep": 1}}));
    }

    #[tokio::test]
    async fn test_cycle_fails_whole_set() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));
        let cyclic = ScriptObject::new();
        cyclic.set("self", cyclic.clone());

        let err = f
            .storage
            .set(
                bg,
                StorageArea::Local,
                vec![("ok".into(), ScriptValue::from(1)), ("bad".into(), cyclic.into())],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Serialization(_)));

        let all = f.storage.get(bg, StorageArea::Local, &StorageKeys::All).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));
        f.storage
            .set(bg, StorageArea::Sync, items(json!({"a": 1, "b": 2, "c": 3})))
            .await
            .unwrap();

        f.storage
            .remove(bg, StorageArea::Sync, &["a".into(), "missing".into()])
            .await
            .unwrap();
        let all = f.storage.get(bg, StorageArea::Sync, &StorageKeys::All).await.unwrap();
        assert_eq!(Value::Object(all), json!({"b": 2, "c": 3}));

        f.storage.clear(bg, StorageArea::Sync).await.unwrap();
        let all = f.storage.get(bg, StorageArea::Sync, &StorageKeys::All).await.unwrap();
        assert!(all.is_empty());
    }

    #[tokio::test]
    async fn test_change_events_carry_old_and_new() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));
        let mut events = watch(&f.registry, bg);

        f.storage
            .set(bg, StorageArea::Local, items(json!({"k": 1})))
            .await
            .unwrap();
        f.storage
            .set(bg, StorageArea::Local, items(json!({"k": 2})))
            .await
            .unwrap();

        let (first, area) = events.recv().await.unwrap();
        assert_eq!(area, StorageArea::Local);
        assert_eq!(
            first["k"],
            StorageChange {
                old_value: None,
                new_value: Some(json!(1))
            }
        );
        let (second, _) = events.recv().await.unwrap();
        assert_eq!(second["k"].old_value, Some(json!(1)));
        assert_eq!(second["k"].new_value, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_no_event_for_no_op_mutation() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));
        f.storage
            .set(bg, StorageArea::Local, items(json!({"k": 1})))
            .await
            .unwrap();
        let mut events = watch(&f.registry, bg);

        f.storage
            .set(bg, StorageArea::Local, items(json!({"k": 1})))
            .await
            .unwrap();
        f.storage
            .remove(bg, StorageArea::Local, &["absent".into()])
            .await
            .unwrap();

        f.registry.invoke(bg, |_| ()).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_untrusted_context_and_access_levels() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));
        let page = f
            .registry
            .register(ExecutionContext::page(ext("a"), SenderMetadata::default()));
        let mut page_events = watch(&f.registry, page);

        // Local admits untrusted contexts by default.
        f.storage
            .set(page, StorageArea::Local, items(json!({"from_page": true})))
            .await
            .unwrap();
        assert!(page_events.recv().await.is_some());

        // Session does not.
        assert_eq!(
            f.storage
                .get(page, StorageArea::Session, &StorageKeys::All)
                .await
                .unwrap_err(),
            ExtensionError::StorageAreaNotAvailable("session".into())
        );
        f.storage
            .set(bg, StorageArea::Session, items(json!({"secret": 1})))
            .await
            .unwrap();

        f.storage
            .set_access_level(bg, StorageArea::Session, "TRUSTED_AND_UNTRUSTED_CONTEXTS")
            .await
            .unwrap();
        let visible = f
            .storage
            .get(page, StorageArea::Session, &StorageKeys::All)
            .await
            .unwrap();
        assert_eq!(Value::Object(visible), json!({"secret": 1}));

        // Restricting local again hides it and its events from the page.
        f.storage
            .set_access_level(bg, StorageArea::Local, "TRUSTED_CONTEXTS")
            .await
            .unwrap();
        f.storage
            .set(bg, StorageArea::Local, items(json!({"hidden": 1})))
            .await
            .unwrap();
        f.registry.invoke(page, |_| ()).await.unwrap();
        assert!(page_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_set_access_level_rules() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));
        let page = f
            .registry
            .register(ExecutionContext::page(ext("a"), SenderMetadata::default()));

        assert_eq!(
            f.storage
                .set_access_level(page, StorageArea::Local, "TRUSTED_CONTEXTS")
                .await
                .unwrap_err()
                .to_string(),
            "Untrusted sender cannot set access level"
        );
        assert_eq!(
            f.storage
                .set_access_level(bg, StorageArea::Local, "EVERYONE")
                .await
                .unwrap_err(),
            ExtensionError::InvalidAccessLevel("EVERYONE".into())
        );
        assert_eq!(
            f.storage.access_level(&ext("a"), StorageArea::Local).await,
            AccessLevel::TrustedAndUntrustedContexts
        );
    }

    #[tokio::test]
    async fn test_permission_required() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("no-perms")));

        for area in [StorageArea::Local, StorageArea::Sync, StorageArea::Session] {
            assert_eq!(
                f.storage.get(bg, area, &StorageKeys::All).await.unwrap_err(),
                ExtensionError::InsufficientPermission("storage".into())
            );
        }
        // Managed is readable without the permission.
        assert!(f
            .storage
            .get(bg, StorageArea::Managed, &StorageKeys::All)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_managed_is_read_only_and_trusted_only() {
        let f = fixture();
        f.provider.provision(
            ext("a"),
            StorageArea::Managed,
            [("policy".to_string(), json!("strict"))].into_iter().collect(),
        );
        let bg = f.registry.register(ExecutionContext::background(ext("a")));
        let page = f
            .registry
            .register(ExecutionContext::page(ext("a"), SenderMetadata::default()));

        let policy = f
            .storage
            .get(bg, StorageArea::Managed, &StorageKeys::All)
            .await
            .unwrap();
        assert_eq!(Value::Object(policy), json!({"policy": "strict"}));

        assert_eq!(
            f.storage
                .set(bg, StorageArea::Managed, items(json!({"x": 1})))
                .await
                .unwrap_err(),
            ExtensionError::ManagedStorageReadOnly
        );
        assert_eq!(
            f.storage.clear(bg, StorageArea::Managed).await.unwrap_err(),
            ExtensionError::ManagedStorageReadOnly
        );
        assert_eq!(
            f.storage
                .get(page, StorageArea::Managed, &StorageKeys::All)
                .await
                .unwrap_err(),
            ExtensionError::StorageAreaNotAvailable("managed".into())
        );
    }

    #[tokio::test]
    async fn test_quota_is_all_or_nothing() {
        let f = fixture_with(StorageConfig {
            local_quota_bytes: Some(20),
            ..StorageConfig::default()
        });
        let bg = f.registry.register(ExecutionContext::background(ext("a")));
        let mut events = watch(&f.registry, bg);

        f.storage
            .set(bg, StorageArea::Local, items(json!({"a": 1})))
            .await
            .unwrap();
        events.recv().await.unwrap();

        let err = f
            .storage
            .set(bg, StorageArea::Local, items(json!({"b": 2, "c": "x".repeat(30)})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota"));

        let all = f.storage.get(bg, StorageArea::Local, &StorageKeys::All).await.unwrap();
        assert_eq!(Value::Object(all), json!({"a": 1}));
        f.registry.invoke(bg, |_| ()).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unlimited_storage_permission() {
        let f = fixture_with(StorageConfig {
            local_quota_bytes: Some(4),
            ..StorageConfig::default()
        });
        f.gate.grant(
            ext("a"),
            PermissionSet::from_manifest(["storage", "unlimitedStorage"]),
        );
        let bg = f.registry.register(ExecutionContext::background(ext("a")));

        f.storage
            .set(bg, StorageArea::Local, items(json!({"large": "x".repeat(100)})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_bytes_in_use() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));
        f.storage
            .set(bg, StorageArea::Local, items(json!({"key": "value", "n": 10})))
            .await
            .unwrap();

        let total = f
            .storage
            .get_bytes_in_use(bg, StorageArea::Local, &StorageKeys::All)
            .await
            .unwrap();
        assert_eq!(total, (3 + 7) + (1 + 2));

        let one = f
            .storage
            .get_bytes_in_use(bg, StorageArea::Local, &StorageKeys::Key("key".into()))
            .await
            .unwrap();
        assert_eq!(one, 10);
    }

    #[tokio::test]
    async fn test_corrupted_partition_reports_internal_error() {
        let f = fixture();
        f.provider.corrupt(ext("a"), StorageArea::Local);
        let bg = f.registry.register(ExecutionContext::background(ext("a")));

        for _ in 0..2 {
            let err = f
                .storage
                .get(bg, StorageArea::Local, &StorageKeys::All)
                .await
                .unwrap_err();
            assert!(err.to_string().contains("Internal error"));
        }
        let err = f
            .storage
            .set(bg, StorageArea::Local, items(json!({"k": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Internal(_)));

        // Other areas are unaffected.
        assert!(f.storage.get(bg, StorageArea::Sync, &StorageKeys::All).await.is_ok());
    }

    #[tokio::test]
    async fn test_transient_load_failure_retries() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));

        f.provider.set_failing(true);
        assert!(matches!(
            f.storage.get(bg, StorageArea::Local, &StorageKeys::All).await,
            Err(ExtensionError::Internal(_))
        ));

        f.provider.set_failing(false);
        assert!(f.storage.get(bg, StorageArea::Local, &StorageKeys::All).await.is_ok());
    }

    #[tokio::test]
    async fn test_persist_failure_leaves_state_unchanged() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));
        f.storage
            .set(bg, StorageArea::Local, items(json!({"k": 1})))
            .await
            .unwrap();

        f.provider.set_failing(true);
        assert!(f
            .storage
            .set(bg, StorageArea::Local, items(json!({"k": 2})))
            .await
            .is_err());
        f.provider.set_failing(false);

        let all = f.storage.get(bg, StorageArea::Local, &StorageKeys::All).await.unwrap();
        assert_eq!(Value::Object(all), json!({"k": 1}));
    }

    #[tokio::test]
    async fn test_session_never_reaches_provider() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));
        f.storage
            .set(bg, StorageArea::Session, items(json!({"token": "abc"})))
            .await
            .unwrap();

        assert_eq!(f.provider.stored(&ext("a"), StorageArea::Session), None);
    }

    #[tokio::test]
    async fn test_extensions_are_isolated() {
        let f = fixture();
        f.gate.grant(ext("b"), PermissionSet::from_manifest(["storage"]));
        let a = f.registry.register(ExecutionContext::background(ext("a")));
        let b = f.registry.register(ExecutionContext::background(ext("b")));
        let mut b_events = watch(&f.registry, b);

        f.storage
            .set(a, StorageArea::Local, items(json!({"shared-name": "a"})))
            .await
            .unwrap();

        let seen_by_b = f.storage.get(b, StorageArea::Local, &StorageKeys::All).await.unwrap();
        assert!(seen_by_b.is_empty());
        f.registry.invoke(b, |_| ()).await.unwrap();
        assert!(b_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_set_access_level_on_corrupted_partition_fails() {
        let f = fixture();
        f.provider.corrupt(ext("a"), StorageArea::Local);
        let bg = f.registry.register(ExecutionContext::background(ext("a")));

        let err = f
            .storage
            .set_access_level(bg, StorageArea::Local, "TRUSTED_CONTEXTS")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Internal(_)));
        assert_eq!(
            f.storage.access_level(&ext("a"), StorageArea::Local).await,
            AccessLevel::TrustedAndUntrustedContexts
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sets_are_serialized() {
        let f = fixture();
        let bg = f.registry.register(ExecutionContext::background(ext("a")));
        let mut events = watch(&f.registry, bg);

        let writes = (0..32).map(|i| {
            let storage = f.storage.clone();
            tokio::spawn(async move {
                storage
                    .set(bg, StorageArea::Local, vec![(format!("k{}", i), ScriptValue::from(i))])
                    .await
            })
        });
        for result in futures::future::join_all(writes).await {
            result.unwrap().unwrap();
        }

        let all = f.storage.get(bg, StorageArea::Local, &StorageKeys::All).await.unwrap();
        assert_eq!(all.len(), 32);
        assert_eq!(f.provider.stored(&ext("a"), StorageArea::Local).unwrap().len(), 32);

        let mut seen = Vec::new();
        for _ in 0..32 {
            let (changes, _) = events.recv().await.unwrap();
            assert_eq!(changes.len(), 1);
            let (key, change) = changes.iter().next().unwrap();
            assert_eq!(change.old_value, None);
            seen.push(key.clone());
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 32);
    }
}
