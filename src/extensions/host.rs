//! Extension host - owns the runtime's shared services.
//!
//! The ExtensionHost is responsible for:
//! - Activating and deactivating extensions with their granted permissions
//! - Attaching and detaching execution contexts
//! - Handing each context its [`ExtensionApi`]

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use tokio::runtime::Handle;
use tracing::info;

use super::api::ExtensionApi;
use super::context::{
    ContextFilter, ContextHandle, ContextRegistry, ExecutionContext, RoleKind, SenderMetadata,
};
use super::error::{ExtensionError, ExtensionResult};
use super::permissions::{PermissionGate, PermissionSet};
use super::router::MessageRouter;
use super::storage::{JsonFileStorageProvider, StorageManager, StorageProvider};
use super::ExtensionId;
use crate::config::Config;

/// Bookkeeping for an active extension.
#[derive(Debug, Clone)]
pub struct ActiveExtension {
    pub permissions: PermissionSet,
    pub activated_at: SystemTime,
}

/// Entry point of the runtime.
pub struct ExtensionHost {
    /// Configuration.
    config: Config,

    registry: ContextRegistry,
    gate: PermissionGate,
    router: MessageRouter,
    storage: StorageManager,

    /// Active extensions by ID.
    active: RwLock<HashMap<ExtensionId, ActiveExtension>>,
}

impl ExtensionHost {
    /// Create a host on the ambient tokio runtime.
    pub fn new(config: Config, provider: Arc<dyn StorageProvider>) -> ExtensionResult<Self> {
        let runtime = Handle::try_current().map_err(|e| ExtensionError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(config, provider, runtime))
    }

    /// Create a host whose persisted storage lives in JSON files under
    /// `config.storage.data_dir`.
    pub fn with_file_storage(config: Config) -> ExtensionResult<Self> {
        let provider = JsonFileStorageProvider::new(config.storage.resolved_data_dir());
        info!(root = %provider.root().display(), "using file storage");
        Self::new(config, Arc::new(provider))
    }

    /// Create a host whose turn queues run on `runtime`.
    pub fn with_runtime(
        config: Config,
        provider: Arc<dyn StorageProvider>,
        runtime: Handle,
    ) -> Self {
        let registry = ContextRegistry::new(runtime);
        let gate = PermissionGate::new();
        let router = MessageRouter::new(registry.clone(), &config.router);
        let storage = StorageManager::new(
            registry.clone(),
            router.clone(),
            gate.clone(),
            provider,
            config.storage.clone(),
        );

        Self {
            config,
            registry,
            gate,
            router,
            storage,
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Activate an extension with the permissions it was granted.
    pub fn activate(&self, id: ExtensionId, permissions: PermissionSet) -> ExtensionResult<()> {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(&id) {
            return Err(ExtensionError::InvalidArgument(format!(
                "extension '{}' is already active",
                id
            )));
        }

        self.gate.grant(id.clone(), permissions.clone());
        info!(extension = %id, permissions = ?permissions.enabled_permissions(), "activated extension");
        active.insert(
            id,
            ActiveExtension {
                permissions,
                activated_at: SystemTime::now(),
            },
        );
        Ok(())
    }

    /// Tear down every context of an extension and drop its grants and
    /// in-memory storage. Returns how many contexts were torn down.
    pub fn deactivate(&self, id: &ExtensionId) -> usize {
        let removed = self
            .active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        if removed.is_none() {
            return 0;
        }

        let torn_down = self
            .registry
            .live_contexts(&ContextFilter::for_extension(id.clone()))
            .into_iter()
            .filter(|context| self.registry.unregister(context.handle))
            .count();
        self.gate.revoke(id);
        self.storage.forget_extension(id);

        info!(extension = %id, contexts = torn_down, "deactivated extension");
        torn_down
    }

    pub fn is_active(&self, id: &ExtensionId) -> bool {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn active_extensions(&self) -> Vec<ExtensionId> {
        let mut ids: Vec<_> = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Attach the extension's background script. At most one may be live.
    pub fn attach_background(&self, id: &ExtensionId) -> ExtensionResult<ContextHandle> {
        self.ensure_active(id)?;
        let existing = self.registry.live_contexts(
            &ContextFilter::for_extension(id.clone()).role(RoleKind::BackgroundScript),
        );
        if !existing.is_empty() {
            return Err(ExtensionError::InvalidArgument(format!(
                "extension '{}' already has a background context",
                id
            )));
        }
        Ok(self.registry.register(ExecutionContext::background(id.clone())))
    }

    /// Attach a trusted user-facing context (content script).
    pub fn attach_content_script(
        &self,
        id: &ExtensionId,
        sender: SenderMetadata,
    ) -> ExtensionResult<ContextHandle> {
        self.ensure_active(id)?;
        Ok(self
            .registry
            .register(ExecutionContext::content_script(id.clone(), sender)))
    }

    /// Attach an untrusted user-facing context (web page).
    pub fn attach_page(
        &self,
        id: &ExtensionId,
        sender: SenderMetadata,
    ) -> ExtensionResult<ContextHandle> {
        self.ensure_active(id)?;
        Ok(self.registry.register(ExecutionContext::page(id.clone(), sender)))
    }

    /// Tear down one context.
    pub fn detach(&self, handle: ContextHandle) -> bool {
        self.registry.unregister(handle)
    }

    /// The API object for one context.
    pub fn api(&self, handle: ContextHandle) -> ExtensionApi {
        ExtensionApi::new(
            handle,
            self.registry.clone(),
            self.router.clone(),
            self.storage.clone(),
        )
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.registry
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn permissions(&self) -> &PermissionGate {
        &self.gate
    }

    fn ensure_active(&self, id: &ExtensionId) -> ExtensionResult<()> {
        if self.is_active(id) {
            Ok(())
        } else {
            Err(ExtensionError::InvalidArgument(format!(
                "extension '{}' is not active",
                id
            )))
        }
    }
}

impl std::fmt::Debug for ExtensionHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionHost")
            .field("active", &self.active_extensions())
            .field("contexts", &self.registry.len())
            .finish()
    }
}
