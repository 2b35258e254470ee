//! Extension runtime.
//!
//! Hosts mutually isolated extension contexts and implements the two
//! contracts they use to cooperate: one-shot messaging and extension
//! storage.
//!
//! # Architecture
//!
//! ```text
//! ExtensionHost
//! ├── registry: ContextRegistry      live contexts, turn queues, listeners
//! ├── gate: PermissionGate           granted permissions per extension
//! ├── router: MessageRouter          sendMessage / onMessage, broadcast
//! └── storage: StorageManager        local / sync / session / managed
//!     └── provider: StorageProvider  load / persist partitions
//! ```
//!
//! Nothing is shared by reference between contexts. Values crossing a
//! boundary are structured-cloned (see [`value`]), and every listener and
//! callback runs on the turn queue of the context it belongs to.

pub mod api;
pub mod context;
mod error;
mod host;
pub mod permissions;
pub mod router;
pub mod storage;
pub mod value;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use api::{ChangeEvents, ExtensionApi, MessageEvents, RuntimeApi, StorageAreaApi};
pub use context::{
    ContextFilter, ContextHandle, ContextRegistry, ContextRole, ExecutionContext, ListenerId,
    RoleKind, SenderMetadata, TabInfo, Trust,
};
pub use error::{ExtensionError, ExtensionResult, LastError, Reply};
pub use host::{ActiveExtension, ExtensionHost};
pub use permissions::{Permission, PermissionGate, PermissionSet};
pub use router::{
    ListenerReply, Message, MessageOptions, MessageRouter, MessageSender, RequestId, Responder,
};
pub use storage::{
    AccessLevel, JsonFileStorageProvider, MemoryStorageProvider, StorageArea, StorageChange,
    StorageChanges, StorageKeys, StorageManager, StorageProvider,
};
pub use value::{ClonePolicy, ScriptArray, ScriptObject, ScriptValue};

/// Unique identifier for an extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionId(String);

impl ExtensionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExtensionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ExtensionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
