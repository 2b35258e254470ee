//! Nova WebExt - in-process browser extension runtime.
//!
//! Hosts many mutually isolated extension contexts (background scripts,
//! content scripts, untrusted pages) in one process and lets them talk only
//! through the extension messaging and extension storage contracts.
//!
//! # Architecture
//!
//! The library is organized into these main modules:
//!
//! - [`config`] - Configuration loading and management
//! - [`logging`] - `tracing` subscriber setup
//! - [`extensions`] - Context registry, permission gate, message router,
//!   storage manager and the script-facing API surface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nova_webext::extensions::{ExtensionHost, ExtensionId, MemoryStorageProvider, PermissionSet};
//! use nova_webext::{Config, ExtensionResult};
//!
//! #[tokio::main]
//! async fn main() -> ExtensionResult<()> {
//!     let host = ExtensionHost::new(Config::default(), Arc::new(MemoryStorageProvider::new()))?;
//!     let id = ExtensionId::new("my-extension");
//!     host.activate(id.clone(), PermissionSet::from_manifest(["storage"]))?;
//!     let background = host.attach_background(&id)?;
//!     let api = host.api(background);
//!     api.runtime().send_message(serde_json::json!({"hello": "world"}), |reply| {
//!         println!("{:?}", reply);
//!     })?;
//!     Ok(())
//! }
//! ```

// Public modules
pub mod config;
pub mod extensions;
pub mod logging;

// Internal modules
mod error;

// Re-export commonly used types for convenience
pub use config::Config;
pub use error::{NovaError, NovaResult};
pub use extensions::{ExtensionError, ExtensionHost, ExtensionId, ExtensionResult};
