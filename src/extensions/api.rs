//! The API surface one context sees: `chrome.runtime` messaging and
//! `chrome.storage`.
//!
//! Every callback-taking method validates its arguments synchronously and
//! returns the error directly. Otherwise the callback always runs later on
//! the calling context's turn queue, with `last_error` set on failure.
//! Storage calls run on the context's operation queue, so they take effect
//! in the order the context made them.

use std::future::Future;

use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use super::context::{ContextHandle, ContextRegistry, ListenerId};
use super::error::{ExtensionError, ExtensionResult, Reply};
use super::router::{
    ListenerReply, Message, MessageOptions, MessageRouter, MessageSender, RequestId, Responder,
};
use super::storage::{StorageArea, StorageChanges, StorageKeys, StorageManager};
use super::value::ScriptValue;
use super::ExtensionId;

/// Everything a single context can reach. Cloning is cheap.
#[derive(Clone)]
pub struct ExtensionApi {
    context: ContextHandle,
    registry: ContextRegistry,
    router: MessageRouter,
    storage: StorageManager,
}

impl ExtensionApi {
    pub(crate) fn new(
        context: ContextHandle,
        registry: ContextRegistry,
        router: MessageRouter,
        storage: StorageManager,
    ) -> Self {
        Self {
            context,
            registry,
            router,
            storage,
        }
    }

    pub fn context(&self) -> ContextHandle {
        self.context
    }

    /// `chrome.runtime`
    pub fn runtime(&self) -> RuntimeApi<'_> {
        RuntimeApi { api: self }
    }

    /// `chrome.storage.<area>`
    pub fn storage(&self, area: StorageArea) -> StorageAreaApi<'_> {
        StorageAreaApi { api: self, area }
    }

    /// `chrome.storage.onChanged`
    pub fn storage_on_changed(&self) -> ChangeEvents<'_> {
        ChangeEvents { api: self }
    }

    /// Queue `operation` behind this context's earlier calls and deliver
    /// its result to `callback` on the context's turn queue.
    fn reply_later<Fut, F>(&self, operation: Fut, callback: F) -> ExtensionResult<()>
    where
        Fut: Future<Output = ExtensionResult<Option<Value>>> + Send + 'static,
        F: FnOnce(Reply) + Send + 'static,
    {
        let registry = self.registry.clone();
        let context = self.context;
        let queued = self.registry.enqueue_operation(
            context,
            async move {
                let reply = Reply::from_result(operation.await);
                if !registry.schedule(context, Box::new(move || callback(reply))) {
                    debug!(context = %context, "context gone, callback dropped");
                }
            }
            .boxed(),
        );
        if queued {
            Ok(())
        } else {
            Err(ExtensionError::ContextGone)
        }
    }

    fn ensure_alive(&self) -> ExtensionResult<()> {
        if self.registry.is_alive(self.context) {
            Ok(())
        } else {
            Err(ExtensionError::ContextGone)
        }
    }
}

/// `chrome.runtime` for one context.
pub struct RuntimeApi<'a> {
    api: &'a ExtensionApi,
}

impl RuntimeApi<'_> {
    /// `runtime.id`
    pub fn id(&self) -> Option<ExtensionId> {
        self.api
            .registry
            .context(self.api.context)
            .map(|context| context.owning_extension.clone())
    }

    /// `runtime.sendMessage(message, callback)` to this extension.
    pub fn send_message<F>(
        &self,
        payload: impl Into<ScriptValue>,
        callback: F,
    ) -> ExtensionResult<RequestId>
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        self.api
            .router
            .send_message(Message::new(self.api.context, payload), callback)
    }

    /// `runtime.sendMessage(extensionId, message, options, callback)`.
    pub fn send_message_to<F>(
        &self,
        extension: ExtensionId,
        payload: impl Into<ScriptValue>,
        options: MessageOptions,
        callback: F,
    ) -> ExtensionResult<RequestId>
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        let message = Message::new(self.api.context, payload)
            .with_target(extension)
            .with_options(options);
        self.api.router.send_message(message, callback)
    }

    /// `runtime.onMessage`
    pub fn on_message(&self) -> MessageEvents<'_> {
        MessageEvents {
            api: self.api,
            external: false,
        }
    }

    /// `runtime.onMessageExternal`: messages from other extensions.
    pub fn on_message_external(&self) -> MessageEvents<'_> {
        MessageEvents {
            api: self.api,
            external: true,
        }
    }
}

/// `runtime.onMessage` or `runtime.onMessageExternal` for one context.
pub struct MessageEvents<'a> {
    api: &'a ExtensionApi,
    external: bool,
}

impl MessageEvents<'_> {
    pub fn add_listener<F>(&self, listener: F) -> ExtensionResult<ListenerId>
    where
        F: Fn(&Value, &MessageSender, Responder) -> anyhow::Result<ListenerReply>
            + Send
            + Sync
            + 'static,
    {
        let registry = &self.api.registry;
        let listener = std::sync::Arc::new(listener);
        if self.external {
            registry.add_external_message_listener(self.api.context, listener)
        } else {
            registry.add_message_listener(self.api.context, listener)
        }
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.api.registry.remove_listener(self.api.context, id)
    }

    pub fn has_listener(&self, id: ListenerId) -> bool {
        self.api.registry.has_listener(self.api.context, id)
    }

    pub fn has_listeners(&self) -> bool {
        if self.external {
            self.api.registry.has_external_message_listeners(self.api.context)
        } else {
            self.api.registry.has_message_listeners(self.api.context)
        }
    }
}

/// `storage.onChanged` for one context.
pub struct ChangeEvents<'a> {
    api: &'a ExtensionApi,
}

impl ChangeEvents<'_> {
    pub fn add_listener<F>(&self, listener: F) -> ExtensionResult<ListenerId>
    where
        F: Fn(&StorageChanges, StorageArea) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.api
            .registry
            .add_change_listener(self.api.context, std::sync::Arc::new(listener))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.api.registry.remove_listener(self.api.context, id)
    }

    pub fn has_listener(&self, id: ListenerId) -> bool {
        self.api.registry.has_listener(self.api.context, id)
    }

    pub fn has_listeners(&self) -> bool {
        self.api.registry.has_change_listeners(self.api.context)
    }
}

/// One `chrome.storage` area as seen by one context.
pub struct StorageAreaApi<'a> {
    api: &'a ExtensionApi,
    area: StorageArea,
}

impl StorageAreaApi<'_> {
    pub fn area(&self) -> StorageArea {
        self.area
    }

    /// `get(keys, callback)`. `keys` is `null`, a string, an array of
    /// strings, or an object of defaults.
    pub fn get<F>(&self, keys: &Value, callback: F) -> ExtensionResult<()>
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        self.api.ensure_alive()?;
        let keys = StorageKeys::from_json(keys)?;
        let storage = self.api.storage.clone();
        let (caller, area) = (self.api.context, self.area);
        self.api.reply_later(
            async move {
                let items = storage.get(caller, area, &keys).await?;
                Ok(Some(Value::Object(items)))
            },
            callback,
        )
    }

    /// `set(items, callback)`. `items` must be an object.
    pub fn set<F>(&self, items: impl Into<ScriptValue>, callback: F) -> ExtensionResult<()>
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        self.api.ensure_alive()?;
        let entries = match items.into() {
            ScriptValue::Object(object) => object.entries(),
            _ => {
                return Err(ExtensionError::InvalidArgument(
                    "storage.set expects an object".to_string(),
                ))
            }
        };
        let storage = self.api.storage.clone();
        let (caller, area) = (self.api.context, self.area);
        self.api.reply_later(
            async move {
                storage.set(caller, area, entries).await?;
                Ok(None)
            },
            callback,
        )
    }

    /// `remove(keys, callback)`. `keys` is a string or an array of strings.
    pub fn remove<F>(&self, keys: &Value, callback: F) -> ExtensionResult<()>
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        self.api.ensure_alive()?;
        let keys = match StorageKeys::from_json(keys)? {
            StorageKeys::Key(key) => vec![key],
            StorageKeys::Keys(keys) => keys,
            _ => {
                return Err(ExtensionError::InvalidArgument(
                    "storage.remove expects a string or an array of strings".to_string(),
                ))
            }
        };
        let storage = self.api.storage.clone();
        let (caller, area) = (self.api.context, self.area);
        self.api.reply_later(
            async move {
                storage.remove(caller, area, &keys).await?;
                Ok(None)
            },
            callback,
        )
    }

    /// `clear(callback)`
    pub fn clear<F>(&self, callback: F) -> ExtensionResult<()>
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        self.api.ensure_alive()?;
        let storage = self.api.storage.clone();
        let (caller, area) = (self.api.context, self.area);
        self.api.reply_later(
            async move {
                storage.clear(caller, area).await?;
                Ok(None)
            },
            callback,
        )
    }

    /// `getBytesInUse(keys, callback)`
    pub fn get_bytes_in_use<F>(&self, keys: &Value, callback: F) -> ExtensionResult<()>
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        self.api.ensure_alive()?;
        let keys = StorageKeys::from_json(keys)?;
        let storage = self.api.storage.clone();
        let (caller, area) = (self.api.context, self.area);
        self.api.reply_later(
            async move {
                let bytes = storage.get_bytes_in_use(caller, area, &keys).await?;
                Ok(Some(Value::from(bytes)))
            },
            callback,
        )
    }

    /// `setAccessLevel({accessLevel}, callback)`
    pub fn set_access_level<F>(&self, details: &Value, callback: F) -> ExtensionResult<()>
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        self.api.ensure_alive()?;
        let Value::Object(details) = details else {
            return Err(ExtensionError::InvalidArgument(
                "setAccessLevel expects an object".to_string(),
            ));
        };
        let level = details
            .get("accessLevel")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let storage = self.api.storage.clone();
        let (caller, area) = (self.api.context, self.area);
        self.api.reply_later(
            async move {
                let level = level.ok_or_else(|| {
                    ExtensionError::InvalidAccessLevel("missing accessLevel".to_string())
                })?;
                storage.set_access_level(caller, area, &level).await?;
                Ok(None)
            },
            callback,
        )
    }
}
