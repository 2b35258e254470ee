//! End-to-end storage behavior through the host and the per-context API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use nova_webext::extensions::{
    ContextHandle, ExtensionError, ExtensionHost, ExtensionId, MemoryStorageProvider,
    PermissionSet, Reply, ScriptObject, ScriptValue, SenderMetadata, StorageArea, StorageChange,
    StorageChanges, StorageKeys,
};
use nova_webext::Config;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::time::timeout;

fn ext(id: &str) -> ExtensionId {
    ExtensionId::new(id)
}

fn host_with(config: Config) -> ExtensionHost {
    let host = ExtensionHost::new(config, Arc::new(MemoryStorageProvider::new())).unwrap();
    host.activate(ext("a"), PermissionSet::from_manifest(["storage"]))
        .unwrap();
    host
}

fn host() -> ExtensionHost {
    host_with(Config::default())
}

async fn call<F>(start: F) -> Reply
where
    F: FnOnce(Box<dyn FnOnce(Reply) + Send>) -> Result<(), ExtensionError>,
{
    let (tx, rx) = oneshot::channel();
    start(Box::new(move |reply| {
        let _ = tx.send(reply);
    }))
    .unwrap();
    timeout(Duration::from_secs(5), rx)
        .await
        .expect("reply timed out")
        .expect("callback dropped")
}

type Seen = Arc<Mutex<Vec<(StorageArea, StorageChanges)>>>;

fn watch(host: &ExtensionHost, handle: ContextHandle) -> Seen {
    let seen: Seen = Arc::default();
    let sink = seen.clone();
    host.api(handle)
        .storage_on_changed()
        .add_listener(move |changes, area| {
            sink.lock().unwrap().push((area, changes.clone()));
            Ok(())
        })
        .unwrap();
    seen
}

/// Wait until every job already queued on `handle` has run.
async fn flush(host: &ExtensionHost, handle: ContextHandle) {
    host.registry().invoke(handle, |_| ()).await.unwrap();
}

async fn get_all(host: &ExtensionHost, handle: ContextHandle, area: StorageArea) -> Value {
    let api = host.api(handle);
    call(|cb| api.storage(area).get(&Value::Null, cb))
        .await
        .value
        .unwrap()
}

#[tokio::test]
async fn test_round_trip_is_a_deep_copy() {
    let host = host();
    let bg = host.attach_background(&ext("a")).unwrap();
    let api = host.api(bg);

    let inner = ScriptObject::new();
    inner.set("count", 1);
    inner.set("tags", ScriptValue::from(json!(["x", "y"])));
    let items = ScriptObject::new();
    items.set("k", inner.clone());

    let reply = call(|cb| api.storage(StorageArea::Local).set(items.clone(), cb)).await;
    assert!(!reply.is_err());

    inner.set("count", 2);
    inner.remove("tags");

    let reply = call(|cb| api.storage(StorageArea::Local).get(&json!("k"), cb)).await;
    assert_eq!(
        reply.value,
        Some(json!({"k": {"count": 1, "tags": ["x", "y"]}}))
    );
}

#[tokio::test]
async fn test_get_with_defaults_and_bytes_in_use() {
    let host = host();
    let bg = host.attach_background(&ext("a")).unwrap();
    let api = host.api(bg);

    let items: ScriptObject = [("a", ScriptValue::from(1)), ("b", ScriptValue::from("xy"))]
        .into_iter()
        .collect();
    call(|cb| api.storage(StorageArea::Local).set(items, cb)).await;

    let reply = call(|cb| {
        api.storage(StorageArea::Local)
            .get(&json!({"a": 0, "missing": "default"}), cb)
    })
    .await;
    assert_eq!(reply.value, Some(json!({"a": 1, "missing": "default"})));

    // "a" + "1" and "b" + "\"xy\"".
    let reply = call(|cb| api.storage(StorageArea::Local).get_bytes_in_use(&Value::Null, cb)).await;
    assert_eq!(reply.value, Some(json!(7)));
    let reply = call(|cb| api.storage(StorageArea::Local).get_bytes_in_use(&json!(["a"]), cb)).await;
    assert_eq!(reply.value, Some(json!(2)));
}

#[tokio::test]
async fn test_identical_write_fires_no_change() {
    let host = host();
    let bg = host.attach_background(&ext("a")).unwrap();
    let cs = host
        .attach_content_script(&ext("a"), SenderMetadata::default())
        .unwrap();
    let seen = watch(&host, cs);
    let api = host.api(bg);

    for value in ["old", "old", "new"] {
        let items: ScriptObject = [("k", value)].into_iter().collect();
        let reply = call(|cb| api.storage(StorageArea::Local).set(items, cb)).await;
        assert!(!reply.is_err());
    }
    flush(&host, cs).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(
        seen[1].1.get("k"),
        Some(&StorageChange {
            old_value: Some(json!("old")),
            new_value: Some(json!("new")),
        })
    );
    assert!(seen.iter().all(|(area, _)| *area == StorageArea::Local));
}

#[tokio::test]
async fn test_access_level_gates_untrusted_listeners() {
    let host = host();
    let bg = host.attach_background(&ext("a")).unwrap();
    let page = host
        .attach_page(&ext("a"), SenderMetadata::default())
        .unwrap();
    let seen = watch(&host, page);
    let api = host.api(bg);

    let hidden: ScriptObject = [("hidden", true)].into_iter().collect();
    call(|cb| api.storage(StorageArea::Local).set(hidden, cb)).await;
    flush(&host, page).await;
    assert!(seen.lock().unwrap().is_empty());

    // Untrusted contexts cannot read the area yet.
    let page_api = host.api(page);
    let reply = call(|cb| page_api.storage(StorageArea::Local).get(&Value::Null, cb)).await;
    assert_eq!(
        reply.error_message(),
        Some("Access to storage.local is not allowed from this context")
    );

    // Nor may they change the level.
    let reply = call(|cb| {
        page_api
            .storage(StorageArea::Local)
            .set_access_level(&json!({"accessLevel": "TRUSTED_AND_UNTRUSTED_CONTEXTS"}), cb)
    })
    .await;
    assert_eq!(
        reply.error_message(),
        Some("Untrusted sender cannot set access level")
    );

    let reply = call(|cb| {
        api.storage(StorageArea::Local)
            .set_access_level(&json!({"accessLevel": "TRUSTED_AND_UNTRUSTED_CONTEXTS"}), cb)
    })
    .await;
    assert!(!reply.is_err());

    let visible: ScriptObject = [("visible", true)].into_iter().collect();
    call(|cb| api.storage(StorageArea::Local).set(visible, cb)).await;
    flush(&host, page).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].1.contains_key("visible"));
    assert!(!seen[0].1.contains_key("hidden"));
}

#[tokio::test]
async fn test_invalid_access_level_is_reported() {
    let host = host();
    let bg = host.attach_background(&ext("a")).unwrap();
    let api = host.api(bg);

    let reply = call(|cb| {
        api.storage(StorageArea::Local)
            .set_access_level(&json!({"accessLevel": "EVERYONE"}), cb)
    })
    .await;
    assert_eq!(reply.error_message(), Some("Invalid access level: EVERYONE"));

    let reply = call(|cb| api.storage(StorageArea::Local).set_access_level(&json!({}), cb)).await;
    assert!(reply.is_err());

    assert!(matches!(
        api.storage(StorageArea::Local)
            .set_access_level(&json!("TRUSTED_CONTEXTS"), |_| {}),
        Err(ExtensionError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_quota_failure_is_atomic() {
    let mut config = Config::default();
    config.storage.local_quota_bytes = Some(64);
    let host = host_with(config);
    let bg = host.attach_background(&ext("a")).unwrap();
    let api = host.api(bg);

    let first: ScriptObject = [("kept", "small")].into_iter().collect();
    call(|cb| api.storage(StorageArea::Local).set(first, cb)).await;
    let before = get_all(&host, bg, StorageArea::Local).await;

    let oversized: ScriptObject = [
        ("kept", ScriptValue::from("changed")),
        ("big", ScriptValue::from("x".repeat(100))),
    ]
    .into_iter()
    .collect();
    let reply = call(|cb| api.storage(StorageArea::Local).set(oversized, cb)).await;
    assert_eq!(reply.error_message(), Some("QUOTA_BYTES quota exceeded"));

    assert_eq!(get_all(&host, bg, StorageArea::Local).await, before);
}

#[tokio::test]
async fn test_sync_per_item_quota() {
    let host = host();
    let bg = host.attach_background(&ext("a")).unwrap();
    let api = host.api(bg);

    let items: ScriptObject = [("huge", "x".repeat(9000))].into_iter().collect();
    let reply = call(|cb| api.storage(StorageArea::Sync).set(items, cb)).await;
    assert_eq!(
        reply.error_message(),
        Some("QUOTA_BYTES_PER_ITEM quota exceeded")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_sees_whole_values() {
    let host = host();
    let bg = host.attach_background(&ext("a")).unwrap();
    let pair = |n: i64| -> Vec<(String, ScriptValue)> {
        vec![("a".into(), ScriptValue::from(n)), ("b".into(), ScriptValue::from(n))]
    };

    host.storage()
        .set(bg, StorageArea::Local, pair(0))
        .await
        .unwrap();

    for round in 1..=50i64 {
        let storage = host.storage().clone();
        let writer =
            tokio::spawn(async move { storage.set(bg, StorageArea::Local, pair(round)).await });
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let storage = host.storage().clone();
                tokio::spawn(async move {
                    storage
                        .get(bg, StorageArea::Local, &StorageKeys::All)
                        .await
                })
            })
            .collect();

        writer.await.unwrap().unwrap();
        let before = json!({"a": round - 1, "b": round - 1});
        let after = json!({"a": round, "b": round});
        for reader in readers {
            let seen = Value::Object(reader.await.unwrap().unwrap());
            assert!(seen == before || seen == after, "partial state: {}", seen);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_calls_from_one_context_apply_in_order() {
    let host = host();
    let bg = host.attach_background(&ext("a")).unwrap();
    let api = host.api(bg);
    let local = api.storage(StorageArea::Local);

    for round in 0..100 {
        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();
        let (read_tx, read_rx) = oneshot::channel();
        local
            .set(json!({"k": 1}), move |reply| {
                let _ = first_tx.send(reply);
            })
            .unwrap();
        local
            .set(json!({"k": 2}), move |reply| {
                let _ = second_tx.send(reply);
            })
            .unwrap();
        local
            .get(&json!("k"), move |reply| {
                let _ = read_tx.send(reply);
            })
            .unwrap();

        for rx in [first_rx, second_rx] {
            assert!(!timeout(Duration::from_secs(5), rx).await.unwrap().unwrap().is_err());
        }
        let read = timeout(Duration::from_secs(5), read_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.value, Some(json!({"k": 2})), "stale read in round {}", round);

        let stored = host
            .storage()
            .get(bg, StorageArea::Local, &StorageKeys::Key("k".into()))
            .await
            .unwrap();
        assert_eq!(Value::Object(stored), json!({"k": 2}), "lost write in round {}", round);
    }
}

#[tokio::test]
async fn test_storage_requires_permission_except_managed() {
    let host = host();
    host.activate(ext("b"), PermissionSet::new()).unwrap();
    let bg = host.attach_background(&ext("b")).unwrap();
    let api = host.api(bg);

    let reply = call(|cb| api.storage(StorageArea::Local).get(&Value::Null, cb)).await;
    assert_eq!(
        reply.error_message(),
        Some("Missing required permission: storage")
    );

    let reply = call(|cb| api.storage(StorageArea::Managed).get(&Value::Null, cb)).await;
    assert_eq!(reply.value, Some(json!({})));

    let items: ScriptObject = [("k", 1)].into_iter().collect();
    let reply = call(|cb| api.storage(StorageArea::Managed).set(items, cb)).await;
    assert!(reply.is_err());
}

#[tokio::test]
async fn test_argument_errors_are_synchronous() {
    let host = host();
    let bg = host.attach_background(&ext("a")).unwrap();
    let api = host.api(bg);
    let area = api.storage(StorageArea::Local);

    assert!(matches!(
        area.set(ScriptValue::from("not an object"), |_| {}),
        Err(ExtensionError::InvalidArgument(_))
    ));
    assert!(matches!(
        area.get(&json!(42), |_| {}),
        Err(ExtensionError::InvalidArgument(_))
    ));
    assert!(matches!(
        area.remove(&Value::Null, |_| {}),
        Err(ExtensionError::InvalidArgument(_))
    ));

    host.detach(bg);
    assert!(matches!(
        area.clear(|_| {}),
        Err(ExtensionError::ContextGone)
    ));
}

#[tokio::test]
async fn test_remove_and_clear() {
    let host = host();
    let bg = host.attach_background(&ext("a")).unwrap();
    let seen = watch(&host, bg);
    let api = host.api(bg);

    let items: ScriptObject = [("a", 1), ("b", 2), ("c", 3)].into_iter().collect();
    call(|cb| api.storage(StorageArea::Session).set(items, cb)).await;
    call(|cb| api.storage(StorageArea::Session).remove(&json!(["a", "zzz"]), cb)).await;
    assert_eq!(
        get_all(&host, bg, StorageArea::Session).await,
        json!({"b": 2, "c": 3})
    );

    call(|cb| api.storage(StorageArea::Session).clear(cb)).await;
    assert_eq!(get_all(&host, bg, StorageArea::Session).await, json!({}));

    // Clearing an empty area changes nothing.
    call(|cb| api.storage(StorageArea::Session).clear(cb)).await;
    flush(&host, bg).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[1].1.keys().collect::<Vec<_>>(), vec!["a"]);
    assert_eq!(seen[2].1.keys().collect::<Vec<_>>(), vec!["b", "c"]);
    assert_eq!(seen[2].1["b"].new_value, None);
}
