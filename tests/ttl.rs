//! Property 5 (TTL correctness) and scenario S1 from `spec.md` §8.

use std::thread::sleep;
use std::time::Duration;

use serde_json::json;
use tenant_storage_core::StorageCore;
use tenant_storage_core::config::StorageConfig;
use tenant_storage_core::context::OpContext;

#[test]
fn s1_kv_ttl_lifecycle() {
    let core = StorageCore::open_in_memory(StorageConfig::default()).unwrap();
    let ctx = OpContext::background();

    core.kv.set(&ctx, "app1", "s", json!({"x": 1}), Some(120)).unwrap();
    assert_eq!(core.kv.get(&ctx, "app1", "s").unwrap(), Some(json!({"x": 1})));

    sleep(Duration::from_millis(160));
    assert_eq!(core.kv.get(&ctx, "app1", "s").unwrap(), None);

    let removed = core.kv.sweep_expired(&ctx).unwrap();
    assert_eq!(removed, 1);
}

#[test]
fn entries_without_ttl_never_expire() {
    let core = StorageCore::open_in_memory(StorageConfig::default()).unwrap();
    let ctx = OpContext::background();
    core.kv.set(&ctx, "app1", "permanent", json!("stays"), None).unwrap();
    sleep(Duration::from_millis(20));
    assert_eq!(core.kv.get(&ctx, "app1", "permanent").unwrap(), Some(json!("stays")));
    assert_eq!(core.kv.sweep_expired(&ctx).unwrap(), 0);
}
