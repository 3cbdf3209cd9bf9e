//! Property 1 (isolation) and property 2 (user isolation) from `spec.md`
//! §8, exercised across all three engines through a live `StorageCore`.

use serde_json::{Map, json};
use tenant_storage_core::config::StorageConfig;
use tenant_storage_core::context::OpContext;
use tenant_storage_core::documents::QueryOrId;
use tenant_storage_core::scoped::{ScopedBlobs, ScopedDocuments, ScopedKv};
use tenant_storage_core::StorageCore;

fn core() -> StorageCore {
    StorageCore::open_in_memory(StorageConfig::default()).unwrap()
}

#[test]
fn kv_set_in_one_app_is_invisible_to_another() {
    let core = core();
    let ctx = OpContext::background();
    core.kv.set(&ctx, "app-a", "shared-key", json!("secret"), None).unwrap();
    assert_eq!(core.kv.get(&ctx, "app-b", "shared-key").unwrap(), None);
    assert_eq!(core.kv.get(&ctx, "app-a", "shared-key").unwrap(), Some(json!("secret")));
}

#[test]
fn documents_in_one_app_are_invisible_to_another() {
    let core = core();
    let ctx = OpContext::background();
    core.documents
        .insert(&ctx, "app-a", "notes", Map::from_iter([("text".to_string(), json!("private"))]))
        .unwrap();
    let found = core.documents.find(&ctx, "app-b", "notes", &Map::new()).unwrap();
    assert!(found.is_empty());
}

#[test]
fn blobs_in_one_app_are_invisible_to_another() {
    let core = core();
    let ctx = OpContext::background();
    core.blobs.put(&ctx, "app-a", "secret.txt", b"top secret".to_vec(), "text/plain").unwrap();
    assert!(core.blobs.get(&ctx, "app-b", "secret.txt").unwrap().is_none());
}

#[test]
fn user_scoped_kv_is_invisible_across_users_in_the_same_app() {
    let core = core();
    let ctx = OpContext::background();
    let alice = ScopedKv::new(&core.kv, "app1", "alice");
    let bob = ScopedKv::new(&core.kv, "app1", "bob");

    alice.set(&ctx, "diary", json!("alice's secret"), None).unwrap();
    assert_eq!(bob.get(&ctx, "diary").unwrap(), None);
}

#[test]
fn user_scoped_documents_are_invisible_across_users() {
    let core = core();
    let ctx = OpContext::background();
    let alice = ScopedDocuments::new(&core.documents, "app1", "alice");
    let bob = ScopedDocuments::new(&core.documents, "app1", "bob");

    let id = alice
        .insert(&ctx, "journal", Map::from_iter([("entry".to_string(), json!("dear diary"))]))
        .unwrap();

    assert!(bob.find_one(&ctx, "journal", QueryOrId::Id(id)).unwrap().is_none());
    assert_eq!(alice.find(&ctx, "journal", &Map::new()).unwrap().len(), 1);
}

#[test]
fn user_scoped_blobs_are_invisible_across_users() {
    let core = core();
    let ctx = OpContext::background();
    let alice = ScopedBlobs::new(&core.blobs, "app1", "alice");
    let bob = ScopedBlobs::new(&core.blobs, "app1", "bob");

    alice.put(&ctx, "avatar.png", b"alice avatar".to_vec(), "image/png").unwrap();
    assert!(bob.get(&ctx, "avatar.png").unwrap().is_none());
}
