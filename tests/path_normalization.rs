//! Property 7 (idempotent path normalization) from `spec.md` §8.

use tenant_storage_core::StorageCore;
use tenant_storage_core::config::StorageConfig;
use tenant_storage_core::context::OpContext;

#[test]
fn put_via_any_equivalent_path_is_observed_by_get_with_any_other() {
    let core = StorageCore::open_in_memory(StorageConfig::default()).unwrap();
    let ctx = OpContext::background();

    core.blobs.put(&ctx, "app1", "///photos//2024//a.png", b"bytes".to_vec(), "image/png").unwrap();

    for variant in ["photos/2024/a.png", "/photos/2024/a.png", "//photos/2024//a.png"] {
        let blob = core.blobs.get(&ctx, "app1", variant).unwrap();
        assert!(blob.is_some(), "expected a hit for path variant {variant:?}");
        assert_eq!(blob.unwrap().data, b"bytes");
    }
}

#[test]
fn listing_returns_the_normalized_path() {
    let core = StorageCore::open_in_memory(StorageConfig::default()).unwrap();
    let ctx = OpContext::background();
    core.blobs.put(&ctx, "app1", "//a//b", b"x".to_vec(), "text/plain").unwrap();
    let listed = core.blobs.list(&ctx, "app1", "").unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].path, "a/b");
}
