//! End-to-end behavior of a resource log through the public API.

use resource_core::{
    Encoding, Error, Hash, KeyHash, Operation, Platform, PlatformDeclaration, Resolved,
    ResourceSource, Store, apply,
};
use std::fs;
use tempfile::TempDir;
use uuid::Uuid;

const ID: Uuid = Uuid::from_u128(0x5ce7_a410);

fn windows() -> Platform {
    Platform::encode(&PlatformDeclaration {
        platform: 1,
        ..Default::default()
    })
    .unwrap()
}

fn linux() -> Platform {
    Platform::encode(&PlatformDeclaration {
        platform: 2,
        ..Default::default()
    })
    .unwrap()
}

fn value(source: &ResourceSource, key: &str, platform: Platform) -> Option<String> {
    source
        .resolve(KeyHash::of(key), platform)
        .and_then(|r| r.as_str().map(str::to_string))
}

/// Builds the log through the first three edits: two generic sizes and a
/// Windows override.
fn sized_source() -> ResourceSource {
    let size = KeyHash::of("size");
    let mut source = ResourceSource::new(ID);
    source.set(1, size, Platform::GENERIC, "100").unwrap();
    source.set(2, size, Platform::GENERIC, "200").unwrap();
    source.set(3, size, windows(), "150").unwrap();
    source
}

#[test]
fn test_set_then_resolve() {
    let mut source = ResourceSource::new(ID);
    source
        .set(1, KeyHash::of("size"), Platform::GENERIC, "100")
        .unwrap();
    assert_eq!(value(&source, "size", Platform::GENERIC).as_deref(), Some("100"));

    source
        .set(2, KeyHash::of("size"), Platform::GENERIC, "200")
        .unwrap();
    assert_eq!(value(&source, "size", Platform::GENERIC).as_deref(), Some("200"));
}

#[test]
fn test_platform_override_and_fallback() {
    let source = sized_source();
    assert_eq!(value(&source, "size", windows()).as_deref(), Some("150"));
    assert_eq!(value(&source, "size", linux()).as_deref(), Some("200"));
    assert_eq!(value(&source, "size", Platform::GENERIC).as_deref(), Some("200"));
}

#[test]
fn test_generic_tombstone_keeps_override() {
    let mut source = sized_source();
    source
        .unset(4, KeyHash::of("size"), Platform::GENERIC)
        .unwrap();

    assert_eq!(value(&source, "size", Platform::GENERIC), None);
    assert_eq!(value(&source, "size", linux()), None);
    assert_eq!(value(&source, "size", windows()).as_deref(), Some("150"));
}

#[test]
fn test_collapse_preserves_resolution() {
    let mut source = sized_source();
    let before: Vec<Option<String>> = [Platform::GENERIC, windows(), linux()]
        .into_iter()
        .map(|p| value(&source, "size", p))
        .collect();

    source.collapse_history();
    assert_eq!(source.len(), 2);

    let after: Vec<Option<String>> = [Platform::GENERIC, windows(), linux()]
        .into_iter()
        .map(|p| value(&source, "size", p))
        .collect();
    assert_eq!(before, after);

    assert_eq!(source.collapse_history(), 0);
    assert_eq!(source.len(), 2);
}

#[test]
fn test_binary_then_text_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::new(temp_dir.path());
    let mut source = sized_source();
    source
        .set(5, KeyHash::of("name"), linux(), "line one\nline two")
        .unwrap();
    source
        .unset(6, KeyHash::of("size"), Platform::GENERIC)
        .unwrap();

    store.write_source(&source, Encoding::Binary).unwrap();
    let from_binary = store.read_source(ID).unwrap();
    store.write_source(&from_binary, Encoding::Text).unwrap();
    let from_text = store.read_source(ID).unwrap();

    assert_eq!(from_text, source);
    for key in ["size", "name"] {
        for platform in [Platform::GENERIC, windows(), linux()] {
            assert_eq!(
                value(&from_text, key, platform),
                value(&source, key, platform)
            );
        }
    }

    // Same sequence, same bytes
    let first = fs::read(store.source_path(ID)).unwrap();
    store.write_source(&from_text, Encoding::Text).unwrap();
    assert_eq!(fs::read(store.source_path(ID)).unwrap(), first);
}

#[test]
fn test_blob_edit_collapse_and_clear() {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::new(temp_dir.path().join("store"));
    let first = temp_dir.path().join("first.png");
    let second = temp_dir.path().join("second.png");
    fs::write(&first, vec![1u8; 10_000]).unwrap();
    fs::write(&second, b"small").unwrap();

    let mut source = store.read_source(ID).unwrap();
    let ops = vec![
        Operation::Blob {
            key: "texture".to_string(),
            file: first.clone(),
        },
        Operation::Platform(windows()),
        Operation::Blob {
            key: "texture".to_string(),
            file: second.clone(),
        },
        Operation::Platform(Platform::GENERIC),
        Operation::Blob {
            key: "texture".to_string(),
            file: second.clone(),
        },
    ];
    let report = apply(&store, &mut source, &ops, Platform::GENERIC, 1);
    assert_eq!(report.applied, 3);
    assert_eq!(store.blobs().list(ID).unwrap().len(), 3);

    let texture = KeyHash::of("texture");
    let small = Hash::hash_bytes(b"small");
    assert_eq!(
        source.resolve(texture, linux()),
        Some(Resolved::Blob {
            checksum: small,
            size: 5
        })
    );

    source.collapse_history();
    let stats = store.clear_blob_history(&source, false).unwrap();
    assert_eq!(stats.blobs_deleted, 1);
    assert!(stats.bytes_freed > 0);

    let reader = store.open_blob(&source, texture, windows()).unwrap().unwrap();
    assert_eq!(reader.into_bytes(), b"small");
    store.write_source(&source, Encoding::Text).unwrap();
    assert_eq!(store.read_source(ID).unwrap(), source);
}

#[test]
fn test_import_lookup_is_stable_across_stores() {
    let temp_dir = TempDir::new().unwrap();
    let a = Store::new(temp_dir.path().join("a"));
    let b = Store::new(temp_dir.path().join("b"));

    let path = std::path::Path::new("/project/assets/ship.obj");
    let first = a.import_map().lookup(path).unwrap();
    let second = b.import_map().lookup(path).unwrap();
    assert_eq!(first, second);
    assert_eq!(a.import_map().entries().unwrap(), vec![first]);
}

#[test]
fn test_corrupt_log_is_not_silently_truncated() {
    let temp_dir = TempDir::new().unwrap();
    let store = Store::new(temp_dir.path());
    let source = sized_source();
    store.write_source(&source, Encoding::Binary).unwrap();

    let path = store.source_path(ID);
    let mut bytes = fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 2);
    fs::write(&path, bytes).unwrap();

    assert!(matches!(store.read_source(ID), Err(Error::Parse { .. })));
    let (partial, err) = store.read_source_lenient(ID).unwrap();
    assert!(err.is_some());
    assert_eq!(partial.statements(), &source.statements()[..2]);
}
