//! # Resource Core
//!
//! Versioned property metadata for pipeline resources.
//!
//! Every resource, identified by a stable UUID, owns an append-only log of
//! property edits. Each edit carries a logical tick and a platform, and a
//! property is resolved for a platform by falling back through increasingly
//! generic platform tiers. Large values live in a content-addressed blob store
//! next to the logs.
//!
//! ## Features
//!
//! - Append-only statement logs with last-writer-wins resolution
//! - Hierarchical platform identifiers with fallback chains
//! - History collapse that preserves every resolution result
//! - Content-addressed blob storage with garbage collection
//! - Text and binary log encodings
//! - Stable path to id lookup for imported source files
//!
//! ## Example
//!
//! ```no_run
//! use resource_core::{KeyHash, Platform, Store};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::new("./resources");
//!
//! // Find the id of an imported file
//! let entry = store.import_map().lookup(Path::new("./assets/ship.obj"))?;
//!
//! // Load its log and record an edit
//! let mut source = store.read_source(entry.id)?;
//! let tick = source.last_tick().map_or(1, |t| t + 1);
//! source.set(tick, KeyHash::of("scale"), Platform::GENERIC, "2.0")?;
//!
//! // Drop history and unreferenced blobs, then persist
//! source.collapse_history();
//! let stats = store.clear_blob_history(&source, false)?;
//! println!("Deleted {} blobs", stats.blobs_deleted);
//! store.write_source(&source, resource_core::Encoding::Text)?;
//! # Ok(())
//! # }
//! ```

mod blob;
mod config;
mod edit;
mod error;
mod gc;
mod hash;
mod import;
mod platform;
mod source;
mod store;

pub use blob::{BlobReader, BlobStore, StoredBlob};
pub use config::{Config, SOURCE_PATH_ENV};
pub use edit::{EditReport, Operation, SkippedOperation, apply};
pub use error::{Error, Result};
pub use gc::GcStats;
pub use hash::{Algorithm, Hash, KeyHash};
pub use import::{ImportEntry, ImportMap, normalize_path};
pub use platform::{FallbackChain, GROUP_COUNT, GROUP_NAMES, Platform, PlatformDeclaration};
pub use source::{Encoding, Op, ResourceSource, Resolved, Statement, Tick};
pub use store::Store;
