// src/core/objects/mod.rs

//! The object-reference model: content-addressed object ids with global
//! reference counts, unready → ready/error transitions, the blob-store
//! indirection, and the multi-object wait primitive.

pub mod blob;
pub mod store;
pub mod waiting;

pub use blob::{BlobStore, MemoryBlobStore};
pub use store::ObjectStore;
pub use waiting::{WaitManager, WaitResult};
