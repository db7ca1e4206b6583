// Store module: local key-value persistence

pub mod backend;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StoreError};
