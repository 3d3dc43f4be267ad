//! Boundary contracts for the remote document ledger and blob store.

pub mod blob;
pub mod ledger;
pub mod memory;

pub use blob::{BlobHandle, BlobStore};
pub use ledger::{
    ActiveSnapshots, DocumentPath, Fields, LedgerDocument, LedgerWrite, RemoteLedger,
};
pub use memory::{MemoryBlobStore, MemoryLedger};
