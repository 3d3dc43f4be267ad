//! Durable local store for fieldsync.
//!
//! Two kinds of data live here:
//! - Single-record mirrors (the agent's active trip and punch), written to a
//!   fast cache and a durable backend together and read cache-first.
//! - Queue records (pending uploads and visits), kept only in the structured
//!   backend and indexed by status and agent.
//!
//! Backends are pluggable through [`KvBackend`] and [`QueueBackend`]; callers
//! only see [`LocalStore`].

pub mod backend;
pub mod local;
pub mod memory;
pub mod records;
pub mod sqlite;
pub mod tiered;

pub use backend::{KvBackend, QueueBackend, QueueName, QueuedRow};
pub use local::LocalStore;
pub use memory::MemoryBackend;
pub use records::{
    ActivityStatus, MirroredRecord, NewPendingUpload, PendingUploadRecord, PendingVisitRecord,
    PunchRecord, RetroactiveType, TripRecord, UploadStatus, VisitStatus,
};
pub use sqlite::SqliteBackend;
pub use tiered::TieredStore;
