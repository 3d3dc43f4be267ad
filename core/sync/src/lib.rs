//! FieldSync sync engine
//!
//! Offline-first synchronization of a field agent's activity:
//! - Retry with exponential backoff for every remote call
//! - Connectivity monitoring with reconnect-driven reconciliation
//! - Two-phase location acquisition
//! - Image compression and a durable upload queue
//! - Trip and punch state managers mirrored to the local store
//! - A visit outbox for submissions made while offline

pub mod activity;
pub mod compress;
pub mod config;
pub mod data_url;
pub mod engine;
pub mod geo;
pub mod location;
pub mod network;
pub mod notice;
pub mod remote;
pub mod retry;
pub mod upload;
pub mod visits;

// Re-export main types
pub use activity::{ActivityManager, ActivityRecord, ActivityState, PunchClock, TripTracker};
pub use compress::{compress_blocking, compress_image};
pub use config::{
    CompressionSettings, EngineConfig, LocationSettings, RetrySettings, UploadSettings,
};
pub use engine::{Collaborators, SyncEngine, SyncSummary};
pub use geo::{calculate_distance, distance_between};
pub use location::{
    GeolocationProvider, LocationService, PositionOptions, ScriptedFix, ScriptedGeolocation,
};
pub use network::{ListenerGuard, NetworkMonitor};
pub use notice::{Notice, NoticeBus, Severity};
pub use remote::{
    BlobHandle, BlobStore, DocumentPath, LedgerDocument, LedgerWrite, MemoryBlobStore,
    MemoryLedger, RemoteLedger,
};
pub use retry::{retry, retry_with_backoff, RetryConfig, RetryExecutor};
pub use upload::{DrainReport, ImageDescriptor, UploadQueue, UploadedImage};
pub use visits::{VisitOutbox, VisitSubmission};
