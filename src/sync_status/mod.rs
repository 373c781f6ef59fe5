//! Per-shop ingestion run state machine.

mod tracker;

pub use tracker::SyncStatusTracker;
