//! Reconciliation of provider data into the local ledger.

pub mod engine;
pub mod scheduler;

pub use engine::{
    AccountReport, EngineSettings, MappingError, PassReport, ReconciliationEngine, SyncError,
    SyncReport,
};
pub use scheduler::{SchedulerSettings, SyncScheduler, TriggerOutcome};
