//! velocity-core: windowed burst detection over a deduplicated,
//! flag-enriched historical transaction store.
//!
//! Stage order used by the runner (the library never sequences it):
//!   1. Historical update  (ingest daily files, merge new records)
//!   2. Flag detection     (one per rule, writes a daily flag batch)
//!   3. Flag reconciliation (one per rule, ORs the batch into the store)

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod flag_reconciliation;
pub mod historical_merge;
pub mod ingest;
pub mod record;
pub mod stage;
pub mod store;
pub mod types;
pub mod velocity_detection;
pub mod window;
