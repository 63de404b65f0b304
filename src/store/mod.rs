//! Persistent scheduling state.
//!
//! A single SQLite database holds document pairs (`round_doc`), published
//! tasks (`past_tasks`), waves (`stack_target`), credited assignments,
//! provisioned eligibility tokens and an event log.
//!
//! # Example
//!
//! ```ignore
//! use wavecrowd::store::StateStore;
//! use std::path::Path;
//!
//! let store = StateStore::open(Path::new("/tmp/wavecrowd.db"))?;
//! for pair in store.unassigned_pairs()? {
//!     println!("{} ({} annotations)", pair.pair_name, pair.annotation_index);
//! }
//! ```

mod records;
mod state_store;

pub use records::{
    COVERAGE_TARGET, CreditOutcome, CreditReceipt, EventRecord, NewPair, PairCounts, PairRecord, PendingAward,
    Publication, TaskRecord, WaveProgress, WaveRecord,
};
pub use state_store::StateStore;
