//! Wave scheduling: which pairs go out next, to whom, and what came back.
//!
//! This module provides:
//! - **Prioritization**: ranks document groups by event density, length and
//!   cross-document overlap.
//! - **Rotation**: wave numbering and the three eligibility tokens that keep
//!   annotator cohorts apart.
//! - **Allocation**: plans the next wave from continuation and fresh pairs.
//! - **Publication**: creates one marketplace task per planned pair.
//! - **Reconciliation**: credits submitted work, retires expired tasks and
//!   closes waves.
//!
//! # Flow
//!
//! Each invocation is short-lived and sequential:
//! 1. `seed` ranks groups and registers their pairs
//! 2. `run` plans a wave with [`RoundAllocator`] and publishes it with
//!    [`TaskPublisher`]
//! 3. `reconcile` polls with [`CompletionReconciler`] until the wave closes
//!
//! ```ignore
//! let store = StateStore::open(&path)?;
//! if let Allocation::Planned(plan) = RoundAllocator::new(&store).plan()? {
//!     publisher.publish_wave(&plan).await?;
//! }
//! ```

mod priority;
mod publish;
mod reconcile;
mod retry;
mod reward;
mod rotation;
mod select;

pub use priority::{
    GroupScore, PairSignal, RankedGroup, Ranking, RejectedGroup, Rejection, group_signals, rank_groups, score_pairs,
};
pub use publish::{
    APPROVAL_RATE_QUALIFICATION, APPROVED_COUNT_QUALIFICATION, LOCALE_QUALIFICATION, PublishReport, PublishedTask,
    PublisherConfig, TaskPublisher,
};
pub use reconcile::{CompletionReconciler, ReconcileReport};
pub use retry::{RetryMode, RetryPolicy};
pub use reward::{Reward, RewardSchedule, RewardTier};
pub use rotation::{EligibilityPool, RotationPhase, TOKEN_COUNT, WaveNumber, provision_tokens};
pub use select::{Allocation, AllocatorConfig, DEFAULT_WAVE_SIZE, PlannedTask, RoundAllocator, WavePlan};
