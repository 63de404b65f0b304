//! Record types persisted by the StateStore.
//!
//! Three tables carry the scheduling state: `round_doc` (one row per document
//! pair), `past_tasks` (one row per published marketplace task) and
//! `stack_target` (one row per wave). Every row is only ever inserted or
//! monotonically updated.

use serde::{Deserialize, Serialize};

use crate::scheduler::{Reward, WaveNumber};

/// Credited annotations each pair must reach
pub const COVERAGE_TARGET: u32 = 3;

/// A pair of documents from one group, annotated as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRecord {
    /// Stable name: "pair_<docA>_and_<docB>"
    pub pair_name: String,

    /// SHA-256 of the pair name; the only identifier workers see
    pub hash: String,

    pub doc_a: String,
    pub doc_b: String,

    /// Position of the pair's group in priority order
    pub group_rank: u32,

    /// Position of the pair inside its group
    pub group_position: u32,

    /// Wave the pair was last published in (None = unassigned)
    pub wave: Option<WaveNumber>,

    /// Credited independent annotations (0..=3)
    pub annotation_index: u32,

    /// Publication pass: 1 on first publication, +1 per continuation
    pub pass: u32,

    pub sentence_count: u32,
    pub reward: Reward,

    /// Unix timestamp in milliseconds
    pub created_at: i64,

    /// Unix timestamp in milliseconds
    pub updated_at: i64,
}

impl PairRecord {
    pub fn is_covered(&self) -> bool {
        self.annotation_index >= COVERAGE_TARGET
    }

    /// Annotations still missing
    pub fn remaining(&self) -> u32 {
        COVERAGE_TARGET.saturating_sub(self.annotation_index)
    }
}

/// A pair discovered during corpus observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPair {
    pub pair_name: String,
    pub hash: String,
    pub doc_a: String,
    pub doc_b: String,
    pub group_rank: u32,
    pub group_position: u32,
    pub sentence_count: u32,
    pub reward: Reward,
}

/// One published marketplace task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Id assigned by the marketplace
    pub external_task_id: String,
    pub hash: String,
    pub pair_name: String,
    pub wave: WaveNumber,
    pub token_index: usize,
    pub exclusive: bool,

    /// Assignments asked for at publication
    pub requested_assignments: u32,
    pub credited_count: u32,
    pub completed: bool,

    /// Lifetime ended before the pair reached coverage
    pub retired: bool,

    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskRecord {
    /// Still expecting credits
    pub fn is_open(&self) -> bool {
        !self.completed && !self.retired
    }
}

/// What the publisher hands the store once the marketplace accepted a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub external_task_id: String,
    pub pair_name: String,
    pub hash: String,
    pub wave: WaveNumber,
    pub token_index: usize,
    pub exclusive: bool,
    pub requested_assignments: u32,
}

/// A round of publication and its progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveRecord {
    pub wave: WaveNumber,
    pub sent_count: u32,
    pub completed_count: u32,
    pub closed: bool,
    pub token_index: usize,
    pub exclusive: bool,

    /// Distinct workers credited in this wave, in credit order
    pub workers: Vec<String>,

    pub created_at: i64,
    pub updated_at: i64,
}

/// Progress of a wave after a credit or retirement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveProgress {
    pub wave: WaveNumber,
    pub sent_count: u32,
    pub completed_count: u32,
    pub closed: bool,
}

/// Result of crediting one assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreditOutcome {
    /// No local task with that external id
    UnknownTask,
    /// The task is already completed or retired
    TaskClosed,
    /// The assignment id was credited before
    AlreadyCredited,
    Credited(CreditReceipt),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditReceipt {
    pub pair_name: String,
    pub annotation_index: u32,
    pub task_completed: bool,
    /// Set when the task completed and the wave count moved
    pub wave_progress: Option<WaveProgress>,
}

/// A credited assignment whose worker has not yet received the wave's token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAward {
    pub assignment_id: String,
    pub worker_id: String,
    pub external_task_id: String,
    pub wave: WaveNumber,
    pub token_index: usize,
}

/// One scheduler action, as written to the event log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub kind: String,
    pub detail: String,
    pub created_at: i64,
}

/// Pair counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairCounts {
    pub total: u32,
    pub unassigned: u32,
    pub in_progress: u32,
    pub covered: u32,
}
