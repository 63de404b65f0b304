//! Round allocation: decide the next wave and which pairs go into it.
//!
//! A new wave is only planned once the latest wave has closed. The plan
//! takes, in order:
//! 1. every under-covered pair whose last wave has closed (never truncated)
//! 2. unassigned pairs from the single highest-priority fresh group, up to
//!    the remaining wave capacity

use tracing::{debug, warn};

use crate::error::Result;
use crate::scheduler::rotation::WaveNumber;
use crate::store::{PairRecord, StateStore, WaveProgress, WaveRecord};

/// Tasks per wave, before continuation overflow
pub const DEFAULT_WAVE_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub wave_size: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            wave_size: DEFAULT_WAVE_SIZE,
        }
    }
}

/// One pair scheduled into the planned wave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedTask {
    pub pair: PairRecord,
    /// Assignments to request: the annotations the pair still lacks
    pub requested_assignments: u32,
    /// The pair was published before
    pub continuation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavePlan {
    pub wave: WaveNumber,
    pub token_index: usize,
    pub exclusive: bool,
    pub tasks: Vec<PlannedTask>,
}

impl WavePlan {
    pub fn continuation_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.continuation).count()
    }

    pub fn fresh_count(&self) -> usize {
        self.tasks.len() - self.continuation_count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    /// The latest wave is still open
    Outstanding(WaveRecord),
    /// Nothing to continue and nothing fresh
    NoWorkAvailable,
    Planned(WavePlan),
}

pub struct RoundAllocator<'a> {
    store: &'a StateStore,
    config: AllocatorConfig,
}

impl<'a> RoundAllocator<'a> {
    pub fn new(store: &'a StateStore) -> Self {
        Self {
            store,
            config: AllocatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AllocatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Seal a wave whose publication pass was interrupted.
    ///
    /// A wave is sealed when its publisher finishes; if the latest wave is
    /// still unsealed at the start of a new pass, the previous pass died
    /// part-way and the wave is sealed with whatever it managed to send.
    pub fn seal_interrupted_wave(&self) -> Result<Option<WaveProgress>> {
        let Some(latest) = self.store.latest_wave()? else {
            return Ok(None);
        };
        if self.store.is_sealed(latest.wave)? {
            return Ok(None);
        }
        warn!(wave = %latest.wave, sent = latest.sent_count, "Sealing wave left by an interrupted publication");
        self.store.seal_wave(latest.wave)
    }

    /// Plan the next wave without writing anything.
    pub fn plan(&self) -> Result<Allocation> {
        let latest = self.store.latest_wave()?;
        if let Some(wave) = latest.as_ref()
            && !wave.closed
        {
            debug!(wave = %wave.wave, completed = wave.completed_count, sent = wave.sent_count, "Latest wave still open");
            return Ok(Allocation::Outstanding(wave.clone()));
        }

        let mut tasks: Vec<PlannedTask> = self
            .store
            .continuation_candidates()?
            .into_iter()
            .map(|pair| PlannedTask {
                requested_assignments: pair.remaining(),
                pair,
                continuation: true,
            })
            .collect();

        let capacity = self.config.wave_size.saturating_sub(tasks.len());
        if capacity > 0 {
            tasks.extend(
                select_fresh_group(self.store.unassigned_pairs()?, capacity)
                    .into_iter()
                    .map(|pair| PlannedTask {
                        requested_assignments: pair.remaining(),
                        pair,
                        continuation: false,
                    }),
            );
        }

        if tasks.is_empty() {
            return Ok(Allocation::NoWorkAvailable);
        }

        let wave = WaveNumber::next(latest.map(|w| w.wave));
        Ok(Allocation::Planned(WavePlan {
            wave,
            token_index: wave.token_index(),
            exclusive: wave.is_exclusive(),
            tasks,
        }))
    }
}

/// Unassigned pairs of the first group in priority order, at most `capacity`
fn select_fresh_group(unassigned: Vec<PairRecord>, capacity: usize) -> Vec<PairRecord> {
    let Some(rank) = unassigned.first().map(|p| p.group_rank) else {
        return Vec::new();
    };
    unassigned
        .into_iter()
        .take_while(|p| p.group_rank == rank)
        .take(capacity)
        .collect()
}
