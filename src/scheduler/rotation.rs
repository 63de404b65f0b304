//! Wave numbering and the eligibility-token rotation.
//!
//! Waves are numbered `1, 2.1, 2.2, 3, 4.1, 4.2, 5, ...`. Each wave carries
//! one of three eligibility tokens; every wave after the first hides its
//! tasks from holders of the other two tokens, so a worker who contributed
//! to a wave cannot be counted again in its immediate neighbours.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, WaveError};
use crate::marketplace::{Marketplace, QualificationRequirement, Visibility};
use crate::scheduler::retry::{RetryMode, RetryPolicy};
use crate::store::StateStore;

/// Number of eligibility tokens in the pool
pub const TOKEN_COUNT: usize = 3;

/// Sub-position of a wave inside its ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RotationPhase {
    Whole,
    First,
    Second,
}

impl RotationPhase {
    pub fn as_i64(&self) -> i64 {
        match self {
            RotationPhase::Whole => 0,
            RotationPhase::First => 1,
            RotationPhase::Second => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(RotationPhase::Whole),
            1 => Some(RotationPhase::First),
            2 => Some(RotationPhase::Second),
            _ => None,
        }
    }
}

/// A wave identifier, ordered the way waves are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WaveNumber {
    pub ordinal: u32,
    pub phase: RotationPhase,
}

impl WaveNumber {
    pub fn new(ordinal: u32, phase: RotationPhase) -> Self {
        Self { ordinal, phase }
    }

    /// The bootstrap wave
    pub fn first() -> Self {
        Self::new(1, RotationPhase::Whole)
    }

    /// The wave that follows `previous` (or the bootstrap wave if there is none)
    pub fn next(previous: Option<WaveNumber>) -> Self {
        let Some(prev) = previous else {
            return Self::first();
        };
        match prev.phase {
            RotationPhase::Whole if prev.ordinal % 2 == 1 => Self::new(prev.ordinal + 1, RotationPhase::First),
            RotationPhase::Whole => Self::new(prev.ordinal + 1, RotationPhase::Whole),
            RotationPhase::First => Self::new(prev.ordinal, RotationPhase::Second),
            RotationPhase::Second => Self::new(prev.ordinal + 1, RotationPhase::Whole),
        }
    }

    /// Index of the eligibility token this wave selects
    pub fn token_index(&self) -> usize {
        match self.phase {
            RotationPhase::Whole => 1,
            RotationPhase::First => 2,
            RotationPhase::Second => 0,
        }
    }

    /// Only the bootstrap wave is open to every worker
    pub fn is_exclusive(&self) -> bool {
        *self != Self::first()
    }
}

impl fmt::Display for WaveNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            RotationPhase::Whole => write!(f, "{}", self.ordinal),
            RotationPhase::First => write!(f, "{}.1", self.ordinal),
            RotationPhase::Second => write!(f, "{}.2", self.ordinal),
        }
    }
}

impl FromStr for WaveNumber {
    type Err = WaveError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || WaveError::UnknownReference(format!("wave '{}'", s));
        let (ordinal, phase) = match s.split_once('.') {
            None => (s, RotationPhase::Whole),
            Some((n, "1")) => (n, RotationPhase::First),
            Some((n, "2")) => (n, RotationPhase::Second),
            Some(_) => return Err(invalid()),
        };
        let ordinal: u32 = ordinal.parse().map_err(|_| invalid())?;
        if ordinal == 0 {
            return Err(invalid());
        }
        Ok(Self::new(ordinal, phase))
    }
}

/// The provisioned eligibility tokens, indexed 0..3
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityPool {
    qualification_ids: [String; TOKEN_COUNT],
}

impl EligibilityPool {
    pub fn new(qualification_ids: [String; TOKEN_COUNT]) -> Self {
        Self { qualification_ids }
    }

    /// Build the pool from persisted `(index, qualification id)` rows
    pub fn from_tokens(tokens: &[(usize, String)]) -> Result<Self> {
        let mut ids: [Option<String>; TOKEN_COUNT] = Default::default();
        for (index, qualification_id) in tokens {
            let slot = ids
                .get_mut(*index)
                .ok_or_else(|| WaveError::InvariantViolation(format!("eligibility token index {} out of range", index)))?;
            *slot = Some(qualification_id.clone());
        }
        let [a, b, c] = ids;
        match (a, b, c) {
            (Some(a), Some(b), Some(c)) => Ok(Self::new([a, b, c])),
            _ => Err(WaveError::Config(
                "eligibility tokens are not provisioned; run `wavecrowd provision` first".to_string(),
            )),
        }
    }

    /// Load the pool from the state store
    pub fn load(store: &StateStore) -> Result<Self> {
        Self::from_tokens(&store.list_eligibility_tokens()?)
    }

    pub fn qualification_id(&self, index: usize) -> Option<&str> {
        self.qualification_ids.get(index).map(String::as_str)
    }

    /// The qualification a wave selects
    pub fn selected(&self, wave: WaveNumber) -> &str {
        &self.qualification_ids[wave.token_index()]
    }

    /// Discover-level exclusions for every token the wave did not select
    pub fn exclusion_requirements(&self, wave: WaveNumber) -> Vec<QualificationRequirement> {
        if !wave.is_exclusive() {
            return Vec::new();
        }
        let selected = wave.token_index();
        self.qualification_ids
            .iter()
            .enumerate()
            .filter(|(index, _)| *index != selected)
            .map(|(_, id)| QualificationRequirement::does_not_exist(id.clone(), Visibility::DiscoverPreviewAndAccept))
            .collect()
    }
}

/// Create any missing eligibility tokens as marketplace qualification types.
///
/// Tokens already recorded in the store are left alone, so provisioning
/// twice does not create a second pool.
pub async fn provision_tokens(
    store: &StateStore,
    marketplace: &dyn Marketplace,
    retry: &RetryPolicy,
    name_prefix: &str,
    description: &str,
) -> Result<EligibilityPool> {
    let existing = store.list_eligibility_tokens()?;
    for index in 0..TOKEN_COUNT {
        if existing.iter().any(|(i, _)| *i == index) {
            continue;
        }
        let name = format!("{}{:02}", name_prefix, index);
        let name_ref = name.as_str();
        let qualification_id = retry
            .run(RetryMode::CreateOnce, "create_qualification_type", move || {
                marketplace.create_qualification_type(name_ref, description)
            })
            .await?;
        store.save_eligibility_token(index, &qualification_id)?;
        store.log_event("provision", &format!("{} -> {}", name, qualification_id))?;
        info!(index, name = %name, qualification_id = %qualification_id, "Provisioned eligibility token");
    }
    EligibilityPool::load(store)
}
