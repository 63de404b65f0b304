//! Payment amount per task, as a step function of the pair's sentence count.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WaveError;

/// A USD amount held in cents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Reward {
    cents: u32,
}

impl Reward {
    pub const fn from_cents(cents: u32) -> Self {
        Self { cents }
    }

    pub fn cents(&self) -> u32 {
        self.cents
    }
}

impl fmt::Display for Reward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.cents / 100, self.cents % 100)
    }
}

impl FromStr for Reward {
    type Err = WaveError;

    /// Parses `"2"`, `"2.3"` or `"2.30"`; more than two decimals is rejected.
    fn from_str(s: &str) -> Result<Self, WaveError> {
        let invalid = || WaveError::Config(format!("invalid reward amount '{}'", s));
        let s = s.trim();
        let (dollars, fraction) = s.split_once('.').unwrap_or((s, ""));
        if dollars.is_empty() || fraction.len() > 2 || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }
        let dollars: u32 = dollars.parse().map_err(|_| invalid())?;
        let cents: u32 = match fraction.len() {
            0 => 0,
            1 => fraction.parse::<u32>().map_err(|_| invalid())? * 10,
            _ => fraction.parse().map_err(|_| invalid())?,
        };
        dollars
            .checked_mul(100)
            .and_then(|d| d.checked_add(cents))
            .map(Reward::from_cents)
            .ok_or_else(invalid)
    }
}

impl TryFrom<String> for Reward {
    type Error = WaveError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Reward> for String {
    fn from(reward: Reward) -> Self {
        reward.to_string()
    }
}

/// One step: pairs with at most `max_sentences` combined sentences earn `reward`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardTier {
    pub max_sentences: u32,
    pub reward: Reward,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardSchedule {
    /// Ascending by `max_sentences`
    pub tiers: Vec<RewardTier>,
    /// Reward above the last tier
    pub above: Reward,
}

impl Default for RewardSchedule {
    fn default() -> Self {
        Self {
            tiers: vec![
                RewardTier {
                    max_sentences: 25,
                    reward: Reward::from_cents(230),
                },
                RewardTier {
                    max_sentences: 40,
                    reward: Reward::from_cents(248),
                },
                RewardTier {
                    max_sentences: 60,
                    reward: Reward::from_cents(268),
                },
            ],
            above: Reward::from_cents(291),
        }
    }
}

impl RewardSchedule {
    pub fn for_sentences(&self, sentence_count: u32) -> Reward {
        self.tiers
            .iter()
            .find(|tier| sentence_count <= tier.max_sentences)
            .map(|tier| tier.reward)
            .unwrap_or(self.above)
    }

    /// Tiers must be strictly ascending
    pub fn validate(&self) -> Result<(), WaveError> {
        for window in self.tiers.windows(2) {
            if window[0].max_sentences >= window[1].max_sentences {
                return Err(WaveError::Config(format!(
                    "reward tiers must ascend: {} then {}",
                    window[0].max_sentences, window[1].max_sentences
                )));
            }
        }
        Ok(())
    }
}
