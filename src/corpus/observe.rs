//! Corpus observation: turn document groups into registered, unassigned pairs.

use tracing::{info, warn};

use crate::corpus::loader::{Corpus, DocumentGroup};
use crate::error::Result;
use crate::id::{pair_hash, pair_name};
use crate::scheduler::{RejectedGroup, RewardSchedule, rank_groups};
use crate::store::{NewPair, StateStore};

/// Default largest group size that is scheduled
pub const DEFAULT_MAX_GROUP_SIZE: usize = 3;

#[derive(Debug, Default)]
pub struct ObservationReport {
    pub new_groups: usize,
    pub registered_pairs: usize,
    pub skipped_oversize: usize,
    pub skipped_known: usize,
    /// Pairs whose reversed name was already registered
    pub reversed_duplicates: usize,
    pub rejected: Vec<RejectedGroup>,
}

/// Rank groups that are not yet in the store and register their pairs.
///
/// New groups are ranked among themselves and placed after every group
/// already registered, so earlier priorities never shift. Re-observing the
/// same corpus registers nothing.
pub fn observe_corpus(
    store: &StateStore,
    corpus: &Corpus,
    groups: &[DocumentGroup],
    rewards: &RewardSchedule,
    max_group_size: usize,
) -> Result<ObservationReport> {
    let mut report = ObservationReport::default();

    let mut candidates = Vec::new();
    for group in groups {
        if group.len() > max_group_size {
            report.skipped_oversize += 1;
            continue;
        }
        if is_registered(store, group)? {
            report.skipped_known += 1;
            continue;
        }
        candidates.push(group.clone());
    }

    let ranking = rank_groups(&candidates, corpus);
    report.rejected = ranking.rejected;

    let base_rank = store.max_group_rank()?.map(|r| r + 1).unwrap_or(0);
    for (offset, ranked) in ranking.ranked.iter().enumerate() {
        let group_rank = base_rank + offset as u32;
        for (position, (a, b)) in ranked.group.pairs().into_iter().enumerate() {
            let sentence_count = [a, b]
                .iter()
                .filter_map(|id| corpus.get(id))
                .map(|d| d.sentence_count)
                .sum();
            let name = pair_name(a, b);
            if store.get_pair(&name)?.is_none() && store.get_pair(&pair_name(b, a))?.is_some() {
                warn!(pair = %name, "Reversed pair already registered; both orders will be scheduled");
                report.reversed_duplicates += 1;
            }
            let pair = NewPair {
                hash: pair_hash(&name),
                pair_name: name,
                doc_a: a.to_string(),
                doc_b: b.to_string(),
                group_rank,
                group_position: position as u32,
                sentence_count,
                reward: rewards.for_sentences(sentence_count),
            };
            if store.register_pair(&pair)? {
                report.registered_pairs += 1;
            }
        }
        report.new_groups += 1;
    }

    if report.registered_pairs > 0 {
        store.log_event(
            "seed",
            &format!("{} groups, {} pairs", report.new_groups, report.registered_pairs),
        )?;
    }
    info!(
        new_groups = report.new_groups,
        registered_pairs = report.registered_pairs,
        skipped_oversize = report.skipped_oversize,
        skipped_known = report.skipped_known,
        reversed_duplicates = report.reversed_duplicates,
        rejected = report.rejected.len(),
        "Observed corpus"
    );
    Ok(report)
}

/// A group is known only when every one of its pairs is stored
fn is_registered(store: &StateStore, group: &DocumentGroup) -> Result<bool> {
    let pairs = group.pairs();
    if pairs.is_empty() {
        return Ok(false);
    }
    for (a, b) in pairs {
        if store.get_pair(&pair_name(a, b))?.is_none() {
            return Ok(false);
        }
    }
    Ok(true)
}
