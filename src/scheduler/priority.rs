//! Priority ranking for candidate document groups.
//!
//! For every pair in a group we measure:
//! - combined event-mention count
//! - combined sentence count
//! - overlap: event mentions of the first document whose text also appears
//!   among the second document's mentions
//!
//! Groups are ranked by (mean events, mean sentences, 1 / mean overlap), all
//! descending. A group whose pairs share no event text at all has an
//! unbounded last component and is ranked ahead of every other group.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::corpus::{Corpus, DocumentGroup};

/// Per-group sort key. Higher ranks first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupScore {
    pub mean_events: f64,
    pub mean_sentences: f64,
    /// `1 / mean(overlap)`; infinite when no pair overlaps
    pub inverse_overlap: f64,
}

impl GroupScore {
    /// No pair in the group shares event text
    pub fn is_disjoint(&self) -> bool {
        self.inverse_overlap.is_infinite()
    }

    /// Descending priority order: `Less` means `self` ranks first.
    fn priority_cmp(&self, other: &Self) -> Ordering {
        other
            .is_disjoint()
            .cmp(&self.is_disjoint())
            .then_with(|| other.mean_events.total_cmp(&self.mean_events))
            .then_with(|| other.mean_sentences.total_cmp(&self.mean_sentences))
            .then_with(|| other.inverse_overlap.total_cmp(&self.inverse_overlap))
    }
}

/// Raw pair measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairSignal {
    pub events: usize,
    pub sentences: u32,
    pub overlap: usize,
}

/// Compute a score from the group's pair measurements.
///
/// Returns None for an empty list (a group with fewer than two documents).
pub fn score_pairs(pairs: &[PairSignal]) -> Option<GroupScore> {
    if pairs.is_empty() {
        return None;
    }
    let n = pairs.len() as f64;
    let mean_events = pairs.iter().map(|p| p.events as f64).sum::<f64>() / n;
    let mean_sentences = pairs.iter().map(|p| p.sentences as f64).sum::<f64>() / n;
    let mean_overlap = pairs.iter().map(|p| p.overlap as f64).sum::<f64>() / n;
    let inverse_overlap = if mean_overlap == 0.0 { f64::INFINITY } else { 1.0 / mean_overlap };
    Some(GroupScore {
        mean_events,
        mean_sentences,
        inverse_overlap,
    })
}

/// Why a group could not be ranked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    TooFewDocuments,
    MissingDocument(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RankedGroup {
    pub group: DocumentGroup,
    pub score: GroupScore,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedGroup {
    pub group: DocumentGroup,
    pub reason: Rejection,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranking {
    /// Highest priority first
    pub ranked: Vec<RankedGroup>,
    pub rejected: Vec<RejectedGroup>,
}

/// Measure every pair of a group against the corpus
pub fn group_signals(group: &DocumentGroup, corpus: &Corpus) -> Result<Vec<PairSignal>, Rejection> {
    if group.len() < 2 {
        return Err(Rejection::TooFewDocuments);
    }
    if let Some(missing) = group.doc_ids.iter().find(|id| corpus.get(id).is_none()) {
        return Err(Rejection::MissingDocument(missing.clone()));
    }

    let mut signals = Vec::new();
    for (a, b) in group.pairs() {
        let (Some(doc_a), Some(doc_b)) = (corpus.get(a), corpus.get(b)) else {
            return Err(Rejection::MissingDocument(a.to_string()));
        };
        let second: HashSet<&str> = doc_b.event_mentions.iter().map(String::as_str).collect();
        let overlap = doc_a
            .event_mentions
            .iter()
            .filter(|m| second.contains(m.as_str()))
            .count();
        signals.push(PairSignal {
            events: doc_a.event_mentions.len() + doc_b.event_mentions.len(),
            sentences: doc_a.sentence_count + doc_b.sentence_count,
            overlap,
        });
    }
    Ok(signals)
}

/// Rank groups by priority. Pure; ties keep input order.
pub fn rank_groups(groups: &[DocumentGroup], corpus: &Corpus) -> Ranking {
    let mut ranking = Ranking::default();
    for group in groups {
        match group_signals(group, corpus).and_then(|s| score_pairs(&s).ok_or(Rejection::TooFewDocuments)) {
            Ok(score) => ranking.ranked.push(RankedGroup {
                group: group.clone(),
                score,
            }),
            Err(reason) => {
                tracing::warn!(group = %group, reason = ?reason, "Rejected document group");
                ranking.rejected.push(RejectedGroup {
                    group: group.clone(),
                    reason,
                });
            }
        }
    }
    ranking.ranked.sort_by(|a, b| a.score.priority_cmp(&b.score));
    ranking
}
