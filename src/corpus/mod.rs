//! Annotation-source corpus: document records, groups and observation.

mod loader;
mod observe;

pub use loader::{Corpus, DocumentGroup, DocumentStats, parse_groups, read_groups};
pub use observe::{DEFAULT_MAX_GROUP_SIZE, ObservationReport, observe_corpus};
