//! Corpus Loader - per-document records and the document-groups file
//!
//! Each document is a JSON file `{"doc_id", "sentence_count", "event_mentions"}`
//! in the documents directory. The groups file lists one group of mutually
//! relevant document ids per line.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, WaveError};

/// Signal extracted from one document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStats {
    pub doc_id: String,
    pub sentence_count: u32,
    /// Surface text of every event mention, in document order
    #[serde(default)]
    pub event_mentions: Vec<String>,
}

/// A candidate group of mutually relevant documents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentGroup {
    pub doc_ids: Vec<String>,
}

impl DocumentGroup {
    pub fn new<I, S>(doc_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            doc_ids: doc_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    /// Every unordered pair, in listing order: (0,1), (0,2), (1,2), ...
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        let mut pairs = Vec::new();
        for (i, a) in self.doc_ids.iter().enumerate() {
            for b in &self.doc_ids[i + 1..] {
                pairs.push((a.as_str(), b.as_str()));
            }
        }
        pairs
    }
}

impl fmt::Display for DocumentGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.doc_ids.join(" "))
    }
}

/// All document records, keyed by id
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    documents: HashMap<String, DocumentStats>,
}

impl Corpus {
    pub fn from_documents<I: IntoIterator<Item = DocumentStats>>(documents: I) -> Self {
        Self {
            documents: documents.into_iter().map(|d| (d.doc_id.clone(), d)).collect(),
        }
    }

    /// Load every `*.json` record under `dir`
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(WaveError::Corpus(format!("documents directory {} not found", dir.display())));
        }
        let pattern = dir.join("*.json");
        let pattern = pattern
            .to_str()
            .ok_or_else(|| WaveError::Corpus(format!("non-UTF-8 path {}", dir.display())))?;
        let paths = glob::glob(pattern).map_err(|e| WaveError::Corpus(format!("bad glob {}: {}", pattern, e)))?;

        let mut documents = HashMap::new();
        for entry in paths {
            let path = entry.map_err(|e| WaveError::Corpus(e.to_string()))?;
            let content = std::fs::read_to_string(&path)?;
            let stats: DocumentStats = serde_json::from_str(&content)
                .map_err(|e| WaveError::Corpus(format!("{}: {}", path.display(), e)))?;
            if documents.contains_key(&stats.doc_id) {
                warn!(doc_id = %stats.doc_id, path = %path.display(), "Duplicate document record, keeping first");
                continue;
            }
            documents.insert(stats.doc_id.clone(), stats);
        }

        debug!(count = documents.len(), dir = %dir.display(), "Loaded corpus");
        Ok(Self { documents })
    }

    pub fn get(&self, doc_id: &str) -> Option<&DocumentStats> {
        self.documents.get(doc_id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// Parse a groups file: whitespace-separated ids, one group per line.
/// Blank lines and `#` comments are ignored.
pub fn parse_groups(content: &str) -> Vec<DocumentGroup> {
    content
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(|line| DocumentGroup::new(line.split_whitespace()))
        .collect()
}

pub fn read_groups(path: &Path) -> Result<Vec<DocumentGroup>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| WaveError::Corpus(format!("cannot read groups file {}: {}", path.display(), e)))?;
    Ok(parse_groups(&content))
}
