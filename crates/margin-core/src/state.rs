use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Comments already handled per document, plus the time of the last completed poll.
///
/// The processed set only grows: ids are appended once and never removed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessedState {
    #[serde(rename = "lastPollTime", default)]
    pub last_poll_time: u64,

    #[serde(rename = "processedComments", default)]
    processed_comments: BTreeMap<String, Vec<String>>,
}

impl ProcessedState {
    pub fn is_processed(&self, document: &str, comment_id: &str) -> bool {
        self.processed_comments
            .get(document)
            .is_some_and(|ids| ids.iter().any(|id| id == comment_id))
    }

    /// Records `comment_id` for `document`. Returns false if it was already recorded.
    pub fn mark_processed(&mut self, document: &str, comment_id: &str) -> bool {
        if document.trim().is_empty() || comment_id.trim().is_empty() {
            return false;
        }
        if self.is_processed(document, comment_id) {
            return false;
        }
        self.processed_comments
            .entry(document.to_owned())
            .or_default()
            .push(comment_id.to_owned());
        true
    }

    pub fn processed(&self, document: &str) -> &[String] {
        self.processed_comments
            .get(document)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn processed_count(&self, document: &str) -> usize {
        self.processed(document).len()
    }

    pub fn documents(&self) -> impl Iterator<Item = &str> {
        self.processed_comments.keys().map(String::as_str)
    }

    pub fn total_processed(&self) -> usize {
        self.processed_comments.values().map(Vec::len).sum()
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.last_poll_time = now_ms;
    }

    /// Drops duplicate ids that a hand-edited file may contain, keeping first occurrences.
    pub fn normalize(&mut self) {
        for ids in self.processed_comments.values_mut() {
            let mut seen = std::collections::BTreeSet::new();
            ids.retain(|id| seen.insert(id.clone()));
        }
        self.processed_comments.retain(|doc, ids| !doc.trim().is_empty() && !ids.is_empty());
    }
}
