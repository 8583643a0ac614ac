use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::comment::Block;

// Link URLs in block styles are percent-encoded, so `/` may appear as `%2F`.
const DOCUMENT_LINK_PATTERN: &str = r"(?:/|%2[Ff])(?:docx|docs|wiki)(?:/|%2[Ff])([A-Za-z0-9]+)";

fn document_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DOCUMENT_LINK_PATTERN).expect("document link pattern is valid"))
}

/// Returns every document token referenced in `text`, in order of appearance.
pub fn document_tokens_in(text: &str) -> impl Iterator<Item = &str> {
    document_link_re()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Collects unique document tokens linked from `blocks`, first-seen order.
pub fn extract_document_tokens(blocks: &[Block]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();

    for block in blocks {
        for element in block.elements() {
            for s in element.candidate_strings() {
                for token in document_tokens_in(s) {
                    if seen.insert(token.to_owned()) {
                        out.push(token.to_owned());
                    }
                }
            }
        }
    }

    out
}

/// De-duplicates a configured token list, dropping blanks and keeping first-seen order.
pub fn dedupe_tokens<I, S>(tokens: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = BTreeSet::new();
    tokens
        .into_iter()
        .map(|t| t.as_ref().trim().to_owned())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
