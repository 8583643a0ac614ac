use margin_core::config::PollSettings;
use margin_core::links::{dedupe_tokens, extract_document_tokens};

use crate::service::DocumentService;

/// Documents to poll this cycle: links found in the index document, or the static
/// `watched-files` list when the index yields nothing.
pub async fn resolve_documents(
    service: &dyn DocumentService,
    settings: &PollSettings,
) -> Vec<String> {
    if let Some(index) = settings.index_document.as_deref() {
        let tokens = match service.document_blocks(index).await {
            Ok(Some(blocks)) => extract_document_tokens(&blocks),
            Ok(None) => {
                tracing::warn!(index = %index, "index document is missing or unreadable");
                Vec::new()
            }
            Err(err) => {
                tracing::warn!(
                    index = %index,
                    error = %format!("{err:#}"),
                    "failed to read index document"
                );
                Vec::new()
            }
        };

        if !tokens.is_empty() {
            tracing::debug!(index = %index, count = tokens.len(), "resolved documents from index");
            return tokens;
        }
        tracing::info!(index = %index, "index document yielded no links; using watched-files");
    }

    dedupe_tokens(settings.watched_files.iter())
}
