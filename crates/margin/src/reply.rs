use std::sync::Arc;

use crate::agent::{Agent, InvokeContext};

pub const FALLBACK_REPLY: &str =
    "Sorry, I couldn't come up with a reply to this comment right now. A teammate will follow up.";

pub const COMMENT_SOURCE: &str = "doc_comment";

/// Turns a comment into reply text. Agent failures become [`FALLBACK_REPLY`].
#[derive(Clone)]
pub struct ReplyGenerator {
    agent: Arc<dyn Agent>,
}

impl ReplyGenerator {
    pub fn new(agent: Arc<dyn Agent>) -> Self {
        Self { agent }
    }

    pub async fn generate(
        &self,
        document: &str,
        comment_id: &str,
        text: &str,
        quote: Option<&str>,
    ) -> String {
        let prompt = build_prompt(text, quote);
        let ctx = InvokeContext {
            source: COMMENT_SOURCE.to_owned(),
            document: document.to_owned(),
            comment_id: comment_id.to_owned(),
        };

        match self.agent.invoke(&prompt, &ctx).await {
            Ok(resp) if !resp.response.trim().is_empty() => resp.response.trim().to_owned(),
            Ok(_) => {
                tracing::warn!(
                    document = %document,
                    comment_id = %comment_id,
                    "agent returned an empty reply; using fallback"
                );
                FALLBACK_REPLY.to_owned()
            }
            Err(err) => {
                tracing::warn!(
                    document = %document,
                    comment_id = %comment_id,
                    error = %format!("{err:#}"),
                    "agent invocation failed; using fallback"
                );
                FALLBACK_REPLY.to_owned()
            }
        }
    }
}

pub fn build_prompt(text: &str, quote: Option<&str>) -> String {
    let mut out = String::new();
    out.push_str("You are replying to a comment left on a shared document.\n\n");

    if let Some(quote) = quote.map(str::trim).filter(|q| !q.is_empty()) {
        out.push_str("## Quoted passage\n");
        out.push_str(quote);
        out.push_str("\n\n");
    }

    out.push_str("## Comment\n");
    if text.trim().is_empty() {
        out.push_str("(empty comment)\n");
    } else {
        out.push_str(text.trim());
        out.push('\n');
    }

    out.push_str("\n## Your Task\n");
    out.push_str("Write a reply to the comment. Keep it concise and helpful, ");
    out.push_str("and answer in the same language the comment is written in. ");
    out.push_str("Reply with the text of the reply only.");
    out
}
