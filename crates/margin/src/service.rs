use async_trait::async_trait;
use margin_core::comment::{Block, Comment};

/// The collaboration service the poller reads comments from and replies into.
#[async_trait]
pub trait DocumentService: Send + Sync {
    /// Makes sure a valid access token is held. Errors abort the poll cycle.
    async fn authenticate(&self) -> anyhow::Result<()>;

    /// The user id that replies posted by this process appear under.
    async fn bot_identity(&self) -> anyhow::Result<String>;

    async fn list_comments(&self, document: &str) -> anyhow::Result<Vec<Comment>>;

    /// Content blocks of `document`, or `None` when the document is missing or unreadable.
    async fn document_blocks(&self, document: &str) -> anyhow::Result<Option<Vec<Block>>>;

    async fn post_reply(&self, document: &str, comment_id: &str, text: &str)
        -> anyhow::Result<()>;
}
