//! Comment threads and document blocks as seen by the poller.
//!
//! These are service-neutral shapes; the HTTP client decodes the wire format into them.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RichTextElement {
    TextRun { text: String },
    DocsLink { url: String },
    Person { user_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RichText {
    #[serde(default)]
    pub elements: Vec<RichTextElement>,
}

impl RichText {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            elements: vec![RichTextElement::TextRun { text: text.into() }],
        }
    }

    /// Flattens the elements into a single string, rendering mentions as `@user`.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for el in &self.elements {
            match el {
                RichTextElement::TextRun { text } => out.push_str(text),
                RichTextElement::DocsLink { url } => out.push_str(url),
                RichTextElement::Person { user_id } => {
                    out.push('@');
                    out.push_str(user_id);
                }
            }
        }
        out.trim().to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub id: String,
    pub user_id: String,
    pub body: RichText,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub user_id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_solved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solver_user_id: Option<String>,
    pub body: RichText,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(default)]
    pub replies: Vec<Reply>,
}

impl Comment {
    pub fn text(&self) -> String {
        self.body.plain_text()
    }

    pub fn quote(&self) -> Option<&str> {
        self.quote
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn has_reply_from(&self, user_id: &str) -> bool {
        let user_id = user_id.trim();
        !user_id.is_empty() && self.replies.iter().any(|r| r.user_id == user_id)
    }
}

/// A link carried by a text run's style.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextLink {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextElementStyle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<TextLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextRun {
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_element_style: Option<TextElementStyle>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MentionDoc {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextElement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_run: Option<TextRun>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mention_doc: Option<MentionDoc>,
}

impl TextElement {
    pub fn text(content: &str) -> Self {
        Self {
            text_run: Some(TextRun {
                content: content.to_owned(),
                text_element_style: None,
            }),
            mention_doc: None,
        }
    }

    pub fn link(content: &str, url: &str) -> Self {
        Self {
            text_run: Some(TextRun {
                content: content.to_owned(),
                text_element_style: Some(TextElementStyle {
                    link: Some(TextLink {
                        url: url.to_owned(),
                    }),
                }),
            }),
            mention_doc: None,
        }
    }

    /// Every string in this element that may embed a document URL.
    pub fn candidate_strings(&self) -> impl Iterator<Item = &str> {
        let run = self.text_run.as_ref();
        let content = run.map(|r| r.content.as_str());
        let link = run
            .and_then(|r| r.text_element_style.as_ref())
            .and_then(|s| s.link.as_ref())
            .map(|l| l.url.as_str());
        let mention = self.mention_doc.as_ref().map(|m| m.url.as_str());
        [content, link, mention]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockText {
    #[serde(default)]
    pub elements: Vec<TextElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    #[serde(default)]
    pub block_id: String,
    #[serde(default)]
    pub block_type: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading1: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading2: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading3: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading4: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading5: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading6: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading7: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading8: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading9: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bullet: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordered: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callout: Option<BlockText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<BlockText>,
}

impl Block {
    /// All text containers present on this block, in declaration order.
    pub fn text_containers(&self) -> impl Iterator<Item = &BlockText> {
        [
            &self.page,
            &self.text,
            &self.heading1,
            &self.heading2,
            &self.heading3,
            &self.heading4,
            &self.heading5,
            &self.heading6,
            &self.heading7,
            &self.heading8,
            &self.heading9,
            &self.bullet,
            &self.ordered,
            &self.callout,
            &self.quote,
        ]
        .into_iter()
        .flatten()
    }

    pub fn elements(&self) -> impl Iterator<Item = &TextElement> {
        self.text_containers().flat_map(|c| c.elements.iter())
    }
}
