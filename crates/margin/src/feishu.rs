use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use margin_core::comment::{Block, Comment, Reply, RichText, RichTextElement};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::now_ms;
use crate::service::DocumentService;

/// Tokens are refreshed once fewer than this many milliseconds of validity remain.
const TOKEN_REFRESH_MARGIN_MS: u64 = 5 * 60 * 1000;
const COMMENTS_PAGE_SIZE: &str = "100";
const BLOCKS_PAGE_SIZE: &str = "500";

#[derive(Debug, Clone)]
pub struct FeishuOptions {
    pub base_url: String,
    pub app_id: String,
    pub app_secret: String,
    pub file_type: String,
    pub bot_open_id: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedToken {
    value: String,
    expires_at_ms: u64,
}

impl CachedToken {
    fn is_fresh_at(&self, now_ms: u64) -> bool {
        now_ms.saturating_add(TOKEN_REFRESH_MARGIN_MS) < self.expires_at_ms
    }
}

/// Tenant access token held by one client. Refreshed ahead of expiry, never shared globally.
#[derive(Debug, Default)]
pub struct TokenCache {
    inner: Mutex<Option<CachedToken>>,
}

pub struct FeishuClient {
    client: reqwest::Client,
    base_url: Url,
    app_id: String,
    app_secret: String,
    file_type: String,
    tokens: TokenCache,
    bot_identity: Mutex<Option<String>>,
}

impl FeishuClient {
    pub fn new(opts: FeishuOptions) -> anyhow::Result<Self> {
        if opts.app_id.trim().is_empty() {
            return Err(anyhow!("missing feishu app id"));
        }
        if opts.app_secret.trim().is_empty() {
            return Err(anyhow!("missing feishu app secret"));
        }

        let base_url = Url::parse(opts.base_url.trim())
            .with_context(|| format!("invalid feishu base url: {}", opts.base_url))?;
        if base_url.cannot_be_a_base() {
            return Err(anyhow!("invalid feishu base url: {}", opts.base_url));
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .user_agent(format!("margin/{}", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .timeout(opts.request_timeout)
            .build()
            .context("build reqwest client")?;

        let file_type = if opts.file_type.trim().is_empty() {
            margin_core::config::DEFAULT_FILE_TYPE.to_owned()
        } else {
            opts.file_type.trim().to_owned()
        };

        let bot_identity = opts
            .bot_open_id
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty());

        Ok(Self {
            client,
            base_url,
            app_id: opts.app_id,
            app_secret: opts.app_secret,
            file_type,
            tokens: TokenCache::default(),
            bot_identity: Mutex::new(bot_identity),
        })
    }

    async fn access_token(&self) -> anyhow::Result<String> {
        let mut cached = self.tokens.inner.lock().await;
        let now = now_ms();
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh_at(now)) {
            return Ok(token.value.clone());
        }

        let fresh = self.fetch_tenant_token(now).await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn fetch_tenant_token(&self, now_ms: u64) -> anyhow::Result<CachedToken> {
        #[derive(Debug, Serialize)]
        struct TokenRequest<'a> {
            app_id: &'a str,
            app_secret: &'a str,
        }

        #[derive(Debug, Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            code: i64,
            #[serde(default)]
            msg: String,
            #[serde(default)]
            tenant_access_token: String,
            #[serde(default)]
            expire: u64,
        }

        let url = self.endpoint(&["auth", "v3", "tenant_access_token", "internal"])?;
        let resp: TokenResponse = self
            .send(
                "tenant access token",
                self.client.post(url).json(&TokenRequest {
                    app_id: &self.app_id,
                    app_secret: &self.app_secret,
                }),
            )
            .await?;

        if resp.code != 0 {
            return Err(anyhow!(
                "feishu auth error (code {}): {}",
                resp.code,
                resp.msg
            ));
        }
        if resp.tenant_access_token.trim().is_empty() {
            return Err(anyhow!("feishu auth response missing tenant_access_token"));
        }

        tracing::debug!(expire_secs = resp.expire, "refreshed feishu tenant token");

        Ok(CachedToken {
            value: resp.tenant_access_token,
            expires_at_ms: now_ms.saturating_add(resp.expire.saturating_mul(1000)),
        })
    }

    async fn fetch_bot_open_id(&self) -> anyhow::Result<String> {
        #[derive(Debug, Deserialize)]
        struct BotInfoResponse {
            #[serde(default)]
            code: i64,
            #[serde(default)]
            msg: String,
            #[serde(default)]
            bot: Option<BotInfo>,
        }
        #[derive(Debug, Deserialize)]
        struct BotInfo {
            #[serde(default)]
            open_id: String,
        }

        let token = self.access_token().await?;
        let url = self.endpoint(&["bot", "v3", "info"])?;
        let resp: BotInfoResponse = self
            .send("bot info", self.client.get(url).bearer_auth(token))
            .await?;

        if resp.code != 0 {
            return Err(anyhow!(
                "feishu bot info error (code {}): {}",
                resp.code,
                resp.msg
            ));
        }

        resp.bot
            .map(|b| b.open_id.trim().to_owned())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("feishu bot info response missing open_id"))
    }

    async fn comment_page(
        &self,
        document: &str,
        page_token: Option<&str>,
    ) -> anyhow::Result<Page<FeishuComment>> {
        let token = self.access_token().await?;
        let url = self.endpoint(&["drive", "v1", "files", document, "comments"])?;

        let mut req = self.client.get(url).bearer_auth(token).query(&[
            ("file_type", self.file_type.as_str()),
            ("user_id_type", "open_id"),
            ("page_size", COMMENTS_PAGE_SIZE),
        ]);
        if let Some(page_token) = page_token {
            req = req.query(&[("page_token", page_token)]);
        }

        let envelope: Envelope<Page<FeishuComment>> = self.send("list comments", req).await?;
        envelope.into_data("list comments")
    }

    async fn remaining_replies(
        &self,
        document: &str,
        comment_id: &str,
        mut page_token: Option<String>,
    ) -> anyhow::Result<Vec<FeishuReply>> {
        let mut out = Vec::new();

        while let Some(current) = page_token.take() {
            let token = self.access_token().await?;
            let url = self.endpoint(&[
                "drive", "v1", "files", document, "comments", comment_id, "replies",
            ])?;
            let req = self.client.get(url).bearer_auth(token).query(&[
                ("file_type", self.file_type.as_str()),
                ("user_id_type", "open_id"),
                ("page_size", COMMENTS_PAGE_SIZE),
                ("page_token", current.as_str()),
            ]);

            let envelope: Envelope<Page<FeishuReply>> = self.send("list replies", req).await?;
            let page = envelope.into_data("list replies")?;
            page_token = page.next_token(Some(current.as_str()));
            out.extend(page.items);
        }

        Ok(out)
    }

    fn endpoint(&self, segments: &[&str]) -> anyhow::Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("invalid feishu base url: {}", self.base_url))?
            .pop_if_empty()
            .push("open-apis")
            .extend(segments);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        what: &str,
        req: reqwest::RequestBuilder,
    ) -> anyhow::Result<T> {
        let resp = req
            .send()
            .await
            .with_context(|| format!("send {what} request"))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .with_context(|| format!("read {what} response"))?;

        // Client errors usually carry a {code, msg} envelope; hand it to the caller to inspect.
        if !status.is_success() {
            let api_code = serde_json::from_str::<ApiStatus>(&text)
                .map(|s| s.code)
                .unwrap_or(0);
            if !(status.is_client_error() && api_code != 0) {
                return Err(anyhow!("feishu api error ({status}) during {what}: {text}"));
            }
        }

        serde_json::from_str(&text).with_context(|| format!("parse {what} response"))
    }
}

#[async_trait]
impl DocumentService for FeishuClient {
    async fn authenticate(&self) -> anyhow::Result<()> {
        self.access_token().await.map(|_| ())
    }

    async fn bot_identity(&self) -> anyhow::Result<String> {
        let mut cached = self.bot_identity.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let id = self
            .fetch_bot_open_id()
            .await
            .context("resolve bot identity")?;
        tracing::info!(open_id = %id, "resolved bot identity");
        *cached = Some(id.clone());
        Ok(id)
    }

    async fn list_comments(&self, document: &str) -> anyhow::Result<Vec<Comment>> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .comment_page(document, page_token.as_deref())
                .await
                .with_context(|| format!("list comments for {document}"))?;
            let next = page.next_token(page_token.as_deref());

            for mut raw in page.items {
                if raw.has_more {
                    let extra = self
                        .remaining_replies(document, &raw.comment_id, raw.page_token.take())
                        .await
                        .with_context(|| format!("list replies for comment {}", raw.comment_id))?;
                    raw.reply_list
                        .get_or_insert_with(FeishuReplyList::default)
                        .replies
                        .extend(extra);
                }
                out.push(to_comment(raw));
            }

            match next {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(out)
    }

    async fn document_blocks(&self, document: &str) -> anyhow::Result<Option<Vec<Block>>> {
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let token = self.access_token().await?;
            let url = self.endpoint(&["docx", "v1", "documents", document, "blocks"])?;
            let mut req = self
                .client
                .get(url)
                .bearer_auth(token)
                .query(&[("page_size", BLOCKS_PAGE_SIZE)]);
            if let Some(page_token) = page_token.as_deref() {
                req = req.query(&[("page_token", page_token)]);
            }

            let envelope: Envelope<Page<Block>> = self
                .send("list document blocks", req)
                .await
                .with_context(|| format!("list blocks for {document}"))?;
            if envelope.code != 0 {
                tracing::debug!(
                    document = %document,
                    code = envelope.code,
                    msg = %envelope.msg,
                    "document blocks unavailable"
                );
                return Ok(None);
            }

            let page = envelope.into_data("list document blocks")?;
            let next = page.next_token(page_token.as_deref());
            out.extend(page.items);
            match next {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(Some(out))
    }

    async fn post_reply(
        &self,
        document: &str,
        comment_id: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        let token = self.access_token().await?;
        let url = self.endpoint(&[
            "drive", "v1", "files", document, "comments", comment_id, "replies",
        ])?;
        let body = serde_json::json!({
            "content": {
                "elements": [
                    { "type": "text_run", "text_run": { "text": text } }
                ]
            }
        });

        let envelope: Envelope<serde_json::Value> = self
            .send(
                "post reply",
                self.client
                    .post(url)
                    .bearer_auth(token)
                    .query(&[("file_type", self.file_type.as_str())])
                    .json(&body),
            )
            .await?;
        envelope.into_data("post reply").map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    code: i64,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default = "Option::default")]
    data: Option<T>,
}

impl<T: Default> Envelope<T> {
    fn into_data(self, what: &str) -> anyhow::Result<T> {
        if self.code != 0 {
            return Err(anyhow!(
                "feishu {what} error (code {}): {}",
                self.code,
                self.msg
            ));
        }
        Ok(self.data.unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            has_more: false,
            page_token: None,
            items: Vec::new(),
        }
    }
}

impl<T> Page<T> {
    /// Token for the page after `current`. A repeated token ends pagination.
    fn next_token(&self, current: Option<&str>) -> Option<String> {
        if !self.has_more {
            return None;
        }
        let next = self
            .page_token
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())?;
        if Some(next) == current {
            tracing::warn!(page_token = %next, "service repeated page token; stopping pagination");
            return None;
        }
        Some(next.to_owned())
    }
}

#[derive(Debug, Deserialize)]
struct FeishuComment {
    comment_id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    create_time: i64,
    #[serde(default)]
    update_time: i64,
    #[serde(default)]
    is_solved: bool,
    #[serde(default)]
    solver_user_id: Option<String>,
    #[serde(default)]
    quote: Option<String>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    reply_list: Option<FeishuReplyList>,
}

#[derive(Debug, Default, Deserialize)]
struct FeishuReplyList {
    #[serde(default)]
    replies: Vec<FeishuReply>,
}

#[derive(Debug, Deserialize)]
struct FeishuReply {
    reply_id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    create_time: i64,
    #[serde(default)]
    content: FeishuReplyContent,
}

#[derive(Debug, Default, Deserialize)]
struct FeishuReplyContent {
    #[serde(default)]
    elements: Vec<FeishuReplyElement>,
}

#[derive(Debug, Deserialize)]
struct FeishuReplyElement {
    #[serde(rename = "type", default)]
    ty: String,
    #[serde(default)]
    text_run: Option<FeishuTextRun>,
    #[serde(default)]
    docs_link: Option<FeishuDocsLink>,
    #[serde(default)]
    person: Option<FeishuPerson>,
}

#[derive(Debug, Deserialize)]
struct FeishuTextRun {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct FeishuDocsLink {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct FeishuPerson {
    #[serde(default)]
    user_id: String,
}

fn to_rich_text(content: FeishuReplyContent) -> RichText {
    let elements = content
        .elements
        .into_iter()
        .filter_map(|el| match el.ty.as_str() {
            "text_run" => el
                .text_run
                .map(|t| RichTextElement::TextRun { text: t.text }),
            "docs_link" => el
                .docs_link
                .map(|d| RichTextElement::DocsLink { url: d.url }),
            "person" => el
                .person
                .map(|p| RichTextElement::Person { user_id: p.user_id }),
            _ => None,
        })
        .collect();
    RichText { elements }
}

// The service stores a comment's own text as the first entry of its reply list.
fn to_comment(raw: FeishuComment) -> Comment {
    let mut replies = raw
        .reply_list
        .map(|l| l.replies)
        .unwrap_or_default()
        .into_iter();

    let body = replies
        .next()
        .map(|first| to_rich_text(first.content))
        .unwrap_or_default();

    let replies = replies
        .map(|r| Reply {
            id: r.reply_id,
            user_id: r.user_id,
            body: to_rich_text(r.content),
            created_at: r.create_time,
        })
        .collect();

    Comment {
        id: raw.comment_id,
        user_id: raw.user_id,
        created_at: raw.create_time,
        updated_at: raw.update_time,
        is_solved: raw.is_solved,
        solver_user_id: raw.solver_user_id.filter(|s| !s.trim().is_empty()),
        body,
        quote: raw.quote.filter(|s| !s.trim().is_empty()),
        replies,
    }
}
