use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use margin_core::config::{AgentProvider, ConfigFile};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt as _;
use tokio::process::ChildStdin;

use crate::providers;

const DEFAULT_ANTHROPIC_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Where a prompt came from, passed alongside it to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeContext {
    pub source: String,
    pub document: String,
    pub comment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub response: String,
}

#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, prompt: &str, ctx: &InvokeContext) -> anyhow::Result<AgentResponse>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HttpProvider {
    Anthropic,
    OpenAI,
}

#[derive(Debug, Clone)]
pub struct HttpAgent {
    provider: HttpProvider,
    model: String,
    api_key: String,
    api_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl HttpAgent {
    pub fn new(
        provider: HttpProvider,
        model: String,
        api_key: String,
        api_url: String,
        max_tokens: u32,
    ) -> anyhow::Result<Self> {
        if model.trim().is_empty() {
            return Err(anyhow!("agent model is empty"));
        }
        if api_key.trim().is_empty() {
            return Err(anyhow!("agent api key is empty"));
        }
        if api_url.trim().is_empty() {
            return Err(anyhow!("agent api url is empty"));
        }

        let client = reqwest::Client::builder()
            .user_agent(format!("margin/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .context("build reqwest client")?;

        Ok(Self {
            provider,
            model,
            api_key,
            api_url,
            max_tokens,
            client,
        })
    }

    async fn call_anthropic(&self, prompt: &str) -> anyhow::Result<String> {
        #[derive(Debug, Serialize)]
        struct AnthropicRequest<'a> {
            model: &'a str,
            max_tokens: u32,
            messages: Vec<Message<'a>>,
        }

        #[derive(Debug, Deserialize)]
        struct AnthropicResponse {
            #[serde(default)]
            content: Vec<AnthropicContentBlock>,
            #[serde(default)]
            error: Option<ApiError>,
        }

        #[derive(Debug, Deserialize)]
        struct AnthropicContentBlock {
            #[serde(rename = "type")]
            ty: String,
            #[serde(default)]
            text: Option<String>,
        }

        let url = format!("{}/v1/messages", self.api_url.trim_end_matches('/'));
        let req_body = AnthropicRequest {
            model: self.model.as_str(),
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let resp = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("x-api-key", self.api_key.as_str())
            .header("anthropic-version", "2023-06-01")
            .json(&req_body)
            .send()
            .await
            .context("send anthropic request")?;

        let status = resp.status();
        let text = resp.text().await.context("read anthropic response")?;
        if !status.is_success() {
            return Err(anyhow!("anthropic api error ({status}): {text}"));
        }

        let parsed: AnthropicResponse =
            serde_json::from_str(&text).context("parse anthropic response")?;
        if let Some(err) = parsed.error {
            return Err(anyhow!("anthropic api error: {}", err.message));
        }

        let out = parsed
            .content
            .into_iter()
            .filter(|b| b.ty == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n");
        Ok(out)
    }

    async fn call_openai(&self, prompt: &str) -> anyhow::Result<String> {
        #[derive(Debug, Serialize)]
        struct OpenAIRequest<'a> {
            model: &'a str,
            max_tokens: u32,
            messages: Vec<Message<'a>>,
        }

        #[derive(Debug, Deserialize)]
        struct OpenAIResponse {
            #[serde(default)]
            choices: Vec<OpenAIChoice>,
            #[serde(default)]
            error: Option<ApiError>,
        }

        #[derive(Debug, Deserialize)]
        struct OpenAIChoice {
            message: OpenAIResponseMessage,
        }

        #[derive(Debug, Deserialize)]
        struct OpenAIResponseMessage {
            #[serde(default)]
            content: Option<String>,
        }

        let url = format!("{}/v1/chat/completions", self.api_url.trim_end_matches('/'));
        let req_body = OpenAIRequest {
            model: self.model.as_str(),
            max_tokens: self.max_tokens,
            messages: vec![Message {
                role: "user",
                content: prompt,
            }],
        };

        let resp = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&req_body)
            .send()
            .await
            .context("send openai request")?;

        let status = resp.status();
        let text = resp.text().await.context("read openai response")?;
        if !status.is_success() {
            return Err(anyhow!("openai api error ({status}): {text}"));
        }

        let parsed: OpenAIResponse =
            serde_json::from_str(&text).context("parse openai response")?;
        if let Some(err) = parsed.error {
            return Err(anyhow!("openai api error: {}", err.message));
        }

        let first = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("openai response missing choices"))?;
        Ok(first.message.content.unwrap_or_default())
    }
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[async_trait]
impl Agent for HttpAgent {
    async fn invoke(&self, prompt: &str, ctx: &InvokeContext) -> anyhow::Result<AgentResponse> {
        tracing::debug!(
            provider = ?self.provider,
            model = %self.model,
            source = %ctx.source,
            comment_id = %ctx.comment_id,
            "invoking agent"
        );
        let response = match self.provider {
            HttpProvider::Anthropic => self.call_anthropic(prompt).await?,
            HttpProvider::OpenAI => self.call_openai(prompt).await?,
        };
        Ok(AgentResponse { response })
    }
}

/// Runs an external program per prompt: prompt on stdin, reply on stdout.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandAgent {
    pub fn new(command: &[String]) -> anyhow::Result<Self> {
        let (program, args) = command
            .split_first()
            .filter(|(p, _)| !p.trim().is_empty())
            .ok_or_else(|| anyhow!("agent command is empty"))?;

        Ok(Self {
            program: program.trim().to_owned(),
            args: args.to_vec(),
            timeout: COMMAND_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Agent for CommandAgent {
    async fn invoke(&self, prompt: &str, ctx: &InvokeContext) -> anyhow::Result<AgentResponse> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .env("MARGIN_SOURCE", &ctx.source)
            .env("MARGIN_DOCUMENT", &ctx.document)
            .env("MARGIN_COMMENT_ID", &ctx.comment_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawn agent command: {}", self.program))?;

        // Stdin is fed while stdout drains. The timeout covers both, and dropping the exchange
        // kills the child.
        let stdin = child.stdin.take();
        let exchange = async {
            let (written, output) =
                tokio::join!(write_prompt(stdin, prompt), child.wait_with_output());
            written?;
            Ok::<_, anyhow::Error>(output.context("wait for agent command")?)
        };
        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| anyhow!("agent command timed out after {:?}", self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "agent command exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }

        Ok(AgentResponse {
            response: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
        })
    }
}

// A program that exits without reading its input is judged by its exit status instead.
async fn write_prompt(stdin: Option<ChildStdin>, prompt: &str) -> anyhow::Result<()> {
    let Some(mut stdin) = stdin else {
        return Ok(());
    };
    let written = match stdin.write_all(prompt.as_bytes()).await {
        Ok(()) => stdin.shutdown().await,
        Err(err) => Err(err),
    };
    match written {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err).context("write prompt to agent command"),
    }
}

/// Builds the agent selected by `[agent]`, pulling credentials from config or environment.
pub fn agent_from_config(config: &ConfigFile) -> anyhow::Result<Arc<dyn Agent>> {
    let agent = config.effective_agent();
    let model = agent
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_owned);

    match agent.provider {
        AgentProvider::Anthropic => {
            let api_key = providers::anthropic_api_key(config).ok_or_else(|| {
                anyhow!("missing anthropic api key (set [agent] api-key or ANTHROPIC_API_KEY)")
            })?;
            Ok(Arc::new(HttpAgent::new(
                HttpProvider::Anthropic,
                model.unwrap_or_else(|| DEFAULT_ANTHROPIC_MODEL.to_owned()),
                api_key,
                providers::anthropic_api_url(config),
                agent.effective_max_tokens(),
            )?))
        }
        AgentProvider::OpenAI => {
            let api_key = providers::openai_api_key(config).ok_or_else(|| {
                anyhow!("missing openai api key (set [agent] api-key or OPENAI_API_KEY)")
            })?;
            Ok(Arc::new(HttpAgent::new(
                HttpProvider::OpenAI,
                model.unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_owned()),
                api_key,
                providers::openai_api_url(config),
                agent.effective_max_tokens(),
            )?))
        }
        AgentProvider::Command => Ok(Arc::new(CommandAgent::new(&agent.command)?)),
    }
}
