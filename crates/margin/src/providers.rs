use std::env;

use anyhow::anyhow;
use margin_core::config::{AgentProvider, ConfigFile};

use crate::feishu::FeishuOptions;

const DEFAULT_FEISHU_BASE_URL: &str = "https://open.feishu.cn";
const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com";
const DEFAULT_OPENAI_API_URL: &str = "https://api.openai.com";

pub fn feishu_app_id(config: &ConfigFile) -> Option<String> {
    non_blank(config.feishu.as_ref().and_then(|f| f.app_id.clone()))
        .or_else(|| env_non_blank("FEISHU_APP_ID"))
}

pub fn feishu_app_secret(config: &ConfigFile) -> Option<String> {
    non_blank(config.feishu.as_ref().and_then(|f| f.app_secret.clone()))
        .or_else(|| env_non_blank("FEISHU_APP_SECRET"))
}

pub fn feishu_base_url(config: &ConfigFile) -> String {
    env_non_blank("FEISHU_BASE_URL")
        .or_else(|| non_blank(config.feishu.as_ref().and_then(|f| f.base_url.clone())))
        .unwrap_or_else(|| DEFAULT_FEISHU_BASE_URL.to_owned())
}

pub fn feishu_options(config: &ConfigFile, file_type: &str) -> anyhow::Result<FeishuOptions> {
    let feishu = config.effective_feishu();
    let app_id = feishu_app_id(config)
        .ok_or_else(|| anyhow!("missing feishu app id (set [feishu] app-id or FEISHU_APP_ID)"))?;
    let app_secret = feishu_app_secret(config).ok_or_else(|| {
        anyhow!("missing feishu app secret (set [feishu] app-secret or FEISHU_APP_SECRET)")
    })?;

    Ok(FeishuOptions {
        base_url: feishu_base_url(config),
        app_id,
        app_secret,
        file_type: file_type.to_owned(),
        bot_open_id: non_blank(feishu.bot_open_id.clone()),
        request_timeout: feishu.effective_request_timeout(),
    })
}

/// A field of `[agent]`, only when that section selects `provider`.
fn agent_string(
    config: &ConfigFile,
    provider: AgentProvider,
    pick: impl Fn(&margin_core::config::AgentConfig) -> Option<String>,
) -> Option<String> {
    config
        .agent
        .as_ref()
        .filter(|a| a.provider == provider)
        .and_then(|a| non_blank(pick(a)))
}

pub fn anthropic_api_key(config: &ConfigFile) -> Option<String> {
    agent_string(config, AgentProvider::Anthropic, |a| a.api_key.clone())
        .or_else(|| env_non_blank("ANTHROPIC_API_KEY"))
}

pub fn anthropic_api_url(config: &ConfigFile) -> String {
    env_non_blank("ANTHROPIC_API_URL")
        .or_else(|| agent_string(config, AgentProvider::Anthropic, |a| a.api_url.clone()))
        .unwrap_or_else(|| DEFAULT_ANTHROPIC_API_URL.to_owned())
}

pub fn openai_api_key(config: &ConfigFile) -> Option<String> {
    agent_string(config, AgentProvider::OpenAI, |a| a.api_key.clone())
        .or_else(|| env_non_blank("OPENAI_API_KEY"))
}

pub fn openai_api_url(config: &ConfigFile) -> String {
    env_non_blank("OPENAI_API_URL")
        .or_else(|| agent_string(config, AgentProvider::OpenAI, |a| a.api_url.clone()))
        .unwrap_or_else(|| DEFAULT_OPENAI_API_URL.to_owned())
}

fn env_non_blank(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}
