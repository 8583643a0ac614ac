use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default, rename = "log_level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling: Option<PollingConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feishu: Option<FeishuConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentConfig>,

    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, toml::Value>,
}

/// Which documents to watch and how often.
///
/// Every field is optional so that host-supplied values can fill what the file leaves unset.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct PollingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    #[serde(
        default,
        rename = "poll-interval-minutes",
        alias = "poll_interval_minutes",
        skip_serializing_if = "Option::is_none"
    )]
    pub poll_interval_minutes: Option<u64>,

    #[serde(
        default,
        rename = "initial-delay-secs",
        alias = "initial_delay_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub initial_delay_secs: Option<u64>,

    #[serde(
        default,
        rename = "index-document",
        alias = "index_document",
        skip_serializing_if = "Option::is_none"
    )]
    pub index_document: Option<String>,

    #[serde(
        default,
        rename = "watched-files",
        alias = "watched_files",
        skip_serializing_if = "Option::is_none"
    )]
    pub watched_files: Option<Vec<String>>,

    #[serde(
        default,
        rename = "file-type",
        alias = "file_type",
        skip_serializing_if = "Option::is_none"
    )]
    pub file_type: Option<String>,
}

pub const DEFAULT_POLL_INTERVAL_MINUTES: u64 = 15;
pub const MAX_POLL_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
pub const DEFAULT_INITIAL_DELAY_SECS: u64 = 10;
pub const DEFAULT_FILE_TYPE: &str = "docx";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct FeishuConfig {
    #[serde(default, rename = "app-id", alias = "app_id", skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,

    #[serde(
        default,
        rename = "app-secret",
        alias = "app_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub app_secret: Option<String>,

    #[serde(
        default,
        rename = "base-url",
        alias = "base_url",
        skip_serializing_if = "Option::is_none"
    )]
    pub base_url: Option<String>,

    /// Identity whose replies count as the agent's own. Resolved from the service when unset.
    #[serde(
        default,
        rename = "bot-open-id",
        alias = "bot_open_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub bot_open_id: Option<String>,

    #[serde(
        default,
        rename = "request-timeout-secs",
        alias = "request_timeout_secs",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_timeout_secs: Option<u64>,
}

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

impl FeishuConfig {
    pub fn effective_request_timeout(&self) -> Duration {
        match self.request_timeout_secs {
            Some(0) | None => Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            Some(secs) => Duration::from_secs(secs),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AgentProvider {
    #[serde(rename = "anthropic")]
    #[default]
    Anthropic,
    #[serde(rename = "openai")]
    OpenAI,
    #[serde(rename = "command")]
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AgentConfig {
    #[serde(default)]
    pub provider: AgentProvider,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, rename = "api-key", alias = "api_key", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, rename = "api-url", alias = "api_url", skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(
        default,
        rename = "max-tokens",
        alias = "max_tokens",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_tokens: Option<u32>,

    /// Program and arguments for the `command` provider.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

pub const DEFAULT_MAX_TOKENS: u32 = 1024;

impl AgentConfig {
    pub fn effective_max_tokens(&self) -> u32 {
        match self.max_tokens {
            Some(0) | None => DEFAULT_MAX_TOKENS,
            Some(n) => n,
        }
    }
}

/// Values supplied by the hosting process (CLI flags, environment) rather than the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOverrides {
    pub enabled: Option<bool>,
    pub poll_interval_minutes: Option<u64>,
    pub index_document: Option<String>,
    pub watched_files: Option<Vec<String>>,
}

/// Polling settings after defaults and host overrides are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub enabled: bool,
    pub interval: Duration,
    pub initial_delay: Duration,
    pub index_document: Option<String>,
    pub watched_files: Vec<String>,
    pub file_type: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("agent provider `command` requires a non-empty `command`")]
    EmptyAgentCommand,
    #[error("watched-files contains a blank token")]
    BlankWatchedFile,
    #[error("poll-interval-minutes must be at most 10080 (one week), got {0}")]
    PollIntervalTooLarge(u64),
    #[error("unknown config key: {key}")]
    UnknownKey { key: String },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

impl ConfigFile {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(agent) = &self.agent {
            if agent.provider == AgentProvider::Command
                && agent.command.first().map_or(true, |p| p.trim().is_empty())
            {
                return Err(ConfigError::EmptyAgentCommand);
            }
        }

        if let Some(minutes) = self
            .polling
            .as_ref()
            .and_then(|p| p.poll_interval_minutes)
            .filter(|m| *m > MAX_POLL_INTERVAL_MINUTES)
        {
            return Err(ConfigError::PollIntervalTooLarge(minutes));
        }

        if let Some(files) = self.polling.as_ref().and_then(|p| p.watched_files.as_ref()) {
            if files.iter().any(|f| f.trim().is_empty()) {
                return Err(ConfigError::BlankWatchedFile);
            }
        }

        Ok(())
    }

    pub fn effective_feishu(&self) -> FeishuConfig {
        self.feishu.clone().unwrap_or_default()
    }

    pub fn effective_agent(&self) -> AgentConfig {
        self.agent.clone().unwrap_or_default()
    }

    /// Resolves polling settings. The host's `enabled` always wins; its other values only
    /// fill fields the file leaves unset.
    pub fn poll_settings(&self, host: &HostOverrides) -> PollSettings {
        let file = self.polling.clone().unwrap_or_default();

        let enabled = host.enabled.or(file.enabled).unwrap_or(true);

        let interval_minutes = file
            .poll_interval_minutes
            .filter(|m| *m > 0)
            .or(host.poll_interval_minutes.filter(|m| *m > 0))
            .unwrap_or(DEFAULT_POLL_INTERVAL_MINUTES)
            .min(MAX_POLL_INTERVAL_MINUTES);

        let index_document =
            non_blank(file.index_document).or_else(|| non_blank(host.index_document.clone()));

        let watched_files = file
            .watched_files
            .or_else(|| host.watched_files.clone())
            .unwrap_or_default();

        PollSettings {
            enabled,
            interval: Duration::from_secs(interval_minutes.saturating_mul(60)),
            initial_delay: Duration::from_secs(
                file.initial_delay_secs.unwrap_or(DEFAULT_INITIAL_DELAY_SECS),
            ),
            index_document,
            watched_files,
            file_type: non_blank(file.file_type).unwrap_or_else(|| DEFAULT_FILE_TYPE.to_owned()),
        }
    }

    pub fn set_key(&self, key: &str, value: &str) -> Result<Self, ConfigError> {
        let key = normalize_key(key);
        let mut next = self.clone();

        match key.as_str() {
            "enabled" => {
                next.polling_mut().enabled = Some(parse_value(&key, value)?);
            }
            "poll-interval-minutes" => {
                let minutes: u64 = parse_value(&key, value)?;
                if minutes == 0 {
                    return Err(ConfigError::InvalidValue {
                        key,
                        value: value.to_owned(),
                    });
                }
                if minutes > MAX_POLL_INTERVAL_MINUTES {
                    return Err(ConfigError::PollIntervalTooLarge(minutes));
                }
                next.polling_mut().poll_interval_minutes = Some(minutes);
            }
            "initial-delay-secs" => {
                next.polling_mut().initial_delay_secs = Some(parse_value(&key, value)?);
            }
            "index-document" => {
                next.polling_mut().index_document = non_blank(Some(value.to_owned()));
            }
            "watched-files" => {
                let files = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect::<Vec<_>>();
                next.polling_mut().watched_files = Some(files);
            }
            "file-type" => {
                next.polling_mut().file_type = non_blank(Some(value.to_owned()));
            }
            "agent-provider" => {
                next.agent.get_or_insert_with(AgentConfig::default).provider =
                    parse_enum::<AgentProvider>(&key, value)?;
            }
            "agent-model" => {
                next.agent.get_or_insert_with(AgentConfig::default).model =
                    non_blank(Some(value.to_owned()));
            }
            _ => return Err(ConfigError::UnknownKey { key }),
        }

        next.validate()?;
        Ok(next)
    }

    pub fn get_key_value(&self, key: &str) -> Result<toml::Value, ConfigError> {
        let key = normalize_key(key);
        let settings = self.poll_settings(&HostOverrides::default());
        let agent = self.effective_agent();

        let value = match key.as_str() {
            "enabled" => toml::Value::Boolean(settings.enabled),
            "poll-interval-minutes" => {
                toml::Value::Integer((settings.interval.as_secs() / 60) as i64)
            }
            "initial-delay-secs" => toml::Value::Integer(settings.initial_delay.as_secs() as i64),
            "index-document" => toml::Value::String(settings.index_document.unwrap_or_default()),
            "watched-files" => toml::Value::Array(
                settings
                    .watched_files
                    .into_iter()
                    .map(toml::Value::String)
                    .collect(),
            ),
            "file-type" => toml::Value::String(settings.file_type),
            "agent-provider" => toml::Value::String(format_enum(agent.provider)),
            "agent-model" => toml::Value::String(agent.model.unwrap_or_default()),
            _ => return Err(ConfigError::UnknownKey { key }),
        };

        Ok(value)
    }

    fn polling_mut(&mut self) -> &mut PollingConfig {
        self.polling.get_or_insert_with(PollingConfig::default)
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

fn normalize_key(key: &str) -> String {
    key.trim().replace('_', "-").to_ascii_lowercase()
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_enum<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de>,
{
    let value = value.trim();
    toml::Value::String(value.to_owned())
        .try_into()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        })
}

fn format_enum<T>(value: T) -> String
where
    T: Serialize,
{
    let v = toml::Value::try_from(value).unwrap_or(toml::Value::String("unknown".to_owned()));
    v.as_str().unwrap_or("unknown").to_owned()
}
