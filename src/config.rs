//! Configuration loading and defaults for assistant-relay.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_ASSISTANT_NAME: &str = "Aptero Assistant";
pub const DEFAULT_INSTRUCTIONS: &str = "You are a personal assistant";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_SIGNATURE_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_RESOURCE_MAX_AGE_HOURS: u64 = 24;
pub const DEFAULT_SINK_CAPACITY: usize = 64;
pub const DEFAULT_REPORT_SUBJECT: &str = "--- AI Assistant Report ---";
const SENDGRID_BASE_URL: &str = "https://api.sendgrid.com";

// === Types ===

/// `[retry]` table as written in the file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    pub enabled: Option<bool>,
    pub max_retries: Option<u32>,
    pub initial_delay: Option<f64>,
    pub max_delay: Option<f64>,
    pub exponential_base: Option<f64>,
}

/// Resolved retry policy for assistant-service HTTP calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_retries: u32,
    pub initial_delay: f64,
    pub max_delay: f64,
    pub exponential_base: f64,
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (zero based).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.initial_delay * self.exponential_base.powi(exponent);
        let delay = delay.min(self.max_delay);
        // NaN or negative settings collapse to zero, huge ones to five minutes
        let delay = delay.clamp(0.0, 300.0);
        Duration::from_secs_f64(delay)
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            initial_delay: 0.0,
            max_delay: 0.0,
            exponential_base: 1.0,
        }
    }
}

/// Listener settings for `serve`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Mail delivery for abuse reports.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportConfig {
    pub sendgrid_api_key: Option<String>,
    pub to: Option<String>,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub base_url: Option<String>,
}

/// Settings for the `chat` client.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ClientConfig {
    pub base_url: Option<String>,
    pub tool_command: Option<String>,
    pub tool_timeout_secs: Option<u64>,
}

/// Resolved configuration, including defaults and environment overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub assistant_name: Option<String>,
    pub default_instructions: Option<String>,
    pub tools_file: Option<String>,
    pub secret_key: Option<String>,
    pub site_password: Option<String>,
    pub signature_window_secs: Option<u64>,
    pub resource_max_age_hours: Option<u64>,
    pub upload_dir: Option<String>,
    pub sink_capacity: Option<usize>,
    pub retry: Option<RetryConfig>,
    pub server: Option<ServerConfig>,
    pub report: Option<ReportConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(flatten)]
    base: Config,
    profiles: Option<HashMap<String, Config>>,
}

// === Config Loading ===

impl Config {
    /// Read the file (if any), apply the profile, then the environment.
    pub fn load(path: Option<PathBuf>, profile: Option<&str>) -> Result<Self> {
        let path = resolve_load_config_path(path);
        let mut config = match path.as_ref() {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("cannot read config {}", path.display()))?;
                let parsed: ConfigFile = toml::from_str(&contents)
                    .with_context(|| format!("invalid TOML in {}", path.display()))?;
                apply_profile(parsed, profile)?
            }
            _ => Config::default(),
        };

        apply_env_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Validate that critical config fields are well formed.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref key) = self.api_key
            && key.trim().is_empty()
        {
            anyhow::bail!("api_key is set but empty");
        }
        if let Some(ref secret) = self.secret_key
            && secret.trim().is_empty()
        {
            anyhow::bail!("secret_key is set but empty");
        }
        if self.signature_window_secs == Some(0) {
            anyhow::bail!("signature_window_secs must be > 0");
        }
        if self.sink_capacity == Some(0) {
            anyhow::bail!("sink_capacity must be > 0");
        }
        if let Some(server) = &self.server
            && server.port == Some(0)
        {
            anyhow::bail!("server.port must be > 0");
        }
        Ok(())
    }

    /// Assistant service API key, required to serve.
    pub fn api_key(&self) -> Result<String> {
        if let Some(key) = self.api_key.clone()
            && !key.trim().is_empty()
        {
            return Ok(key);
        }
        anyhow::bail!(
            "Assistant service API key not found. Set it using one of these methods:\n\
             1. Set OPENAI_API_KEY environment variable (recommended)\n\
             2. Add 'api_key = \"your-key\"' to ~/.assistant-relay/config.toml"
        )
    }

    /// Assistant service base URL, without a trailing slash or `/v1`.
    #[must_use]
    pub fn base_url(&self) -> String {
        let base = self
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        normalize_base_url(&base)
    }

    #[must_use]
    pub fn default_model(&self) -> String {
        self.default_model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    #[must_use]
    pub fn assistant_name(&self) -> String {
        self.assistant_name
            .clone()
            .unwrap_or_else(|| DEFAULT_ASSISTANT_NAME.to_string())
    }

    #[must_use]
    pub fn default_instructions(&self) -> String {
        self.default_instructions
            .clone()
            .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string())
    }

    #[must_use]
    pub fn tools_file(&self) -> Option<PathBuf> {
        self.tools_file.as_deref().map(expand_path)
    }

    #[must_use]
    pub fn signature_window(&self) -> Duration {
        Duration::from_secs(
            self.signature_window_secs
                .unwrap_or(DEFAULT_SIGNATURE_WINDOW_SECS),
        )
    }

    #[must_use]
    pub fn resource_max_age(&self) -> Duration {
        let hours = self
            .resource_max_age_hours
            .unwrap_or(DEFAULT_RESOURCE_MAX_AGE_HOURS);
        Duration::from_secs(hours.saturating_mul(60 * 60))
    }

    /// Directory where captured images are written before upload.
    #[must_use]
    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(std::env::temp_dir)
    }

    #[must_use]
    pub fn sink_capacity(&self) -> usize {
        self.sink_capacity.unwrap_or(DEFAULT_SINK_CAPACITY).max(1)
    }

    #[must_use]
    pub fn server_host(&self) -> String {
        self.server
            .as_ref()
            .and_then(|s| s.host.clone())
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    #[must_use]
    pub fn server_port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_PORT)
    }

    /// Relay URL the `chat` client talks to.
    #[must_use]
    pub fn client_base_url(&self) -> String {
        self.client
            .as_ref()
            .and_then(|c| c.base_url.clone())
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://{}:{}", self.server_host(), self.server_port()))
    }

    #[must_use]
    pub fn client_tool_command(&self) -> Option<String> {
        self.client.as_ref().and_then(|c| c.tool_command.clone())
    }

    #[must_use]
    pub fn client_tool_timeout(&self) -> Duration {
        Duration::from_secs(
            self.client
                .as_ref()
                .and_then(|c| c.tool_timeout_secs)
                .unwrap_or(30),
        )
    }

    /// Resolved mail settings, when report delivery is configured.
    #[must_use]
    pub fn report_settings(&self) -> Option<ReportSettings> {
        let report = self.report.as_ref()?;
        let api_key = report.sendgrid_api_key.clone()?;
        Some(ReportSettings {
            api_key,
            to: report.to.clone()?,
            from: report.from.clone()?,
            subject: report
                .subject
                .clone()
                .unwrap_or_else(|| DEFAULT_REPORT_SUBJECT.to_string()),
            base_url: report
                .base_url
                .clone()
                .unwrap_or_else(|| SENDGRID_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// Retry policy for the assistant-service client, defaults filled in.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy {
            enabled: true,
            max_retries: 3,
            initial_delay: 1.0,
            max_delay: 60.0,
            exponential_base: 2.0,
        };

        let Some(cfg) = &self.retry else {
            return defaults;
        };

        RetryPolicy {
            enabled: cfg.enabled.unwrap_or(defaults.enabled),
            max_retries: cfg.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: cfg.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: cfg.max_delay.unwrap_or(defaults.max_delay),
            exponential_base: cfg.exponential_base.unwrap_or(defaults.exponential_base),
        }
    }
}

/// Mail settings with every required field present.
#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub api_key: String,
    pub to: String,
    pub from: String,
    pub subject: String,
    pub base_url: String,
}

// === Defaults ===

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".assistant-relay").join("config.toml"))
}

fn env_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("ASSISTANT_RELAY_CONFIG_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(expand_path(trimmed));
        }
    }
    None
}

/// Config file `load` would read for `path`.
#[must_use]
pub fn resolve_load_config_path(path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(expand_pathbuf(path));
    }
    env_config_path().or_else(home_config_path)
}

fn expand_pathbuf(path: PathBuf) -> PathBuf {
    if let Some(raw) = path.to_str() {
        return expand_path(raw);
    }
    path
}

fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::tilde(path);
    PathBuf::from(expanded.as_ref())
}

// === Environment ===

fn apply_env_overrides(config: &mut Config) {
    if let Ok(value) = std::env::var("OPENAI_API_KEY") {
        config.api_key = Some(value);
    }
    if let Ok(value) = std::env::var("OPENAI_BASE_URL") {
        config.base_url = Some(value);
    }
    if let Ok(value) = std::env::var("OPENAI_API_MODEL") {
        config.default_model = Some(value);
    }
    if let Ok(value) = std::env::var("ASSISTANT_RELAY_SECRET_KEY") {
        config.secret_key = Some(value);
    }
    if let Ok(value) = std::env::var("ASSISTANT_RELAY_SITE_PASSWORD") {
        config.site_password = Some(value);
    }
    if let Ok(value) = std::env::var("ASSISTANT_RELAY_TOOLS_FILE") {
        config.tools_file = Some(value);
    }
    if let Ok(value) = std::env::var("ASSISTANT_RELAY_UPLOAD_DIR") {
        config.upload_dir = Some(value);
    }
    if let Ok(value) = std::env::var("SENDGRID_API_KEY") {
        config
            .report
            .get_or_insert_with(ReportConfig::default)
            .sendgrid_api_key = Some(value);
    }
    if let Ok(value) = std::env::var("ASSISTANT_RELAY_PORT")
        && let Ok(port) = value.parse::<u16>()
    {
        config.server.get_or_insert_with(ServerConfig::default).port = Some(port);
    }
}

fn normalize_base_url(base: &str) -> String {
    base.trim_end_matches('/')
        .trim_end_matches("/v1")
        .to_string()
}

fn apply_profile(config: ConfigFile, profile: Option<&str>) -> Result<Config> {
    let Some(profile_name) = profile else {
        return Ok(config.base);
    };
    let profiles = config.profiles.as_ref();
    match profiles.and_then(|profiles| profiles.get(profile_name)) {
        Some(override_cfg) => Ok(merge_config(config.base, override_cfg.clone())),
        None => {
            let available = profiles
                .map(|profiles| {
                    let mut keys = profiles.keys().cloned().collect::<Vec<_>>();
                    keys.sort();
                    if keys.is_empty() {
                        "none".to_string()
                    } else {
                        keys.join(", ")
                    }
                })
                .unwrap_or_else(|| "none".to_string());
            anyhow::bail!("Profile '{profile_name}' not found. Available profiles: {available}")
        }
    }
}

fn merge_config(base: Config, override_cfg: Config) -> Config {
    Config {
        api_key: override_cfg.api_key.or(base.api_key),
        base_url: override_cfg.base_url.or(base.base_url),
        default_model: override_cfg.default_model.or(base.default_model),
        assistant_name: override_cfg.assistant_name.or(base.assistant_name),
        default_instructions: override_cfg
            .default_instructions
            .or(base.default_instructions),
        tools_file: override_cfg.tools_file.or(base.tools_file),
        secret_key: override_cfg.secret_key.or(base.secret_key),
        site_password: override_cfg.site_password.or(base.site_password),
        signature_window_secs: override_cfg
            .signature_window_secs
            .or(base.signature_window_secs),
        resource_max_age_hours: override_cfg
            .resource_max_age_hours
            .or(base.resource_max_age_hours),
        upload_dir: override_cfg.upload_dir.or(base.upload_dir),
        sink_capacity: override_cfg.sink_capacity.or(base.sink_capacity),
        retry: override_cfg.retry.or(base.retry),
        server: override_cfg.server.or(base.server),
        report: override_cfg.report.or(base.report),
        client: override_cfg.client.or(base.client),
    }
}

/// Load the function-tool definitions attached to tool-enabled sessions.
pub fn load_tool_definitions(path: &Path) -> Result<Vec<serde_json::Value>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tools file: {}", path.display()))?;
    let tools: Vec<serde_json::Value> = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse tools file: {}", path.display()))?;
    Ok(tools)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        std::io::Write::write_all(&mut file, contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn defaults_apply_without_a_file() {
        let config = Config::default();
        assert_eq!(config.default_model(), DEFAULT_MODEL);
        assert_eq!(config.base_url(), DEFAULT_BASE_URL);
        assert_eq!(config.server_port(), DEFAULT_PORT);
        assert_eq!(config.signature_window(), Duration::from_secs(300));
        assert_eq!(config.resource_max_age(), Duration::from_secs(24 * 3600));
        assert_eq!(config.client_base_url(), "http://127.0.0.1:3000");
        assert!(config.report_settings().is_none());
    }

    #[test]
    fn profile_overrides_base_values() {
        let file = write_config(
            r#"
default_model = "gpt-4o-mini"
secret_key = "base-secret"

[server]
port = 8080

[profiles.staging]
default_model = "gpt-4o"
"#,
        );
        let parsed: ConfigFile =
            toml::from_str(&fs::read_to_string(file.path()).unwrap()).unwrap();
        let config = apply_profile(parsed, Some("staging")).unwrap();
        assert_eq!(config.default_model(), "gpt-4o");
        assert_eq!(config.secret_key.as_deref(), Some("base-secret"));
        assert_eq!(config.server_port(), 8080);
    }

    #[test]
    fn unknown_profile_lists_available_ones() {
        let parsed: ConfigFile = toml::from_str(
            r#"
[profiles.a]
[profiles.b]
"#,
        )
        .unwrap();
        let err = apply_profile(parsed, Some("c")).unwrap_err();
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn validation_rejects_empty_secrets_and_zero_window() {
        let config = Config {
            secret_key: Some("  ".into()),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            signature_window_secs: Some(0),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn base_url_strips_version_suffix() {
        let config = Config {
            base_url: Some("https://proxy.example.com/v1/".into()),
            ..Config::default()
        };
        assert_eq!(config.base_url(), "https://proxy.example.com");
    }

    #[test]
    fn report_settings_require_key_and_addresses() {
        let mut config = Config {
            report: Some(ReportConfig {
                sendgrid_api_key: Some("SG.key".into()),
                to: Some("support@example.com".into()),
                from: None,
                subject: None,
                base_url: None,
            }),
            ..Config::default()
        };
        assert!(config.report_settings().is_none());
        if let Some(report) = config.report.as_mut() {
            report.from = Some("no-reply@example.com".into());
        }
        let settings = config.report_settings().unwrap();
        assert_eq!(settings.subject, DEFAULT_REPORT_SUBJECT);
        assert_eq!(settings.base_url, "https://api.sendgrid.com");
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = Config::default().retry_policy();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(60));
    }

    #[test]
    fn tool_definitions_load_from_json_array() {
        let file = write_config(r#"[{"type":"function","function":{"name":"describe"}}]"#);
        let tools = load_tool_definitions(file.path()).unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["function"]["name"], "describe");
    }
}
