use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub policy: PolicyConfig,
    pub agent: AgentConfig,
    pub sessions: SessionConfig,
    pub returns: ReturnsConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub router_model: Option<String>,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl LlmConfig {
    pub fn classification_model(&self) -> &str {
        self.router_model.as_deref().unwrap_or(&self.model)
    }
}

#[derive(Clone, Debug)]
pub struct PolicyConfig {
    pub document_path: PathBuf,
    pub max_passages: usize,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub call_timeout_secs: u64,
    pub query_row_limit: u32,
    pub max_context_rows: usize,
    pub review_queries: bool,
    pub reply_language: String,
    pub store_name: String,
    pub templates_dir: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub backend: SessionBackend,
    pub max_threads: usize,
    pub idle_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ReturnsConfig {
    pub enforce_window: bool,
    pub window_days: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackend {
    Memory,
    Sqlite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub policy_document_path: Option<PathBuf>,
    pub session_backend: Option<SessionBackend>,
    pub server_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://returndesk.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434/v1".to_string()),
                model: "llama3.1".to_string(),
                router_model: None,
                temperature: 0.0,
                timeout_secs: 30,
                max_retries: 2,
            },
            policy: PolicyConfig {
                document_path: PathBuf::from("docs/return-policy.md"),
                max_passages: 4,
            },
            agent: AgentConfig {
                call_timeout_secs: 20,
                query_row_limit: 5,
                max_context_rows: 50,
                review_queries: true,
                reply_language: "English".to_string(),
                store_name: "Polar E-commerce".to_string(),
                templates_dir: None,
            },
            sessions: SessionConfig {
                backend: SessionBackend::Memory,
                max_threads: 10_000,
                idle_ttl_secs: 86_400,
            },
            returns: ReturnsConfig { enforce_window: true, window_days: 30 },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8000,
                allowed_origins: vec!["http://localhost:3000".to_string()],
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for SessionBackend {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(ConfigError::Validation(format!(
                "unsupported session backend `{other}` (expected memory|sqlite)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("returndesk.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(router_model) = llm.router_model {
                self.llm.router_model = Some(router_model);
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(policy) = patch.policy {
            if let Some(document_path) = policy.document_path {
                self.policy.document_path = document_path;
            }
            if let Some(max_passages) = policy.max_passages {
                self.policy.max_passages = max_passages;
            }
        }

        if let Some(agent) = patch.agent {
            if let Some(call_timeout_secs) = agent.call_timeout_secs {
                self.agent.call_timeout_secs = call_timeout_secs;
            }
            if let Some(query_row_limit) = agent.query_row_limit {
                self.agent.query_row_limit = query_row_limit;
            }
            if let Some(max_context_rows) = agent.max_context_rows {
                self.agent.max_context_rows = max_context_rows;
            }
            if let Some(review_queries) = agent.review_queries {
                self.agent.review_queries = review_queries;
            }
            if let Some(reply_language) = agent.reply_language {
                self.agent.reply_language = reply_language;
            }
            if let Some(store_name) = agent.store_name {
                self.agent.store_name = store_name;
            }
            if let Some(templates_dir) = agent.templates_dir {
                self.agent.templates_dir = Some(templates_dir);
            }
        }

        if let Some(sessions) = patch.sessions {
            if let Some(backend) = sessions.backend {
                self.sessions.backend = backend;
            }
            if let Some(max_threads) = sessions.max_threads {
                self.sessions.max_threads = max_threads;
            }
            if let Some(idle_ttl_secs) = sessions.idle_ttl_secs {
                self.sessions.idle_ttl_secs = idle_ttl_secs;
            }
        }

        if let Some(returns) = patch.returns {
            if let Some(enforce_window) = returns.enforce_window {
                self.returns.enforce_window = enforce_window;
            }
            if let Some(window_days) = returns.window_days {
                self.returns.window_days = window_days;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(allowed_origins) = server.allowed_origins {
                self.server.allowed_origins = allowed_origins;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("RETURNDESK_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("RETURNDESK_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections =
                parse_u32("RETURNDESK_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("RETURNDESK_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("RETURNDESK_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("RETURNDESK_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("RETURNDESK_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("RETURNDESK_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("RETURNDESK_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("RETURNDESK_LLM_ROUTER_MODEL") {
            self.llm.router_model = Some(value);
        }
        if let Some(value) = read_env("RETURNDESK_LLM_TEMPERATURE") {
            self.llm.temperature = parse_f32("RETURNDESK_LLM_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("RETURNDESK_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("RETURNDESK_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("RETURNDESK_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("RETURNDESK_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("RETURNDESK_POLICY_DOCUMENT_PATH") {
            self.policy.document_path = PathBuf::from(value);
        }
        if let Some(value) = read_env("RETURNDESK_POLICY_MAX_PASSAGES") {
            self.policy.max_passages = parse_usize("RETURNDESK_POLICY_MAX_PASSAGES", &value)?;
        }

        if let Some(value) = read_env("RETURNDESK_AGENT_CALL_TIMEOUT_SECS") {
            self.agent.call_timeout_secs =
                parse_u64("RETURNDESK_AGENT_CALL_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("RETURNDESK_AGENT_QUERY_ROW_LIMIT") {
            self.agent.query_row_limit = parse_u32("RETURNDESK_AGENT_QUERY_ROW_LIMIT", &value)?;
        }
        if let Some(value) = read_env("RETURNDESK_AGENT_REVIEW_QUERIES") {
            self.agent.review_queries = parse_bool("RETURNDESK_AGENT_REVIEW_QUERIES", &value)?;
        }
        if let Some(value) = read_env("RETURNDESK_AGENT_REPLY_LANGUAGE") {
            self.agent.reply_language = value;
        }
        if let Some(value) = read_env("RETURNDESK_AGENT_TEMPLATES_DIR") {
            self.agent.templates_dir = Some(PathBuf::from(value));
        }

        if let Some(value) = read_env("RETURNDESK_SESSIONS_BACKEND") {
            self.sessions.backend = value.parse()?;
        }
        if let Some(value) = read_env("RETURNDESK_SESSIONS_MAX_THREADS") {
            self.sessions.max_threads = parse_usize("RETURNDESK_SESSIONS_MAX_THREADS", &value)?;
        }
        if let Some(value) = read_env("RETURNDESK_SESSIONS_IDLE_TTL_SECS") {
            self.sessions.idle_ttl_secs = parse_u64("RETURNDESK_SESSIONS_IDLE_TTL_SECS", &value)?;
        }

        if let Some(value) = read_env("RETURNDESK_RETURNS_ENFORCE_WINDOW") {
            self.returns.enforce_window =
                parse_bool("RETURNDESK_RETURNS_ENFORCE_WINDOW", &value)?;
        }
        if let Some(value) = read_env("RETURNDESK_RETURNS_WINDOW_DAYS") {
            self.returns.window_days = parse_u32("RETURNDESK_RETURNS_WINDOW_DAYS", &value)?;
        }

        if let Some(value) = read_env("RETURNDESK_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("RETURNDESK_SERVER_PORT") {
            self.server.port = parse_u16("RETURNDESK_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("RETURNDESK_SERVER_ALLOWED_ORIGINS") {
            self.server.allowed_origins = value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = read_env("RETURNDESK_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("RETURNDESK_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        let log_level =
            read_env("RETURNDESK_LOGGING_LEVEL").or_else(|| read_env("RETURNDESK_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("RETURNDESK_LOGGING_FORMAT").or_else(|| read_env("RETURNDESK_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = Some(llm_base_url);
        }
        if let Some(document_path) = overrides.policy_document_path {
            self.policy.document_path = document_path;
        }
        if let Some(backend) = overrides.session_backend {
            self.sessions.backend = backend;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_policy(&self.policy)?;
        validate_agent(&self.agent)?;
        validate_sessions(&self.sessions)?;
        validate_returns(&self.returns)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("returndesk.toml"), PathBuf::from("config/returndesk.toml")]
        .into_iter()
        .find(|path| path.exists())
}

pub fn detect_config_path() -> Option<PathBuf> {
    resolve_config_path(None)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation(
            "llm.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for ollama provider".to_string(),
                ));
            }
        }
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_policy(policy: &PolicyConfig) -> Result<(), ConfigError> {
    if policy.document_path.as_os_str().is_empty() {
        return Err(ConfigError::Validation(
            "policy.document_path is required (path to the return policy document)".to_string(),
        ));
    }

    if policy.max_passages == 0 || policy.max_passages > 50 {
        return Err(ConfigError::Validation(
            "policy.max_passages must be in range 1..=50".to_string(),
        ));
    }

    Ok(())
}

fn validate_agent(agent: &AgentConfig) -> Result<(), ConfigError> {
    if agent.call_timeout_secs == 0 || agent.call_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "agent.call_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if agent.query_row_limit == 0 || agent.query_row_limit > 1_000 {
        return Err(ConfigError::Validation(
            "agent.query_row_limit must be in range 1..=1000".to_string(),
        ));
    }

    if agent.max_context_rows < agent.query_row_limit as usize {
        return Err(ConfigError::Validation(
            "agent.max_context_rows must be at least agent.query_row_limit".to_string(),
        ));
    }

    if agent.reply_language.trim().is_empty() {
        return Err(ConfigError::Validation(
            "agent.reply_language must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_sessions(sessions: &SessionConfig) -> Result<(), ConfigError> {
    if sessions.max_threads == 0 {
        return Err(ConfigError::Validation(
            "sessions.max_threads must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_returns(returns: &ReturnsConfig) -> Result<(), ConfigError> {
    if returns.enforce_window && returns.window_days == 0 {
        return Err(ConfigError::Validation(
            "returns.window_days must be greater than zero when returns.enforce_window is true"
                .to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    for origin in &server.allowed_origins {
        let valid =
            origin == "*" || origin.starts_with("http://") || origin.starts_with("https://");
        if !valid {
            return Err(ConfigError::Validation(format!(
                "server.allowed_origins entry `{origin}` must be `*` or start with http:// or https://"
            )));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse::<f32>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    policy: Option<PolicyPatch>,
    agent: Option<AgentPatch>,
    sessions: Option<SessionPatch>,
    returns: Option<ReturnsPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    router_model: Option<String>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyPatch {
    document_path: Option<PathBuf>,
    max_passages: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct AgentPatch {
    call_timeout_secs: Option<u64>,
    query_row_limit: Option<u32>,
    max_context_rows: Option<usize>,
    review_queries: Option<bool>,
    reply_language: Option<String>,
    store_name: Option<String>,
    templates_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionPatch {
    backend: Option<SessionBackend>,
    max_threads: Option<usize>,
    idle_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ReturnsPatch {
    enforce_window: Option<bool>,
    window_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    allowed_origins: Option<Vec<String>>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
