use std::env;
use std::fs;
use std::path::Path;

use returndesk_core::config::{detect_config_path, AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_keys) in effective_fields(&config) {
        let source =
            field_source(key, env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }

    lines.join("\n")
}

type Field = (&'static str, String, &'static [&'static str]);

fn effective_fields(config: &AppConfig) -> Vec<Field> {
    let api_key = config
        .llm
        .api_key
        .as_ref()
        .map(|key| redact_token(key.expose_secret()))
        .unwrap_or_else(|| "<unset>".to_string());

    vec![
        ("database.url", config.database.url.clone(), &["RETURNDESK_DATABASE_URL"]),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["RETURNDESK_DATABASE_MAX_CONNECTIONS"],
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["RETURNDESK_DATABASE_TIMEOUT_SECS"],
        ),
        ("llm.provider", format!("{:?}", config.llm.provider), &["RETURNDESK_LLM_PROVIDER"]),
        ("llm.model", config.llm.model.clone(), &["RETURNDESK_LLM_MODEL"]),
        (
            "llm.router_model",
            config.llm.classification_model().to_string(),
            &["RETURNDESK_LLM_ROUTER_MODEL"],
        ),
        (
            "llm.base_url",
            config.llm.base_url.clone().unwrap_or_else(|| "<unset>".to_string()),
            &["RETURNDESK_LLM_BASE_URL"],
        ),
        ("llm.api_key", api_key, &["RETURNDESK_LLM_API_KEY"]),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string(), &["RETURNDESK_LLM_TIMEOUT_SECS"]),
        (
            "policy.document_path",
            config.policy.document_path.display().to_string(),
            &["RETURNDESK_POLICY_DOCUMENT_PATH"],
        ),
        (
            "agent.call_timeout_secs",
            config.agent.call_timeout_secs.to_string(),
            &["RETURNDESK_AGENT_CALL_TIMEOUT_SECS"],
        ),
        (
            "agent.review_queries",
            config.agent.review_queries.to_string(),
            &["RETURNDESK_AGENT_REVIEW_QUERIES"],
        ),
        (
            "agent.reply_language",
            config.agent.reply_language.clone(),
            &["RETURNDESK_AGENT_REPLY_LANGUAGE"],
        ),
        (
            "sessions.backend",
            format!("{:?}", config.sessions.backend),
            &["RETURNDESK_SESSIONS_BACKEND"],
        ),
        (
            "sessions.idle_ttl_secs",
            config.sessions.idle_ttl_secs.to_string(),
            &["RETURNDESK_SESSIONS_IDLE_TTL_SECS"],
        ),
        (
            "returns.enforce_window",
            config.returns.enforce_window.to_string(),
            &["RETURNDESK_RETURNS_ENFORCE_WINDOW"],
        ),
        (
            "returns.window_days",
            config.returns.window_days.to_string(),
            &["RETURNDESK_RETURNS_WINDOW_DAYS"],
        ),
        ("server.bind_address", config.server.bind_address.clone(), &["RETURNDESK_SERVER_BIND_ADDRESS"]),
        ("server.port", config.server.port.to_string(), &["RETURNDESK_SERVER_PORT"]),
        (
            "server.allowed_origins",
            config.server.allowed_origins.join(","),
            &["RETURNDESK_SERVER_ALLOWED_ORIGINS"],
        ),
        (
            "logging.level",
            config.logging.level.clone(),
            &["RETURNDESK_LOGGING_LEVEL", "RETURNDESK_LOG_LEVEL"],
        ),
        (
            "logging.format",
            format!("{:?}", config.logging.format),
            &["RETURNDESK_LOGGING_FORMAT", "RETURNDESK_LOG_FORMAT"],
        ),
    ]
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Keeps a recognisable key prefix (`sk-`) and hides the rest.
fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((prefix, _)) = trimmed.split_once('-') {
        return format!("{prefix}-***");
    }

    "<redacted>".to_string()
}
