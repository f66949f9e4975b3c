use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Serialize;
use tera::{Context, Tera};

use returndesk_core::domain::conversation::Message;

pub const ROUTE: &str = "route.txt";
pub const CONFIRM_RETURN: &str = "confirm_return.txt";
pub const SELECT_TABLES: &str = "select_tables.txt";
pub const GENERATE_QUERY: &str = "generate_query.txt";
pub const REVIEW_QUERY: &str = "review_query.txt";
pub const ANSWER: &str = "answer.txt";

const EMBEDDED: &[(&str, &str)] = &[
    (ROUTE, include_str!("../../../templates/prompts/route.txt")),
    (CONFIRM_RETURN, include_str!("../../../templates/prompts/confirm_return.txt")),
    (SELECT_TABLES, include_str!("../../../templates/prompts/select_tables.txt")),
    (GENERATE_QUERY, include_str!("../../../templates/prompts/generate_query.txt")),
    (REVIEW_QUERY, include_str!("../../../templates/prompts/review_query.txt")),
    (ANSWER, include_str!("../../../templates/prompts/answer.txt")),
];

/// Prompt text for every completion the agent makes.
///
/// The built-in templates are compiled into the binary; a directory override
/// may replace any subset of them by file name.
pub struct PromptTemplates {
    tera: Tera,
}

impl PromptTemplates {
    pub fn embedded() -> Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(EMBEDDED.iter().copied())
            .context("built-in prompt templates failed to compile")?;
        Ok(Self { tera })
    }

    pub fn with_overrides(dir: &Path) -> Result<Self> {
        let mut templates = Self::embedded()?;
        for (name, _) in EMBEDDED {
            let path = dir.join(name);
            if !path.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("could not read prompt template `{}`", path.display()))?;
            templates
                .tera
                .add_raw_template(name, &raw)
                .with_context(|| format!("prompt template `{}` failed to compile", path.display()))?;
        }
        Ok(templates)
    }

    pub fn load(override_dir: Option<&Path>) -> Result<Self> {
        match override_dir {
            Some(dir) => Self::with_overrides(dir),
            None => Self::embedded(),
        }
    }

    pub fn render<T: Serialize>(&self, name: &str, values: &T) -> Result<String> {
        let context = Context::from_serialize(values)
            .with_context(|| format!("prompt values for `{name}` are not an object"))?;
        self.tera.render(name, &context).with_context(|| format!("could not render `{name}`"))
    }
}

/// The last `max_messages` turns as `role: content` lines.
pub fn transcript(history: &[Message], max_messages: usize) -> String {
    if history.is_empty() {
        return "(no earlier messages)".to_string();
    }
    let start = history.len().saturating_sub(max_messages);
    history[start..]
        .iter()
        .map(|message| format!("{}: {}", message.role.as_str(), message.content))
        .collect::<Vec<_>>()
        .join("\n")
}
