use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "wikilabel/0.1";
pub const DEFAULT_CLUSTER_LABEL: &str = "directory_page";
pub const DEFAULT_GENERATOR_API_URL: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_GENERATOR_MODEL: &str = "claude-3-opus-20240229";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CONTENT_BUDGET_CHARS: usize = 3_000;
pub const DEFAULT_VOCABULARY_HINT_LIMIT: usize = 50;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct LabelConfig {
    #[serde(default)]
    pub confluence: ConfluenceSection,
    #[serde(default)]
    pub generator: GeneratorSection,
    #[serde(default)]
    pub analysis: AnalysisSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ConfluenceSection {
    pub url: Option<String>,
    pub email: Option<String>,
    pub api_token: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub page_limit: Option<usize>,
    pub max_retries: Option<usize>,
    pub max_write_retries: Option<usize>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct GeneratorSection {
    pub strategy: Option<String>,
    pub api_key: Option<String>,
    pub api_url: Option<String>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout_ms: Option<u64>,
    pub content_budget_chars: Option<usize>,
    pub vocabulary_hint_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AnalysisSection {
    pub cluster_label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyChoice {
    /// Model when a usable credential exists, rule-based otherwise.
    Auto,
    Rule,
    Model,
}

impl StrategyChoice {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "rule" | "rules" => Ok(Self::Rule),
            "model" | "llm" => Ok(Self::Model),
            other => bail!("unsupported generator strategy: {other} (expected auto|rule|model)"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Rule => "rule",
            Self::Model => "model",
        }
    }
}

/// Resolved Confluence connection settings.
#[derive(Debug, Clone)]
pub struct ConfluenceSettings {
    pub base_url: String,
    pub email: String,
    pub api_token: Option<String>,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub page_limit: usize,
    pub max_retries: usize,
    pub max_write_retries: usize,
    pub retry_delay_ms: u64,
}

/// Resolved generative-service settings.
#[derive(Debug, Clone)]
pub struct GeneratorSettings {
    pub strategy: StrategyChoice,
    pub api_key: Option<String>,
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_ms: u64,
    pub content_budget_chars: usize,
    pub vocabulary_hint_limit: usize,
}

impl LabelConfig {
    /// Marker label that flags a page as a cluster root.
    pub fn cluster_label(&self) -> String {
        self.cluster_label_with(|key| env::var(key).ok())
    }

    pub fn confluence_settings(&self) -> ConfluenceSettings {
        self.confluence_settings_with(|key| env::var(key).ok())
    }

    pub fn generator_settings(&self) -> Result<GeneratorSettings> {
        self.generator_settings_with(|key| env::var(key).ok())
    }

    fn cluster_label_with<F>(&self, lookup_env: F) -> String
    where
        F: Fn(&str) -> Option<String>,
    {
        non_empty(lookup_env("WIKILABEL_CLUSTER_LABEL"))
            .or_else(|| non_empty(self.analysis.cluster_label.clone()))
            .unwrap_or_else(|| DEFAULT_CLUSTER_LABEL.to_string())
    }

    fn confluence_settings_with<F>(&self, lookup_env: F) -> ConfluenceSettings
    where
        F: Fn(&str) -> Option<String>,
    {
        let section = &self.confluence;
        ConfluenceSettings {
            base_url: non_empty(lookup_env("CONFLUENCE_URL"))
                .or_else(|| non_empty(section.url.clone()))
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_default(),
            email: non_empty(lookup_env("CONFLUENCE_EMAIL"))
                .or_else(|| non_empty(section.email.clone()))
                .unwrap_or_default(),
            api_token: usable_credential(
                non_empty(lookup_env("CONFLUENCE_API_TOKEN"))
                    .or_else(|| non_empty(section.api_token.clone())),
            ),
            user_agent: non_empty(section.user_agent.clone())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout_ms: section.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            page_limit: section.page_limit.unwrap_or(500).max(1),
            max_retries: section.max_retries.unwrap_or(2),
            max_write_retries: section.max_write_retries.unwrap_or(1),
            retry_delay_ms: section.retry_delay_ms.unwrap_or(500),
        }
    }

    fn generator_settings_with<F>(&self, lookup_env: F) -> Result<GeneratorSettings>
    where
        F: Fn(&str) -> Option<String>,
    {
        let section = &self.generator;
        let strategy = match non_empty(lookup_env("WIKILABEL_STRATEGY"))
            .or_else(|| non_empty(section.strategy.clone()))
        {
            Some(value) => StrategyChoice::parse(&value)?,
            None => StrategyChoice::Auto,
        };
        Ok(GeneratorSettings {
            strategy,
            api_key: usable_credential(
                non_empty(lookup_env("ANTHROPIC_API_KEY"))
                    .or_else(|| non_empty(section.api_key.clone())),
            ),
            api_url: non_empty(section.api_url.clone())
                .unwrap_or_else(|| DEFAULT_GENERATOR_API_URL.to_string()),
            model: non_empty(section.model.clone())
                .unwrap_or_else(|| DEFAULT_GENERATOR_MODEL.to_string()),
            max_tokens: section.max_tokens.unwrap_or(1_024),
            temperature: section.temperature.unwrap_or(0.3).clamp(0.0, 1.0),
            timeout_ms: section.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            content_budget_chars: section
                .content_budget_chars
                .unwrap_or(DEFAULT_CONTENT_BUDGET_CHARS),
            vocabulary_hint_limit: section
                .vocabulary_hint_limit
                .unwrap_or(DEFAULT_VOCABULARY_HINT_LIMIT),
        })
    }
}

/// Load and parse a LabelConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<LabelConfig> {
    if !config_path.exists() {
        return Ok(LabelConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: LabelConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// True when a credential is missing or still holds a template placeholder.
pub fn is_placeholder_credential(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return true;
    }
    let lowered = trimmed.to_ascii_lowercase();
    lowered.starts_with("your-")
        || lowered.starts_with("your_")
        || lowered == "changeme"
        || lowered == "xxx"
        || (trimmed.starts_with('<') && trimmed.ends_with('>'))
}

/// Render a secret for display without revealing it.
pub fn mask_secret(value: Option<&str>) -> String {
    match value {
        None => "<not set>".to_string(),
        Some(secret) => {
            let visible = secret
                .chars()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<String>();
            if secret.chars().count() <= 8 {
                "****".to_string()
            } else {
                format!("****{visible}")
            }
        }
    }
}

fn usable_credential(value: Option<String>) -> Option<String> {
    value.filter(|candidate| !is_placeholder_credential(candidate))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/config.toml")).expect("load config");
        assert_eq!(config, LabelConfig::default());
        assert_eq!(config.cluster_label_with(no_env), DEFAULT_CLUSTER_LABEL);
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(
            &config_path,
            r#"
[confluence]
url = "https://acme.atlassian.net/"
email = "bot@acme.test"
api_token = "tok-1234567890"
page_limit = 100

[generator]
strategy = "model"
api_key = "sk-ant-real-key-0001"
model = "claude-test"
max_tokens = 512

[analysis]
cluster_label = "cluster_root"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.cluster_label_with(no_env), "cluster_root");

        let confluence = config.confluence_settings_with(no_env);
        assert_eq!(confluence.base_url, "https://acme.atlassian.net");
        assert_eq!(confluence.email, "bot@acme.test");
        assert_eq!(confluence.api_token.as_deref(), Some("tok-1234567890"));
        assert_eq!(confluence.page_limit, 100);
        assert_eq!(confluence.timeout_ms, DEFAULT_TIMEOUT_MS);

        let generator = config.generator_settings_with(no_env).expect("generator");
        assert_eq!(generator.strategy, StrategyChoice::Model);
        assert_eq!(generator.model, "claude-test");
        assert_eq!(generator.max_tokens, 512);
        assert_eq!(generator.content_budget_chars, DEFAULT_CONTENT_BUDGET_CHARS);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("config.toml");
        fs::write(&config_path, "[generator\nmodel = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn env_values_override_config_values() {
        let config = LabelConfig {
            confluence: ConfluenceSection {
                url: Some("https://from-config.example".to_string()),
                ..ConfluenceSection::default()
            },
            ..LabelConfig::default()
        };
        let env = HashMap::from([
            (
                "CONFLUENCE_URL".to_string(),
                "https://from-env.example".to_string(),
            ),
            ("ANTHROPIC_API_KEY".to_string(), "sk-env-key-123456".to_string()),
            ("WIKILABEL_STRATEGY".to_string(), "rule".to_string()),
        ]);
        let lookup = |key: &str| env.get(key).cloned();

        assert_eq!(
            config.confluence_settings_with(lookup).base_url,
            "https://from-env.example"
        );
        let generator = config.generator_settings_with(lookup).expect("generator");
        assert_eq!(generator.api_key.as_deref(), Some("sk-env-key-123456"));
        assert_eq!(generator.strategy, StrategyChoice::Rule);
    }

    #[test]
    fn placeholder_credentials_count_as_absent() {
        for value in ["", "  ", "your-api-key", "YOUR_API_KEY", "<token>", "changeme"] {
            assert!(is_placeholder_credential(value), "{value:?}");
        }
        assert!(!is_placeholder_credential("sk-ant-abc123"));

        let config = LabelConfig {
            generator: GeneratorSection {
                api_key: Some("your-anthropic-api-key".to_string()),
                ..GeneratorSection::default()
            },
            ..LabelConfig::default()
        };
        let generator = config.generator_settings_with(no_env).expect("generator");
        assert!(generator.api_key.is_none());
        assert_eq!(generator.strategy, StrategyChoice::Auto);
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let config = LabelConfig {
            generator: GeneratorSection {
                strategy: Some("magic".to_string()),
                ..GeneratorSection::default()
            },
            ..LabelConfig::default()
        };
        let error = config
            .generator_settings_with(no_env)
            .expect_err("must fail");
        assert!(error.to_string().contains("unsupported generator strategy"));
    }

    #[test]
    fn mask_secret_keeps_only_the_tail() {
        assert_eq!(mask_secret(None), "<not set>");
        assert_eq!(mask_secret(Some("short")), "****");
        assert_eq!(mask_secret(Some("sk-ant-abcdef1234")), "****1234");
    }
}
