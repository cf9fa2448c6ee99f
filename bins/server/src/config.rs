use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

pub use pipeline::config::{PipelineConfig, SourceConfig, TopicConfig};

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "streamfold-server", about = "Агрегация потоков: погода и клики")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Запустить сервер
    Serve(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Путь к TOML конфиг файлу
    #[arg(long, default_value = "config.toml", env = "CONFIG_PATH")]
    pub config: String,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Сколько ждать остановки задач после сигнала.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub clicks: ClicksConfig,
}

/// Настройки click-endpoint'ов HTTP API.
#[derive(Debug, Deserialize)]
pub struct ClicksConfig {
    /// Пользователь, когда `?user=` не указан.
    #[serde(default = "default_click_user")]
    pub user: String,
}

impl Default for ClicksConfig {
    fn default() -> Self {
        Self {
            user: default_click_user(),
        }
    }
}

fn default_api_port() -> u16 {
    9200
}
fn default_drain_timeout_ms() -> u64 {
    5000
}
fn default_click_user() -> String {
    "user1".into()
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|e| ServerError::Config {
            context: "read",
            detail: format!("'{path}': {e}"),
        })?;
        Self::parse(&content).map_err(|e| match e {
            ServerError::Config { context, detail } => ServerError::Config {
                context,
                detail: format!("'{path}': {detail}"),
            },
            other => other,
        })
    }

    pub fn parse(content: &str) -> Result<Self, ServerError> {
        let config: Self = toml::from_str(content).map_err(|e| ServerError::Config {
            context: "parse",
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Все topic'и, на которые ссылаются pipeline и sources, объявлены.
    pub fn validate(&self) -> Result<(), ServerError> {
        self.pipeline.validate().map_err(|detail| ServerError::Config {
            context: "pipeline",
            detail,
        })?;

        let declared = |name: &str| self.topics.iter().any(|t| t.name == name);
        let referenced = std::iter::once(&self.pipeline.input_topic)
            .chain(self.pipeline.output_topic.as_ref())
            .chain(self.sources.iter().map(|s| &s.topic));
        for name in referenced {
            if !declared(name) {
                return Err(ServerError::TopicNotDeclared(name.clone()));
            }
        }

        if let Some(t) = self.topics.iter().find(|t| t.partitions == 0) {
            return Err(ServerError::Config {
                context: "topics",
                detail: format!("topic '{}' needs at least one partition", t.name),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use state_store::FoldMode;
    use streamfold_api::RecordKind;

    #[test]
    fn sample_configs_parse() {
        let weather = ServerConfig::parse(include_str!("../config/weather.toml")).unwrap();
        assert_eq!(weather.pipeline.kind, RecordKind::Weather);
        assert_eq!(weather.pipeline.output_topic.as_deref(), Some("station-averages"));
        assert_eq!(weather.sources.len(), 1);

        let clicks = ServerConfig::parse(include_str!("../config/clicks.toml")).unwrap();
        assert_eq!(clicks.pipeline.kind, RecordKind::Click);
        assert_eq!(clicks.clicks.user, "user1");
        assert_eq!(clicks.api_port, 9200);
        // checkpoint поверх memory-лога после рестарта оказался бы впереди него
        assert!(clicks.pipeline.checkpoint.dir.is_some());
        assert_eq!(clicks.topics[0].storage, "file");
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = ServerConfig::parse(
            r#"
            [[topics]]
            name = "clicks"

            [pipeline]
            kind = "click"
            input_topic = "clicks"
            fold_mode = "at_least_once"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.drain_timeout_ms, 5000);
        assert_eq!(cfg.topics[0].partitions, 4);
        assert_eq!(cfg.pipeline.fold_mode, FoldMode::AtLeastOnce);
        assert!(cfg.sources.is_empty());
    }

    #[test]
    fn undeclared_topic_is_rejected() {
        let err = ServerConfig::parse(
            r#"
            [[topics]]
            name = "clicks"

            [pipeline]
            kind = "click"
            input_topic = "clicks"
            output_topic = "click-counts"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ServerError::TopicNotDeclared(ref t) if t == "click-counts"));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = ServerConfig::parse(
            r#"
            [[topics]]
            name = "w"

            [pipeline]
            kind = "weather"
            input_topic = "w"
            workers = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ServerError::Config { context: "pipeline", .. }));
    }

    #[test]
    fn load_reports_path() {
        let err = ServerConfig::load("/nonexistent/streamfold.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/streamfold.toml"));
    }
}
