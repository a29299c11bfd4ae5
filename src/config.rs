use std::path::Path;

use log::{info, warn};
use serde::Deserialize;
use validator::Validate;

use crate::error::Result;
use crate::rubric::RubricVariant;

const ENV_PREFIX: &str = "INKCRITIC";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub provider: ProviderSettings,
    pub critique: CritiqueSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServerSettings {
    #[validate(length(min = 1))]
    pub bind: String,
    #[validate(range(min = 1024))]
    pub max_body_bytes: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ProviderSettings {
    #[validate(url)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[validate(length(min = 1))]
    pub model: String,
    #[validate(range(min = 0.0, max = 2.0))]
    pub temperature: f64,
    #[validate(range(min = 1, max = 16384))]
    pub max_tokens: u32,
    pub connect_timeout_secs: u64,
    /// Whole-request timeout for the single-shot mode. Streaming requests only
    /// use the connect timeout and the forwarder deadline.
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CritiqueSettings {
    pub rubric: RubricVariant,
    pub streaming: bool,
    #[validate(range(min = 1, max = 600))]
    pub stream_deadline_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageSettings {
    /// Objects live on local disk and are served by the relay itself.
    Local {
        dir: String,
        key_prefix: String,
        #[serde(default)]
        public_base_url: Option<String>,
    },
    /// Objects are PUT to an HTTP blob endpoint.
    Http {
        endpoint: String,
        key_prefix: String,
        public_base_url: String,
        #[serde(default)]
        token: Option<String>,
    },
}

impl StorageSettings {
    pub fn key_prefix(&self) -> &str {
        match self {
            StorageSettings::Local { key_prefix, .. } | StorageSettings::Http { key_prefix, .. } => {
                key_prefix
            }
        }
    }
}

impl Settings {
    /// Defaults, then the optional config file, then `INKCRITIC__SECTION__KEY`
    /// environment variables. A `.env` file is loaded first when present.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok(); // Don't fail if .env doesn't exist

        let mut builder = config::Config::builder()
            .set_default("server.bind", "127.0.0.1:3000")?
            .set_default("server.max_body_bytes", 10 * 1024 * 1024)?
            .set_default("provider.base_url", "https://api.openai.com/v1")?
            .set_default("provider.api_key", "")?
            .set_default("provider.model", "gpt-4o")?
            .set_default("provider.temperature", 0.7)?
            .set_default("provider.max_tokens", 1500)?
            .set_default("provider.connect_timeout_secs", 5)?
            .set_default("provider.request_timeout_secs", 60)?
            .set_default("critique.rubric", "standard")?
            .set_default("critique.streaming", true)?
            .set_default("critique.stream_deadline_secs", 30)?
            .set_default("storage.backend", "local")?
            .set_default("storage.dir", "uploads")?
            .set_default("storage.key_prefix", "calligraphy")?;

        builder = match config_path {
            Some(path) => builder.add_source(config::File::from(path)),
            None => builder.add_source(config::File::with_name("inkcritic").required(false)),
        };

        let cfg = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut settings: Settings = cfg.try_deserialize()?;

        if settings.provider.api_key.is_empty() {
            if let Ok(key) = std::env::var("OPENAI_API_KEY") {
                settings.provider.api_key = key;
            }
        }

        settings.validate()?;
        settings.log_summary();
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.provider.validate()?;
        self.critique.validate()?;
        Ok(())
    }

    fn log_summary(&self) {
        info!(
            "Settings loaded: bind={}, model={}, rubric={:?}, streaming={}",
            self.server.bind, self.provider.model, self.critique.rubric, self.critique.streaming
        );
        if self.provider.api_key.is_empty() {
            warn!("No provider API key configured; requests are sent without Authorization");
        } else {
            info!("Provider API key configured (length: {})", self.provider.api_key.len());
        }
    }
}
