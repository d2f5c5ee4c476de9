use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::orchestrator::PollConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointCfg {
    /// e.g. `https://api.runpod.ai/v2/<endpoint-id>`
    #[serde(default)]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for EndpointCfg {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: None,
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollCfg {
    pub interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for PollCfg {
    fn default() -> Self {
        Self { interval_ms: 500, timeout_secs: 600 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputCfg {
    pub out_dir: PathBuf,
}

impl Default for OutputCfg {
    fn default() -> Self {
        Self { out_dir: PathBuf::from("output") }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCfg {
    #[serde(default)]
    pub endpoint: EndpointCfg,
    #[serde(default)]
    pub poll: PollCfg,
    #[serde(default)]
    pub output: OutputCfg,
}

fn default_api_key_env() -> String {
    "RUNPOD_API_KEY".into()
}

fn default_request_timeout() -> u64 {
    30
}

impl RunCfg {
    /// Read `path` if given, then apply environment overrides.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let txt = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                serde_yaml::from_str(&txt).context("Failed to parse config YAML")?
            }
            None => RunCfg::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("RUNPOD_ENDPOINT") {
            self.endpoint.url = url;
        }
        if let Some(dir) = var("COMFY_CLOUD_OUT_DIR") {
            self.output.out_dir = PathBuf::from(dir);
        }
        if self.endpoint.api_key.is_none() {
            self.endpoint.api_key = var(&self.endpoint.api_key_env);
        }
    }

    pub fn endpoint_url(&self) -> &str {
        self.endpoint.url.trim_end_matches('/')
    }

    pub fn api_key(&self) -> Result<&str> {
        match self.endpoint.api_key.as_deref() {
            Some(key) if !key.is_empty() => Ok(key),
            _ => bail!(
                "no API key configured; pass --api-key or set {}",
                self.endpoint.api_key_env
            ),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint.request_timeout_secs)
    }

    pub fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.poll.interval_ms),
            timeout: Duration::from_secs(self.poll.timeout_secs),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.endpoint_url();
        if url.is_empty() {
            bail!("endpoint URL is not configured; pass --endpoint or set RUNPOD_ENDPOINT");
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("endpoint URL must start with http:// or https://, got {url}");
        }
        self.api_key()?;
        if self.poll.interval_ms == 0 {
            bail!("poll.interval_ms must be greater than 0");
        }
        if self.poll.timeout_secs == 0 {
            bail!("poll.timeout_secs must be greater than 0");
        }
        Ok(())
    }
}
