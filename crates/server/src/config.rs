use std::time::Duration;

use anyhow::Context;
use bridge_core::{
    delivery::DEFAULT_QUEUE_CAPACITY, BridgeSettings, DispatchSettings, PuppetNaming, RetryPolicy,
};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const CONFIG_PATH_ENV: &str = "BRIDGE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "bridge.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub homeserver_url: String,
    pub homeserver_domain: String,
    pub as_token: String,
    pub bot_localpart: String,
    pub username_template: String,
    pub provisioning_prefix: String,
    pub shared_secret: String,
    pub status_endpoint: Option<String>,
    pub link_wait_timeout_secs: u64,
    pub max_connect_retries: u32,
    pub session_ttl_secs: u64,
    pub mirror_dm_names: bool,
    pub delivery_queue_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:29328".into(),
            database_url: "sqlite://./data/bridge.db".into(),
            homeserver_url: "http://localhost:8008".into(),
            homeserver_domain: "localhost".into(),
            as_token: String::new(),
            bot_localpart: "signalbot".into(),
            username_template: "signal_{userid}".into(),
            provisioning_prefix: "/_matrix/provision".into(),
            shared_secret: String::new(),
            status_endpoint: None,
            link_wait_timeout_secs: 30,
            max_connect_retries: 6,
            session_ttl_secs: 600,
            mirror_dm_names: true,
            delivery_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Settings {
    pub fn bridge_settings(&self) -> BridgeSettings {
        let mut settings = BridgeSettings::new(PuppetNaming {
            username_template: self.username_template.clone(),
            domain: self.homeserver_domain.clone(),
            bot_localpart: self.bot_localpart.clone(),
        });
        settings.link_wait_timeout = Duration::from_secs(self.link_wait_timeout_secs);
        settings.session_ttl = Duration::from_secs(self.session_ttl_secs);
        settings.retry = RetryPolicy {
            max_retries: self.max_connect_retries,
            ..RetryPolicy::default()
        };
        settings.dispatch = DispatchSettings {
            mirror_dm_names: self.mirror_dm_names,
            queue_capacity: self.delivery_queue_capacity,
        };
        settings
    }
}

pub fn load_settings() -> anyhow::Result<Settings> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_settings_from(&path, app_environment())
}

pub(crate) fn app_environment() -> Environment {
    Environment::with_prefix("APP")
        .separator("__")
        .try_parsing(true)
}

/// Layers defaults, the optional TOML file at `path`, then `env`.
pub(crate) fn load_settings_from(path: &str, env: Environment) -> anyhow::Result<Settings> {
    let defaults = Config::try_from(&Settings::default()).context("invalid default settings")?;
    Config::builder()
        .add_source(defaults)
        .add_source(File::new(path, FileFormat::Toml).required(false))
        .add_source(env)
        .build()
        .with_context(|| format!("failed to read configuration from {path}"))?
        .try_deserialize()
        .context("invalid configuration")
}

pub fn prepare_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite:") || raw_database_url.contains("://") {
        return raw_database_url.replace('\\', "/");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
