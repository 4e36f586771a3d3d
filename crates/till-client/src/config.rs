// Client-side defaults, env overrides, and the optional YAML config file.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;
use till_common::RequestKind;

use crate::client::context::Delivery;

pub(crate) const DEFAULT_API_VERSION: u32 = 3;
pub(crate) const DEFAULT_SUPPORT_CHECK_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub(crate) const DEFAULT_LIST_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// API version tag sent with every remote call.
    pub api_version: u32,
    /// Context terminal callbacks are posted to.
    pub delivery: Delivery,
    /// TTL for cached support-check results.
    pub support_check_ttl: Duration,
    /// TTL for cached purchase/SKU list results.
    pub list_ttl: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION,
            delivery: Delivery::Worker,
            support_check_ttl: DEFAULT_SUPPORT_CHECK_TTL,
            list_ttl: DEFAULT_LIST_TTL,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    api_version: Option<u32>,
    delivery: Option<Delivery>,
    support_check_ttl_ms: Option<u64>,
    list_ttl_ms: Option<u64>,
}

impl ClientConfig {
    /// Defaults, then `TILL_*` env vars, then the optional YAML file (path
    /// argument wins over `TILL_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("TILL_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_u32_env("TILL_API_VERSION") {
            config.api_version = value;
        }
        if let Some(value) = read_env("TILL_DELIVERY") {
            match value.as_str() {
                "worker" => config.delivery = Delivery::Worker,
                "main" => config.delivery = Delivery::Main,
                other => tracing::warn!(value = other, "ignoring unknown TILL_DELIVERY"),
            }
        }
        if let Some(value) = read_u64_env("TILL_SUPPORT_CHECK_TTL_MS") {
            config.support_check_ttl = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("TILL_LIST_TTL_MS") {
            config.list_ttl = Duration::from_millis(value);
        }
        config
    }

    /// Effective cache lifetime per kind. Mutating kinds stay uncacheable
    /// no matter what the config says.
    pub(crate) fn ttl_for(&self, kind: RequestKind) -> Option<Duration> {
        match kind {
            RequestKind::IsBillingSupported => Some(self.support_check_ttl),
            RequestKind::ListPurchases | RequestKind::ListSkus => Some(self.list_ttl),
            RequestKind::Purchase | RequestKind::ChangeSubscription | RequestKind::Consume => None,
        }
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = self.api_version {
            config.api_version = value;
        }
        if let Some(value) = self.delivery {
            config.delivery = value;
        }
        if let Some(value) = self.support_check_ttl_ms {
            config.support_check_ttl = Duration::from_millis(value);
        }
        if let Some(value) = self.list_ttl_ms {
            config.list_ttl = Duration::from_millis(value);
        }
    }
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn read_u32_env(name: &str) -> Option<u32> {
    read_env(name).and_then(|value| value.parse().ok())
}

fn read_u64_env(name: &str) -> Option<u64> {
    read_env(name).and_then(|value| value.parse().ok())
}
