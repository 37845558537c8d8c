//! Process and per-tenant configuration.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::context::Tenant;

/// Settings read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub broker_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    /// Destination of rendered outbound frames; unset disables publishing.
    pub publish_addr: Option<SocketAddr>,
    pub store_dir: PathBuf,
    pub tenant: Tenant,
    pub workers: usize,
    pub queue_size: usize,
    pub flat_file_delimiter: String,
    pub platform_url: Option<String>,
    pub platform_token: Option<String>,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl ServiceConfig {
    /// Read the environment; unset variables fall back to their defaults.
    pub fn from_env() -> Result<Self> {
        let broker_addr = var_or("MAPPING_BROKER_ADDR", "0.0.0.0:7100");
        let admin_addr = var_or("MAPPING_ADMIN_ADDR", "0.0.0.0:8090");

        let publish_addr = std::env::var("MAPPING_PUBLISH_ADDR")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|addr| {
                addr.parse()
                    .with_context(|| format!("invalid MAPPING_PUBLISH_ADDR {addr}"))
            })
            .transpose()?;

        Ok(Self {
            broker_addr: broker_addr
                .parse()
                .with_context(|| format!("invalid MAPPING_BROKER_ADDR {broker_addr}"))?,
            admin_addr: admin_addr
                .parse()
                .with_context(|| format!("invalid MAPPING_ADMIN_ADDR {admin_addr}"))?,
            publish_addr,
            store_dir: PathBuf::from(var_or("MAPPING_STORE_DIR", "./mapping-store")),
            tenant: Tenant::new(var_or("MAPPING_TENANT", "t100")),
            workers: parsed_or("MAPPING_WORKERS", 4usize).max(1),
            queue_size: parsed_or("MAPPING_QUEUE_SIZE", 1024usize).max(1),
            flat_file_delimiter: var_or("MAPPING_FLAT_FILE_DELIMITER", ","),
            platform_url: std::env::var("PLATFORM_URL").ok().filter(|s| !s.is_empty()),
            platform_token: std::env::var("PLATFORM_TOKEN").ok().filter(|s| !s.is_empty()),
        })
    }
}

/// Per-tenant switches kept in the configuration store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfiguration {
    /// Log every inbound payload at debug level.
    pub log_payload: bool,
    /// Log every substituted body.
    pub log_substitution: bool,
    pub external_extension_enabled: bool,
}
