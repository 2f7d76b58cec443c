//! Instance role detection and cache write forwarding.
//!
//! Several instances can share one replicated database file, but only
//! the primary may write it. The file replication layer maintains a
//! `.primary` sentinel next to the database: the file is absent on the
//! primary and contains the primary's hostname everywhere else.

use std::fs;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spdlog::{debug, warn};

use crate::cache::CacheEntry;
use crate::config;

const SENTINEL_FILE: &str = ".primary";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica { primary_hostname: String },
}

pub struct ClusterState {
    config: Option<config::Cluster>,
}

impl ClusterState {
    pub fn new(config: Option<config::Cluster>) -> Self {
        ClusterState { config }
    }

    /// State for a standalone instance, which is always the primary.
    pub fn single() -> Self {
        ClusterState { config: None }
    }

    /// Reads the sentinel on every call. Cheap, and the primary can
    /// move between two requests during a failover.
    pub fn role(&self) -> Role {
        let Some(cluster) = &self.config else {
            return Role::Primary;
        };
        match fs::read_to_string(cluster.sentinel_dir.join(SENTINEL_FILE)) {
            Ok(content) => {
                let primary_hostname = content.trim().to_string();
                if primary_hostname.is_empty() {
                    Role::Primary
                } else {
                    Role::Replica { primary_hostname }
                }
            }
            Err(_) => Role::Primary,
        }
    }

    pub fn primary_url(&self, hostname: &str) -> String {
        match &self.config {
            Some(cluster) => cluster.primary_url(hostname),
            None => format!("http://{}", hostname),
        }
    }
}

/// Replication payload for `POST /action/cache`. A missing value asks
/// the primary to delete the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheCommand {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_value: Option<CacheEntry>,
}

/// Sends cache writes to the primary. Calls are fire-and-forget: the
/// local caller already has the value in hand, replication lag only
/// delays other instances.
pub struct PeerClient {
    http: reqwest::Client,
    token: String,
}

impl PeerClient {
    pub fn new(token: String) -> Self {
        PeerClient {
            http: reqwest::Client::new(),
            token,
        }
    }

    pub fn spawn_set(&self, primary_url: String, key: String, entry: CacheEntry) {
        self.spawn_command(
            primary_url,
            CacheCommand {
                key,
                cache_value: Some(entry),
            },
        );
    }

    pub fn spawn_delete(&self, primary_url: String, key: String) {
        self.spawn_command(
            primary_url,
            CacheCommand {
                key,
                cache_value: None,
            },
        );
    }

    fn spawn_command(&self, primary_url: String, command: CacheCommand) {
        let http = self.http.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let url = format!("{}/action/cache", primary_url);
            let result = http
                .post(&url)
                .bearer_auth(&token)
                .timeout(Duration::from_secs(10))
                .json(&command)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!("Forwarded cache update for {} to primary", command.key);
                }
                Ok(response) => {
                    warn!(
                        "Primary rejected cache update for {}: {}",
                        command.key,
                        response.status()
                    );
                }
                Err(e) => {
                    warn!("Forwarding cache update for {} failed: {}", command.key, e);
                }
            }
        });
    }
}
