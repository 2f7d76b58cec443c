use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Commented sample configuration, printed by `gitpress --sample-config`.
pub const SAMPLE_CONFIG: &str = include_str!("../gitpress.toml");

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Deserialize, Clone)]
pub struct Server {
    pub address: String,
    pub port: u16,
}

#[derive(Deserialize, Clone)]
pub struct Site {
    /// Public base URL of this site, without a trailing slash.
    /// Used to build absolute links in post bundles and the feed.
    pub base_url: String,
    pub title: String,
}

#[derive(Deserialize, Clone)]
pub struct Github {
    pub owner: String,
    pub repo: String,
    /// Branch, tag or commit the content is read from.
    pub branch: Option<String>,
    /// Personal access token. Anonymous requests work but are rate
    /// limited hard enough to matter in production.
    pub token: Option<String>,
    /// Overridable for tests.
    pub api_base: Option<String>,
}

impl Github {
    pub fn branch(&self) -> &str {
        self.branch.as_deref().unwrap_or("main")
    }

    pub fn api_base(&self) -> &str {
        self.api_base.as_deref().unwrap_or("https://api.github.com")
    }
}

#[derive(Deserialize, Clone)]
pub struct Cache {
    pub database_path: PathBuf,
    pub default_ttl_secs: Option<i64>,
    pub default_swr_secs: Option<i64>,
    pub compile_timeout_secs: Option<u64>,
}

impl Cache {
    /// Time a cached value counts as fresh. 14 days unless configured.
    pub fn default_ttl_ms(&self) -> i64 {
        self.default_ttl_secs.map(|s| s * 1000).unwrap_or(14 * DAY_MS)
    }

    /// Window after the ttl in which a value is still served while a
    /// refresh runs in the background. 30 days unless configured.
    pub fn default_swr_ms(&self) -> i64 {
        self.default_swr_secs.map(|s| s * 1000).unwrap_or(30 * DAY_MS)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout_secs.unwrap_or(30))
    }
}

#[derive(Deserialize, Clone)]
pub struct Auth {
    /// Shared secret for instance-to-instance cache replication calls.
    pub internal_token: String,
    /// Shared secret the content repository's CI sends when asking for
    /// a cache refresh.
    pub refresh_token: String,
}

#[derive(Deserialize, Clone)]
pub struct Cluster {
    /// Directory holding the `.primary` sentinel file. When the file is
    /// absent this instance is the primary.
    pub sentinel_dir: PathBuf,
    /// Pattern for reaching a peer over the private network. Must
    /// contain `{hostname}`.
    pub internal_url_pattern: String,
}

impl Cluster {
    pub fn primary_url(&self, hostname: &str) -> String {
        self.internal_url_pattern.replace("{hostname}", hostname)
    }
}

#[derive(Deserialize, Clone)]
pub struct Content {
    /// Path prefix inside the repository under which all content lives.
    pub root: Option<String>,
    /// Directory under the root that holds blog posts.
    pub posts_dir: Option<String>,
    /// Serve draft and unlisted posts in list responses. Off in
    /// production, handy on a local instance.
    pub show_drafts: Option<bool>,
}

impl Content {
    pub fn root(&self) -> &str {
        self.root.as_deref().unwrap_or("content")
    }

    pub fn posts_dir(&self) -> &str {
        self.posts_dir.as_deref().unwrap_or("posts")
    }

    pub fn show_drafts(&self) -> bool {
        self.show_drafts.unwrap_or(false)
    }
}

#[derive(Deserialize, Clone)]
pub struct Log {
    pub level: LogLevel,
    pub log_to_console: bool,
    pub location: Option<PathBuf>,
}

#[derive(Deserialize, Copy, Clone)]
pub enum LogLevel {
    Critical = 0,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Deserialize, Clone)]
pub struct Og {
    /// Small site label rendered in the image corner, e.g. the domain.
    pub label: Option<String>,
    /// Extra font directory loaded on top of the system fonts.
    pub font_dir: Option<PathBuf>,
}

#[derive(Deserialize, Clone)]
pub struct RssFeed {
    pub title: String,
    pub site_url: String,
    pub description: String,
    pub page_size: u32,
}

#[derive(Deserialize, Clone)]
pub struct Config {
    pub server: Server,
    pub site: Site,
    pub github: Github,
    pub cache: Cache,
    pub auth: Auth,
    pub cluster: Option<Cluster>,
    pub content: Content,
    pub log: Option<Log>,
    pub og: Option<Og>,
    pub rss_feed: Option<RssFeed>,
}

fn parse_path(path: PathBuf) -> PathBuf {
    if path.starts_with("${exe_dir}") {
        let cur_exe = env::current_exe().unwrap();
        let exe_dir = cur_exe.parent().unwrap().to_str().unwrap();
        let str_path = path.to_str().unwrap();
        PathBuf::from(str_path.replace("${exe_dir}", exe_dir))
    } else {
        path
    }
}

pub fn read_config(cfg_path: &PathBuf) -> Result<Config> {
    let cfg_content = match fs::read_to_string(cfg_path) {
        Ok(content) => content,
        Err(e) => {
            return Err(Error::Config(format!(
                "Error opening configuration file {}: {}",
                cfg_path.to_str().unwrap(),
                e
            )))
        }
    };

    parse_config(cfg_content.as_str())
}

pub fn parse_config(cfg_content: &str) -> Result<Config> {
    let mut cfg: Config = match toml::from_str::<Config>(cfg_content) {
        Ok(cfg) => cfg,
        Err(e) => {
            return Err(Error::Config(format!(
                "Error parsing configuration file: {}",
                e
            )))
        }
    };

    cfg.cache.database_path = parse_path(cfg.cache.database_path);
    if let Some(log) = cfg.log.as_mut() {
        log.location = log.location.take().map(parse_path);
    }
    if let Some(og) = cfg.og.as_mut() {
        og.font_dir = og.font_dir.take().map(parse_path);
    }

    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<()> {
    if cfg.auth.internal_token.is_empty() {
        return Err(Error::Config("auth.internal_token must not be empty".to_string()));
    }
    if cfg.auth.refresh_token.is_empty() {
        return Err(Error::Config("auth.refresh_token must not be empty".to_string()));
    }
    if let Some(cluster) = &cfg.cluster {
        if !cluster.internal_url_pattern.contains("{hostname}") {
            return Err(Error::Config(
                "cluster.internal_url_pattern must contain {hostname}".to_string(),
            ));
        }
    }
    Ok(())
}
