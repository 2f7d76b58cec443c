//! GitHub REST client for the content repository.
//!
//! Content is pulled through two endpoints: directory listings via
//! `/contents/{path}` and file bodies via `/git/blobs/{sha}`. Listing
//! answers carry blob shas, so a download is one listing plus one blob
//! request per file.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use base64::prelude::*;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use spdlog::warn;

use crate::config;
use crate::error::{Error, Result};

const MAX_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// One entry of a repository directory listing.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoEntry {
    pub name: String,
    pub path: String,
    pub sha: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A downloaded file, path relative to the repository root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

/// Result of resolving a post path: the repository entry it resolved
/// to and every file that belongs to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Download {
    pub entry: String,
    pub files: Vec<SourceFile>,
}

#[derive(Deserialize)]
struct BlobResponse {
    content: String,
    encoding: String,
}

pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    owner: String,
    repo: String,
    branch: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(github: &config::Github) -> Result<GithubClient> {
        let http = reqwest::Client::builder()
            .user_agent("gitpress")
            .build()?;
        Ok(GithubClient {
            http,
            api_base: github.api_base().to_string(),
            owner: github.owner.clone(),
            repo: github.repo.clone(),
            branch: github.branch().to_string(),
            token: github.token.clone(),
        })
    }

    /// Lists a repository directory at the configured branch.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<RepoEntry>> {
        let url = format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_base, self.owner, self.repo, path
        );
        let payload: serde_json::Value = self.get_json(url, path, true).await?;
        if !payload.is_array() {
            // Asking for a file instead of a directory answers with a
            // single object.
            return Err(Error::SourcePayload {
                path: path.to_string(),
                reason: "expected a list of files".to_string(),
            });
        }
        Ok(serde_json::from_value(payload)?)
    }

    /// Downloads one file body by its blob sha.
    pub async fn file_by_sha(&self, sha: &str) -> Result<String> {
        let url = format!(
            "{}/repos/{}/{}/git/blobs/{}",
            self.api_base, self.owner, self.repo, sha
        );
        let blob: BlobResponse = self.get_json(url, sha, false).await?;
        match blob.encoding.as_str() {
            "base64" => {
                // The API wraps base64 bodies in newlines.
                let packed: String = blob.content.split_whitespace().collect();
                let bytes = BASE64_STANDARD.decode(packed).map_err(|e| Error::SourcePayload {
                    path: sha.to_string(),
                    reason: format!("invalid base64 blob: {}", e),
                })?;
                String::from_utf8(bytes).map_err(|e| Error::SourcePayload {
                    path: sha.to_string(),
                    reason: format!("blob is not utf-8: {}", e),
                })
            }
            "utf-8" => Ok(blob.content),
            other => Err(Error::SourcePayload {
                path: sha.to_string(),
                reason: format!("unknown blob encoding {}", other),
            }),
        }
    }

    /// Resolves a post path that may be a single markdown file or a
    /// directory with an index file plus attachments.
    ///
    /// A lone `about.mdx` and a directory `about/` with an `index.mdx`
    /// both come back as a file set rooted at the requested path.
    pub async fn download_file_or_dir(&self, path: &str) -> Result<Download> {
        let listing = self.list_dir(parent_dir(path)).await?;
        let basename = base_name(path);
        let stem = file_stem(basename);

        let potentials: Vec<&RepoEntry> = listing
            .iter()
            .filter(|entry| entry.name.starts_with(basename))
            .collect();
        let exact_match = potentials
            .iter()
            .copied()
            .find(|entry| file_stem(&entry.name) == stem);
        let dir_potential = potentials
            .iter()
            .copied()
            .find(|entry| entry.kind == "dir");

        let candidates: Vec<&RepoEntry> = match exact_match {
            Some(exact) => vec![exact],
            None => potentials,
        };
        if let Some(content) = self.first_markdown_file(&candidates).await? {
            let entry = if path.ends_with(".mdx") {
                path.to_string()
            } else {
                format!("{}.mdx", path)
            };
            return Ok(Download {
                entry,
                files: vec![SourceFile {
                    path: format!("{}/index.mdx", path),
                    content,
                }],
            });
        }
        if let Some(dir) = dir_potential {
            return Ok(Download {
                entry: dir.path.clone(),
                files: self.download_dir(path).await?,
            });
        }
        Ok(Download {
            entry: path.to_string(),
            files: Vec::new(),
        })
    }

    /// First `.mdx`, then `.md` among the candidate files.
    async fn first_markdown_file(&self, candidates: &[&RepoEntry]) -> Result<Option<String>> {
        for extension in [".mdx", ".md"] {
            let found = candidates
                .iter()
                .find(|entry| entry.kind == "file" && entry.name.ends_with(extension));
            if let Some(file) = found {
                return Ok(Some(self.file_by_sha(&file.sha).await?));
            }
        }
        Ok(None)
    }

    fn download_dir<'a>(
        &'a self,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<SourceFile>>> + Send + 'a>> {
        Box::pin(async move {
            let listing = self.list_dir(path).await?;
            let mut files = Vec::new();
            for entry in listing {
                match entry.kind.as_str() {
                    "file" => {
                        let content = self.file_by_sha(&entry.sha).await?;
                        files.push(SourceFile {
                            path: entry.path,
                            content,
                        });
                    }
                    "dir" => files.extend(self.download_dir(&entry.path).await?),
                    other => {
                        return Err(Error::SourcePayload {
                            path: entry.path.clone(),
                            reason: format!("unexpected entry type {}", other),
                        })
                    }
                }
            }
            Ok(files)
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        repo_path: &str,
        with_ref: bool,
    ) -> Result<T> {
        let mut retried = false;
        loop {
            let mut request = self
                .http
                .get(&url)
                .header("accept", "application/vnd.github+json");
            if with_ref {
                request = request.query(&[("ref", self.branch.as_str())]);
            }
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response.json::<T>().await?);
            }

            let rate_limited =
                status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS;
            if rate_limited && !retried {
                if let Some(delay) = rate_limit_delay(response.headers()) {
                    warn!(
                        "Content source rate limited on {}, retrying in {:?}",
                        repo_path, delay
                    );
                    tokio::time::sleep(delay).await;
                    retried = true;
                    continue;
                }
            }
            return Err(Error::SourceStatus {
                status: status.as_u16(),
                path: repo_path.to_string(),
            });
        }
    }
}

/// Wait suggested by rate limit headers, if they carry one. Capped so
/// a bogus reset timestamp cannot park a request for hours.
fn rate_limit_delay(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    let header_secs = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
    };

    if let Some(secs) = header_secs("retry-after") {
        return Some(Duration::from_secs(secs.max(0) as u64).min(MAX_RATE_LIMIT_WAIT));
    }
    if header_secs("x-ratelimit-remaining") == Some(0) {
        let reset = header_secs("x-ratelimit-reset")?;
        let wait = reset - chrono::Utc::now().timestamp();
        return Some(Duration::from_secs(wait.max(0) as u64).min(MAX_RATE_LIMIT_WAIT));
    }
    None
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn base_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, base)| base).unwrap_or(path)
}

fn file_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => name,
    }
}
