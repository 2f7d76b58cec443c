//! The post catalog.
//!
//! Every operation that turns repository content into a servable
//! answer lives here, and every one of them is backed by the cache:
//! directory listing, file download, compilation and the assembled
//! page and list responses. The layers nest, so a cold page request
//! fills four keys on its way down and later requests can be answered
//! from whichever layer is still warm.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use spdlog::{error, warn};

use crate::cache::{Cache, CacheEntry};
use crate::cachified::{cachified, CachifiedOptions};
use crate::config::Config;
use crate::content::compile_queue::CompileQueue;
use crate::content::frontmatter::Frontmatter;
use crate::content::{compiler, PostPage, ReadTime};
use crate::error::Result;
use crate::github::{Download, GithubClient};
use crate::text_utils;

/// Cache key of the marker left behind by a content refresh.
pub const LAST_REFRESH_KEY: &str = "meta:last-refresh-commit-sha";

/// Per-request knobs passed down through the nested cache layers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    pub force_fresh: bool,
}

impl FetchOptions {
    pub fn force_fresh() -> Self {
        FetchOptions { force_fresh: true }
    }
}

/// One entry of the posts directory: the name as stored in the
/// repository and the slug it is served under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirListEntry {
    pub name: String,
    pub slug: String,
}

/// List view of a post: the compiled page without its HTML body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostListItem {
    pub slug: String,
    pub frontmatter: Frontmatter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<ReadTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_display: Option<String>,
}

impl From<PostPage> for PostListItem {
    fn from(page: PostPage) -> Self {
        PostListItem {
            slug: page.slug,
            frontmatter: page.frontmatter,
            read_time: page.read_time,
            date_display: page.date_display,
        }
    }
}

/// A cached payload joined with its live view count. View counts come
/// from the local database on every request, never from the cache.
#[derive(Debug, Clone, Serialize)]
pub struct WithViews<T> {
    #[serde(flatten)]
    pub item: T,
    pub views: i64,
}

/// What the last content refresh recorded, served verbatim to pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshInfo {
    pub sha: String,
    pub date: String,
}

/// Handle to the content pipeline. Cloning is cheap and every clone
/// shares the same cache, source client and compile queue.
#[derive(Clone)]
pub struct Catalog {
    cache: Arc<Cache>,
    github: Arc<GithubClient>,
    queue: Arc<CompileQueue>,
    content_root: String,
    posts_dir: String,
    show_drafts: bool,
    ttl: i64,
    swr: i64,
}

impl Catalog {
    pub fn new(cache: Arc<Cache>, github: GithubClient, config: &Config) -> Catalog {
        Catalog {
            cache,
            github: Arc::new(github),
            queue: Arc::new(CompileQueue::new(config.cache.compile_timeout())),
            content_root: config.content.root().to_string(),
            posts_dir: config.content.posts_dir().to_string(),
            show_drafts: config.content.show_drafts(),
            ttl: config.cache.default_ttl_ms(),
            swr: config.cache.default_swr_ms(),
        }
    }

    fn options(&self, key: String, fetch: FetchOptions) -> CachifiedOptions {
        CachifiedOptions::new(key, Some(self.ttl), Some(self.swr)).force_fresh(fetch.force_fresh)
    }

    /// Lists the posts directory of the repository, mapped to slugs.
    pub async fn dir_list(&self, fetch: FetchOptions) -> Result<Vec<DirListEntry>> {
        let key = format!("{}:dir-list", self.posts_dir);
        let this = self.clone();
        cachified(&self.cache, self.options(key, fetch), move || async move {
            let dir = format!("{}/{}", this.content_root, this.posts_dir);
            let prefix = format!("{}/", dir);
            let listing = this.github.list_dir(&dir).await?;
            Ok(listing
                .into_iter()
                .filter(|entry| entry.name != "README.md")
                .map(|entry| {
                    let stripped = entry.path.strip_prefix(&prefix).unwrap_or(&entry.path);
                    let slug = stripped
                        .strip_suffix(".mdx")
                        .or_else(|| stripped.strip_suffix(".md"))
                        .unwrap_or(stripped)
                        .to_string();
                    DirListEntry {
                        name: entry.name,
                        slug,
                    }
                })
                .collect())
        })
        .await
    }

    /// Downloads the repository files for one post. A slug that
    /// resolves to nothing is not worth remembering, so its entry is
    /// dropped again right away.
    pub async fn download_post_files(&self, slug: &str, fetch: FetchOptions) -> Result<Download> {
        let key = format!("{}:{}:downloaded", self.posts_dir, slug);
        let path = format!("{}/{}/{}", self.content_root, self.posts_dir, slug);
        let this = self.clone();
        let downloaded: Download = cachified(
            &self.cache,
            self.options(key.clone(), fetch),
            move || async move { this.github.download_file_or_dir(&path).await },
        )
        .await?;
        if downloaded.files.is_empty() {
            self.drop_entry(&key);
        }
        Ok(downloaded)
    }

    /// Compiles downloaded files into a page. `None` when the download
    /// has no index file, in which case the entry is dropped so the
    /// next request compiles again instead of caching the absence for
    /// two weeks.
    pub async fn compile_post(
        &self,
        slug: &str,
        download: Download,
        fetch: FetchOptions,
    ) -> Result<Option<PostPage>> {
        let key = format!("{}:{}:compiled", self.posts_dir, slug);
        let this = self.clone();
        let slug = slug.to_string();
        let page: Option<PostPage> = cachified(
            &self.cache,
            self.options(key.clone(), fetch),
            move || async move {
                this.queue
                    .run(|| async move { compiler::compile(&slug, &download.files) })
                    .await
            },
        )
        .await?;
        if page.is_none() {
            self.drop_entry(&key);
        }
        Ok(page)
    }

    /// The full page bundle for one post, joined with its view count.
    /// `None` when the slug does not resolve to any content.
    pub async fn post_page(
        &self,
        slug: &str,
        fetch: FetchOptions,
    ) -> Result<Option<WithViews<PostPage>>> {
        let key = format!("page:{}:{}:compiled", self.posts_dir, slug);
        let this = self.clone();
        let fetch_slug = slug.to_string();
        let page: Option<PostPage> = cachified(
            &self.cache,
            self.options(key.clone(), fetch),
            move || async move {
                let downloaded = this.download_post_files(&fetch_slug, fetch).await?;
                this.compile_post(&fetch_slug, downloaded, fetch).await
            },
        )
        .await?;
        let Some(page) = page else {
            self.drop_entry(&key);
            return Ok(None);
        };
        let views = self
            .cache
            .db()
            .views_for_slug(&format!("/{}/{}", self.posts_dir, slug))?;
        Ok(Some(WithViews { item: page, views }))
    }

    /// Every published post, newest first, with view counts. The list
    /// itself is cached, the counts are joined per request.
    pub async fn post_list_items(&self, fetch: FetchOptions) -> Result<Vec<WithViews<PostListItem>>> {
        let key = format!("{}:post-list-items", self.posts_dir);
        let this = self.clone();
        let items: Vec<PostListItem> = cachified(
            &self.cache,
            self.options(key, fetch),
            move || async move {
                let entries = this.dir_list(fetch).await?;
                let mut pages = Vec::new();
                for entry in entries {
                    let downloaded = this.download_post_files(&entry.slug, fetch).await?;
                    if let Some(page) = this.compile_post(&entry.slug, downloaded, fetch).await? {
                        pages.push(page);
                    }
                }
                if !this.show_drafts {
                    pages.retain(|page| {
                        !page.frontmatter.is_draft() && !page.frontmatter.is_unlisted()
                    });
                }
                // Newest first, posts without a parseable date at the end.
                pages.sort_by_cached_key(|page| {
                    std::cmp::Reverse(
                        page.frontmatter
                            .date
                            .as_deref()
                            .and_then(text_utils::parse_post_date),
                    )
                });
                Ok(pages.into_iter().map(PostListItem::from).collect())
            },
        )
        .await?;

        let views = self.cache.db().views_by_slug()?;
        Ok(items
            .into_iter()
            .map(|item| {
                let views = views
                    .get(&format!("/{}/{}", self.posts_dir, item.slug))
                    .copied()
                    .unwrap_or(0);
                WithViews { item, views }
            })
            .collect())
    }

    /// Path a view of this post is recorded under.
    pub fn view_slug(&self, slug: &str) -> String {
        format!("/{}/{}", self.posts_dir, slug)
    }

    pub fn posts_dir(&self) -> &str {
        &self.posts_dir
    }

    /// Stores which commit the content was last refreshed to. The
    /// marker never expires, a later refresh simply overwrites it.
    pub fn record_refresh(&self, sha: String) -> Result<()> {
        let info = RefreshInfo {
            sha,
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        let entry = CacheEntry::new(serde_json::to_value(&info)?, None, None);
        self.cache.set(LAST_REFRESH_KEY, entry)
    }

    pub fn last_refresh(&self) -> Result<Option<RefreshInfo>> {
        let Some(entry) = self.cache.get(LAST_REFRESH_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_value::<RefreshInfo>(entry.value) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                error!("Unreadable refresh marker, dropping it: {}", e);
                let _ = self.cache.delete(LAST_REFRESH_KEY);
                Ok(None)
            }
        }
    }

    fn drop_entry(&self, key: &str) {
        if let Err(e) = self.cache.delete(key) {
            warn!("Could not drop cache entry {}: {}", key, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheDb;
    use crate::cluster::{ClusterState, PeerClient};
    use crate::config;
    use base64::prelude::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const POST_FIRST: &str =
        "---\ntitle: First post\ndate: 2022-04-02\n---\n\n# First post\n\nSome body text.\n";
    const POST_ALPHA: &str = "---\ntitle: Alpha\ndate: 2024-01-15\n---\n\nAlpha body text.\n";
    const POST_BETA: &str = "---\ntitle: Beta\ndate: 2025-03-02\n---\n\nBeta body text.\n";
    const POST_DRAFT: &str =
        "---\ntitle: Hidden\ndate: 2025-04-01\ndraft: true\n---\n\nNot yet.\n";

    fn catalog_for(api_base: &str) -> Catalog {
        let db = Arc::new(CacheDb::open_in_memory().unwrap());
        let cache = Cache::new(db, ClusterState::single(), PeerClient::new("token".into()));
        let github = GithubClient::new(&config::Github {
            owner: "octocat".to_string(),
            repo: "blog-content".to_string(),
            branch: None,
            token: None,
            api_base: Some(api_base.to_string()),
        })
        .unwrap();
        Catalog {
            cache: Arc::new(cache),
            github: Arc::new(github),
            queue: Arc::new(CompileQueue::new(Duration::from_secs(5))),
            content_root: "content".to_string(),
            posts_dir: "posts".to_string(),
            show_drafts: false,
            ttl: 60_000,
            swr: 60_000,
        }
    }

    fn file_entry(name: &str, sha: &str) -> serde_json::Value {
        json!({
            "name": name,
            "path": format!("content/posts/{}", name),
            "sha": sha,
            "type": "file",
        })
    }

    fn blob(content: &str) -> serde_json::Value {
        json!({
            "content": BASE64_STANDARD.encode(content),
            "encoding": "base64",
        })
    }

    async fn mount_listing(server: &MockServer, entries: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/repos/octocat/blog-content/contents/content/posts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(entries))
            .mount(server)
            .await;
    }

    async fn mount_blob(server: &MockServer, sha: &str, content: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/repos/octocat/blog-content/git/blobs/{}", sha)))
            .respond_with(ResponseTemplate::new(200).set_body_json(blob(content)))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn dir_list_maps_paths_to_slugs_and_skips_the_readme() {
        let server = MockServer::start().await;
        mount_listing(
            &server,
            json!([
                file_entry("README.md", "s0"),
                file_entry("alpha.mdx", "s1"),
                file_entry("notes.md", "s2"),
                json!({"name": "deep-dive", "path": "content/posts/deep-dive", "sha": "s3", "type": "dir"}),
            ]),
        )
        .await;

        let catalog = catalog_for(&server.uri());
        let entries = catalog.dir_list(FetchOptions::default()).await.unwrap();

        let slugs: Vec<&str> = entries.iter().map(|e| e.slug.as_str()).collect();
        assert_eq!(slugs, vec!["alpha", "notes", "deep-dive"]);
        assert_eq!(entries[0].name, "alpha.mdx");
    }

    #[tokio::test]
    async fn post_page_compiles_once_then_serves_from_cache() {
        let server = MockServer::start().await;
        mount_listing(&server, json!([file_entry("first.mdx", "s1")])).await;
        mount_blob(&server, "s1", POST_FIRST).await;

        let catalog = catalog_for(&server.uri());
        let first = catalog
            .post_page("first", FetchOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.item.slug, "first");
        assert!(first.item.html.contains("<h1"));
        assert_eq!(first.item.date_display.as_deref(), Some("April 2, 2022"));
        assert!(first.item.read_time.is_some());
        assert_eq!(first.views, 0);

        let requests_after_first = server.received_requests().await.unwrap().len();
        let second = catalog
            .post_page("first", FetchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.item.html, first.item.html);
        assert_eq!(
            server.received_requests().await.unwrap().len(),
            requests_after_first
        );
    }

    #[tokio::test]
    async fn missing_post_is_none_and_leaves_no_cache_entries() {
        let server = MockServer::start().await;
        mount_listing(&server, json!([file_entry("other.mdx", "s9")])).await;

        let catalog = catalog_for(&server.uri());
        let page = catalog
            .post_page("nope", FetchOptions::default())
            .await
            .unwrap();
        assert!(page.is_none());

        for key in [
            "posts:nope:downloaded",
            "posts:nope:compiled",
            "page:posts:nope:compiled",
        ] {
            assert!(catalog.cache.get(key).unwrap().is_none(), "{} left behind", key);
        }
    }

    #[tokio::test]
    async fn list_filters_drafts_sorts_newest_first_and_joins_views() {
        let server = MockServer::start().await;
        mount_listing(
            &server,
            json!([
                file_entry("README.md", "s0"),
                file_entry("alpha.mdx", "s1"),
                file_entry("beta.mdx", "s2"),
                file_entry("hidden.mdx", "s3"),
            ]),
        )
        .await;
        mount_blob(&server, "s1", POST_ALPHA).await;
        mount_blob(&server, "s2", POST_BETA).await;
        mount_blob(&server, "s3", POST_DRAFT).await;

        let catalog = catalog_for(&server.uri());
        catalog.cache.db().record_view("c1", "/posts/beta").unwrap();
        catalog.cache.db().record_view("c2", "/posts/beta").unwrap();

        let items = catalog
            .post_list_items(FetchOptions::default())
            .await
            .unwrap();

        let slugs: Vec<&str> = items.iter().map(|i| i.item.slug.as_str()).collect();
        assert_eq!(slugs, vec!["beta", "alpha"]);
        assert_eq!(items[0].views, 2);
        assert_eq!(items[1].views, 0);

        // The list payload carries no rendered HTML.
        let json = serde_json::to_value(&items).unwrap();
        assert!(json[0].get("html").is_none());
        assert_eq!(json[0]["slug"], "beta");
        assert_eq!(json[0]["dateDisplay"], "March 2, 2025");
        assert_eq!(json[0]["views"], 2);

        // A second call is answered from the cache.
        let requests = server.received_requests().await.unwrap().len();
        catalog
            .post_list_items(FetchOptions::default())
            .await
            .unwrap();
        assert_eq!(server.received_requests().await.unwrap().len(), requests);
    }

    #[tokio::test]
    async fn force_fresh_reaches_the_source_again() {
        let server = MockServer::start().await;
        mount_listing(&server, json!([file_entry("evolving.mdx", "s1")])).await;
        mount_blob(&server, "s1", "---\ntitle: Evolving\n---\n\nFirst version.\n").await;

        let catalog = catalog_for(&server.uri());
        let v1 = catalog
            .post_page("evolving", FetchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert!(v1.item.html.contains("First version."));

        server.reset().await;
        mount_listing(&server, json!([file_entry("evolving.mdx", "s1")])).await;
        mount_blob(&server, "s1", "---\ntitle: Evolving\n---\n\nSecond version.\n").await;

        let cached = catalog
            .post_page("evolving", FetchOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert!(cached.item.html.contains("First version."));

        let fresh = catalog
            .post_page("evolving", FetchOptions::force_fresh())
            .await
            .unwrap()
            .unwrap();
        assert!(fresh.item.html.contains("Second version."));
    }

    #[tokio::test]
    async fn refresh_marker_roundtrips() {
        let catalog = catalog_for("http://127.0.0.1:9");
        assert!(catalog.last_refresh().unwrap().is_none());

        catalog.record_refresh("abc123".to_string()).unwrap();
        let info = catalog.last_refresh().unwrap().unwrap();
        assert_eq!(info.sha, "abc123");
        assert!(chrono::DateTime::parse_from_rfc3339(&info.date).is_ok());
    }

    #[tokio::test]
    async fn unreadable_refresh_marker_is_dropped() {
        let catalog = catalog_for("http://127.0.0.1:9");
        catalog
            .cache
            .set_local(LAST_REFRESH_KEY, &CacheEntry::new(json!(42), None, None))
            .unwrap();

        assert!(catalog.last_refresh().unwrap().is_none());
        assert!(catalog.cache.get(LAST_REFRESH_KEY).unwrap().is_none());
    }
}
