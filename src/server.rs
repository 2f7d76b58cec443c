use std::sync::Arc;

use ntex::util::Bytes;
use ntex::web;
use ntex::web::HttpRequest;
use spdlog::{error, info, warn};

use crate::cache::{Cache, CacheDb};
use crate::cluster::{CacheCommand, ClusterState, PeerClient, Role};
use crate::config::Config;
use crate::error::Result;
use crate::github::GithubClient;
use crate::og::OgRenderer;
use crate::posts::{Catalog, FetchOptions, PostListItem};
use crate::query_string::QueryString;
use crate::rss::RssChannel;
use crate::views::{ViewRecorder, ViewSender};

const RICKROLL_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

struct AppState {
    config: Config,
    cache: Arc<Cache>,
    catalog: Catalog,
    views: ViewSender,
    og: OgRenderer,
}

#[web::get("/healthz")]
async fn healthz(state: web::types::State<Arc<AppState>>) -> web::HttpResponse {
    match state.cache.db().ping() {
        Ok(()) => web::HttpResponse::Ok()
            .content_type("text/plain; charset=utf-8")
            .body("OK"),
        Err(e) => {
            error!("Health check failed: {}", e);
            web::HttpResponse::InternalServerError().body("database unavailable")
        }
    }
}

#[web::get("/posts")]
async fn post_list(state: web::types::State<Arc<AppState>>) -> web::HttpResponse {
    match state.catalog.post_list_items(FetchOptions::default()).await {
        Ok(items) => json_response(&items),
        Err(e) => {
            error!("Listing posts failed: {}", e);
            web::HttpResponse::InternalServerError().body("Could not list posts")
        }
    }
}

#[web::get("/posts/{slug}")]
async fn post_page(
    path: web::types::Path<String>,
    state: web::types::State<Arc<AppState>>,
) -> web::HttpResponse {
    let slug = path.into_inner();
    match state.catalog.post_page(&slug, FetchOptions::default()).await {
        Ok(Some(page)) => {
            let title = page
                .item
                .frontmatter
                .social_image_title
                .as_deref()
                .or(page.item.frontmatter.title.as_deref())
                .unwrap_or(&slug)
                .to_string();
            match serde_json::to_value(&page) {
                Ok(mut value) => {
                    value["ogImageUrl"] =
                        serde_json::Value::String(og_image_url(&state.config.site.base_url, &title));
                    json_response(&value)
                }
                Err(e) => {
                    error!("Serializing post {} failed: {}", slug, e);
                    web::HttpResponse::InternalServerError().finish()
                }
            }
        }
        Ok(None) => web::HttpResponse::NotFound()
            .content_type("text/plain; charset=utf-8")
            .body("Not found"),
        Err(e) => {
            error!("Serving post {} failed: {}", slug, e);
            web::HttpResponse::InternalServerError().body("Could not load the post")
        }
    }
}

#[web::post("/posts/{slug}/view")]
async fn post_view(
    req: HttpRequest,
    path: web::types::Path<String>,
    state: web::types::State<Arc<AppState>>,
) -> web::HttpResponse {
    let slug = path.into_inner();
    let client_id = client_identity(header(&req, "x-forwarded-for"), header(&req, "fly-client-ip"));
    state
        .views
        .view(client_id, state.catalog.view_slug(&slug))
        .await;
    json_response(&serde_json::json!({"success": true}))
}

#[web::get("/action/og")]
async fn og_image(req: HttpRequest, state: web::types::State<Arc<AppState>>) -> web::HttpResponse {
    let title = req
        .uri()
        .query()
        .map(QueryString::from)
        .and_then(|qs| qs.get("title").map(str::to_string))
        .unwrap_or_else(|| state.config.site.title.clone());
    match state.og.render(&title) {
        Ok(png) => png_response(png),
        Err(e) => {
            error!("Rendering the social image failed: {}", e);
            web::HttpResponse::InternalServerError().body("Could not render the image")
        }
    }
}

/// Replication endpoint. Replicas forward their cache writes here, so
/// this must only ever run on the primary.
#[web::post("/action/cache")]
async fn cache_update(
    req: HttpRequest,
    body: Bytes,
    state: web::types::State<Arc<AppState>>,
) -> web::HttpResponse {
    if let Role::Replica { primary_hostname } = state.cache.role() {
        error!(
            "Cache update hit a replica, primary is {}",
            primary_hostname
        );
        return web::HttpResponse::InternalServerError()
            .body("cache updates must go to the primary instance");
    }
    if !bearer_matches(header(&req, "authorization"), &state.config.auth.internal_token) {
        warn!("Unauthorized cache update, redirecting to solid tunes");
        return rickroll();
    }
    let command: CacheCommand = match serde_json::from_slice(&body) {
        Ok(command) => command,
        Err(e) => {
            warn!("Undecodable cache command: {}", e);
            return web::HttpResponse::BadRequest().body("invalid cache command");
        }
    };
    let result = match command.cache_value {
        Some(entry) => {
            info!("Setting {} in the cache from remote", command.key);
            state.cache.set_local(&command.key, &entry)
        }
        None => {
            info!("Deleting {} from the cache from remote", command.key);
            state.cache.delete_local(&command.key).map(|_| ())
        }
    };
    match result {
        Ok(()) => json_response(&serde_json::json!({"success": true})),
        Err(e) => {
            error!("Remote cache update for {} failed: {}", command.key, e);
            web::HttpResponse::InternalServerError().finish()
        }
    }
}

/// Called by the content repository's CI after a push, with either
/// explicit cache keys to drop or changed content paths to recompile.
#[web::post("/action/refresh-cache")]
async fn refresh_cache(
    req: HttpRequest,
    body: Bytes,
    state: web::types::State<Arc<AppState>>,
) -> web::HttpResponse {
    if let Some(replay) = ensure_primary(&state) {
        return replay;
    }
    if header(&req, "auth") != Some(state.config.auth.refresh_token.as_str()) {
        warn!("Unauthorized refresh request, redirecting to solid tunes");
        return rickroll();
    }
    match parse_refresh_body(&body) {
        (RefreshAction::DeleteKeys(keys), commit_sha) => {
            info!("Refresh: deleting {} cache keys", keys.len());
            for key in &keys {
                if let Err(e) = state.cache.delete(key) {
                    warn!("Could not delete {}: {}", key, e);
                }
            }
            record_sha(&state, commit_sha.clone());
            json_response(&serde_json::json!({
                "message": "Deleting cache keys",
                "keys": keys,
                "commitSha": commit_sha,
            }))
        }
        (RefreshAction::RefreshPaths(paths), commit_sha) => {
            let mut refreshing: Vec<String> = Vec::new();
            for content_path in &paths {
                let Some(slug) = refresh_slug(content_path, state.catalog.posts_dir()) else {
                    continue;
                };
                refreshing.push(content_path.clone());
                info!("Refresh: recompiling {}", slug);
                let catalog = state.catalog.clone();
                tokio::spawn(async move {
                    if let Err(e) = catalog.post_page(&slug, FetchOptions::force_fresh()).await {
                        warn!("Refreshing {} failed: {}", slug, e);
                    }
                });
            }
            // Changed posts also change the list page.
            if !refreshing.is_empty() {
                let catalog = state.catalog.clone();
                tokio::spawn(async move {
                    if let Err(e) = catalog.post_list_items(FetchOptions::force_fresh()).await {
                        warn!("Refreshing the post list failed: {}", e);
                    }
                });
            }
            record_sha(&state, commit_sha.clone());
            json_response(&serde_json::json!({
                "message": "Refreshing cache for content paths",
                "contentPaths": refreshing,
                "commitSha": commit_sha,
            }))
        }
        (RefreshAction::None, _) => no_action(),
    }
}

#[web::get("/refresh-commit-sha.json")]
async fn refresh_commit_sha(state: web::types::State<Arc<AppState>>) -> web::HttpResponse {
    match state.catalog.last_refresh() {
        Ok(Some(info)) => json_response(&info),
        Ok(None) => web::HttpResponse::Ok()
            .content_type("application/json")
            .body("null"),
        Err(e) => {
            error!("Reading the refresh marker failed: {}", e);
            web::HttpResponse::InternalServerError().finish()
        }
    }
}

#[web::get("/rss")]
async fn rss_feed(state: web::types::State<Arc<AppState>>) -> web::HttpResponse {
    let Some(feed) = state.config.rss_feed.as_ref() else {
        return web::HttpResponse::NotFound().body("no feed configured");
    };
    let items = match state.catalog.post_list_items(FetchOptions::default()).await {
        Ok(items) => items,
        Err(e) => {
            error!("Listing posts for the feed failed: {}", e);
            return web::HttpResponse::InternalServerError().body("Could not build the feed");
        }
    };
    let items: Vec<PostListItem> = items.into_iter().map(|entry| entry.item).collect();
    let channel = RssChannel {
        feed,
        posts_dir: state.catalog.posts_dir(),
    };
    match channel.render(&items) {
        Ok(xml) => web::HttpResponse::Ok()
            .content_type("application/rss+xml; charset=utf-8")
            .body(xml),
        Err(e) => {
            error!("Rendering the feed failed: {}", e);
            web::HttpResponse::InternalServerError().body("Could not build the feed")
        }
    }
}

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|value| value.to_str().ok())
}

fn json_response<T: serde::Serialize>(value: &T) -> web::HttpResponse {
    match serde_json::to_string(value) {
        Ok(body) => web::HttpResponse::Ok()
            .content_type("application/json")
            .body(body),
        Err(e) => {
            error!("Serializing a response failed: {}", e);
            web::HttpResponse::InternalServerError().finish()
        }
    }
}

/// The image is embedded by other sites' link previews, so it must be
/// fetchable cross-origin.
fn png_response(png: Vec<u8>) -> web::HttpResponse {
    web::HttpResponse::Ok()
        .content_type("image/png")
        .header("cache-control", "public, max-age=604800, immutable, no-transform")
        .header("access-control-allow-origin", "*")
        .header("access-control-allow-methods", "GET")
        .header("cross-origin-resource-policy", "cross-origin")
        .body(png)
}

fn rickroll() -> web::HttpResponse {
    web::HttpResponse::Found()
        .header("location", RICKROLL_URL)
        .finish()
}

fn no_action() -> web::HttpResponse {
    web::HttpResponse::BadRequest()
        .content_type("application/json")
        .body(r#"{"message":"no action taken"}"#)
}

/// A 409 with a replay header tells the platform router to repeat the
/// request on the primary instance.
fn ensure_primary(state: &AppState) -> Option<web::HttpResponse> {
    match state.cache.role() {
        Role::Primary => None,
        Role::Replica { primary_hostname } => Some(
            web::HttpResponse::Conflict()
                .header("fly-replay", format!("instance={}", primary_hostname))
                .finish(),
        ),
    }
}

fn record_sha(state: &AppState, sha: Option<String>) {
    if let Some(sha) = sha {
        if let Err(e) = state.catalog.record_refresh(sha) {
            warn!("Could not record the refresh commit: {}", e);
        }
    }
}

fn og_image_url(base_url: &str, title: &str) -> String {
    let query = serde_urlencoded::to_string([("title", title)]).unwrap_or_default();
    format!("{}/action/og?{}", base_url.trim_end_matches('/'), query)
}

/// Client identity used to dedupe views: first hop of the forwarding
/// chain, else the platform's client ip header, else a fixed label for
/// direct local traffic.
fn client_identity(forwarded_for: Option<&str>, client_ip: Option<&str>) -> String {
    if let Some(forwarded) = forwarded_for {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    match client_ip {
        Some(ip) if !ip.trim().is_empty() => ip.trim().to_string(),
        _ => "local".to_string(),
    }
}

fn bearer_matches(authorization: Option<&str>, token: &str) -> bool {
    match authorization {
        Some(value) => value == format!("Bearer {}", token),
        None => false,
    }
}

/// What a refresh request asks for, decided before the handler touches
/// the cache.
#[derive(Debug, PartialEq)]
enum RefreshAction {
    DeleteKeys(Vec<String>),
    RefreshPaths(Vec<String>),
    None,
}

/// Reads the CI webhook body. `keys` wins when both fields are present,
/// non-string entries are skipped, anything else takes no action.
fn parse_refresh_body(body: &[u8]) -> (RefreshAction, Option<String>) {
    let Ok(body) = serde_json::from_slice::<serde_json::Value>(body) else {
        return (RefreshAction::None, None);
    };
    let commit_sha = body
        .get("commitSha")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    if let Some(keys) = body.get("keys").and_then(|v| v.as_array()) {
        let keys = keys
            .iter()
            .filter_map(|key| key.as_str().map(str::to_string))
            .collect();
        return (RefreshAction::DeleteKeys(keys), commit_sha);
    }
    if let Some(paths) = body.get("contentPaths").and_then(|v| v.as_array()) {
        let paths = paths
            .iter()
            .filter_map(|path| path.as_str().map(str::to_string))
            .collect();
        return (RefreshAction::RefreshPaths(paths), commit_sha);
    }
    (RefreshAction::None, commit_sha)
}

/// Maps a changed repository path to the slug it invalidates. Only
/// paths under the posts directory refresh anything.
fn refresh_slug(content_path: &str, posts_dir: &str) -> Option<String> {
    if !content_path.starts_with(posts_dir) {
        return None;
    }
    let mut segments = content_path.split('/');
    let dir = segments.next()?;
    let name = segments.next()?;
    if dir.is_empty() || name.is_empty() {
        return None;
    }
    let slug = name
        .strip_suffix(".mdx")
        .or_else(|| name.strip_suffix(".md"))
        .unwrap_or(name);
    Some(slug.to_string())
}

pub async fn server_run(config: Config) -> Result<()> {
    let db = Arc::new(CacheDb::open(&config.cache.database_path)?);
    let cluster = ClusterState::new(config.cluster.clone());
    let peers = PeerClient::new(config.auth.internal_token.clone());
    let cache = Arc::new(Cache::new(db.clone(), cluster, peers));
    let github = GithubClient::new(&config.github)?;
    let catalog = Catalog::new(cache.clone(), github, &config);
    let recorder = ViewRecorder::new(db);
    let og = OgRenderer::new(config.og.as_ref())?;

    let bind_addr = config.server.address.clone();
    let bind_port = config.server.port;
    let app_state = Arc::new(AppState {
        views: recorder.new_sender(),
        config,
        cache,
        catalog,
        og,
    });

    web::HttpServer::new(move || {
        web::App::new()
            .state(app_state.clone())
            .service(healthz)
            .service(post_list)
            .service(post_page)
            .service(post_view)
            .service(og_image)
            .service(cache_update)
            .service(refresh_cache)
            .service(refresh_commit_sha)
            .service(rss_feed)
    })
    .bind((bind_addr, bind_port))?
    .run()
    .await?;
    Ok(())
}
