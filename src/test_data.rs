#[cfg(test)]
pub const FULL_CONFIG: &str = r#"
[server]
address = "0.0.0.0"
port = 8080

[site]
base_url = "https://blog.example.com"
title = "Example blog"

[github]
owner = "octocat"
repo = "blog-content"
branch = "main"

[cache]
database_path = "./cache.db"

[auth]
internal_token = "internal-secret"
refresh_token = "refresh-secret"

[cluster]
sentinel_dir = "/litefs/data"
internal_url_pattern = "http://{hostname}.vm.blog.internal:8080"

[content]
root = "content"
posts_dir = "posts"
show_drafts = false

[log]
level = "Info"
log_to_console = true

[og]
label = "blog.example.com"

[rss_feed]
title = "Example blog"
site_url = "https://blog.example.com"
description = "Posts from the example blog"
page_size = 20
"#;

#[cfg(test)]
pub const SAMPLE_POST: &str = "---
title: Caching all the things
date: 2022-04-02
description: How this blog answers from SQLite instead of the contents API.
categories:
  - rust
  - caching
meta:
  keywords:
    - cache
    - sqlite
---

# Caching all the things

Every page on this blog is compiled from markdown that lives in a
separate repository. Fetching and compiling on every request would be
slow and would burn through the API rate limit in an afternoon, so the
server keeps every intermediate step in a local SQLite database.

A cached value carries the time it was created and two windows. Inside
the first window it is fresh and served as is. Inside the second it is
stale: still served, while a background task fetches a new version for
the next reader. Only past both windows does a request have to wait.

<!-- more -->

## Revalidating without a stampede

When many readers hit a stale key at once, only one of them should pay
for the refresh. A per-key lock collapses the herd: the first request
takes the lock and fetches, everyone else is answered from the stale
value that is still perfectly good.

The interesting part is what happens when the refresh fails. Throwing
away a stale value because the upstream had a bad minute would make
things worse, so a failed refresh falls back to whatever is still
inside the window.
";
