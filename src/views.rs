//! Page view counting.
//!
//! Views land in the cache database through a small channel so request
//! handlers never wait on the write. A client counts once per slug per
//! hour, reloads and back-and-forth navigation stay invisible.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use spdlog::{debug, error, info};
use tokio::sync::mpsc;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::cache::CacheDb;
use crate::error::Result;

fn timestamp(value: chrono::DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl CacheDb {
    /// Records a view unless the same client already viewed this slug
    /// within the last hour. Returns whether a row was written.
    pub fn record_view(&self, client_id: &str, slug: &str) -> Result<bool> {
        let now = Utc::now();
        let threshold = timestamp(now - chrono::Duration::hours(1));
        let conn = self.conn.lock().unwrap();

        let recent: Option<String> = conn
            .query_row(
                "SELECT id FROM views
                 WHERE client_id = ?1 AND slug = ?2 AND created_at >= ?3
                 LIMIT 1",
                params![client_id, slug, threshold],
                |row| row.get(0),
            )
            .optional()?;
        if recent.is_some() {
            return Ok(false);
        }

        conn.execute(
            "INSERT INTO views (id, client_id, slug, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().to_string(),
                client_id,
                slug,
                timestamp(now)
            ],
        )?;
        Ok(true)
    }

    pub fn views_for_slug(&self, slug: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM views WHERE slug = ?1",
            params![slug],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn views_by_slug(&self) -> Result<HashMap<String, i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT slug, COUNT(*) FROM views GROUP BY slug")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    }
}

pub struct ViewEvent {
    pub client_id: String,
    pub slug: String,
}

pub struct ViewRecorder {
    _receiver_task: JoinHandle<()>,
    sender: Sender<ViewEvent>,
}

impl ViewRecorder {
    pub fn new(db: Arc<CacheDb>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ViewEvent>(64);

        let receiver_task = tokio::spawn(async move {
            info!("Starting view recorder");
            while let Some(event) = rx.recv().await {
                match db.record_view(&event.client_id, &event.slug) {
                    Ok(true) => debug!("View recorded for {}", event.slug),
                    Ok(false) => debug!("View deduplicated for {}", event.slug),
                    Err(e) => error!("Error recording view for {}: {}", event.slug, e),
                }
            }
        });

        Self {
            _receiver_task: receiver_task,
            sender: tx,
        }
    }

    pub fn new_sender(&self) -> ViewSender {
        ViewSender {
            sender_ch: self.sender.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ViewSender {
    sender_ch: Sender<ViewEvent>,
}

impl ViewSender {
    pub async fn view(&self, client_id: String, slug: String) {
        if let Err(e) = self.sender_ch.send(ViewEvent { client_id, slug }).await {
            error!("Error queueing view event: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> CacheDb {
        CacheDb::open_in_memory().unwrap()
    }

    #[test]
    fn counts_once_per_client_per_hour() {
        let db = db();
        assert!(db.record_view("client-a", "/posts/caching").unwrap());
        assert!(!db.record_view("client-a", "/posts/caching").unwrap());
        assert_eq!(db.views_for_slug("/posts/caching").unwrap(), 1);

        assert!(db.record_view("client-b", "/posts/caching").unwrap());
        assert_eq!(db.views_for_slug("/posts/caching").unwrap(), 2);
    }

    #[test]
    fn same_client_counts_on_other_slugs() {
        let db = db();
        assert!(db.record_view("client-a", "/posts/one").unwrap());
        assert!(db.record_view("client-a", "/posts/two").unwrap());
    }

    #[test]
    fn views_older_than_the_window_do_not_dedupe() {
        let db = db();
        let old = timestamp(Utc::now() - chrono::Duration::hours(2));
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO views (id, client_id, slug, created_at) VALUES ('x', 'client-a', '/posts/caching', ?1)",
                params![old],
            )
            .unwrap();
        }

        assert!(db.record_view("client-a", "/posts/caching").unwrap());
        assert_eq!(db.views_for_slug("/posts/caching").unwrap(), 2);
    }

    #[test]
    fn unknown_slug_has_zero_views() {
        assert_eq!(db().views_for_slug("/posts/nope").unwrap(), 0);
    }

    #[test]
    fn views_by_slug_groups_counts() {
        let db = db();
        db.record_view("a", "/posts/one").unwrap();
        db.record_view("b", "/posts/one").unwrap();
        db.record_view("a", "/posts/two").unwrap();

        let counts = db.views_by_slug().unwrap();
        assert_eq!(counts.get("/posts/one"), Some(&2));
        assert_eq!(counts.get("/posts/two"), Some(&1));
        assert_eq!(counts.get("/posts/three"), None);
    }

    #[tokio::test]
    async fn recorder_writes_through_the_channel() {
        let db = Arc::new(CacheDb::open_in_memory().unwrap());
        let recorder = ViewRecorder::new(db.clone());
        let sender = recorder.new_sender();

        sender
            .view("client-a".to_string(), "/posts/caching".to_string())
            .await;

        let mut recorded = false;
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if db.views_for_slug("/posts/caching").unwrap() == 1 {
                recorded = true;
                break;
            }
        }
        assert!(recorded);
    }
}
