use serde::{Deserialize, Serialize};

use crate::content::frontmatter::Frontmatter;

pub mod compile_queue;
pub mod compiler;
pub mod frontmatter;

/// Reading time estimate for a post, calculated at 200 words per
/// minute over the raw source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadTime {
    /// Display string, e.g. "3 min read".
    pub text: String,
    pub minutes: f64,
    /// Reading time in milliseconds.
    pub time: i64,
    pub words: usize,
}

/// A fully compiled post: rendered HTML plus everything a client needs
/// to present it. This is the shape stored in the compile cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPage {
    pub html: String,
    pub slug: String,
    pub frontmatter: Frontmatter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_time: Option<ReadTime>,
    /// Publication date formatted for display, e.g. "April 2, 2022".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_display: Option<String>,
}
