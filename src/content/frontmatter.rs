//! YAML frontmatter parsing.
//!
//! Posts start with an optional block fenced by `---` lines. All
//! fields are optional on purpose: content is edited in the repository
//! without this server running, so a missing field must never make a
//! post unservable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Frontmatter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Publication date as written in the file, e.g. "2022-04-02".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub draft: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlisted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub social_image_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub social_image_pre_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translations: Option<Vec<Translation>>,
}

impl Frontmatter {
    pub fn is_draft(&self) -> bool {
        self.draft.unwrap_or(false)
    }

    pub fn is_unlisted(&self) -> bool {
        self.unlisted.unwrap_or(false)
    }
}

/// Page metadata for `<meta>` tags. Anything beyond keywords is kept
/// as-is and passed through to the client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
    pub language: String,
    pub link: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<TranslationAuthor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationAuthor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// Splits a source file into its frontmatter block and the body.
/// Returns no block when the file does not start with a `---` fence.
pub fn split(source: &str) -> (Option<&str>, &str) {
    let Some(after_fence) = source.strip_prefix("---") else {
        return (None, source);
    };
    let Some(rest) = after_fence
        .strip_prefix('\n')
        .or_else(|| after_fence.strip_prefix("\r\n"))
    else {
        return (None, source);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let block = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(block), body);
        }
        offset += line.len();
    }
    // An unterminated fence is treated as body text.
    (None, source)
}

/// Parses the frontmatter of a source file, returning it together with
/// the remaining body.
pub fn parse(source: &str) -> Result<(Frontmatter, &str), serde_yaml::Error> {
    match split(source) {
        (Some(block), body) if !block.trim().is_empty() => {
            let frontmatter = serde_yaml::from_str(block)?;
            Ok((frontmatter, body))
        }
        (_, body) => Ok((Frontmatter::default(), body)),
    }
}
