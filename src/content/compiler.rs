//! Markdown to HTML compilation for post bundles.
//!
//! Takes the downloaded file set of a post, finds its index file,
//! splits off the frontmatter and renders the body with GFM enabled.
//! Headings get stable ids and self-links so clients can deep-link
//! into sections.

use std::collections::HashMap;

use lazy_static::lazy_static;
use markdown::{CompileOptions, Options, ParseOptions};
use regex::Regex;
use spdlog::error;
use unidecode::unidecode;

use crate::content::{frontmatter, PostPage, ReadTime};
use crate::error::{Error, Result};
use crate::github::SourceFile;
use crate::text_utils;

const WORDS_PER_MINUTE: f64 = 200.0;

lazy_static! {
    static ref HEADING: Regex = Regex::new(r"(?s)<h([1-6])>(.*?)</h[1-6]>").unwrap();
    static ref TAG: Regex = Regex::new(r"<[^>]*>").unwrap();
}

/// Compiles the post rooted at `slug` from its downloaded files.
/// Returns `None` when the file set has no index file, which is how a
/// nonexistent post looks after download.
pub fn compile(slug: &str, files: &[SourceFile]) -> Result<Option<PostPage>> {
    let mdx_index = format!("{}/index.mdx", slug);
    let md_index = format!("{}/index.md", slug);
    let index_file = files
        .iter()
        .find(|file| file.path.ends_with(&mdx_index) || file.path.ends_with(&md_index));
    let Some(index_file) = index_file else {
        return Ok(None);
    };

    let (front, body) = frontmatter::parse(&index_file.content).map_err(|e| {
        error!("Compilation error for slug {}: {}", slug, e);
        Error::Compile {
            slug: slug.to_string(),
            reason: format!("frontmatter: {}", e),
        }
    })?;

    // Post bodies come from a trusted repository, inline HTML stays.
    let options = Options {
        parse: ParseOptions::gfm(),
        compile: CompileOptions {
            allow_dangerous_html: true,
            ..CompileOptions::gfm()
        },
    };
    let html = match markdown::to_html_with_options(body, &options) {
        Ok(html) => html,
        Err(e) => {
            error!("Compilation error for slug {}: {}", slug, e.reason);
            return Err(Error::Compile {
                slug: slug.to_string(),
                reason: e.reason.clone(),
            });
        }
    };
    let html = add_heading_anchors(&html);

    let date_display = front
        .date
        .as_deref()
        .and_then(text_utils::parse_post_date)
        .map(|date| text_utils::display_date(&date));

    Ok(Some(PostPage {
        html,
        slug: slug.to_string(),
        frontmatter: front,
        read_time: Some(reading_time(&index_file.content)),
        date_display,
    }))
}

/// Gives every heading an id derived from its text and appends a
/// `#` self-link. Repeated heading texts get `-1`, `-2`, ... suffixes.
pub fn add_heading_anchors(html: &str) -> String {
    let mut seen: HashMap<String, usize> = HashMap::new();
    HEADING
        .replace_all(html, |caps: &regex::Captures| {
            let level = &caps[1];
            let inner = &caps[2];
            let text = TAG.replace_all(inner, "");
            let base = slugify(text.trim());
            let id = match seen.get(&base) {
                Some(n) => format!("{}-{}", base, n),
                None => base.clone(),
            };
            *seen.entry(base).or_insert(0) += 1;
            format!(
                "<h{level} id=\"{id}\">{inner}<a href=\"#{id}\" aria-hidden=\"true\" tabindex=\"-1\" class=\"header-anchor\">#</a></h{level}>"
            )
        })
        .to_string()
}

/// ASCII slug for anchor ids: transliterated, lowercased, runs of
/// anything else collapsed to single dashes.
pub fn slugify(text: &str) -> String {
    let transliterated = unidecode(text).to_lowercase();
    let mut slug = String::with_capacity(transliterated.len());
    let mut last_dash = true;
    for c in transliterated.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "section".to_string()
    } else {
        slug
    }
}

pub fn reading_time(content: &str) -> ReadTime {
    let words = content.split_whitespace().count();
    let minutes = words as f64 / WORDS_PER_MINUTE;
    ReadTime {
        text: format!("{} min read", minutes.ceil() as i64),
        minutes,
        time: (minutes * 60_000.0).round() as i64,
        words,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_data::SAMPLE_POST;

    fn index_file(slug: &str, content: &str) -> SourceFile {
        SourceFile {
            path: format!("content/posts/{}/index.mdx", slug),
            content: content.to_string(),
        }
    }

    #[test]
    fn compiles_the_sample_post() {
        let files = vec![index_file("caching", SAMPLE_POST)];
        let page = compile("caching", &files).unwrap().unwrap();

        assert_eq!(page.slug, "caching");
        assert_eq!(
            page.frontmatter.title.as_deref(),
            Some("Caching all the things")
        );
        assert!(page.html.contains("<h1 id=\"caching-all-the-things\">"));
        assert!(page.html.contains("class=\"header-anchor\""));
        assert_eq!(page.date_display.as_deref(), Some("April 2, 2022"));
        assert!(page.read_time.unwrap().words > 0);
    }

    #[test]
    fn file_set_without_index_is_no_post() {
        let files = vec![SourceFile {
            path: "content/posts/caching/notes.txt".to_string(),
            content: "scratch".to_string(),
        }];
        assert!(compile("caching", &files).unwrap().is_none());
    }

    #[test]
    fn picks_the_index_among_attachments() {
        let files = vec![
            SourceFile {
                path: "content/posts/caching/data/numbers.csv".to_string(),
                content: "1,2".to_string(),
            },
            index_file("caching", "# Hi\n"),
        ];
        let page = compile("caching", &files).unwrap().unwrap();
        assert!(page.html.contains("Hi"));
    }

    #[test]
    fn md_index_works_too() {
        let files = vec![SourceFile {
            path: "content/posts/caching/index.md".to_string(),
            content: "# Hi\n".to_string(),
        }];
        assert!(compile("caching", &files).unwrap().is_some());
    }

    #[test]
    fn source_without_frontmatter_still_compiles() {
        let files = vec![index_file("plain", "# Plain\n\nNo metadata here.\n")];
        let page = compile("plain", &files).unwrap().unwrap();
        assert!(page.frontmatter.title.is_none());
        assert!(page.date_display.is_none());
        assert!(page.html.contains("<h1 id=\"plain\">"));
    }

    #[test]
    fn broken_frontmatter_is_a_compile_error() {
        let files = vec![index_file("broken", "---\ntitle: [unclosed\n---\n# Hi\n")];
        let err = compile("broken", &files).unwrap_err();
        assert!(matches!(err, Error::Compile { .. }));
    }

    #[test]
    fn unparseable_date_gets_no_display_date() {
        let files = vec![index_file("soon", "---\ndate: soon\n---\n# Hi\n")];
        let page = compile("soon", &files).unwrap().unwrap();
        assert!(page.date_display.is_none());
    }

    #[test]
    fn tables_render_with_gfm() {
        let files = vec![index_file(
            "table",
            "| a | b |\n| - | - |\n| 1 | 2 |\n",
        )];
        let page = compile("table", &files).unwrap().unwrap();
        assert!(page.html.contains("<table>"));
    }

    #[test]
    fn inline_html_passes_through() {
        let files = vec![index_file("html", "<div class=\"note\">hi</div>\n")];
        let page = compile("html", &files).unwrap().unwrap();
        assert!(page.html.contains("<div class=\"note\">hi</div>"));
    }

    #[test]
    fn heading_ids_are_deduplicated() {
        let html = add_heading_anchors("<h2>Same</h2><h2>Same</h2><h2>Same</h2>");
        assert!(html.contains("id=\"same\""));
        assert!(html.contains("id=\"same-1\""));
        assert!(html.contains("id=\"same-2\""));
    }

    #[test]
    fn heading_markup_is_kept_inside_the_anchor_target() {
        let html = add_heading_anchors("<h2>My <em>fancy</em> title</h2>");
        assert!(html.contains("<h2 id=\"my-fancy-title\">My <em>fancy</em> title<a href=\"#my-fancy-title\""));
    }

    #[test]
    fn slugify_transliterates_and_collapses() {
        assert_eq!(slugify("Über uns"), "uber-uns");
        assert_eq!(slugify("Hello,   world!"), "hello-world");
        assert_eq!(slugify("100% Rust"), "100-rust");
        assert_eq!(slugify("!!!"), "section");
    }

    #[test]
    fn reading_time_matches_two_hundred_wpm() {
        let words = vec!["word"; 400].join(" ");
        let rt = reading_time(&words);
        assert_eq!(rt.words, 400);
        assert_eq!(rt.minutes, 2.0);
        assert_eq!(rt.time, 120_000);
        assert_eq!(rt.text, "2 min read");
    }

    #[test]
    fn reading_time_rounds_up_for_display() {
        let rt = reading_time("just a few words here");
        assert_eq!(rt.text, "1 min read");
    }
}
