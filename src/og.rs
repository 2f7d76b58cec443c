//! Social preview images.
//!
//! The image is an SVG template filled with the post title and
//! rasterized to PNG. Glyphs come from the system fonts plus an
//! optional configured font directory, so the binary ships no fonts
//! of its own.

use std::sync::Arc;

use ramhorns::Template;
use resvg::tiny_skia;
use resvg::usvg::{self, fontdb};

use crate::config;
use crate::error::{Error, Result};

const WIDTH: u32 = 1200;
const HEIGHT: u32 = 630;

/// Longest line before the title wraps. Sized for the 60px font.
const MAX_LINE_CHARS: usize = 26;
const MAX_LINES: usize = 3;

/// Baseline of a single centered title line.
const CENTER_BASELINE: i32 = 336;
const LINE_STEP: i32 = 76;

const OG_TEMPLATE: &str = r##"<svg width="1200" height="630" viewBox="0 0 1200 630" xmlns="http://www.w3.org/2000/svg">
  <rect width="1200" height="630" fill="#09090b"/>
  <rect x="40" y="40" width="1120" height="550" fill="none" stroke="#27272a" stroke-width="2" rx="16"/>
  {{#lines}}
  <text x="600" y="{{y}}" text-anchor="middle" font-family="sans-serif" font-size="60" font-weight="700" fill="#fafafa">{{text}}</text>
  {{/lines}}
  {{#label}}
  <text x="60" y="85" font-family="sans-serif" font-size="26" fill="#a1a1aa">{{label}}</text>
  {{/label}}
</svg>
"##;

#[derive(ramhorns::Content)]
struct OgImage {
    lines: Vec<TitleLine>,
    label: String,
}

#[derive(ramhorns::Content)]
struct TitleLine {
    y: i32,
    text: String,
}

pub struct OgRenderer {
    template: Template<'static>,
    fontdb: Arc<fontdb::Database>,
    label: String,
}

impl OgRenderer {
    pub fn new(og: Option<&config::Og>) -> Result<OgRenderer> {
        let template = Template::new(OG_TEMPLATE)
            .map_err(|e| Error::Image(format!("broken image template: {}", e)))?;

        let mut fontdb = fontdb::Database::new();
        fontdb.load_system_fonts();
        if let Some(dir) = og.and_then(|og| og.font_dir.as_ref()) {
            fontdb.load_fonts_dir(dir);
        }

        Ok(OgRenderer {
            template,
            fontdb: Arc::new(fontdb),
            label: og.and_then(|og| og.label.clone()).unwrap_or_default(),
        })
    }

    /// Renders the preview PNG for a post title.
    pub fn render(&self, title: &str) -> Result<Vec<u8>> {
        let lines = wrap_title(title);
        let first = CENTER_BASELINE - (lines.len() as i32 - 1) * LINE_STEP / 2;
        let image = OgImage {
            lines: lines
                .into_iter()
                .enumerate()
                .map(|(i, text)| TitleLine {
                    y: first + i as i32 * LINE_STEP,
                    text,
                })
                .collect(),
            label: self.label.clone(),
        };
        let svg = self.template.render(&image);

        let options = usvg::Options {
            fontdb: self.fontdb.clone(),
            ..usvg::Options::default()
        };
        let tree = usvg::Tree::from_str(&svg, &options)
            .map_err(|e| Error::Image(format!("unrenderable image: {}", e)))?;
        let mut pixmap = tiny_skia::Pixmap::new(WIDTH, HEIGHT)
            .ok_or_else(|| Error::Image("could not allocate the canvas".to_string()))?;
        resvg::render(&tree, tiny_skia::Transform::default(), &mut pixmap.as_mut());
        pixmap
            .encode_png()
            .map_err(|e| Error::Image(format!("png encoding failed: {}", e)))
    }
}

/// Greedy word wrap of the title, capped at three lines. A truncated
/// title gets an ellipsis, a single overlong word is left unbroken.
fn wrap_title(title: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    let mut current = String::new();
    for word in title.split_whitespace() {
        let joined = if current.is_empty() {
            word.chars().count()
        } else {
            current.chars().count() + 1 + word.chars().count()
        };
        if joined > MAX_LINE_CHARS && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push("Untitled".to_string());
    }
    if lines.len() > MAX_LINES {
        lines.truncate(MAX_LINES);
        if let Some(last) = lines.last_mut() {
            last.push('…');
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    fn renderer() -> OgRenderer {
        OgRenderer::new(Some(&config::Og {
            label: Some("blog.example.com".to_string()),
            font_dir: None,
        }))
        .unwrap()
    }

    #[test]
    fn renders_a_png() {
        let png = renderer().render("Caching all the things").unwrap();
        assert_eq!(&png[..8], &PNG_MAGIC);
    }

    #[test]
    fn svg_carries_title_and_label() {
        let renderer = renderer();
        let image = OgImage {
            lines: vec![TitleLine {
                y: CENTER_BASELINE,
                text: "Caching all the things".to_string(),
            }],
            label: renderer.label.clone(),
        };
        let svg = renderer.template.render(&image);
        assert!(svg.contains("Caching all the things"));
        assert!(svg.contains("blog.example.com"));
    }

    #[test]
    fn label_is_anchored_in_the_top_left_corner() {
        let renderer = renderer();
        let image = OgImage {
            lines: vec![],
            label: "blog.example.com".to_string(),
        };
        let svg = renderer.template.render(&image);
        let label_line = svg
            .lines()
            .find(|line| line.contains("blog.example.com"))
            .unwrap();
        assert!(label_line.contains(r#"x="60" y="85""#));
        assert!(!label_line.contains("text-anchor"));
    }

    #[test]
    fn markup_in_the_title_is_escaped() {
        let renderer = renderer();
        let image = OgImage {
            lines: vec![TitleLine {
                y: CENTER_BASELINE,
                text: "<script>alert(1)</script>".to_string(),
            }],
            label: String::new(),
        };
        let svg = renderer.template.render(&image);
        assert!(!svg.contains("<script>"));
        assert!(svg.contains("&lt;script&gt;"));
    }

    #[test]
    fn short_title_stays_on_one_line() {
        assert_eq!(wrap_title("Short title"), vec!["Short title"]);
    }

    #[test]
    fn long_title_wraps_at_word_boundaries() {
        let lines = wrap_title("A fairly long post title that needs wrapping");
        assert!(lines.len() > 1);
        assert!(lines.iter().all(|l| l.chars().count() <= MAX_LINE_CHARS));
        assert_eq!(
            lines.join(" "),
            "A fairly long post title that needs wrapping"
        );
    }

    #[test]
    fn overlong_title_is_cut_with_an_ellipsis() {
        let word = "word ".repeat(40);
        let lines = wrap_title(&word);
        assert_eq!(lines.len(), MAX_LINES);
        assert!(lines.last().unwrap().ends_with('…'));
    }

    #[test]
    fn empty_title_becomes_a_placeholder() {
        assert_eq!(wrap_title("  "), vec!["Untitled"]);
    }
}
