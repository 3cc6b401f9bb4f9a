//! Article extraction from rendered HTML.
//!
//! Turns a serialized DOM into an [`ExtractedPost`]: metadata, normalized
//! plain text, and every outbound link with a window of its surrounding
//! text. Each metadata field is resolved from an ordered list of candidate
//! functions (`fn(&Html) -> Option<T>`), evaluated until one yields a
//! value, with a fixed default as the last resort.
//!
//! A page without a recognizable article body is an expected outcome and
//! is reported as [`ExtractError`], never a panic; the pipeline skips the
//! item and moves on.

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use url::Url;

use crate::config::SourceConfig;
use crate::models::{parse_date, ExtractedLink, ExtractedPost};

/// Maximum characters of block text kept as link context.
pub const LINK_CONTEXT_CHARS: usize = 200;

/// Article root selectors, most specific first.
const ARTICLE_ROOTS: &[&str] = &[
    "div.available-content",
    "article",
    ".post-content",
    ".body",
    "main",
];

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "figcaption",
    "figure", "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav",
    "ol", "p", "pre", "section", "table", "td", "th", "tr", "ul",
];

const SKIPPED_TAGS: &[&str] = &["script", "style", "noscript", "template", "svg"];

type Candidate<T> = fn(&Html) -> Option<T>;

const TITLE_CANDIDATES: &[Candidate<String>] = &[title_post_title, title_h1, title_og_meta];
const SUBTITLE_CANDIDATES: &[Candidate<String>] = &[subtitle_class];
const AUTHOR_CANDIDATES: &[Candidate<String>] =
    &[author_name_class, author_class_link, author_meta];
const DATE_CANDIDATES: &[Candidate<DateTime<Utc>>] = &[date_time_attr, date_time_text, date_meta];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no article body found in {url}")]
    NoArticleRoot { url: String },
    #[error("article body in {url} contains no text")]
    EmptyArticle { url: String },
}

/// Configured HTML extractor for one source.
#[derive(Debug, Clone)]
pub struct Extractor {
    default_author: String,
    exclude: GlobSet,
}

impl Extractor {
    /// Build an extractor with a fallback author and link exclusion globs.
    pub fn new(default_author: &str, exclude_patterns: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in exclude_patterns {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            default_author: default_author.to_string(),
            exclude: builder.build()?,
        })
    }

    pub fn for_source(source: &SourceConfig) -> anyhow::Result<Self> {
        let extractor = Self::new(&source.default_author, &source.exclude_links)?;
        Ok(extractor)
    }

    /// Extract an article from rendered HTML fetched from `source_url`.
    pub fn extract(&self, html: &str, source_url: &str) -> Result<ExtractedPost, ExtractError> {
        let doc = Html::parse_document(html);

        let root = find_article_root(&doc).ok_or_else(|| ExtractError::NoArticleRoot {
            url: source_url.to_string(),
        })?;

        let plain_text = element_text(root);
        if plain_text.is_empty() {
            return Err(ExtractError::EmptyArticle {
                url: source_url.to_string(),
            });
        }

        let base = Url::parse(source_url).ok();
        let links = self.extract_links(root, base.as_ref());

        Ok(ExtractedPost {
            title: first_of(&doc, TITLE_CANDIDATES).unwrap_or_default(),
            subtitle: first_of(&doc, SUBTITLE_CANDIDATES).unwrap_or_default(),
            author: first_of(&doc, AUTHOR_CANDIDATES)
                .unwrap_or_else(|| self.default_author.clone()),
            published_at: first_of(&doc, DATE_CANDIDATES).unwrap_or_else(Utc::now),
            canonical_url: source_url.to_string(),
            slug: slug_from_url(source_url),
            plain_text,
            raw_article_html: root.inner_html(),
            links,
        })
    }

    fn extract_links(&self, root: ElementRef<'_>, base: Option<&Url>) -> Vec<ExtractedLink> {
        let Ok(anchors) = Selector::parse("a[href]") else {
            return Vec::new();
        };

        root.select(&anchors)
            .filter_map(|anchor| {
                let href = anchor.value().attr("href")?.trim();
                if href.is_empty() || href.starts_with('#') {
                    return None;
                }
                let target = resolve_href(base, href);
                if self.exclude.is_match(&target) || self.exclude.is_match(href) {
                    return None;
                }
                Some(ExtractedLink {
                    anchor_text: element_text(anchor),
                    target_url: target,
                    surrounding_context: link_context(anchor),
                })
            })
            .collect()
    }
}

fn first_of<T>(doc: &Html, candidates: &[Candidate<T>]) -> Option<T> {
    candidates.iter().find_map(|candidate| candidate(doc))
}

fn find_article_root(doc: &Html) -> Option<ElementRef<'_>> {
    ARTICLE_ROOTS.iter().find_map(|css| {
        let selector = Selector::parse(css).ok()?;
        doc.select(&selector).next()
    })
}

fn select_text(doc: &Html, css: &str) -> Option<String> {
    let selector = Selector::parse(css).ok()?;
    doc.select(&selector)
        .map(element_text)
        .find(|text| !text.is_empty())
}

fn select_attr(doc: &Html, css: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(css).ok()?;
    doc.select(&selector)
        .filter_map(|el| el.value().attr(attr))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn title_post_title(doc: &Html) -> Option<String> {
    select_text(doc, "h1.post-title")
}

fn title_h1(doc: &Html) -> Option<String> {
    select_text(doc, "h1")
}

fn title_og_meta(doc: &Html) -> Option<String> {
    select_attr(doc, "meta[property='og:title']", "content")
}

fn subtitle_class(doc: &Html) -> Option<String> {
    select_text(doc, ".subtitle")
}

fn author_name_class(doc: &Html) -> Option<String> {
    select_text(doc, ".author-name")
}

fn author_class_link(doc: &Html) -> Option<String> {
    select_text(doc, "[class*='author'] a")
}

fn author_meta(doc: &Html) -> Option<String> {
    select_attr(doc, "meta[name='author']", "content")
}

fn date_time_attr(doc: &Html) -> Option<DateTime<Utc>> {
    parse_date(&select_attr(doc, "time[datetime]", "datetime")?)
}

fn date_time_text(doc: &Html) -> Option<DateTime<Utc>> {
    parse_date(&select_text(doc, "time")?)
}

fn date_meta(doc: &Html) -> Option<DateTime<Utc>> {
    parse_date(&select_attr(
        doc,
        "meta[property='article:published_time']",
        "content",
    )?)
}

fn is_block(name: &str) -> bool {
    BLOCK_TAGS.contains(&name)
}

/// Visible text of an element with block boundaries kept as spaces and
/// whitespace runs collapsed.
fn element_text(element: ElementRef<'_>) -> String {
    let mut raw = String::new();
    collect_text(element, &mut raw);
    normalize_whitespace(&raw)
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            continue;
        }
        let Some(child_el) = ElementRef::wrap(child) else {
            continue;
        };
        let name = child_el.value().name();
        if SKIPPED_TAGS.contains(&name) {
            continue;
        }
        let block = is_block(name);
        if block {
            out.push(' ');
        }
        collect_text(child_el, out);
        if block {
            out.push(' ');
        }
    }
}

/// Collapse every whitespace run to a single space and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text of the nearest block-level ancestor, bounded to
/// [`LINK_CONTEXT_CHARS`] characters.
fn link_context(anchor: ElementRef<'_>) -> String {
    let block = anchor
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| is_block(el.value().name()));
    match block {
        Some(el) => element_text(el).chars().take(LINK_CONTEXT_CHARS).collect(),
        None => String::new(),
    }
}

fn resolve_href(base: Option<&Url>, href: &str) -> String {
    match base.map(|b| b.join(href)) {
        Some(Ok(url)) => url.to_string(),
        _ => href.to_string(),
    }
}

/// Last non-empty path segment of a URL, without a trailing `.html`.
pub fn slug_from_url(url: &str) -> String {
    let segment = match Url::parse(url) {
        Ok(parsed) => parsed
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string)
            .unwrap_or_default(),
        Err(_) => url
            .split('/')
            .filter(|s| !s.is_empty())
            .last()
            .unwrap_or_default()
            .to_string(),
    };
    segment.trim_end_matches(".html").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PAGE: &str = r##"<html><head>
<meta property="og:title" content="OG Title">
<script>var tracking = "ignore me";</script>
</head><body>
<nav><a href="https://example.substack.com/subscribe">Subscribe</a></nav>
<h1 class="post-title">  The   Real Title </h1>
<h3 class="subtitle">A subtitle</h3>
<div class="byline"><span class="author-name">Jane Writer</span></div>
<time datetime="2025-01-07T14:00:00.000Z">Jan 7</time>
<article>
  <div class="available-content">
    <p>First paragraph cites <a href="https://research.example/paper">the paper</a> directly.</p>
    <p>Second<br>line with <a href="/p/older-post">an older post</a>.</p>
    <p><a href="#footnote-1">1</a> and <a href="">empty</a>
       and <a href="https://example.substack.com/subscribe?utm=x">Subscribe now</a></p>
    <style>.x { color: red }</style>
  </div>
</article>
</body></html>"##;

    fn extractor() -> Extractor {
        Extractor::new("Nate", &["*substack.com/subscribe*".to_string()]).unwrap()
    }

    #[test]
    fn test_extracts_metadata() {
        let post = extractor()
            .extract(PAGE, "https://example.substack.com/p/the-real-title")
            .unwrap();
        assert_eq!(post.title, "The Real Title");
        assert_eq!(post.subtitle, "A subtitle");
        assert_eq!(post.author, "Jane Writer");
        assert_eq!(post.published_at.to_rfc3339(), "2025-01-07T14:00:00+00:00");
        assert_eq!(post.slug, "the-real-title");
        assert_eq!(post.canonical_url, "https://example.substack.com/p/the-real-title");
    }

    #[test]
    fn test_plain_text_is_normalized() {
        let post = extractor()
            .extract(PAGE, "https://example.substack.com/p/the-real-title")
            .unwrap();
        assert!(post.plain_text.starts_with("First paragraph cites the paper directly."));
        assert!(post.plain_text.contains("Second line with an older post."));
        assert!(!post.plain_text.contains("color: red"));
        assert!(!post.plain_text.contains("  "));
        assert!(post.raw_article_html.contains("<p>"));
    }

    #[test]
    fn test_links_filtered_and_resolved() {
        let post = extractor()
            .extract(PAGE, "https://example.substack.com/p/the-real-title")
            .unwrap();
        let urls: Vec<&str> = post.links.iter().map(|l| l.target_url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://research.example/paper",
                "https://example.substack.com/p/older-post",
            ]
        );
        assert_eq!(post.links[0].anchor_text, "the paper");
        assert_eq!(
            post.links[0].surrounding_context,
            "First paragraph cites the paper directly."
        );
    }

    #[test]
    fn test_link_context_is_bounded() {
        let long = "word ".repeat(200);
        let html = format!(
            "<article><p>{} <a href=\"https://x.example\">x</a></p></article>",
            long
        );
        let post = extractor().extract(&html, "https://a.example/p/x").unwrap();
        assert_eq!(post.links[0].surrounding_context.chars().count(), LINK_CONTEXT_CHARS);
    }

    #[test]
    fn test_fallbacks_when_metadata_missing() {
        let html = "<html><body><div class=\"post-content\"><p>Just text.</p></div></body></html>";
        let before = Utc::now();
        let post = extractor().extract(html, "https://a.example/p/bare.html").unwrap();
        assert_eq!(post.title, "");
        assert_eq!(post.subtitle, "");
        assert_eq!(post.author, "Nate");
        assert!(post.published_at >= before);
        assert_eq!(post.slug, "bare");
        assert_eq!(post.plain_text, "Just text.");
    }

    #[test]
    fn test_title_falls_back_to_og_meta() {
        let html = r#"<html><head><meta property="og:title" content="From Meta"></head>
<body><article><p>Body</p></article></body></html>"#;
        let post = extractor().extract(html, "https://a.example/p/m").unwrap();
        assert_eq!(post.title, "From Meta");
    }

    #[test]
    fn test_missing_article_root_is_error() {
        let html = "<html><body><div class=\"sidebar\">nav</div></body></html>";
        let err = extractor().extract(html, "https://a.example/p/x").unwrap_err();
        assert_eq!(
            err,
            ExtractError::NoArticleRoot {
                url: "https://a.example/p/x".into()
            }
        );
    }

    #[test]
    fn test_subtitle_only_from_subtitle_class() {
        let html = r#"<html><body><h1>T</h1><h2 class="subtitle">Sub line</h2>
<article><h2>Section heading</h2><p>Body.</p></article></body></html>"#;
        let post = extractor().extract(html, "https://a.example/p/x").unwrap();
        assert_eq!(post.subtitle, "Sub line");

        let html = r#"<html><body><h2>Not a subtitle</h2>
<article><p>Body.</p></article></body></html>"#;
        let post = extractor().extract(html, "https://a.example/p/x").unwrap();
        assert_eq!(post.subtitle, "");
    }

    #[test]
    fn test_empty_article_is_error() {
        let html = "<html><body><article>   </article></body></html>";
        let err = extractor().extract(html, "https://a.example/p/x").unwrap_err();
        assert!(matches!(err, ExtractError::EmptyArticle { .. }));
    }

    #[test]
    fn test_slug_from_url() {
        assert_eq!(slug_from_url("https://a.example/p/my-post"), "my-post");
        assert_eq!(slug_from_url("https://a.example/p/my-post/"), "my-post");
        assert_eq!(slug_from_url("https://a.example/2024/post.html?x=1"), "post");
        assert_eq!(slug_from_url("not a url/with/slug"), "slug");
    }
}
