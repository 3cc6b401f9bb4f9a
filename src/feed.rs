//! Feed fetching, parsing, and reconciliation against the ledger.
//!
//! The feed is fetched once per run over plain HTTP (no browser). Both RSS
//! 2.0 `<item>` and Atom `<entry>` documents are understood, including
//! CDATA-wrapped fields and the `dc:creator` extension. Reconciliation
//! drops entries whose identity is already recorded as synced, unless the
//! run is forced.

use std::collections::HashSet;
use std::time::Duration;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, USER_AGENT};
use thiserror::Error;

use crate::config::{SourceConfig, SyncConfig};
use crate::models::FeedItem;

const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("feed request timed out after {0}s")]
    Timeout(u64),
    #[error("feed returned HTTP {0}")]
    HttpStatus(u16),
    #[error("feed rate limited after {0} retries")]
    RateLimited(u32),
    #[error("invalid feed header: {0}")]
    InvalidHeader(String),
}

/// HTTP client for feed documents with bounded retry on 429 and 5xx.
///
/// The timeout bounds each attempt as a whole, body included.
pub struct FeedClient {
    http: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl FeedClient {
    pub fn new(timeout: Duration, max_retries: u32) -> Result<Self, FeedError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            timeout,
            max_retries,
            backoff: Duration::from_secs(1),
        })
    }

    pub fn from_config(sync: &SyncConfig) -> Result<Self, FeedError> {
        Self::new(
            Duration::from_secs(sync.feed_timeout_secs),
            sync.feed_max_retries,
        )
    }

    /// Base delay for the exponential backoff (doubles per retry).
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Doubles per retry, capped at 32x the base delay.
    fn backoff_delay(&self, retry_count: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << retry_count.min(5))
    }

    /// Fetch the raw feed document.
    pub async fn fetch(&self, url: &str, headers: HeaderMap) -> Result<String, FeedError> {
        let mut retry_count = 0u32;

        loop {
            let attempt = async {
                let response = self.http.get(url).headers(headers.clone()).send().await?;
                let status = response.status();
                let body = if status.is_success() {
                    Some(response.text().await?)
                } else {
                    None
                };
                Ok::<_, reqwest::Error>((status, body))
            };
            let (status, body) = tokio::time::timeout(self.timeout, attempt)
                .await
                .map_err(|_| FeedError::Timeout(self.timeout.as_secs()))??;

            let retryable =
                status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error();

            if retryable {
                if retry_count >= self.max_retries {
                    return Err(if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        FeedError::RateLimited(retry_count)
                    } else {
                        FeedError::HttpStatus(status.as_u16())
                    });
                }
                let delay = self.backoff_delay(retry_count);
                tracing::warn!(
                    feed = %url,
                    status = %status,
                    retry = retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Feed fetch failed, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            return body.ok_or(FeedError::HttpStatus(status.as_u16()));
        }
    }

    /// Fetch and parse the feed in one step.
    pub async fn fetch_items(
        &self,
        url: &str,
        headers: HeaderMap,
    ) -> Result<Vec<FeedItem>, FeedError> {
        let body = self.fetch(url, headers).await?;
        let items = parse_feed(&body);
        tracing::debug!(feed = %url, items = items.len(), "Parsed feed");
        Ok(items)
    }
}

/// Request headers for a source's feed, including the session cookie when
/// `cookie_env` names a non-empty environment variable.
pub fn build_feed_headers(source: &SourceConfig) -> Result<HeaderMap, FeedError> {
    let mut headers = HeaderMap::new();
    let agent = format!("postsync/{} (+feed sync)", env!("CARGO_PKG_VERSION"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&agent).map_err(|e| FeedError::InvalidHeader(e.to_string()))?,
    );
    headers.insert(ACCEPT, HeaderValue::from_static(FEED_ACCEPT));

    if let Some(var) = &source.cookie_env {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => {
                let cookie = format!("{}={}", source.cookie_name, value.trim());
                let mut header = HeaderValue::from_str(&cookie)
                    .map_err(|e| FeedError::InvalidHeader(e.to_string()))?;
                header.set_sensitive(true);
                headers.insert(COOKIE, header);
            }
            _ => {
                tracing::warn!(env = %var, "Cookie variable unset; fetching public feed only");
            }
        }
    }

    Ok(headers)
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Title,
    Link,
    Guid,
    Published,
    Updated,
    Creator,
    AuthorName,
    AuthorText,
}

/// Parse an RSS or Atom document into feed items in document order.
///
/// Entries missing both `guid`/`id` and `link` are dropped. A malformed
/// document yields whatever was parsed before the error.
pub fn parse_feed(xml: &str) -> Vec<FeedItem> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut current: Option<FeedItem> = None;
    let mut updated = String::new();
    let mut author_text = String::new();
    let mut field: Option<Field> = None;
    let mut in_author = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                match name.as_ref() {
                    b"item" | b"entry" => {
                        current = Some(FeedItem::default());
                        updated.clear();
                        author_text.clear();
                        field = None;
                    }
                    _ if current.is_none() => {}
                    b"author" => {
                        in_author = true;
                        field = Some(Field::AuthorText);
                    }
                    b"link" => {
                        if let Some(item) = current.as_mut() {
                            take_atom_link(&e, item);
                        }
                        field = Some(Field::Link);
                    }
                    other => field = field_for(other, in_author),
                }
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"link" {
                    if let Some(item) = current.as_mut() {
                        take_atom_link(&e, item);
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(item), Some(f)) = (current.as_mut(), field) {
                    let text = match t.unescape() {
                        Ok(s) => s.into_owned(),
                        Err(_) => String::from_utf8_lossy(&t).into_owned(),
                    };
                    append_field(item, (&mut updated, &mut author_text), f, &text);
                }
            }
            Ok(Event::CData(c)) => {
                if let (Some(item), Some(f)) = (current.as_mut(), field) {
                    append_field(
                        item,
                        (&mut updated, &mut author_text),
                        f,
                        &String::from_utf8_lossy(&c),
                    );
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"item" | b"entry" => {
                    if let Some(mut item) = current.take() {
                        finish_item(&mut item, &updated, &author_text);
                        if !item.identity().is_empty() {
                            items.push(item);
                        }
                    }
                    field = None;
                    in_author = false;
                }
                b"author" => {
                    in_author = false;
                    field = None;
                }
                _ => field = None,
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::warn!(
                    position = reader.buffer_position(),
                    error = %e,
                    "Malformed feed document; keeping entries parsed so far"
                );
                break;
            }
            _ => {}
        }
    }

    items
}

fn field_for(name: &[u8], in_author: bool) -> Option<Field> {
    match name {
        b"title" => Some(Field::Title),
        b"guid" | b"id" => Some(Field::Guid),
        b"pubDate" | b"published" | b"date" => Some(Field::Published),
        b"updated" => Some(Field::Updated),
        b"creator" => Some(Field::Creator),
        b"name" if in_author => Some(Field::AuthorName),
        _ => None,
    }
}

/// Atom `<link href="..." rel="alternate"/>`; other rels are ignored.
fn take_atom_link(e: &BytesStart<'_>, item: &mut FeedItem) {
    let mut href = None;
    let mut rel = None;
    for attr in e.attributes().flatten() {
        let value = attr
            .unescape_value()
            .map(|v| v.into_owned())
            .unwrap_or_default();
        match attr.key.local_name().as_ref() {
            b"href" => href = Some(value),
            b"rel" => rel = Some(value),
            _ => {}
        }
    }
    if let Some(href) = href {
        let alternate = rel.as_deref().map_or(true, |r| r == "alternate");
        if alternate && item.link.is_empty() {
            item.link = href;
        }
    }
}

fn append_field(
    item: &mut FeedItem,
    (updated, author_text): (&mut String, &mut String),
    field: Field,
    text: &str,
) {
    let target = match field {
        Field::Title => &mut item.title,
        Field::Link => &mut item.link,
        Field::Guid => &mut item.guid,
        Field::Published => &mut item.published_at,
        Field::Updated => updated,
        Field::Creator | Field::AuthorName => &mut item.creator,
        // RSS <author> holds an email; only a fallback for dc:creator.
        Field::AuthorText => author_text,
    };
    target.push_str(text);
}

fn finish_item(item: &mut FeedItem, updated: &str, author_text: &str) {
    item.title = item.title.trim().to_string();
    item.link = item.link.trim().to_string();
    item.guid = item.guid.trim().to_string();
    item.creator = item.creator.trim().to_string();
    item.published_at = item.published_at.trim().to_string();
    if item.published_at.is_empty() {
        item.published_at = updated.trim().to_string();
    }
    if item.creator.is_empty() {
        item.creator = author_text.trim().to_string();
    }
}

/// Drop repeated identities, keeping the first occurrence.
pub fn dedupe(items: Vec<FeedItem>) -> Vec<FeedItem> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.identity().to_string()))
        .collect()
}

/// Items that still need ingesting, in feed order.
///
/// Duplicates in the feed collapse to one entry. With `force`, the
/// ledger is ignored and every unique item is returned.
pub fn reconcile(items: Vec<FeedItem>, synced: &HashSet<String>, force: bool) -> Vec<FeedItem> {
    let unique = dedupe(items);
    if force {
        return unique;
    }
    unique
        .into_iter()
        .filter(|item| !synced.contains(item.identity()))
        .collect()
}

/// Apply an optional `--limit` after reconciliation.
pub fn limit(mut items: Vec<FeedItem>, max: Option<usize>) -> Vec<FeedItem> {
    if let Some(n) = max {
        items.truncate(n);
    }
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
<channel>
  <title>Channel Title</title>
  <item>
    <title><![CDATA[First & Foremost]]></title>
    <link>https://example.substack.com/p/first</link>
    <guid isPermaLink="false">guid-1</guid>
    <pubDate>Tue, 07 Jan 2025 14:00:00 GMT</pubDate>
    <dc:creator><![CDATA[Jane Writer]]></dc:creator>
    <description><![CDATA[<p>ignored</p>]]></description>
  </item>
  <item>
    <title>Second &amp; Last</title>
    <link>https://example.substack.com/p/second</link>
  </item>
  <item>
    <title>No identity</title>
  </item>
</channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Feed</title>
  <entry>
    <title>Atom Post</title>
    <link rel="self" href="https://example.com/self"/>
    <link rel="alternate" href="https://example.com/p/atom-post"/>
    <id>urn:uuid:1234</id>
    <updated>2025-02-01T10:00:00Z</updated>
    <author><name>Sam Author</name></author>
  </entry>
</feed>"#;

    fn item(guid: &str, link: &str) -> FeedItem {
        FeedItem {
            title: guid.to_string(),
            link: link.to_string(),
            guid: guid.to_string(),
            ..FeedItem::default()
        }
    }

    #[test]
    fn test_parse_rss_items() {
        let items = parse_feed(RSS);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "First & Foremost");
        assert_eq!(items[0].guid, "guid-1");
        assert_eq!(items[0].creator, "Jane Writer");
        assert_eq!(items[0].published_at, "Tue, 07 Jan 2025 14:00:00 GMT");
        assert_eq!(items[1].title, "Second & Last");
        assert_eq!(items[1].guid, "");
        assert_eq!(items[1].identity(), "https://example.substack.com/p/second");
    }

    #[test]
    fn test_parse_atom_entries() {
        let items = parse_feed(ATOM);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Atom Post");
        assert_eq!(items[0].link, "https://example.com/p/atom-post");
        assert_eq!(items[0].guid, "urn:uuid:1234");
        assert_eq!(items[0].published_at, "2025-02-01T10:00:00Z");
        assert_eq!(items[0].creator, "Sam Author");
    }

    #[test]
    fn test_parse_garbage_is_empty() {
        assert!(parse_feed("this is not xml at all").is_empty());
        assert!(parse_feed("").is_empty());
    }

    #[test]
    fn test_reconcile_skips_synced_and_dedupes() {
        let items = vec![
            item("a", "https://x/a"),
            item("b", "https://x/b"),
            item("a", "https://x/a-dup"),
            item("c", "https://x/c"),
        ];
        let synced: HashSet<String> = ["b".to_string()].into_iter().collect();

        let pending = reconcile(items.clone(), &synced, false);
        let ids: Vec<&str> = pending.iter().map(|i| i.identity()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(pending[0].link, "https://x/a");

        let forced = reconcile(items, &synced, true);
        let ids: Vec<&str> = forced.iter().map(|i| i.identity()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_reconcile_empty_feed() {
        assert!(reconcile(Vec::new(), &HashSet::new(), false).is_empty());
    }

    #[test]
    fn test_limit() {
        let items = vec![item("a", ""), item("b", ""), item("c", "")];
        assert_eq!(limit(items.clone(), Some(2)).len(), 2);
        assert_eq!(limit(items.clone(), None).len(), 3);
        assert_eq!(limit(items, Some(10)).len(), 3);
    }

    #[test]
    fn test_headers_include_cookie_from_env() {
        std::env::set_var("POSTSYNC_TEST_FEED_COOKIE", "s%3Aabc");
        let source = SourceConfig {
            feed_url: "https://example.substack.com/feed".into(),
            namespace: "nate".into(),
            tag: None,
            default_author: "Nate".into(),
            cookie_env: Some("POSTSYNC_TEST_FEED_COOKIE".into()),
            cookie_name: "substack.sid".into(),
            exclude_links: vec![],
        };
        let headers = build_feed_headers(&source).unwrap();
        assert_eq!(headers[COOKIE], "substack.sid=s%3Aabc");
        assert!(headers[ACCEPT].to_str().unwrap().contains("application/rss+xml"));
        assert!(headers[USER_AGENT].to_str().unwrap().starts_with("postsync/"));
    }

    #[tokio::test]
    async fn test_fetch_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(FEED_ACCEPT));
        let client = FeedClient::new(Duration::from_secs(5), 2)
            .unwrap()
            .with_backoff(Duration::from_millis(10));
        let items = client
            .fetch_items(&format!("{}/feed", server.uri()), headers)
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_client_error_fails_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let client = FeedClient::new(Duration::from_secs(5), 3)
            .unwrap()
            .with_backoff(Duration::from_millis(10));
        let err = client
            .fetch(&format!("{}/feed", server.uri()), HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_fetch_rate_limited_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let client = FeedClient::new(Duration::from_secs(5), 2)
            .unwrap()
            .with_backoff(Duration::from_millis(5));
        let err = client
            .fetch(&format!("{}/feed", server.uri()), HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::RateLimited(2)));
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let client = FeedClient::new(Duration::from_secs(5), u32::MAX)
            .unwrap()
            .with_backoff(Duration::from_millis(100));
        assert_eq!(client.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(client.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(client.backoff_delay(5), Duration::from_millis(3200));
        assert_eq!(client.backoff_delay(40), Duration::from_millis(3200));
        assert_eq!(client.backoff_delay(u32::MAX), Duration::from_millis(3200));

        let huge = FeedClient::new(Duration::from_secs(5), 1)
            .unwrap()
            .with_backoff(Duration::MAX);
        assert_eq!(huge.backoff_delay(5), Duration::MAX);
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        use tokio::io::AsyncWriteExt;

        // Headers arrive promptly; the body never finishes.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let head = "HTTP/1.1 200 OK\r\n\
                        Content-Type: application/rss+xml\r\n\
                        Content-Length: 4096\r\n\r\n<rss>";
            socket.write_all(head.as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = FeedClient::new(Duration::from_millis(200), 0).unwrap();
        let started = std::time::Instant::now();
        let err = client
            .fetch(&format!("http://{}/feed", addr), HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }
}
