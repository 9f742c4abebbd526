//! Read-only bridge to a third-party anonymous comment service (Isso).
//!
//! Isso has no notion of position, so the widget encodes it in the reply's
//! `website` field as `pos:<x>,<y>` or `<scheme>://<host>/<x>/<y>`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::models::{CommentView, Id};

/// Source of extra comments merged into a page listing.
#[async_trait]
pub trait ExternalSource: Send + Sync {
    /// Never fails: network, timeout and parse problems are logged and yield
    /// an empty list.
    async fn fetch_comments(&self, slug: &str) -> Vec<CommentView>;
}

#[derive(thiserror::Error, Debug)]
enum FetchError {
    #[error("timed out after {0:?}")] Timeout(Duration),
    #[error("http: {0}")] Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")] Status(reqwest::StatusCode),
}

#[derive(Debug, Deserialize)]
struct IssoThread {
    #[serde(default)]
    replies: Vec<IssoReply>,
}

#[derive(Debug, Deserialize)]
struct IssoReply {
    id: Option<Id>,
    /// Isso sends `null` for deleted replies.
    #[serde(default)]
    text: Option<String>,
    website: Option<String>,
    /// Unix seconds with a fractional part.
    created: Option<f64>,
    author: Option<String>,
}

pub struct IssoSource {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl IssoSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("smudge-server/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, client, timeout })
    }

    fn thread_url(&self, slug: &str) -> String {
        // Isso keys threads by path-style URIs
        format!("{}/?uri={}", self.base_url, urlencoding::encode(&format!("/{slug}")))
    }

    async fn request(&self, url: &str) -> Result<IssoThread, FetchError> {
        let resp = self.client.get(url).header(reqwest::header::ACCEPT, "application/json").send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status(resp.status()));
        }
        Ok(resp.json::<IssoThread>().await?)
    }

    /// Hard bound on the whole exchange, whatever the client is configured with.
    async fn try_fetch(&self, url: &str) -> Result<IssoThread, FetchError> {
        tokio::time::timeout(self.timeout, self.request(url))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl ExternalSource for IssoSource {
    async fn fetch_comments(&self, slug: &str) -> Vec<CommentView> {
        let url = self.thread_url(slug);
        match self.try_fetch(&url).await {
            Ok(thread) => {
                debug!(%url, replies = thread.replies.len(), "isso fetch ok");
                thread.replies.into_iter().map(normalize).collect()
            }
            Err(e) => {
                warn!(%url, "isso fetch failed: {e}");
                metrics::increment_counter!("smudge_external_fetch_failures_total");
                Vec::new()
            }
        }
    }
}

fn normalize(reply: IssoReply) -> CommentView {
    let position = reply.website.as_deref().and_then(parse_position).unwrap_or((0, 0));
    let created_at = reply.created.and_then(|secs| {
        let whole = secs.floor();
        DateTime::<Utc>::from_timestamp(whole as i64, ((secs - whole) * 1e9) as u32)
    });
    CommentView::external(
        reply.id,
        strip_html(reply.text.as_deref().unwrap_or_default()).trim().to_string(),
        position,
        created_at,
        reply.author.filter(|a| !a.trim().is_empty()),
    )
}

/// Position marker at the start of `website`; trailing text is ignored.
pub fn parse_position(website: &str) -> Option<(i64, i64)> {
    if let Some(rest) = website.strip_prefix("pos:") {
        let (x, rest) = leading_number(rest)?;
        let (y, _) = leading_number(rest.strip_prefix(',')?)?;
        return Some((x, y));
    }
    let (scheme, rest) = website.split_once("://")?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        return None;
    }
    let (host, path) = rest.split_once('/')?;
    if host.is_empty() {
        return None;
    }
    let (x, rest) = leading_number(path)?;
    let (y, _) = leading_number(rest.strip_prefix('/')?)?;
    Some((x, y))
}

fn leading_number(s: &str) -> Option<(i64, &str)> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 {
        return None;
    }
    Some((s[..end].parse().ok()?, &s[end..]))
}

/// Drop every `<...>` tag (at least one character between the brackets).
pub fn strip_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('>') {
            Some(end) if end > 0 => rest = &after[end + 1..],
            _ => {
                out.push('<');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
