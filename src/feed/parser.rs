//! RSS/Atom parsing into normalized feed content.
//!
//! Parsing is strict about the channel (a feed without a usable title is an
//! error) and lenient about items: a malformed item is logged and dropped
//! without failing the document. Items older than the caller's watermark are
//! filtered out, and the survivors come back sorted oldest-first so the last
//! item carries the new watermark.

use feed_rs::parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    /// The bytes are not a well-formed RSS/Atom document.
    #[error("unparseable feed document: {0}")]
    Syntax(#[from] feed_rs::parser::ParseFeedError),

    /// The document parsed but carries no usable channel title.
    #[error("feed has no channel title")]
    MissingChannelTitle,
}

/// One normalized feed document.
#[derive(Debug, Clone)]
pub struct FeedContent {
    pub title: String,
    /// Publication time of the newest surviving item; `None` when every
    /// item was filtered or dropped.
    pub published_at: Option<i64>,
    /// Items sorted ascending by `published_at`.
    pub items: Vec<FeedItem>,
}

/// One normalized feed item.
#[derive(Debug, Clone)]
pub struct FeedItem {
    pub title: String,
    pub summary: Option<String>,
    pub url: String,
    pub guid: String,
    pub published_at: i64,
}

/// Parse RSS/Atom bytes, dropping items published before `ignore_before`
/// (the feed's stored watermark; items that old were almost certainly
/// ingested on an earlier refresh).
pub fn parse_feed(bytes: &[u8], ignore_before: Option<i64>) -> Result<FeedContent, ParseError> {
    let feed = parser::parse(bytes)?;

    let title = feed
        .title
        .map(|t| t.content)
        .unwrap_or_default()
        .trim()
        .to_string();
    if title.is_empty() {
        return Err(ParseError::MissingChannelTitle);
    }

    let mut items: Vec<FeedItem> = feed
        .entries
        .into_iter()
        .filter_map(|entry| {
            let entry_id = entry.id.clone();
            match parse_entry(entry) {
                Ok(item) => Some(item),
                Err(reason) => {
                    tracing::debug!(guid = %entry_id, reason, "dropping unparseable feed item");
                    None
                }
            }
        })
        .filter(|item| match ignore_before {
            Some(watermark) if item.published_at < watermark => {
                tracing::debug!(
                    guid = %item.guid,
                    published_at = item.published_at,
                    watermark,
                    "ignoring item older than watermark"
                );
                false
            }
            _ => true,
        })
        .collect();

    // oldest first; the last item's timestamp becomes the next watermark
    items.sort_by_key(|item| item.published_at);
    let published_at = items.last().map(|item| item.published_at);

    Ok(FeedContent {
        title,
        published_at,
        items,
    })
}

fn parse_entry(entry: feed_rs::model::Entry) -> Result<FeedItem, &'static str> {
    let published_at = entry
        .published
        .or(entry.updated)
        .ok_or("no publication date")?
        .timestamp();

    let url = entry
        .links
        .first()
        .map(|link| link.href.clone())
        .ok_or("no link")?;

    let title = entry
        .title
        .map(|t| t.content)
        .unwrap_or_default()
        .trim()
        .to_string();
    if title.is_empty() {
        return Err("empty title");
    }

    // feed-rs synthesizes a stable id when the document lacks one, so this
    // fallback only fires for documents with an explicitly blank guid
    let guid = match entry.id.trim() {
        "" => url.clone(),
        id => id.to_string(),
    };

    let summary = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body));

    Ok(FeedItem {
        title,
        summary,
        url,
        guid,
        published_at,
    })
}
