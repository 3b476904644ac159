//! What the interception layer knows about a response before its body.

use streamguard_common::{CorrelationId, MediaKind, RequestId};
use streamguard_media::ContainerFamily;
use url::Url;

/// Response metadata handed to [`StreamFilterController::intercept`].
///
/// [`StreamFilterController::intercept`]: super::StreamFilterController::intercept
#[derive(Debug, Clone)]
pub struct ResponseDetails {
    pub request_id: RequestId,
    pub url: String,
    pub mime_type: String,
    pub status_code: u16,
    /// Declared Content-Length, when it parsed.
    pub content_length: Option<u64>,
    /// Shared by every range request of one logical playback.
    pub correlation: Option<CorrelationId>,
    /// File offset of the first body byte.
    pub range_start: Option<u64>,
    pub rendition: Option<String>,
}

/// Correlation parameters carried in a media URL's query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCorrelation {
    pub correlation: CorrelationId,
    pub range_start: Option<u64>,
    pub rendition: Option<String>,
}

impl ResponseDetails {
    pub fn new(request_id: RequestId, url: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            request_id,
            url: url.into(),
            mime_type: mime_type.into(),
            status_code: 200,
            content_length: None,
            correlation: None,
            range_start: None,
            rendition: None,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    /// Set the length from a raw header value; anything unparsable is unknown.
    pub fn with_content_length_header(mut self, value: &str) -> Self {
        self.content_length = value.trim().parse().ok();
        self
    }

    pub fn with_content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }

    pub fn with_correlation(mut self, correlation: CorrelationId, range_start: u64) -> Self {
        self.correlation = Some(correlation);
        self.range_start = Some(range_start);
        self
    }

    /// Fill in correlation fields the caller left empty from the URL query.
    pub fn with_query_correlation(mut self) -> Self {
        if self.correlation.is_some() {
            return self;
        }
        if let Some(query) = Self::correlation_from_query(&self.url) {
            self.correlation = Some(query.correlation);
            self.range_start = self.range_start.or(query.range_start);
            self.rendition = self.rendition.or(query.rendition);
        }
        self
    }

    /// Read `cpn`, `range=start-end` and `itag` from a URL.
    pub fn correlation_from_query(url: &str) -> Option<QueryCorrelation> {
        let url = Url::parse(url).ok()?;
        let mut correlation = None;
        let mut range_start = None;
        let mut rendition = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "cpn" if !value.is_empty() => correlation = Some(CorrelationId::new(value.as_ref())),
                "range" => {
                    range_start = value
                        .split('-')
                        .next()
                        .and_then(|start| start.trim().parse().ok())
                }
                "itag" if !value.is_empty() => rendition = Some(value.into_owned()),
                _ => {}
            }
        }
        Some(QueryCorrelation {
            correlation: correlation?,
            range_start,
            rendition,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    fn essence(&self) -> String {
        self.mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    /// Kind of media the body carries, if any.
    pub fn media_kind(&self) -> Option<MediaKind> {
        let essence = self.essence();
        if essence.starts_with("image/") {
            Some(MediaKind::Image)
        } else if essence.starts_with("video/")
            || (essence.starts_with("audio/") && ContainerFamily::from_mime(&essence).is_some())
        {
            Some(MediaKind::Video)
        } else {
            None
        }
    }

    pub fn container_family(&self) -> Option<ContainerFamily> {
        ContainerFamily::from_mime(&self.essence())
    }
}
