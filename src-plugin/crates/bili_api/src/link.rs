//! Finding video links in free chat text and reading their parameters.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

// query (printable ascii, no fragment) is kept so that `?p=` and `?qn=` survive extraction
static VIDEO_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)https?://(?:(?:www|m)\.)?bilibili\.com/video/(?P<id>BV[0-9a-z]+|av\d+)/?(?:\?[\x21\x22\x24-\x7e]+)?",
    )
    .unwrap()
});
static SHORT_URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)https?://b23\.tv/[0-9a-z]+(?:\?[\x21\x22\x24-\x7e]+)?").unwrap());
static AID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)/video/av(\d+)").unwrap());
static QN_TEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:[?&]|\b)qn\s*=\s*(\d+)").unwrap());

const TRAILING_PUNCTUATION: &[char] = &[
    ')', '.', ',', '，', '。', '!', '?', '》', '】', '〕', '」', '"', '\'',
];

/// Strip punctuation that chat text tends to glue onto the end of a link.
pub fn sanitize_url(url: &str) -> &str {
    url.trim_end_matches(TRAILING_PUNCTUATION)
}

/// Return the first short link, or failing that the first video link, in `text`.
pub fn find_first_bilibili_url(text: &str) -> Option<String> {
    SHORT_URL_RE
        .find(text)
        .or_else(|| VIDEO_URL_RE.find(text))
        .map(|m| sanitize_url(m.as_str()).to_string())
}

pub fn is_short_link(url: &str) -> bool {
    url.to_lowercase().contains("b23.tv")
}

/// `BV1xx411c7mD` from a video link. `av` links yield `None`.
pub fn extract_bvid(url: &str) -> Option<String> {
    let captures = VIDEO_URL_RE.captures(url)?;
    let id = captures.name("id")?.as_str();
    if id.to_lowercase().starts_with("bv") {
        Some(id.to_string())
    } else {
        None
    }
}

pub fn extract_aid(url: &str) -> Option<i64> {
    AID_RE.captures(url)?.get(1)?.as_str().parse().ok()
}

fn query_param(url: &str, key: &str) -> Option<String> {
    let parsed = Url::parse(sanitize_url(url)).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// The `p` query parameter, 1 when missing or invalid.
pub fn extract_page_param(url: &str) -> usize {
    query_param(url, "p")
        .and_then(|p| p.trim().parse::<usize>().ok())
        .filter(|p| *p > 0)
        .unwrap_or(1)
}

/// The `qn` query parameter when present and positive.
pub fn extract_qn_param(url: &str) -> Option<i64> {
    query_param(url, "qn")
        .and_then(|qn| qn.trim().parse::<i64>().ok())
        .filter(|qn| *qn > 0)
}

/// `qn=<n>` anywhere in `text`, for links whose query got lost on the way.
pub fn extract_qn_from_text(text: &str) -> Option<i64> {
    QN_TEXT_RE
        .captures(text)?
        .get(1)?
        .as_str()
        .parse::<i64>()
        .ok()
        .filter(|qn| *qn > 0)
}
