use std::cmp::Reverse;
use std::fmt;

use crate::errors::BiliApiError;
use serde::Deserialize;

/// Codec families in preference order, best first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Codec {
    Avc,
    Hevc,
    Av1,
    Unknown,
}

impl Codec {
    /// Classify a `codecs` string such as `avc1.640032` or `hev1.1.6.L150.90`.
    pub fn from_codecs(codecs: &str) -> Codec {
        let lower = codecs.to_lowercase();
        if lower.contains("avc") || lower.contains("h264") {
            Codec::Avc
        } else if lower.contains("hev") || lower.contains("hvc") {
            Codec::Hevc
        } else if lower.contains("av01") {
            Codec::Av1
        } else {
            Codec::Unknown
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// One entry of `dash.video`, `dash.audio`, `dash.dolby.audio` or `dash.flac.audio`.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(from = "RawCandidate")]
pub struct StreamCandidate {
    /// Quality tier for video, audio quality code for audio.
    pub id: i64,
    pub codecs: String,
    pub bandwidth: u64,
    pub base_url: Option<String>,
    pub backup_url: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: String,
}

// The api sends every url field twice, once camelCase and once snake_case,
// and older responses only one of them.
#[derive(Deserialize, Default)]
#[serde(default)]
struct RawCandidate {
    id: i64,
    codecs: String,
    bandwidth: u64,
    #[serde(rename = "baseUrl")]
    base_url_camel: Option<String>,
    base_url: Option<String>,
    #[serde(rename = "backupUrl", deserialize_with = "null_as_empty")]
    backup_url_camel: Vec<String>,
    #[serde(deserialize_with = "null_as_empty")]
    backup_url: Vec<String>,
    width: u32,
    height: u32,
    #[serde(rename = "frameRate")]
    frame_rate_camel: String,
    frame_rate: String,
}

fn first_non_empty(a: Option<String>, b: Option<String>) -> Option<String> {
    a.filter(|s| !s.is_empty()).or(b.filter(|s| !s.is_empty()))
}

impl From<RawCandidate> for StreamCandidate {
    fn from(raw: RawCandidate) -> Self {
        StreamCandidate {
            id: raw.id,
            codecs: raw.codecs,
            bandwidth: raw.bandwidth,
            base_url: first_non_empty(raw.base_url_camel, raw.base_url),
            backup_url: if raw.backup_url_camel.is_empty() {
                raw.backup_url
            } else {
                raw.backup_url_camel
            },
            width: raw.width,
            height: raw.height,
            frame_rate: if raw.frame_rate_camel.is_empty() {
                raw.frame_rate
            } else {
                raw.frame_rate_camel
            },
        }
    }
}

impl StreamCandidate {
    pub fn codec(&self) -> Codec {
        Codec::from_codecs(&self.codecs)
    }

    /// Primary url followed by its mirrors, https only, without duplicates.
    pub fn urls(&self) -> Vec<String> {
        normalize_stream_urls(self.base_url.as_deref(), &self.backup_url)
    }
}

impl fmt::Display for StreamCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "id: {}, {}x{}, codecs: {}, {}kbps, fps: {}",
            self.id,
            self.width,
            self.height,
            self.codecs,
            self.bandwidth / 1000,
            self.frame_rate
        )
    }
}

/// One entry of `durl`, a single playable file.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(from = "RawDurlItem")]
pub struct DurlItem {
    pub url: Option<String>,
    pub backup_url: Vec<String>,
    pub size: u64,
    /// Milliseconds.
    pub length: u64,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawDurlItem {
    url: Option<String>,
    #[serde(rename = "baseUrl")]
    base_url_camel: Option<String>,
    base_url: Option<String>,
    #[serde(deserialize_with = "null_as_empty")]
    backup_url: Vec<String>,
    #[serde(rename = "backupUrl", deserialize_with = "null_as_empty")]
    backup_url_camel: Vec<String>,
    size: u64,
    length: u64,
}

impl From<RawDurlItem> for DurlItem {
    fn from(raw: RawDurlItem) -> Self {
        DurlItem {
            url: first_non_empty(raw.url, first_non_empty(raw.base_url_camel, raw.base_url)),
            backup_url: if raw.backup_url.is_empty() {
                raw.backup_url_camel
            } else {
                raw.backup_url
            },
            size: raw.size,
            length: raw.length,
        }
    }
}

impl DurlItem {
    pub fn urls(&self) -> Vec<String> {
        normalize_stream_urls(self.url.as_deref(), &self.backup_url)
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct DolbyInfo {
    #[serde(deserialize_with = "null_as_empty")]
    pub audio: Vec<StreamCandidate>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct FlacInfo {
    pub audio: Option<StreamCandidate>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct DashInfo {
    #[serde(deserialize_with = "null_as_empty")]
    pub video: Vec<StreamCandidate>,
    #[serde(deserialize_with = "null_as_empty")]
    pub audio: Vec<StreamCandidate>,
    pub dolby: Option<DolbyInfo>,
    pub flac: Option<FlacInfo>,
}

impl DashInfo {
    /// Regular audio followed by dolby and flac tracks.
    pub fn all_audio(&self) -> Vec<StreamCandidate> {
        let mut audio = self.audio.clone();
        if let Some(dolby) = &self.dolby {
            audio.extend(dolby.audio.iter().cloned());
        }
        if let Some(flac) = self.flac.as_ref().and_then(|f| f.audio.as_ref()) {
            audio.push(flac.clone());
        }
        audio
    }
}

/// `data` of the playurl envelope.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct PlayUrlData {
    pub quality: Option<i64>,
    pub format: Option<String>,
    pub dash: Option<DashInfo>,
    #[serde(deserialize_with = "null_as_empty")]
    pub durl: Vec<DurlItem>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Where the media of one page can be fetched from.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolvedSources {
    /// A single file with audio and video, urls in the order to try.
    Combined { urls: Vec<String> },
    /// Separate tracks to merge locally. `video_urls` is never empty,
    /// `audio_urls` is empty for video only results.
    Split {
        video_urls: Vec<String>,
        audio_urls: Vec<String>,
    },
}

impl ResolvedSources {
    pub fn kind(&self) -> &'static str {
        match self {
            ResolvedSources::Combined { .. } => "durl",
            ResolvedSources::Split { .. } => "dash",
        }
    }
}

/// Result of picking a video candidate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VideoSelection<'a> {
    /// The candidate satisfies the tier constraint.
    Matched(&'a StreamCandidate),
    /// Nothing satisfied the constraint, best available stream used instead.
    Fallback(&'a StreamCandidate),
}

impl<'a> VideoSelection<'a> {
    pub fn candidate(&self) -> &'a StreamCandidate {
        match self {
            VideoSelection::Matched(c) | VideoSelection::Fallback(c) => c,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, VideoSelection::Fallback(_))
    }
}

/// Merge the primary url with its mirrors: `http:` is rewritten to `https:`,
/// empty and repeated entries are dropped, first-seen order is kept.
pub fn normalize_stream_urls(primary: Option<&str>, backups: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();
    for url in primary.into_iter().chain(backups.iter().map(String::as_str)) {
        if url.is_empty() {
            continue;
        }
        let url = match url.strip_prefix("http:") {
            Some(rest) => format!("https:{rest}"),
            None => url.to_string(),
        };
        if !normalized.contains(&url) {
            normalized.push(url);
        }
    }
    normalized
}

/// Best codec first, then highest bitrate. Stable among equals.
pub fn rank_best<'a, I>(candidates: I) -> Option<&'a StreamCandidate>
where
    I: IntoIterator<Item = &'a StreamCandidate>,
{
    candidates
        .into_iter()
        .min_by_key(|c| (c.codec(), Reverse(c.bandwidth)))
}

/// Pick the video stream for `target_qn`.
///
/// * `target_qn > 0` and `strict`: only exact tier matches are eligible.
/// * `target_qn > 0`: tiers at or below the target are eligible, falling back
///   to every candidate when none is.
/// * `target_qn == 0`: every candidate is eligible.
///
/// Outside strict mode the highest eligible tier wins, ties are broken by
/// [`rank_best`].
pub fn select_video_stream(
    videos: &[StreamCandidate],
    target_qn: i64,
    strict: bool,
) -> Result<VideoSelection<'_>, BiliApiError> {
    if videos.is_empty() {
        return Err(BiliApiError::NoVideoStream);
    }
    let strict = strict && target_qn > 0;

    let mut eligible: Vec<&StreamCandidate> = if target_qn > 0 {
        if strict {
            videos.iter().filter(|v| v.id == target_qn).collect()
        } else {
            videos.iter().filter(|v| v.id <= target_qn).collect()
        }
    } else {
        videos.iter().collect()
    };

    let fallback = eligible.is_empty();
    if fallback {
        if strict {
            return Err(BiliApiError::StrictTierUnavailable { qn: target_qn });
        }
        eligible = videos.iter().collect();
    }

    if !strict {
        let best_id = eligible.iter().map(|v| v.id).max().unwrap_or(0);
        if best_id > 0 {
            eligible.retain(|v| v.id == best_id);
        }
    }

    let best = rank_best(eligible).ok_or(BiliApiError::NoVideoStream)?;
    if fallback {
        Ok(VideoSelection::Fallback(best))
    } else {
        Ok(VideoSelection::Matched(best))
    }
}
