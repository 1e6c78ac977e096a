use std::sync::Arc;

use crate::errors::BiliApiError;
use crate::http::HttpFetch;
use crate::link;
use crate::options::ResolveOptions;
use crate::quality;
use crate::stream::{
    rank_best, select_video_stream, DashInfo, PlayUrlData, ResolvedSources, StreamCandidate,
};
use crate::user_agent;
use crate::wbi::{encode_query, WbiSigner};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const VIEW_URL: &str = "https://api.bilibili.com/x/web-interface/view";
pub const PLAYURL_WBI_URL: &str = "https://api.bilibili.com/x/player/wbi/playurl";
pub const PLAYURL_URL: &str = "https://api.bilibili.com/x/player/playurl";

/// dash, hdr, 4k, dolby audio/vision, 8k and av1 capable
const FNVAL: i64 = 4048;

/// One addressable video page.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct VideoIdentity {
    pub aid: i64,
    pub cid: i64,
    pub title: String,
    pub bvid: Option<String>,
    /// Seconds.
    pub duration: Option<i64>,
}

/// How the tier of a resolved stream came about.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct QualityReport {
    pub requested_qn: i64,
    pub effective_qn: i64,
    pub selected_qn: Option<i64>,
    pub strict: bool,
    pub fallback: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlayInfo {
    pub sources: ResolvedSources,
    pub quality: QualityReport,
}

/// Resolves links to identities and identities to stream urls.
///
/// Holds the signer, so one instance should be shared for the process.
pub struct BiliResolver {
    http: Arc<dyn HttpFetch>,
    signer: WbiSigner,
}

impl BiliResolver {
    pub fn new(http: Arc<dyn HttpFetch>) -> Self {
        let signer = WbiSigner::new(http.clone());
        Self { http, signer }
    }

    /// Follow a short link to its full video url.
    pub async fn resolve_short_link(&self, url: &str) -> Result<String, BiliApiError> {
        let location = self
            .http
            .resolve_redirect(url, user_agent::SHORT_LINK_USER_AGENT)
            .await?;
        Ok(link::sanitize_url(&location).to_string())
    }

    /// Look up aid, cid and title for the page a video link points at.
    pub async fn get_view_info(
        &self,
        url: &str,
        opts: &ResolveOptions,
    ) -> Result<VideoIdentity, BiliApiError> {
        let query_url = if let Some(bvid) = link::extract_bvid(url) {
            format!("{VIEW_URL}?bvid={bvid}")
        } else if let Some(aid) = link::extract_aid(url) {
            format!("{VIEW_URL}?aid={aid}")
        } else {
            return Err(BiliApiError::InvalidLink {
                url: url.to_string(),
            });
        };

        let body = self
            .http
            .get_text(&query_url, request_headers(opts))
            .await?;
        let data = parse_envelope(&body)?;

        let empty_vec = vec![];
        let pages = data["pages"].as_array().unwrap_or(&empty_vec);
        if pages.is_empty() {
            return Err(BiliApiError::EmptyPages);
        }
        let p = link::extract_page_param(url);
        let page = match pages.get(p - 1) {
            Some(page) => page,
            None => {
                log::warn!(
                    "Page {p} out of range ({} pages), using page 1",
                    pages.len()
                );
                &pages[0]
            }
        };

        let aid = data["aid"].as_i64().ok_or(BiliApiError::MalformedResponse {
            reason: "missing aid".to_string(),
        })?;
        let cid = page["cid"].as_i64().ok_or(BiliApiError::MalformedResponse {
            reason: "missing cid".to_string(),
        })?;
        let duration = page["duration"]
            .as_i64()
            .or_else(|| data["duration"].as_i64());

        Ok(VideoIdentity {
            aid,
            cid,
            title: data["title"].as_str().unwrap_or("").to_string(),
            bvid: data["bvid"]
                .as_str()
                .filter(|b| !b.is_empty())
                .map(str::to_string)
                .or_else(|| link::extract_bvid(url)),
            duration,
        })
    }

    /// Ask for the playback addresses of one page and pick the streams.
    pub async fn get_play_urls(
        &self,
        aid: i64,
        cid: i64,
        opts: &ResolveOptions,
    ) -> Result<PlayInfo, BiliApiError> {
        let logged_in = opts.logged_in();
        let requested_qn = opts.qn;
        let effective_qn = quality::effective_qn(requested_qn, logged_in);
        let strict = opts.is_strict();

        if !logged_in {
            log::warn!("No SESSDATA configured, high quality tiers may be unavailable");
        }
        for warning in quality::privilege_warnings(effective_qn, logged_in) {
            log::warn!("{warning}");
        }
        log::info!(
            "Quality: requested {} (qn={requested_qn}), effective qn={effective_qn}, strict={strict}",
            if requested_qn == 0 {
                "自动".to_string()
            } else {
                quality::qn_name(requested_qn)
            }
        );

        let params = play_params(aid, cid, effective_qn, opts, chrono::Utc::now().timestamp_millis());
        let url = match self.signer.sign_params(&params).await {
            Ok(signed) => format!("{PLAYURL_WBI_URL}?{}", encode_query(&signed)),
            Err(e) => {
                log::warn!("WBI signing failed, falling back to unsigned api: {e}");
                format!("{PLAYURL_URL}?{}", encode_query(&params))
            }
        };

        let body = self.http.get_text(&url, request_headers(opts)).await?;
        let data: PlayUrlData = serde_json::from_value(parse_envelope(&body)?)?;

        let mut report = QualityReport {
            requested_qn,
            effective_qn,
            selected_qn: None,
            strict,
            fallback: false,
        };
        let sources = resolve_sources(&data, effective_qn, strict, opts.require_audio, &mut report)?;
        if let Some(selected) = report.selected_qn {
            if requested_qn != 0 && selected != requested_qn {
                log::info!(
                    "Quality downgraded: requested {} (qn={requested_qn}), selected {} (qn={selected})",
                    quality::qn_name(requested_qn),
                    quality::qn_name(selected)
                );
            } else {
                log::info!("Quality selected: {}", quality::qn_name(selected));
            }
        }
        Ok(PlayInfo {
            sources,
            quality: report,
        })
    }
}

fn request_headers(opts: &ResolveOptions) -> HeaderMap {
    let mut headers = user_agent::default_headers();
    if let Some(cookie) = opts.cookie_header() {
        if let Ok(cookie) = cookie.parse() {
            headers.insert("cookie", cookie);
        } else {
            log::warn!("Configured cookies are not a valid header value, sending without them");
        }
    }
    headers
}

/// Check `code` and return `data`.
fn parse_envelope(body: &str) -> Result<Value, BiliApiError> {
    let mut res: Value = serde_json::from_str(body)?;
    let code = res["code"]
        .as_i64()
        .ok_or_else(|| BiliApiError::MalformedResponse {
            reason: "missing code".to_string(),
        })?;
    if code != 0 {
        let message = res["message"]
            .as_str()
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("API error {code}"));
        log::error!("API error: code={code}, message={message}");
        return Err(BiliApiError::Api { code, message });
    }
    Ok(res["data"].take())
}

fn session_token(buvid3: &str, now_ms: i64) -> String {
    format!("{:x}", md5::compute(format!("{buvid3}{now_ms}")))
}

fn play_params(
    aid: i64,
    cid: i64,
    effective_qn: i64,
    opts: &ResolveOptions,
    now_ms: i64,
) -> Map<String, Value> {
    let fourk = if effective_qn >= quality::FOURK_QN { "1" } else { "0" };
    let mut params = Map::new();
    params.insert("avid".into(), aid.to_string().into());
    params.insert("cid".into(), cid.to_string().into());
    params.insert("otype".into(), "json".into());
    params.insert("fourk".into(), fourk.into());
    params.insert("fnver".into(), "0".into());
    params.insert("fnval".into(), FNVAL.to_string().into());
    params.insert("platform".into(), "pc".into());
    if effective_qn > 0 {
        params.insert("qn".into(), effective_qn.to_string().into());
    }
    if let Some(buvid3) = opts.buvid3() {
        params.insert("session".into(), session_token(buvid3, now_ms).into());
    }
    if !opts.logged_in() {
        params.insert("gaia_source".into(), "view-card".into());
    }
    params
}

fn log_streams(label: &str, streams: &[StreamCandidate]) {
    if streams.is_empty() || !log::log_enabled!(log::Level::Debug) {
        return;
    }
    log::debug!("{label} streams:");
    for (i, s) in streams.iter().enumerate() {
        log::debug!("{:<4} {s}", i + 1);
    }
}

/// Turn a parsed playurl `data` into download sources.
///
/// The split dash lists win, the combined-file list is only read when the
/// response carries no dash data. `report` receives the selected tier and
/// whether the fallback path was taken.
pub fn resolve_sources(
    data: &PlayUrlData,
    effective_qn: i64,
    strict: bool,
    require_audio: bool,
    report: &mut QualityReport,
) -> Result<ResolvedSources, BiliApiError> {
    if let Some(dash) = &data.dash {
        return resolve_dash(dash, effective_qn, strict, require_audio, report);
    }
    log::debug!("No dash data in response");

    let Some(first) = data.durl.first() else {
        log::warn!("Response has neither durl nor dash data");
        return Err(BiliApiError::NoPlaybackSource);
    };
    if data.durl.len() > 1 {
        log::warn!(
            "durl has {} segments, only the first one is used",
            data.durl.len()
        );
    }
    let urls = first.urls();
    if urls.is_empty() {
        return Err(BiliApiError::NoPlaybackSource);
    }

    // a combined file comes in exactly one tier, the one the server picked
    if strict && effective_qn > 0 && data.quality != Some(effective_qn) {
        return Err(BiliApiError::StrictTierUnavailable { qn: effective_qn });
    }
    report.selected_qn = data.quality;
    report.fallback = effective_qn > 0 && data.quality.is_some_and(|qn| qn > effective_qn);
    if report.fallback {
        log::info!("durl tier is above qn={effective_qn}, nothing lower was offered");
    }
    log::debug!(
        "Using durl source ({}) with {} urls, {:.2} MB, {}s",
        data.format.as_deref().unwrap_or("unknown"),
        urls.len(),
        first.size as f64 / 1024.0 / 1024.0,
        first.length / 1000
    );
    Ok(ResolvedSources::Combined { urls })
}

fn resolve_dash(
    dash: &DashInfo,
    effective_qn: i64,
    strict: bool,
    require_audio: bool,
    report: &mut QualityReport,
) -> Result<ResolvedSources, BiliApiError> {
    let audios = dash.all_audio();
    log_streams("Video", &dash.video);
    log_streams("Audio", &audios);

    let selection = select_video_stream(&dash.video, effective_qn, strict)?;
    let video = selection.candidate();
    report.selected_qn = Some(video.id);
    report.fallback = selection.is_fallback();
    if report.fallback {
        log::info!("No stream at or below qn={effective_qn}, fell back to best available");
    }
    log::debug!("Selected video: {video}");

    let video_urls = video.urls();
    if video_urls.is_empty() {
        return Err(BiliApiError::NoPlaybackSource);
    }

    let audio_urls = match rank_best(&audios) {
        Some(audio) => {
            log::debug!("Selected audio: {audio}");
            audio.urls()
        }
        None => Vec::new(),
    };
    if audio_urls.is_empty() {
        if require_audio {
            return Err(BiliApiError::MissingAudio);
        }
        log::warn!("No audio stream found, continuing with video only");
    }

    Ok(ResolvedSources::Split {
        video_urls,
        audio_urls,
    })
}
