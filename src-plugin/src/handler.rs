use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bili_api::{link, quality, BiliApiError, BiliResolver, PlayInfo, VideoIdentity};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::delivery::ChatSender;
use crate::downloader::{temp_stem, DownloadedMedia, Downloader};
use crate::errors::PluginError;
use crate::ffmpeg::{exceeds_size_limit, megabytes, needs_mp4_remux, FfmpegTool, MergeOutcome};

const SHORT_LINK_ATTEMPTS: u32 = 3;
const VIEW_INFO_ATTEMPTS: u32 = 3;
const PLAY_URL_ATTEMPTS: u32 = 2;

/// What [`MessageHandler::on_message`] did with a message.
#[derive(Debug)]
pub enum Dispatch {
    /// No video link in the message.
    Ignored,
    /// The link was handled before returning.
    Handled,
    /// The link is being handled on a background task.
    Spawned(JoinHandle<()>),
}

/// Run `op` up to `attempts` times while it fails with a retryable error,
/// sleeping `base_delay * n` after the n-th failure.
pub async fn with_retry<T, F, Fut>(
    what: &str,
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, BiliApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BiliApiError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let wait = base_delay * attempt;
                log::warn!(
                    "{what} failed (attempt {attempt}/{attempts}): {e}, retrying in {}s",
                    wait.as_secs_f32()
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => {
                log::error!("{what} failed (attempt {attempt}/{attempts}): {e}");
                return Err(e);
            }
        }
    }
}

#[derive(Clone)]
pub struct MessageHandler {
    config: Arc<Config>,
    resolver: Arc<BiliResolver>,
    sender: Arc<dyn ChatSender>,
    downloader: Arc<Downloader>,
    ffmpeg: FfmpegTool,
    retry_delay: Duration,
}

impl MessageHandler {
    pub fn new(
        config: Arc<Config>,
        resolver: Arc<BiliResolver>,
        sender: Arc<dyn ChatSender>,
    ) -> Result<Self, PluginError> {
        let downloader = Downloader::new(
            config.resolve_options().cookie_header(),
            config.download.retries,
        )?;
        let ffmpeg = FfmpegTool::from_config(&config.ffmpeg);
        Ok(Self {
            config,
            resolver,
            sender,
            downloader: Arc::new(downloader),
            ffmpeg,
            retry_delay: Duration::from_secs(1),
        })
    }

    /// Handle one incoming chat message from `dest`.
    pub async fn on_message(&self, dest: &str, text: &str) -> Dispatch {
        let Some(url) = link::find_first_bilibili_url(text) else {
            return Dispatch::Ignored;
        };
        log::info!("Bilibili video link detected: {url}");

        if self.config.bilibili.block_ai_reply {
            let this = self.clone();
            let dest = dest.to_string();
            let text = text.to_string();
            Dispatch::Spawned(tokio::spawn(async move {
                this.process(&dest, &text, &url).await;
            }))
        } else {
            self.process(dest, text, &url).await;
            Dispatch::Handled
        }
    }

    async fn process(&self, dest: &str, text: &str, url: &str) {
        let mut temp_files = Vec::new();
        if let Err(e) = self.run(dest, text, url, &mut temp_files).await {
            log::error!("Failed to handle {url}: {e}");
            if let Err(e) = self.sender.send_text(dest, &e.user_message()).await {
                log::error!("Failed to send error message: {e}");
            }
        }
        cleanup(&temp_files).await;
    }

    async fn resolve_link(&self, url: &str) -> String {
        if !link::is_short_link(url) {
            return url.to_string();
        }
        match with_retry("Short link resolution", SHORT_LINK_ATTEMPTS, self.retry_delay, || {
            self.resolver.resolve_short_link(url)
        })
        .await
        {
            Ok(resolved) => resolved,
            Err(_) => {
                log::error!("Short link could not be resolved, using original url");
                url.to_string()
            }
        }
    }

    async fn run(
        &self,
        dest: &str,
        text: &str,
        url: &str,
        temp_files: &mut Vec<PathBuf>,
    ) -> Result<(), PluginError> {
        let target_url = self.resolve_link(url).await;

        let mut opts = self.config.resolve_options();
        if let Some(qn) =
            link::extract_qn_param(&target_url).or_else(|| link::extract_qn_from_text(text))
        {
            log::info!("Quality parameter qn={qn} overrides configured qn={}", opts.qn);
            opts.qn = qn;
        }

        let identity = with_retry("Video info", VIEW_INFO_ATTEMPTS, self.retry_delay, || {
            self.resolver.get_view_info(&target_url, &opts)
        })
        .await?;
        log::info!("Parse successful: {} (aid={}, cid={})", identity.title, identity.aid, identity.cid);
        self.check_duration(identity.duration)?;

        let play = with_retry("Play urls", PLAY_URL_ATTEMPTS, self.retry_delay, || {
            self.resolver.get_play_urls(identity.aid, identity.cid, &opts)
        })
        .await?;
        log::debug!("Playback sources fetched: {}", play.sources.kind());
        self.sender.send_text(dest, &success_message(&play)).await?;

        let path = self.fetch_video(&identity, &play, temp_files).await?;

        if self.config.bilibili.enable_duration_limit {
            match self.ffmpeg.probe_duration(&path).await {
                Ok(duration) => self.check_duration(Some(duration.ceil() as i64))?,
                Err(e) => log::warn!("Duration probe failed, sending anyway: {e}"),
            }
        }
        let path = self.compress_if_oversized(path, temp_files).await;

        self.sender
            .send_video(dest, &path)
            .await
            .map_err(|e| PluginError::Delivery {
                reason: e.to_string(),
            })?;
        log::info!("Video sent: {}", path.display());
        Ok(())
    }

    fn check_duration(&self, duration: Option<i64>) -> Result<(), PluginError> {
        let limit = self.config.bilibili.max_video_duration;
        match duration {
            Some(duration) if self.config.bilibili.enable_duration_limit && duration > limit => {
                log::warn!("Video duration exceeds limit: {duration}s > {limit}s");
                Err(PluginError::DurationExceeded { duration, limit })
            }
            _ => Ok(()),
        }
    }

    /// Swap `path` for a re-encoded copy when it is over the size limit.
    /// Any failure keeps the original file.
    async fn compress_if_oversized(&self, path: PathBuf, temp_files: &mut Vec<PathBuf>) -> PathBuf {
        let settings = &self.config.bilibili;
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                log::warn!("Failed to read size of {}: {e}", path.display());
                return path;
            }
        };
        if !exceeds_size_limit(size, settings.max_video_size_mb) {
            log::debug!("Video size {:.2} MB within limit", megabytes(size));
            return path;
        }
        if !settings.enable_video_compression || !self.ffmpeg.is_available().await {
            log::warn!(
                "Video size {:.2} MB exceeds {} MB but compression is unavailable",
                megabytes(size),
                settings.max_video_size_mb
            );
            return path;
        }

        let output = compressed_path(&path);
        temp_files.push(output.clone());
        let max_bytes = settings.max_video_size_mb.saturating_mul(1024 * 1024);
        match self
            .ffmpeg
            .compress(&path, &output, max_bytes, settings.compression_quality)
            .await
        {
            Ok(compressed) => {
                log::info!(
                    "Video compressed: {:.2} MB -> {:.2} MB",
                    megabytes(size),
                    megabytes(compressed)
                );
                output
            }
            Err(e) => {
                log::warn!("Compression failed, sending original file: {e}");
                path
            }
        }
    }

    /// Download and assemble one sendable file.
    async fn fetch_video(
        &self,
        identity: &VideoIdentity,
        play: &PlayInfo,
        temp_files: &mut Vec<PathBuf>,
    ) -> Result<PathBuf, PluginError> {
        let dir = self.config.temp_dir();
        let stem = temp_stem(
            &identity.title,
            identity.aid,
            identity.cid,
            chrono::Utc::now().timestamp_millis(),
        );

        let media = self.downloader.download(&play.sources, &dir, &stem).await?;
        temp_files.extend(media.paths());

        let output = dir.join(format!("{stem}.mp4"));
        match media {
            DownloadedMedia::Single(path) => {
                if !needs_mp4_remux(&path) || !self.ffmpeg.is_available().await {
                    return Ok(path);
                }
                temp_files.push(output.clone());
                match self.ffmpeg.remux(&path, &output).await {
                    Ok(()) => Ok(output),
                    Err(e) => {
                        log::warn!("Remux to mp4 failed, sending original file: {e}");
                        Ok(path)
                    }
                }
            }
            DownloadedMedia::Split { video, audio } => {
                temp_files.push(output.clone());
                match audio {
                    Some(audio) => {
                        let outcome = self.ffmpeg.merge(&video, &audio, &output).await?;
                        if outcome == MergeOutcome::VideoOnly {
                            log::warn!("Sending {} without audio", output.display());
                        }
                    }
                    None => self.ffmpeg.remux(&video, &output).await?,
                }
                Ok(output)
            }
        }
    }
}

fn compressed_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "video".to_string());
    path.with_file_name(format!("{stem}_compressed.mp4"))
}

fn success_message(play: &PlayInfo) -> String {
    match play.quality.selected_qn {
        Some(qn) if qn > 0 => format!("解析成功，已选择：{}", quality::qn_name(qn)),
        _ => "解析成功".to_string(),
    }
}

async fn cleanup(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = remove_if_exists(path).await {
            log::warn!("Failed to remove temp file {}: {e}", path.display());
        }
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bili_api::HttpFetch;
    use reqwest::header::HeaderMap;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Answers by url prefix and counts every request.
    #[derive(Default)]
    struct FakeApi {
        routes: Vec<(&'static str, String)>,
        redirect_to: Option<String>,
        calls: AtomicUsize,
        redirects: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpFetch for FakeApi {
        async fn get_text(&self, url: &str, _headers: HeaderMap) -> Result<String, BiliApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(url.to_string());
            self.routes
                .iter()
                .find(|(prefix, _)| url.starts_with(prefix))
                .map(|(_, body)| body.clone())
                .ok_or_else(|| BiliApiError::Network {
                    reason: "connection refused".to_string(),
                })
        }

        async fn resolve_redirect(
            &self,
            _url: &str,
            _user_agent: &str,
        ) -> Result<String, BiliApiError> {
            self.redirects.fetch_add(1, Ordering::SeqCst);
            self.redirect_to.clone().ok_or(BiliApiError::SecurityControl)
        }
    }

    #[derive(Default)]
    struct RecordingSender {
        texts: Mutex<Vec<(String, String)>>,
        videos: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl ChatSender for RecordingSender {
        async fn send_text(&self, dest: &str, text: &str) -> Result<(), PluginError> {
            self.texts
                .lock()
                .unwrap()
                .push((dest.to_string(), text.to_string()));
            Ok(())
        }

        async fn send_video(&self, _dest: &str, path: &Path) -> Result<(), PluginError> {
            self.videos.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }

    const NAV: &str = "https://api.bilibili.com/x/web-interface/nav";
    const VIEW: &str = "https://api.bilibili.com/x/web-interface/view";
    const PLAYURL: &str = "https://api.bilibili.com/x/player/";

    fn view_body(duration: i64) -> String {
        json!({
            "code": 0,
            "data": {
                "bvid": "BV1xx411c7mD",
                "aid": 170001,
                "title": "测试视频",
                "duration": duration,
                "pages": [{ "cid": 279786, "page": 1, "duration": duration }]
            }
        })
        .to_string()
    }

    fn nav_body() -> String {
        r#"{"code":-101,"data":{"wbi_img":{"img_url":"https://i0.hdslb.com/bfs/wbi/7cd084941338484aae1ad9425b84077c.png","sub_url":"https://i0.hdslb.com/bfs/wbi/4932caff0ff746eab6f01bf08b70ac45.png"}}}"#.to_string()
    }

    fn handler(
        api: FakeApi,
        configure: impl FnOnce(&mut Config),
    ) -> (MessageHandler, Arc<FakeApi>, Arc<RecordingSender>) {
        let mut config = Config::default();
        config.bilibili.block_ai_reply = false;
        configure(&mut config);
        let api = Arc::new(api);
        let sender = Arc::new(RecordingSender::default());
        let resolver = Arc::new(BiliResolver::new(api.clone()));
        let handler = MessageHandler::new(Arc::new(config), resolver, sender.clone()).unwrap();
        (handler, api, sender)
    }

    fn texts(sender: &RecordingSender) -> Vec<String> {
        sender
            .texts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_ignores_messages_without_links() {
        let (handler, api, sender) = handler(FakeApi::default(), |_| {});
        let dispatch = handler.on_message("group:1", "今天天气不错 https://example.com").await;
        assert!(matches!(dispatch, Dispatch::Ignored));
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        assert!(texts(&sender).is_empty());
    }

    #[tokio::test]
    async fn test_api_error_reported_without_retry() {
        let api = FakeApi {
            routes: vec![(VIEW, r#"{"code":-404,"message":"啥都木有"}"#.to_string())],
            ..Default::default()
        };
        let (handler, api, sender) = handler(api, |_| {});
        let dispatch = handler
            .on_message("group:1", "https://www.bilibili.com/video/BV1xx411c7mD")
            .await;
        assert!(matches!(dispatch, Dispatch::Handled));
        assert_eq!(texts(&sender), vec!["解析失败：啥都木有"]);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_errors_retried_three_times() {
        let (handler, api, sender) = handler(FakeApi::default(), |_| {});
        handler
            .on_message("group:1", "看 https://www.bilibili.com/video/BV1xx411c7mD")
            .await;
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            texts(&sender),
            vec!["解析失败，请稍后重试：网络请求失败: connection refused"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_link_failure_falls_back_to_original_url() {
        let (handler, api, sender) = handler(FakeApi::default(), |_| {});
        handler.on_message("group:1", "https://b23.tv/AbC123x").await;
        assert_eq!(api.redirects.load(Ordering::SeqCst), 3);
        // the original short link carries no video id
        assert_eq!(api.calls.load(Ordering::SeqCst), 0);
        assert_eq!(texts(&sender), vec!["无法识别的视频链接"]);
    }

    #[tokio::test]
    async fn test_duration_limit_checked_before_download() {
        let api = FakeApi {
            routes: vec![(VIEW, view_body(905))],
            redirect_to: Some("https://www.bilibili.com/video/BV1xx411c7mD?p=1".to_string()),
            ..Default::default()
        };
        let (handler, api, sender) = handler(api, |_| {});
        handler.on_message("private:42", "https://b23.tv/AbC123x").await;
        assert_eq!(
            texts(&sender),
            vec!["视频时长超过限制：视频时长为 15分5秒，最大允许时长为 10分0秒，已拒绝发送。"]
        );
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert!(sender.videos.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_strict_tier_from_message_text() {
        let play = json!({
            "code": 0,
            "data": { "dash": { "video": [
                { "id": 64, "baseUrl": "https://upos/64.m4s", "codecs": "avc1", "bandwidth": 1 },
                { "id": 32, "baseUrl": "https://upos/32.m4s", "codecs": "avc1", "bandwidth": 1 }
            ] } }
        })
        .to_string();
        let api = FakeApi {
            routes: vec![(NAV, nav_body()), (VIEW, view_body(60)), (PLAYURL, play)],
            ..Default::default()
        };
        let (handler, api, sender) = handler(api, |c| {
            c.bilibili.qn_strict = true;
            c.bilibili.sessdata = "abcdef%2C1234567890".to_string();
        });
        handler
            .on_message("group:1", "https://www.bilibili.com/video/BV1xx411c7mD qn=80")
            .await;
        assert_eq!(texts(&sender), vec!["解析失败：请求清晰度不可用: 1080P 高清"]);
        let seen = api.seen.lock().unwrap();
        assert!(seen.iter().any(|u| u.starts_with(PLAYURL) && u.contains("qn=80")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_ai_reply_spawns() {
        let (handler, _api, sender) = handler(FakeApi::default(), |c| {
            c.bilibili.block_ai_reply = true;
        });
        let dispatch = handler
            .on_message("group:1", "https://www.bilibili.com/read/cv1 https://b23.tv/x")
            .await;
        let Dispatch::Spawned(task) = dispatch else {
            panic!("expected a background task");
        };
        task.await.unwrap();
        assert_eq!(texts(&sender), vec!["无法识别的视频链接"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_stops_on_success() {
        let attempts = AtomicUsize::new(0);
        let value = with_retry("op", 3, Duration::from_secs(1), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(BiliApiError::SecurityControl)
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_compressed_path() {
        assert_eq!(
            compressed_path(Path::new("/tmp/bili/title_170001_279786.mp4")),
            PathBuf::from("/tmp/bili/title_170001_279786_compressed.mp4")
        );
        assert_eq!(compressed_path(Path::new("a.flv")), PathBuf::from("a_compressed.mp4"));
    }

    #[tokio::test]
    async fn test_size_limit_keeps_file_without_ffmpeg() {
        let dir = std::env::temp_dir().join(format!("bili_size_{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let video = dir.join("video.mp4");
        tokio::fs::write(&video, vec![0u8; 2048]).await.unwrap();

        // within the limit
        let (within, _, _) = handler(FakeApi::default(), |c| {
            c.ffmpeg.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
        });
        let mut temp_files = Vec::new();
        assert_eq!(within.compress_if_oversized(video.clone(), &mut temp_files).await, video);
        assert!(temp_files.is_empty());

        // over the limit, compression disabled
        let (disabled, _, _) = handler(FakeApi::default(), |c| {
            c.ffmpeg.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
            c.bilibili.max_video_size_mb = 0;
            c.bilibili.enable_video_compression = false;
        });
        assert_eq!(disabled.compress_if_oversized(video.clone(), &mut temp_files).await, video);
        assert!(temp_files.is_empty());

        // over the limit, ffmpeg missing
        let (missing, _, _) = handler(FakeApi::default(), |c| {
            c.ffmpeg.ffmpeg_path = "/nonexistent/ffmpeg".to_string();
            c.bilibili.max_video_size_mb = 0;
        });
        assert_eq!(missing.compress_if_oversized(video.clone(), &mut temp_files).await, video);
        assert!(temp_files.is_empty());

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn test_success_message() {
        let mut play = PlayInfo {
            sources: bili_api::ResolvedSources::Combined { urls: vec![] },
            quality: bili_api::QualityReport {
                requested_qn: 0,
                effective_qn: 64,
                selected_qn: Some(64),
                strict: false,
                fallback: false,
            },
        };
        assert_eq!(success_message(&play), "解析成功，已选择：720P 高清");
        play.quality.selected_qn = None;
        assert_eq!(success_message(&play), "解析成功");
    }
}
