use std::path::{Path, PathBuf};
use std::time::Duration;

use bili_api::{user_agent, ResolvedSources};
use tokio::io::AsyncWriteExt;

use crate::errors::PluginError;

/// Connect timeout, and the longest wait for the next chunk of a body.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

const TITLE_MAX_CHARS: usize = 50;

/// Files a [`Downloader`] produced for one set of sources.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadedMedia {
    Single(PathBuf),
    Split {
        video: PathBuf,
        audio: Option<PathBuf>,
    },
}

impl DownloadedMedia {
    pub fn paths(&self) -> Vec<PathBuf> {
        match self {
            DownloadedMedia::Single(path) => vec![path.clone()],
            DownloadedMedia::Split { video, audio } => {
                let mut paths = vec![video.clone()];
                paths.extend(audio.iter().cloned());
                paths
            }
        }
    }
}

/// Temp file stem: sanitized title plus ids and a millisecond stamp.
pub fn temp_stem(title: &str, aid: i64, cid: i64, now_ms: i64) -> String {
    let title: String = sanitize_filename::sanitize(title)
        .chars()
        .filter(|c| !c.is_whitespace())
        .take(TITLE_MAX_CHARS)
        .collect();
    let title = if title.is_empty() {
        "video".to_string()
    } else {
        title
    };
    format!("{title}_{aid}_{cid}_{now_ms}")
}

/// Container extension of a combined-file url, `flv` when the path has none.
pub fn url_extension(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .and_then(|name| {
            Path::new(&name)
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
        })
        .filter(|ext| !ext.is_empty() && ext.len() <= 4)
        .unwrap_or_else(|| "flv".to_string())
}

fn progress_step(downloaded: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (downloaded * 10 / total).min(10)
}

pub struct Downloader {
    client: reqwest::Client,
    cookie: Option<String>,
    retries: u32,
}

impl Downloader {
    pub fn new(cookie: Option<String>, retries: u32) -> Result<Self, PluginError> {
        let client = reqwest::Client::builder()
            .connect_timeout(DOWNLOAD_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            cookie,
            retries,
        })
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = user_agent::default_headers();
        headers.insert(
            reqwest::header::ORIGIN,
            reqwest::header::HeaderValue::from_static(user_agent::ORIGIN),
        );
        headers.insert(
            reqwest::header::RANGE,
            reqwest::header::HeaderValue::from_static("bytes=0-"),
        );
        if let Some(cookie) = self.cookie.as_ref().and_then(|c| c.parse().ok()) {
            headers.insert(reqwest::header::COOKIE, cookie);
        }
        headers
    }

    /// Download every track of `sources` into `dir`. Video is mandatory,
    /// a failed audio download degrades to video only.
    pub async fn download(
        &self,
        sources: &ResolvedSources,
        dir: &Path,
        stem: &str,
    ) -> Result<DownloadedMedia, PluginError> {
        tokio::fs::create_dir_all(dir).await?;
        match sources {
            ResolvedSources::Combined { urls } => {
                let ext = urls
                    .first()
                    .map(|u| url_extension(u))
                    .unwrap_or_else(|| "flv".to_string());
                let path = dir.join(format!("{stem}.{ext}"));
                self.download_any(urls, &path).await?;
                Ok(DownloadedMedia::Single(path))
            }
            ResolvedSources::Split {
                video_urls,
                audio_urls,
            } => {
                let video = dir.join(format!("{stem}_video.m4s"));
                self.download_any(video_urls, &video).await?;

                let audio = if audio_urls.is_empty() {
                    None
                } else {
                    let path = dir.join(format!("{stem}_audio.m4s"));
                    match self.download_any(audio_urls, &path).await {
                        Ok(()) => Some(path),
                        Err(e) => {
                            log::warn!("Audio download failed, continuing with video only: {e}");
                            None
                        }
                    }
                };
                Ok(DownloadedMedia::Split { video, audio })
            }
        }
    }

    /// Try `urls` in order until one downloads completely.
    pub async fn download_any(&self, urls: &[String], dest: &Path) -> Result<(), PluginError> {
        let mut last_error = "no url".to_string();
        for pass in 0..=self.retries {
            for (i, url) in urls.iter().enumerate() {
                log::info!(
                    "Downloading {} from mirror {}/{} (pass {})",
                    dest.display(),
                    i + 1,
                    urls.len(),
                    pass + 1
                );
                match self.download_file(url, dest).await {
                    Ok(size) => {
                        log::info!("Downloaded {} ({size} bytes)", dest.display());
                        return Ok(());
                    }
                    Err(e) => {
                        log::warn!("Download from {url} failed: {e}");
                        let _ = tokio::fs::remove_file(dest).await;
                        last_error = e.to_string();
                    }
                }
            }
        }
        Err(PluginError::DownloadFailed {
            tried: urls.len(),
            last_error,
        })
    }

    async fn download_file(&self, url: &str, dest: &Path) -> Result<u64, PluginError> {
        let mut response = self
            .client
            .get(url)
            .headers(self.headers())
            .send()
            .await?
            .error_for_status()?;
        let total = response.content_length().unwrap_or(0);
        let mut file = tokio::fs::File::create(dest).await?;

        let mut downloaded: u64 = 0;
        let mut last_step = 0;
        loop {
            let chunk = tokio::time::timeout(DOWNLOAD_TIMEOUT, response.chunk())
                .await
                .map_err(|_| PluginError::DownloadFailed {
                    tried: 1,
                    last_error: format!("no data for {}s", DOWNLOAD_TIMEOUT.as_secs()),
                })??;
            let Some(chunk) = chunk else {
                break;
            };
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let step = progress_step(downloaded, total);
            if step > last_step {
                last_step = step;
                log::info!("Download progress: {}% ({downloaded}/{total})", step * 10);
            }
        }
        file.flush().await?;

        if total > 0 && downloaded < total {
            return Err(PluginError::DownloadFailed {
                tried: 1,
                last_error: format!("incomplete body: {downloaded}/{total} bytes"),
            });
        }
        if downloaded == 0 {
            return Err(PluginError::DownloadFailed {
                tried: 1,
                last_error: "empty body".to_string(),
            });
        }
        Ok(downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves `/ok` with a body, `/short` with a truncated one and 404 for the rest.
    async fn serve(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut request = Vec::new();
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        request.extend_from_slice(&buf[..n]);
                    }
                    let request = String::from_utf8_lossy(&request).to_string();
                    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                    let response = match path.as_str() {
                        "/ok" | "/ok.mp4" => {
                            let mut r = format!(
                                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                body.len()
                            )
                            .into_bytes();
                            r.extend_from_slice(body);
                            r
                        }
                        "/short" => {
                            let mut r = format!(
                                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                body.len() * 2
                            )
                            .into_bytes();
                            r.extend_from_slice(body);
                            r
                        }
                        _ => b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_vec(),
                    };
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("bili_download_{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_download_falls_through_mirrors() {
        let base = serve(b"0123456789").await;
        let dir = temp_dir();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let dest = dir.join("video.m4s");

        let downloader = Downloader::new(Some("SESSDATA=abc".to_string()), 0).unwrap();
        downloader
            .download_any(
                &[format!("{base}/missing"), format!("{base}/short"), format!("{base}/ok")],
                &dest,
            )
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"0123456789");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_download_all_mirrors_fail() {
        let base = serve(b"0123456789").await;
        let dir = temp_dir();
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let dest = dir.join("video.m4s");

        let downloader = Downloader::new(None, 1).unwrap();
        let err = downloader
            .download_any(&[format!("{base}/missing"), format!("{base}/short")], &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::DownloadFailed { tried: 2, .. }));
        assert!(!dest.exists());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_download_split_without_audio() {
        let base = serve(b"video bytes").await;
        let dir = temp_dir();
        let downloader = Downloader::new(None, 0).unwrap();

        let media = downloader
            .download(
                &ResolvedSources::Split {
                    video_urls: vec![format!("{base}/ok")],
                    audio_urls: vec![format!("{base}/missing")],
                },
                &dir,
                "title_1_2_3",
            )
            .await
            .unwrap();
        assert_eq!(
            media,
            DownloadedMedia::Split {
                video: dir.join("title_1_2_3_video.m4s"),
                audio: None,
            }
        );

        let media = downloader
            .download(
                &ResolvedSources::Combined {
                    urls: vec![format!("{base}/ok.mp4")],
                },
                &dir,
                "title_1_2_4",
            )
            .await
            .unwrap();
        assert_eq!(media.paths(), vec![dir.join("title_1_2_4.mp4")]);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[test]
    fn test_temp_stem() {
        assert_eq!(
            temp_stem("【测试】a/b: c?", 170001, 279786, 1700000000000),
            "【测试】abc_170001_279786_1700000000000"
        );
        assert_eq!(temp_stem("///", 1, 2, 3), "video_1_2_3");
        let long = "长".repeat(80);
        assert_eq!(
            temp_stem(&long, 1, 2, 3).chars().count(),
            TITLE_MAX_CHARS + "_1_2_3".len()
        );
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(url_extension("https://upos/abc.flv?e=1&deadline=2"), "flv");
        assert_eq!(url_extension("https://upos/abc.MP4"), "mp4");
        assert_eq!(url_extension("https://upos/abc"), "flv");
        assert_eq!(url_extension("not a url"), "flv");
    }

    #[test]
    fn test_progress_step() {
        assert_eq!(progress_step(0, 100), 0);
        assert_eq!(progress_step(19, 100), 1);
        assert_eq!(progress_step(100, 100), 10);
        assert_eq!(progress_step(50, 0), 0);
    }
}
