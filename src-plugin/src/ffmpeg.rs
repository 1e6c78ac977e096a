use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_ffmpeg_sidecar::{event::FfmpegEvent, log_parser::FfmpegLogParser};
use tokio::io::BufReader;

use crate::config::FfmpegSection;
use crate::errors::PluginError;

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;
#[cfg(target_os = "windows")]
#[allow(unused_imports)]
use std::os::windows::process::CommandExt;

/// How many trailing log lines end up in an error message.
const ERROR_TAIL_LINES: usize = 5;

/// Compression stops raising the CRF once it has reached this value.
pub const MAX_COMPRESSION_CRF: u32 = 35;
const COMPRESSION_CRF_STEP: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeOutcome {
    /// Video and audio muxed together.
    Merged,
    /// Audio could not be muxed, output holds the video track only.
    VideoOnly,
}

#[derive(Debug, Clone)]
pub struct FfmpegTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTool {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    pub fn from_config(config: &FfmpegSection) -> Self {
        Self::new(&config.ffmpeg_path, &config.ffprobe_path)
    }

    fn command(program: &Path) -> tokio::process::Command {
        #[allow(unused_mut)]
        let mut cmd = tokio::process::Command::new(program);
        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);
        cmd
    }

    /// Run `ffmpeg -version` and return the reported version.
    pub async fn check(&self) -> Result<String, PluginError> {
        let child = Self::command(&self.ffmpeg)
            .arg("-version")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn();
        let mut child = child.map_err(|e| {
            PluginError::FfmpegError(format!("Failed to spawn ffmpeg process: {e}"))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::FfmpegError("Failed to take ffmpeg output".into()))?;
        let reader = BufReader::new(stdout);
        let mut parser = FfmpegLogParser::new(reader);

        let mut version = None;
        while let Ok(event) = parser.parse_next_event().await {
            match event {
                FfmpegEvent::ParsedVersion(v) => version = Some(v.version),
                FfmpegEvent::LogEOF => break,
                _ => {}
            }
        }
        let _ = child.wait().await;

        version.ok_or_else(|| PluginError::FfmpegError("Failed to parse version from output".into()))
    }

    pub async fn is_available(&self) -> bool {
        match self.check().await {
            Ok(version) => {
                log::debug!("ffmpeg {version} available");
                true
            }
            Err(e) => {
                log::warn!("ffmpeg unavailable: {e}");
                false
            }
        }
    }

    /// Mux `video` and `audio` into `output`. When that fails the video track
    /// alone is remuxed so the caller still has something to send.
    pub async fn merge(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
    ) -> Result<MergeOutcome, PluginError> {
        match self.run(&merge_args(video, audio, output)).await {
            Ok(()) => Ok(MergeOutcome::Merged),
            Err(merge_error) => {
                log::warn!("Audio merge failed: {merge_error}, falling back to video only");
                self.remux(video, output).await?;
                Ok(MergeOutcome::VideoOnly)
            }
        }
    }

    /// Copy streams from `input` into a new container at `output`.
    pub async fn remux(&self, input: &Path, output: &Path) -> Result<(), PluginError> {
        self.run(&remux_args(input, output)).await
    }

    /// Re-encode `input` into `output` with libx264, starting at `crf` and
    /// raising it while the result is still larger than `max_bytes`.
    ///
    /// Returns the size of the last encode, which may still exceed the
    /// limit once the CRF cap is reached.
    pub async fn compress(
        &self,
        input: &Path,
        output: &Path,
        max_bytes: u64,
        crf: u32,
    ) -> Result<u64, PluginError> {
        let input_size = tokio::fs::metadata(input).await?.len();
        let mut crf = crf;
        loop {
            log::info!(
                "Compressing {} ({:.2} MB) with crf={crf}",
                input.display(),
                megabytes(input_size)
            );
            self.run(&compress_args(input, output, crf)).await?;
            let size = tokio::fs::metadata(output).await?.len();
            log::info!(
                "Compressed to {:.2} MB ({:.1}% smaller)",
                megabytes(size),
                (1.0 - size as f64 / input_size.max(1) as f64) * 100.0
            );
            if size <= max_bytes || crf >= MAX_COMPRESSION_CRF {
                return Ok(size);
            }
            crf += COMPRESSION_CRF_STEP;
            log::debug!("Output still over {:.2} MB, retrying with crf={crf}", megabytes(max_bytes));
        }
    }

    /// Container duration in seconds.
    pub async fn probe_duration(&self, file: &Path) -> Result<f64, PluginError> {
        let output = Self::command(&self.ffprobe)
            .args(["-v", "error"])
            .args(["-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(file)
            .output()
            .await
            .map_err(|e| PluginError::FfmpegError(format!("执行ffprobe失败: {e}")))?;

        if !output.status.success() {
            return Err(PluginError::FfmpegError(format!(
                "ffprobe执行失败: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let duration = parse_duration_output(&stdout).ok_or_else(|| {
            PluginError::FfmpegError(format!("Failed to parse duration: '{}'", stdout.trim()))
        })?;
        log::debug!("Video duration: {duration}s");
        Ok(duration)
    }

    async fn run(&self, args: &[String]) -> Result<(), PluginError> {
        log::debug!("Running {} {}", self.ffmpeg.display(), args.join(" "));
        let child = Self::command(&self.ffmpeg)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = child.map_err(|e| {
            PluginError::FfmpegError(format!("Failed to spawn ffmpeg process: {e}"))
        })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PluginError::FfmpegError("Failed to take ffmpeg output".into()))?;
        let reader = BufReader::new(stderr);
        let mut parser = FfmpegLogParser::new(reader);

        let mut tail: Vec<String> = Vec::new();
        while let Ok(event) = parser.parse_next_event().await {
            match event {
                FfmpegEvent::Log(_level, content) => {
                    if tail.len() == ERROR_TAIL_LINES {
                        tail.remove(0);
                    }
                    tail.push(content);
                }
                FfmpegEvent::LogEOF => break,
                FfmpegEvent::Error(e) => {
                    log::error!("[FFmpeg Error] {e}");
                }
                _ => {}
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(PluginError::FfmpegError(format!(
                "ffmpeg exited with {status}: {}",
                tail.join(" | ")
            )));
        }
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn merge_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
    vec![
        "-i".into(),
        path_arg(video),
        "-i".into(),
        path_arg(audio),
        "-c:v".into(),
        "copy".into(),
        "-c:a".into(),
        "aac".into(),
        "-movflags".into(),
        "+faststart".into(),
        "-y".into(),
        path_arg(output),
    ]
}

fn remux_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-i".into(),
        path_arg(input),
        "-c".into(),
        "copy".into(),
        "-movflags".into(),
        "+faststart".into(),
        "-y".into(),
        path_arg(output),
    ]
}

fn compress_args(input: &Path, output: &Path, crf: u32) -> Vec<String> {
    vec![
        "-i".into(),
        path_arg(input),
        "-c:v".into(),
        "libx264".into(),
        "-crf".into(),
        crf.to_string(),
        "-preset".into(),
        "medium".into(),
        "-c:a".into(),
        "aac".into(),
        "-b:a".into(),
        "128k".into(),
        "-movflags".into(),
        "+faststart".into(),
        "-y".into(),
        path_arg(output),
    ]
}

pub fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

/// Whether a file of `size` bytes is over a limit given in MB.
pub fn exceeds_size_limit(size: u64, max_mb: u64) -> bool {
    size > max_mb.saturating_mul(1024 * 1024)
}

/// Parse ffprobe's bare `format=duration` output.
pub fn parse_duration_output(output: &str) -> Option<f64> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())?
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
}

/// Whether a downloaded single file has to be remuxed before sending.
pub fn needs_mp4_remux(path: &Path) -> bool {
    !path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false)
}
