use std::path::{Path, PathBuf};

use bili_api::{quality, ResolveOptions};
use serde::{Deserialize, Serialize};

use crate::errors::PluginError;

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub plugin: PluginSection,
    #[serde(default)]
    pub bilibili: BilibiliSection,
    #[serde(default)]
    pub download: DownloadSection,
    #[serde(default)]
    pub ffmpeg: FfmpegSection,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct PluginSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Also write logs to this file when set.
    #[serde(default)]
    pub log_file: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct BilibiliSection {
    #[serde(default)]
    pub sessdata: String,
    #[serde(default)]
    pub buvid3: String,
    /// 0 for automatic: 720P with SESSDATA, 480P without.
    #[serde(default)]
    pub qn: i64,
    #[serde(default)]
    pub qn_strict: bool,
    #[serde(default)]
    pub require_audio: bool,
    #[serde(default = "default_true")]
    pub enable_duration_limit: bool,
    /// Seconds.
    #[serde(default = "default_max_video_duration")]
    pub max_video_duration: i64,
    /// Handle links in the background and let the message flow continue.
    #[serde(default = "default_true")]
    pub block_ai_reply: bool,
    /// Re-encode files larger than `max_video_size_mb` before sending.
    #[serde(default = "default_true")]
    pub enable_video_compression: bool,
    #[serde(default = "default_max_video_size_mb")]
    pub max_video_size_mb: u64,
    /// x264 CRF the first compression pass starts at, 1-51.
    #[serde(default = "default_compression_quality")]
    pub compression_quality: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DownloadSection {
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    /// Extra passes over the mirror list after the first one fails.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct FfmpegSection {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_video_duration() -> i64 {
    600
}

fn default_max_video_size_mb() -> u64 {
    100
}

fn default_compression_quality() -> u32 {
    23
}

fn default_temp_dir() -> String {
    std::env::temp_dir()
        .join("bili_video_sender")
        .to_string_lossy()
        .to_string()
}

fn default_retries() -> u32 {
    1
}

fn default_ffmpeg_path() -> String {
    if cfg!(windows) {
        "ffmpeg.exe".to_string()
    } else {
        "ffmpeg".to_string()
    }
}

fn default_ffprobe_path() -> String {
    if cfg!(windows) {
        "ffprobe.exe".to_string()
    } else {
        "ffprobe".to_string()
    }
}

impl Default for PluginSection {
    fn default() -> Self {
        Self {
            enabled: true,
            log_level: default_log_level(),
            log_file: String::new(),
        }
    }
}

impl Default for BilibiliSection {
    fn default() -> Self {
        Self {
            sessdata: String::new(),
            buvid3: String::new(),
            qn: 0,
            qn_strict: false,
            require_audio: false,
            enable_duration_limit: true,
            max_video_duration: default_max_video_duration(),
            block_ai_reply: true,
            enable_video_compression: true,
            max_video_size_mb: default_max_video_size_mb(),
            compression_quality: default_compression_quality(),
        }
    }
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            retries: default_retries(),
        }
    }
}

impl Default for FfmpegSection {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
        }
    }
}

/// Findings of [`Config::validate`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Validation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub recommendations: Vec<String>,
}

impl Validation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Config {
    /// Read `path`; a missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("Config {} not found, using defaults", path.display());
                Ok(Config::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), PluginError> {
        let content = toml::to_string(&self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn temp_dir(&self) -> PathBuf {
        PathBuf::from(&self.download.temp_dir)
    }

    fn non_empty(value: &str) -> Option<String> {
        let value = value.trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }

    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            sessdata: Self::non_empty(&self.bilibili.sessdata),
            buvid3: Self::non_empty(&self.bilibili.buvid3),
            qn: self.bilibili.qn,
            qn_strict: self.bilibili.qn_strict,
            require_audio: self.bilibili.require_audio,
        }
    }

    pub fn validate(&self) -> Validation {
        let mut result = Validation::default();
        let sessdata = self.bilibili.sessdata.trim();
        let buvid3 = self.bilibili.buvid3.trim();

        if sessdata.is_empty() {
            result.warnings.push("未配置SESSDATA，将使用游客模式".to_string());
            result
                .recommendations
                .push("建议配置SESSDATA以获得更好的清晰度和功能".to_string());
        } else if sessdata.len() < 10 {
            result.errors.push("SESSDATA长度异常，可能配置错误".to_string());
        }

        if buvid3.is_empty() {
            result
                .recommendations
                .push("未配置Buvid3（可选），如需生成session参数可补充".to_string());
        } else if buvid3.len() < 10 {
            result
                .warnings
                .push("Buvid3长度异常，可能配置错误（非必填）".to_string());
        }

        let qn = self.bilibili.qn;
        if qn < 0 {
            result.errors.push(format!("qn={qn} 无效"));
        } else if qn != 0 && !quality::is_known_qn(qn) {
            result
                .warnings
                .push(format!("qn={qn} 不在常见清晰度列表，可能无效"));
        }
        let effective = quality::effective_qn(qn, !sessdata.is_empty());
        result
            .warnings
            .extend(quality::privilege_warnings(effective, !sessdata.is_empty()));

        if self.bilibili.enable_duration_limit && self.bilibili.max_video_duration <= 0 {
            result
                .errors
                .push("max_video_duration 必须大于 0".to_string());
        }

        if self.bilibili.max_video_size_mb == 0 {
            result
                .errors
                .push("max_video_size_mb 必须大于 0".to_string());
        }
        if self.bilibili.enable_video_compression
            && !(1..=51).contains(&self.bilibili.compression_quality)
        {
            result
                .errors
                .push("compression_quality 必须在 1-51 之间".to_string());
        } else if self.bilibili.compression_quality > 28 {
            result
                .recommendations
                .push("compression_quality 推荐 18-28，数值越大画质越差".to_string());
        }

        result
    }
}
