use bili_api::BiliApiError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("{0}")]
    Api(#[from] BiliApiError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("Config error: {reason}")]
    Config { reason: String },
    #[error("Ffmpeg error: {0}")]
    FfmpegError(String),
    #[error("All {tried} download urls failed: {last_error}")]
    DownloadFailed { tried: usize, last_error: String },
    #[error("Video duration {duration}s exceeds limit {limit}s")]
    DurationExceeded { duration: i64, limit: i64 },
    #[error("Delivery failed: {reason}")]
    Delivery { reason: String },
}

impl From<toml::de::Error> for PluginError {
    fn from(value: toml::de::Error) -> Self {
        Self::Config {
            reason: value.to_string(),
        }
    }
}

impl From<toml::ser::Error> for PluginError {
    fn from(value: toml::ser::Error) -> Self {
        Self::Config {
            reason: value.to_string(),
        }
    }
}

impl PluginError {
    /// Short chat message for a failed request, preferring the platform's own text.
    pub fn user_message(&self) -> String {
        match self {
            PluginError::Api(BiliApiError::InvalidLink { .. }) => "无法识别的视频链接".to_string(),
            PluginError::Api(e) if e.is_retryable() => format!("解析失败，请稍后重试：{e}"),
            PluginError::Api(e) => format!("解析失败：{e}"),
            PluginError::DurationExceeded { duration, limit } => format!(
                "视频时长超过限制：视频时长为 {}分{}秒，最大允许时长为 {}分{}秒，已拒绝发送。",
                duration / 60,
                duration % 60,
                limit / 60,
                limit % 60
            ),
            PluginError::DownloadFailed { .. } | PluginError::HttpError(_) => {
                "视频下载失败，请稍后重试".to_string()
            }
            PluginError::FfmpegError(_) => "视频处理失败".to_string(),
            PluginError::Delivery { .. } => {
                "视频解析成功，但发送失败。请检查网络连接和API配置。".to_string()
            }
            PluginError::IoError(_) | PluginError::Config { .. } => "处理视频时发生错误".to_string(),
        }
    }
}
