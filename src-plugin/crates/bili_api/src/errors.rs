use crate::quality;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BiliApiError {
    #[error("网络请求失败: {reason}")]
    Network { reason: String },
    #[error("Invalid response status: {status}")]
    InvalidResponseStatus { status: reqwest::StatusCode },
    #[error("Security control error")]
    SecurityControl,
    #[error("响应数据格式错误: {reason}")]
    MalformedResponse { reason: String },
    #[error("{message}")]
    Api { code: i64, message: String },
    #[error("WBI key length insufficient: {len}")]
    SigningKey { len: usize },
    #[error("未找到视频流")]
    NoVideoStream,
    #[error("未获取到播放地址")]
    NoPlaybackSource,
    #[error("未找到音频流")]
    MissingAudio,
    #[error("请求清晰度不可用: {}", quality::qn_name(*qn))]
    StrictTierUnavailable { qn: i64 },
    #[error("Invalid video link: {url}")]
    InvalidLink { url: String },
    #[error("视频没有可用分P")]
    EmptyPages,
}

impl BiliApiError {
    /// Transport and parse failures may succeed on a later attempt; everything
    /// else is a definitive answer from the platform or from stream selection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BiliApiError::Network { .. }
                | BiliApiError::InvalidResponseStatus { .. }
                | BiliApiError::SecurityControl
                | BiliApiError::MalformedResponse { .. }
        )
    }
}

impl From<reqwest::Error> for BiliApiError {
    fn from(value: reqwest::Error) -> Self {
        Self::Network {
            reason: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for BiliApiError {
    fn from(value: serde_json::Error) -> Self {
        Self::MalformedResponse {
            reason: value.to_string(),
        }
    }
}
