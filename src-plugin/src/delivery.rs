use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::PluginError;

/// Where replies go. `dest` identifies the chat the message came from.
#[async_trait]
pub trait ChatSender: Send + Sync {
    async fn send_text(&self, dest: &str, text: &str) -> Result<(), PluginError>;

    /// Deliver a finished local video file.
    async fn send_video(&self, dest: &str, path: &Path) -> Result<(), PluginError>;
}

/// Prints replies to the log and keeps delivered videos in `output_dir`.
pub struct ConsoleSender {
    output_dir: PathBuf,
}

impl ConsoleSender {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl ChatSender for ConsoleSender {
    async fn send_text(&self, dest: &str, text: &str) -> Result<(), PluginError> {
        log::info!("[{dest}] {text}");
        Ok(())
    }

    async fn send_video(&self, dest: &str, path: &Path) -> Result<(), PluginError> {
        let file_name = path.file_name().ok_or_else(|| PluginError::Delivery {
            reason: format!("not a file: {}", path.display()),
        })?;
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let target = self.output_dir.join(file_name);
        let size = tokio::fs::copy(path, &target).await?;
        log::info!(
            "[{dest}] video delivered: {} ({:.2} MB)",
            target.display(),
            size as f64 / 1024.0 / 1024.0
        );
        Ok(())
    }
}
