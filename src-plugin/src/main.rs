mod config;
mod delivery;
mod downloader;
mod errors;
mod ffmpeg;
mod handler;

use std::path::PathBuf;
use std::sync::Arc;

use bili_api::{ApiClient, BiliResolver};
use clap::Parser;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, TermLogger,
    TerminalMode, WriteLogger,
};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Config;
use crate::delivery::ConsoleSender;
use crate::errors::PluginError;
use crate::handler::{Dispatch, MessageHandler};

/// Send the Bilibili videos linked in chat messages back to the chat.
#[derive(Parser)]
#[command(name = "bili-video-sender", version, about)]
struct Cli {
    /// TOML config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Chat the messages come from
    #[arg(short, long, default_value = "console")]
    dest: String,

    /// Directory delivered videos are copied to
    #[arg(short, long, default_value = "output")]
    output: PathBuf,

    /// Overrides `plugin.log_level`
    #[arg(long)]
    log_level: Option<String>,

    /// Message text. Messages are read from stdin, one per line, when omitted.
    text: Vec<String>,
}

fn init_logger(level: &str, log_file: &str) -> Result<(), PluginError> {
    let level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
    let config = ConfigBuilder::new()
        .add_filter_ignore_str("hyper")
        .add_filter_ignore_str("reqwest")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];
    if !log_file.is_empty() {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)?;
        loggers.push(WriteLogger::new(level, config, file));
    }
    CombinedLogger::init(loggers).map_err(|e| PluginError::Config {
        reason: e.to_string(),
    })
}

fn log_validation(config: &Config) {
    let validation = config.validate();
    for error in &validation.errors {
        log::error!("配置错误: {error}");
    }
    for warning in &validation.warnings {
        log::warn!("配置警告: {warning}");
    }
    for recommendation in &validation.recommendations {
        log::info!("配置建议: {recommendation}");
    }
    if !validation.is_valid() {
        log::error!("配置验证失败，但继续尝试处理");
    }
}

#[tokio::main]
async fn main() -> Result<(), PluginError> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let created_config = !cli.config.exists();
    if created_config {
        config.save(&cli.config)?;
    }
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.plugin.log_level.clone());
    init_logger(&level, &config.plugin.log_file)?;
    if created_config {
        log::info!("Default config written to {}", cli.config.display());
    }

    if !config.plugin.enabled {
        log::info!("Plugin disabled in {}", cli.config.display());
        return Ok(());
    }
    log_validation(&config);

    let http = Arc::new(ApiClient::new()?);
    let resolver = Arc::new(BiliResolver::new(http));
    let sender = Arc::new(ConsoleSender::new(&cli.output));
    let handler = MessageHandler::new(Arc::new(config), resolver, sender)?;

    let mut tasks = Vec::new();
    if cli.text.is_empty() {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            if let Dispatch::Spawned(task) = handler.on_message(&cli.dest, &line).await {
                tasks.push(task);
            }
        }
    } else if let Dispatch::Spawned(task) = handler.on_message(&cli.dest, &cli.text.join(" ")).await {
        tasks.push(task);
    }

    for task in tasks {
        if let Err(e) = task.await {
            log::error!("Message task failed: {e}");
        }
    }
    Ok(())
}
