use clap::{Args, Parser, ValueEnum};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Json => "json",
        })
    }
}

#[derive(Clone, Debug, Default, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    #[command(flatten)]
    pub messaging: MessagingConfig,

    #[command(flatten)]
    pub presence: PresenceConfig,

    #[command(flatten)]
    pub attachments: AttachmentConfig,

    #[command(flatten)]
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, Args)]
pub struct MessagingConfig {
    /// Width of the recent-timestamp window used to match a remote echo
    /// against a provisional local message, in seconds
    #[arg(long, env = "WAVELINE_CORRELATION_WINDOW_SECS", default_value_t = 30)]
    pub correlation_window_secs: i64,

    /// Maximum length of the conversation-list preview snippet
    #[arg(long, env = "WAVELINE_PREVIEW_MAX_CHARS", default_value_t = 80)]
    pub preview_max_chars: usize,

    /// Capacity of each change/message push feed
    #[arg(long, env = "WAVELINE_FEED_CAPACITY", default_value_t = 64)]
    pub feed_capacity: usize,
}

#[derive(Clone, Debug, Args)]
pub struct PresenceConfig {
    /// How long a peer's typing indicator stays up without a refresh
    #[arg(long, env = "WAVELINE_TYPING_EXPIRY_MS", default_value_t = 3000)]
    pub typing_expiry_ms: u64,

    /// Capacity of each per-conversation typing topic
    #[arg(long, env = "WAVELINE_TYPING_CHANNEL_CAPACITY", default_value_t = 16)]
    pub channel_capacity: usize,
}

#[derive(Clone, Debug, Args)]
pub struct AttachmentConfig {
    /// Max attachment size in bytes (Default: 5MB)
    #[arg(long, env = "WAVELINE_ATTACHMENT_MAX_SIZE_BYTES", default_value_t = 5_242_880)]
    pub max_size_bytes: usize,
}

#[derive(Clone, Debug, Args)]
pub struct TelemetryConfig {
    /// Log output format
    #[arg(long, env = "WAVELINE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Attachment content types accepted for upload. Anything else is rejected
/// locally before the blob store is contacted.
pub const ALLOWED_MEDIA_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];

impl Config {
    /// Parses configuration from argv and the `WAVELINE_*` environment.
    #[must_use]
    pub fn load() -> Self {
        Self::parse()
    }
}

// The host app parses from the environment; the library and the tests build
// configs directly, so the clap defaults are mirrored here.
impl Default for MessagingConfig {
    fn default() -> Self {
        Self { correlation_window_secs: 30, preview_max_chars: 80, feed_capacity: 64 }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { typing_expiry_ms: 3000, channel_capacity: 16 }
    }
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self { max_size_bytes: 5_242_880 }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { log_format: LogFormat::Text }
    }
}
