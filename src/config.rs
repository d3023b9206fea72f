use std::{str::FromStr, time::Duration};

use envconfig::Envconfig;

/// Operator configuration, read once at startup and handed to every reconciler.
#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// Image used when neither the cluster nor the server names one
    #[envconfig(from = "SQ_DEFAULT_IMAGE", default = "sonarqube")]
    pub default_image: String,

    /// Size of the data and extensions claims when the spec leaves them empty
    #[envconfig(from = "SQ_DEFAULT_VOLUME_SIZE", default = "1Gi")]
    pub default_volume_size: String,

    /// Delay before a progressing object is looked at again.
    /// Env: SQ_REQUEUE_SECS
    #[envconfig(from = "SQ_REQUEUE_SECS", default = "5")]
    pub requeue_secs: u64,

    /// Delay before an object whose reconciliation failed unexpectedly is retried.
    /// Env: SQ_ERROR_REQUEUE_SECS
    #[envconfig(from = "SQ_ERROR_REQUEUE_SECS", default = "60")]
    pub error_requeue_secs: u64,

    /// Require `/api/system/ping` to answer before a running server is healthy
    #[envconfig(from = "SQ_PING_SERVERS", default = "false")]
    pub ping_servers: bool,

    #[envconfig(from = "SQ_LOG_FORMAT", default = "text")]
    pub log_format: LogFormat,

    #[envconfig(from = "HTTP_PORT", default = "8080")]
    pub http_port: u16,
}

impl Config {
    pub fn requeue(&self) -> Duration {
        Duration::from_secs(self.requeue_secs)
    }

    pub fn error_requeue(&self) -> Duration {
        Duration::from_secs(self.error_requeue_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_image: "sonarqube".into(),
            default_volume_size: "1Gi".into(),
            requeue_secs: 5,
            error_requeue_secs: 60,
            ping_servers: false,
            log_format: LogFormat::Text,
            http_port: 8080,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "plain" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {other}")),
        }
    }
}
