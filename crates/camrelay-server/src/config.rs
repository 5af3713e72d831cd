use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    #[serde(default = "default_session_queue_depth")]
    pub session_queue_depth: usize,
    #[serde(default = "default_pipeline_capacity")]
    pub pipeline_capacity: usize,
    #[serde(
        default = "default_admission_timeout",
        deserialize_with = "camrelay_helpers::de::deserialize_duration_millis"
    )]
    pub admission_timeout: Duration,
    #[serde(
        default = "default_keepalive_interval",
        deserialize_with = "camrelay_helpers::de::deserialize_duration"
    )]
    pub keepalive_interval: Duration,
    #[serde(
        default = "default_keepalive_timeout",
        deserialize_with = "camrelay_helpers::de::deserialize_duration"
    )]
    pub keepalive_timeout: Duration,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Loads the configuration from the CLI argument, the
    /// `CAMRELAY_CONFIG_PATH` environment variable, or the well-known
    /// file locations. Every key has a default, so a missing file yields
    /// a usable configuration.
    pub fn load() -> Result<Self> {
        let config_path =
            parse_config_path_arg(env::args().skip(1))?.or_else(resolve_config_path);

        let mut config = match config_path {
            Some(path) => load_config_yaml(&path)?,
            None => Self::defaults(),
        };
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn defaults() -> Self {
        Self {
            listen: default_listen(),
            max_message_bytes: default_max_message_bytes(),
            session_queue_depth: default_session_queue_depth(),
            pipeline_capacity: default_pipeline_capacity(),
            admission_timeout: default_admission_timeout(),
            keepalive_interval: default_keepalive_interval(),
            keepalive_timeout: default_keepalive_timeout(),
            rate_limit: RateLimitConfig::default(),
        }
    }

    fn normalize(&mut self) {
        self.listen = self.listen.trim().to_string();
        if self.listen.is_empty() {
            self.listen = default_listen();
        }

        self.max_message_bytes = self.max_message_bytes.max(64 * 1024);
        self.session_queue_depth = self.session_queue_depth.max(1);
        self.pipeline_capacity = self.pipeline_capacity.max(1);
        self.admission_timeout =
            self.admission_timeout.max(Duration::from_millis(1));
        self.keepalive_interval =
            self.keepalive_interval.max(Duration::from_secs(1));
        self.keepalive_timeout =
            self.keepalive_timeout.max(Duration::from_secs(1));
        self.rate_limit.normalize();
    }

    fn validate(&self) -> Result<()> {
        if !self.listen.contains(':') {
            bail!("config `listen` must be host:port, got {}", self.listen);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(
        default = "default_rate_window",
        deserialize_with = "camrelay_helpers::de::deserialize_duration"
    )]
    pub window: Duration,
    #[serde(default = "default_rate_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_rate_exempt")]
    pub exempt: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: default_rate_window(),
            max_connections: default_rate_max_connections(),
            exempt: default_rate_exempt(),
        }
    }
}

impl RateLimitConfig {
    fn normalize(&mut self) {
        self.window = self.window.max(Duration::from_secs(1));
        self.max_connections = self.max_connections.max(1);
        self.exempt = self
            .exempt
            .iter()
            .map(|entry| entry.trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect();
    }
}

fn parse_config_path_arg<I>(mut args: I) -> Result<Option<PathBuf>>
where
    I: Iterator<Item = String>,
{
    let first = args.next();
    let second = args.next();

    if let Some(arg) = second {
        bail!("too many arguments: {arg} (usage: camrelay-server [config-path])");
    }

    if matches!(first.as_deref(), Some("-h" | "--help")) {
        bail!("usage: camrelay-server [config-path]");
    }

    Ok(first.map(PathBuf::from))
}

fn load_config_yaml(path: &Path) -> Result<Config> {
    let raw = std::fs::read(path).with_context(|| {
        format!("failed to read config file {}", path.display())
    })?;
    serde_yaml::from_slice(&raw).with_context(|| {
        format!("failed to parse YAML config {}", path.display())
    })
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = non_empty_env("CAMRELAY_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }

    let mut candidates = Vec::new();
    if let Some(home) = non_empty_env("HOME") {
        candidates.push(PathBuf::from(&home).join("camrelay.yaml"));
        candidates.push(PathBuf::from(home).join("camrelay.yml"));
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    candidates.push(cwd.join("camrelay.yaml"));
    candidates.push(cwd.join("camrelay.yml"));

    candidates.into_iter().find(|candidate| candidate.exists())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
}

fn default_listen() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_max_message_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_session_queue_depth() -> usize {
    32
}

fn default_pipeline_capacity() -> usize {
    5
}

fn default_admission_timeout() -> Duration {
    Duration::from_millis(100)
}

fn default_keepalive_interval() -> Duration {
    Duration::from_secs(20)
}

fn default_keepalive_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_rate_window() -> Duration {
    Duration::from_secs(60)
}

fn default_rate_max_connections() -> usize {
    30
}

fn default_rate_exempt() -> Vec<String> {
    vec![
        "127.0.0.1".to_string(),
        "::1".to_string(),
        "localhost".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_the_wire_defaults() {
        let config: Config = serde_yaml::from_str("{}").expect("parse");

        assert_eq!(config.listen, "0.0.0.0:5000");
        assert_eq!(config.max_message_bytes, 10 * 1024 * 1024);
        assert_eq!(config.session_queue_depth, 32);
        assert_eq!(config.pipeline_capacity, 5);
        assert_eq!(config.admission_timeout, Duration::from_millis(100));
        assert_eq!(config.keepalive_interval, Duration::from_secs(20));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(10));
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert_eq!(config.rate_limit.max_connections, 30);
        assert!(config.rate_limit.exempt.contains(&"127.0.0.1".to_string()));
    }

    #[test]
    fn durations_accept_humantime_strings_and_bare_numbers() {
        let raw = concat!(
            "admission_timeout: 250ms\n",
            "keepalive_interval: 30\n",
            "keepalive_timeout: 5s\n",
            "rate_limit:\n",
            "  window: 2m\n",
        );
        let config: Config = serde_yaml::from_str(raw).expect("parse");

        assert_eq!(config.admission_timeout, Duration::from_millis(250));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.keepalive_timeout, Duration::from_secs(5));
        assert_eq!(config.rate_limit.window, Duration::from_secs(120));
    }

    #[test]
    fn bare_number_means_milliseconds_for_the_admission_timeout() {
        let config: Config =
            serde_yaml::from_str("admission_timeout: 100\n").expect("parse");
        assert_eq!(config.admission_timeout, Duration::from_millis(100));
    }

    #[test]
    fn normalize_floors_degenerate_values() {
        let raw = concat!(
            "listen: \"  \"\n",
            "max_message_bytes: 1\n",
            "session_queue_depth: 0\n",
            "pipeline_capacity: 0\n",
            "admission_timeout: 0\n",
            "rate_limit:\n",
            "  max_connections: 0\n",
            "  exempt: [\"  \", \"10.0.0.1\"]\n",
        );
        let mut config: Config = serde_yaml::from_str(raw).expect("parse");
        config.normalize();

        assert_eq!(config.listen, "0.0.0.0:5000");
        assert_eq!(config.max_message_bytes, 64 * 1024);
        assert_eq!(config.session_queue_depth, 1);
        assert_eq!(config.pipeline_capacity, 1);
        assert_eq!(config.admission_timeout, Duration::from_millis(1));
        assert_eq!(config.rate_limit.max_connections, 1);
        assert_eq!(config.rate_limit.exempt, vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_yaml::from_str::<Config>("frame_rate: 30\n").is_err());
    }

    #[test]
    fn listen_without_a_port_fails_validation() {
        let mut config: Config =
            serde_yaml::from_str("listen: camrelay.local\n").expect("parse");
        config.normalize();
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_path_arg_rules() {
        assert_eq!(
            parse_config_path_arg(vec!["relay.yaml".to_string()].into_iter())
                .expect("parse"),
            Some(PathBuf::from("relay.yaml"))
        );
        assert_eq!(
            parse_config_path_arg(Vec::new().into_iter()).expect("parse"),
            None
        );
        assert!(
            parse_config_path_arg(
                vec!["a.yaml".to_string(), "b.yaml".to_string()].into_iter()
            )
            .is_err()
        );
        assert!(
            parse_config_path_arg(vec!["--help".to_string()].into_iter()).is_err()
        );
    }
}
