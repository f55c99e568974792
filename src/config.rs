use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Application configuration
/// In debug builds: loads a .env file first, then the environment
/// In release builds: environment only
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the job ledger database
    pub data_dir: PathBuf,
    /// Parent directory for per-job `carat_<id>` workspaces
    pub workspace_root: PathBuf,
    /// Age after which a workspace with an unidentifiable owner may be reclaimed
    pub stale_workspace_after: Duration,
    /// How long a TranscodeFailed job stays parked for a retry
    pub parked_retention: Duration,
    /// Bound on every catalog and art request
    pub network_timeout: Duration,
    /// Candidates scoring below this (0..1) are discarded
    pub min_similarity: f64,
    /// Number of jobs allowed inside TranscodeStage at once
    pub transcode_slots: usize,
    /// MakeMKV `--minlength`, in seconds
    pub min_title_seconds: u32,
    pub user_agent: String,
    pub tool_overrides: ToolOverrides,
}

/// Explicit tool locations that win over PATH search
#[derive(Clone, Debug, Default)]
pub struct ToolOverrides {
    pub makemkvcon: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
    pub mkvmerge: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("carat");

        Config {
            data_dir,
            workspace_root: std::env::temp_dir(),
            stale_workspace_after: Duration::from_secs(24 * 60 * 60),
            parked_retention: Duration::from_secs(7 * 24 * 60 * 60),
            network_timeout: Duration::from_secs(20),
            min_similarity: 0.75,
            transcode_slots: 1,
            min_title_seconds: 600,
            user_agent: format!(
                "carat/{} ( https://github.com/jbloch/carat )",
                env!("CARGO_PKG_VERSION")
            ),
            tool_overrides: ToolOverrides::default(),
        }
    }
}

impl Config {
    /// Load configuration based on build mode
    pub fn load() -> Self {
        #[cfg(debug_assertions)]
        {
            if dotenvy::dotenv().is_ok() {
                info!("Config: dev mode, loaded .env file");
            } else {
                debug!("Config: no .env file found");
            }
        }

        Self::from_env()
    }

    /// Load configuration from `CARAT_*` environment variables over the defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(dir) = env_path("CARAT_DATA_DIR") {
            config.data_dir = dir;
        }
        if let Some(dir) = env_path("CARAT_WORKSPACE_ROOT") {
            config.workspace_root = dir;
        }
        if let Some(hours) = env_parse::<u64>("CARAT_STALE_WORKSPACE_HOURS") {
            config.stale_workspace_after = Duration::from_secs(hours * 60 * 60);
        }
        if let Some(days) = env_parse::<u64>("CARAT_PARKED_RETENTION_DAYS") {
            config.parked_retention = Duration::from_secs(days * 24 * 60 * 60);
        }
        if let Some(secs) = env_parse::<u64>("CARAT_NETWORK_TIMEOUT_SECS") {
            config.network_timeout = Duration::from_secs(secs);
        }
        if let Some(threshold) = env_parse::<f64>("CARAT_MIN_SIMILARITY") {
            if (0.0..=1.0).contains(&threshold) {
                config.min_similarity = threshold;
            } else {
                warn!(
                    "Config: CARAT_MIN_SIMILARITY={} outside 0..1, keeping {}",
                    threshold, config.min_similarity
                );
            }
        }
        if let Some(slots) = env_parse::<usize>("CARAT_TRANSCODE_SLOTS") {
            config.transcode_slots = slots.max(1);
        }
        if let Some(secs) = env_parse::<u32>("CARAT_MIN_TITLE_SECONDS") {
            config.min_title_seconds = secs;
        }
        if let Ok(agent) = std::env::var("CARAT_USER_AGENT") {
            if !agent.trim().is_empty() {
                config.user_agent = agent;
            }
        }

        config.tool_overrides = ToolOverrides {
            makemkvcon: env_path("CARAT_MAKEMKVCON"),
            ffmpeg: env_path("CARAT_FFMPEG"),
            ffprobe: env_path("CARAT_FFPROBE"),
            mkvmerge: env_path("CARAT_MKVMERGE"),
        };

        debug!("Config: {:?}", config);
        config
    }

    /// Path of the SQLite ledger
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.db")
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Config: ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.transcode_slots, 1);
        assert_eq!(config.min_title_seconds, 600);
        assert!(config.min_similarity > 0.0 && config.min_similarity < 1.0);
        assert!(config.ledger_path().ends_with("ledger.db"));
        assert!(config.user_agent.starts_with("carat/"));
    }
}
