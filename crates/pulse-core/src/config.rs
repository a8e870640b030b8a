use std::path::PathBuf;
use std::time::Duration;

/// On-disk growth limits for the event store.
#[derive(Clone, Copy, Debug)]
pub struct StorageLimits {
    /// Hard cap on the database size, in bytes. New sessions are refused
    /// once the store is at or above this size.
    pub max_size_bytes: u64,
    /// VACUUM once the database exceeds this fraction of the cap.
    pub vacuum_threshold: f64,
}

impl Default for StorageLimits {
    fn default() -> Self {
        Self {
            max_size_bytes: 500_000,
            vacuum_threshold: 0.8,
        }
    }
}

impl StorageLimits {
    /// Size above which a vacuum is worthwhile.
    pub fn vacuum_trigger_bytes(&self) -> u64 {
        (self.max_size_bytes as f64 * self.vacuum_threshold) as u64
    }
}

/// Configuration for the telemetry agent. Construct once at process start
/// and pass by reference; there is no global instance.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Host name of the collection endpoint.
    pub collector_host: String,
    /// Whether uploads go over HTTPS.
    pub use_https: bool,
    /// Event store growth limits.
    pub limits: StorageLimits,
    /// How long a closed session may be resumed after the app backgrounds.
    pub background_session_timeout: Duration,
    /// Request timeout for an upload POST. A timeout counts as a transport
    /// failure: rows are retained for the next attempt.
    pub upload_timeout: Duration,
    /// Directory holding the database and the install-id file.
    pub data_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            collector_host: "collector.pulse-analytics.io".to_string(),
            use_https: true,
            limits: StorageLimits::default(),
            background_session_timeout: Duration::from_secs(15),
            upload_timeout: Duration::from_secs(60),
            data_dir: default_data_dir(),
        }
    }
}

impl AgentConfig {
    /// Base URL of the upload endpoint, scheme included.
    pub fn collector_base(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{scheme}://{}", self.collector_host)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".pulse")
}
