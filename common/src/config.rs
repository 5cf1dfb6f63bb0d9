//! Configuration types for runtime, output and external tool settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    /// Console verbosity: 0=INFO, 1=DEBUG, 2+=TRACE
    pub verbose: u8,
    /// Persistent log file, always written at maximum detail
    pub log_file: Option<std::path::PathBuf>,
}

/// Default location of the persistent log file: `~/.drive_sync.log`
#[must_use]
pub fn default_log_file() -> std::path::PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_else(|| ".".into());
    std::path::PathBuf::from(home).join(".drive_sync.log")
}

/// Names (or paths) of the external binaries dsync drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolConfig {
    pub rsync: std::ffi::OsString,
    pub ionice: std::ffi::OsString,
    pub nice: std::ffi::OsString,
    pub du: std::ffi::OsString,
    pub find: std::ffi::OsString,
    pub df: std::ffi::OsString,
    pub notify_send: std::ffi::OsString,
    /// Root of the sysfs tree holding block device attributes
    pub sysfs_root: std::path::PathBuf,
    /// Mount table consulted when `df` cannot resolve a device
    pub mounts_file: std::path::PathBuf,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            rsync: "rsync".into(),
            ionice: "ionice".into(),
            nice: "nice".into(),
            du: "du".into(),
            find: "find".into(),
            df: "df".into(),
            notify_send: "notify-send".into(),
            sysfs_root: "/sys".into(),
            mounts_file: "/proc/mounts".into(),
        }
    }
}

/// Worker count used when the caller does not specify one
pub const DEFAULT_WORKERS: usize = 4;

/// Immutable input to one orchestration run
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub source: std::path::PathBuf,
    pub destination: std::path::PathBuf,
    pub mode: crate::profile::Mode,
    /// Number of parallel transfers for SSD->SSD copies; 0 or 1 disables the split
    pub workers: usize,
}

impl SyncRequest {
    #[must_use]
    pub fn new(source: impl Into<std::path::PathBuf>, destination: impl Into<std::path::PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            mode: crate::profile::Mode::default(),
            workers: DEFAULT_WORKERS,
        }
    }

    /// Whether the request asks for the parallel split at all
    #[must_use]
    pub fn wants_parallel(&self) -> bool {
        self.workers > 1
    }
}
