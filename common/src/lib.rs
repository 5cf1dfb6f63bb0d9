//! Common library for dsync: SSD/HDD-aware, rsync-driven directory synchronization
//!
//! The crate is organized bottom-up:
//!
//! - [`device`] maps a path to its block device and decides whether it is rotational
//! - [`profile`] picks rsync flags and a priority wrapper for a mode and pair of devices
//! - [`audit`] measures total size and file count of a tree
//! - [`runner`] runs one rsync invocation, streaming its output
//! - [`split`] fans a transfer out over the source's top-level entries
//! - [`sync`] orchestrates a full run: pre-audit, classify, transfer, retry, verify
//!
//! External tools are reached only through the adapter traits ([`device::DeviceResolver`],
//! [`device::RotationalFlagReader`], [`audit::DiskUsageProbe`], [`audit::FileCounter`],
//! [`runner::MirrorRunner`], [`notify::Notifier`]) so the orchestration can be exercised with
//! fakes.
//!
//! # Exit codes
//!
//! - `0` - verified success, or nothing to do because both sides already agree
//! - `1` - fatal error (missing source, transfer could not be started, ...)
//! - `2` - size/file count mismatch after the transfer

pub mod audit;
pub mod config;
pub mod device;
pub mod logging;
pub mod notify;
pub mod profile;
pub mod runner;
pub mod split;
pub mod sync;

pub use config::{OutputConfig, RuntimeConfig, SyncRequest, ToolConfig};
pub use profile::Mode;
pub use sync::{Outcome, Status, Syncer};

/// Builds the tokio runtime described by `runtime` and drives `func` to completion on it.
pub fn run<Fut, T>(runtime: RuntimeConfig, func: impl FnOnce() -> Fut) -> anyhow::Result<T>
where
    Fut: std::future::Future<Output = T>,
{
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = builder
        .build()
        .map_err(|err| anyhow::anyhow!("failed to build tokio runtime: {err}"))?;
    Ok(runtime.block_on(func()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_drives_future_on_sized_runtime() -> anyhow::Result<()> {
        let value = run(
            RuntimeConfig {
                max_workers: 2,
                max_blocking_threads: 4,
            },
            || async { tokio::task::spawn_blocking(|| 21 * 2).await },
        )??;
        assert_eq!(value, 42);
        Ok(())
    }
}
