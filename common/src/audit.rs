//! Aggregate size and file count of a directory tree.
//!
//! Each metric is produced by an ordered chain of probes: the external tools first (`du -sb`,
//! `find -type f`), then an in-process walk. The first probe to succeed wins; if all of them
//! fail the metric is reported as zero. Auditing never fails the caller.

use anyhow::{Context, Result, anyhow};
use async_recursion::async_recursion;
use tracing::instrument;

use crate::config::ToolConfig;

/// Total bytes and regular file count under a path at a point in time
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditResult {
    pub bytes: u64,
    pub files: u64,
}

impl AuditResult {
    /// Success criterion for a sync: sizes and counts equal and the source is not empty.
    ///
    /// Only aggregates are compared; contents are never checked.
    #[must_use]
    pub fn matches(&self, destination: &AuditResult) -> bool {
        self == destination && self.bytes != 0
    }
}

impl std::fmt::Display for AuditResult {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{:.3} GB ({}), files: {}",
            self.bytes as f64 / 1e9,
            bytesize::ByteSize(self.bytes),
            self.files
        )
    }
}

#[async_trait::async_trait]
pub trait DiskUsageProbe: Send + Sync {
    async fn size(&self, path: &std::path::Path) -> Result<u64>;
}

#[async_trait::async_trait]
pub trait FileCounter: Send + Sync {
    async fn count(&self, path: &std::path::Path) -> Result<u64>;
}

/// `du -sb <path>`
#[derive(Debug, Clone)]
pub struct DuProbe {
    du: std::ffi::OsString,
}

impl DuProbe {
    #[must_use]
    pub fn new(tools: &ToolConfig) -> Self {
        Self {
            du: tools.du.clone(),
        }
    }
}

#[async_trait::async_trait]
impl DiskUsageProbe for DuProbe {
    #[instrument]
    async fn size(&self, path: &std::path::Path) -> Result<u64> {
        let output = tokio::process::Command::new(&self.du)
            .arg("-sb")
            .arg(path)
            .stderr(std::process::Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed running {:?}", &self.du))?;
        if !output.status.success() {
            return Err(anyhow!("du exited with {}", output.status));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let field = stdout
            .split_whitespace()
            .next()
            .ok_or_else(|| anyhow!("du printed nothing for {:?}", path))?;
        field
            .parse::<u64>()
            .with_context(|| format!("unexpected du output {:?}", field))
    }
}

/// `find <path> -type f -print0`, counting NUL terminators
#[derive(Debug, Clone)]
pub struct FindCounter {
    find: std::ffi::OsString,
}

impl FindCounter {
    #[must_use]
    pub fn new(tools: &ToolConfig) -> Self {
        Self {
            find: tools.find.clone(),
        }
    }
}

#[async_trait::async_trait]
impl FileCounter for FindCounter {
    #[instrument]
    async fn count(&self, path: &std::path::Path) -> Result<u64> {
        let output = tokio::process::Command::new(&self.find)
            .arg(path)
            .args(["-type", "f", "-print0"])
            .stderr(std::process::Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed running {:?}", &self.find))?;
        if !output.status.success() {
            return Err(anyhow!("find exited with {}", output.status));
        }
        Ok(output.stdout.iter().filter(|&&b| b == 0).count() as u64)
    }
}

/// In-process recursive walk; counts and sizes regular files only, skipping entries that
/// cannot be stat'ed.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalkProbe;

#[async_recursion]
async fn walk(path: &std::path::Path) -> Result<AuditResult> {
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", &path))?;
    if metadata.is_file() {
        return Ok(AuditResult {
            bytes: metadata.len(),
            files: 1,
        });
    }
    if !metadata.is_dir() {
        return Ok(AuditResult::default());
    }
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", path))?;
    let mut total = AuditResult::default();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", &path))?
    {
        match walk(&entry.path()).await {
            Ok(sub) => {
                total.bytes += sub.bytes;
                total.files += sub.files;
            }
            Err(error) => tracing::trace!("skipping: {:#}", error),
        }
    }
    Ok(total)
}

#[async_trait::async_trait]
impl DiskUsageProbe for WalkProbe {
    async fn size(&self, path: &std::path::Path) -> Result<u64> {
        Ok(walk(path).await?.bytes)
    }
}

#[async_trait::async_trait]
impl FileCounter for WalkProbe {
    async fn count(&self, path: &std::path::Path) -> Result<u64> {
        Ok(walk(path).await?.files)
    }
}

/// Size and count probe chains
pub struct Auditor {
    size_probes: Vec<Box<dyn DiskUsageProbe>>,
    counters: Vec<Box<dyn FileCounter>>,
}

impl Auditor {
    #[must_use]
    pub fn new(size_probes: Vec<Box<dyn DiskUsageProbe>>, counters: Vec<Box<dyn FileCounter>>) -> Self {
        Self {
            size_probes,
            counters,
        }
    }

    /// `du`/`find` with a walk fallback for each.
    #[must_use]
    pub fn system(tools: &ToolConfig) -> Self {
        Self::new(
            vec![Box::new(DuProbe::new(tools)), Box::new(WalkProbe)],
            vec![Box::new(FindCounter::new(tools)), Box::new(WalkProbe)],
        )
    }

    async fn size(&self, path: &std::path::Path) -> u64 {
        for probe in &self.size_probes {
            match probe.size(path).await {
                Ok(size) => return size,
                Err(error) => tracing::debug!("size probe failed for {:?}: {:#}", path, error),
            }
        }
        0
    }

    async fn count(&self, path: &std::path::Path) -> u64 {
        for counter in &self.counters {
            match counter.count(path).await {
                Ok(count) => return count,
                Err(error) => tracing::debug!("count probe failed for {:?}: {:#}", path, error),
            }
        }
        0
    }

    #[instrument(skip(self))]
    pub async fn audit(&self, path: &std::path::Path) -> AuditResult {
        AuditResult {
            bytes: self.size(path).await,
            files: self.count(path).await,
        }
    }
}
