//! Block device classification: is the storage backing a path rotational (HDD) or solid-state?
//!
//! Classification is best effort. Whenever the backing device cannot be resolved or its
//! rotational flag cannot be read, the path is reported as solid-state.

use anyhow::{Context, Result, anyhow};
use tracing::instrument;

use crate::config::ToolConfig;

/// Maps a filesystem path to the source of the mount containing it (e.g. `/dev/sda1`).
#[async_trait::async_trait]
pub trait DeviceResolver: Send + Sync {
    async fn resolve(&self, path: &std::path::Path) -> Result<String>;
}

/// Reads block device attributes from the operating system.
#[async_trait::async_trait]
pub trait RotationalFlagReader: Send + Sync {
    /// Names of all whole block devices currently known (e.g. `sda`, `nvme0n1`).
    async fn block_devices(&self) -> Result<Vec<String>>;
    /// `true` for rotational devices.
    async fn is_rotational(&self, block: &str) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceVerdict {
    pub path: std::path::PathBuf,
    /// Parent block device, `None` if the path could not be mapped to one
    pub block_device: Option<String>,
    pub is_ssd: bool,
}

impl DeviceVerdict {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        if self.is_ssd { "SSD" } else { "HDD" }
    }
}

/// Resolves the mount source with `df --output=source <path>`.
#[derive(Debug, Clone)]
pub struct DfResolver {
    df: std::ffi::OsString,
}

impl DfResolver {
    #[must_use]
    pub fn new(tools: &ToolConfig) -> Self {
        Self {
            df: tools.df.clone(),
        }
    }
}

#[async_trait::async_trait]
impl DeviceResolver for DfResolver {
    #[instrument]
    async fn resolve(&self, path: &std::path::Path) -> Result<String> {
        let output = tokio::process::Command::new(&self.df)
            .arg("--output=source")
            .arg(path)
            .stderr(std::process::Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed running {:?}", &self.df))?;
        if !output.status.success() {
            return Err(anyhow!("df exited with {}", output.status));
        }
        // header line followed by the device line
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .nth(1)
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("df printed no device for {:?}", path))
    }
}

/// Resolves the mount source from the longest matching mount point in `/proc/mounts`.
#[derive(Debug, Clone)]
pub struct MountTableResolver {
    mounts_file: std::path::PathBuf,
}

impl MountTableResolver {
    #[must_use]
    pub fn new(tools: &ToolConfig) -> Self {
        Self {
            mounts_file: tools.mounts_file.clone(),
        }
    }
}

/// Decodes the `\NNN` octal escapes the kernel writes for space, tab, newline and backslash
/// in mount table fields.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        let escaped = match bytes[idx] {
            b'\\' => bytes
                .get(idx + 1..idx + 4)
                .and_then(|digits| std::str::from_utf8(digits).ok())
                .and_then(|digits| u8::from_str_radix(digits, 8).ok()),
            _ => None,
        };
        match escaped {
            Some(code) => {
                out.push(code);
                idx += 4;
            }
            None => {
                out.push(bytes[idx]);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Picks the source of the deepest mount point containing `path`.
#[must_use]
pub fn mount_source_for(mounts: &str, path: &std::path::Path) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for line in mounts.lines() {
        let mut parts = line.split_whitespace();
        let (Some(source), Some(mount_point)) = (parts.next(), parts.next()) else {
            continue;
        };
        let mount_point = unescape_mount_field(mount_point);
        if !path.starts_with(&mount_point) {
            continue;
        }
        let depth = std::path::Path::new(&mount_point).components().count();
        if best.is_none_or(|(best_depth, _)| depth >= best_depth) {
            best = Some((depth, source));
        }
    }
    best.map(|(_, source)| unescape_mount_field(source))
}

#[async_trait::async_trait]
impl DeviceResolver for MountTableResolver {
    #[instrument]
    async fn resolve(&self, path: &std::path::Path) -> Result<String> {
        let mounts = tokio::fs::read_to_string(&self.mounts_file)
            .await
            .with_context(|| format!("failed reading {:?}", &self.mounts_file))?;
        let path = tokio::fs::canonicalize(path)
            .await
            .unwrap_or_else(|_| path.to_path_buf());
        mount_source_for(&mounts, &path)
            .ok_or_else(|| anyhow!("no mount point found for {:?}", &path))
    }
}

/// Lists `/sys/block` and reads `/sys/block/<dev>/queue/rotational`.
#[derive(Debug, Clone)]
pub struct SysfsReader {
    root: std::path::PathBuf,
}

impl SysfsReader {
    #[must_use]
    pub fn new(tools: &ToolConfig) -> Self {
        Self {
            root: tools.sysfs_root.clone(),
        }
    }
}

#[async_trait::async_trait]
impl RotationalFlagReader for SysfsReader {
    async fn block_devices(&self) -> Result<Vec<String>> {
        // /sys/block lists whole devices only, partitions live underneath them
        let dir = self.root.join("block");
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("cannot open directory {:?} for reading", &dir))?;
        let mut names = vec![];
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", &dir))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    async fn is_rotational(&self, block: &str) -> Result<bool> {
        let path = self.root.join("block").join(block).join("queue/rotational");
        let value = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("could not read rotational flag at {:?}", &path))?;
        Ok(value.trim() == "1")
    }
}

fn strip_trailing_digits(name: &str) -> &str {
    name.trim_end_matches(|c: char| c.is_ascii_digit())
}

/// Strips a `p<N>` partition suffix that follows a digit: `nvme0n1p1` -> `nvme0n1`,
/// `mmcblk0p2` -> `mmcblk0`. Names without such a suffix are returned unchanged.
fn strip_partition_p(name: &str) -> &str {
    let without_digits = strip_trailing_digits(name);
    if without_digits.len() == name.len() {
        return name;
    }
    match without_digits.strip_suffix('p') {
        Some(stem) if stem.ends_with(|c: char| c.is_ascii_digit()) => stem,
        _ => name,
    }
}

/// Normalizes a device path to its parent block device name.
///
/// Candidates are tried against the live list of block devices first: the name itself, the
/// name without a `p<N>` partition suffix, and the name without trailing digits. Only when none
/// of them is known does it fall back to a purely syntactic strip.
#[must_use]
pub fn normalize_block_name(device: &str, known: &[String]) -> String {
    let base = device.rsplit('/').next().unwrap_or(device);
    let candidates = [base, strip_partition_p(base), strip_trailing_digits(base)];
    if let Some(found) = candidates
        .iter()
        .find(|candidate| !candidate.is_empty() && known.iter().any(|k| k == *candidate))
    {
        return found.to_string();
    }
    if base.starts_with("nvme") || base.starts_with("mmcblk") {
        strip_partition_p(base).to_string()
    } else {
        strip_trailing_digits(base).to_string()
    }
}

/// Composes resolvers and the sysfs reader into a best-effort SSD/HDD verdict.
pub struct DeviceClassifier {
    resolvers: Vec<Box<dyn DeviceResolver>>,
    reader: Box<dyn RotationalFlagReader>,
}

impl DeviceClassifier {
    #[must_use]
    pub fn new(resolvers: Vec<Box<dyn DeviceResolver>>, reader: Box<dyn RotationalFlagReader>) -> Self {
        Self { resolvers, reader }
    }

    /// `df` first, then the mount table, reading flags from sysfs.
    #[must_use]
    pub fn system(tools: &ToolConfig) -> Self {
        Self::new(
            vec![
                Box::new(DfResolver::new(tools)),
                Box::new(MountTableResolver::new(tools)),
            ],
            Box::new(SysfsReader::new(tools)),
        )
    }

    async fn resolve(&self, path: &std::path::Path) -> Option<String> {
        for resolver in &self.resolvers {
            match resolver.resolve(path).await {
                Ok(device) => return Some(device),
                Err(error) => tracing::debug!("device lookup for {:?} failed: {:#}", path, error),
            }
        }
        None
    }

    #[instrument(skip(self))]
    pub async fn classify(&self, path: &std::path::Path) -> DeviceVerdict {
        let Some(device) = self.resolve(path).await else {
            tracing::debug!("could not map {:?} to a device; assuming SSD", path);
            return DeviceVerdict {
                path: path.to_path_buf(),
                block_device: None,
                is_ssd: true,
            };
        };
        let known = self.reader.block_devices().await.unwrap_or_else(|error| {
            tracing::debug!("block device list unavailable: {:#}", error);
            vec![]
        });
        let block = normalize_block_name(&device, &known);
        let is_ssd = match self.reader.is_rotational(&block).await {
            Ok(rotational) => !rotational,
            Err(error) => {
                tracing::debug!("{:#}; assuming SSD", error);
                true
            }
        };
        tracing::debug!("{:?} is on {} ({}) -> {}", path, device, block, if is_ssd { "SSD" } else { "HDD" });
        DeviceVerdict {
            path: path.to_path_buf(),
            block_device: Some(block),
            is_ssd,
        }
    }
}
