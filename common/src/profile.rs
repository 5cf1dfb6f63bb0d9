//! Transfer profiles: which rsync flags and which priority wrapper to use for a given mode and
//! pair of device verdicts.
//!
//! | mode       | flags added on top of the archive set                  | priority wrapper           |
//! |------------|--------------------------------------------------------|----------------------------|
//! | safe       | `--partial --inplace`                                  | none                       |
//! | fast       | `--partial --inplace [--whole-file] --no-inc-recursive`| `ionice -c2 -n0 nice -n -5`|
//! | aggressive | `--partial --inplace --no-inc-recursive --whole-file`  | `ionice -c1 -n0 nice -n -10`|
//!
//! In `fast` mode `--whole-file` is only added when both sides are solid-state.

use std::os::unix::ffi::{OsStrExt, OsStringExt};

use crate::config::ToolConfig;

/// Aggressiveness of a sync run
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Mode {
    /// Conservative flags, normal process priority
    Safe,
    /// Tuned flags, best-effort high I/O priority
    #[default]
    Fast,
    /// Top speed regardless of system impact, real-time I/O priority
    Aggressive,
}

impl Mode {
    /// Parses a mode name, falling back to `fast` for anything unrecognized.
    #[must_use]
    pub fn parse_lossy(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "safe" => Mode::Safe,
            "fast" => Mode::Fast,
            "aggressive" => Mode::Aggressive,
            other => {
                tracing::warn!("unrecognized mode {:?}, using 'fast'", other);
                Mode::Fast
            }
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Mode::Safe => "safe",
            Mode::Fast => "fast",
            Mode::Aggressive => "aggressive",
        };
        write!(f, "{name}")
    }
}

/// Archive mode plus hard links, ACLs, xattrs, numeric ids and overall progress.
pub const ARCHIVE_FLAGS: &[&str] = &["-a", "-H", "-A", "-X", "--numeric-ids", "--info=progress2"];
pub const PARTIAL_FLAGS: &[&str] = &["--partial", "--inplace"];
pub const WHOLE_FILE: &str = "--whole-file";
pub const NO_INC_RECURSIVE: &str = "--no-inc-recursive";

/// Flag set and priority wrapper for one mirroring invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProfile {
    /// Command prefix adjusting I/O and CPU priority, e.g. `ionice -c2 -n0 nice -n -5`
    pub priority: Vec<std::ffi::OsString>,
    pub flags: Vec<String>,
}

impl TransferProfile {
    #[must_use]
    pub fn build(mode: Mode, src_is_ssd: bool, dst_is_ssd: bool, tools: &ToolConfig) -> Self {
        let mut flags: Vec<String> = ARCHIVE_FLAGS.iter().map(|f| f.to_string()).collect();
        flags.extend(PARTIAL_FLAGS.iter().map(|f| f.to_string()));
        let priority = match mode {
            Mode::Safe => vec![],
            Mode::Fast => {
                if src_is_ssd && dst_is_ssd {
                    flags.push(WHOLE_FILE.to_string());
                }
                flags.push(NO_INC_RECURSIVE.to_string());
                priority_wrapper(tools, "-c2", "-5")
            }
            Mode::Aggressive => {
                flags.push(NO_INC_RECURSIVE.to_string());
                flags.push(WHOLE_FILE.to_string());
                priority_wrapper(tools, "-c1", "-10")
            }
        };
        Self { priority, flags }
    }

    #[must_use]
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Composes `priority... rsync flags... sources... destination`.
    #[must_use]
    pub fn command(
        &self,
        tools: &ToolConfig,
        sources: Vec<std::ffi::OsString>,
        destination: std::ffi::OsString,
    ) -> MirrorCommand {
        let mut argv: Vec<std::ffi::OsString> = self.priority.clone();
        argv.push(tools.rsync.clone());
        argv.extend(self.flags.iter().map(std::ffi::OsString::from));
        argv.extend(sources);
        argv.push(destination);
        MirrorCommand { argv }
    }
}

fn priority_wrapper(tools: &ToolConfig, io_class: &str, niceness: &str) -> Vec<std::ffi::OsString> {
    vec![
        tools.ionice.clone(),
        io_class.into(),
        "-n0".into(),
        tools.nice.clone(),
        "-n".into(),
        niceness.into(),
    ]
}

/// Returns `path` with exactly one trailing slash.
///
/// rsync copies the *contents* of `src/` into `dst/`; without the slash it would create
/// `dst/<basename of src>` instead.
#[must_use]
pub fn with_trailing_slash(path: &std::path::Path) -> std::ffi::OsString {
    let mut bytes = path.as_os_str().as_bytes().to_vec();
    while bytes.last() == Some(&b'/') {
        bytes.pop();
    }
    bytes.push(b'/');
    std::ffi::OsString::from_vec(bytes)
}

/// A fully composed external command line, program first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorCommand {
    pub argv: Vec<std::ffi::OsString>,
}

impl MirrorCommand {
    #[must_use]
    pub fn program(&self) -> &std::ffi::OsStr {
        &self.argv[0]
    }

    #[must_use]
    pub fn args(&self) -> &[std::ffi::OsString] {
        &self.argv[1..]
    }
}

impl std::fmt::Display for MirrorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let parts: Vec<_> = self.argv.iter().map(|a| a.to_string_lossy()).collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// Builds the single-invocation command mirroring the contents of `src` into `dst`.
#[must_use]
pub fn build(
    src: &std::path::Path,
    dst: &std::path::Path,
    src_is_ssd: bool,
    dst_is_ssd: bool,
    mode: Mode,
    tools: &ToolConfig,
) -> MirrorCommand {
    TransferProfile::build(mode, src_is_ssd, dst_is_ssd, tools)
        .command(tools, vec![with_trailing_slash(src)], with_trailing_slash(dst))
}
