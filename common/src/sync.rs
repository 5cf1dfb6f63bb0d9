//! Sync orchestration.
//!
//! One run walks through: existence checks, pre-audit (short-circuit when both sides already
//! agree), device classification, a single or parallel transfer, at most one single-invocation
//! retry, and a post-audit that decides success (exit 0) or mismatch (exit 2).
//!
//! Success means equal aggregate size and file count with a non-empty source. File contents
//! are never compared, so same-sized corruption goes unnoticed.

use tracing::instrument;

use crate::audit::{AuditResult, Auditor};
use crate::config::{SyncRequest, ToolConfig};
use crate::device::DeviceClassifier;
use crate::notify::Notifier;
use crate::profile::{self, TransferProfile};
use crate::runner::MirrorRunner;
use crate::split;

pub const NOTIFY_TITLE: &str = "Drive Sync";

/// Failures that abort a run. All of them map to exit code 1.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Source does not exist: {0:?}")]
    SourceMissing(std::path::PathBuf),
    #[error("failed creating destination {path:?}: {source}")]
    CreateDestination {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("transfer failed: {0:#}")]
    Transfer(#[source] anyhow::Error),
}

impl Error {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        1
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// Pre-audit already matched, nothing was transferred
    AlreadySynced,
    /// Post-audit matched
    Verified,
    /// Post-audit did not match
    Mismatch,
}

/// Terminal value of one orchestration run
#[derive(Clone, Debug)]
pub struct Outcome {
    pub status: Status,
    pub elapsed: std::time::Duration,
    /// Number of transfer rounds started: 0 when short-circuited, 2 when a retry happened
    pub attempts: usize,
    pub source: AuditResult,
    pub destination: AuditResult,
}

impl Outcome {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.status {
            Status::AlreadySynced | Status::Verified => 0,
            Status::Mismatch => 2,
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "status: {:?}\n\
            exit code: {}\n\
            transfer attempts: {}\n\
            source: {}\n\
            destination: {}\n\
            elapsed: {}",
            self.status,
            self.exit_code(),
            self.attempts,
            self.source,
            self.destination,
            format_elapsed(self.elapsed)
        )
    }
}

/// Formats a duration as `"{h}h {m}m {s}s"`.
#[must_use]
pub fn format_elapsed(elapsed: std::time::Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn basename(path: &std::path::Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Composes the classifier, auditor, runner and notifier into sync runs.
pub struct Syncer {
    classifier: DeviceClassifier,
    auditor: Auditor,
    runner: std::sync::Arc<dyn MirrorRunner>,
    notifier: std::sync::Arc<dyn Notifier>,
    tools: ToolConfig,
}

impl Syncer {
    #[must_use]
    pub fn new(
        classifier: DeviceClassifier,
        auditor: Auditor,
        runner: std::sync::Arc<dyn MirrorRunner>,
        notifier: std::sync::Arc<dyn Notifier>,
        tools: ToolConfig,
    ) -> Self {
        Self {
            classifier,
            auditor,
            runner,
            notifier,
            tools,
        }
    }

    /// Wires up the real external tools.
    #[must_use]
    pub fn system(tools: ToolConfig, notifier: std::sync::Arc<dyn Notifier>) -> Self {
        Self::new(
            DeviceClassifier::system(&tools),
            Auditor::system(&tools),
            std::sync::Arc::new(crate::runner::ProcessRunner),
            notifier,
            tools,
        )
    }

    /// Runs one sync. Any error is logged and reported through the notifier before returning.
    pub async fn sync(&self, request: &SyncRequest) -> Result<Outcome, Error> {
        match self.run(request).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                tracing::error!("Fatal error during sync: {:#}", &error);
                self.notifier
                    .notify(&format!("{NOTIFY_TITLE}: Fatal error"), &error.to_string())
                    .await;
                Err(error)
            }
        }
    }

    async fn transfer_single(
        &self,
        request: &SyncRequest,
        src_is_ssd: bool,
        dst_is_ssd: bool,
    ) -> Result<i32, Error> {
        let command = profile::build(
            &request.source,
            &request.destination,
            src_is_ssd,
            dst_is_ssd,
            request.mode,
            &self.tools,
        );
        self.runner.run(&command).await.map_err(Error::Transfer)
    }

    #[instrument(skip(self), fields(src = ?request.source, dst = ?request.destination))]
    async fn run(&self, request: &SyncRequest) -> Result<Outcome, Error> {
        let start_time = std::time::Instant::now();
        let src = request.source.as_path();
        let dst = request.destination.as_path();
        tracing::info!("Starting sync: {:?} -> {:?} (mode={})", src, dst, request.mode);
        self.notifier
            .notify(
                NOTIFY_TITLE,
                &format!("Starting sync: {} -> {}", basename(src), basename(dst)),
            )
            .await;
        // follows symlinks, a dangling link is a missing source; an empty path fails here too
        if tokio::fs::metadata(src).await.is_err() {
            tracing::error!("Source does not exist: {:?}", src);
            self.notifier
                .notify(
                    &format!("{NOTIFY_TITLE} Error"),
                    &format!("Source missing: {}", src.display()),
                )
                .await;
            return Err(Error::SourceMissing(src.to_path_buf()));
        }
        // create_dir_all("") succeeds and the slashed form of "" is "/"
        if dst.as_os_str().is_empty() {
            return Err(Error::CreateDestination {
                path: dst.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "empty destination path"),
            });
        }
        tokio::fs::create_dir_all(dst)
            .await
            .map_err(|source| Error::CreateDestination {
                path: dst.to_path_buf(),
                source,
            })?;

        tracing::info!("Gathering size and file count for source...");
        let src_audit = self.auditor.audit(src).await;
        tracing::info!("Source size: {}", src_audit);
        tracing::info!("Gathering size and file count for destination...");
        let dst_audit = self.auditor.audit(dst).await;
        tracing::info!("Dest size: {}", dst_audit);
        if src_audit.matches(&dst_audit) {
            tracing::info!(
                "Source and destination appear identical (size & count). Skipping rsync."
            );
            self.notifier
                .notify(NOTIFY_TITLE, "Already synced: no action required.")
                .await;
            let elapsed = start_time.elapsed();
            tracing::info!("Elapsed: {:.2} s", elapsed.as_secs_f64());
            return Ok(Outcome {
                status: Status::AlreadySynced,
                elapsed,
                attempts: 0,
                source: src_audit,
                destination: dst_audit,
            });
        }

        let src_verdict = self.classifier.classify(src).await;
        let dst_verdict = self.classifier.classify(dst).await;
        tracing::info!("Source is {}", src_verdict.kind());
        tracing::info!("Destination is {}", dst_verdict.kind());
        let (src_is_ssd, dst_is_ssd) = (src_verdict.is_ssd, dst_verdict.is_ssd);

        let mut attempts = 1;
        let mut code = if src_is_ssd && dst_is_ssd && request.wants_parallel() {
            tracing::info!(
                "SSD->SSD detected: enabling parallel rsync with up to {} workers",
                request.workers
            );
            let profile = TransferProfile::build(request.mode, src_is_ssd, dst_is_ssd, &self.tools);
            split::run_parallel(
                self.runner.clone(),
                src,
                dst,
                request.workers,
                &profile,
                &self.tools,
            )
            .await
            .map_err(Error::Transfer)?
        } else {
            self.transfer_single(request, src_is_ssd, dst_is_ssd).await?
        };
        if code != 0 {
            tracing::warn!(
                "rsync reported non-zero exit: {}. Will attempt a second pass.",
                code
            );
            attempts += 1;
            code = self.transfer_single(request, src_is_ssd, dst_is_ssd).await?;
            if code != 0 {
                tracing::warn!("second pass also failed with exit code {}", code);
            }
        }

        let final_src = self.auditor.audit(src).await;
        let final_dst = self.auditor.audit(dst).await;
        let elapsed = start_time.elapsed();
        let status = if final_src.matches(&final_dst) {
            tracing::info!("Transfer verified OK. Time: {}", format_elapsed(elapsed));
            self.notifier
                .notify(
                    &format!("{NOTIFY_TITLE}: Completed"),
                    &format!("Time: {}", format_elapsed(elapsed)),
                )
                .await;
            Status::Verified
        } else {
            tracing::error!(
                "Mismatch after rsync. src (size/files) = {}/{} ; dst = {}/{}",
                final_src.bytes,
                final_src.files,
                final_dst.bytes,
                final_dst.files
            );
            self.notifier
                .notify(
                    &format!("{NOTIFY_TITLE}: ERROR"),
                    "Size/file count mismatch after rsync.",
                )
                .await;
            Status::Mismatch
        };
        Ok(Outcome {
            status,
            elapsed,
            attempts,
            source: final_src,
            destination: final_dst,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use anyhow::{Result, anyhow};

    use super::*;
    use crate::audit::{DiskUsageProbe, FileCounter, WalkProbe};
    use crate::device::tests::{FakeSysfs, FixedResolver};
    use crate::notify::tests::Recorder;
    use crate::profile::{MirrorCommand, Mode};

    /// Pretends to be rsync: returns scripted exit codes and, on success, copies the regular
    /// files named by the source arguments into the destination.
    struct FakeRsync {
        codes: std::sync::Mutex<VecDeque<i32>>,
        seen: std::sync::Mutex<Vec<MirrorCommand>>,
        spawn_fails: bool,
    }

    impl FakeRsync {
        fn new(codes: &[i32]) -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self {
                codes: std::sync::Mutex::new(codes.iter().copied().collect()),
                seen: Default::default(),
                spawn_fails: false,
            })
        }

        fn invocations(&self) -> usize {
            self.seen.lock().unwrap().len()
        }

        fn copy(command: &MirrorCommand) -> Result<()> {
            let args: Vec<std::path::PathBuf> =
                command.args().iter().map(std::path::PathBuf::from).collect();
            let (dst, rest) = args.split_last().ok_or_else(|| anyhow!("no destination"))?;
            for src in rest.iter().filter(|a| a.is_absolute()) {
                if src.is_dir() {
                    for entry in std::fs::read_dir(src)? {
                        let path = entry?.path();
                        std::fs::copy(&path, dst.join(path.file_name().unwrap()))?;
                    }
                } else {
                    std::fs::copy(src, dst.join(src.file_name().unwrap()))?;
                }
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl MirrorRunner for FakeRsync {
        async fn run(&self, command: &MirrorCommand) -> Result<i32> {
            self.seen.lock().unwrap().push(command.clone());
            if self.spawn_fails {
                return Err(anyhow!("failed to spawn rsync"));
            }
            let code = self.codes.lock().unwrap().pop_front().unwrap_or(0);
            if code == 0 {
                Self::copy(command)?;
            }
            Ok(code)
        }
    }

    /// Reports walk results, but one file fewer for paths under `short`.
    struct ShortCounter {
        short: std::path::PathBuf,
    }

    #[async_trait::async_trait]
    impl FileCounter for ShortCounter {
        async fn count(&self, path: &std::path::Path) -> Result<u64> {
            let count = WalkProbe.count(path).await?;
            if path.starts_with(&self.short) {
                Ok(count.saturating_sub(1))
            } else {
                Ok(count)
            }
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
        rsync: std::sync::Arc<FakeRsync>,
        notifier: std::sync::Arc<Recorder>,
    }

    impl Fixture {
        /// 10 files totaling 500 bytes in the source, an empty destination.
        async fn new(rsync: std::sync::Arc<FakeRsync>) -> Result<Self> {
            let tmp = tempfile::tempdir()?;
            let src = tmp.path().join("src");
            let dst = tmp.path().join("dst");
            tokio::fs::create_dir(&src).await?;
            for i in 0..10 {
                tokio::fs::write(src.join(format!("{i}.bin")), vec![b'x'; 50]).await?;
            }
            Ok(Self {
                _tmp: tmp,
                src,
                dst,
                rsync,
                notifier: Default::default(),
            })
        }

        fn syncer(&self, rotational: bool, counter: Box<dyn FileCounter>) -> Syncer {
            let classifier = DeviceClassifier::new(
                vec![Box::new(FixedResolver(Some("/dev/sda1")))],
                Box::new(FakeSysfs {
                    devices: vec![("sda", Some(rotational))],
                }),
            );
            let size: Box<dyn DiskUsageProbe> = Box::new(WalkProbe);
            Syncer::new(
                classifier,
                Auditor::new(vec![size], vec![counter]),
                self.rsync.clone(),
                self.notifier.clone(),
                ToolConfig::default(),
            )
        }

        fn hdd(&self) -> Syncer {
            self.syncer(true, Box::new(WalkProbe))
        }

        fn request(&self, workers: usize) -> SyncRequest {
            SyncRequest {
                workers,
                ..SyncRequest::new(&self.src, &self.dst)
            }
        }
    }

    #[tokio::test]
    async fn first_run_transfers_second_run_short_circuits() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[])).await?;
        let syncer = fx.hdd();
        let outcome = syncer.sync(&fx.request(4)).await?;
        assert_eq!(outcome.status, Status::Verified);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.source, AuditResult { bytes: 500, files: 10 });
        assert_eq!(outcome.destination, outcome.source);
        assert_eq!(fx.rsync.invocations(), 1);

        let outcome = syncer.sync(&fx.request(4)).await?;
        assert_eq!(outcome.status, Status::AlreadySynced);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.attempts, 0);
        assert_eq!(fx.rsync.invocations(), 1);
        assert!(
            fx.notifier
                .summaries()
                .ends_with(&["Drive Sync".to_string(), "Drive Sync".to_string()])
        );
        Ok(())
    }

    #[tokio::test]
    async fn failed_transfer_is_retried_once() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[1, 0])).await?;
        let outcome = fx.hdd().sync(&fx.request(4)).await?;
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(fx.rsync.invocations(), 2);
        assert_eq!(
            fx.notifier.summaries().last().map(String::as_str),
            Some("Drive Sync: Completed")
        );
        Ok(())
    }

    #[tokio::test]
    async fn second_failure_is_not_retried_and_reports_mismatch() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[1, 1, 0])).await?;
        let outcome = fx.hdd().sync(&fx.request(4)).await?;
        assert_eq!(outcome.status, Status::Mismatch);
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(fx.rsync.invocations(), 2);
        assert_eq!(
            fx.notifier.summaries().last().map(String::as_str),
            Some("Drive Sync: ERROR")
        );
        Ok(())
    }

    #[tokio::test]
    async fn count_mismatch_after_transfer_exits_two() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[])).await?;
        let counter = Box::new(ShortCounter {
            short: fx.dst.clone(),
        });
        let outcome = fx.syncer(true, counter).sync(&fx.request(1)).await?;
        assert_eq!(outcome.destination.files, 9);
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(fx.rsync.invocations(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn ssd_to_ssd_splits_across_workers() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[])).await?;
        let outcome = fx
            .syncer(false, Box::new(WalkProbe))
            .sync(&fx.request(4))
            .await?;
        assert_eq!(outcome.status, Status::Verified);
        let seen = fx.rsync.seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        for command in seen.iter() {
            assert!(command.argv.iter().any(|a| a == "--whole-file"));
            assert_eq!(command.argv.last().unwrap(), &profile::with_trailing_slash(&fx.dst));
        }
        Ok(())
    }

    #[tokio::test]
    async fn parallel_failure_retries_as_single_invocation() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[0, 0, 5, 0, 0])).await?;
        let outcome = fx
            .syncer(false, Box::new(WalkProbe))
            .sync(&fx.request(4))
            .await?;
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(outcome.attempts, 2);
        let seen = fx.rsync.seen.lock().unwrap();
        assert_eq!(seen.len(), 5);
        let retry = seen.last().unwrap();
        let n = retry.argv.len();
        assert_eq!(retry.argv[n - 2], profile::with_trailing_slash(&fx.src));
        Ok(())
    }

    #[tokio::test]
    async fn single_worker_disables_split_on_ssd() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[])).await?;
        let request = SyncRequest {
            mode: Mode::Safe,
            ..fx.request(1)
        };
        fx.syncer(false, Box::new(WalkProbe)).sync(&request).await?;
        assert_eq!(fx.rsync.invocations(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_source_is_fatal() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[])).await?;
        let request = SyncRequest::new(fx.src.join("nope"), &fx.dst);
        let error = fx.hdd().sync(&request).await.unwrap_err();
        assert!(matches!(error, Error::SourceMissing(_)));
        assert_eq!(error.exit_code(), 1);
        assert_eq!(fx.rsync.invocations(), 0);
        assert_eq!(
            fx.notifier.summaries(),
            ["Drive Sync", "Drive Sync Error", "Drive Sync: Fatal error"]
        );
        Ok(())
    }

    #[tokio::test]
    async fn dangling_symlink_source_is_missing() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[23, 23])).await?;
        let link = fx.src.join("dangling");
        tokio::fs::symlink("/definitely/not/here", &link).await?;
        let error = fx.hdd().sync(&SyncRequest::new(&link, &fx.dst)).await.unwrap_err();
        assert!(matches!(error, Error::SourceMissing(_)));
        assert_eq!(error.exit_code(), 1);
        assert_eq!(fx.rsync.invocations(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn empty_destination_is_fatal() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[7, 7])).await?;
        let request = SyncRequest {
            workers: 1,
            ..SyncRequest::new(&fx.src, "")
        };
        let error = fx.hdd().sync(&request).await.unwrap_err();
        assert!(matches!(error, Error::CreateDestination { .. }));
        assert_eq!(error.exit_code(), 1);
        assert_eq!(fx.rsync.invocations(), 0);
        assert_eq!(
            fx.notifier.summaries().last().map(String::as_str),
            Some("Drive Sync: Fatal error")
        );
        Ok(())
    }

    #[tokio::test]
    async fn empty_source_path_is_missing() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[])).await?;
        let error = fx.hdd().sync(&SyncRequest::new("", &fx.dst)).await.unwrap_err();
        assert!(matches!(error, Error::SourceMissing(_)));
        assert_eq!(fx.rsync.invocations(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn destination_is_created() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[])).await?;
        let nested = fx.dst.join("a").join("b");
        let request = SyncRequest::new(&fx.src, &nested);
        let outcome = fx.hdd().sync(&request).await?;
        assert!(nested.is_dir());
        assert_eq!(outcome.exit_code(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn empty_source_never_verifies() -> Result<()> {
        let fx = Fixture::new(FakeRsync::new(&[])).await?;
        let empty = fx.src.join("empty");
        tokio::fs::create_dir(&empty).await?;
        let outcome = fx.hdd().sync(&SyncRequest::new(&empty, &fx.dst)).await?;
        assert_eq!(outcome.status, Status::Mismatch);
        assert_eq!(fx.rsync.invocations(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn spawn_failure_is_fatal() -> Result<()> {
        let rsync = std::sync::Arc::new(FakeRsync {
            codes: Default::default(),
            seen: Default::default(),
            spawn_fails: true,
        });
        let fx = Fixture::new(rsync).await?;
        let error = fx.hdd().sync(&fx.request(4)).await.unwrap_err();
        assert!(matches!(error, Error::Transfer(_)));
        assert_eq!(
            fx.notifier.summaries().last().map(String::as_str),
            Some("Drive Sync: Fatal error")
        );
        Ok(())
    }

    #[test]
    fn elapsed_formatting() {
        let fmt = |s| format_elapsed(std::time::Duration::from_secs(s));
        assert_eq!(fmt(0), "0h 0m 0s");
        assert_eq!(fmt(65), "0h 1m 5s");
        assert_eq!(fmt(3 * 3600 + 7 * 60 + 9), "3h 7m 9s");
    }
}
