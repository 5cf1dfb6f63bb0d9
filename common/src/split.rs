//! Parallel split strategy: the top-level entries of the source are dealt round-robin into
//! buckets and each non-empty bucket is mirrored by its own rsync process.
//!
//! Buckets are a disjoint cover of the source's top level, so concurrent transfers write
//! disjoint subtrees of the destination. Directory listing order is whatever the OS returns.

use anyhow::{Context, Result};
use tracing::instrument;

use crate::config::ToolConfig;
use crate::profile::{MirrorCommand, TransferProfile, with_trailing_slash};
use crate::runner::MirrorRunner;

/// Immediate children (files and directories) of `path`.
#[instrument]
pub async fn list_top_level_entries(path: &std::path::Path) -> Result<Vec<std::path::PathBuf>> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", path))?;
    let mut children = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", path))?
    {
        children.push(entry.path());
    }
    Ok(children)
}

/// Deals `items` into `workers` buckets: bucket `i` receives indices `i`, `i + workers`, ...
///
/// A worker count of zero is treated as one.
#[must_use]
pub fn partition_round_robin<T: Clone>(items: &[T], workers: usize) -> Vec<Vec<T>> {
    let workers = workers.max(1);
    let mut buckets = vec![Vec::new(); workers];
    for (idx, item) in items.iter().enumerate() {
        buckets[idx % workers].push(item.clone());
    }
    buckets
}

/// One command per non-empty bucket; sources are the bucket's entries, the destination is
/// shared.
#[must_use]
pub fn bucket_commands(
    buckets: Vec<Vec<std::path::PathBuf>>,
    destination: &std::path::Path,
    profile: &TransferProfile,
    tools: &ToolConfig,
) -> Vec<MirrorCommand> {
    buckets
        .into_iter()
        .filter(|bucket| !bucket.is_empty())
        .map(|bucket| {
            let sources = bucket.into_iter().map(std::path::PathBuf::into_os_string).collect();
            profile.command(tools, sources, with_trailing_slash(destination))
        })
        .collect()
}

/// Runs all bucket transfers concurrently and returns the highest exit code.
#[instrument(skip(runner, profile, tools))]
pub async fn run_parallel(
    runner: std::sync::Arc<dyn MirrorRunner>,
    source: &std::path::Path,
    destination: &std::path::Path,
    workers: usize,
    profile: &TransferProfile,
    tools: &ToolConfig,
) -> Result<i32> {
    tracing::info!("Using parallel rsync with {} workers", workers);
    let entries = list_top_level_entries(source).await?;
    if entries.is_empty() {
        tracing::info!("No top-level entries to parallelize.");
        return Ok(0);
    }
    let commands = bucket_commands(
        partition_round_robin(&entries, workers),
        destination,
        profile,
        tools,
    );
    let mut join_set = tokio::task::JoinSet::new();
    for (idx, command) in commands.into_iter().enumerate() {
        tracing::debug!("Worker {} cmd: {}", idx, command);
        let runner = runner.clone();
        join_set.spawn(async move { runner.run(&command).await });
    }
    let mut worst = 0;
    let mut failure = None;
    while let Some(res) = join_set.join_next().await {
        match res.context("transfer task panicked")? {
            Ok(code) => worst = worst.max(code),
            Err(error) => {
                tracing::error!("transfer worker failed: {:#}", error);
                failure.get_or_insert(error);
            }
        }
    }
    // every worker has finished before an error is surfaced
    if let Some(error) = failure {
        return Err(error);
    }
    Ok(worst)
}
