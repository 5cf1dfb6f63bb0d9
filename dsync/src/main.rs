use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dsync",
    version,
    about = "SSD/HDD-aware, rsync-accelerated directory sync",
    long_about = "`dsync` mirrors the contents of a source directory into a destination directory using rsync.

It detects whether each side lives on a rotational (HDD) or solid-state (SSD) device and picks rsync
flags and I/O priority accordingly. SSD->SSD copies can be split across several parallel rsync
processes, one per group of top-level entries. Before and after the transfer the total size and
file count of both sides are compared; a failed transfer is retried once.

EXIT CODES:
    0 - Transfer verified, or both sides already matched
    1 - Fatal error (e.g. missing source)
    2 - Size/file count mismatch after the transfer

EXAMPLES:
    # Sync with the default (fast) profile and 4 parallel workers
    dsync /media/disk1/photos /media/disk2/photos

    # Conservative flags, no priority changes, no parallel split
    dsync /src /dst --mode safe --workers 1

    # Top speed, debug output on the console
    dsync /src /dst --mode aggressive -v"
)]
struct Args {
    // Sync options
    /// Aggressiveness of rsync flags and process priority
    #[arg(long, value_enum, default_value_t = common::Mode::Fast, help_heading = "Sync options")]
    mode: common::Mode,

    /// Parallel rsync workers for SSD->SSD copies, 0 or 1 disables the split
    #[arg(
        long,
        default_value_t = common::config::DEFAULT_WORKERS,
        value_name = "N",
        help_heading = "Sync options"
    )]
    workers: usize,

    /// Path to the rsync binary
    #[arg(long, value_name = "PATH", help_heading = "Sync options")]
    rsync_path: Option<std::path::PathBuf>,

    // Progress & output
    /// Log file, always written at maximum detail [default: ~/.drive_sync.log]
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    log: Option<std::path::PathBuf>,

    /// Verbose console output: -v DEBUG / -vv TRACE (default: INFO)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Do not send desktop notifications
    #[arg(long, help_heading = "Progress & output")]
    no_notify: bool,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source directory (must exist)
    #[arg()]
    source: std::path::PathBuf,

    /// Destination directory (will be created if missing)
    #[arg()]
    destination: std::path::PathBuf,
}

fn notifier(args: &Args, tools: &common::ToolConfig) -> std::sync::Arc<dyn common::notify::Notifier> {
    if args.no_notify {
        std::sync::Arc::new(common::notify::NullNotifier)
    } else {
        std::sync::Arc::new(common::notify::NotifySend::new(tools))
    }
}

async fn async_main(args: Args) -> Result<common::Outcome, common::sync::Error> {
    let mut tools = common::ToolConfig::default();
    if let Some(rsync) = &args.rsync_path {
        tools.rsync = rsync.clone().into_os_string();
    }
    let syncer = common::Syncer::system(tools.clone(), notifier(&args, &tools));
    let request = common::SyncRequest {
        source: args.source,
        destination: args.destination,
        mode: args.mode,
        workers: args.workers,
    };
    syncer.sync(&request).await
}

fn main() {
    let args = Args::parse();
    let output = common::OutputConfig {
        verbose: args.verbose,
        log_file: Some(args.log.clone().unwrap_or_else(common::config::default_log_file)),
    };
    if let Err(error) = common::logging::init(&output) {
        eprintln!("{error:#}");
    }
    tracing::info!("drive_sync started");
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let print_summary = args.summary;
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let code = match common::run(runtime, func) {
        Ok(Ok(outcome)) => {
            if print_summary {
                println!("{outcome}");
            }
            outcome.exit_code()
        }
        // already logged and notified by the syncer
        Ok(Err(error)) => error.exit_code(),
        Err(error) => {
            tracing::error!("{:#}", error);
            1
        }
    };
    tracing::info!("drive_sync finished with code {}", code);
    std::process::exit(code)
}
