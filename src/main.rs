use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use lanbeam::{AppConfig, BatchState, CoreEvent, DeviceId, FileState, Node};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a JSON config file; defaults apply when absent
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node: announce presence and receive files
    Start {
        /// Approve every incoming batch without prompting
        #[arg(long)]
        accept_all: bool,
    },
    /// Send files to a discovered device
    Send {
        /// Device name or id prefix of the target
        #[arg(short, long)]
        to: String,

        /// Files to send
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Seconds to wait for the target to appear
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// List devices discovered so far
    Peers {
        /// Seconds to listen for beacons before printing
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },
}

// Returns a WorkerGuard that must stay alive for file logs to be written.
fn init_logging(log_file_prefix: &str) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", log_file_prefix);
    let (non_blocking_appender, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_appender)
        .with_ansi(false);

    let console_layer = fmt::layer().with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging("lanbeam")?;

    let config = AppConfig::load_or_default(cli.config.as_deref());

    match cli.command {
        Commands::Start { accept_all } => run_start(config, accept_all).await,
        Commands::Send { to, files, wait } => run_send(config, &to, files, wait).await,
        Commands::Peers { wait } => run_peers(config, wait).await,
    }
}

async fn run_start(config: AppConfig, accept_all: bool) -> anyhow::Result<()> {
    let mut node = Node::start(config).await?;
    let mut approvals = node
        .take_approvals()
        .context("approvals channel already taken")?;
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    println!("Device id: {}", node.device_id());
    println!("Waiting for peers; Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            request = approvals.recv() => {
                let Some(request) = request else { break };
                println!(
                    "\nIncoming batch from '{}' ({}): {} file(s), {}",
                    request.device.name,
                    request.device.addr,
                    request.files.len(),
                    lanbeam::utils::format_size(request.total_size),
                );
                for file in &request.files {
                    println!("  {} ({})", file.name, lanbeam::utils::format_size(file.size));
                }

                if accept_all {
                    request.approve(None);
                    continue;
                }

                println!("Accept? [y/N]");
                match stdin.next_line().await {
                    Ok(Some(line)) if line.trim().eq_ignore_ascii_case("y") => {
                        request.approve(None);
                    }
                    _ => request.reject(),
                }
            }
        }
    }

    node.shutdown();
    Ok(())
}

async fn run_send(
    config: AppConfig,
    target: &str,
    files: Vec<PathBuf>,
    wait: u64,
) -> anyhow::Result<()> {
    let node = Node::start(config).await?;
    let device_id = wait_for_device(&node, target, wait)
        .await
        .with_context(|| format!("no device matching '{}' discovered within {}s", target, wait))?;

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .expect("static template"),
    );

    let mut events = node.subscribe();
    let bar = pb.clone();
    let feed = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                CoreEvent::BatchProgress { percent, .. } => {
                    bar.set_position(percent.round() as u64);
                }
                CoreEvent::FileCompleted { name, .. } => {
                    bar.println(format!("sent {}", name));
                }
                CoreEvent::FileFailed { name, reason, .. } => {
                    bar.println(format!("FAILED {}: {}", name, reason));
                }
                _ => {}
            }
        }
    });

    let outcome = node.send_batch(&device_id, &files).await?;
    pb.finish_and_clear();
    feed.abort();

    if outcome.state == BatchState::Rejected {
        println!("Batch rejected by the peer; nothing was sent.");
        return Ok(());
    }

    let completed = outcome.completed().count();
    println!("{}/{} file(s) transferred.", completed, outcome.files.len());
    for report in &outcome.files {
        if let FileState::Failed { reason } = &report.state {
            error!("{}: {}", report.name, reason);
        }
    }
    if completed < outcome.files.len() {
        anyhow::bail!("batch finished with failures");
    }
    Ok(())
}

async fn run_peers(config: AppConfig, wait: u64) -> anyhow::Result<()> {
    let node = Node::start(config).await?;
    tokio::time::sleep(Duration::from_secs(wait)).await;

    let devices = node.registry().snapshot();
    if devices.is_empty() {
        println!("No peers discovered.");
        return Ok(());
    }
    println!("{:<16} {:<20} {:<8} {}", "ID", "NAME", "OS", "ADDRESS");
    for device in devices {
        println!(
            "{:<16} {:<20} {:<8} {}",
            &device.id.as_str()[..16.min(device.id.as_str().len())],
            device.name,
            device.os,
            device.addr,
        );
    }
    Ok(())
}

/// Poll the registry until a device matches by exact name or id prefix.
async fn wait_for_device(node: &Node, target: &str, wait: u64) -> Option<DeviceId> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
    loop {
        for device in node.registry().snapshot() {
            if device.name == target || device.id.as_str().starts_with(target) {
                return Some(device.id);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
