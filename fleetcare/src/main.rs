//! Command line front end for fleetcare.
//!
//! # Usage
//!
//! List the configured devices:
//! ```bash
//! fleetcare devices
//! ```
//!
//! Compare payloads and download logs from two devices:
//! ```bash
//! fleetcare run --compare --download-logs --device cab-01 --device cab-02 --label site-visit
//! ```
//!
//! Reset NVRAM on every device without prompting:
//! ```bash
//! fleetcare run --nvram-reset --all --yes
//! ```
//!
//! Set RUST_LOG=debug for verbose output.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use log::info;
use tokio::sync::mpsc;

use fleetcare::config::{CONFIG_ENV, DEFAULT_CONFIG_PATH, LoggingConfig};
use fleetcare::{
    AppConfig, AutoConfirm, Confirm, DeviceRegistry, Executor, OperationKind, OperationRequest,
    Orchestrator, Prompt, PromptChannel, Question, RunReport, RunRequest, RunStatus, SftpConnector,
};

#[derive(Parser, Debug)]
#[command(name = "fleetcare", version, about = "Maintenance operations for embedded device fleets")]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List configured devices
    Devices,

    /// Run maintenance operations
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Compare device payloads with the master folder
    #[arg(long)]
    compare: bool,

    /// Download logs and write the payload manifest
    #[arg(long)]
    download_logs: bool,

    /// Update device payloads from the master folder
    #[arg(long)]
    update: bool,

    /// Wipe NVRAM and reboot
    #[arg(long)]
    nvram_reset: bool,

    /// Reset NVRAM to the demo configuration and reboot
    #[arg(long)]
    nvram_demo_reset: bool,

    /// Device to process (repeatable)
    #[arg(long = "device", value_name = "NAME")]
    devices: Vec<String>,

    /// Process every configured device
    #[arg(long, conflicts_with = "devices")]
    all: bool,

    /// Label appended to the archive folder name
    #[arg(long)]
    label: Option<String>,

    /// Base directory for downloaded logs
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Folder holding the master payload
    #[arg(long)]
    master_dir: Option<PathBuf>,

    /// Local demo NVRAM file
    #[arg(long)]
    demo_file: Option<PathBuf>,

    /// Devices processed at the same time
    #[arg(long, value_name = "N")]
    concurrency: Option<usize>,

    /// Limit each transfer to this many bytes per second
    #[arg(long, value_name = "BYTES")]
    rate_limit: Option<u64>,

    /// Ask before each operation
    #[arg(long)]
    step: bool,

    /// Answer yes to every prompt
    #[arg(long)]
    yes: bool,
}

impl RunArgs {
    fn operations(&self) -> OperationRequest {
        [
            (OperationKind::CompareFileVersions, self.compare),
            (OperationKind::DownloadLogs, self.download_logs),
            (OperationKind::UpdateFileVersions, self.update),
            (OperationKind::NvramReset, self.nvram_reset),
            (OperationKind::NvramDemoReset, self.nvram_demo_reset),
        ]
        .into_iter()
        .collect()
    }

    fn apply(&self, config: &mut AppConfig) {
        if let Some(dir) = &self.download_dir {
            config.paths.download_dir = dir.clone();
        }
        if let Some(dir) = &self.master_dir {
            config.paths.master_payload_dir = dir.clone();
        }
        if let Some(file) = &self.demo_file {
            config.paths.local_demo_file = file.clone();
        }
        if let Some(n) = self.concurrency {
            config.operations.max_concurrent_devices = n;
        }
        if let Some(limit) = self.rate_limit {
            config.operations.transfer_rate_limit = limit;
        }
        if self.step {
            config.operations.confirm_each_operation = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(&cli.config)?;
    config.apply_overrides(|key| std::env::var(key).ok());
    init_logging(&config.logging)?;

    let registry = Arc::new(DeviceRegistry::load(&config.paths.devices_file)?);
    info!(
        "Loaded {} device(s) from {}",
        registry.len(),
        config.paths.devices_file.display()
    );

    match cli.command {
        Command::Devices => {
            for device in registry.iter() {
                let port = device.port.unwrap_or(config.ssh.port);
                println!("{:<20} {}@{}:{}", device.name, device.username, device.host, port);
            }
            Ok(())
        }
        Command::Run(args) => {
            args.apply(&mut config);

            let devices: Vec<String> = if args.all {
                registry.names().map(str::to_string).collect()
            } else {
                args.devices.clone()
            };
            if devices.is_empty() {
                eprintln!("Error: select devices with --device NAME or --all");
                std::process::exit(2);
            }

            let mut request = RunRequest::new(args.operations()).devices(devices);
            request.label = args.label.clone();

            let executor = Executor::new(
                SftpConnector::new(config.ssh.clone()),
                config.remote.clone(),
                config.operations.clone(),
            );

            let report = if args.yes {
                let orchestrator =
                    Orchestrator::new(executor, registry, config.paths.clone(), AutoConfirm::yes());
                drive(orchestrator, request, None).await?
            } else {
                let (confirm, prompts) = PromptChannel::new(1);
                let orchestrator =
                    Orchestrator::new(executor, registry, config.paths.clone(), confirm);
                drive(orchestrator, request, Some(prompts)).await?
            };

            print_report(&report);
            if !report.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Install env_logger. RUST_LOG wins over the configured level.
fn init_logging(config: &LoggingConfig) -> io::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.level));

    if let Some(path) = &config.file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

/// Run in the background and answer prompts from stdin until the report
/// arrives.
async fn drive<C: Confirm + 'static>(
    orchestrator: Orchestrator<SftpConnector, C>,
    request: RunRequest,
    prompts: Option<mpsc::Receiver<Prompt>>,
) -> fleetcare::Result<RunReport> {
    let handle = orchestrator.spawn(request);

    let Some(mut prompts) = prompts else {
        return handle.wait().await;
    };

    let wait = handle.wait();
    tokio::pin!(wait);

    loop {
        tokio::select! {
            report = &mut wait => return report,
            Some(prompt) = prompts.recv() => {
                let answer = ask_user(&prompt.question).await;
                prompt.answer(answer);
            }
        }
    }
}

/// Ask a y/N question on the terminal. Anything but yes is no.
async fn ask_user(question: &Question) -> bool {
    let text = format!("{question} [y/N] ");
    tokio::task::spawn_blocking(move || {
        print!("{text}");
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut line = String::new();
        match io::stdin().read_line(&mut line) {
            Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    })
    .await
    .unwrap_or(false)
}

fn print_report(report: &RunReport) {
    if let Some(versions) = &report.versions {
        println!("\n{versions}");
    }
    if let Some(archive) = &report.archive {
        println!("Logs saved to {}", archive.display());
    }

    println!("\n{}", "-".repeat(50));
    for (device, outcomes) in report.results.iter() {
        for (kind, outcome) in outcomes {
            println!("{device:<20} {:<24} {outcome}", kind.title());
        }
    }
    println!("{}", "-".repeat(50));

    match &report.status {
        RunStatus::Complete => println!("Run complete"),
        RunStatus::Aborted { before } => println!("Run aborted before '{before}'"),
        RunStatus::Failed(e) => eprintln!("Run failed: {e}"),
    }
}
