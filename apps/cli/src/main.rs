use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use leor_link::transport::{DoneReply, RequestReply};
use leor_link::{
    LinkConfig, LinkSession, MockTransport, PeerScript, SettingsPatch, SettingsSink, SettingsStore,
    StatusParser,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Leor wearable link tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML link configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Feed a status capture (one notification per line) through the parser
    Replay {
        /// Capture file
        capture: PathBuf,
    },
    /// Flash a firmware image
    Flash {
        /// Firmware binary
        firmware: PathBuf,

        /// Run against a simulated device
        #[arg(long)]
        simulate: bool,

        /// Simulated device starts in low-power mode
        #[arg(long)]
        low_power: bool,

        /// Credit grants the simulated device loses (1-based batch numbers)
        #[arg(long, value_delimiter = ',')]
        drop_credit: Vec<u32>,

        /// Simulated device rejects the request
        #[arg(long)]
        reject: bool,

        /// Simulated device reboots right after acknowledging the image
        #[arg(long)]
        reboot: bool,
    },
    /// Write a default configuration file
    Config {
        /// Output path
        path: PathBuf,
    },
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if let Err(e) = run(args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => LinkConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => LinkConfig::default(),
    };

    match args.command {
        Commands::Replay { capture } => replay(&capture),
        Commands::Flash {
            firmware,
            simulate,
            low_power,
            drop_credit,
            reject,
            reboot,
        } => {
            if !simulate {
                bail!("no radio backend in this build; pass --simulate");
            }
            let script = PeerScript {
                request: if reject {
                    RequestReply::Nak
                } else {
                    RequestReply::Ack
                },
                done: if reboot {
                    DoneReply::AckThenReboot
                } else {
                    DoneReply::Ack
                },
                credit_batch: config.ota.credit_batch,
                dropped_credits: drop_credit,
                ..Default::default()
            };
            flash_simulated(&firmware, config, script, low_power)
        }
        Commands::Config { path } => {
            config.save_to_file(&path)?;
            info!(path = %path.display(), "Configuration written");
            Ok(())
        }
    }
}

fn replay(capture: &Path) -> Result<()> {
    let content = std::fs::read_to_string(capture)
        .with_context(|| format!("reading capture {}", capture.display()))?;

    let store = SettingsStore::new();
    let mut parser = StatusParser::new();
    let mut fragments = 0usize;
    for line in content.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        fragments += 1;
        if let Some(patch) = parser.feed(line.as_bytes()).patch() {
            store.apply(patch);
        }
    }
    if !parser.buffer().is_empty() {
        info!(bytes = parser.buffer().len(), "Capture ends inside a structured payload");
    }
    info!(fragments, "Replay complete");

    println!("{}", serde_json::to_string_pretty(&store.snapshot())?);
    Ok(())
}

fn flash_simulated(firmware: &Path, config: LinkConfig, script: PeerScript, low_power: bool) -> Result<()> {
    let image = std::fs::read(firmware)
        .with_context(|| format!("reading firmware {}", firmware.display()))?;
    info!(path = %firmware.display(), size = image.len(), "Loaded firmware");

    let store = Arc::new(SettingsStore::new());
    let mock = MockTransport::with_peer(script);
    let link = LinkSession::new(mock.clone(), config, store.clone());
    link.connect()?;

    if low_power {
        store.apply(&SettingsPatch {
            low_power: Some(true),
            ..Default::default()
        });
    }

    let report = link.update_firmware(&image, |pct, msg| {
        eprintln!("[{:>3}%] {}", pct, msg);
    })?;

    println!(
        "Flashed {} bytes in {} packets ({} recovered credit batches) in {:.2}s",
        report.bytes,
        report.packets,
        report.over_grants,
        report.elapsed.as_secs_f64()
    );
    println!("Device received {} bytes", mock.peer_bytes());
    link.disconnect();
    Ok(())
}
