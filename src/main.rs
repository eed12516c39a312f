use anyhow::Context;
use clap::Parser;
use grbllink::{
    init_logging, BroadcastListener, CommConfig, CommEvent, EventDispatcher, GrblController,
    JobEvent, MachineProfile, MachineState, BUILD_DATE, VERSION,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

#[derive(Parser, Debug, Clone)]
#[command(name = "grbllink", version, about = "Operator console for GRBL laser cutters")]
struct Args {
    #[arg(short, long, help = "Serial port, AUTO to detect (overrides the config file)")]
    port: Option<String>,
    #[arg(short, long, help = "Baud rate, 0 for the default (overrides the config file)")]
    baud: Option<u32>,
    #[arg(short, long, help = "Communication config file (TOML or JSON)")]
    config: Option<PathBuf>,
    #[arg(long, help = "Machine profile file (TOML or JSON)")]
    profile: Option<PathBuf>,
    #[arg(short, long, help = "G-code file to print once the machine is operational")]
    file: Option<PathBuf>,
    #[arg(long, default_value_t = 1, help = "Number of passes for the job")]
    passes: u32,
    #[arg(long, help = "Send $X when the machine reports it is locked")]
    unlock: bool,
    #[arg(long, help = "Disconnect and exit once the job is done")]
    exit_when_done: bool,
    #[arg(long, help = "Log JSON records instead of the pretty format")]
    json: bool,
}

fn load_config(args: &Args) -> anyhow::Result<CommConfig> {
    let mut config = match &args.config {
        Some(path) => CommConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => match CommConfig::default_path() {
            Ok(path) if path.is_file() => CommConfig::load_from_file(&path)
                .with_context(|| format!("loading config {}", path.display()))?,
            _ => CommConfig::default(),
        },
    };
    if let Some(port) = &args.port {
        config.connection.port = port.clone();
    }
    if let Some(baud) = args.baud {
        config.connection.baud_rate = baud;
    }
    config.validate()?;
    Ok(config)
}

fn load_profile(args: &Args) -> anyhow::Result<MachineProfile> {
    match &args.profile {
        Some(path) => MachineProfile::load_from_file(path)
            .with_context(|| format!("loading profile {}", path.display())),
        None => Ok(MachineProfile::default()),
    }
}

/// Run a blocking controller call off the async runtime
async fn blocking<F>(controller: &GrblController, f: F)
where
    F: FnOnce(&GrblController) -> grbllink::Result<()> + Send + 'static,
{
    let controller = controller.clone();
    match tokio::task::spawn_blocking(move || f(&controller)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{}", e),
        Err(e) => error!("Controller task failed: {}", e),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json)?;
    info!("grbllink {} (built {})", VERSION, BUILD_DATE);

    let config = load_config(&args)?;
    let profile = load_profile(&args)?;

    let dispatcher = EventDispatcher::default();
    let mut events = dispatcher.subscribe();
    let controller = GrblController::builder(config)
        .profile(profile)
        .listener(Arc::new(BroadcastListener::new(dispatcher)))
        .build();
    controller.set_passes(args.passes);

    blocking(&controller, |c| c.connect()).await;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut pending_file = args.file.clone();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    blocking(&controller, move |c| c.send_command(&line)).await;
                }
                Ok(None) => {
                    if pending_file.is_none() && !controller.state().is_operational() {
                        break;
                    }
                    // Stay attached while a job runs.
                    stdin_open = false;
                }
                Err(e) => {
                    warn!("Reading stdin failed: {}", e);
                    stdin_open = false;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    match &event {
                        CommEvent::Error(message) => error!("{}", message),
                        CommEvent::PositionUpdated { .. } | CommEvent::Progress(_) => {}
                        _ => info!("{}", event),
                    }
                    match event {
                        CommEvent::StateChanged { new: MachineState::Locked, .. } if args.unlock => {
                            blocking(&controller, |c| c.send_command("$X")).await;
                        }
                        CommEvent::StateChanged { new: MachineState::Operational, .. } => {
                            if let Some(file) = pending_file.take() {
                                blocking(&controller, move |c| {
                                    c.select_file(&file)?;
                                    c.start_print()
                                })
                                .await;
                            }
                        }
                        CommEvent::StateChanged { new, .. } if new.is_closed() => {
                            warn!("Connection closed: {}", controller.state_string());
                            break;
                        }
                        CommEvent::Job(JobEvent::Done { .. }) if args.exit_when_done => break,
                        _ => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} events", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    if !controller.state().is_closed() {
        tokio::task::spawn_blocking(move || controller.close(false, None)).await?;
    }
    Ok(())
}
