//! Command-line interface for the HSM link.
//!
//! Lists serial ports, finds the HSM, and runs single commands against it.
//! Logs go to stderr (RUST_LOG controls the level); results go to stdout.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use hsm_link::discovery::DeviceProbe;
use hsm_link::tracing::{self, prelude::*};
use hsm_link::transport::sim::SIM_USB_ID;
use hsm_link::transport::{SerialPortSource, SimTransport, StaticPorts};
use hsm_link::{Hsm, HsmConfig, HsmWorker, KeyId};

const USAGE: &str = "\
usage: hsmctl [--sim] <command>

commands:
  ports            list serial ports
  discover         find the HSM and print its port
  lock             lock the HSM
  new-key          create a key; prints its id and passphrase
  derive <KEY_ID>  recover the passphrase for a key id (16 hex digits)

options:
  --sim            talk to a simulated HSM instead of real hardware";

enum Command {
    Ports,
    Discover,
    Device(DeviceCommand),
}

/// Commands that run an exchange on the background worker.
enum DeviceCommand {
    Lock,
    NewKey,
    Derive(KeyId),
}

struct Args {
    sim: bool,
    command: Command,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut sim = false;
        let mut command = None;

        while let Some(arg) = args.next() {
            let parsed = match arg.as_str() {
                "--sim" => {
                    sim = true;
                    continue;
                }
                "-h" | "--help" => bail!("{}", USAGE),
                "ports" => Command::Ports,
                "discover" => Command::Discover,
                "lock" => Command::Device(DeviceCommand::Lock),
                "new-key" => Command::Device(DeviceCommand::NewKey),
                "derive" => {
                    let hex = args.next().ok_or_else(|| anyhow!("derive needs a key id\n\n{}", USAGE))?;
                    let key_id = hex
                        .parse::<KeyId>()
                        .with_context(|| format!("invalid key id '{}'", hex))?;
                    Command::Device(DeviceCommand::Derive(key_id))
                }
                other => bail!("unknown argument '{}'\n\n{}", other, USAGE),
            };
            if command.replace(parsed).is_some() {
                bail!("only one command at a time\n\n{}", USAGE);
            }
        }

        let command = command.ok_or_else(|| anyhow!("{}", USAGE))?;
        Ok(Self { sim, command })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stderr();

    let args = Args::parse(std::env::args().skip(1))?;
    let config = HsmConfig::load()?;

    if let Command::Ports = args.command {
        for descriptor in SerialPortSource::descriptors()? {
            println!("{}", descriptor);
        }
        return Ok(());
    }

    let running = CancellationToken::new();
    let hsm = if args.sim {
        let source = Arc::new(StaticPorts(vec![SimTransport::hsm("sim0").handle()]));
        Hsm::with_source(&config, source, Arc::new(DeviceProbe::new(vec![SIM_USB_ID])))?
    } else {
        Hsm::new(&config)?
    }
    .with_cancellation(running.clone());

    let signals = tokio::spawn(cancel_on_signal(running.clone()));

    let outcome = match args.command {
        Command::Ports => Ok(()),
        Command::Discover => hsm
            .discover()
            .await
            .map(|transport| println!("{}", transport.descriptor())),
        Command::Device(command) => run_on_worker(hsm, command, &running).await,
    };

    signals.abort();
    outcome.map_err(|e| {
        error!(kind = e.kind(), "{}", e);
        anyhow!(e)
    })
}

async fn run_on_worker(
    hsm: Hsm,
    command: DeviceCommand,
    running: &CancellationToken,
) -> hsm_link::Result<()> {
    let tracker = TaskTracker::new();
    let (worker, handle) = HsmWorker::new(hsm, 1);
    tracker.spawn(worker.run(running.clone()));
    tracker.close();

    let outcome = match command {
        DeviceCommand::Lock => handle.lock().await.map(|()| println!("locked")),
        DeviceCommand::NewKey => handle.new_key().await.map(|(key_id, material)| {
            println!("key_id={}", key_id);
            println!("passphrase={}", material.to_hex());
        }),
        DeviceCommand::Derive(key_id) => handle
            .derive_key(key_id)
            .await
            .map(|material| println!("passphrase={}", material.to_hex())),
    };

    trace!("Shutting down.");
    running.cancel();
    tracker.wait().await;
    outcome
}

async fn cancel_on_signal(running: CancellationToken) {
    match wait_for_signal().await {
        Ok(()) => {
            info!("Interrupted, cancelling.");
            running.cancel();
        }
        Err(e) => warn!(error = %e, "Could not install signal handlers."),
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{self, SignalKind};

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
