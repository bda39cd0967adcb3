// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bridge Relayer Binary.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;

use structopt::StructOpt;
use tokio::signal::unix;
use tokio::sync::mpsc;

use bridge_relayer::context::RelayerContext;
use bridge_relayer::store::SledBlockStore;
use bridge_relayer::{config, probe, service};

/// The Bridge Relayer Command-line tool
///
/// Start the relayer from a config file:
///
/// $ bridge-relayer -vvv -c <CONFIG_FILE_PATH>
#[derive(StructOpt)]
#[structopt(name = "Bridge Relayer")]
struct Opts {
    /// A level of verbosity, and can be used multiple times
    #[structopt(short, long, parse(from_occurrences))]
    verbose: i32,
    /// Path to the top-level configuration file.
    #[structopt(
        short = "c",
        long = "config",
        value_name = "PATH",
        parse(from_os_str)
    )]
    config_path: PathBuf,
    /// Create the blockstore in a temporary directory,
    /// which will be deleted when the process exits.
    #[structopt(long)]
    tmp: bool,
}

/// Sets up the logger for the relayer.
///
/// Each `-v` raises the default level one notch (errors only up to full
/// traces); `RUST_LOG` directives still win for individual targets, so the
/// probe targets can be switched on without flooding everything else.
fn setup_logger(verbosity: i32) -> anyhow::Result<()> {
    use tracing_subscriber::filter::LevelFilter;
    let default_level = match verbosity {
        i32::MIN..=0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_target(true)
        .with_env_filter(filter)
        .init();
    Ok(())
}

/// The main entry point for the relayer.
///
/// # Arguments
///
/// * `args` - The command line arguments.
#[paw::main]
#[tokio::main]
async fn main(args: Opts) -> anyhow::Result<()> {
    setup_logger(args.verbose)?;
    match dotenv::dotenv() {
        Ok(_) => {
            tracing::trace!("Loaded .env file");
        }
        Err(e) => {
            tracing::trace!("Failed to load .env file: {e}");
        }
    }

    let config = config::load(&args.config_path)?;

    // persistent storage for the block cursors
    let store = if args.tmp {
        tracing::debug!("Using temp dir for the blockstore");
        Arc::new(SledBlockStore::temporary()?)
    } else {
        Arc::new(SledBlockStore::open(&config.blockstore_path)?)
    };

    // The RelayerContext takes the configuration and populates objects
    // that are needed throughout the lifetime of the relayer.
    let ctx = RelayerContext::new(config, store)?;

    // fatal errors of background services terminate the daemon
    let (fatal_tx, mut fatal_rx) = mpsc::channel(4);

    // start all background services.
    // this does not block, it fires the services on background tasks.
    service::ignite(&ctx, fatal_tx).await?;
    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Lifecycle,
        started = true,
    );

    // watch for signals
    let mut interrupt_signal =
        unix::signal(unix::SignalKind::interrupt())?;
    let mut termination_signal =
        unix::signal(unix::SignalKind::terminate())?;
    let mut hangup_signal = unix::signal(unix::SignalKind::hangup())?;
    let mut quit_signal = unix::signal(unix::SignalKind::quit())?;

    tokio::select! {
        maybe_error = fatal_rx.recv() => {
            if let Some(e) = maybe_error {
                tracing::error!(error = %e, "fatal service error");
                service::wind_down(&ctx).await;
                return Err(e.into());
            }
        }
        _ = interrupt_signal.recv() => {
            tracing::warn!("Interrupted (Ctrl+C) ...");
        }
        _ = termination_signal.recv() => {
            tracing::warn!("Got Terminate signal ...");
        }
        _ = hangup_signal.recv() => {
            tracing::warn!("Got Hangup signal ...");
        }
        _ = quit_signal.recv() => {
            tracing::warn!("Quitting ...");
        }
    }
    service::wind_down(&ctx).await;
    Ok(())
}
