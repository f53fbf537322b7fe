// Copyright 2025 The Kernelvisor Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::Parser;
use kernelvisor_config::kernelvisor::KernelvisorConfig;
use kernelvisor_error::{Error, ResultExt};
use kernelvisor_kernel::kernel_manager::KernelManager;
use kernelvisor_kernel::launch_args::LaunchArgs;
use kernelvisor_kernel::restarter::RestarterEvent;
use kernelvisor_util::init_tracing;
use mimalloc::MiMalloc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast::error::RecvError;
use tracing::{Instrument, error, info, info_span, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Launches a kernel, restarts it when it dies and shuts it down on
/// SIGINT or SIGTERM.
#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    /// Config file to use.
    #[clap(value_parser)]
    config_file: String,
}

async fn inner_main(config: KernelvisorConfig) -> Result<(), Error> {
    let manager = KernelManager::new(&config, None);
    let mut events = manager.subscribe_restarter_events();
    let mut sigterm = signal(SignalKind::terminate()).err_tip(|| "Failed to listen to SIGTERM")?;

    manager
        .start_kernel(Some(LaunchArgs::from_current_env()))
        .await
        .err_tip(|| "Could not start kernel")?;

    let outcome = loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                warn!("Process interrupted via SIGINT");
                break result.err_tip(|| "Failed to listen to SIGINT");
            }
            _ = sigterm.recv() => {
                warn!("Process terminated via SIGTERM");
                break Ok(());
            }
            event = events.recv() => match event {
                Ok(RestarterEvent::Dead { kernel_id, error }) => {
                    error!(%kernel_id, ?error, "Kernel keeps dying, giving up");
                    break Err(error);
                }
                Ok(event) => info!(?event, "Restarter event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed restarter events"),
                Err(RecvError::Closed) => break Ok(()),
            }
        }
    };

    let shutdown = manager
        .shutdown_kernel(false, false)
        .await
        .err_tip(|| "While shutting down kernel");
    if shutdown.is_ok() {
        info!("Kernel shut down");
    }
    outcome.merge(shutdown)
}

fn main() -> Result<(), Box<dyn core::error::Error>> {
    init_tracing()?;

    let args = Args::parse();
    let config = KernelvisorConfig::try_from_json5_file(&args.config_file)?;

    #[allow(clippy::disallowed_methods)]
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?;
        runtime
            .block_on(inner_main(config).instrument(info_span!("main")))
            .err_tip(|| "main() function failed")?;
    }
    Ok(())
}
