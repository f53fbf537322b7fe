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

use core::fmt::{self, Debug};
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::sync::{Arc, OnceLock, Weak};

use async_lock::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use kernelvisor_config::kernelvisor::{KernelvisorConfig, RestarterConfig};
use kernelvisor_error::{Code, Error, ResultExt, make_err};
use nix::sys::signal::Signal;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channels::{ChannelFactory, KernelChannels};
use crate::connection_info::ConnectionInfo;
use crate::kernel_spec::{InterruptMode, KernelSpec};
use crate::launch_args::LaunchArgs;
use crate::provisioner::{
    KernelProvisioner, ProvisionerContext, ProvisionerFactory, provisioner_factory,
};
use crate::restarter::{Callbacks, KernelRestarter, RestarterEvent};

/// Capacity of the restarter event channel. Slow subscribers lag rather
/// than block the restarter.
const RESTARTER_EVENT_CAPACITY: usize = 16;

/// Lifecycle of the kernel a `KernelManager` supervises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    /// `start_kernel` was never called or the last start failed.
    Unstarted,
    Starting,
    Running,
    Restarting,
    Terminating,
    /// The kernel was shut down, or a restart failed.
    Dead,
}

/// Everything a `KernelManager` is built from.
pub struct KernelManagerArgs {
    pub kernel_spec: KernelSpec,
    pub context: ProvisionerContext,
    pub provisioner_factory: Arc<dyn ProvisionerFactory>,
    pub channel_factory: Option<Arc<dyn ChannelFactory>>,
    pub shutdown_wait_time: Duration,
    pub restarter: RestarterConfig,
}

impl Debug for KernelManagerArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelManagerArgs")
            .field("kernel_spec", &self.kernel_spec)
            .field("context", &self.context)
            .field("shutdown_wait_time", &self.shutdown_wait_time)
            .field("restarter", &self.restarter)
            .finish_non_exhaustive()
    }
}

/// The provisioner and what it was launched with. Lifecycle operations hold
/// this lock for their whole duration, other operations only briefly.
#[derive(Debug, Default)]
struct KernelSlot {
    provisioner: Option<Box<dyn KernelProvisioner>>,
    launch_args: Option<LaunchArgs>,
    channels: Option<Box<dyn KernelChannels>>,
}

/// Supervises the lifecycle of exactly one kernel.
pub struct KernelManager {
    kernel_spec: KernelSpec,
    context: Arc<ProvisionerContext>,
    provisioner_factory: Arc<dyn ProvisionerFactory>,
    channel_factory: Option<Arc<dyn ChannelFactory>>,
    shutdown_wait_time: Duration,
    restarter_config: RestarterConfig,
    callbacks: Callbacks,

    /// Assigned on the first start and kept across restarts.
    kernel_id: OnceLock<String>,
    /// Taken with `try_lock` by start, restart and shutdown, so a second
    /// lifecycle operation fails fast instead of queueing.
    lifecycle: AsyncMutex<()>,
    slot: AsyncMutex<KernelSlot>,
    state_tx: watch::Sender<KernelState>,
    connection_info: RwLock<Option<Arc<ConnectionInfo>>>,
    shutting_down: AtomicBool,
    attempted_start: AtomicBool,

    restarter: Mutex<Option<KernelRestarter>>,
    restarter_events: broadcast::Sender<RestarterEvent>,
    weak_self: Weak<Self>,
}

impl Debug for KernelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelManager")
            .field("kernel_id", &self.kernel_id.get())
            .field("state", &self.state())
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl KernelManager {
    pub fn new(
        config: &KernelvisorConfig,
        channel_factory: Option<Arc<dyn ChannelFactory>>,
    ) -> Arc<Self> {
        Self::new_with_callbacks(
            KernelManagerArgs {
                kernel_spec: config.kernel.clone(),
                context: ProvisionerContext::from_config(&config.connection),
                provisioner_factory: provisioner_factory(&config.provisioner),
                channel_factory,
                shutdown_wait_time: config.shutdown_wait_time,
                restarter: config.restarter.clone(),
            },
            Callbacks::default(),
        )
    }

    pub fn new_with_callbacks(args: KernelManagerArgs, callbacks: Callbacks) -> Arc<Self> {
        let (state_tx, _) = watch::channel(KernelState::Unstarted);
        let (restarter_events, _) = broadcast::channel(RESTARTER_EVENT_CAPACITY);
        Arc::new_cyclic(|weak_self| Self {
            kernel_spec: args.kernel_spec,
            context: Arc::new(args.context),
            provisioner_factory: args.provisioner_factory,
            channel_factory: args.channel_factory,
            shutdown_wait_time: args.shutdown_wait_time,
            restarter_config: args.restarter,
            callbacks,
            kernel_id: OnceLock::new(),
            lifecycle: AsyncMutex::new(()),
            slot: AsyncMutex::new(KernelSlot::default()),
            state_tx,
            connection_info: RwLock::new(None),
            shutting_down: AtomicBool::new(false),
            attempted_start: AtomicBool::new(false),
            restarter: Mutex::new(None),
            restarter_events,
            weak_self: weak_self.clone(),
        })
    }

    /// Id of the kernel. `None` until the first `start_kernel`.
    pub fn kernel_id(&self) -> Option<&str> {
        self.kernel_id.get().map(String::as_str)
    }

    pub const fn kernel_spec(&self) -> &KernelSpec {
        &self.kernel_spec
    }

    pub fn context(&self) -> &ProvisionerContext {
        &self.context
    }

    pub fn state(&self) -> KernelState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<KernelState> {
        self.state_tx.subscribe()
    }

    /// Connection parameters of the running kernel. Ports are always
    /// concrete.
    pub fn connection_info(&self) -> Option<Arc<ConnectionInfo>> {
        self.connection_info.read().clone()
    }

    /// True while a shutdown or the teardown half of a restart is in
    /// progress.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn subscribe_restarter_events(&self) -> broadcast::Receiver<RestarterEvent> {
        self.restarter_events.subscribe()
    }

    /// Whether a provisioner is attached, running or not.
    pub async fn has_kernel(&self) -> bool {
        self.slot.lock().await.provisioner.is_some()
    }

    /// Starts the kernel. `None` reuses the arguments of the previous start.
    ///
    /// On failure the provisioner is cleaned up and the state returns to
    /// `Unstarted`.
    pub async fn start_kernel(&self, args: Option<LaunchArgs>) -> Result<(), Error> {
        let _lifecycle = self.try_begin_lifecycle()?;
        let mut slot = self.slot.lock().await;
        if slot.provisioner.is_some() {
            return Err(make_err!(
                Code::AlreadyExists,
                "Kernel {} is already running",
                self.kernel_id().unwrap_or_default()
            ));
        }
        self.shutting_down.store(false, Ordering::Release);
        self.attempted_start.store(true, Ordering::Release);

        let args = match args {
            Some(args) => args,
            None => slot.launch_args.clone().unwrap_or_default(),
        };
        let kernel_id = self.assign_kernel_id(args.kernel_id.as_deref());
        slot.launch_args = Some(args.clone());
        self.set_state(KernelState::Starting);
        info!(%kernel_id, "Starting kernel");

        let mut provisioner = match self.provisioner_factory.create(
            &kernel_id,
            &self.kernel_spec,
            self.context.clone(),
        ) {
            Ok(provisioner) => provisioner,
            Err(err) => {
                self.set_state(KernelState::Unstarted);
                return Err(err).err_tip(|| "While creating kernel provisioner");
            }
        };

        match Self::launch(provisioner.as_mut(), args).await {
            Ok(connection_info) => {
                slot.provisioner = Some(provisioner);
                self.post_start(&mut slot, connection_info).await;
                if self.restarter_config.autorestart {
                    self.start_restarter();
                }
                Ok(())
            }
            Err(err) => {
                error!(%kernel_id, ?err, "Kernel failed to start");
                let cleanup = provisioner.cleanup(false).await;
                self.set_state(KernelState::Unstarted);
                Err::<(), _>(err).merge(cleanup)
            }
        }
    }

    /// Stops the kernel and launches it again on the same provisioner with
    /// the arguments of the last start. `kernel_id` is preserved.
    ///
    /// When the relaunch fails the state becomes `Dead`.
    pub async fn restart_kernel(&self, now: bool) -> Result<(), Error> {
        let _lifecycle = self.try_begin_lifecycle()?;
        let mut slot = self.slot.lock().await;
        if slot.provisioner.is_none() {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Cannot restart the kernel. No previous call to start_kernel"
            ));
        }
        let kernel_id = self.kernel_id().unwrap_or_default().to_string();
        let launch_args = slot.launch_args.clone().unwrap_or_default();
        info!(%kernel_id, now, "Restarting kernel");

        self.shutting_down.store(true, Ordering::Release);
        self.set_state(KernelState::Restarting);
        if let Err(err) = self.stop_kernel(&mut slot, now, true).await {
            warn!(%kernel_id, ?err, "Errors while stopping kernel for restart");
        }
        self.shutting_down.store(false, Ordering::Release);

        let relaunch = match slot.provisioner.as_deref_mut() {
            Some(provisioner) => Self::launch(provisioner, launch_args).await,
            None => Err(make_err!(Code::Internal, "Provisioner vanished during restart")),
        };
        match relaunch {
            Ok(connection_info) => {
                self.post_start(&mut slot, connection_info).await;
                Ok(())
            }
            Err(err) => {
                error!(%kernel_id, ?err, "Kernel failed to restart");
                let cleanup = match slot.provisioner.as_deref_mut() {
                    Some(provisioner) => provisioner.cleanup(true).await,
                    None => Ok(()),
                };
                self.set_state(KernelState::Dead);
                Err::<(), _>(err).merge(cleanup)
            }
        }
    }

    /// Shuts the kernel down. With `now` the kernel is terminated without
    /// asking it first. With `restart` the provisioner is kept so a later
    /// `restart_kernel` can relaunch it, and the restarter keeps running.
    ///
    /// Shutting down a kernel that is already gone is a no-op.
    pub async fn shutdown_kernel(&self, now: bool, restart: bool) -> Result<(), Error> {
        if !self.attempted_start.load(Ordering::Acquire) {
            return Err(make_err!(
                Code::FailedPrecondition,
                "Cannot shut down the kernel. It was never started"
            ));
        }
        let _lifecycle = self.try_begin_lifecycle()?;
        if !restart {
            self.stop_restarter();
        }
        self.shutting_down.store(true, Ordering::Release);
        let mut slot = self.slot.lock().await;
        if slot.provisioner.is_none() {
            debug!("No kernel to shut down");
            return Ok(());
        }
        let kernel_id = self.kernel_id().unwrap_or_default().to_string();
        info!(%kernel_id, now, restart, "Shutting down kernel");

        self.set_state(KernelState::Terminating);
        let result = self.stop_kernel(&mut slot, now, restart).await;
        if !restart {
            slot.provisioner = None;
        }
        self.set_state(KernelState::Dead);
        if let Err(err) = &result {
            warn!(%kernel_id, ?err, "Kernel shut down with errors");
        }
        result
    }

    /// Interrupts the kernel the way its `interrupt_mode` says.
    pub async fn interrupt_kernel(&self) -> Result<(), Error> {
        let mut slot = self.slot.lock().await;
        match self.kernel_spec.interrupt_mode {
            InterruptMode::Signal => {
                info!(kernel_id = self.kernel_id(), "Interrupting kernel");
                Self::signal_owned(&mut slot, Signal::SIGINT).await
            }
            InterruptMode::Message => {
                let channels = slot.channels.as_ref().err_tip_with_code(|_| {
                    (
                        Code::FailedPrecondition,
                        "Cannot interrupt kernel. No channels are open",
                    )
                })?;
                info!(kernel_id = self.kernel_id(), "Requesting kernel interrupt");
                channels.request_interrupt().await
            }
        }
    }

    /// Sends `signal` to the kernel. Fails with `Unimplemented` for kernels
    /// this process does not own.
    pub async fn signal_kernel(&self, signal: Signal) -> Result<(), Error> {
        let mut slot = self.slot.lock().await;
        Self::signal_owned(&mut slot, signal).await
    }

    /// Whether the kernel process is running. Errors while polling are
    /// logged and reported as not alive.
    pub async fn is_alive(&self) -> bool {
        let mut slot = self.slot.lock().await;
        let Some(provisioner) = slot.provisioner.as_deref_mut() else {
            return false;
        };
        if !provisioner.has_process() {
            return false;
        }
        match provisioner.poll().await {
            Ok(status) => status.is_none(),
            Err(err) => {
                warn!(kernel_id = self.kernel_id(), ?err, "Could not poll kernel");
                false
            }
        }
    }

    /// Starts the restarter regardless of `autorestart`. Does nothing if it
    /// already runs.
    pub fn start_restarter(&self) {
        self.restarter
            .lock()
            .get_or_insert_with(|| {
                KernelRestarter::new(
                    self.weak_self.clone(),
                    self.restarter_config.clone(),
                    self.callbacks,
                    self.restarter_events.clone(),
                )
            })
            .start();
    }

    pub fn stop_restarter(&self) {
        if let Some(restarter) = self.restarter.lock().as_ref() {
            restarter.stop();
        }
    }

    pub fn is_restarter_running(&self) -> bool {
        self.restarter
            .lock()
            .as_ref()
            .is_some_and(KernelRestarter::is_running)
    }

    fn try_begin_lifecycle(&self) -> Result<AsyncMutexGuard<'_, ()>, Error> {
        self.lifecycle.try_lock().err_tip_with_code(|_| {
            (
                Code::AlreadyExists,
                "Kernel is busy with another lifecycle operation",
            )
        })
    }

    fn assign_kernel_id(&self, requested: Option<&str>) -> String {
        let kernel_id = self.kernel_id.get_or_init(|| {
            requested.map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string)
        });
        if let Some(requested) = requested {
            if requested != kernel_id {
                warn!(%kernel_id, requested, "Ignoring kernel id, the kernel already has one");
            }
        }
        kernel_id.clone()
    }

    fn set_state(&self, state: KernelState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(kernel_id = self.kernel_id(), ?previous, ?state, "Kernel state changed");
        }
    }

    async fn launch(
        provisioner: &mut dyn KernelProvisioner,
        args: LaunchArgs,
    ) -> Result<ConnectionInfo, Error> {
        let mut args = provisioner
            .pre_launch(args)
            .await
            .err_tip(|| "In KernelProvisioner::pre_launch")?;
        let cmd = core::mem::take(&mut args.cmd);
        let connection_info = provisioner
            .launch(cmd, &args)
            .await
            .err_tip(|| "In KernelProvisioner::launch")?;
        connection_info
            .ensure_complete()
            .err_tip(|| "Provisioner returned incomplete connection info")?;
        Ok(connection_info)
    }

    async fn post_start(&self, slot: &mut KernelSlot, connection_info: ConnectionInfo) {
        let connection_info = Arc::new(connection_info);
        *self.connection_info.write() = Some(connection_info.clone());
        if let Some(channel_factory) = &self.channel_factory {
            match channel_factory.connect(&connection_info).await {
                Ok(channels) => slot.channels = Some(channels),
                Err(err) => warn!(
                    kernel_id = self.kernel_id(),
                    ?err,
                    "Could not open kernel channels"
                ),
            }
        }
        self.set_state(KernelState::Running);
        info!(
            kernel_id = self.kernel_id(),
            transport = %connection_info.transport,
            ip = %connection_info.ip,
            shell_port = connection_info.shell_port,
            "Kernel running"
        );
    }

    /// Stops the kernel process, closes channels and runs provisioner
    /// cleanup. Cleanup runs even when stopping fails.
    async fn stop_kernel(
        &self,
        slot: &mut KernelSlot,
        now: bool,
        restart: bool,
    ) -> Result<(), Error> {
        let Some(provisioner) = slot.provisioner.as_deref_mut() else {
            return Ok(());
        };
        let kernel_id = self.kernel_id().unwrap_or_default();

        let mut exited = false;
        if let (false, Some(channels)) = (now, slot.channels.as_ref()) {
            match channels.request_shutdown(restart).await {
                Ok(()) if provisioner.owns_process() => {
                    match provisioner.wait(self.shutdown_wait_time).await {
                        Ok(status) => {
                            debug!(%kernel_id, ?status, "Kernel shut down gracefully");
                            exited = true;
                        }
                        Err(err) => {
                            warn!(
                                %kernel_id,
                                ?err,
                                "Kernel did not shut down gracefully, terminating"
                            );
                        }
                    }
                }
                Ok(()) => exited = true,
                Err(err) => {
                    warn!(%kernel_id, ?err, "Could not request kernel shutdown, terminating");
                }
            }
        }

        let mut result = Ok(());
        if !exited {
            if let Err(err) = provisioner.terminate(restart).await {
                warn!(%kernel_id, ?err, "Could not terminate kernel, killing it");
                result = provisioner
                    .kill(restart)
                    .await
                    .err_tip(|| "While killing kernel after a failed terminate");
            }
        }

        if let Some(channels) = slot.channels.take() {
            result = result.merge(
                channels
                    .close()
                    .await
                    .err_tip(|| "While closing kernel channels"),
            );
        }
        *self.connection_info.write() = None;

        let cleanup = provisioner
            .cleanup(restart)
            .await
            .err_tip(|| "In KernelProvisioner::cleanup");
        if let Err(err) = &cleanup {
            error!(%kernel_id, ?err, "Kernel cleanup failed");
        }
        result.merge(cleanup)
    }

    async fn signal_owned(slot: &mut KernelSlot, signal: Signal) -> Result<(), Error> {
        let provisioner = slot.provisioner.as_deref_mut().err_tip_with_code(|_| {
            (
                Code::FailedPrecondition,
                "Cannot signal the kernel. No kernel is running",
            )
        })?;
        if !provisioner.owns_process() {
            return Err(make_err!(
                Code::Unimplemented,
                "Cannot send {signal} to a kernel this process does not own"
            ));
        }
        provisioner.send_signal(signal).await
    }
}
