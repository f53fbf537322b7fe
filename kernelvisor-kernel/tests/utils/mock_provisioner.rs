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

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use core::time::Duration;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use kernelvisor_config::kernelvisor::RestarterConfig;
use kernelvisor_error::{Code, Error, make_err};
use kernelvisor_kernel::channels::{Channel, ChannelFactory, KernelChannels};
use kernelvisor_kernel::connection_info::{ConnectionInfo, Transport};
use kernelvisor_kernel::kernel_manager::{KernelManager, KernelManagerArgs};
use kernelvisor_kernel::kernel_spec::{InterruptMode, KernelSpec};
use kernelvisor_kernel::launch_args::LaunchArgs;
use kernelvisor_kernel::provisioner::{KernelProvisioner, ProvisionerContext, ProvisionerFactory};
use kernelvisor_kernel::restarter::Callbacks;
use nix::sys::signal::Signal;
use parking_lot::Mutex;

pub(crate) const FIRST_PORT: u16 = 40_000;

/// Everything the mock provisioner and mock channels observed. Shared
/// between the test and every provisioner the factory creates.
#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub(crate) alive: AtomicBool,
    pub(crate) die_on_launch: AtomicBool,
    pub(crate) fail_launch: AtomicBool,
    pub(crate) launch_delay: Mutex<Duration>,
    pub(crate) poll_delay: Mutex<Duration>,
    pub(crate) launches: AtomicUsize,
    pub(crate) terminates: AtomicUsize,
    pub(crate) kills: AtomicUsize,
    pub(crate) kernel_ids: Mutex<Vec<String>>,
    pub(crate) cleanups: Mutex<Vec<bool>>,
    pub(crate) signals: Mutex<Vec<Signal>>,
    pub(crate) shutdown_requests: Mutex<Vec<bool>>,
    pub(crate) interrupt_requests: AtomicUsize,
    pub(crate) channels_closed: AtomicUsize,
}

impl MockState {
    pub(crate) fn launches(&self) -> usize {
        self.launches.load(Ordering::Acquire)
    }

    pub(crate) fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }
}

#[derive(Debug)]
pub(crate) struct MockProvisioner {
    kernel_id: String,
    owns_process: bool,
    context: Arc<ProvisionerContext>,
    state: Arc<MockState>,
    connection_info: Option<ConnectionInfo>,
    launched: bool,
}

impl MockProvisioner {
    fn exit_status(&self) -> Option<ExitStatus> {
        if self.state.alive.load(Ordering::Acquire) {
            None
        } else {
            Some(ExitStatus::from_raw(0))
        }
    }
}

#[async_trait]
impl KernelProvisioner for MockProvisioner {
    fn has_process(&self) -> bool {
        self.launched
    }

    fn owns_process(&self) -> bool {
        self.owns_process
    }

    fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.connection_info.as_ref()
    }

    async fn poll(&mut self) -> Result<Option<ExitStatus>, Error> {
        let delay = *self.state.poll_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self.exit_status())
    }

    async fn wait(&mut self, timeout: Duration) -> Result<ExitStatus, Error> {
        if let Some(status) = self.exit_status() {
            return Ok(status);
        }
        tokio::time::sleep(timeout).await;
        self.exit_status()
            .ok_or_else(|| make_err!(Code::DeadlineExceeded, "Mock kernel still running"))
    }

    async fn send_signal(&mut self, signal: Signal) -> Result<(), Error> {
        self.state.signals.lock().push(signal);
        Ok(())
    }

    async fn kill(&mut self, _restart: bool) -> Result<(), Error> {
        self.state.kills.fetch_add(1, Ordering::AcqRel);
        self.state.set_alive(false);
        Ok(())
    }

    async fn terminate(&mut self, _restart: bool) -> Result<(), Error> {
        self.state.terminates.fetch_add(1, Ordering::AcqRel);
        self.state.set_alive(false);
        Ok(())
    }

    async fn pre_launch(&mut self, args: LaunchArgs) -> Result<LaunchArgs, Error> {
        let mut info = self.context.new_connection_info();
        for (offset, channel) in (0..).zip(Channel::ALL) {
            info.set_port(channel, FIRST_PORT + offset);
        }
        self.connection_info = Some(info);
        Ok(args)
    }

    async fn launch(
        &mut self,
        _cmd: Vec<String>,
        _args: &LaunchArgs,
    ) -> Result<ConnectionInfo, Error> {
        self.state.launches.fetch_add(1, Ordering::AcqRel);
        self.state.kernel_ids.lock().push(self.kernel_id.clone());
        let delay = *self.state.launch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_launch.load(Ordering::Acquire) {
            return Err(make_err!(Code::Unavailable, "Mock launch failed"));
        }
        self.state
            .set_alive(!self.state.die_on_launch.load(Ordering::Acquire));
        self.launched = true;
        self.connection_info
            .clone()
            .ok_or_else(|| make_err!(Code::FailedPrecondition, "launch before pre_launch"))
    }

    async fn cleanup(&mut self, restart: bool) -> Result<(), Error> {
        self.state.cleanups.lock().push(restart);
        self.launched = false;
        if !restart {
            self.connection_info = None;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct MockProvisionerFactory {
    pub(crate) state: Arc<MockState>,
    pub(crate) owns_process: bool,
}

impl ProvisionerFactory for MockProvisionerFactory {
    fn create(
        &self,
        kernel_id: &str,
        _kernel_spec: &KernelSpec,
        context: Arc<ProvisionerContext>,
    ) -> Result<Box<dyn KernelProvisioner>, Error> {
        Ok(Box::new(MockProvisioner {
            kernel_id: kernel_id.to_string(),
            owns_process: self.owns_process,
            context,
            state: self.state.clone(),
            connection_info: None,
            launched: false,
        }))
    }
}

/// Channels that stop the mock kernel when asked to shut down.
#[derive(Debug)]
pub(crate) struct MockChannels {
    state: Arc<MockState>,
}

#[async_trait]
impl KernelChannels for MockChannels {
    async fn request_shutdown(&self, restart: bool) -> Result<(), Error> {
        self.state.shutdown_requests.lock().push(restart);
        self.state.set_alive(false);
        Ok(())
    }

    async fn request_interrupt(&self) -> Result<(), Error> {
        self.state.interrupt_requests.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.state.channels_closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct MockChannelFactory {
    pub(crate) state: Arc<MockState>,
}

#[async_trait]
impl ChannelFactory for MockChannelFactory {
    async fn connect(
        &self,
        _connection_info: &ConnectionInfo,
    ) -> Result<Box<dyn KernelChannels>, Error> {
        Ok(Box::new(MockChannels {
            state: self.state.clone(),
        }))
    }
}

pub(crate) fn test_context() -> ProvisionerContext {
    ProvisionerContext {
        connection_dir: std::env::temp_dir(),
        ip: "127.0.0.1".to_string(),
        transport: Transport::Tcp,
        signature_scheme: "hmac-sha256".to_string(),
        key: "secret".to_string(),
    }
}

/// Options of a manager backed by `MockProvisioner`.
#[derive(Debug)]
pub(crate) struct MockManagerOptions {
    pub(crate) owns_process: bool,
    pub(crate) with_channels: bool,
    pub(crate) interrupt_mode: InterruptMode,
    pub(crate) restarter: RestarterConfig,
    pub(crate) callbacks: Callbacks,
}

impl Default for MockManagerOptions {
    fn default() -> Self {
        Self {
            owns_process: true,
            with_channels: false,
            interrupt_mode: InterruptMode::Signal,
            restarter: RestarterConfig {
                autorestart: false,
                ..RestarterConfig::default()
            },
            callbacks: Callbacks {
                now_fn: std::time::SystemTime::now,
                sleep_fn: |_duration| Box::pin(futures::future::pending()),
            },
        }
    }
}

pub(crate) fn make_manager(
    state: &Arc<MockState>,
    options: MockManagerOptions,
) -> Arc<KernelManager> {
    let channel_factory: Option<Arc<dyn ChannelFactory>> = if options.with_channels {
        Some(Arc::new(MockChannelFactory {
            state: state.clone(),
        }))
    } else {
        None
    };
    KernelManager::new_with_callbacks(
        KernelManagerArgs {
            kernel_spec: KernelSpec {
                argv: vec!["mock-kernel".to_string()],
                interrupt_mode: options.interrupt_mode,
                ..KernelSpec::default()
            },
            context: test_context(),
            provisioner_factory: Arc::new(MockProvisionerFactory {
                state: state.clone(),
                owns_process: options.owns_process,
            }),
            channel_factory,
            shutdown_wait_time: Duration::from_secs(1),
            restarter: options.restarter,
        },
        options.callbacks,
    )
}
