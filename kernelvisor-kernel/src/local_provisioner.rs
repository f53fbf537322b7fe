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

use core::time::Duration;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use kernelvisor_config::provisioners::LocalProvisionerSpec;
use kernelvisor_error::{Code, Error, ResultExt, make_err};
use kernelvisor_util::background_spawn;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use crate::channels::Channel;
use crate::connection_info::{ConnectionInfo, Transport};
use crate::kernel_spec::{ArgvTemplate, KernelSpec};
use crate::launch_args::LaunchArgs;
use crate::provisioner::{KernelProvisioner, ProvisionerContext, ProvisionerFactory};

/// How long `kill` waits to reap the kernel after `SIGKILL`.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct LocalProvisionerFactory {
    spec: LocalProvisionerSpec,
}

impl LocalProvisionerFactory {
    pub const fn new(spec: LocalProvisionerSpec) -> Self {
        Self { spec }
    }
}

impl ProvisionerFactory for LocalProvisionerFactory {
    fn create(
        &self,
        kernel_id: &str,
        kernel_spec: &KernelSpec,
        context: Arc<ProvisionerContext>,
    ) -> Result<Box<dyn KernelProvisioner>, Error> {
        Ok(Box::new(LocalProvisioner::new(
            kernel_id.to_string(),
            kernel_spec.clone(),
            self.spec.clone(),
            context,
        )))
    }
}

/// Spawns the kernel as a child process and allocates its ports on the
/// local host.
#[derive(Debug)]
pub struct LocalProvisioner {
    kernel_id: String,
    kernel_spec: KernelSpec,
    spec: LocalProvisionerSpec,
    context: Arc<ProvisionerContext>,
    connection_info: Option<ConnectionInfo>,
    connection_file: Option<PathBuf>,
    child: Option<Child>,
    pid: Option<Pid>,
    exit_status: Option<ExitStatus>,
}

impl LocalProvisioner {
    pub const fn new(
        kernel_id: String,
        kernel_spec: KernelSpec,
        spec: LocalProvisionerSpec,
        context: Arc<ProvisionerContext>,
    ) -> Self {
        Self {
            kernel_id,
            kernel_spec,
            spec,
            context,
            connection_info: None,
            connection_file: None,
            child: None,
            pid: None,
            exit_status: None,
        }
    }

    /// Path of the connection file written by the last `pre_launch`.
    pub fn connection_file(&self) -> Option<&Path> {
        self.connection_file.as_deref()
    }

    pub const fn pid(&self) -> Option<Pid> {
        self.pid
    }

    fn allocate_ports(&self) -> Result<ConnectionInfo, Error> {
        let mut info = self.context.new_connection_info();
        match info.transport {
            Transport::Tcp => {
                // Every listener stays bound until all ports are read so no
                // port is handed out twice.
                let listeners = Channel::ALL
                    .iter()
                    .map(|_| TcpListener::bind((info.ip.as_str(), 0)))
                    .collect::<Result<Vec<_>, _>>()
                    .err_tip(|| format!("Could not reserve ports on {}", info.ip))?;
                for (channel, listener) in Channel::ALL.iter().zip(&listeners) {
                    let port = listener
                        .local_addr()
                        .err_tip(|| "Could not read reserved port")?
                        .port();
                    info.set_port(*channel, port);
                }
            }
            Transport::Ipc => {
                let mut port: u16 = 1;
                for channel in Channel::ALL {
                    while Path::new(&format!("{}-{port}", info.ip)).exists() {
                        port = port.checked_add(1).err_tip_with_code(|_| {
                            (Code::ResourceExhausted, format!("No free ipc path for {}", info.ip))
                        })?;
                    }
                    info.set_port(channel, port);
                    port = port.saturating_add(1);
                }
            }
        }
        Ok(info)
    }
}

#[async_trait]
impl KernelProvisioner for LocalProvisioner {
    fn has_process(&self) -> bool {
        self.child.is_some()
    }

    fn owns_process(&self) -> bool {
        true
    }

    fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.connection_info.as_ref()
    }

    async fn poll(&mut self) -> Result<Option<ExitStatus>, Error> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        let child = self
            .child
            .as_mut()
            .err_tip_with_code(|_| (Code::FailedPrecondition, "Kernel has no process"))?;
        let status = child
            .try_wait()
            .err_tip(|| "Could not poll kernel process")?;
        self.exit_status = status;
        Ok(status)
    }

    async fn wait(&mut self, timeout: Duration) -> Result<ExitStatus, Error> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let child = self
            .child
            .as_mut()
            .err_tip_with_code(|_| (Code::FailedPrecondition, "Kernel has no process"))?;
        let wait_result = tokio::time::timeout(timeout, child.wait())
            .await
            .err_tip(|| format!("Kernel {} did not exit within {timeout:?}", self.kernel_id))?;
        let status = wait_result.err_tip(|| "Could not wait on kernel process")?;
        self.exit_status = Some(status);
        Ok(status)
    }

    async fn send_signal(&mut self, signal: Signal) -> Result<(), Error> {
        if self.exit_status.is_some() {
            debug!(kernel_id = %self.kernel_id, ?signal, "Kernel already exited, not signaling");
            return Ok(());
        }
        let pid = self
            .pid
            .err_tip_with_code(|_| (Code::FailedPrecondition, "Kernel has no process"))?;
        let result = if self.spec.process_group {
            killpg(pid, signal)
        } else {
            kill(pid, signal)
        };
        match result {
            // The process is gone but has not been reaped yet.
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(Error::from(errno)).err_tip(|| {
                format!("Could not send {signal:?} to kernel {}", self.kernel_id)
            }),
        }
    }

    async fn kill(&mut self, _restart: bool) -> Result<(), Error> {
        if self.child.is_none() || self.exit_status.is_some() {
            return Ok(());
        }
        self.send_signal(Signal::SIGKILL).await?;
        self.wait(KILL_REAP_TIMEOUT)
            .await
            .err_tip(|| "Kernel did not exit after SIGKILL")?;
        Ok(())
    }

    async fn terminate(&mut self, restart: bool) -> Result<(), Error> {
        if self.child.is_none() || self.exit_status.is_some() {
            return Ok(());
        }
        self.send_signal(Signal::SIGTERM).await?;
        match self.wait(self.spec.terminate_timeout).await {
            Ok(status) => {
                debug!(kernel_id = %self.kernel_id, ?status, "Kernel exited after SIGTERM");
                Ok(())
            }
            Err(err) if err.code == Code::DeadlineExceeded => {
                warn!(
                    kernel_id = %self.kernel_id,
                    timeout = ?self.spec.terminate_timeout,
                    "Kernel ignored SIGTERM, killing",
                );
                self.kill(restart).await
            }
            Err(err) => Err(err),
        }
    }

    async fn pre_launch(&mut self, mut args: LaunchArgs) -> Result<LaunchArgs, Error> {
        // Ports survive a restart cleanup, so a relaunch binds the same ones.
        let info = match self.connection_info.take() {
            Some(info) if info.is_complete() => info,
            _ => self.allocate_ports()?,
        };
        let path = self
            .context
            .write_connection_file(&self.kernel_id, &info, None)
            .await
            .err_tip(|| format!("In LocalProvisioner::pre_launch for {}", self.kernel_id))?;
        self.connection_info = Some(info);

        let template = if args.cmd.is_empty() {
            &self.kernel_spec.argv
        } else {
            &args.cmd
        };
        let mut cmd = ArgvTemplate::new(&path, &self.kernel_spec).format(template)?;
        cmd.extend(args.extra_arguments.iter().cloned());
        self.connection_file = Some(path);

        args.env.extend(
            self.kernel_spec
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        args.env
            .insert(self.spec.kernel_id_env.clone(), self.kernel_id.clone());
        args.cmd = cmd;
        Ok(args)
    }

    async fn launch(
        &mut self,
        cmd: Vec<String>,
        args: &LaunchArgs,
    ) -> Result<ConnectionInfo, Error> {
        let (program, arguments) = cmd
            .split_first()
            .err_tip_with_code(|_| (Code::InvalidArgument, "Kernel command line is empty"))?;
        let info = self.connection_info.clone().err_tip_with_code(|_| {
            (
                Code::FailedPrecondition,
                "LocalProvisioner::launch called before pre_launch",
            )
        })?;

        let mut command = Command::new(program);
        command
            .args(arguments)
            .envs(&args.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &args.cwd {
            command.current_dir(cwd);
        }
        if self.spec.process_group {
            command.process_group(0);
        }

        info!(kernel_id = %self.kernel_id, ?cmd, "Launching kernel");
        let child = command.spawn().err_tip_with_code(|_| {
            (Code::Unavailable, format!("Could not launch kernel {cmd:?}"))
        })?;
        let raw_pid = child.id().err_tip_with_code(|_| {
            (Code::Unavailable, "Kernel exited before its pid was read")
        })?;
        self.pid = Some(Pid::from_raw(i32::try_from(raw_pid)?));
        self.exit_status = None;
        self.child = Some(child);
        Ok(info)
    }

    async fn cleanup(&mut self, restart: bool) -> Result<(), Error> {
        if let Some(mut child) = self.child.take() {
            let result = if self.exit_status.is_some() {
                Ok(self.exit_status)
            } else {
                child.try_wait()
            };
            match result {
                Ok(Some(_)) => {}
                result => {
                    error!(
                        kernel_id = %self.kernel_id,
                        ?result,
                        "Kernel still running at cleanup, killing it in the background",
                    );
                    if let (true, Some(pid)) = (self.spec.process_group, self.pid) {
                        if let Err(errno) = killpg(pid, Signal::SIGKILL) {
                            debug!(?errno, "Could not kill kernel process group");
                        }
                    }
                    background_spawn!("local_provisioner_kill_kernel", async move {
                        child.kill().await
                    });
                }
            }
        }
        self.pid = None;
        self.exit_status = None;

        if restart {
            return Ok(());
        }
        self.connection_info = None;
        if let Some(path) = self.connection_file.take() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed connection file"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(make_err!(
                        Code::from(err.kind()),
                        "Could not remove connection file {}: {err}",
                        path.display()
                    ));
                }
            }
        }
        Ok(())
    }
}
