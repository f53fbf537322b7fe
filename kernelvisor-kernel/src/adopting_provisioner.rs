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
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use kernelvisor_config::provisioners::AdoptingProvisionerSpec;
use kernelvisor_error::{Code, Error, ResultExt, error_if, make_err};
use nix::sys::signal::Signal;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::connection_info::{ConnectionInfo, Transport, port_serde};
use crate::kernel_spec::KernelSpec;
use crate::launch_args::LaunchArgs;
use crate::provisioner::{KernelProvisioner, ProvisionerContext, ProvisionerFactory};

#[derive(Debug)]
pub struct AdoptingProvisionerFactory {
    spec: AdoptingProvisionerSpec,
}

impl AdoptingProvisionerFactory {
    pub const fn new(spec: AdoptingProvisionerSpec) -> Self {
        Self { spec }
    }
}

impl ProvisionerFactory for AdoptingProvisionerFactory {
    fn create(
        &self,
        kernel_id: &str,
        _kernel_spec: &KernelSpec,
        context: Arc<ProvisionerContext>,
    ) -> Result<Box<dyn KernelProvisioner>, Error> {
        Ok(Box::new(AdoptingProvisioner::new(
            kernel_id.to_string(),
            self.spec.clone(),
            context,
        )))
    }
}

/// Connection parameters announced by whoever launched the kernel. The
/// shell port is announced separately.
#[derive(Deserialize, Debug)]
struct AnnouncedConnection {
    transport: Transport,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default, with = "port_serde")]
    iopub_port: Option<u16>,
    #[serde(default, with = "port_serde")]
    stdin_port: Option<u16>,
    #[serde(default, with = "port_serde")]
    hb_port: Option<u16>,
    #[serde(default, with = "port_serde")]
    control_port: Option<u16>,
}

/// Adopts a kernel that already runs somewhere else. Nothing is spawned;
/// the connection parameters come from the launch environment.
///
/// The process is not observable from here: `poll` always reports the
/// kernel as running and the process control operations do nothing.
#[derive(Debug)]
pub struct AdoptingProvisioner {
    kernel_id: String,
    spec: AdoptingProvisionerSpec,
    context: Arc<ProvisionerContext>,
    connection_info: Option<ConnectionInfo>,
    connection_file: Option<PathBuf>,
    launched: bool,
}

impl AdoptingProvisioner {
    pub const fn new(
        kernel_id: String,
        spec: AdoptingProvisionerSpec,
        context: Arc<ProvisionerContext>,
    ) -> Self {
        Self {
            kernel_id,
            spec,
            context,
            connection_info: None,
            connection_file: None,
            launched: false,
        }
    }

    pub fn connection_file(&self) -> Option<&Path> {
        self.connection_file.as_deref()
    }

    fn resolve_connection_info(&self, args: &LaunchArgs) -> Result<ConnectionInfo, Error> {
        let info_env = &self.spec.connection_info_env;
        let blob = args.env.get(info_env).err_tip_with_code(|_| {
            (
                Code::InvalidArgument,
                format!("Missing {info_env} in launch environment"),
            )
        })?;
        let announced: AnnouncedConnection = serde_json::from_str(blob)
            .err_tip_with_code(|_| (Code::InvalidArgument, format!("Malformed {info_env}")))?;

        let port_env = &self.spec.shell_port_env;
        let raw_shell_port = args.env.get(port_env).err_tip_with_code(|_| {
            (
                Code::InvalidArgument,
                format!("Missing {port_env} in launch environment"),
            )
        })?;
        let shell_port = raw_shell_port
            .trim()
            .parse::<u16>()
            .err_tip(|| format!("Malformed {port_env} {raw_shell_port:?}"))?;
        error_if!(shell_port == 0, "{port_env} must not be 0");

        let mut info = self.context.new_connection_info();
        info.transport = announced.transport;
        if let Some(ip) = announced.ip {
            info.ip = ip;
        }
        info.shell_port = Some(shell_port);
        info.iopub_port = announced.iopub_port;
        info.stdin_port = announced.stdin_port;
        info.hb_port = announced.hb_port;
        info.control_port = announced.control_port;
        info.ensure_complete()
            .err_tip(|| format!("In {info_env}"))?;
        Ok(info)
    }

    async fn remove_connection_file(&mut self) -> Result<(), Error> {
        let Some(path) = self.connection_file.take() else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed connection file");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(make_err!(
                Code::from(err.kind()),
                "Could not remove connection file {}: {err}",
                path.display()
            )),
        }
    }
}

#[async_trait]
impl KernelProvisioner for AdoptingProvisioner {
    fn has_process(&self) -> bool {
        self.launched
    }

    fn owns_process(&self) -> bool {
        false
    }

    fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.connection_info.as_ref()
    }

    async fn poll(&mut self) -> Result<Option<ExitStatus>, Error> {
        Ok(None)
    }

    async fn wait(&mut self, timeout: Duration) -> Result<ExitStatus, Error> {
        tokio::time::sleep(timeout).await;
        Err(make_err!(
            Code::DeadlineExceeded,
            "Exit of adopted kernel {} cannot be observed",
            self.kernel_id
        ))
    }

    async fn send_signal(&mut self, signal: Signal) -> Result<(), Error> {
        debug!(kernel_id = %self.kernel_id, ?signal, "Ignoring signal for adopted kernel");
        Ok(())
    }

    async fn kill(&mut self, _restart: bool) -> Result<(), Error> {
        debug!(kernel_id = %self.kernel_id, "Ignoring kill for adopted kernel");
        Ok(())
    }

    async fn terminate(&mut self, _restart: bool) -> Result<(), Error> {
        debug!(kernel_id = %self.kernel_id, "Ignoring terminate for adopted kernel");
        Ok(())
    }

    async fn pre_launch(&mut self, mut args: LaunchArgs) -> Result<LaunchArgs, Error> {
        let info = self
            .resolve_connection_info(&args)
            .err_tip(|| format!("In AdoptingProvisioner::pre_launch for {}", self.kernel_id))?;
        let session = args
            .env
            .get(&self.spec.session_name_env)
            .map(String::as_str);
        let path = self
            .context
            .write_connection_file(&self.kernel_id, &info, session)
            .await?;
        if self.connection_file.as_ref().is_some_and(|old| *old != path) {
            if let Err(err) = self.remove_connection_file().await {
                warn!(?err, "Could not remove stale connection file");
            }
        }
        self.connection_file = Some(path);
        self.connection_info = Some(info);
        args.cmd = Vec::new();
        Ok(args)
    }

    async fn launch(
        &mut self,
        _cmd: Vec<String>,
        _args: &LaunchArgs,
    ) -> Result<ConnectionInfo, Error> {
        let info = self.connection_info.clone().err_tip_with_code(|_| {
            (
                Code::FailedPrecondition,
                "AdoptingProvisioner::launch called before pre_launch",
            )
        })?;
        info!(
            kernel_id = %self.kernel_id,
            transport = %info.transport,
            ip = %info.ip,
            shell_port = ?info.shell_port,
            "Adopted kernel",
        );
        self.launched = true;
        Ok(info)
    }

    async fn cleanup(&mut self, restart: bool) -> Result<(), Error> {
        self.launched = false;
        if restart {
            return Ok(());
        }
        self.connection_info = None;
        self.remove_connection_file().await
    }
}
