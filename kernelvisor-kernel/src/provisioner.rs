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

use core::fmt::Debug;
use core::time::Duration;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use kernelvisor_config::kernelvisor::ConnectionConfig;
use kernelvisor_config::provisioners::ProvisionerSpec;
use kernelvisor_error::{Error, ResultExt};
use nix::sys::signal::Signal;
use tracing::debug;
use uuid::Uuid;

use crate::adopting_provisioner::AdoptingProvisionerFactory;
use crate::connection_info::{ConnectionInfo, Transport};
use crate::kernel_spec::KernelSpec;
use crate::launch_args::LaunchArgs;
use crate::local_provisioner::LocalProvisionerFactory;

/// Strategy that obtains and controls the kernel process on behalf of a
/// `KernelManager`.
///
/// A provisioner goes through `pre_launch` -> `launch` -> (exit) ->
/// `cleanup`. `cleanup(true)` keeps whatever a relaunch on the same
/// provisioner needs.
#[async_trait]
pub trait KernelProvisioner: Send + Sync + Debug {
    /// True once `launch` returned successfully and `cleanup` has not run
    /// since.
    fn has_process(&self) -> bool;

    /// Whether the kernel process is controlled by this provisioner. When
    /// false, signals cannot be delivered and exits cannot be observed.
    fn owns_process(&self) -> bool;

    /// Connection parameters resolved by the last `pre_launch`.
    fn connection_info(&self) -> Option<&ConnectionInfo>;

    /// Non blocking. `None` means the kernel is still running.
    async fn poll(&mut self) -> Result<Option<ExitStatus>, Error>;

    /// Waits for the kernel to exit. Fails with `DeadlineExceeded` once
    /// `timeout` passes.
    async fn wait(&mut self, timeout: Duration) -> Result<ExitStatus, Error>;

    async fn send_signal(&mut self, signal: Signal) -> Result<(), Error>;

    async fn kill(&mut self, restart: bool) -> Result<(), Error>;

    async fn terminate(&mut self, restart: bool) -> Result<(), Error>;

    /// Resolves the connection parameters and returns the arguments to
    /// launch with. `cmd` of the result holds the command to run.
    async fn pre_launch(&mut self, args: LaunchArgs) -> Result<LaunchArgs, Error>;

    /// Starts (or adopts) the kernel and returns its final connection
    /// parameters.
    async fn launch(&mut self, cmd: Vec<String>, args: &LaunchArgs)
    -> Result<ConnectionInfo, Error>;

    async fn cleanup(&mut self, restart: bool) -> Result<(), Error>;
}

/// The part of the manager a provisioner may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerContext {
    pub connection_dir: PathBuf,
    pub ip: String,
    pub transport: Transport,
    pub signature_scheme: String,
    pub key: String,
}

impl ProvisionerContext {
    /// Builds a context from configuration, generating a signing key when
    /// none is configured.
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            connection_dir: config
                .connection_dir
                .as_ref()
                .map_or_else(std::env::temp_dir, PathBuf::from),
            ip: config.ip.clone(),
            transport: config.transport,
            signature_scheme: config.signature_scheme.clone(),
            key: config
                .key
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        }
    }

    /// A `ConnectionInfo` carrying the defaults of this context and no
    /// ports.
    pub fn new_connection_info(&self) -> ConnectionInfo {
        ConnectionInfo::new(
            self.transport,
            self.ip.clone(),
            self.signature_scheme.clone(),
            self.key.clone(),
        )
    }

    /// `kernel-{kernel_id}.json`, or `kernel-{kernel_id}-{session}.json`
    /// when a session name is given.
    pub fn connection_file_path(&self, kernel_id: &str, session: Option<&str>) -> PathBuf {
        let file_name = match session.filter(|session| !session.is_empty()) {
            Some(session) => format!("kernel-{kernel_id}-{}.json", session.replace('/', "_")),
            None => format!("kernel-{kernel_id}.json"),
        };
        self.connection_dir.join(file_name)
    }

    /// Persists `info` and returns the path it was written to.
    pub async fn write_connection_file(
        &self,
        kernel_id: &str,
        info: &ConnectionInfo,
        session: Option<&str>,
    ) -> Result<PathBuf, Error> {
        tokio::fs::create_dir_all(&self.connection_dir)
            .await
            .err_tip(|| {
                format!(
                    "Could not create connection directory {}",
                    self.connection_dir.display()
                )
            })?;
        let path = self.connection_file_path(kernel_id, session);
        info.write_to_file(&path).await?;
        debug!(kernel_id, path = %path.display(), "Wrote connection file");
        Ok(path)
    }
}

/// Creates the provisioner for a fresh kernel start.
pub trait ProvisionerFactory: Send + Sync {
    fn create(
        &self,
        kernel_id: &str,
        kernel_spec: &KernelSpec,
        context: Arc<ProvisionerContext>,
    ) -> Result<Box<dyn KernelProvisioner>, Error>;
}

/// Returns the factory for the provisioner variant `spec` describes.
pub fn provisioner_factory(spec: &ProvisionerSpec) -> Arc<dyn ProvisionerFactory> {
    match spec {
        ProvisionerSpec::Local(spec) => Arc::new(LocalProvisionerFactory::new(spec.clone())),
        ProvisionerSpec::Adopting(spec) => Arc::new(AdoptingProvisionerFactory::new(spec.clone())),
    }
}
