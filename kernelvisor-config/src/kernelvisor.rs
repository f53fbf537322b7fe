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

use core::fmt;
use core::time::Duration;

use kernelvisor_error::{Error, ResultExt};
use serde::{Deserialize, Serialize};

use crate::kernel_spec::KernelSpec;
use crate::provisioners::ProvisionerSpec;
use crate::serde_utils::{
    convert_duration_with_shellexpand, convert_numeric_with_shellexpand,
    convert_optional_string_with_shellexpand, convert_string_with_shellexpand,
};

/// Transport the kernel's channels are bound on.
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    #[default]
    Tcp,
    Ipc,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Ipc => f.write_str("ipc"),
        }
    }
}

/// Defaults used when a provisioner resolves a fresh `ConnectionInfo`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Address the kernel binds to. For `ipc` this is the socket path
    /// prefix.
    ///
    /// Default: "127.0.0.1"
    #[serde(default = "default_ip", deserialize_with = "convert_string_with_shellexpand")]
    pub ip: String,

    /// Default: `Transport::Tcp`
    #[serde(default)]
    pub transport: Transport,

    /// Directory connection files are written to.
    ///
    /// Default: the system temporary directory
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub connection_dir: Option<String>,

    /// Default: "hmac-sha256"
    #[serde(
        default = "default_signature_scheme",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub signature_scheme: String,

    /// Signing key shared with the kernel. A random key is generated when
    /// unset.
    ///
    /// Default: None
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub key: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            transport: Transport::default(),
            connection_dir: None,
            signature_scheme: default_signature_scheme(),
            key: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RestarterConfig {
    /// Whether the restarter is started together with the kernel.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub autorestart: bool,

    /// How often kernel liveness is polled.
    ///
    /// Default: 3s
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "convert_duration_with_shellexpand"
    )]
    pub poll_interval: Duration,

    /// Maximum number of restarts allowed inside `restart_window`. One
    /// more failure inside the window is fatal.
    ///
    /// Default: 5
    #[serde(
        default = "default_max_restarts",
        deserialize_with = "convert_numeric_with_shellexpand"
    )]
    pub max_restarts: usize,

    /// Length of the sliding window restarts are counted in.
    ///
    /// Default: 60s
    #[serde(
        default = "default_restart_window",
        deserialize_with = "convert_duration_with_shellexpand"
    )]
    pub restart_window: Duration,

    /// Once the kernel stays alive this long after a restart, the restart
    /// history is cleared. Zero disables the reset.
    ///
    /// Default: 10s
    #[serde(
        default = "default_stable_period",
        deserialize_with = "convert_duration_with_shellexpand"
    )]
    pub stable_period: Duration,
}

impl Default for RestarterConfig {
    fn default() -> Self {
        Self {
            autorestart: true,
            poll_interval: default_poll_interval(),
            max_restarts: default_max_restarts(),
            restart_window: default_restart_window(),
            stable_period: default_stable_period(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KernelvisorConfig {
    /// What to launch.
    pub kernel: KernelSpec,

    /// How the kernel process is obtained.
    ///
    /// Default: `ProvisionerSpec::Local`
    #[serde(default)]
    pub provisioner: ProvisionerSpec,

    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub restarter: RestarterConfig,

    /// Time a graceful shutdown waits for the kernel to exit on its own
    /// before it is terminated.
    ///
    /// Default: 5s
    #[serde(
        default = "default_shutdown_wait_time",
        deserialize_with = "convert_duration_with_shellexpand"
    )]
    pub shutdown_wait_time: Duration,
}

impl KernelvisorConfig {
    /// # Errors
    ///
    /// Will return `Err` if we can't load the file.
    pub fn try_from_json5_file(config_file: &str) -> Result<Self, Error> {
        let json_contents = std::fs::read_to_string(config_file)
            .err_tip(|| format!("Could not open config file {config_file}"))?;
        Ok(serde_json5::from_str(&json_contents)?)
    }
}

fn default_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_signature_scheme() -> String {
    "hmac-sha256".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_poll_interval() -> Duration {
    Duration::from_secs(3)
}

const fn default_max_restarts() -> usize {
    5
}

const fn default_restart_window() -> Duration {
    Duration::from_secs(60)
}

const fn default_stable_period() -> Duration {
    Duration::from_secs(10)
}

const fn default_shutdown_wait_time() -> Duration {
    Duration::from_secs(5)
}
