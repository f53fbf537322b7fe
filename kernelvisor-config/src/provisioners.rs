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

use serde::{Deserialize, Serialize};

use crate::serde_utils::{convert_duration_with_shellexpand, convert_string_with_shellexpand};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionerSpec {
    /// Spawns the kernel as a child process of this process and allocates
    /// its ports locally.
    Local(LocalProvisionerSpec),

    /// Adopts a kernel that was launched by someone else. Connection
    /// parameters are read from environment variables of the launch
    /// arguments.
    Adopting(AdoptingProvisionerSpec),
}

impl Default for ProvisionerSpec {
    fn default() -> Self {
        Self::Local(LocalProvisionerSpec::default())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LocalProvisionerSpec {
    /// Name of the environment variable that carries the kernel id into
    /// the spawned process.
    ///
    /// Default: "KERNEL_ID"
    #[serde(
        default = "default_kernel_id_env",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub kernel_id_env: String,

    /// Start the kernel in its own process group so signals reach every
    /// process it forks.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub process_group: bool,

    /// How long `terminate` waits for the kernel to exit after `SIGTERM`
    /// before escalating to `SIGKILL`.
    ///
    /// Default: 5s
    #[serde(
        default = "default_terminate_timeout",
        deserialize_with = "convert_duration_with_shellexpand"
    )]
    pub terminate_timeout: Duration,
}

impl Default for LocalProvisionerSpec {
    fn default() -> Self {
        Self {
            kernel_id_env: default_kernel_id_env(),
            process_group: true,
            terminate_timeout: default_terminate_timeout(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AdoptingProvisionerSpec {
    /// Environment variable holding a JSON object with `transport`, `ip`,
    /// `iopub_port`, `stdin_port`, `hb_port` and `control_port`.
    ///
    /// Default: "KERNEL_CONNECTION_INFO"
    #[serde(
        default = "default_connection_info_env",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub connection_info_env: String,

    /// Environment variable holding the externally assigned shell port.
    /// The value is a string and is coerced to an integer.
    ///
    /// Default: "KERNEL_SHELL_PORT"
    #[serde(
        default = "default_shell_port_env",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub shell_port_env: String,

    /// Environment variable whose value is appended to the connection file
    /// name, when present.
    ///
    /// Default: "JPY_SESSION_NAME"
    #[serde(
        default = "default_session_name_env",
        deserialize_with = "convert_string_with_shellexpand"
    )]
    pub session_name_env: String,
}

impl Default for AdoptingProvisionerSpec {
    fn default() -> Self {
        Self {
            connection_info_env: default_connection_info_env(),
            shell_port_env: default_shell_port_env(),
            session_name_env: default_session_name_env(),
        }
    }
}

fn default_kernel_id_env() -> String {
    "KERNEL_ID".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_terminate_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connection_info_env() -> String {
    "KERNEL_CONNECTION_INFO".to_string()
}

fn default_shell_port_env() -> String {
    "KERNEL_SHELL_PORT".to_string()
}

fn default_session_name_env() -> String {
    "JPY_SESSION_NAME".to_string()
}
