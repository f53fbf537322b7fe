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

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::serde_utils::{
    convert_optional_string_with_shellexpand, convert_string_map_with_shellexpand,
    convert_vec_string_with_shellexpand,
};

/// How an interrupt request is delivered to the kernel.
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InterruptMode {
    /// Send `SIGINT` to the kernel through the provisioner.
    #[default]
    Signal,

    /// Send an interrupt request over the control channel.
    Message,
}

/// Immutable descriptor of what to launch.
#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KernelSpec {
    /// Command line used to start the kernel. The placeholders
    /// `{connection_file}`, `{prefix}` and `{resource_dir}` are
    /// substituted at launch time.
    ///
    /// Example: `["python3", "-m", "ipykernel_launcher", "-f", "{connection_file}"]`
    #[serde(default, deserialize_with = "convert_vec_string_with_shellexpand")]
    pub argv: Vec<String>,

    /// Human readable name of the kernel.
    ///
    /// Default: ""
    #[serde(default)]
    pub display_name: String,

    /// Language the kernel executes.
    ///
    /// Default: ""
    #[serde(default)]
    pub language: String,

    /// Environment variables overlaid on the launch environment of the
    /// kernel. Values are shell-expanded.
    #[serde(default, deserialize_with = "convert_string_map_with_shellexpand")]
    pub env: HashMap<String, String>,

    /// Default: `InterruptMode::Signal`
    #[serde(default)]
    pub interrupt_mode: InterruptMode,

    /// Directory holding the kernel's resources. Substituted for
    /// `{resource_dir}` in `argv`.
    ///
    /// Default: None
    #[serde(default, deserialize_with = "convert_optional_string_with_shellexpand")]
    pub resource_dir: Option<String>,
}
