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
use std::path::PathBuf;

use serde_json::Value;

/// Parameters a kernel is launched with. The manager keeps its own copy of
/// the arguments given to the first start and replays them verbatim on
/// every restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchArgs {
    /// Resolved command line. Filled in by `KernelProvisioner::pre_launch`;
    /// a non-empty value given by the caller replaces the kernel spec's
    /// `argv` as the template.
    pub cmd: Vec<String>,

    /// Environment of the launch. For adopted kernels this carries the
    /// out-of-band connection parameters.
    pub env: HashMap<String, String>,

    /// Working directory of the kernel process.
    pub cwd: Option<PathBuf>,

    /// Kernel id to use when the manager has not assigned one yet.
    pub kernel_id: Option<String>,

    /// Appended to the resolved command line.
    pub extra_arguments: Vec<String>,

    /// Any other launch parameter.
    pub extra: HashMap<String, Value>,
}

impl LaunchArgs {
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_kernel_id(mut self, kernel_id: impl Into<String>) -> Self {
        self.kernel_id = Some(kernel_id.into());
        self
    }

    #[must_use]
    pub fn with_extra_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_arguments
            .extend(arguments.into_iter().map(Into::into));
        self
    }

    /// Launch arguments inheriting the environment of this process.
    pub fn from_current_env() -> Self {
        Self {
            env: std::env::vars().collect(),
            ..Self::default()
        }
    }
}
