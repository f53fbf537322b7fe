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

use std::path::{Path, PathBuf};

pub use kernelvisor_config::kernel_spec::{InterruptMode, KernelSpec};
use kernelvisor_error::{Error, make_input_err};

/// Values substituted into a kernel command line.
#[derive(Debug, Clone, Default)]
pub struct ArgvTemplate {
    pub connection_file: Option<PathBuf>,
    pub prefix: Option<PathBuf>,
    pub resource_dir: Option<PathBuf>,
}

impl ArgvTemplate {
    pub fn new(connection_file: &Path, kernel_spec: &KernelSpec) -> Self {
        Self {
            connection_file: Some(connection_file.to_path_buf()),
            prefix: install_prefix(),
            resource_dir: kernel_spec.resource_dir.as_ref().map(PathBuf::from),
        }
    }

    /// Replaces `{connection_file}`, `{prefix}` and `{resource_dir}` in
    /// every argument. Placeholders without a value are left as they are.
    pub fn format(&self, argv: &[String]) -> Result<Vec<String>, Error> {
        if argv.is_empty() {
            return Err(make_input_err!("Kernel command line is empty"));
        }
        let substitutions = [
            ("{connection_file}", self.connection_file.as_deref()),
            ("{prefix}", self.prefix.as_deref()),
            ("{resource_dir}", self.resource_dir.as_deref()),
        ];
        Ok(argv
            .iter()
            .map(|arg| {
                substitutions
                    .iter()
                    .fold(arg.clone(), |arg, (placeholder, value)| match value {
                        Some(value) if arg.contains(placeholder) => {
                            arg.replace(placeholder, &value.to_string_lossy())
                        }
                        _ => arg,
                    })
            })
            .collect())
    }
}

/// Installation prefix of the running binary, i.e. the parent of its `bin`
/// directory.
fn install_prefix() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    exe.parent()?.parent().map(Path::to_path_buf)
}
