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

use async_trait::async_trait;
use kernelvisor_error::Error;

use crate::connection_info::ConnectionInfo;

/// The five channels a kernel exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Shell,
    IoPub,
    Stdin,
    Control,
    Heartbeat,
}

impl Channel {
    pub const ALL: [Self; 5] = [
        Self::Shell,
        Self::IoPub,
        Self::Stdin,
        Self::Control,
        Self::Heartbeat,
    ];

    /// Name of the channel's port field in a connection file.
    pub const fn port_field(self) -> &'static str {
        match self {
            Self::Shell => "shell_port",
            Self::IoPub => "iopub_port",
            Self::Stdin => "stdin_port",
            Self::Control => "control_port",
            Self::Heartbeat => "hb_port",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Shell => "shell",
            Self::IoPub => "iopub",
            Self::Stdin => "stdin",
            Self::Control => "control",
            Self::Heartbeat => "hb",
        };
        f.write_str(name)
    }
}

/// Open channels to a running kernel. The message protocol lives behind
/// this trait.
#[async_trait]
pub trait KernelChannels: Send + Sync + Debug {
    /// Ask the kernel to shut itself down over the control channel.
    async fn request_shutdown(&self, restart: bool) -> Result<(), Error>;

    /// Ask the kernel to interrupt its current execution over the control
    /// channel.
    async fn request_interrupt(&self) -> Result<(), Error>;

    async fn close(&self) -> Result<(), Error>;
}

/// Opens channels once a kernel's `ConnectionInfo` is final.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn connect(&self, connection_info: &ConnectionInfo)
    -> Result<Box<dyn KernelChannels>, Error>;
}
