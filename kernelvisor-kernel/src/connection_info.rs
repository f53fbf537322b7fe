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

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use kernelvisor_error::{Code, Error, ResultExt, make_input_err};
pub use kernelvisor_config::kernelvisor::Transport;
use serde::{Deserialize, Serialize};

use crate::channels::Channel;

/// Everything needed to reach a running kernel. Ports are `None` until a
/// provisioner assigns them and must not change once the kernel is alive.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub transport: Transport,
    pub ip: String,
    #[serde(default, with = "port_serde")]
    pub shell_port: Option<u16>,
    #[serde(default, with = "port_serde")]
    pub iopub_port: Option<u16>,
    #[serde(default, with = "port_serde")]
    pub stdin_port: Option<u16>,
    #[serde(default, with = "port_serde")]
    pub control_port: Option<u16>,
    #[serde(default, with = "port_serde")]
    pub hb_port: Option<u16>,
    pub signature_scheme: String,
    /// Opaque signing key shared with the kernel.
    pub key: String,
}

impl ConnectionInfo {
    /// Creates a `ConnectionInfo` with every port unassigned.
    pub const fn new(
        transport: Transport,
        ip: String,
        signature_scheme: String,
        key: String,
    ) -> Self {
        Self {
            transport,
            ip,
            shell_port: None,
            iopub_port: None,
            stdin_port: None,
            control_port: None,
            hb_port: None,
            signature_scheme,
            key,
        }
    }

    pub const fn port(&self, channel: Channel) -> Option<u16> {
        match channel {
            Channel::Shell => self.shell_port,
            Channel::IoPub => self.iopub_port,
            Channel::Stdin => self.stdin_port,
            Channel::Control => self.control_port,
            Channel::Heartbeat => self.hb_port,
        }
    }

    pub const fn set_port(&mut self, channel: Channel, port: u16) {
        let slot = match channel {
            Channel::Shell => &mut self.shell_port,
            Channel::IoPub => &mut self.iopub_port,
            Channel::Stdin => &mut self.stdin_port,
            Channel::Control => &mut self.control_port,
            Channel::Heartbeat => &mut self.hb_port,
        };
        *slot = Some(port);
    }

    pub fn is_complete(&self) -> bool {
        Channel::ALL.iter().all(|channel| self.port(*channel).is_some())
    }

    /// Returns an `InvalidArgument` error naming every unassigned port.
    pub fn ensure_complete(&self) -> Result<(), Error> {
        let missing: Vec<&str> = Channel::ALL
            .iter()
            .filter(|channel| self.port(**channel).is_none())
            .map(|channel| channel.port_field())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(make_input_err!(
            "Connection info is missing {}",
            missing.join(", ")
        ))
    }

    /// Address a client connects to for `channel`.
    pub fn url(&self, channel: Channel) -> Result<String, Error> {
        let port = self
            .port(channel)
            .err_tip_with_code(|_| {
                (
                    Code::FailedPrecondition,
                    format!("No {channel} port assigned"),
                )
            })?;
        Ok(match self.transport {
            Transport::Tcp => format!("tcp://{}:{port}", self.ip),
            Transport::Ipc => format!("ipc://{}-{port}", self.ip),
        })
    }

    /// Writes the connection file readable only by the current user.
    pub async fn write_to_file(&self, path: &Path) -> Result<(), Error> {
        self.ensure_complete()
            .err_tip(|| "Refusing to write an incomplete connection file")?;
        let contents = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, contents)
            .await
            .err_tip(|| format!("Could not write connection file {}", path.display()))?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .err_tip(|| format!("Could not restrict connection file {}", path.display()))
    }

    pub async fn read_from_file(path: &Path) -> Result<Self, Error> {
        let contents = tokio::fs::read(path)
            .await
            .err_tip(|| format!("Could not read connection file {}", path.display()))?;
        serde_json::from_slice(&contents)
            .err_tip(|| format!("Malformed connection file {}", path.display()))
    }
}

/// Ports are written as integers with `0` meaning unassigned. Strings
/// holding an integer are accepted on input.
pub(crate) mod port_serde {
    use core::fmt;

    use serde::{Deserializer, Serializer, de};

    #[allow(clippy::trivially_copy_pass_by_ref, reason = "signature required by serde")]
    pub(crate) fn serialize<S: Serializer>(
        port: &Option<u16>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(port.unwrap_or(0))
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u16>, D::Error> {
        struct PortVisitor;

        impl de::Visitor<'_> for PortVisitor {
            type Value = Option<u16>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a port number or a string holding one")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                let port = u16::try_from(v).map_err(de::Error::custom)?;
                Ok((port != 0).then_some(port))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                let port = u16::try_from(v).map_err(de::Error::custom)?;
                Ok((port != 0).then_some(port))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                let port = v.trim().parse::<u16>().map_err(de::Error::custom)?;
                Ok((port != 0).then_some(port))
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(None)
            }
        }

        deserializer.deserialize_any(PortVisitor)
    }
}
