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

use kernelvisor_error::{Code, Error};
use kernelvisor_kernel::channels::Channel;
use kernelvisor_kernel::connection_info::{ConnectionInfo, Transport};
use kernelvisor_macro::kernelvisor_test;
use pretty_assertions::assert_eq;

fn complete_info(transport: Transport, ip: &str) -> ConnectionInfo {
    let mut info = ConnectionInfo::new(
        transport,
        ip.to_string(),
        "hmac-sha256".to_string(),
        "secret".to_string(),
    );
    for (port, channel) in (5000..).zip(Channel::ALL) {
        info.set_port(channel, port);
    }
    info
}

#[test]
fn unassigned_ports_serialize_as_zero() -> Result<(), Error> {
    let mut info = ConnectionInfo::new(
        Transport::Tcp,
        "127.0.0.1".to_string(),
        "hmac-sha256".to_string(),
        "secret".to_string(),
    );
    info.set_port(Channel::Shell, 5555);

    let value = serde_json::to_value(&info)?;

    assert_eq!(value["shell_port"], 5555);
    assert_eq!(value["iopub_port"], 0);
    assert_eq!(value["transport"], "tcp");
    assert_eq!(serde_json::from_value::<ConnectionInfo>(value)?, info);
    Ok(())
}

#[test]
fn string_ports_are_coerced() -> Result<(), Error> {
    let info: ConnectionInfo = serde_json::from_str(
        r#"{
            "transport": "tcp",
            "ip": "127.0.0.1",
            "shell_port": "5555",
            "iopub_port": 5556,
            "stdin_port": 0,
            "control_port": null,
            "signature_scheme": "hmac-sha256",
            "key": "secret"
        }"#,
    )?;

    assert_eq!(info.shell_port, Some(5555));
    assert_eq!(info.iopub_port, Some(5556));
    assert_eq!(info.stdin_port, None);
    assert_eq!(info.control_port, None);
    assert_eq!(info.hb_port, None);
    assert!(!info.is_complete());
    Ok(())
}

#[test]
fn ensure_complete_names_missing_ports() {
    let mut info = complete_info(Transport::Tcp, "127.0.0.1");
    assert_eq!(info.ensure_complete(), Ok(()));

    info.hb_port = None;
    info.stdin_port = None;
    let err = info.ensure_complete().unwrap_err();

    assert_eq!(err.code, Code::InvalidArgument);
    assert!(err.message_string().contains("stdin_port, hb_port"));
}

#[test]
fn urls_follow_transport() -> Result<(), Error> {
    let tcp = complete_info(Transport::Tcp, "127.0.0.1");
    assert_eq!(tcp.url(Channel::Shell)?, "tcp://127.0.0.1:5000");
    assert_eq!(tcp.url(Channel::Heartbeat)?, "tcp://127.0.0.1:5004");

    let ipc = complete_info(Transport::Ipc, "/tmp/kernel");
    assert_eq!(ipc.url(Channel::IoPub)?, "ipc:///tmp/kernel-5001");

    let mut missing = tcp;
    missing.control_port = None;
    assert_eq!(
        missing.url(Channel::Control).unwrap_err().code,
        Code::FailedPrecondition
    );
    Ok(())
}

#[kernelvisor_test]
async fn connection_file_is_private() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("kernel.json");
    let info = complete_info(Transport::Tcp, "127.0.0.1");

    info.write_to_file(&path).await?;

    let mode = std::fs::metadata(&path)?.permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    assert_eq!(ConnectionInfo::read_from_file(&path).await?, info);
    Ok(())
}

#[kernelvisor_test]
async fn incomplete_connection_file_is_refused() -> Result<(), Error> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("kernel.json");
    let mut info = complete_info(Transport::Tcp, "127.0.0.1");
    info.shell_port = None;

    let err = info.write_to_file(&path).await.unwrap_err();

    assert_eq!(err.code, Code::InvalidArgument);
    assert!(!path.exists());
    Ok(())
}
