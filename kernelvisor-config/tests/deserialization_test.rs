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
use std::io::Write;

use kernelvisor_config::kernel_spec::InterruptMode;
use kernelvisor_config::kernelvisor::{KernelvisorConfig, Transport};
use kernelvisor_config::provisioners::{
    AdoptingProvisionerSpec, LocalProvisionerSpec, ProvisionerSpec,
};
use kernelvisor_config::serde_utils::{
    convert_duration_with_shellexpand, convert_numeric_with_shellexpand,
};
use kernelvisor_error::Code;
use pretty_assertions::assert_eq;
use serde::Deserialize;

#[derive(Deserialize)]
struct DurationEntity {
    #[serde(deserialize_with = "convert_duration_with_shellexpand")]
    duration: Duration,
}

#[derive(Deserialize)]
struct NumericEntity {
    #[serde(deserialize_with = "convert_numeric_with_shellexpand")]
    value: u16,
}

#[test]
fn duration_human_readable_deserialize() {
    let deserialized: DurationEntity = serde_json5::from_str(r#"{"duration": "1m 10s"}"#).unwrap();
    assert_eq!(deserialized.duration, Duration::from_secs(70));

    let deserialized: DurationEntity = serde_json5::from_str(r#"{"duration": "250ms"}"#).unwrap();
    assert_eq!(deserialized.duration, Duration::from_millis(250));
}

#[test]
fn duration_seconds_deserialize() {
    let deserialized: DurationEntity = serde_json5::from_str(r#"{"duration": 10}"#).unwrap();
    assert_eq!(deserialized.duration, Duration::from_secs(10));

    let deserialized: DurationEntity = serde_json5::from_str(r#"{"duration": 0.5}"#).unwrap();
    assert_eq!(deserialized.duration, Duration::from_millis(500));
}

#[test]
fn duration_rejects_garbage() {
    assert!(serde_json5::from_str::<DurationEntity>(r#"{"duration": "soon"}"#).is_err());
}

#[test]
fn numeric_shellexpand_deserialize() {
    // SAFETY: no other test reads or writes this variable.
    unsafe { std::env::set_var("KERNELVISOR_TEST_PORT", "5555") };
    let deserialized: NumericEntity =
        serde_json5::from_str(r#"{"value": "$KERNELVISOR_TEST_PORT"}"#).unwrap();
    assert_eq!(deserialized.value, 5555);

    let deserialized: NumericEntity = serde_json5::from_str(r#"{"value": 5556}"#).unwrap();
    assert_eq!(deserialized.value, 5556);
}

#[test]
fn minimal_config_uses_defaults() {
    let config: KernelvisorConfig = serde_json5::from_str(
        r#"{
            // Only the kernel is required.
            kernel: {
                argv: ["python3", "-m", "ipykernel_launcher", "-f", "{connection_file}"],
            },
        }"#,
    )
    .unwrap();

    assert_eq!(config.kernel.argv.len(), 5);
    assert_eq!(config.kernel.interrupt_mode, InterruptMode::Signal);
    assert_eq!(
        config.provisioner,
        ProvisionerSpec::Local(LocalProvisionerSpec::default())
    );
    assert_eq!(config.connection.ip, "127.0.0.1");
    assert_eq!(config.connection.transport, Transport::Tcp);
    assert_eq!(config.connection.signature_scheme, "hmac-sha256");
    assert_eq!(config.connection.key, None);
    assert!(config.restarter.autorestart);
    assert_eq!(config.restarter.poll_interval, Duration::from_secs(3));
    assert_eq!(config.restarter.max_restarts, 5);
    assert_eq!(config.restarter.restart_window, Duration::from_secs(60));
    assert_eq!(config.shutdown_wait_time, Duration::from_secs(5));
}

#[test]
fn adopting_config_deserialize() {
    // SAFETY: no other test reads or writes this variable.
    unsafe { std::env::set_var("KERNELVISOR_TEST_CONN_DIR", "/var/run/kernels") };
    let config: KernelvisorConfig = serde_json5::from_str(
        r#"{
            kernel: {
                argv: [],
                display_name: "Adopted",
                interrupt_mode: "message",
                env: { GREETING: "hello" },
            },
            provisioner: {
                adopting: { shell_port_env: "MY_SHELL_PORT" },
            },
            connection: {
                transport: "ipc",
                ip: "/tmp/kernel",
                connection_dir: "$KERNELVISOR_TEST_CONN_DIR",
            },
            restarter: {
                autorestart: false,
                poll_interval: "500ms",
                max_restarts: 3,
                restart_window: "1m",
            },
            shutdown_wait_time: 2,
        }"#,
    )
    .unwrap();

    assert_eq!(config.kernel.display_name, "Adopted");
    assert_eq!(config.kernel.interrupt_mode, InterruptMode::Message);
    assert_eq!(config.kernel.env.get("GREETING").map(String::as_str), Some("hello"));
    assert_eq!(
        config.provisioner,
        ProvisionerSpec::Adopting(AdoptingProvisionerSpec {
            shell_port_env: "MY_SHELL_PORT".to_string(),
            ..AdoptingProvisionerSpec::default()
        })
    );
    assert_eq!(config.connection.transport, Transport::Ipc);
    assert_eq!(
        config.connection.connection_dir.as_deref(),
        Some("/var/run/kernels")
    );
    assert!(!config.restarter.autorestart);
    assert_eq!(config.restarter.poll_interval, Duration::from_millis(500));
    assert_eq!(config.restarter.max_restarts, 3);
    assert_eq!(config.restarter.restart_window, Duration::from_secs(60));
    assert_eq!(config.shutdown_wait_time, Duration::from_secs(2));
}

#[test]
fn unknown_fields_are_rejected() {
    let result = serde_json5::from_str::<KernelvisorConfig>(
        r#"{ kernel: { argv: [], bogus: 1 } }"#,
    );
    assert!(result.is_err());
}

#[test]
fn try_from_json5_file_reads_config() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(br#"{ kernel: { argv: ["sleep", "100"] } }"#)
        .unwrap();
    let path = file.path().to_str().unwrap().to_string();

    let config = KernelvisorConfig::try_from_json5_file(&path).unwrap();
    assert_eq!(config.kernel.argv, vec!["sleep".to_string(), "100".to_string()]);
}

#[test]
fn try_from_json5_file_missing_file() {
    let error = KernelvisorConfig::try_from_json5_file("/nonexistent/kernelvisor.json5")
        .unwrap_err();
    assert_eq!(error.code, Code::NotFound);
    assert!(
        error
            .message_string()
            .contains("Could not open config file /nonexistent/kernelvisor.json5")
    );
}
