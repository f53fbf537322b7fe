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

use kernelvisor_error::{Code, Error, make_err};
use kernelvisor_macro::kernelvisor_test;
use kernelvisor_util::{background_spawn, spawn};
use pretty_assertions::assert_eq;
use tokio::sync::oneshot;

#[kernelvisor_test]
async fn spawn_returns_task_output() -> Result<(), Error> {
    let guard = spawn!("spawn_returns_task_output", async { 42 });
    assert_eq!(guard.await?, 42);
    Ok(())
}

#[kernelvisor_test]
async fn spawn_accepts_span_fields() -> Result<(), Error> {
    let kernel_id = "k1";
    let guard = spawn!("spawn_accepts_span_fields", async { "done" }, ?kernel_id);
    assert_eq!(guard.await?, "done");
    Ok(())
}

#[kernelvisor_test]
async fn dropping_guard_aborts_task() -> Result<(), Error> {
    let (tx, rx) = oneshot::channel::<()>();
    let guard = spawn!("dropping_guard_aborts_task", async move {
        // Holds the sender until the task is aborted.
        let _tx = tx;
        tokio::time::sleep(Duration::from_secs(3600)).await;
    });
    drop(guard);

    // The sender is dropped when the aborted task is torn down.
    let result = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .map_err(|_| make_err!(Code::DeadlineExceeded, "Task was not aborted"))?;
    assert!(result.is_err(), "Expected sender to be dropped");
    Ok(())
}

#[kernelvisor_test]
async fn background_spawn_is_detached() -> Result<(), Error> {
    let (tx, rx) = oneshot::channel();
    drop(background_spawn!("background_spawn_is_detached", async move {
        tx.send(7).ok();
    }));
    assert_eq!(rx.await.ok(), Some(7));
    Ok(())
}
