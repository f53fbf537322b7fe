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
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Weak;
use std::time::SystemTime;

use futures::future::BoxFuture;
use kernelvisor_config::kernelvisor::RestarterConfig;
use kernelvisor_error::{Code, Error, ResultExt, make_err};
use kernelvisor_util::{background_spawn, spawn};
use kernelvisor_util::task::JoinHandleDropGuard;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::kernel_manager::KernelManager;

/// A function to get the current system time, used to allow mocking for tests
pub type NowFn = fn() -> SystemTime;
pub type SleepFn = fn(Duration) -> BoxFuture<'static, ()>;

/// Functions that may be injected for testing purposes, during standard control
/// flows these are specified by the new function.
#[derive(Clone, Copy)]
pub struct Callbacks {
    /// A function that gets the current time.
    pub now_fn: NowFn,
    /// A function that sleeps for a given Duration.
    pub sleep_fn: SleepFn,
}

impl Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks").finish_non_exhaustive()
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            now_fn: SystemTime::now,
            sleep_fn: |duration| Box::pin(tokio::time::sleep(duration)),
        }
    }
}

/// Published by the restarter of a `KernelManager`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestarterEvent {
    /// The kernel died and was restarted.
    Restart {
        kernel_id: String,
        restart_count: usize,
    },
    /// The kernel died and restarting it failed. Polling continues.
    RestartFailed { kernel_id: String, error: Error },
    /// The kernel died more often than the restart budget allows. Polling
    /// has stopped.
    Dead { kernel_id: String, error: Error },
}

/// Polls kernel liveness and restarts dead kernels, at most
/// `max_restarts` times within `restart_window`.
pub struct KernelRestarter {
    manager: Weak<KernelManager>,
    config: RestarterConfig,
    callbacks: Callbacks,
    events: broadcast::Sender<RestarterEvent>,
    task: Mutex<Option<JoinHandleDropGuard<()>>>,
}

impl Debug for KernelRestarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRestarter")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl KernelRestarter {
    pub const fn new(
        manager: Weak<KernelManager>,
        config: RestarterConfig,
        callbacks: Callbacks,
        events: broadcast::Sender<RestarterEvent>,
    ) -> Self {
        Self {
            manager,
            config,
            callbacks,
            events,
            task: Mutex::new(None),
        }
    }

    /// Starts polling. Does nothing if polling is already running.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let kernel_id = self
            .manager
            .upgrade()
            .and_then(|manager| manager.kernel_id().map(ToString::to_string))
            .unwrap_or_default();
        info!(%kernel_id, poll_interval = ?self.config.poll_interval, "Starting kernel restarter");
        *task = Some(spawn!(
            "kernel_restarter",
            Self::poll_loop(
                self.manager.clone(),
                self.config.clone(),
                self.callbacks,
                self.events.clone(),
            ),
            %kernel_id
        ));
    }

    /// Stops polling. Does nothing if polling is not running. A restart
    /// already in flight runs to completion.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            debug!("Stopping kernel restarter");
            drop(task);
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    async fn poll_loop(
        manager: Weak<KernelManager>,
        config: RestarterConfig,
        callbacks: Callbacks,
        events: broadcast::Sender<RestarterEvent>,
    ) {
        let mut history: VecDeque<SystemTime> = VecDeque::new();
        let mut alive_since: Option<SystemTime> = None;
        loop {
            (callbacks.sleep_fn)(config.poll_interval).await;
            let Some(manager) = manager.upgrade() else {
                debug!("Kernel manager dropped, stopping restarter");
                return;
            };
            if manager.is_shutting_down() {
                continue;
            }
            let kernel_id = manager.kernel_id().unwrap_or_default().to_string();
            let now = (callbacks.now_fn)();

            if manager.is_alive().await {
                if history.is_empty() || config.stable_period.is_zero() {
                    continue;
                }
                let since = *alive_since.get_or_insert(now);
                if elapsed_between(since, now) >= config.stable_period {
                    debug!(%kernel_id, "Kernel is stable, clearing restart history");
                    history.clear();
                    alive_since = None;
                }
                continue;
            }
            // A shutdown may have started while liveness was polled.
            if manager.is_shutting_down() {
                continue;
            }
            alive_since = None;

            while history.front().is_some_and(|restarted_at| {
                elapsed_between(*restarted_at, now) >= config.restart_window
            }) {
                history.pop_front();
            }

            if history.len() >= config.max_restarts {
                let error = make_err!(
                    Code::ResourceExhausted,
                    "Kernel {kernel_id} died {} times within {:?}, giving up",
                    history.len() + 1,
                    config.restart_window
                );
                error!(%kernel_id, ?error, "Kernel restart budget exhausted");
                drop(events.send(RestarterEvent::Dead { kernel_id, error }));
                return;
            }

            history.push_back(now);
            let restart_count = history.len();
            warn!(%kernel_id, restart_count, "Kernel died, restarting");
            // Aborting the poll loop must not cancel a relaunch halfway.
            let restart = background_spawn!(
                "kernel_restart",
                async move { manager.restart_kernel(true).await },
                %kernel_id
            );
            let result = restart
                .await
                .err_tip(|| "In kernel restart task")
                .and_then(|result| result);
            match result {
                Ok(()) => {
                    drop(events.send(RestarterEvent::Restart {
                        kernel_id,
                        restart_count,
                    }));
                }
                Err(error) => {
                    error!(%kernel_id, ?error, "Kernel restart failed");
                    drop(events.send(RestarterEvent::RestartFailed { kernel_id, error }));
                }
            }
        }
    }
}

fn elapsed_between(earlier: SystemTime, later: SystemTime) -> Duration {
    later.duration_since(earlier).unwrap_or_default()
}
