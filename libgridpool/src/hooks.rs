// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use gridpool_protocol::{LogSource, LogType};

/// Callbacks that a wrapping binary can implement to observe the grid:
/// a log pane, a worker list, a status bar, a tray notification. The
/// core never depends on any of them being present.
///
/// Hooks are invoked inline within the router's control flow, so they
/// MUST NOT block for extended periods of time. If you need to do work
/// that could block for a while, spin up a worker thread and enqueue
/// events so the hooks can be processed async.
///
/// Any errors returned will simply be logged.
///
/// All hooks do nothing by default.
pub trait Hooks {
    /// Triggered when a worker completes its attach handshake and
    /// reports its parallel compute capacity. On the worker role the
    /// id is the local session id and the capacity is the machine's
    /// own ideal thread count.
    fn worker_in_grid(&self, _worker_id: &str, _capacity: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when a worker's session goes away.
    fn worker_out_grid(&self, _worker_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered for every log line the router surfaces, whether it
    /// originated locally or arrived over the wire.
    fn log(&self, _source: LogSource, _level: LogType, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Triggered when a plug-in process emits a status message (`stm`).
    /// Observers typically display only the most recent one.
    fn status_message(&self, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct NoopHooks {}
impl Hooks for NoopHooks {}
