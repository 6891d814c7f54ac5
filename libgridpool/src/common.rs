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
use tracing::{error, info, warn};

use crate::hooks;

/// Route one log line to both the tracing subscriber and whatever
/// observer the wrapping binary hooked in. This is the single exit
/// point for everything the routers surface, local or forwarded.
pub fn surface_log(
    hooks: &(dyn hooks::Hooks + Send + Sync),
    source: LogSource,
    level: LogType,
    message: &str,
) {
    match level {
        LogType::Info => info!("[{}] {}", source.literal(), message),
        LogType::Warning => warn!("[{}] {}", source.literal(), message),
        LogType::Error => error!("[{}] {}", source.literal(), message),
    }

    if let Err(e) = hooks.log(source, level, message) {
        warn!("log hook: {:?}", e);
    }
}

/// The parallel compute capacity this machine advertises when it
/// joins the grid.
pub fn ideal_thread_count() -> u32 {
    std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
}
