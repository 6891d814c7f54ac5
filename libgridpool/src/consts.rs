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

use std::time;

pub const DEFAULT_SERVER_IP: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 45678;

/// How often the manager pings every live worker, and how often the
/// worker checks that it has heard from the manager. The two periods
/// coincide, which makes worker-side dead-link detection a two-tick
/// affair.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: time::Duration = time::Duration::from_millis(300_000);

pub const DEFAULT_CONNECT_TIMEOUT: time::Duration = time::Duration::from_millis(300_000);
pub const DEFAULT_RECONNECT_TIMEOUT: time::Duration = time::Duration::from_millis(300_000);

/// Redial delay after an established session drops, as opposed to a
/// dial that never connected (which waits the full reconnect timeout).
pub const RECONNECT_AFTER_DROP: time::Duration = time::Duration::from_millis(100);

/// Hard deadline for the `-test` probe run of a freshly extracted
/// plug-in executable.
pub const PROBE_TIMEOUT: time::Duration = time::Duration::from_millis(10_000);
pub const PROBE_POLL_DUR: time::Duration = time::Duration::from_millis(50);

/// How long `Supervisor::stop` waits for the child to die before
/// reporting it.
pub const CHILD_KILL_TIMEOUT: time::Duration = time::Duration::from_millis(500);

/// Upper bound on a single frame's payload. The worker archive travels
/// in one frame, so this has to be generous, but a length word beyond
/// this is treated as stream corruption rather than a real frame.
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Flag passed to a plug-in executable to ask it to start and exit
/// cleanly without doing any work.
pub const PROBE_FLAG: &str = "-test";
