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

use std::{
    sync::{atomic::AtomicBool, Arc},
    thread,
};

use anyhow::Context;
use signal_hook::{consts::TERM_SIGNALS, flag, iterator::Signals};
use tracing::info;

/// Spawn the termination signal handler thread. The first term signal
/// invokes `on_term`, which is expected to nudge the router into its
/// graceful shutdown path; a second term signal kills the process
/// outright so a mashed ^C never leaves things stuck.
pub fn spawn<F>(on_term: F) -> anyhow::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    info!("spawning signal handler thread");

    let term_now = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        // The conditional shutdown only fires once term_now is set, and
        // the flag registration below is what sets it. Registration
        // order matters: flipped around, the first signal would arm and
        // terminate in one go.
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&term_now))?;
        flag::register(*sig, Arc::clone(&term_now))?;
    }

    let mut signals = Signals::new(TERM_SIGNALS).context("creating signal iterator")?;
    thread::spawn(move || {
        #[allow(clippy::never_loop)]
        for signal in &mut signals {
            assert!(TERM_SIGNALS.contains(&signal));
            info!("term sig handler: beginning graceful shutdown");
            on_term();
            break;
        }
    });

    Ok(())
}
