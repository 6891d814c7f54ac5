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

//! The plug-in process supervisor. Owns at most one child process,
//! pumps its stdout one line at a time into the router queue, and
//! tears it down on demand.

use std::{
    fmt,
    io::{BufRead, BufReader, Write},
    path::Path,
    process,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread, time,
};

use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, info, warn};

use crate::consts;

/// How a child came to be done, mirroring the two-way split the
/// protocol reports upstream (a signal death counts as a crash).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitKind {
    Normal,
    Crash,
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Normal => write!(f, "Normal Exit"),
            ExitKind::Crash => write!(f, "Crash Exit"),
        }
    }
}

#[derive(Debug)]
pub enum ChildEvent {
    Started,
    /// One line of the child's stdout, line ending stripped.
    Line(String),
    Finished {
        exit_code: i32,
        kind: ExitKind,
    },
}

#[derive(Debug)]
pub struct ChildStartError(pub String);

impl fmt::Display for ChildStartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plug-in process start error: {}", self.0)
    }
}

impl std::error::Error for ChildStartError {}

/// Supervisor owns one child process handle. `stop` is idempotent, and
/// after it returns no further [`ChildEvent`]s fire: the stdout reader
/// checks a cancel flag around every emission and is joined before
/// `stop` returns.
pub struct Supervisor {
    child: Arc<Mutex<Option<process::Child>>>,
    stdin: Option<process::ChildStdin>,
    cancel: Arc<AtomicBool>,
    reader_h: Option<thread::JoinHandle<()>>,
}

impl Supervisor {
    /// Launch `exe_path` with the given args, the working directory
    /// pinned to `cwd`, and stdio piped. Emits `ChildEvent::Started`
    /// once the process exists. Events are converted into whatever the
    /// consuming router's queue carries so all sources share one
    /// channel.
    pub fn start<E>(
        exe_path: &Path,
        args: &[String],
        cwd: &Path,
        events: crossbeam_channel::Sender<E>,
    ) -> Result<Supervisor, ChildStartError>
    where
        E: From<ChildEvent> + Send + 'static,
    {
        let mut child = process::Command::new(exe_path)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ChildStartError(format!("couldn't launch {:?}: {}", exe_path, e)))?;

        // Stdio::piped always yields handles on a fresh child.
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ChildStartError(String::from("child has no stdin pipe")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChildStartError(String::from("child has no stdout pipe")))?;

        info!("started plug-in process {:?} (pid {})", exe_path, child.id());
        if events.send(E::from(ChildEvent::Started)).is_err() {
            debug!("nobody listening for child events");
        }

        let child = Arc::new(Mutex::new(Some(child)));
        let cancel = Arc::new(AtomicBool::new(false));
        let reader_h = {
            let child = Arc::clone(&child);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || read_loop(child, stdout, cancel, events))
        };

        Ok(Supervisor { child, stdin: Some(stdin), cancel, reader_h: Some(reader_h) })
    }

    /// Write one command line to the child's stdin, appending the
    /// newline. Silently a no-op when no child is running; a write
    /// error just means the child is on its way out, which the
    /// process-finished event reports better than we could here.
    pub fn write_line(&mut self, line: &str) {
        if let Some(stdin) = self.stdin.as_mut() {
            let line = line.trim_end_matches('\n');
            if let Err(e) = writeln!(stdin, "{}", line).and_then(|_| stdin.flush()) {
                debug!("writing to plug-in process: {}", e);
            }
        }
    }

    /// Ask the child to terminate, resorting to SIGKILL if it lingers,
    /// and cancel the reader loop. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        // closing stdin gives a well behaved child its EOF
        self.stdin = None;

        {
            // we unwrap to propagate the poison as an unwind
            let mut child_slot = self.child.lock().unwrap();
            if let Some(mut child) = child_slot.take() {
                let pid = Pid::from_raw(child.id() as i32);
                if let Err(e) = signal::kill(pid, Some(Signal::SIGTERM)) {
                    debug!("sending SIGTERM to plug-in process: {}", e);
                }

                let deadline = time::Instant::now() + consts::CHILD_KILL_TIMEOUT;
                loop {
                    match child.try_wait() {
                        Ok(Some(_)) => break,
                        Ok(None) => {
                            if time::Instant::now() >= deadline {
                                info!("plug-in process ignored SIGTERM, no longer being polite");
                                if let Err(e) = child.kill() {
                                    warn!("killing plug-in process: {}", e);
                                }
                                let _ = child.wait();
                                break;
                            }
                            thread::sleep(consts::PROBE_POLL_DUR);
                        }
                        Err(e) => {
                            warn!("reaping plug-in process: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(h) = self.reader_h.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn classify(status: process::ExitStatus) -> (i32, ExitKind) {
    match status.code() {
        Some(code) => (code, ExitKind::Normal),
        // no code means the child was taken down by a signal
        None => (-1, ExitKind::Crash),
    }
}

fn read_loop<E>(
    child: Arc<Mutex<Option<process::Child>>>,
    stdout: process::ChildStdout,
    cancel: Arc<AtomicBool>,
    events: crossbeam_channel::Sender<E>,
) where
    E: From<ChildEvent> + Send + 'static,
{
    let mut reader = BufReader::new(stdout);
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if cancel.load(Ordering::Acquire) {
                    return;
                }
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if events.send(E::from(ChildEvent::Line(line))).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("reading plug-in process stdout: {}", e);
                break;
            }
        }
    }

    if cancel.load(Ordering::Acquire) {
        return;
    }

    // stdout closed on its own: reap the child and report how it went
    let status = {
        // we unwrap to propagate the poison as an unwind
        let mut child_slot = child.lock().unwrap();
        match child_slot.take() {
            Some(mut child) => child.wait().ok(),
            // stop() got here first and will report nothing, as asked
            None => return,
        }
    };

    if cancel.load(Ordering::Acquire) {
        return;
    }
    if let Some(status) = status {
        let (exit_code, kind) = classify(status);
        info!("plug-in process finished. Exit-Code:{} ({})", exit_code, kind);
        let _ = events.send(E::from(ChildEvent::Finished { exit_code, kind }));
    }
}
