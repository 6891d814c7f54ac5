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

//! The plug-in archive installer. An install extracts a zip into a
//! role-specific directory, checks that the expected executable came
//! out of it, probes the executable with `-test`, and only then caches
//! the archive for later re-installs and (for the worker role) for
//! shipping to attaching peers.
//!
//! A failed install never leaves a half-extracted tree behind: the
//! target directory is wiped before extraction and wiped again on any
//! failure after it, so the observable outcomes are "installed" and
//! "not installed" only. The cached `<role>.zip` is written last, so a
//! failure also never clobbers a previously cached archive.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
    process, thread, time,
};

use tracing::{info, warn};

use crate::consts;

/// Which of the two plug-in flavors an archive holds. The directory
/// and file names derived from it are part of the on-disk interface.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    Manager,
    Worker,
}

impl Role {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Worker => "worker",
        }
    }

    pub fn exe_name(&self) -> &'static str {
        match self {
            Role::Manager => "manager.exe",
            Role::Worker => "worker.exe",
        }
    }

    pub fn archive_name(&self) -> &'static str {
        match self {
            Role::Manager => "manager.zip",
            Role::Worker => "worker.zip",
        }
    }

    pub fn literal(&self) -> &'static str {
        match self {
            Role::Manager => "Manager",
            Role::Worker => "Worker",
        }
    }

    /// Where the unpacked tree lives under the data dir. Doubles as
    /// the plug-in process's working directory.
    pub fn install_dir(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.dir_name())
    }

    pub fn exe_path(&self, data_dir: &Path) -> PathBuf {
        self.install_dir(data_dir).join(self.exe_name())
    }

    pub fn archive_path(&self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.archive_name())
    }
}

#[derive(Debug)]
pub enum InstallError {
    /// Paths couldn't be created, deleted, or copied.
    Filesystem(String),
    /// The archive is unreadable or doesn't contain the expected
    /// executable at the top level.
    Archive(String),
    /// The `-test` probe ran past its deadline and was killed.
    ProbeTimeout,
    /// The `-test` probe died instead of exiting cleanly.
    ProbeFailed(i32),
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallError::Filesystem(msg) => write!(f, "File system I/O error! {}", msg),
            InstallError::Archive(msg) => write!(f, "Archive error! {}", msg),
            InstallError::ProbeTimeout => write!(f, "Executable is timed out."),
            InstallError::ProbeFailed(code) => {
                write!(f, "Executable exited with code: {}.", code)
            }
        }
    }
}

impl std::error::Error for InstallError {}

/// Install the archive at `archive` for `role`, then cache a copy of
/// it at `<data_dir>/<role>.zip`. Installing the same archive twice
/// yields the same filesystem state.
pub fn install(data_dir: &Path, archive: &Path, role: Role) -> Result<(), InstallError> {
    if !archive.exists() {
        return Err(InstallError::Filesystem(format!(
            "Archive:'{}' couldn't find.",
            archive.display()
        )));
    }

    extract_and_probe(data_dir, archive, role)?;

    let cached = role.archive_path(data_dir);
    if cached != archive {
        fs::copy(archive, &cached).map_err(|e| {
            InstallError::Filesystem(format!(
                "Archive:'{}' couldn't copy to path:{}. {}",
                archive.display(),
                cached.display(),
                e
            ))
        })?;
    }

    info!("{} process has been successfully set.", role.literal());
    Ok(())
}

/// Install from the archive already cached at `<data_dir>/<role>.zip`.
/// This is the worker-side attach path: the attach handler writes the
/// shipped bytes there and then installs from the cache.
pub fn install_cached(data_dir: &Path, role: Role) -> Result<(), InstallError> {
    let cached = role.archive_path(data_dir);
    install(data_dir, &cached, role)
}

/// Read back the cached archive so it can be shipped to peers.
pub fn cached_archive(data_dir: &Path, role: Role) -> Result<Vec<u8>, InstallError> {
    let cached = role.archive_path(data_dir);
    fs::read(&cached).map_err(|e| {
        InstallError::Filesystem(format!("Archive:'{}' couldn't read. {}", cached.display(), e))
    })
}

fn extract_and_probe(data_dir: &Path, archive: &Path, role: Role) -> Result<(), InstallError> {
    let target = role.install_dir(data_dir);
    wipe(&target)?;
    fs::create_dir_all(&target).map_err(|e| {
        InstallError::Filesystem(format!(
            "Directory:'{}' couldn't modify. {}",
            target.display(),
            e
        ))
    })?;

    let res = extract(archive, &target, role).and_then(|_| {
        probe(&role.exe_path(data_dir), &target, consts::PROBE_TIMEOUT)
    });
    if res.is_err() {
        // back out to "no installation"
        if let Err(e) = fs::remove_dir_all(&target) {
            warn!("cleaning up failed install at {}: {}", target.display(), e);
        }
    }
    res
}

fn wipe(target: &Path) -> Result<(), InstallError> {
    match fs::remove_dir_all(target) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(InstallError::Filesystem(format!(
            "Directory:'{}' couldn't modify. {}",
            target.display(),
            e
        ))),
    }
}

fn extract(archive: &Path, target: &Path, role: Role) -> Result<(), InstallError> {
    let file = fs::File::open(archive).map_err(|e| {
        InstallError::Archive(format!("'{}' couldn't open: {}", archive.display(), e))
    })?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| {
        InstallError::Archive(format!("'{}' is invalid: {}", archive.display(), e))
    })?;
    zip.extract(target).map_err(|e| {
        InstallError::Archive(format!("'{}' couldn't extract: {}", archive.display(), e))
    })?;

    if !target.join(role.exe_name()).exists() {
        return Err(InstallError::Archive(format!(
            "'{}' is invalid, doesn't contain executable: {}",
            archive.display(),
            role.exe_name()
        )));
    }
    Ok(())
}

/// Run `exe -test` and give it `deadline` to start and exit cleanly.
/// Only a timeout or a death-by-signal style exit fails the probe; a
/// plug-in that exits with a small positive code is accepted, matching
/// the deployed behavior.
fn probe(exe: &Path, cwd: &Path, deadline: time::Duration) -> Result<(), InstallError> {
    let mut child = process::Command::new(exe)
        .arg(consts::PROBE_FLAG)
        .current_dir(cwd)
        .stdin(process::Stdio::null())
        .stdout(process::Stdio::null())
        .stderr(process::Stdio::null())
        .spawn()
        .map_err(|e| {
            InstallError::Archive(format!("'{}' couldn't run: {}", exe.display(), e))
        })?;

    let give_up_at = time::Instant::now() + deadline;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                return match status.code() {
                    Some(code) if code >= 0 => Ok(()),
                    Some(code) => Err(InstallError::ProbeFailed(code)),
                    None => Err(InstallError::ProbeFailed(-1)),
                };
            }
            Ok(None) => {
                if time::Instant::now() >= give_up_at {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(InstallError::ProbeTimeout);
                }
                thread::sleep(consts::PROBE_POLL_DUR);
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(InstallError::Archive(format!(
                    "'{}' probe couldn't be awaited: {}",
                    exe.display(),
                    e
                )));
            }
        }
    }
}
