// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::{
    fs,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    time,
};

use anyhow::{anyhow, Context};
use byteorder::{BigEndian, ReadBytesExt as _, WriteBytesExt as _};

pub fn gridpool_bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_gridpool"))
}

pub fn wait_until<P>(mut pred: P) -> anyhow::Result<()>
where
    P: FnMut() -> anyhow::Result<bool>,
{
    let mut sleep_dur = time::Duration::from_millis(5);
    for _ in 0..14 {
        if pred()? {
            return Ok(());
        } else {
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
    }

    Err(anyhow!("pred never became true"))
}

/// Scan a file (typically a plug-in script's recording or a log file)
/// until some line contains the needle.
pub fn wait_for_line<P: AsRef<Path>>(path: P, needle: &str) -> anyhow::Result<()> {
    let path = path.as_ref();
    wait_until(|| match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.lines().any(|l| l.contains(needle))),
        Err(_) => Ok(false),
    })
    .with_context(|| format!("waiting for {:?} in {:?}", needle, path))
}

pub fn free_port() -> anyhow::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

//
// Hand-rolled wire helpers. These are deliberately written against the
// documented frame layout rather than the production codec, so the
// tests double as a compatibility check on the bytes themselves.
//

pub fn send_frame(stream: &mut TcpStream, type_id: u16, payload: &[u8]) -> anyhow::Result<()> {
    stream.write_u8(1)?; // kind: DATA
    stream.write_u16::<BigEndian>(type_id)?;
    stream.write_u32::<BigEndian>(payload.len() as u32)?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

pub fn recv_frame(stream: &mut TcpStream) -> anyhow::Result<(u16, Vec<u8>)> {
    let kind = stream.read_u8().context("reading kind tag")?;
    if kind != 1 {
        return Err(anyhow!("unexpected frame kind {}", kind));
    }
    let type_id = stream.read_u16::<BigEndian>()?;
    let len = stream.read_u32::<BigEndian>()? as usize;
    let mut payload = vec![0; len];
    stream.read_exact(&mut payload)?;
    Ok((type_id, payload))
}

pub fn encode_args(args: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(args.len() as u32).to_be_bytes());
    for arg in args {
        let units: Vec<u16> = arg.encode_utf16().collect();
        buf.extend_from_slice(&((units.len() * 2) as u32).to_be_bytes());
        for unit in units {
            buf.extend_from_slice(&unit.to_be_bytes());
        }
    }
    buf
}

pub fn decode_args(payload: &[u8]) -> anyhow::Result<Vec<String>> {
    let mut cursor = std::io::Cursor::new(payload);
    let count = cursor.read_u32::<BigEndian>()?;
    let mut args = Vec::new();
    for _ in 0..count {
        let byte_len = cursor.read_u32::<BigEndian>()? as usize;
        let mut units = Vec::with_capacity(byte_len / 2);
        for _ in 0..byte_len / 2 {
            units.push(cursor.read_u16::<BigEndian>()?);
        }
        args.push(String::from_utf16(&units)?);
    }
    Ok(args)
}

/// Build a plug-in archive: a zip holding one executable shell script
/// under the given name. The script is always given the `-test` probe
/// escape hatch.
pub fn plugin_zip(exe_name: &str, script_body: &str) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut buf);
        let opts = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
        writer.start_file(exe_name, opts).expect("starting exe entry");
        writer
            .write_all(
                format!(
                    "#!/bin/sh\nif [ \"$1\" = \"-test\" ]; then exit 0; fi\n{}\n",
                    script_body
                )
                .as_bytes(),
            )
            .expect("writing exe entry");
        writer.finish().expect("finishing zip");
    }
    buf.into_inner()
}

/// A `gridpool manager` subprocess plus the tmp world it lives in.
/// The subprocess is killed when this goes out of scope.
pub struct ManagerProc {
    pub proc: Child,
    pub port: u16,
    pub tmp_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
    _local_tmp_dir: tempfile::TempDir,
}

impl ManagerProc {
    /// Spawn a manager with the given manager plug-in script body and
    /// worker payload bytes, then wait for its port to come up.
    pub fn new(
        manager_script: &str,
        worker_archive: &[u8],
        keep_alive_ms: u64,
    ) -> anyhow::Result<ManagerProc> {
        let local_tmp_dir = tempfile::Builder::new()
            .prefix("gridpool-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;
        let tmp_dir = local_tmp_dir.path().to_path_buf();
        let data_dir = tmp_dir.join("data");
        let log_file = tmp_dir.join("manager.log");

        let port = free_port()?;
        let config_file = tmp_dir.join("config.toml");
        fs::write(
            &config_file,
            format!("server_port = {}\nkeep_alive_interval_ms = {}\n", port, keep_alive_ms),
        )?;

        let manager_zip = tmp_dir.join("manager-payload.zip");
        fs::write(&manager_zip, plugin_zip("manager.exe", manager_script))?;
        let worker_zip = tmp_dir.join("worker-payload.zip");
        fs::write(&worker_zip, worker_archive)?;

        eprintln!("spawning manager proc with log {:?}", &log_file);
        let proc = Command::new(gridpool_bin())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--config-file")
            .arg(&config_file)
            .arg("--data-dir")
            .arg(&data_dir)
            .arg("manager")
            .arg("--manager-archive")
            .arg(&manager_zip)
            .arg("--worker-archive")
            .arg(&worker_zip)
            .spawn()
            .context("spawning manager process")?;

        let mut me = ManagerProc {
            proc,
            port,
            tmp_dir,
            data_dir,
            log_file,
            _local_tmp_dir: local_tmp_dir,
        };

        // spin until we can dial the port successfully
        let port = me.port;
        wait_until(|| Ok(TcpStream::connect(("127.0.0.1", port)).is_ok()))
            .context("waiting for the manager port")?;
        // the dial probe above shows up as a connect+disconnect in the
        // manager's logs, which is harmless
        me.wait_running()?;
        Ok(me)
    }

    fn wait_running(&mut self) -> anyhow::Result<()> {
        if let Some(status) = self.proc.try_wait()? {
            return Err(anyhow!("manager exited early: {:?}", status));
        }
        Ok(())
    }

    /// Dial in the way a grid worker would.
    pub fn connect(&self) -> anyhow::Result<TcpStream> {
        TcpStream::connect(("127.0.0.1", self.port)).context("dialing the manager")
    }

    /// Type an operator command at the manager's stdin prompt.
    pub fn operator_command(&mut self, line: &str) -> anyhow::Result<()> {
        let stdin = self.proc.stdin.as_mut().ok_or_else(|| anyhow!("no stdin handle"))?;
        writeln!(stdin, "{}", line)?;
        stdin.flush()?;
        Ok(())
    }

    /// Where the manager plug-in's cwd is, so tests can read files the
    /// script writes.
    pub fn plugin_cwd(&self) -> PathBuf {
        self.data_dir.join("manager")
    }
}

impl Drop for ManagerProc {
    fn drop(&mut self) {
        let _ = self.proc.kill();
        let _ = self.proc.wait();
    }
}

/// A `gridpool worker` subprocess. Killed on drop.
pub struct WorkerProc {
    pub proc: Child,
    pub tmp_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
    _local_tmp_dir: tempfile::TempDir,
}

impl WorkerProc {
    /// Spawn a worker pointed at the given local port.
    pub fn new(port: u16, keep_alive_ms: u64) -> anyhow::Result<WorkerProc> {
        let local_tmp_dir = tempfile::Builder::new()
            .prefix("gridpool-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;
        let tmp_dir = local_tmp_dir.path().to_path_buf();
        let data_dir = tmp_dir.join("data");
        let log_file = tmp_dir.join("worker.log");

        let config_file = tmp_dir.join("config.toml");
        fs::write(
            &config_file,
            format!(
                "keep_alive_interval_ms = {}\nconnect_timeout_ms = 2000\nreconnect_timeout_ms = 200\n",
                keep_alive_ms
            ),
        )?;

        eprintln!("spawning worker proc with log {:?}", &log_file);
        let proc = Command::new(gridpool_bin())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--config-file")
            .arg(&config_file)
            .arg("--data-dir")
            .arg(&data_dir)
            .arg("worker")
            .arg("--server-ip")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .spawn()
            .context("spawning worker process")?;

        Ok(WorkerProc { proc, tmp_dir, data_dir, log_file, _local_tmp_dir: local_tmp_dir })
    }

    /// Where the worker plug-in's cwd is once an attach has installed it.
    pub fn plugin_cwd(&self) -> PathBuf {
        self.data_dir.join("worker")
    }
}

impl Drop for WorkerProc {
    fn drop(&mut self) {
        let _ = self.proc.kill();
        let _ = self.proc.wait();
    }
}
