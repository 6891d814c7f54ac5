use std::{
    io::Read as _,
    net::{TcpListener, TcpStream},
    time,
};

use anyhow::Context;
use gridpool_protocol::DataPacketType;
use ntest::timeout;

mod support;

use crate::support::WorkerProc;

/// Accept the worker's dial-in on our fake manager socket.
fn accept_worker(listener: &TcpListener) -> anyhow::Result<(TcpStream, String)> {
    let (conn, _) = listener.accept().context("accepting the worker")?;
    let worker_id = conn.peer_addr()?.to_string();
    Ok((conn, worker_id))
}

/// Ship an archive and wait for the ready report, skipping any LOG
/// packets the freshly booted plug-in forwards up.
fn attach_with(conn: &mut TcpStream, archive: &[u8]) -> anyhow::Result<u32> {
    support::send_frame(conn, DataPacketType::GridAttach as u16, archive)?;
    loop {
        let (type_id, payload) = support::recv_frame(conn)?;
        match type_id {
            t if t == DataPacketType::GridWorkerReady as u16 => {
                let args = support::decode_args(&payload)?;
                assert_eq!(args.len(), 1);
                return Ok(args[0].parse::<u32>()?);
            }
            t if t == DataPacketType::Log as u16 => continue,
            other => anyhow::bail!("unexpected packet type {}", other),
        }
    }
}

#[test]
#[timeout(60000)]
fn attach_installs_boots_and_relays() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let wkr = WorkerProc::new(port, 300_000).context("starting worker proc")?;

    let (mut conn, worker_id) = accept_worker(&listener)?;

    let archive = support::plugin_zip(
        "worker.exe",
        r#"echo '$log|3|0|worker plug-in online'
while IFS= read -r line; do echo "$line" >> seen.txt; done"#,
    );
    let capacity = attach_with(&mut conn, &archive)?;
    assert!(capacity >= 1, "the ready report advertises at least one thread");

    // the attach landed on disk: cached archive plus unpacked install
    assert!(wkr.data_dir.join("worker.zip").exists());
    assert!(wkr.plugin_cwd().join("worker.exe").exists());

    // work items get their id prefix stripped before the plug-in
    // sees them
    support::send_frame(
        &mut conn,
        DataPacketType::WorkerData as u16,
        &support::encode_args(&[&worker_id, "job", "42"]),
    )?;
    support::wait_for_line(wkr.plugin_cwd().join("seen.txt"), "$wd|job|42")?;

    Ok(())
}

#[test]
#[timeout(60000)]
fn bad_archive_comes_back_as_a_log_packet() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let wkr = WorkerProc::new(port, 300_000).context("starting worker proc")?;

    let (mut conn, _) = accept_worker(&listener)?;

    support::send_frame(&mut conn, DataPacketType::GridAttach as u16, b"this is not a zip")?;

    let (type_id, payload) = support::recv_frame(&mut conn)?;
    assert_eq!(type_id, DataPacketType::Log as u16);
    let args = support::decode_args(&payload)?;
    assert_eq!(args.len(), 3);
    assert_eq!(args[1], "2", "attach failures report at error severity");
    assert!(args[2].contains("Archive error!"));

    // failure leaves no installation behind
    assert!(!wkr.plugin_cwd().exists());
    Ok(())
}

#[test]
#[timeout(60000)]
fn silent_manager_triggers_a_reconnect() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let _wkr = WorkerProc::new(port, 100).context("starting worker proc")?;

    // first dial: say nothing at all
    let (mut conn1, _) = accept_worker(&listener)?;

    // after two silent keep-alive ticks the worker hangs up on us
    conn1.set_read_timeout(Some(time::Duration::from_secs(30)))?;
    let mut buf = [0u8; 1];
    let nread = conn1.read(&mut buf)?;
    assert_eq!(nread, 0, "expected a hangup");

    // and then dials right back in
    let (_conn2, _) = accept_worker(&listener)?;
    Ok(())
}

#[test]
#[timeout(60000)]
fn plugin_exit_is_reported_upstream_with_the_worker_id() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    let _wkr = WorkerProc::new(port, 300_000).context("starting worker proc")?;

    let (mut conn, worker_id) = accept_worker(&listener)?;

    // a plug-in that does one status update and finishes with code 5
    let archive = support::plugin_zip("worker.exe", "echo '$stm|done already'; exit 5");
    attach_with(&mut conn, &archive)?;

    loop {
        let (type_id, payload) = support::recv_frame(&mut conn)?;
        if type_id == DataPacketType::WorkerExit as u16 {
            let args = support::decode_args(&payload)?;
            // [worker_id, exit_code, exit_status]
            assert_eq!(
                args,
                vec![worker_id, String::from("5"), String::from("0")]
            );
            break;
        }
    }
    Ok(())
}
