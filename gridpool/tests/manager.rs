use std::net::TcpStream;

use anyhow::Context;
use gridpool_protocol::DataPacketType;
use ntest::timeout;

mod support;

use crate::support::ManagerProc;

/// A manager plug-in that records every command it is handed and
/// answers each worker-in-grid with one work item for that worker.
const MANAGER_SCRIPT: &str = r#"echo '$stm|manager online'
while IFS= read -r line; do
  echo "$line" >> cmds.txt
  case "$line" in
    '$wig|'*)
      id=${line#'$wig|'}
      id=${id%%|*}
      printf '$wd|%s|ping|1\n' "$id"
      ;;
    '$tc|quit')
      exit 7
      ;;
  esac
done"#;

/// Drive the worker side of the attach handshake by hand and hand
/// back the connected socket plus the id the manager knows us by.
fn attach(mgr: &ManagerProc, expected_payload: &[u8]) -> anyhow::Result<(TcpStream, String)> {
    let mut conn = mgr.connect()?;
    let my_id = conn.local_addr()?.to_string();

    let (type_id, payload) = support::recv_frame(&mut conn).context("reading attach frame")?;
    assert_eq!(type_id, DataPacketType::GridAttach as u16);
    assert_eq!(payload, expected_payload, "attach should carry the cached worker payload");

    support::send_frame(
        &mut conn,
        DataPacketType::GridWorkerReady as u16,
        &support::encode_args(&["8"]),
    )?;

    Ok((conn, my_id))
}

#[test]
#[timeout(60000)]
fn attach_then_relay_round_trip() -> anyhow::Result<()> {
    let worker_payload = support::plugin_zip("worker.exe", "");
    let mgr = ManagerProc::new(MANAGER_SCRIPT, &worker_payload, 300_000)
        .context("starting manager proc")?;

    let (mut conn, my_id) = attach(&mgr, &worker_payload)?;

    // the plug-in was told about us, capacity included
    support::wait_for_line(
        mgr.plugin_cwd().join("cmds.txt"),
        &format!("$wig|{}|8", my_id),
    )?;

    // and its reply work item comes back addressed to us, with the
    // whole argument list on the wire
    let (type_id, payload) = support::recv_frame(&mut conn)?;
    assert_eq!(type_id, DataPacketType::WorkerData as u16);
    let args = support::decode_args(&payload)?;
    assert_eq!(args, vec![my_id.clone(), String::from("ping"), String::from("1")]);

    // data flowing the other way gets our id glued on the front
    support::send_frame(
        &mut conn,
        DataPacketType::WorkerData as u16,
        &support::encode_args(&["result", "99"]),
    )?;
    support::wait_for_line(
        mgr.plugin_cwd().join("cmds.txt"),
        &format!("$wd|{}|result|99", my_id),
    )?;

    Ok(())
}

#[test]
#[timeout(60000)]
fn plugin_exit_broadcasts_worker_exit() -> anyhow::Result<()> {
    let worker_payload = support::plugin_zip("worker.exe", "");
    let mut mgr = ManagerProc::new(MANAGER_SCRIPT, &worker_payload, 300_000)
        .context("starting manager proc")?;

    let (mut conn, my_id) = attach(&mgr, &worker_payload)?;
    support::wait_for_line(mgr.plugin_cwd().join("cmds.txt"), "$wig")?;

    // the operator types quit, the plug-in exits with code 7
    mgr.operator_command("quit")?;
    support::wait_for_line(&mgr.log_file, "Exit-Code:7")?;

    // every attached worker is handed an exit packet carrying its own id
    loop {
        let (type_id, payload) = support::recv_frame(&mut conn)?;
        if type_id == DataPacketType::WorkerExit as u16 {
            let args = support::decode_args(&payload)?;
            assert_eq!(args, vec![my_id]);
            break;
        }
    }

    Ok(())
}

#[test]
#[timeout(60000)]
fn forwarded_log_packets_surface_in_the_log() -> anyhow::Result<()> {
    let worker_payload = support::plugin_zip("worker.exe", "");
    let mgr = ManagerProc::new(MANAGER_SCRIPT, &worker_payload, 300_000)
        .context("starting manager proc")?;

    let (mut conn, my_id) = attach(&mgr, &worker_payload)?;

    // a LOG packet: source=worker process, type=error
    support::send_frame(
        &mut conn,
        DataPacketType::Log as u16,
        &support::encode_args(&["3", "2", "boom from afar"]),
    )?;

    // surfaced with the worker id prefixed
    support::wait_for_line(&mgr.log_file, &format!("({})boom from afar", my_id))?;
    Ok(())
}

#[test]
#[timeout(60000)]
fn hangup_reaches_the_plugin_as_wog() -> anyhow::Result<()> {
    let worker_payload = support::plugin_zip("worker.exe", "");
    let mgr = ManagerProc::new(MANAGER_SCRIPT, &worker_payload, 300_000)
        .context("starting manager proc")?;

    let (conn, my_id) = attach(&mgr, &worker_payload)?;
    support::wait_for_line(mgr.plugin_cwd().join("cmds.txt"), "$wig")?;

    drop(conn); // the worker vanishes

    support::wait_for_line(mgr.plugin_cwd().join("cmds.txt"), &format!("$wog|{}", my_id))?;
    Ok(())
}

#[test]
#[timeout(60000)]
fn heartbeats_flow_to_attached_workers() -> anyhow::Result<()> {
    let worker_payload = support::plugin_zip("worker.exe", "");
    // a keep-alive short enough to observe
    let mgr = ManagerProc::new(MANAGER_SCRIPT, &worker_payload, 100)
        .context("starting manager proc")?;

    let (mut conn, _my_id) = attach(&mgr, &worker_payload)?;

    loop {
        let (type_id, payload) = support::recv_frame(&mut conn)?;
        if type_id == DataPacketType::Heartbeat as u16 {
            // the payload is a wall-clock ms timestamp in decimal
            let ts: i64 = String::from_utf8(payload)?.parse()?;
            assert!(ts > 0);
            break;
        }
    }
    Ok(())
}
