//! Port conflict detection and recovery.
//!
//! [`probe_port`] is a bind-then-close check run before the real bind. The
//! port can still be taken between the probe and the bind; the real bind's
//! error is the one that counts.
use crate::{Error, Result};
use std::{
    io::ErrorKind,
    net::{SocketAddr, TcpListener},
    process::Command,
};

/// Never terminated: the idle process, init, the Windows `System` process.
const PROTECTED_PIDS: [u32; 3] = [0, 1, 4];

/// Classifies a bind failure on `port`.
pub(crate) fn bind_error(port: u16, e: std::io::Error) -> Error {
    match e.kind() {
        ErrorKind::AddrInUse | ErrorKind::PermissionDenied => Error::PortBindConflict { port },
        _ => Error::ServerRuntime(format!("bind to port {port} failed: {e}")),
    }
}

/// Checks that `addr` can currently be bound.
pub fn probe_port(addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).map_err(|e| bind_error(addr.port(), e))?;
    drop(listener);
    Ok(())
}

/// Socket inodes listening on `port` in a `/proc/net/tcp{,6}` table.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
pub fn parse_proc_net_tcp(table: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let (_, local_port) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(local_port, 16).ok()?;
            if local_port != port || *fields.get(3)? != TCP_LISTEN {
                return None;
            }
            fields.get(9)?.parse().ok()
        })
        .collect()
}

/// PIDs listening on `port` in `netstat -ano` output.
#[cfg_attr(not(windows), allow(dead_code))]
pub fn parse_netstat(output: &str, port: u16) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 5 || !fields[0].eq_ignore_ascii_case("TCP") {
                return None;
            }
            let (_, local_port) = fields[1].rsplit_once(':')?;
            let listening = fields[3] == "LISTENING" || fields[2].ends_with(":0");
            if local_port.parse::<u16>().ok()? != port || !listening {
                return None;
            }
            fields[4].parse().ok()
        })
        .collect()
}

/// PIDs in `lsof -t` output, one per line.
#[cfg_attr(any(windows, target_os = "linux"), allow(dead_code))]
pub fn parse_lsof(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

#[cfg(target_os = "linux")]
fn find_listeners(port: u16) -> Result<Vec<u32>> {
    use std::{collections::HashSet, fs};

    let mut inodes = HashSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match fs::read_to_string(table) {
            Ok(text) => inodes.extend(parse_proc_net_tcp(&text, port)),
            Err(e) => debug!("skipping {table}: {e}"),
        }
    }
    if inodes.is_empty() {
        return Ok(Vec::new());
    }

    let mut pids = Vec::new();
    for entry in fs::read_dir("/proc")?.filter_map(|e| e.ok()) {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        // Other users' processes can't be inspected without privileges
        let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let owns_socket = fds.filter_map(|fd| fd.ok()).any(|fd| {
            fs::read_link(fd.path())
                .ok()
                .and_then(|target| {
                    let target = target.to_str()?.strip_prefix("socket:[")?;
                    target.strip_suffix(']')?.parse::<u64>().ok()
                })
                .is_some_and(|inode| inodes.contains(&inode))
        });
        if owns_socket {
            pids.push(pid);
        }
    }
    Ok(pids)
}

#[cfg(windows)]
fn find_listeners(port: u16) -> Result<Vec<u32>> {
    let out = Command::new("netstat").args(["-ano", "-p", "TCP"]).output()?;
    let mut pids = parse_netstat(&String::from_utf8_lossy(&out.stdout), port);
    let out = Command::new("netstat").args(["-ano", "-p", "TCPv6"]).output()?;
    pids.extend(parse_netstat(&String::from_utf8_lossy(&out.stdout), port));
    Ok(pids)
}

#[cfg(not(any(windows, target_os = "linux")))]
fn find_listeners(port: u16) -> Result<Vec<u32>> {
    let out = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
        .output()?;
    Ok(parse_lsof(&String::from_utf8_lossy(&out.stdout)))
}

/// PIDs of processes with a listening TCP socket on `port`.
pub fn listening_pids(port: u16) -> Result<Vec<u32>> {
    let mut pids = find_listeners(port)?;
    pids.sort_unstable();
    pids.dedup();
    Ok(pids)
}

fn is_protected(pid: u32) -> bool {
    PROTECTED_PIDS.contains(&pid) || pid == std::process::id()
}

fn terminate(pid: u32) -> std::io::Result<bool> {
    #[cfg(windows)]
    let status = Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .status()?;
    #[cfg(not(windows))]
    let status = Command::new("kill").args(["-9", &pid.to_string()]).status()?;
    Ok(status.success())
}

/// Force-terminates every process listening on `port`, except protected
/// system processes and this one.
///
/// Destructive: only run on explicit operator request. Returns the PIDs
/// that were terminated.
pub fn kill_port_owners(port: u16) -> Result<Vec<u32>> {
    let mut killed = Vec::new();
    for pid in listening_pids(port)? {
        if is_protected(pid) {
            warn!(pid, "not terminating protected process holding port {port}");
            continue;
        }
        match terminate(pid) {
            Ok(true) => {
                info!(pid, "terminated process holding port {port}");
                killed.push(pid);
            }
            Ok(false) => warn!(pid, "failed to terminate process"),
            Err(e) => warn!(pid, "failed to terminate process: {e}"),
        }
    }
    Ok(killed)
}
