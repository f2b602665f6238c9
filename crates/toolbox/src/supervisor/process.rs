//! OS process plumbing: liveness probes, process trees, detached spawning and
//! tree termination.

use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::process::Command;
use tokio::time::Instant;

use super::launch::Invocation;
use crate::error::{ToolboxError, ToolboxResult};

/// Result of probing a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Alive,
    /// Never existed, exited, or a zombie awaiting reaping.
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// View of the host process table.
pub trait ProcessTable: Send + Sync + std::fmt::Debug {
    fn probe(&self, pid: u32) -> io::Result<ProcessState>;

    /// All transitive children of `pid`, parents before children.
    fn descendants(&self, pid: u32) -> io::Result<Vec<u32>>;

    /// Deliver `signal` to one process. A missing process is not an error.
    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()>;

    /// Deliver `signal` to a process group. A missing group is not an error.
    fn signal_group(&self, pgid: u32, signal: Signal) -> io::Result<()>;
}

/// [`ProcessTable`] backed by `kill(2)` and `/proc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessTable;

fn to_pid(pid: u32) -> io::Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(raw),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid pid {pid}"),
        )),
    }
}

/// `(state, ppid)` from the contents of `/proc/<pid>/stat`.
fn parse_stat(stat: &str) -> Option<(char, u32)> {
    // comm may contain spaces and parentheses; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((state, ppid))
}

fn send(pid: libc::pid_t, signal: Signal, group: bool) -> io::Result<()> {
    // SAFETY: plain syscalls on a validated positive pid.
    let rc = unsafe {
        if group {
            libc::killpg(pid, signal.as_raw())
        } else {
            libc::kill(pid, signal.as_raw())
        }
    };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

impl ProcessTable for OsProcessTable {
    fn probe(&self, pid: u32) -> io::Result<ProcessState> {
        let raw = to_pid(pid)?;
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => {
                return Ok(match parse_stat(&stat) {
                    Some(('Z' | 'X' | 'x', _)) => ProcessState::Gone,
                    _ => ProcessState::Alive,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && Path::new("/proc/self").exists() => {
                return Ok(ProcessState::Gone);
            }
            Err(_) => {}
        }

        // No procfs: fall back to the existence check.
        // SAFETY: signal 0 only checks existence and permissions.
        if unsafe { libc::kill(raw, 0) } == 0 {
            return Ok(ProcessState::Alive);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(ProcessState::Gone),
            Some(libc::EPERM) => Ok(ProcessState::Alive),
            _ => Err(err),
        }
    }

    fn descendants(&self, pid: u32) -> io::Result<Vec<u32>> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for entry in std::fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let Some(child) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok())
            else {
                continue;
            };
            // Processes can vanish mid-scan.
            let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
                continue;
            };
            if let Some((_, ppid)) = parse_stat(&stat) {
                children.entry(ppid).or_default().push(child);
            }
        }

        let mut found = Vec::new();
        let mut queue = VecDeque::from([pid]);
        while let Some(parent) = queue.pop_front() {
            for &child in children.get(&parent).into_iter().flatten() {
                if child != pid && !found.contains(&child) {
                    found.push(child);
                    queue.push_back(child);
                }
            }
        }
        Ok(found)
    }

    fn signal(&self, pid: u32, signal: Signal) -> io::Result<()> {
        send(to_pid(pid)?, signal, false)
    }

    fn signal_group(&self, pgid: u32, signal: Signal) -> io::Result<()> {
        send(to_pid(pgid)?, signal, true)
    }
}

/// Start `invocation` in its own process group with output appended to the
/// given log files. The child outlives the caller's future; a background
/// task reaps it when it exits.
pub fn spawn_detached(
    name: &str,
    invocation: &Invocation,
    stdout_log: &Path,
    stderr_log: &Path,
) -> ToolboxResult<u32> {
    let spawn_err = |source: io::Error| ToolboxError::ProcessSpawnFailure {
        name: name.to_string(),
        source,
    };

    if let Some(dir) = stdout_log.parent() {
        std::fs::create_dir_all(dir).map_err(spawn_err)?;
    }
    let open_log = |path: &Path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(spawn_err)
    };
    let stdout = open_log(stdout_log)?;
    let stderr = open_log(stderr_log)?;

    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .process_group(0)
        .kill_on_drop(false);
    if let Some(dir) = &invocation.cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in &invocation.env {
        cmd.env(key, value);
    }

    debug!("Spawning {}: {}", name, invocation);
    let mut child = cmd.spawn().map_err(spawn_err)?;
    let Some(pid) = child.id() else {
        return Err(spawn_err(io::Error::other("child exited before its pid was read")));
    };

    let service = name.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => info!("{} (PID {}) exited: {}", service, pid, status),
            Err(e) => warn!("Error waiting for {} (PID {}): {:?}", service, pid, e),
        }
    });

    info!("{} spawned with PID {}", name, pid);
    Ok(pid)
}

/// How a termination request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing was running.
    AlreadyGone,
    /// Exited after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Killed,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2);

/// Terminate `pid`, its descendants and its process group.
///
/// SIGTERM first; survivors of `grace` get SIGKILL. Fails only if some
/// member of the tree is still alive after that.
pub async fn terminate_tree(
    processes: Arc<dyn ProcessTable>,
    name: &str,
    pid: u32,
    grace: Duration,
) -> ToolboxResult<Termination> {
    let failure = |reason: String| ToolboxError::ProcessTerminationFailure {
        name: name.to_string(),
        pid,
        reason,
    };

    if processes.probe(pid).map_err(|e| failure(e.to_string()))? == ProcessState::Gone {
        debug!("{} (PID {}) already gone", name, pid);
        return Ok(Termination::AlreadyGone);
    }

    let table = processes.clone();
    let mut tree = tokio::task::spawn_blocking(move || table.descendants(pid))
        .await
        .map_err(|e| failure(e.to_string()))?
        .unwrap_or_else(|e| {
            warn!("Could not list children of {} (PID {}): {}", name, pid, e);
            Vec::new()
        });
    tree.insert(0, pid);
    info!("Stopping {} (PID {}, {} processes)", name, pid, tree.len());

    broadcast(processes.as_ref(), pid, &tree, Signal::Term);
    if wait_for_exit(processes.as_ref(), &mut tree, grace).await {
        return Ok(Termination::Graceful);
    }

    warn!(
        "{} (PID {}) still has {} live processes after {:?}, sending SIGKILL",
        name,
        pid,
        tree.len(),
        grace
    );
    broadcast(processes.as_ref(), pid, &tree, Signal::Kill);
    if wait_for_exit(processes.as_ref(), &mut tree, KILL_CONFIRM_TIMEOUT).await {
        return Ok(Termination::Killed);
    }

    Err(failure(format!("processes {tree:?} survived SIGKILL")))
}

fn broadcast(processes: &dyn ProcessTable, pgid: u32, tree: &[u32], signal: Signal) {
    if let Err(e) = processes.signal_group(pgid, signal) {
        debug!("Group signal {:?} to {} failed: {}", signal, pgid, e);
    }
    for &member in tree {
        if let Err(e) = processes.signal(member, signal) {
            warn!("Signal {:?} to PID {} failed: {}", signal, member, e);
        }
    }
}

/// Poll until every pid in `tree` is gone. Survivors stay in `tree`.
async fn wait_for_exit(processes: &dyn ProcessTable, tree: &mut Vec<u32>, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        tree.retain(|&member| !matches!(processes.probe(member), Ok(ProcessState::Gone)));
        if tree.is_empty() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sleep_invocation(args: &[&str]) -> Invocation {
        Invocation::new("sleep").with_args(args.iter().copied())
    }

    #[test]
    fn test_parse_stat_handles_odd_comm() {
        let stat = "1234 (my (odd) proc) S 77 1234 1234 0 -1";
        assert_eq!(parse_stat(stat), Some(('S', 77)));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn test_probe_self_and_invalid_pid() {
        let table = OsProcessTable;
        assert_eq!(table.probe(std::process::id()).unwrap(), ProcessState::Alive);
        assert!(table.probe(0).is_err());
    }

    #[test]
    fn test_signal_missing_process_is_ok() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let table = OsProcessTable;
        assert!(table.signal(pid, Signal::Term).is_ok());
        assert_eq!(table.probe(pid).unwrap(), ProcessState::Gone);
    }

    #[tokio::test]
    async fn test_spawn_appends_to_logs() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("logs/echo.out");
        let err = dir.path().join("logs/echo.err");
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(&out, "previous\n").unwrap();

        let invocation = Invocation::new("sh").with_args(["-c", "echo hello; echo oops >&2"]);
        let pid = spawn_detached("echo", &invocation, &out, &err).unwrap();
        assert!(pid > 0);

        let table = OsProcessTable;
        let deadline = Instant::now() + Duration::from_secs(5);
        while table.probe(pid).unwrap() == ProcessState::Alive && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "previous\nhello\n");
        assert_eq!(std::fs::read_to_string(&err).unwrap(), "oops\n");
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let dir = TempDir::new().unwrap();
        let result = spawn_detached(
            "ghost",
            &Invocation::new("/nonexistent/binary"),
            &dir.path().join("ghost.out"),
            &dir.path().join("ghost.err"),
        );
        assert!(matches!(
            result,
            Err(ToolboxError::ProcessSpawnFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminate_tree_kills_children() {
        let dir = TempDir::new().unwrap();
        let invocation = Invocation::new("sh").with_args(["-c", "sleep 60 & sleep 60 & wait"]);
        let pid = spawn_detached(
            "tree",
            &invocation,
            &dir.path().join("tree.out"),
            &dir.path().join("tree.err"),
        )
        .unwrap();

        let table: Arc<dyn ProcessTable> = Arc::new(OsProcessTable);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut children = Vec::new();
        while children.len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            children = table.descendants(pid).unwrap();
        }
        assert_eq!(children.len(), 2);

        let outcome = terminate_tree(table.clone(), "tree", pid, Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(outcome, Termination::AlreadyGone);
        for child in children {
            assert_eq!(table.probe(child).unwrap(), ProcessState::Gone);
        }
        assert_eq!(table.probe(pid).unwrap(), ProcessState::Gone);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let pid = spawn_detached(
            "sleeper",
            &sleep_invocation(&["60"]),
            &dir.path().join("s.out"),
            &dir.path().join("s.err"),
        )
        .unwrap();
        let table: Arc<dyn ProcessTable> = Arc::new(OsProcessTable);

        terminate_tree(table.clone(), "sleeper", pid, Duration::from_secs(5))
            .await
            .unwrap();
        let again = terminate_tree(table, "sleeper", pid, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(again, Termination::AlreadyGone);
    }

    #[tokio::test]
    async fn test_sigterm_ignoring_process_gets_killed() {
        let dir = TempDir::new().unwrap();
        let invocation =
            Invocation::new("sh").with_args(["-c", "trap '' TERM; while true; do sleep 1; done"]);
        let pid = spawn_detached(
            "stubborn",
            &invocation,
            &dir.path().join("x.out"),
            &dir.path().join("x.err"),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let table: Arc<dyn ProcessTable> = Arc::new(OsProcessTable);
        let outcome = terminate_tree(table.clone(), "stubborn", pid, Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(outcome, Termination::Killed);
        assert_eq!(table.probe(pid).unwrap(), ProcessState::Gone);
    }
}
