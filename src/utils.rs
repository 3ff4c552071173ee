//! Utility functions for process management and file placement.

use nix::sys::signal::{kill, Signal};
use nix::unistd::{chown, Gid, Pid, Uid};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Check if a process is alive by inspecting /proc/{pid}/stat.
///
/// A zombie counts as dead: it no longer runs and only waits to be reaped.
pub fn is_process_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // Format: "pid (comm) S ..."; comm may contain spaces and parens.
        Ok(stat) => match stat.rfind(')') {
            Some(pos) => !stat[pos + 1..].trim_start().starts_with('Z'),
            None => true,
        },
        Err(_) => false,
    }
}

/// SIGTERM, wait up to `timeout` for the process to go away, then SIGKILL.
///
/// Returns `true` once the process is gone, `false` if it survived SIGKILL for
/// another `timeout`.
pub async fn graceful_kill_async(pid: u32, timeout: Duration) -> bool {
    let target = Pid::from_raw(pid as i32);
    let _ = kill(target, Signal::SIGTERM);
    if wait_for_exit(pid, timeout).await {
        return true;
    }

    debug!(pid, "process ignored SIGTERM, sending SIGKILL");
    let _ = kill(target, Signal::SIGKILL);
    wait_for_exit(pid, timeout).await
}

/// Poll every 100ms until the process is gone or `timeout` elapses.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let interval = Duration::from_millis(100);
    let iterations = (timeout.as_millis() / 100).max(1);

    for _ in 0..iterations {
        if !is_process_alive(pid) {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    !is_process_alive(pid)
}

/// Place `src` at `dest` as a hard link (`ln -f` semantics), copying instead
/// when the two sit on different filesystems.
pub fn link_or_copy(src: &Path, dest: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    match std::fs::hard_link(src, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            std::fs::copy(src, dest).map(|_| ())
        }
        Err(e) => Err(e),
    }
}

/// chown to the jailer's identity
pub fn chown_to(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_process_alive_current_process() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_is_process_alive_nonexistent() {
        // PID 4294967295 (u32::MAX) is extremely unlikely to exist
        assert!(!is_process_alive(u32::MAX));
    }

    #[tokio::test]
    async fn test_graceful_kill_terminates_sleep() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert!(is_process_alive(pid));

        // Reap concurrently so the zombie disappears from /proc.
        let reaper = tokio::spawn(async move { child.wait().await });
        assert!(graceful_kill_async(pid, Duration::from_secs(2)).await);
        let status = reaper.await.unwrap().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_link_or_copy_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.img");
        let dest = dir.path().join("dest.img");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dest, b"old").unwrap();

        link_or_copy(&src, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"new");

        // Hard link: both names point at the same inode.
        use std::os::unix::fs::MetadataExt;
        assert_eq!(
            std::fs::metadata(&src).unwrap().ino(),
            std::fs::metadata(&dest).unwrap().ino()
        );
    }
}
