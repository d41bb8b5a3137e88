//! Liveness checks and signals for the pid recorded by the server lifecycle
//! commands. Everything here takes a raw pid; ownership checks live with
//! the pid-file logic in `start`.

use std::{
    thread,
    time::{Duration, Instant},
};

pub use imp::{is_alive, request_stop};

#[cfg(unix)]
pub use imp::force_kill;

/// Block until the process exits or `timeout` elapses. Returns `true` once
/// the pid is gone.
pub fn await_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while is_alive(pid) {
        if Instant::now() >= deadline {
            return !is_alive(pid);
        }
        thread::sleep(Duration::from_millis(50));
    }
    true
}

#[cfg(unix)]
mod imp {
    use std::io;

    use anyhow::{Result, anyhow};

    fn send_signal(pid: u32, signal: i32) -> io::Result<()> {
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Signal 0 checks for existence without touching the process. EPERM
    /// still means "alive", just not ours.
    pub fn is_alive(pid: u32) -> bool {
        match send_signal(pid, 0) {
            Ok(()) => true,
            Err(err) => err.raw_os_error() != Some(libc::ESRCH),
        }
    }

    pub fn request_stop(pid: u32) -> Result<()> {
        match send_signal(pid, libc::SIGTERM) {
            Ok(()) => Ok(()),
            // Already gone is as good as stopped.
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => Ok(()),
            Err(err) => Err(anyhow!("failed to send SIGTERM to pid {pid}: {err}")),
        }
    }

    pub fn force_kill(pid: u32) -> Result<()> {
        match send_signal(pid, libc::SIGKILL) {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => Ok(()),
            Err(err) => Err(anyhow!("failed to send SIGKILL to pid {pid}: {err}")),
        }
    }
}

#[cfg(windows)]
mod imp {
    use anyhow::{Result, anyhow};
    use windows_sys::Win32::{
        Foundation::CloseHandle,
        System::Threading::{
            OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE, TerminateProcess,
        },
    };

    pub fn is_alive(pid: u32) -> bool {
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if handle == 0 {
                return false;
            }
            CloseHandle(handle);
            true
        }
    }

    pub fn request_stop(pid: u32) -> Result<()> {
        unsafe {
            let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
            if handle == 0 {
                return Err(anyhow!("failed to open process {pid} for termination"));
            }
            let terminated = TerminateProcess(handle, 0);
            CloseHandle(handle);
            if terminated == 0 {
                return Err(anyhow!("failed to terminate process {pid}"));
            }
        }
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
mod imp {
    use anyhow::{Result, anyhow};

    pub fn is_alive(_pid: u32) -> bool {
        false
    }

    pub fn request_stop(pid: u32) -> Result<()> {
        Err(anyhow!(
            "process control is not supported on this platform (pid {pid})"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_current_process_is_alive() {
        let own_pid = std::process::id();
        assert!(is_alive(own_pid));
        // We are not going to exit while waiting on ourselves.
        assert!(!await_exit(own_pid, Duration::from_millis(20)));
    }
}
