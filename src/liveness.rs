//! Local process liveness probing.

/// Reports whether a process on this host is still running.
pub trait ProcessLiveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes with a null signal (`kill(pid, 0)`).
///
/// Only "no such process" counts as dead; any other failure (for example
/// permission denied) means something is running under that pid.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalLiveness;

#[cfg(unix)]
impl ProcessLiveness for SignalLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };

        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(_) => true,
        }
    }
}

#[cfg(not(unix))]
impl ProcessLiveness for SignalLiveness {
    fn is_alive(&self, _pid: u32) -> bool {
        // Without a probe, assume the process is running.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(SignalLiveness.is_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_reaped_child_is_dead() {
        let mut child = std::process::Command::new("true")
            .spawn()
            .expect("spawn `true`");
        let pid = child.id();
        child.wait().expect("wait for `true`");

        assert!(!SignalLiveness.is_alive(pid));
    }
}
