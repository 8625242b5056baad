//! Signal names and process-group delivery

use sandboxd_utils::{Result, SandboxError};
use tracing::trace;

const SIGNALS: &[(&str, i32)] = &[
    ("SIGHUP", libc::SIGHUP),
    ("SIGINT", libc::SIGINT),
    ("SIGQUIT", libc::SIGQUIT),
    ("SIGKILL", libc::SIGKILL),
    ("SIGUSR1", libc::SIGUSR1),
    ("SIGUSR2", libc::SIGUSR2),
    ("SIGTERM", libc::SIGTERM),
];

/// Parse `SIGTERM`, `TERM`, `term` or `15`
pub fn parse_signal(name: &str) -> Result<i32> {
    let trimmed = name.trim();
    if let Ok(number) = trimmed.parse::<i32>() {
        if SIGNALS.iter().any(|(_, n)| *n == number) {
            return Ok(number);
        }
        return Err(SandboxError::InvalidSignal(name.to_string()));
    }

    let upper = trimmed.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };

    SIGNALS
        .iter()
        .find(|(n, _)| *n == full)
        .map(|(_, number)| *number)
        .ok_or_else(|| SandboxError::InvalidSignal(name.to_string()))
}

pub fn signal_name(signal: i32) -> Option<&'static str> {
    SIGNALS
        .iter()
        .find(|(_, n)| *n == signal)
        .map(|(name, _)| *name)
}

/// Deliver `signal` to every member of the group led by `pid`
///
/// Returns false when the group no longer exists.
pub(crate) fn signal_process_group(pid: u32, signal: i32) -> bool {
    let pgid = pid as libc::pid_t;
    if pgid <= 0 {
        return false;
    }

    // SAFETY: kill(2) with a negative pid targets the process group; no memory is involved
    let rc = unsafe { libc::kill(-pgid, signal) };
    if rc == 0 {
        trace!(pgid = pgid, signal = signal, "Signalled process group");
        return true;
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return false;
    }

    // EPERM and friends: fall back to the leader alone
    // SAFETY: as above
    unsafe { libc::kill(pgid, signal) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_names() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), libc::SIGTERM);
        assert_eq!(parse_signal("TERM").unwrap(), libc::SIGTERM);
        assert_eq!(parse_signal("kill").unwrap(), libc::SIGKILL);
        assert_eq!(parse_signal("SIGINT").unwrap(), libc::SIGINT);
        assert_eq!(parse_signal("9").unwrap(), libc::SIGKILL);
    }

    #[test]
    fn test_parse_signal_rejects_unknown() {
        assert!(matches!(
            parse_signal("SIGBOGUS"),
            Err(SandboxError::InvalidSignal(_))
        ));
        assert!(parse_signal("999").is_err());
        assert!(parse_signal("").is_err());
    }

    #[test]
    fn test_signal_name() {
        assert_eq!(signal_name(libc::SIGKILL), Some("SIGKILL"));
        assert_eq!(signal_name(0), None);
    }

    #[test]
    fn test_signal_missing_group() {
        // Group ids this large are never allocated
        assert!(!signal_process_group(i32::MAX as u32 - 1, 0));
    }
}
