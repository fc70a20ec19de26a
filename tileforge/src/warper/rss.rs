//! Resident-set-size probing for worker processes.

/// RSS of a process in bytes, read from `/proc/<pid>/statm`.
///
/// Returns `None` when the process is gone or the platform has no
/// procfs.
pub fn rss_bytes(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages * page_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_rss_is_positive() {
        let rss = rss_bytes(std::process::id());
        // procfs may be absent on exotic platforms; when present the
        // running test process must have nonzero RSS
        if let Some(rss) = rss {
            assert!(rss > 0);
        }
    }

    #[test]
    fn test_missing_pid_is_none() {
        assert!(rss_bytes(u32::MAX - 1).is_none());
    }
}
