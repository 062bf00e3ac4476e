/// Checks whether a PID maps to a live process.
///
/// Uses `kill(pid, 0)`, which probes for existence without delivering a
/// signal. `EPERM` means the process exists but belongs to another
/// user, which still counts as alive for status derivation.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
