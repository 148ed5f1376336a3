//! Daemonization (spec §6): double-fork into the background unless
//! `--no-daemon`/`--testing` is passed or the config disables it, plus
//! dropping privileges to `run-as` once the listening socket is bound.

use std::ffi::CString;

use nix::unistd::{self, ForkResult, Gid, Uid};

/// Double-forks the process into the background. Must be called
/// before any threads are spawned — `fork()` only duplicates the
/// calling thread, so a multi-threaded process forking is unsound.
pub fn daemonize() -> std::io::Result<()> {
    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
    }

    unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

    match unsafe { unistd::fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
    }

    unistd::chdir("/").map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    redirect_standard_fds()?;
    Ok(())
}

fn redirect_standard_fds() -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let dev_null = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let fd = dev_null.as_raw_fd();
    unsafe {
        libc::dup2(fd, libc::STDIN_FILENO);
        libc::dup2(fd, libc::STDOUT_FILENO);
        libc::dup2(fd, libc::STDERR_FILENO);
    }
    Ok(())
}

/// Drops to the `run-as` user (spec §6's `run-as` key), looking up its
/// uid/gid via the system passwd database. Only the listening socket
/// needs root (to bind low ports); everything after that runs
/// unprivileged.
pub fn drop_privileges(user: &str) -> std::io::Result<()> {
    let name = CString::new(user).map_err(|_| std::io::Error::other("invalid run-as user name"))?;
    let passwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if passwd.is_null() {
        return Err(std::io::Error::other(format!("unknown run-as user: {user}")));
    }
    let (uid, gid) = unsafe { ((*passwd).pw_uid, (*passwd).pw_gid) };

    unistd::setgid(Gid::from_raw(gid)).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    unistd::setuid(Uid::from_raw(uid)).map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    Ok(())
}
