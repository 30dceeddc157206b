//! Script Runner (§4.6): forks the shell helper, optionally behind a
//! pseudo-tty for line-prefixed output, multiplexes child I/O and signal
//! notifications, and collects the exit status.
//!
//! The self-pipe + poll pattern here uses the same direct `nix`/`libc`
//! process-control style as the rest of this crate; the pty allocation
//! follows the usual `openpty` FFI pattern.

use std::ffi::CString;
use std::io::Write;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, fork, pipe, ForkResult, Pid};
use tracing::warn;

use crate::error::ExecError;
use crate::prefixer::Prefixer;

static SIGHUP_FLAG: AtomicBool = AtomicBool::new(false);
static SIGCHLD_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static ABORT_SIGNAL: AtomicI32 = AtomicI32::new(0);
static FORWARD_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_sighup(_: i32) {
    SIGHUP_FLAG.store(true, Ordering::SeqCst);
    crate::control::note_sighup();
}

extern "C" fn handle_sigchld(_: i32) {
    let fd = SIGCHLD_WRITE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [0u8];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

extern "C" fn handle_forward_and_abort(sig: i32) {
    let pid = FORWARD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        unsafe {
            libc::kill(pid, sig);
        }
    }
    ABORT_SIGNAL.store(sig, Ordering::SeqCst);
}

/// Installs the signal handlers the Script Runner depends on: SIGHUP sets
/// the control-epoch flag; SIGCHLD notifies the self-pipe; SIGINT/SIGTERM/
/// SIGQUIT forward to the running child and mark an abort request.
pub fn install_signal_handlers() -> Result<(), ExecError> {
    unsafe {
        signal::signal(Signal::SIGHUP, SigHandler::Handler(handle_sighup))
    }
    .map_err(|e| resource_err("installing SIGHUP handler", e))?;

    unsafe {
        signal::signal(Signal::SIGCHLD, SigHandler::Handler(handle_sigchld))
    }
    .map_err(|e| resource_err("installing SIGCHLD handler", e))?;

    for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT] {
        unsafe { signal::signal(sig, SigHandler::Handler(handle_forward_and_abort)) }
            .map_err(|e| resource_err("installing forward/abort handler", e))?;
    }

    Ok(())
}

/// Returns the name of the signal that requested an abort, if any, and
/// resets the flag. Checked by the Lifecycle Engine after every `exec`.
pub fn take_abort_signal() -> Option<&'static str> {
    let raw = ABORT_SIGNAL.swap(0, Ordering::SeqCst);
    match raw {
        0 => None,
        s if s == Signal::SIGINT as i32 => Some("SIGINT"),
        s if s == Signal::SIGTERM as i32 => Some("SIGTERM"),
        s if s == Signal::SIGQUIT as i32 => Some("SIGQUIT"),
        _ => Some("unknown signal"),
    }
}

fn resource_err(context: &str, e: nix::Error) -> ExecError {
    ExecError::Resource {
        context: context.to_string(),
        source: std::io::Error::from_raw_os_error(e as i32),
    }
}

/// Locates the shell helper for `svc_dir`, preferring a service-local
/// script over the library fallback.
pub fn locate_helper(svc_dir: &Path, library_fallback: &Path) -> Option<PathBuf> {
    let local = svc_dir.join("runscript.sh");
    if local.exists() {
        Some(local)
    } else if library_fallback.exists() {
        Some(library_fallback.to_path_buf())
    } else {
        None
    }
}

/// Opens a pty pair, copying the parent's terminal attributes and window
/// size when the parent's stdout is a terminal. Returns `None` (not an
/// error) on allocation failure or when stdout isn't a tty, per §4.6 step 2
/// and §9 "pty-for-prefix is mandatory to fall back, not optional".
fn open_pty_if_tty() -> Option<(OwnedFd, OwnedFd)> {
    if unsafe { libc::isatty(libc::STDOUT_FILENO) } == 0 {
        return None;
    }

    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let mut term: libc::termios = unsafe { std::mem::zeroed() };
    let mut winsize: libc::winsize = unsafe { std::mem::zeroed() };

    unsafe {
        libc::tcgetattr(libc::STDOUT_FILENO, &mut term);
        libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut winsize);
    }

    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            &term,
            &winsize,
        )
    };

    if rc != 0 {
        warn!("pty allocation failed, proceeding without line prefixing");
        return None;
    }

    unsafe { Some((OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave))) }
}

/// Result of running the shell helper.
pub struct RunOutcome {
    pub success: bool,
}

/// `exec(action, arg2?)`: runs the shell helper for `svc` with `action` (and
/// an optional second action, for the atomic `stop`+`start` restart form),
/// optionally behind a pty with line prefixing, and returns true iff the
/// helper exits zero.
pub fn exec(
    helper: &Path,
    svc_path: &Path,
    action: &str,
    arg2: Option<&str>,
    prefix: Option<&str>,
) -> Result<RunOutcome, ExecError> {
    let (read_fd, write_fd) = pipe().map_err(|e| resource_err("creating self-pipe", e))?;
    SIGCHLD_WRITE_FD.store(write_fd.as_raw_fd(), Ordering::SeqCst);

    let pty = prefix.and(open_pty_if_tty());

    // SAFETY: fork() is async-signal-safe here; the child only calls
    // exec-family functions and _exit before returning to Rust code.
    match unsafe { fork() }.map_err(|e| resource_err("fork", e))? {
        ForkResult::Child => {
            if let Some((_master, slave)) = &pty {
                let slave_fd = slave.as_raw_fd();
                unsafe {
                    libc::dup2(slave_fd, libc::STDOUT_FILENO);
                    libc::dup2(slave_fd, libc::STDERR_FILENO);
                }
            }
            drop(read_fd);
            let helper_c = CString::new(helper.as_os_str().to_string_lossy().as_bytes()).unwrap();
            let svc_c = CString::new(svc_path.as_os_str().to_string_lossy().as_bytes()).unwrap();
            let action_c = CString::new(action).unwrap();
            let mut args = vec![helper_c.clone(), svc_c, action_c];
            if let Some(a2) = arg2 {
                args.push(CString::new(a2).unwrap());
            }
            let _ = unistd::execv(&helper_c, &args);
            // execv only returns on failure.
            unsafe { libc::_exit(127) };
        }
        ForkResult::Parent { child } => {
            drop(write_fd);
            FORWARD_PID.store(child.as_raw(), Ordering::SeqCst);

            let mut prefixer = prefix.map(Prefixer::new);
            if let Some((master, _slave)) = &pty {
                multiplex(master.as_fd_ref(), &read_fd, prefixer.as_mut())?;
            } else {
                wait_on_pipe_only(&read_fd)?;
            }

            FORWARD_PID.store(0, Ordering::SeqCst);
            SIGCHLD_WRITE_FD.store(-1, Ordering::SeqCst);

            let status = reap(child)?;

            Ok(RunOutcome {
                success: status.success(),
            })
        }
    }
}

trait AsFdRef {
    fn as_fd_ref(&self) -> BorrowedFd<'_>;
}
impl AsFdRef for OwnedFd {
    fn as_fd_ref(&self) -> BorrowedFd<'_> {
        self.as_fd()
    }
}
use std::os::fd::AsFd;

fn multiplex(
    master: BorrowedFd<'_>,
    signal_read: &OwnedFd,
    mut prefixer: Option<&mut Prefixer>,
) -> Result<(), ExecError> {
    let mut stdout = std::io::stdout();
    let mut buf = [0u8; 4096];

    loop {
        let mut fds = [
            PollFd::new(master, PollFlags::POLLIN),
            PollFd::new(signal_read.as_fd(), PollFlags::POLLIN),
        ];

        let n = poll(&mut fds, PollTimeout::NONE).map_err(|e| resource_err("poll", e));
        let n = match n {
            Ok(n) => n,
            Err(_) if nix::errno::Errno::last() == nix::errno::Errno::EINTR => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            continue;
        }

        if fds[1].revents().unwrap_or(PollFlags::empty()).contains(PollFlags::POLLIN) {
            let mut discard = [0u8; 16];
            let _ = unistd::read(signal_read.as_raw_fd(), &mut discard);
            return Ok(());
        }

        if fds[0]
            .revents()
            .unwrap_or(PollFlags::empty())
            .intersects(PollFlags::POLLIN | PollFlags::POLLHUP)
        {
            match unistd::read(master.as_raw_fd(), &mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => {
                    let out = match prefixer.as_deref_mut() {
                        Some(p) => p.apply(&buf[..n]),
                        None => buf[..n].to_vec(),
                    };
                    let _ = stdout.write_all(&out);
                    let _ = stdout.flush();
                }
                Err(nix::errno::Errno::EIO) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => return Ok(()),
            }
        }
    }
}

fn wait_on_pipe_only(signal_read: &OwnedFd) -> Result<(), ExecError> {
    let mut fds = [PollFd::new(signal_read.as_fd(), PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {
                let mut discard = [0u8; 16];
                let _ = unistd::read(signal_read.as_raw_fd(), &mut discard);
                return Ok(());
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(resource_err("poll", e)),
        }
    }
}

fn reap(child: Pid) -> Result<ExitStatus, ExecError> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(ExitStatus::from_raw(code << 8)),
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Ok(ExitStatus::from_raw(sig as i32))
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(resource_err("waitpid", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_helper_prefers_service_local() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("runscript.sh");
        std::fs::write(&local, "#!/bin/sh\n").unwrap();
        let fallback = dir.path().join("fallback.sh");
        assert_eq!(locate_helper(dir.path(), &fallback), Some(local));
    }

    #[test]
    fn exec_runs_true_helper() {
        let dir = tempfile::tempdir().unwrap();
        let helper = dir.path().join("helper.sh");
        std::fs::write(&helper, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = std::fs::metadata(&helper).unwrap().permissions();
        std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o755);
        std::fs::set_permissions(&helper, perms).unwrap();

        let outcome = exec(&helper, Path::new("/tmp/svc"), "start", None, None).unwrap();
        assert!(outcome.success);
    }
}
