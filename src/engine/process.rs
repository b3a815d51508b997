use std::ffi::CString;
use std::os::fd::OwnedFd;
use std::os::raw::c_char;

use libc::execvp;
use nix::sys::signal::{raise, Signal};
use nix::unistd::Pid;

/// Launches a command in a suspended state: the child blocks on a
/// single-byte ready-pipe before exec, so the parent can open counters
/// and set affinity against a known pid first.
pub struct SuspendedProcess {
    pid: Pid,
    send_end_of_ready_pipe: OwnedFd,
    recv_end_of_execerr_pipe: OwnedFd,
}

fn to_argv(command: &[String]) -> (Vec<CString>, Vec<*const c_char>) {
    let owned: Vec<CString> = command
        .iter()
        .map(|arg| CString::new(arg.as_bytes().to_vec()).unwrap_or_default())
        .collect();
    let mut pointers: Vec<*const c_char> = owned.iter().map(|c| c.as_ptr()).collect();
    pointers.push(std::ptr::null());
    (owned, pointers)
}

impl SuspendedProcess {
    pub fn launch(command: &[String]) -> std::io::Result<Self> {
        Self::launch_with(command, false)
    }

    /// Ptrace variant: the child requests trace-me and raises a stop
    /// signal before exec, so the tracer observes the initial stop.
    pub fn launch_traced(command: &[String]) -> std::io::Result<Self> {
        Self::launch_with(command, true)
    }

    fn launch_with(command: &[String], traced: bool) -> std::io::Result<Self> {
        let (argv_owned, argv) = to_argv(command);

        let (ready_rp, ready_sp) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(std::io::Error::from)?;
        let (execerr_rp, execerr_sp) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .map_err(std::io::Error::from)?;

        match unsafe { nix::unistd::fork() }.map_err(std::io::Error::from)? {
            nix::unistd::ForkResult::Child => {
                drop(ready_sp);
                drop(execerr_rp);
                Self::run_child(ready_rp, execerr_sp, &argv, traced);
                // run_child never returns; keep argv alive until exec.
                drop(argv_owned);
                unreachable!()
            }
            nix::unistd::ForkResult::Parent { child } => {
                drop(ready_rp);
                drop(execerr_sp);
                Ok(SuspendedProcess {
                    pid: child,
                    send_end_of_ready_pipe: ready_sp,
                    recv_end_of_execerr_pipe: execerr_rp,
                })
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    const EXECERR_MSG_FOOTER: [u8; 4] = *b"NOEX";

    /// Unblocks the child without waiting for the exec verdict. The
    /// ptrace tracer observes exec (or early death) through wait events
    /// instead of the execerr pipe.
    pub fn release(self) -> std::io::Result<Pid> {
        nix::unistd::write(&self.send_end_of_ready_pipe, &[0x42]).map_err(std::io::Error::from)?;
        Ok(self.pid)
    }

    /// Unblocks the child and waits for the exec verdict.
    pub fn unsuspend_and_run(self) -> std::io::Result<Pid> {
        nix::unistd::write(&self.send_end_of_ready_pipe, &[0x42]).map_err(std::io::Error::from)?;
        drop(self.send_end_of_ready_pipe);

        // loop for EINTR
        loop {
            let mut bytes = [0; 8];
            let read_result = nix::unistd::read(&self.recv_end_of_execerr_pipe, &mut bytes);
            match read_result {
                Ok(0) => {
                    // Pipe closed: the exec succeeded.
                    break;
                }
                Ok(8) => {
                    let (errno, footer) = bytes.split_at(4);
                    assert_eq!(
                        Self::EXECERR_MSG_FOOTER,
                        footer,
                        "validation on the execerr pipe failed: {bytes:?}",
                    );
                    let errno = i32::from_be_bytes([errno[0], errno[1], errno[2], errno[3]]);
                    let _ = nix::sys::wait::waitpid(self.pid, None);
                    return Err(std::io::Error::from_raw_os_error(errno));
                }
                Ok(_) => {
                    // Pipe I/O up to PIPE_BUF bytes is atomic; anything
                    // else means the protocol is broken.
                    let _ = nix::sys::wait::waitpid(self.pid, None);
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "short read on the execerr pipe",
                    ));
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(self.pid)
    }

    /// Executed in the forked child. Never returns.
    fn run_child(
        recv_end_of_ready_pipe: OwnedFd,
        send_end_of_execerr_pipe: OwnedFd,
        argv: &[*const c_char],
        traced: bool,
    ) {
        if traced {
            if nix::sys::ptrace::traceme().is_err() {
                unsafe { libc::_exit(1) }
            }
            let _ = raise(Signal::SIGSTOP);
        }

        // loop to handle EINTR
        loop {
            let mut buf = [0];
            let read_result = nix::unistd::read(&recv_end_of_ready_pipe, &mut buf);
            match read_result {
                Ok(0) => {
                    // The parent closed the pipe without the go byte:
                    // profiling initialization failed, do not exec.
                    unsafe { libc::_exit(0) }
                }
                Ok(_) => {
                    let _ = unsafe { execvp(argv[0], argv.as_ptr()) };

                    // Still here: the exec failed. Report errno through
                    // the execerr pipe and die.
                    let errno = nix::errno::Errno::last_raw().to_be_bytes();
                    let bytes = [
                        errno[0],
                        errno[1],
                        errno[2],
                        errno[3],
                        Self::EXECERR_MSG_FOOTER[0],
                        Self::EXECERR_MSG_FOOTER[1],
                        Self::EXECERR_MSG_FOOTER[2],
                        Self::EXECERR_MSG_FOOTER[3],
                    ];
                    let _ = nix::unistd::write(&send_end_of_execerr_pipe, &bytes);
                    unsafe { libc::_exit(1) }
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(_) => unsafe { libc::_exit(1) },
            }
        }
    }
}

/// Pins a process to exactly the given CPU set.
pub fn set_affinity(pid: u32, cpus: &[u32]) -> nix::Result<()> {
    let mut cpu_set = nix::sched::CpuSet::new();
    for &cpu in cpus {
        cpu_set.set(cpu as usize)?;
    }
    nix::sched::sched_setaffinity(Pid::from_raw(pid as i32), &cpu_set)
}
