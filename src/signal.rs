//! Signal Handling
//!
//! The supervisor blocks the termination set on its own thread before any
//! worker exists, so every worker inherits the mask and process-directed
//! signals stay pending until the supervisor collects them with `sigwait`.
//!
//! Synchronous fault signals and `SIGPIPE` are left out of the set: faults
//! must keep their default action, and `SIGPIPE` is ignored by the runtime.

use std::io;
use std::mem::MaybeUninit;

use libc::c_int;

/// Signals never included in the termination set
const EXCLUDED: [c_int; 7] = [
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGTRAP,
    libc::SIGSYS,
    libc::SIGPIPE,
];

/// A set of signals the calling thread can block and wait on
#[derive(Clone, Copy)]
pub struct SignalSet {
    set: libc::sigset_t,
}

impl SignalSet {
    /// Empty set
    pub fn empty() -> io::Result<Self> {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigemptyset initializes the set it is given.
        if unsafe { libc::sigemptyset(set.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: initialized by sigemptyset above.
        Ok(Self {
            set: unsafe { set.assume_init() },
        })
    }

    /// Every standard signal except synchronous faults and `SIGPIPE`
    pub fn termination() -> io::Result<Self> {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        // SAFETY: sigfillset initializes the set it is given.
        if unsafe { libc::sigfillset(set.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: initialized by sigfillset above.
        let mut this = Self {
            set: unsafe { set.assume_init() },
        };
        for signo in EXCLUDED {
            this.remove(signo)?;
        }
        Ok(this)
    }

    pub fn add(&mut self, signo: c_int) -> io::Result<()> {
        // SAFETY: `self.set` is an initialized sigset_t.
        if unsafe { libc::sigaddset(&mut self.set, signo) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn remove(&mut self, signo: c_int) -> io::Result<()> {
        // SAFETY: `self.set` is an initialized sigset_t.
        if unsafe { libc::sigdelset(&mut self.set, signo) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn contains(&self, signo: c_int) -> bool {
        // SAFETY: `self.set` is an initialized sigset_t.
        unsafe { libc::sigismember(&self.set, signo) == 1 }
    }

    /// Block the set on the calling thread (and threads it spawns later)
    pub fn block(&self) -> io::Result<()> {
        self.mask(libc::SIG_BLOCK)
    }

    fn mask(&self, how: c_int) -> io::Result<()> {
        // SAFETY: valid set pointer; a null old-set pointer is allowed.
        let rc = unsafe { libc::pthread_sigmask(how, &self.set, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(())
    }

    /// Block until one signal of the set is pending and consume it
    ///
    /// The set must already be blocked on the calling thread.
    pub fn wait(&self) -> io::Result<c_int> {
        let mut signo: c_int = 0;
        // SAFETY: valid set pointer and out-parameter.
        let rc = unsafe { libc::sigwait(&self.set, &mut signo) };
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        Ok(signo)
    }
}

/// Conventional name of a signal number, for logs
pub fn signal_name(signo: c_int) -> &'static str {
    match signo {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGABRT => "SIGABRT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGURG => "SIGURG",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGVTALRM => "SIGVTALRM",
        libc::SIGPROF => "SIGPROF",
        libc::SIGWINCH => "SIGWINCH",
        libc::SIGIO => "SIGIO",
        _ => "unknown",
    }
}
