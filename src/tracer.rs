//! Launch of the first tracee and the ptrace event loop.

use std::collections::{HashMap, HashSet};
use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStringExt;

use bstr::{BStr, BString};
use log::{debug, error, info, trace, warn};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Event, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, execvp, fork, ForkResult, Pid};

use crate::error::{ConfigError, TracerError};
use crate::execve::ExecveConfig;
use crate::syscall;
use crate::tracee::ptrace::PtraceTracee;
use crate::tracee::TraceeContext;
use crate::translator::Translator;

#[derive(Debug)]
struct Traced {
    tracee: PtraceTracee,
    ctx: TraceeContext,
}

#[derive(Debug)]
pub struct Tracer {
    translator: Translator,
    exec: ExecveConfig,
    tracees: HashMap<Pid, Traced>,
    /// New children whose initial stop came before the event of their
    /// parent: they wait for their context.
    orphans: HashSet<Pid>,
    first: Option<Pid>,
    exit_code: Option<i32>,
}

fn cstring(arg: OsString) -> Result<CString, ConfigError> {
    CString::new(arg.clone().into_vec()).map_err(|_| ConfigError::NulByte(arg))
}

impl Tracer {
    pub fn new(mut translator: Translator, exec: ExecveConfig) -> Self {
        translator.set_runner_active(exec.runner.is_some());
        Self {
            translator,
            exec,
            tracees: HashMap::new(),
            orphans: HashSet::new(),
            first: None,
            exit_code: None,
        }
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    /// The cwd of the tracer as a guest path, `/` when it lies outside of
    /// the guest namespace.
    fn guest_cwd(&self) -> BString {
        let Ok(dir) = std::env::current_dir() else {
            return BString::from("/");
        };
        let mut cwd = BString::from(dir.into_os_string().into_vec());
        match self.translator.detranslate(&mut cwd, None) {
            Ok(_) => cwd,
            Err(_) => BString::from("/"),
        }
    }

    /// Start `command` as the first tracee, in the guest directory `cwd`
    /// (by default the cwd of the tracer).
    pub fn launch(
        &mut self,
        command: Vec<OsString>,
        cwd: Option<&BStr>,
    ) -> Result<Pid, TracerError> {
        if command.is_empty() {
            return Err(ConfigError::EmptyCommand.into());
        }
        if num_threads::is_single_threaded() != Some(true) {
            return Err(TracerError::NotSingleThreaded);
        }

        let start_cwd = self.guest_cwd();
        let target_cwd = cwd.map_or_else(|| start_cwd.clone(), |cwd| cwd.to_owned());
        let target_cwd = CString::new(target_cwd.to_vec())
            .map_err(|_| ConfigError::NulByte(OsString::from_vec(target_cwd.to_vec())))?;
        let program_name = command[0].to_string_lossy().into_owned();
        let args = command
            .into_iter()
            .map(cstring)
            .collect::<Result<Vec<_>, _>>()?;

        // SAFETY: the tracer is single-threaded, checked above
        match unsafe { fork() }? {
            ForkResult::Child => {
                // once stopped, every syscall is translated: the chdir
                // below is done in the guest namespace
                let error = ptrace::traceme()
                    .and_then(|()| kill(Pid::this(), Signal::SIGSTOP))
                    .and_then(|()| {
                        if let Err(errno) = chdir(target_cwd.as_c_str()) {
                            eprintln!("rebind: chdir({target_cwd:?}): {errno}, using \"/\"");
                            chdir("/")?;
                        }
                        Ok(())
                    })
                    .and_then(|()| execvp(&args[0], &args).map(|_| ()));
                if let Err(errno) = error {
                    eprintln!("rebind: can't execute \"{program_name}\": {errno}");
                }
                // SAFETY: nothing of the parent must be flushed twice
                unsafe { libc::_exit(127) }
            }
            ForkResult::Parent { child } => {
                match waitpid(child, Some(WaitPidFlag::__WALL))? {
                    WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
                    other => {
                        debug!("pid {child}: {other:?} instead of the initial stop");
                        return Err(TracerError::Launch {
                            program: program_name,
                            source: Errno::ECHILD,
                        });
                    }
                }
                ptrace::setoptions(
                    child,
                    Options::PTRACE_O_TRACESYSGOOD
                        | Options::PTRACE_O_TRACEFORK
                        | Options::PTRACE_O_TRACEVFORK
                        | Options::PTRACE_O_TRACECLONE
                        | Options::PTRACE_O_TRACEEXEC
                        | Options::PTRACE_O_EXITKILL,
                )?;
                info!("pid {child}: started \"{program_name}\" from {start_cwd}");

                let mut traced = Traced {
                    tracee: PtraceTracee::new(child),
                    ctx: TraceeContext::new(child, start_cwd),
                };
                traced.tracee.resume(None)?;
                self.tracees.insert(child, traced);
                self.first = Some(child);
                Ok(child)
            }
        }
    }

    /// Handle the tracees until none is left. Returns the exit status of
    /// the first one, `128 + signal` when it was killed.
    pub fn run(&mut self) -> Result<i32, TracerError> {
        loop {
            let status = match waitpid(None, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(errno) => return Err(errno.into()),
            };
            trace!("{status:?}");

            match status {
                WaitStatus::Exited(pid, code) => self.gone(pid, code),
                WaitStatus::Signaled(pid, signal, _) => self.gone(pid, 128 + signal as i32),
                WaitStatus::PtraceSyscall(pid) => self.syscall_stop(pid),
                WaitStatus::PtraceEvent(pid, _, event) => self.event_stop(pid, event),
                WaitStatus::Stopped(pid, signal) => self.signal_stop(pid, signal),
                WaitStatus::Continued(_) | WaitStatus::StillAlive => {}
            }
        }
        Ok(self.exit_code.unwrap_or(1))
    }

    fn gone(&mut self, pid: Pid, status: i32) {
        debug!("pid {pid}: gone with status {status}");
        self.tracees.remove(&pid);
        self.orphans.remove(&pid);
        if self.first == Some(pid) {
            self.exit_code = Some(status);
        }
    }

    fn resume(&mut self, pid: Pid, signal: Option<Signal>) {
        let result = match self.tracees.get_mut(&pid) {
            Some(traced) => traced.tracee.resume(signal),
            None => ptrace::syscall(pid, signal),
        };
        match result {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => warn!("pid {pid}: can't resume: {errno}"),
        }
    }

    fn syscall_stop(&mut self, pid: Pid) {
        let Some(traced) = self.tracees.get_mut(&pid) else {
            warn!("pid {pid}: syscall stop of an unknown tracee");
            self.resume(pid, None);
            return;
        };
        let Traced { tracee, ctx } = traced;

        let result = if ctx.in_syscall {
            ctx.in_syscall = false;
            syscall::exit(&self.translator, tracee, ctx)
        } else {
            ctx.in_syscall = true;
            syscall::enter(&mut self.translator, &self.exec, tracee, ctx)
        };
        match result {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => warn!("pid {pid}: syscall handling failed: {errno}"),
        }
        self.resume(pid, None);
    }

    fn event_stop(&mut self, pid: Pid, event: i32) {
        let is_new_child = event == Event::PTRACE_EVENT_FORK as i32
            || event == Event::PTRACE_EVENT_VFORK as i32
            || event == Event::PTRACE_EVENT_CLONE as i32;
        if is_new_child {
            match ptrace::getevent(pid) {
                Ok(child) => self.adopt(pid, Pid::from_raw(child as i32)),
                Err(errno) => warn!("pid {pid}: can't get the new child: {errno}"),
            }
        }
        self.resume(pid, None);
    }

    fn adopt(&mut self, parent: Pid, child: Pid) {
        let Some(parent_ctx) = self.tracees.get(&parent).map(|traced| &traced.ctx) else {
            return;
        };
        let mut ctx = parent_ctx.fork(child);
        debug!("pid {parent}: new child {child} in {}", ctx.cwd);

        let stopped = self.orphans.remove(&child);
        if stopped {
            ctx.expects_sigstop = false;
        }
        self.tracees.insert(
            child,
            Traced {
                tracee: PtraceTracee::new(child),
                ctx,
            },
        );
        if stopped {
            self.resume(child, None);
        }
    }

    fn signal_stop(&mut self, pid: Pid, signal: Signal) {
        let Some(traced) = self.tracees.get_mut(&pid) else {
            if signal == Signal::SIGSTOP {
                // resumed once its parent reports it
                self.orphans.insert(pid);
            } else {
                error!("pid {pid}: stopped by {signal} before being known");
                self.resume(pid, Some(signal));
            }
            return;
        };
        if signal == Signal::SIGSTOP && traced.ctx.expects_sigstop {
            traced.ctx.expects_sigstop = false;
            self.resume(pid, None);
        } else {
            self.resume(pid, Some(signal));
        }
    }
}
