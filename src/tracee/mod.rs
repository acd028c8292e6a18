//! Access to a stopped tracee: its registers and its memory, plus the
//! bookkeeping we keep for it between two stops.

use bstr::{BStr, BString, ByteSlice};
use nix::errno::Errno;
use nix::unistd::Pid;

use crate::error::ErrorKind;
use crate::path::compare_paths;
use crate::path::Comparison;

pub mod memory;
pub mod ptrace;

/// Machine word of the supported ABIs (x86_64, aarch64).
pub type Word = u64;
pub const WORD_SIZE: usize = std::mem::size_of::<Word>();

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Reg {
    SysNum,
    /// Syscall argument, numbered from 1 to 6.
    SysArg(u8),
    Result,
    StackPointer,
}

pub trait Tracee {
    fn pid(&self) -> Pid;

    fn peek_register(&mut self, reg: Reg) -> Result<Word, Errno>;

    fn poke_register(&mut self, reg: Reg, value: Word) -> Result<(), Errno>;

    fn read_bytes(&mut self, addr: Word, len: usize) -> Result<Vec<u8>, Errno>;

    fn write_bytes(&mut self, addr: Word, bytes: &[u8]) -> Result<(), Errno>;

    /// Read a nul-terminated string of at most `max` bytes (terminator
    /// excluded). Reads never cross a page boundary needlessly, the string
    /// may well end right before an unmapped page.
    fn read_string(&mut self, addr: Word, max: usize) -> Result<BString, ErrorKind> {
        const PAGE: Word = 4096;

        if addr == 0 {
            return Err(ErrorKind::Fault);
        }
        let mut out = BString::new(Vec::new());
        let mut cursor = addr;
        loop {
            let chunk = (PAGE - cursor % PAGE) as usize;
            let bytes = self.read_bytes(cursor, chunk)?;
            if let Some(end) = bytes.find_byte(0) {
                out.extend_from_slice(&bytes[..end]);
                break;
            }
            out.extend_from_slice(&bytes);
            if out.len() > max {
                return Err(ErrorKind::NameTooLong);
            }
            cursor += chunk as Word;
        }
        if out.len() > max {
            return Err(ErrorKind::NameTooLong);
        }
        Ok(out)
    }

    fn read_word(&mut self, addr: Word) -> Result<Word, Errno> {
        let bytes = self.read_bytes(addr, WORD_SIZE)?;
        let word: [u8; WORD_SIZE] = bytes.as_slice().try_into().map_err(|_| Errno::EFAULT)?;
        Ok(Word::from_ne_bytes(word))
    }
}

/// Work left for the exit stop of the current syscall.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyscallState {
    pub sysnum: Word,
    /// Stack pointer at the syscall entry, restored at the exit.
    pub saved_sp: Option<Word>,
    /// Translation failure to report instead of running the syscall.
    pub error: Option<ErrorKind>,
    /// Guest directory `chdir` switches to when it succeeds.
    pub pending_cwd: Option<BString>,
    /// Host path of the link read by `readlink(at)`, for detranslation.
    pub referrer: Option<BString>,
    /// Guest path of the program `execve` is about to run.
    pub pending_exe: Option<BString>,
    /// Address and size of the buffer `getcwd`/`readlink(at)` fill, the
    /// argument registers may be clobbered at the exit.
    pub output: Option<(Word, usize)>,
}

/// Everything we remember about a tracee.
#[derive(Clone, Debug)]
pub struct TraceeContext {
    pub pid: Pid,
    /// Current working directory, a canonical guest path.
    pub cwd: BString,
    /// Last program successfully executed, as a guest path.
    pub exe: Option<BString>,
    /// While set, paths other than this one are used untranslated.
    pub trigger: Option<BString>,
    pub in_syscall: bool,
    /// The initial SIGSTOP of a new child hasn't been seen yet.
    pub expects_sigstop: bool,
    pub syscall: SyscallState,
}

impl TraceeContext {
    pub fn new(pid: Pid, cwd: impl Into<BString>) -> Self {
        Self {
            pid,
            cwd: cwd.into(),
            exe: None,
            trigger: None,
            in_syscall: false,
            expects_sigstop: false,
            syscall: SyscallState::default(),
        }
    }

    /// Context of a new child: same cwd and program, nothing pending.
    pub fn fork(&self, pid: Pid) -> Self {
        Self {
            pid,
            cwd: self.cwd.clone(),
            exe: self.exe.clone(),
            trigger: None,
            in_syscall: false,
            expects_sigstop: true,
            syscall: SyscallState::default(),
        }
    }

    /// `true` while a trigger is pending and `path` isn't it. Meeting the
    /// trigger consumes it.
    pub fn is_delayed(&mut self, path: &BStr) -> bool {
        let Some(trigger) = &self.trigger else {
            return false;
        };
        if compare_paths(trigger, path) != Comparison::Equal {
            return true;
        }
        self.trigger = None;
        false
    }
}
