use std::io::{IoSlice, IoSliceMut};

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;

use super::{Reg, Tracee, Word, WORD_SIZE};

pub use arch::RED_ZONE;
use arch::Registers;

/// A live tracee stopped under ptrace.
///
/// Registers are fetched lazily on the first access of a stop and written
/// back once, by [`PtraceTracee::resume`].
#[derive(Debug)]
pub struct PtraceTracee {
    pid: Pid,
    regs: Option<Registers>,
    dirty: bool,
}

impl PtraceTracee {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            regs: None,
            dirty: false,
        }
    }

    fn regs(&mut self) -> Result<&mut Registers, Errno> {
        let regs = match self.regs.take() {
            Some(regs) => regs,
            None => Registers::fetch(self.pid)?,
        };
        Ok(self.regs.insert(regs))
    }

    pub fn flush(&mut self) -> Result<(), Errno> {
        if self.dirty {
            if let Some(regs) = &self.regs {
                regs.store(self.pid)?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    /// Push the modified registers and restart the tracee up to its next
    /// syscall stop.
    pub fn resume(&mut self, signal: Option<Signal>) -> Result<(), Errno> {
        self.flush()?;
        self.regs = None;
        ptrace::syscall(self.pid, signal)
    }

    fn peek_words(&self, addr: Word, len: usize) -> Result<Vec<u8>, Errno> {
        let start = addr - addr % WORD_SIZE as Word;
        let end = addr.checked_add(len as Word).ok_or(Errno::EFAULT)?;
        let mut bytes = Vec::with_capacity(len + 2 * WORD_SIZE);
        let mut cursor = start;
        while cursor < end {
            let word = ptrace::read(self.pid, cursor as ptrace::AddressType)?;
            bytes.extend_from_slice(&(word as Word).to_ne_bytes());
            cursor = cursor.checked_add(WORD_SIZE as Word).ok_or(Errno::EFAULT)?;
        }
        let skip = (addr - start) as usize;
        bytes
            .get(skip..skip + len)
            .map(<[u8]>::to_vec)
            .ok_or(Errno::EFAULT)
    }

    fn poke_words(&self, addr: Word, data: &[u8]) -> Result<(), Errno> {
        let start = addr - addr % WORD_SIZE as Word;
        let end = addr.checked_add(data.len() as Word).ok_or(Errno::EFAULT)?;
        let mut cursor = start;
        while cursor < end {
            let mut word = (ptrace::read(self.pid, cursor as ptrace::AddressType)? as Word).to_ne_bytes();
            for (i, byte) in word.iter_mut().enumerate() {
                let at = cursor + i as Word;
                if at >= addr && at < end {
                    *byte = data[(at - addr) as usize];
                }
            }
            ptrace::write(
                self.pid,
                cursor as ptrace::AddressType,
                Word::from_ne_bytes(word) as libc::c_long,
            )?;
            cursor = cursor.checked_add(WORD_SIZE as Word).ok_or(Errno::EFAULT)?;
        }
        Ok(())
    }
}

impl Tracee for PtraceTracee {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn peek_register(&mut self, reg: Reg) -> Result<Word, Errno> {
        self.regs()?.slot(reg).map(|slot| *slot)
    }

    fn poke_register(&mut self, reg: Reg, value: Word) -> Result<(), Errno> {
        *self.regs()?.slot(reg)? = value;
        self.dirty = true;
        Ok(())
    }

    fn read_bytes(&mut self, addr: Word, len: usize) -> Result<Vec<u8>, Errno> {
        let mut buf = vec![0; len];
        if len == 0 {
            return Ok(buf);
        }
        let remote = [RemoteIoVec {
            base: addr as usize,
            len,
        }];
        match process_vm_readv(self.pid, &mut [IoSliceMut::new(&mut buf)], &remote) {
            Ok(read) if read == len => Ok(buf),
            // kernels without CONFIG_CROSS_MEMORY_ATTACH, or partial reads
            _ => self.peek_words(addr, len),
        }
    }

    fn write_bytes(&mut self, addr: Word, bytes: &[u8]) -> Result<(), Errno> {
        if bytes.is_empty() {
            return Ok(());
        }
        let remote = [RemoteIoVec {
            base: addr as usize,
            len: bytes.len(),
        }];
        match process_vm_writev(self.pid, &[IoSlice::new(bytes)], &remote) {
            Ok(written) if written == bytes.len() => Ok(()),
            _ => self.poke_words(addr, bytes),
        }
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use nix::errno::Errno;
    use nix::sys::ptrace;
    use nix::unistd::Pid;

    use super::super::{Reg, Word};

    /// Bytes below the stack pointer that leaf functions may use.
    pub const RED_ZONE: Word = 128;

    #[derive(Debug)]
    pub struct Registers(libc::user_regs_struct);

    impl Registers {
        pub fn fetch(pid: Pid) -> Result<Self, Errno> {
            ptrace::getregs(pid).map(Self)
        }

        pub fn store(&self, pid: Pid) -> Result<(), Errno> {
            ptrace::setregs(pid, self.0)
        }

        pub fn slot(&mut self, reg: Reg) -> Result<&mut Word, Errno> {
            let regs = &mut self.0;
            Ok(match reg {
                Reg::SysNum => &mut regs.orig_rax,
                Reg::SysArg(1) => &mut regs.rdi,
                Reg::SysArg(2) => &mut regs.rsi,
                Reg::SysArg(3) => &mut regs.rdx,
                Reg::SysArg(4) => &mut regs.r10,
                Reg::SysArg(5) => &mut regs.r8,
                Reg::SysArg(6) => &mut regs.r9,
                Reg::SysArg(_) => return Err(Errno::EINVAL),
                Reg::Result => &mut regs.rax,
                Reg::StackPointer => &mut regs.rsp,
            })
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    use super::super::{Reg, Word};

    pub const RED_ZONE: Word = 0;

    const NT_ARM_SYSTEM_CALL: libc::c_int = 0x404;

    #[derive(Debug)]
    pub struct Registers {
        gp: libc::user_regs_struct,
        sysnum: Word,
    }

    fn regset<T>(request: bool, pid: Pid, kind: libc::c_int, value: &mut T) -> Result<(), Errno> {
        let mut iov = libc::iovec {
            iov_base: (value as *mut T).cast(),
            iov_len: std::mem::size_of::<T>(),
        };
        let request = if request {
            libc::PTRACE_SETREGSET
        } else {
            libc::PTRACE_GETREGSET
        };
        // SAFETY: the iovec describes `value`, which outlives the call
        let res = unsafe {
            libc::ptrace(
                request,
                pid.as_raw(),
                kind as usize as *mut libc::c_void,
                &mut iov as *mut libc::iovec as *mut libc::c_void,
            )
        };
        Errno::result(res).map(drop)
    }

    impl Registers {
        pub fn fetch(pid: Pid) -> Result<Self, Errno> {
            // SAFETY: plain old data, all zeroes is a valid value
            let mut gp: libc::user_regs_struct = unsafe { std::mem::zeroed() };
            regset(false, pid, libc::NT_PRSTATUS, &mut gp)?;
            let mut sysnum: libc::c_int = 0;
            regset(false, pid, NT_ARM_SYSTEM_CALL, &mut sysnum)?;
            Ok(Self {
                gp,
                sysnum: sysnum as Word,
            })
        }

        pub fn store(&self, pid: Pid) -> Result<(), Errno> {
            let mut gp = self.gp;
            regset(true, pid, libc::NT_PRSTATUS, &mut gp)?;
            let mut sysnum = self.sysnum as libc::c_int;
            regset(true, pid, NT_ARM_SYSTEM_CALL, &mut sysnum)
        }

        pub fn slot(&mut self, reg: Reg) -> Result<&mut Word, Errno> {
            Ok(match reg {
                Reg::SysNum => &mut self.sysnum,
                Reg::SysArg(n @ 1..=6) => &mut self.gp.regs[(n - 1) as usize],
                Reg::SysArg(_) => return Err(Errno::EINVAL),
                Reg::Result => &mut self.gp.regs[0],
                Reg::StackPointer => &mut self.gp.sp,
            })
        }
    }
}
