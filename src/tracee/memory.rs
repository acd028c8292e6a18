//! In-memory tracee: a register file and one contiguous memory region.
//!
//! Used to exercise the rewriting logic without a live process.

use std::collections::HashMap;

use nix::errno::Errno;
use nix::unistd::Pid;

use super::{Reg, Tracee, Word};

#[derive(Clone, Debug)]
pub struct MemoryTracee {
    pub pid: Pid,
    pub registers: HashMap<Reg, Word>,
    base: Word,
    memory: Vec<u8>,
    /// Every register update, in order.
    pub pokes: Vec<(Reg, Word)>,
}

impl MemoryTracee {
    /// A tracee whose memory spans `[base, base + size)`, with the stack
    /// pointer at the top of it.
    pub fn new(base: Word, size: usize) -> Self {
        let mut registers = HashMap::new();
        registers.insert(Reg::StackPointer, base + size as Word);
        Self {
            pid: Pid::from_raw(4242),
            registers,
            base,
            memory: vec![0; size],
            pokes: Vec::new(),
        }
    }

    pub fn top(&self) -> Word {
        self.base + self.memory.len() as Word
    }

    fn range(&self, addr: Word, len: usize) -> Result<std::ops::Range<usize>, Errno> {
        let start = addr.checked_sub(self.base).ok_or(Errno::EFAULT)? as usize;
        let end = start.checked_add(len).ok_or(Errno::EFAULT)?;
        if end > self.memory.len() {
            return Err(Errno::EFAULT);
        }
        Ok(start..end)
    }
}

impl Tracee for MemoryTracee {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn peek_register(&mut self, reg: Reg) -> Result<Word, Errno> {
        Ok(self.registers.get(&reg).copied().unwrap_or(0))
    }

    fn poke_register(&mut self, reg: Reg, value: Word) -> Result<(), Errno> {
        self.pokes.push((reg, value));
        self.registers.insert(reg, value);
        Ok(())
    }

    fn read_bytes(&mut self, addr: Word, len: usize) -> Result<Vec<u8>, Errno> {
        let range = self.range(addr, len)?;
        Ok(self.memory[range].to_vec())
    }

    fn write_bytes(&mut self, addr: Word, bytes: &[u8]) -> Result<(), Errno> {
        let range = self.range(addr, bytes.len())?;
        self.memory[range].copy_from_slice(bytes);
        Ok(())
    }
}
