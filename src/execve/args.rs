//! Argument vectors in the tracee memory: `argv` and `envp` are read from
//! it, and rewritten ones are copied into its stack.

use bstr::BString;
use log::trace;

use crate::error::ErrorKind;
use crate::execve::ARG_MAX;
use crate::path::PATH_MAX;
use crate::tracee::ptrace::RED_ZONE;
use crate::tracee::{Reg, Tracee, Word, WORD_SIZE};

const STACK_ALIGN: Word = 16;

/// A vector couldn't be copied into the tracee; neither register was
/// updated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("can't write {would_consume} bytes of arguments: {kind}")]
pub struct VectorError {
    pub would_consume: usize,
    pub kind: ErrorKind,
}

fn align_down(addr: Word) -> Word {
    addr & !(STACK_ALIGN - 1)
}

/// Read the nul-terminated array of strings the register `reg` points to.
pub fn read_vector<T: Tracee + ?Sized>(tracee: &mut T, reg: Reg) -> Result<Vec<BString>, ErrorKind> {
    let mut cursor = tracee.peek_register(reg)?;
    let mut strings = Vec::new();
    if cursor == 0 {
        return Ok(strings);
    }
    let mut total = 0;
    loop {
        let pointer = tracee.read_word(cursor)?;
        if pointer == 0 {
            break;
        }
        let string = tracee.read_string(pointer, ARG_MAX)?;
        total += string.len() + 1;
        if total > ARG_MAX * 32 {
            return Err(ErrorKind::NameTooLong);
        }
        strings.push(string);
        cursor += WORD_SIZE as Word;
    }
    Ok(strings)
}

/// Copy `strings` below the stack pointer and make `reg` point to the
/// new array:
///
/// ```text
///   high   [red zone]
///          "argv[0]\0"
///          "argv[1]\0" ...
///          padding to 16 bytes
///          &argv[0], &argv[1], ..., NULL    <- reg, new stack pointer
///   low
/// ```
///
/// Returns the number of stack bytes consumed, the caller restores the
/// stack pointer when the syscall exits.
pub fn write_vector<T: Tracee + ?Sized>(
    tracee: &mut T,
    strings: &[BString],
    reg: Reg,
) -> Result<usize, VectorError> {
    let strings_size: usize = strings.iter().map(|s| s.len() + 1).sum();
    let array_size = (strings.len() + 1) * WORD_SIZE;
    let padding = STACK_ALIGN as usize;
    let would_consume = RED_ZONE as usize + strings_size + padding + array_size;
    let fail = |kind: ErrorKind| VectorError { would_consume, kind };

    let previous_sp = tracee
        .peek_register(Reg::StackPointer)
        .map_err(|e| fail(e.into()))?;
    if previous_sp < would_consume as Word {
        return Err(fail(ErrorKind::OutOfMemory));
    }

    let mut cursor = previous_sp - RED_ZONE;
    let mut pointers = Vec::with_capacity(strings.len() + 1);
    for string in strings {
        cursor -= string.len() as Word + 1;
        let mut bytes = Vec::with_capacity(string.len() + 1);
        bytes.extend_from_slice(string);
        bytes.push(0);
        tracee.write_bytes(cursor, &bytes).map_err(|e| fail(e.into()))?;
        pointers.push(cursor);
    }
    pointers.push(0);

    let array = align_down(cursor) - array_size as Word;
    let bytes: Vec<u8> = pointers.iter().flat_map(|p| p.to_ne_bytes()).collect();
    tracee.write_bytes(array, &bytes).map_err(|e| fail(e.into()))?;

    tracee.poke_register(reg, array).map_err(|e| fail(e.into()))?;
    tracee
        .poke_register(Reg::StackPointer, array)
        .map_err(|e| fail(e.into()))?;

    let consumed = (previous_sp - array) as usize;
    trace!("pid {}: {} strings written at {array:#x}", tracee.pid(), strings.len());
    Ok(consumed)
}

/// Copy `path` below the stack pointer and make `reg` point to it.
/// Returns the number of stack bytes consumed.
pub fn push_path<T: Tracee + ?Sized>(tracee: &mut T, path: &[u8], reg: Reg) -> Result<usize, ErrorKind> {
    if path.len() >= PATH_MAX {
        return Err(ErrorKind::NameTooLong);
    }
    let previous_sp = tracee.peek_register(Reg::StackPointer)?;
    let needed = RED_ZONE + path.len() as Word + 1 + STACK_ALIGN;
    if previous_sp < needed {
        return Err(ErrorKind::OutOfMemory);
    }
    let addr = align_down(previous_sp - RED_ZONE - path.len() as Word - 1);

    let mut bytes = Vec::with_capacity(path.len() + 1);
    bytes.extend_from_slice(path);
    bytes.push(0);
    tracee.write_bytes(addr, &bytes)?;
    tracee.poke_register(reg, addr)?;
    tracee.poke_register(Reg::StackPointer, addr)?;
    Ok((previous_sp - addr) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracee::memory::MemoryTracee;

    const BASE: Word = 0x7000_0000;

    fn strings(items: &[&str]) -> Vec<BString> {
        items.iter().copied().map(BString::from).collect()
    }

    #[test]
    fn vector_round_trip() {
        let mut tracee = MemoryTracee::new(BASE, 4 * 4096);
        let argv = strings(&["/lib/ld.so", "/bin/sh", "-c", "echo hi", ""]);
        let consumed = write_vector(&mut tracee, &argv, Reg::SysArg(2)).unwrap();

        let sp = tracee.registers[&Reg::StackPointer];
        assert_eq!(consumed as Word, tracee.top() - sp);
        assert_eq!(sp % STACK_ALIGN, 0);
        assert_eq!(tracee.registers[&Reg::SysArg(2)], sp);
        assert_eq!(read_vector(&mut tracee, Reg::SysArg(2)).unwrap(), argv);
    }

    #[test]
    fn argument_register_before_stack_pointer() {
        let mut tracee = MemoryTracee::new(BASE, 4096);
        write_vector(&mut tracee, &strings(&["true"]), Reg::SysArg(3)).unwrap();
        let order: Vec<Reg> = tracee.pokes.iter().map(|(reg, _)| *reg).collect();
        assert_eq!(order, vec![Reg::SysArg(3), Reg::StackPointer]);
    }

    #[test]
    fn first_string_is_highest() {
        let mut tracee = MemoryTracee::new(BASE, 4096);
        write_vector(&mut tracee, &strings(&["a", "b"]), Reg::SysArg(2)).unwrap();
        let array = tracee.registers[&Reg::SysArg(2)];
        let first = tracee.read_word(array).unwrap();
        let second = tracee.read_word(array + WORD_SIZE as Word).unwrap();
        assert!(first > second);
        assert!(first < tracee.top() - RED_ZONE);
        assert_eq!(tracee.read_word(array + 2 * WORD_SIZE as Word).unwrap(), 0);
    }

    #[test]
    fn empty_vector() {
        let mut tracee = MemoryTracee::new(BASE, 4096);
        write_vector(&mut tracee, &[], Reg::SysArg(3)).unwrap();
        assert!(read_vector(&mut tracee, Reg::SysArg(3)).unwrap().is_empty());

        tracee.registers.insert(Reg::SysArg(2), 0);
        assert!(read_vector(&mut tracee, Reg::SysArg(2)).unwrap().is_empty());
    }

    #[test]
    fn failure_leaves_registers_alone() {
        let mut tracee = MemoryTracee::new(BASE, 64);
        let long = BString::from(vec![b'x'; 200]);
        let err = write_vector(&mut tracee, &[long], Reg::SysArg(2)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fault);
        assert!(err.would_consume > 200);
        assert!(tracee.pokes.is_empty());
    }

    #[test]
    fn array_that_does_not_fit() {
        // room for the strings, not for the pointers below them
        let mut tracee = MemoryTracee::new(BASE, RED_ZONE as usize + 16);
        tracee.registers.insert(Reg::SysArg(2), 0xdead);
        let top = tracee.top();

        let err = write_vector(&mut tracee, &strings(&["abc", "defgh"]), Reg::SysArg(2)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Fault);
        assert_eq!(err.would_consume, RED_ZONE as usize + 10 + 16 + 3 * WORD_SIZE);
        // the strings went in before the failure
        assert_eq!(tracee.read_bytes(top - RED_ZONE - 4, 4).unwrap(), b"abc\0");
        assert!(tracee.pokes.is_empty());
        assert_eq!(tracee.registers[&Reg::SysArg(2)], 0xdead);
        assert_eq!(tracee.registers[&Reg::StackPointer], top);
    }

    #[test]
    fn paths_are_pushed_below_the_stack() {
        let mut tracee = MemoryTracee::new(BASE, 4096);
        let first = push_path(&mut tracee, b"/tmp/rootfs/etc/passwd", Reg::SysArg(1)).unwrap();
        let addr = tracee.registers[&Reg::SysArg(1)];
        assert_eq!(tracee.read_string(addr, PATH_MAX).unwrap(), "/tmp/rootfs/etc/passwd");

        let second = push_path(&mut tracee, b"/tmp/rootfs/etc/group", Reg::SysArg(2)).unwrap();
        assert_eq!(tracee.read_string(addr, PATH_MAX).unwrap(), "/tmp/rootfs/etc/passwd");
        assert_eq!(
            tracee.top() - tracee.registers[&Reg::StackPointer],
            (first + second) as Word
        );
    }
}
