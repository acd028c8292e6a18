//! Syscall stops: path arguments are translated at the entry, and the
//! exit reports translation errors, restores the stack and rewrites path
//! results.

use bstr::{BString, ByteSlice};
use log::{debug, trace, warn};
use nix::errno::Errno;
use syscalls::Sysno;

use crate::error::ErrorKind;
use crate::execve::args::{push_path, read_vector, write_vector};
use crate::execve::{resolve_execve, ExecveConfig};
use crate::path::{strip_trailing_dir_marker, PATH_MAX};
use crate::tracee::{Reg, SyscallState, Tracee, TraceeContext, Word};
use crate::translator::Translator;

pub mod table;

use table::{Kind, PathArg, PathFlags};

/// No syscall has this number: the kernel skips it and returns `-ENOSYS`,
/// which the exit stop overwrites.
pub const VOID_SYSCALL: Word = Word::MAX;

fn sysno(word: Word) -> Option<Sysno> {
    Sysno::new(usize::try_from(word).ok()?)
}

/// Whether the last component of `arg` is dereferenced.
fn deref_final<T: Tracee + ?Sized>(tracee: &mut T, arg: &PathArg) -> Result<bool, Errno> {
    if arg.flags.contains(PathFlags::NOFOLLOW) {
        return Ok(false);
    }
    let Some(slot) = arg.flags_arg else {
        return Ok(true);
    };
    let flags = tracee.peek_register(Reg::SysArg(slot))? as libc::c_int;
    let deref = if arg.flags.contains(PathFlags::AT_NOFOLLOW) {
        flags & libc::AT_SYMLINK_NOFOLLOW == 0
    } else if arg.flags.contains(PathFlags::AT_FOLLOW) {
        flags & libc::AT_SYMLINK_FOLLOW != 0
    } else if arg.flags.contains(PathFlags::OPEN) {
        let exclusive = libc::O_CREAT | libc::O_EXCL;
        flags & libc::O_NOFOLLOW == 0 && flags & exclusive != exclusive
    } else {
        true
    };
    Ok(deref)
}

fn dirfd<T: Tracee + ?Sized>(tracee: &mut T, arg: &PathArg) -> Result<Option<i32>, Errno> {
    let Some(slot) = arg.dirfd else {
        return Ok(None);
    };
    // an `int`, the upper half of the register is garbage
    let fd = tracee.peek_register(Reg::SysArg(slot))? as u32 as i32;
    Ok((fd != libc::AT_FDCWD).then_some(fd))
}

/// Translate the path argument `arg`. Returns the guest and host paths, or
/// `None` if the argument was left alone.
fn translate_arg<T: Tracee + ?Sized>(
    translator: &mut Translator,
    tracee: &mut T,
    ctx: &mut TraceeContext,
    arg: &PathArg,
) -> Result<Option<(BString, BString)>, ErrorKind> {
    let addr = tracee.peek_register(Reg::SysArg(arg.path))?;
    if addr == 0 {
        return Ok(None);
    }
    let path = tracee.read_string(addr, PATH_MAX - 1)?;
    if path.is_empty() {
        return Ok(None);
    }
    // `mount(2)` sources such as "proc" or "tmpfs" aren't files
    if arg.flags.contains(PathFlags::SOURCE) && !matches!(path.first(), Some(b'/' | b'.')) {
        return Ok(None);
    }
    let dirfd = dirfd(tracee, arg)?;
    let deref = deref_final(tracee, arg)?;
    let translated = translator.translate(ctx, dirfd, path.as_bstr(), deref)?;

    let consumed = push_path(tracee, &translated.host, Reg::SysArg(arg.path))?;
    trace!("pid {}: {} bytes of stack for {}", ctx.pid, consumed, translated.host);
    Ok(Some((translated.guest, translated.host)))
}

fn enter_execve<T: Tracee + ?Sized>(
    translator: &mut Translator,
    exec: &ExecveConfig,
    tracee: &mut T,
    ctx: &mut TraceeContext,
) -> Result<(), ErrorKind> {
    let addr = tracee.peek_register(Reg::SysArg(1))?;
    let path = tracee.read_string(addr, PATH_MAX - 1)?;
    let argv = read_vector(tracee, Reg::SysArg(2))?;
    let envp = read_vector(tracee, Reg::SysArg(3))?;

    let resolution = resolve_execve(translator, ctx, exec, path.as_bstr(), argv, envp)?;

    push_path(tracee, &resolution.host_path, Reg::SysArg(1))?;
    if resolution.argv_changed() {
        write_vector(tracee, &resolution.argv, Reg::SysArg(2)).map_err(|e| e.kind)?;
    }
    if resolution.env_changed {
        write_vector(tracee, &resolution.envp, Reg::SysArg(3)).map_err(|e| e.kind)?;
    }
    ctx.syscall.pending_exe = Some(resolution.guest_path);
    Ok(())
}

fn translate_entry<T: Tracee + ?Sized>(
    translator: &mut Translator,
    exec: &ExecveConfig,
    tracee: &mut T,
    ctx: &mut TraceeContext,
) -> Result<(), ErrorKind> {
    let Some(syscall) = sysno(ctx.syscall.sysnum).and_then(table::describe) else {
        return Ok(());
    };

    match syscall.kind {
        Kind::Execve => return enter_execve(translator, exec, tracee, ctx),
        Kind::Getcwd => {
            let buf = tracee.peek_register(Reg::SysArg(1))?;
            let size = tracee.peek_register(Reg::SysArg(2))? as usize;
            ctx.syscall.output = Some((buf, size));
            // the tracked cwd is the answer, computed at the exit
            tracee.poke_register(Reg::SysNum, VOID_SYSCALL)?;
            return Ok(());
        }
        Kind::Fchdir => {
            let fd = tracee.peek_register(Reg::SysArg(1))? as u32 as i32;
            // the kernel reports a bad fd by itself
            ctx.syscall.pending_cwd = translator.dirfd_base(ctx, fd).ok();
            return Ok(());
        }
        Kind::Readlink { buf, size } => {
            let buf = tracee.peek_register(Reg::SysArg(buf))?;
            let size = tracee.peek_register(Reg::SysArg(size))? as usize;
            ctx.syscall.output = Some((buf, size));
        }
        Kind::Plain | Kind::Chdir => {}
    }

    for arg in syscall.paths {
        let Some((guest, host)) = translate_arg(translator, tracee, ctx, arg)? else {
            continue;
        };
        match syscall.kind {
            Kind::Chdir => {
                let mut cwd = guest;
                strip_trailing_dir_marker(&mut cwd);
                ctx.syscall.pending_cwd = Some(cwd);
            }
            Kind::Readlink { .. } => ctx.syscall.referrer = Some(host),
            _ => {}
        }
    }
    Ok(())
}

/// Syscall-entry stop of `ctx`. Translation failures are reported to the
/// tracee at the exit stop; only failures to access the tracee itself are
/// returned.
pub fn enter<T: Tracee + ?Sized>(
    translator: &mut Translator,
    exec: &ExecveConfig,
    tracee: &mut T,
    ctx: &mut TraceeContext,
) -> Result<(), Errno> {
    ctx.syscall = SyscallState {
        sysnum: tracee.peek_register(Reg::SysNum)?,
        saved_sp: Some(tracee.peek_register(Reg::StackPointer)?),
        ..SyscallState::default()
    };

    if let Err(kind) = translate_entry(translator, exec, tracee, ctx) {
        debug!("pid {}: {:?} failed: {kind}", ctx.pid, sysno(ctx.syscall.sysnum));
        ctx.syscall.error = Some(kind);
        tracee.poke_register(Reg::SysNum, VOID_SYSCALL)?;
    }
    Ok(())
}

fn set_result<T: Tracee + ?Sized>(
    tracee: &mut T,
    result: Result<usize, ErrorKind>,
) -> Result<(), Errno> {
    let word = match result {
        Ok(value) => value as Word,
        Err(kind) => kind.as_syscall_result(),
    };
    tracee.poke_register(Reg::Result, word)
}

fn exit_getcwd<T: Tracee + ?Sized>(
    tracee: &mut T,
    ctx: &TraceeContext,
    output: Option<(Word, usize)>,
) -> Result<usize, ErrorKind> {
    let (buf, size) = output.ok_or(ErrorKind::Internal)?;
    let mut cwd = ctx.cwd.to_vec();
    cwd.push(0);
    if cwd.len() > size {
        return Err(ErrorKind::Range);
    }
    tracee.write_bytes(buf, &cwd).map_err(|_| ErrorKind::Fault)?;
    Ok(cwd.len())
}

/// Detranslate the link target `readlink(at)` put into the tracee memory.
fn exit_readlink<T: Tracee + ?Sized>(
    translator: &Translator,
    tracee: &mut T,
    state: &SyscallState,
    len: usize,
) -> Result<Option<usize>, ErrorKind> {
    let (buf, size) = state.output.ok_or(ErrorKind::Internal)?;
    let Some(referrer) = &state.referrer else {
        return Ok(None);
    };
    let mut target = BString::from(tracee.read_bytes(buf, len)?);
    if !translator.detranslate(&mut target, Some(referrer.as_bstr()))? {
        return Ok(None);
    }
    // truncated silently, as readlink(2) does
    let len = target.len().min(size);
    tracee.write_bytes(buf, &target[..len])?;
    Ok(Some(len))
}

/// Syscall-exit stop of `ctx`.
pub fn exit<T: Tracee + ?Sized>(
    translator: &Translator,
    tracee: &mut T,
    ctx: &mut TraceeContext,
) -> Result<(), Errno> {
    let state = std::mem::take(&mut ctx.syscall);
    let kind = sysno(state.sysnum)
        .and_then(table::describe)
        .map_or(Kind::Plain, |syscall| syscall.kind);
    let result = tracee.peek_register(Reg::Result)? as i64;
    let mut execve_done = false;

    if let Some(error) = state.error {
        set_result(tracee, Err(error))?;
    } else {
        match kind {
            Kind::Getcwd => {
                let outcome = exit_getcwd(tracee, ctx, state.output);
                set_result(tracee, outcome)?;
            }
            Kind::Readlink { .. } if result > 0 => {
                match exit_readlink(translator, tracee, &state, result as usize) {
                    Ok(Some(len)) => set_result(tracee, Ok(len))?,
                    Ok(None) => {}
                    Err(kind) => set_result(tracee, Err(kind))?,
                }
            }
            Kind::Chdir | Kind::Fchdir if result == 0 => match state.pending_cwd {
                Some(cwd) => {
                    debug!("pid {}: cwd is now {cwd}", ctx.pid);
                    ctx.cwd = cwd;
                }
                None => warn!("pid {}: lost track of the cwd", ctx.pid),
            },
            Kind::Execve if result == 0 => {
                execve_done = true;
                ctx.exe = state.pending_exe;
            }
            _ => {}
        }
    }

    // the stack of the new program has nothing to do with the old one
    if !execve_done {
        if let Some(sp) = state.saved_sp {
            tracee.poke_register(Reg::StackPointer, sp)?;
        }
    }
    Ok(())
}
