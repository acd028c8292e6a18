//! Which arguments of which syscalls are paths.

use syscalls::Sysno;

bitflags::bitflags! {
    /// How the final component of a path argument is resolved.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    pub struct PathFlags: u8 {
        /// Never dereferenced, ex. `lstat(2)`, `unlink(2)`.
        const NOFOLLOW = 0b0001;
        /// Dereferenced unless the flags argument has `AT_SYMLINK_NOFOLLOW`.
        const AT_NOFOLLOW = 0b0010;
        /// Dereferenced only if the flags argument has `AT_SYMLINK_FOLLOW`.
        const AT_FOLLOW = 0b0100;
        /// `open(2)` flags: `O_NOFOLLOW` or `O_CREAT | O_EXCL` prevent the
        /// dereference.
        const OPEN = 0b1000;
        /// Translated only when it looks like a path, starting with `/`
        /// or `.`.
        const SOURCE = 0b1_0000;
    }
}

/// A path argument, registers being numbered from 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PathArg {
    pub path: u8,
    pub dirfd: Option<u8>,
    pub flags_arg: Option<u8>,
    pub flags: PathFlags,
}

const FOLLOW: PathFlags = PathFlags::empty();

// Struct literals rather than function calls: the tables below are promoted
// to `'static`.
macro_rules! plain {
    ($path:literal) => {
        PathArg {
            path: $path,
            dirfd: None,
            flags_arg: None,
            flags: FOLLOW,
        }
    };
}

macro_rules! nofollow {
    ($path:literal) => {
        PathArg {
            path: $path,
            dirfd: None,
            flags_arg: None,
            flags: PathFlags::NOFOLLOW,
        }
    };
}

macro_rules! at {
    ($dirfd:literal, $path:literal) => {
        PathArg {
            path: $path,
            dirfd: Some($dirfd),
            flags_arg: None,
            flags: FOLLOW,
        }
    };
}

macro_rules! at_nofollow {
    ($dirfd:literal, $path:literal) => {
        PathArg {
            path: $path,
            dirfd: Some($dirfd),
            flags_arg: None,
            flags: PathFlags::NOFOLLOW,
        }
    };
}

macro_rules! at_flags {
    ($dirfd:literal, $path:literal, $flags_arg:literal, $flags:expr) => {
        PathArg {
            path: $path,
            dirfd: Some($dirfd),
            flags_arg: Some($flags_arg),
            flags: $flags,
        }
    };
}

/// What the exit stop has to do besides releasing the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Plain,
    Execve,
    Chdir,
    Fchdir,
    Getcwd,
    /// Register of the output buffer and of its size.
    Readlink { buf: u8, size: u8 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Syscall {
    pub paths: &'static [PathArg],
    pub kind: Kind,
}

const fn paths(paths: &'static [PathArg]) -> Syscall {
    Syscall {
        paths,
        kind: Kind::Plain,
    }
}

/// `None` for syscalls without any path.
pub fn describe(sysno: Sysno) -> Option<Syscall> {
    let syscall = match sysno {
        Sysno::execve => Syscall {
            paths: &[],
            kind: Kind::Execve,
        },
        Sysno::chdir => Syscall {
            paths: &[plain!(1)],
            kind: Kind::Chdir,
        },
        Sysno::fchdir => Syscall {
            paths: &[],
            kind: Kind::Fchdir,
        },
        Sysno::getcwd => Syscall {
            paths: &[],
            kind: Kind::Getcwd,
        },
        Sysno::readlinkat => Syscall {
            paths: &[at_nofollow!(1, 2)],
            kind: Kind::Readlink { buf: 3, size: 4 },
        },

        Sysno::openat => paths(&[at_flags!(1, 2, 3, PathFlags::OPEN)]),
        Sysno::mkdirat | Sysno::mknodat | Sysno::unlinkat => paths(&[at_nofollow!(1, 2)]),
        Sysno::symlinkat => paths(&[at_nofollow!(2, 3)]),
        Sysno::linkat => paths(&[
            at_flags!(1, 2, 5, PathFlags::AT_FOLLOW),
            at_nofollow!(3, 4),
        ]),
        Sysno::renameat | Sysno::renameat2 => paths(&[at_nofollow!(1, 2), at_nofollow!(3, 4)]),
        Sysno::newfstatat => paths(&[at_flags!(1, 2, 4, PathFlags::AT_NOFOLLOW)]),
        Sysno::statx => paths(&[at_flags!(1, 2, 3, PathFlags::AT_NOFOLLOW)]),
        Sysno::fchownat => paths(&[at_flags!(1, 2, 5, PathFlags::AT_NOFOLLOW)]),
        Sysno::utimensat => paths(&[at_flags!(1, 2, 4, PathFlags::AT_NOFOLLOW)]),
        Sysno::faccessat | Sysno::fchmodat => paths(&[at!(1, 2)]),
        Sysno::faccessat2 => paths(&[at_flags!(1, 2, 4, PathFlags::AT_NOFOLLOW)]),
        Sysno::name_to_handle_at => paths(&[at_flags!(1, 2, 5, PathFlags::AT_FOLLOW)]),
        Sysno::inotify_add_watch => paths(&[plain!(2)]),
        // the open_how flags are in a struct, the final link is followed
        Sysno::openat2 => paths(&[at!(1, 2)]),
        Sysno::mount => paths(&[
            PathArg {
                path: 1,
                dirfd: None,
                flags_arg: None,
                flags: PathFlags::SOURCE,
            },
            plain!(2),
        ]),
        Sysno::pivot_root => paths(&[plain!(1), plain!(2)]),

        Sysno::chroot
        | Sysno::truncate
        | Sysno::statfs
        | Sysno::acct
        | Sysno::swapon
        | Sysno::swapoff
        | Sysno::umount2
        | Sysno::getxattr
        | Sysno::setxattr
        | Sysno::listxattr
        | Sysno::removexattr => paths(&[plain!(1)]),
        Sysno::lgetxattr | Sysno::lsetxattr | Sysno::llistxattr | Sysno::lremovexattr => {
            paths(&[nofollow!(1)])
        }

        #[cfg(target_arch = "x86_64")]
        Sysno::readlink => Syscall {
            paths: &[nofollow!(1)],
            kind: Kind::Readlink { buf: 2, size: 3 },
        },
        #[cfg(target_arch = "x86_64")]
        Sysno::open => paths(&[PathArg {
            path: 1,
            dirfd: None,
            flags_arg: Some(2),
            flags: PathFlags::OPEN,
        }]),
        #[cfg(target_arch = "x86_64")]
        Sysno::creat
        | Sysno::stat
        | Sysno::access
        | Sysno::chmod
        | Sysno::chown
        | Sysno::utime
        | Sysno::utimes
        | Sysno::uselib => paths(&[plain!(1)]),
        #[cfg(target_arch = "x86_64")]
        Sysno::lstat
        | Sysno::lchown
        | Sysno::mkdir
        | Sysno::rmdir
        | Sysno::unlink
        | Sysno::mknod => paths(&[nofollow!(1)]),
        #[cfg(target_arch = "x86_64")]
        Sysno::symlink => paths(&[nofollow!(2)]),
        #[cfg(target_arch = "x86_64")]
        Sysno::link | Sysno::rename => paths(&[nofollow!(1), nofollow!(2)]),
        #[cfg(target_arch = "x86_64")]
        Sysno::futimesat => paths(&[at!(1, 2)]),

        _ => return None,
    };
    Some(syscall)
}
