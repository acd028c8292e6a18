use std::path::PathBuf;

use nix::errno::Errno;

/// Failure of a translation, as seen by the traced process.
///
/// Every variant maps onto one errno value, see [`ErrorKind::errno`], which
/// is what ends up in the result register of the aborted syscall.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("no such file or directory")]
    NotFound,
    #[error("permission denied")]
    AccessDenied,
    #[error("not a directory")]
    NotADirectory,
    #[error("file name too long")]
    NameTooLong,
    #[error("too many levels of symbolic links")]
    SymlinkLoop,
    #[error("operation not permitted")]
    PermissionDenied,
    #[error("out of memory")]
    OutOfMemory,
    #[error("operation not supported")]
    Unsupported,
    #[error("internal error")]
    Internal,
    #[error("exec format error")]
    ExecFormat,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("bad address")]
    Fault,
    #[error("numerical result out of range")]
    Range,
    #[error("{0}")]
    Os(Errno),
}

impl ErrorKind {
    pub fn errno(self) -> Errno {
        match self {
            ErrorKind::NotFound => Errno::ENOENT,
            ErrorKind::AccessDenied => Errno::EACCES,
            ErrorKind::NotADirectory => Errno::ENOTDIR,
            ErrorKind::NameTooLong => Errno::ENAMETOOLONG,
            ErrorKind::SymlinkLoop => Errno::ELOOP,
            ErrorKind::PermissionDenied => Errno::EPERM,
            ErrorKind::OutOfMemory => Errno::ENOMEM,
            ErrorKind::Unsupported => Errno::ENOTSUP,
            ErrorKind::Internal => Errno::EPERM,
            ErrorKind::ExecFormat => Errno::ENOEXEC,
            ErrorKind::InvalidArgument => Errno::EINVAL,
            ErrorKind::Fault => Errno::EFAULT,
            ErrorKind::Range => Errno::ERANGE,
            ErrorKind::Os(errno) => errno,
        }
    }

    /// Value to store in the result register: `-errno` as a machine word.
    pub fn as_syscall_result(self) -> u64 {
        (-(self.errno() as i64)) as u64
    }
}

impl From<Errno> for ErrorKind {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::ENOENT => ErrorKind::NotFound,
            Errno::EACCES => ErrorKind::AccessDenied,
            Errno::ENOTDIR => ErrorKind::NotADirectory,
            Errno::ENAMETOOLONG => ErrorKind::NameTooLong,
            Errno::ELOOP => ErrorKind::SymlinkLoop,
            Errno::EPERM => ErrorKind::PermissionDenied,
            Errno::ENOMEM => ErrorKind::OutOfMemory,
            Errno::ENOTSUP => ErrorKind::Unsupported,
            Errno::ENOEXEC => ErrorKind::ExecFormat,
            Errno::EINVAL => ErrorKind::InvalidArgument,
            Errno::EFAULT => ErrorKind::Fault,
            Errno::ERANGE => ErrorKind::Range,
            other => ErrorKind::Os(other),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(raw) => Errno::from_raw(raw).into(),
            None => ErrorKind::Internal,
        }
    }
}

/// Startup failures. These are fatal: no tracee is ever created.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("can't use \"{path}\" as the guest rootfs: {source}")]
    Rootfs { path: PathBuf, source: Errno },
    #[error("can't bind \"{path}\": {source}")]
    BindingHost { path: PathBuf, source: Errno },
    #[error("can't sanitize the guest path of binding \"{path}\": {kind}")]
    BindingGuest { path: String, kind: ErrorKind },
    #[error("can't use \"{name}\" as runner: {source}")]
    Runner { name: String, source: Errno },
    #[error("invalid binding \"{0}\"")]
    BindingSyntax(String),
    #[error("can't read config file \"{path}\": {source}")]
    ConfigFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("can't parse config file \"{path}\": {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("no command to execute")]
    EmptyCommand,
    #[error("argument contains a nul byte: {0:?}")]
    NulByte(std::ffi::OsString),
}

#[derive(Debug, thiserror::Error)]
pub enum TracerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("ptrace error: {0}")]
    Ptrace(#[from] Errno),
    #[error("the tracer must run single-threaded")]
    NotSingleThreaded,
    #[error("can't launch \"{program}\": {source}")]
    Launch { program: String, source: Errno },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_round_trips_known_kinds() {
        for kind in [
            ErrorKind::NotFound,
            ErrorKind::AccessDenied,
            ErrorKind::NotADirectory,
            ErrorKind::NameTooLong,
            ErrorKind::SymlinkLoop,
            ErrorKind::PermissionDenied,
            ErrorKind::Unsupported,
            ErrorKind::ExecFormat,
        ] {
            assert_eq!(ErrorKind::from(kind.errno()), kind);
        }
    }

    #[test]
    fn unknown_errno_is_passed_through() {
        let kind = ErrorKind::from(Errno::EBUSY);
        assert_eq!(kind, ErrorKind::Os(Errno::EBUSY));
        assert_eq!(kind.errno(), Errno::EBUSY);
    }

    #[test]
    fn syscall_result_is_negative_errno() {
        let word = ErrorKind::NotFound.as_syscall_result();
        assert_eq!(word as i64, -(libc::ENOENT as i64));
    }
}
