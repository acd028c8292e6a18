use std::ffi::{CStr, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};

use bstr::BString;
use nix::errno::Errno;
use nix::sys::stat::{FileStat, SFlag};
use nix::unistd::AccessFlags;

pub(crate) use macros::nix_retry;
mod macros {
    macro_rules! nix_retry {
        ($e:expr) => {
            loop {
                let result = $e;
                if !matches!(
                    &result,
                    ::core::result::Result::Err(::nix::errno::Errno::EINTR)
                ) {
                    break result;
                }
            }
        };
    }
    pub(crate) use nix_retry;
}

pub(crate) fn os(path: &[u8]) -> &OsStr {
    OsStr::from_bytes(path)
}

pub(crate) fn into_bstring(path: OsString) -> BString {
    BString::from(path.into_vec())
}

/// `realpath(3)` on a byte path.
///
/// The result is copied out of the libc allocation since we can't assume the
/// global allocator is the one libc uses.
pub fn realpath(path: impl AsRef<[u8]>) -> Result<BString, Errno> {
    fn realpath_inner(path: &[u8]) -> Result<BString, Errno> {
        use nix::NixPath;

        // SAFETY: NixPath hands us a valid nul-terminated string, and realpath
        // allocates the result itself since we pass a null buffer
        let ptr = os(path).with_nix_path(|p| unsafe {
            libc::realpath(p.as_ptr(), std::ptr::null_mut())
        })?;
        if ptr.is_null() {
            return Err(Errno::last());
        }
        // SAFETY: ptr isn't null and points to a string malloc'ed by the libc
        let resolved = BString::from(unsafe { CStr::from_ptr(ptr) }.to_bytes());
        // SAFETY: `resolved` owns a copy of the data
        unsafe { libc::free(ptr.cast()) };
        Ok(resolved)
    }

    realpath_inner(path.as_ref())
}

pub fn lstat(path: &[u8]) -> Result<FileStat, Errno> {
    nix_retry!(nix::sys::stat::lstat(os(path)))
}

pub fn stat(path: &[u8]) -> Result<FileStat, Errno> {
    nix_retry!(nix::sys::stat::stat(os(path)))
}

pub fn readlink(path: &[u8]) -> Result<BString, Errno> {
    nix_retry!(nix::fcntl::readlink(os(path))).map(into_bstring)
}

pub fn access(path: &[u8], mode: AccessFlags) -> Result<(), Errno> {
    nix_retry!(nix::unistd::access(os(path), mode))
}

pub fn file_type(st: &FileStat) -> SFlag {
    SFlag::from_bits_truncate(st.st_mode & SFlag::S_IFMT.bits())
}

pub fn is_type(st: &FileStat, kind: SFlag) -> bool {
    file_type(st) == kind
}
