//! Host programs started from a guest running under a QEMU-like runner
//! are executed natively. Their dynamic linker and libraries are the
//! host's, reached through the binding of the host `/`, so the search
//! path the linker sees has to point there.

use bstr::{BStr, BString, ByteSlice};
use log::debug;

use crate::error::ErrorKind;
use crate::execve::elf::{self, Class, LibraryPaths};
use crate::execve::ARG_MAX;

/// Guest path of the host `/` when a QEMU-like runner is used.
pub const HOST_ROOTFS: &str = "/host-rootfs";

const DEFAULT_PATHS_64: &[u8] = b"/lib64:/usr/lib64:/usr/local/lib64:/lib:/usr/lib:/usr/local/lib";
const DEFAULT_PATHS_32: &[u8] = b"/lib32:/usr/lib32:/usr/local/lib32:/lib:/usr/lib:/usr/local/lib";

/// `:`-separated list of directories, absolute ones moved under the host
/// rootfs binding.
#[derive(Debug)]
struct SearchPath<'a> {
    host_rootfs: &'a BStr,
    value: BString,
}

impl<'a> SearchPath<'a> {
    fn new(host_rootfs: &'a BStr) -> Self {
        Self {
            host_rootfs,
            value: BString::new(Vec::new()),
        }
    }

    fn add(&mut self, paths: &[u8]) -> Result<(), ErrorKind> {
        for dir in paths.split_str(":") {
            if !self.value.is_empty() {
                self.value.push(b':');
            }
            if dir.starts_with(b"/") {
                self.value.extend_from_slice(self.host_rootfs);
            }
            self.value.extend_from_slice(dir);
        }
        if self.value.len() >= ARG_MAX {
            return Err(ErrorKind::ExecFormat);
        }
        Ok(())
    }
}

fn set_env(envp: &mut Vec<BString>, name: &[u8], value: &[u8]) {
    let mut entry = BString::from(name);
    entry.push(b'=');
    entry.extend_from_slice(value);

    let existing = envp
        .iter_mut()
        .find(|e| e.strip_prefix(name).is_some_and(|rest| rest.starts_with(b"=")));
    match existing {
        Some(slot) => *slot = entry,
        None => envp.push(entry),
    }
}

fn search_path(
    paths: &LibraryPaths,
    initial_paths: Option<&[u8]>,
    host_rootfs: &BStr,
) -> Result<(BString, bool), ErrorKind> {
    let mut search = SearchPath::new(host_rootfs);
    let mut inhibit_rpath = false;
    if let (Some(rpath), None) = (&paths.rpath, &paths.runpath) {
        search.add(rpath)?;
        inhibit_rpath = true;
    }
    if let Some(initial) = initial_paths {
        search.add(initial)?;
    }
    if let Some(runpath) = &paths.runpath {
        search.add(runpath)?;
        inhibit_rpath = true;
    }
    search.add(match paths.class {
        Some(Class::Elf32) => DEFAULT_PATHS_32,
        _ => DEFAULT_PATHS_64,
    })?;
    Ok((search.value, inhibit_rpath))
}

/// Set `LD_LIBRARY_PATH` in `envp` for the host program `host_program`:
/// its `DT_RPATH` (unless it has a `DT_RUNPATH`), the `LD_LIBRARY_PATH` of
/// the tracer, its `DT_RUNPATH`, then the standard directories.
///
/// Returns whether the program carries its own paths, in which case the
/// dynamic linker should be told to ignore them. Nothing changes when the
/// list doesn't fit in an argument.
pub fn rebuild_host_ldso_paths(
    host_program: &[u8],
    host_rootfs: &BStr,
    initial_paths: Option<&[u8]>,
    envp: &mut Vec<BString>,
) -> Result<bool, ErrorKind> {
    let paths = elf::library_paths(host_program)?;
    let Ok((value, inhibit_rpath)) = search_path(&paths, initial_paths, host_rootfs) else {
        debug!("library paths of {} are too long", host_program.as_bstr());
        return Ok(false);
    };

    debug!("LD_LIBRARY_PATH for {}: {}", host_program.as_bstr(), value);
    set_env(envp, b"LD_LIBRARY_PATH", &value);
    Ok(inhibit_rpath)
}

#[cfg(test)]
mod tests {
    use std::os::unix::ffi::OsStrExt;

    use super::*;
    use crate::execve::elf::tests::Elf64;

    fn program(dir: &tempfile::TempDir, elf: Elf64) -> Vec<u8> {
        let path = dir.path().join("program");
        std::fs::write(&path, elf.build()).unwrap();
        path.as_os_str().as_bytes().to_vec()
    }

    fn strings(items: &[&str]) -> Vec<BString> {
        items.iter().copied().map(BString::from).collect()
    }

    #[test]
    fn default_directories_under_the_host_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let path = program(&dir, Elf64::default());
        let mut envp = strings(&["HOME=/"]);
        let inhibit = rebuild_host_ldso_paths(&path, HOST_ROOTFS.into(), None, &mut envp).unwrap();
        assert!(!inhibit);
        assert_eq!(
            envp,
            strings(&[
                "HOME=/",
                "LD_LIBRARY_PATH=/host-rootfs/lib64:/host-rootfs/usr/lib64:/host-rootfs/usr/local/lib64\
                 :/host-rootfs/lib:/host-rootfs/usr/lib:/host-rootfs/usr/local/lib",
            ])
        );
    }

    #[test]
    fn rpath_comes_first_and_relative_entries_stay() {
        let dir = tempfile::tempdir().unwrap();
        let path = program(
            &dir,
            Elf64 {
                rpath: Some(b"/opt/app/lib:lib".to_vec()),
                ..Default::default()
            },
        );
        let mut envp = strings(&["LD_LIBRARY_PATH=/guest/lib"]);
        let initial = b"/srv/lib".as_slice();
        let inhibit =
            rebuild_host_ldso_paths(&path, HOST_ROOTFS.into(), Some(initial), &mut envp).unwrap();
        assert!(inhibit);
        assert_eq!(envp.len(), 1);
        assert!(envp[0].starts_with(
            b"LD_LIBRARY_PATH=/host-rootfs/opt/app/lib:lib:/host-rootfs/srv/lib:/host-rootfs/lib64:"
        ));
    }

    #[test]
    fn runpath_disables_rpath() {
        let dir = tempfile::tempdir().unwrap();
        let path = program(
            &dir,
            Elf64 {
                rpath: Some(b"/ignored".to_vec()),
                runpath: Some(b"/opt/run".to_vec()),
                ..Default::default()
            },
        );
        let mut envp = Vec::new();
        let initial = b"/srv/lib".as_slice();
        assert!(rebuild_host_ldso_paths(&path, HOST_ROOTFS.into(), Some(initial), &mut envp).unwrap());
        assert!(envp[0].starts_with(b"LD_LIBRARY_PATH=/host-rootfs/srv/lib:/host-rootfs/opt/run:"));
        assert!(!envp[0].contains_str("ignored"));
    }

    #[test]
    fn oversized_lists_leave_the_environment_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = program(&dir, Elf64::default());
        let initial = vec![b'/'; ARG_MAX];
        let mut envp = strings(&["LD_LIBRARY_PATH=/guest/lib"]);
        let inhibit =
            rebuild_host_ldso_paths(&path, HOST_ROOTFS.into(), Some(&initial[..]), &mut envp).unwrap();
        assert!(!inhibit);
        assert_eq!(envp, strings(&["LD_LIBRARY_PATH=/guest/lib"]));
    }
}
