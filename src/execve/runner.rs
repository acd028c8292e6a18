//! Runner: a program (typically a user-mode emulator such as
//! `qemu-arm`) every guest program is launched through.

use std::os::unix::ffi::{OsStrExt, OsStringExt};

use bstr::{BStr, BString, ByteSlice};
use log::debug;
use nix::errno::Errno;
use nix::unistd::AccessFlags;

use crate::error::ConfigError;
use crate::execve::elf;
use crate::execve::ldso::HOST_ROOTFS;
use crate::path::join;
use crate::utils;

/// Environment variables the runner itself depends on: they are handed to
/// the guest program through the runner command line instead.
static RUNNER_ENV: phf::OrderedSet<&'static [u8]> = phf::phf_ordered_set! {
    b"LD_PRELOAD",
    b"LD_LIBRARY_PATH",
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Runner {
    /// Host path of the runner.
    pub program: BString,
    /// Its own arguments, from the comma-separated command.
    pub args: Vec<BString>,
    /// Accepts QEMU's `-0`, `-E` and `-U` options.
    pub qemu_like: bool,
    /// Guest path of the host `/`. Host programs are then run natively,
    /// not through the runner.
    pub host_rootfs: Option<BString>,
    /// `LD_LIBRARY_PATH` of the tracer, handed to native host programs.
    pub initial_ldso_paths: Option<BString>,
}

fn is_path_like(name: &[u8]) -> bool {
    name.starts_with(b"/") || name.starts_with(b"./") || name.starts_with(b"../")
}

/// Find `name` the way `execvp(3)` would.
fn which(name: &[u8], search_path: Option<&[u8]>) -> Result<BString, Errno> {
    if is_path_like(name) {
        return Ok(BString::from(name));
    }
    let search_path = search_path.unwrap_or(b"/usr/local/bin:/usr/bin:/bin");
    for dir in search_path.split_str(":") {
        let dir = if dir.is_empty() { b".".as_slice() } else { dir };
        let Ok(candidate) = join(&[dir, name]) else {
            continue;
        };
        if utils::access(&candidate, AccessFlags::X_OK).is_ok() {
            return Ok(candidate);
        }
    }
    Err(Errno::ENOENT)
}

impl Runner {
    /// `command` is `name[,arg1,arg2...]`.
    pub fn from_command(command: &str, qemu_like: bool) -> Result<Self, ConfigError> {
        let mut parts = command.split(',');
        let name = parts.next().unwrap_or_default();
        if name.is_empty() {
            return Err(ConfigError::Runner {
                name: command.to_string(),
                source: Errno::ENOENT,
            });
        }
        let search_path = std::env::var_os("PATH");
        let runner_error = |source| ConfigError::Runner {
            name: name.to_string(),
            source,
        };

        let found = which(name.as_bytes(), search_path.as_ref().map(|p| p.as_bytes()))
            .map_err(runner_error)?;
        let program = utils::realpath(&found).map_err(runner_error)?;
        utils::access(&program, AccessFlags::X_OK).map_err(runner_error)?;
        debug!("runner is {program}");

        Ok(Self {
            program,
            args: parts.map(BString::from).collect(),
            qemu_like,
            host_rootfs: qemu_like.then(|| BString::from(HOST_ROOTFS)),
            initial_ldso_paths: std::env::var_os("LD_LIBRARY_PATH")
                .map(|paths| BString::from(paths.into_vec())),
        })
    }

    /// Host programs skip the runner when the host rootfs is visible from
    /// the guest.
    pub fn runs_natively(&self, host_program: &[u8]) -> bool {
        self.host_rootfs.is_some() && elf::is_host_elf(host_program)
    }

    /// Rewrite `argv` and `envp` so that the runner launches `guest_program`
    /// in lieu of the tracee, `argv0` being what the program should see as
    /// its name. Returns whether `envp` changed.
    ///
    /// ```text
    ///   execve("/bin/true", { "true", NULL }, ...)
    ///     with -q 'qemu-arm,-cpu,cortex-a9' becomes
    ///   execve("/usr/bin/qemu-arm",
    ///          { "/usr/bin/qemu-arm", "-cpu", "cortex-a9", "-0", "true", "/bin/true", NULL }, ...)
    /// ```
    pub fn wrap(
        &self,
        guest_program: &BStr,
        argv0: &BStr,
        argv: &mut Vec<BString>,
        envp: &mut Vec<BString>,
    ) -> bool {
        let mut new_argv = Vec::with_capacity(argv.len() + self.args.len() + 8);
        new_argv.push(self.program.clone());
        new_argv.extend(self.args.iter().cloned());

        let mut env_changed = false;
        if self.qemu_like {
            for name in RUNNER_ENV.iter() {
                let position = envp.iter().position(|entry| {
                    entry.strip_prefix(*name).is_some_and(|rest| rest.starts_with(b"="))
                });
                match position {
                    Some(index) => {
                        new_argv.push(BString::from("-E"));
                        new_argv.push(envp.remove(index));
                        env_changed = true;
                    }
                    None => {
                        new_argv.push(BString::from("-U"));
                        new_argv.push(BString::from(*name));
                    }
                }
            }
            new_argv.push(BString::from("-0"));
            new_argv.push(argv0.to_owned());
        }

        new_argv.push(guest_program.to_owned());
        new_argv.extend(argv.iter().skip(1).cloned());
        *argv = new_argv;
        env_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<BString> {
        items.iter().copied().map(BString::from).collect()
    }

    fn runner(qemu_like: bool) -> Runner {
        Runner {
            program: "/usr/bin/qemu-arm".into(),
            args: strings(&["-cpu", "cortex-a9"]),
            qemu_like,
            host_rootfs: None,
            initial_ldso_paths: None,
        }
    }

    #[test]
    fn plain_runner_layout() {
        let mut argv = strings(&["true", "--help"]);
        let mut envp = strings(&["LD_PRELOAD=libfoo.so"]);
        let changed = runner(false).wrap(b"/bin/true".as_bstr(), b"true".as_bstr(), &mut argv, &mut envp);
        assert!(!changed);
        assert_eq!(
            argv,
            strings(&["/usr/bin/qemu-arm", "-cpu", "cortex-a9", "/bin/true", "--help"])
        );
        assert_eq!(envp, strings(&["LD_PRELOAD=libfoo.so"]));
    }

    #[test]
    fn qemu_runner_moves_loader_variables() {
        let mut argv = strings(&["true"]);
        let mut envp = strings(&["HOME=/root", "LD_PRELOAD=libfoo.so", "LD_PRELOADX=1"]);
        let changed = runner(true).wrap(b"/bin/true".as_bstr(), b"true".as_bstr(), &mut argv, &mut envp);
        assert!(changed);
        assert_eq!(
            argv,
            strings(&[
                "/usr/bin/qemu-arm",
                "-cpu",
                "cortex-a9",
                "-E",
                "LD_PRELOAD=libfoo.so",
                "-U",
                "LD_LIBRARY_PATH",
                "-0",
                "true",
                "/bin/true",
            ])
        );
        assert_eq!(envp, strings(&["HOME=/root", "LD_PRELOADX=1"]));
    }

    #[test]
    fn lookup_through_path() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("fake-runner");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&exe, std::os::unix::fs::PermissionsExt::from_mode(0o755))
            .unwrap();

        let search = dir.path().as_os_str().as_bytes();
        let found = which(b"fake-runner", Some(search)).unwrap();
        assert_eq!(found.as_slice(), exe.as_os_str().as_bytes());
        assert_eq!(which(b"no-such-runner", Some(search)), Err(Errno::ENOENT));
        assert_eq!(which(b"./relative", Some(search)).unwrap(), "./relative");
    }

    #[test]
    fn qemu_runner_sees_the_host_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("qemu-fake");
        std::fs::write(&exe, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&exe, std::os::unix::fs::PermissionsExt::from_mode(0o755))
            .unwrap();
        let command = exe.to_str().unwrap();

        let runner = Runner::from_command(command, true).unwrap();
        assert_eq!(runner.host_rootfs.as_ref().map(|p| p.as_bstr()), Some(HOST_ROOTFS.into()));
        let runner = Runner::from_command(command, false).unwrap();
        assert_eq!(runner.host_rootfs, None);
    }

    #[test]
    fn missing_runner_is_a_config_error() {
        assert!(matches!(
            Runner::from_command("/no/such/qemu,-L,/", true),
            Err(ConfigError::Runner { .. })
        ));
        assert!(matches!(
            Runner::from_command("", true),
            Err(ConfigError::Runner { .. })
        ));
    }
}
