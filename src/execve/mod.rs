//! `execve(2)` needs a special treatment: the kernel would run the
//! interpreter of a script or of a dynamic ELF from the host namespace, so
//! the interpreter is resolved here and the program is passed to it
//! explicitly:
//!
//! ```text
//!   execve("/bin/script.sh", { "script.sh", "arg1", NULL }, envp)
//!     becomes
//!   execve("$ROOT/lib/ld.so", { "/lib/ld.so", "/bin/sh", "/bin/script.sh", "arg1", NULL }, envp)
//! ```

use bstr::{BStr, BString, ByteSlice};
use log::{debug, trace};
use nix::sys::stat::SFlag;
use nix::unistd::AccessFlags;

use crate::error::ErrorKind;
use crate::tracee::TraceeContext;
use crate::translator::{Translated, Translator};
use crate::utils;

pub mod args;
pub mod elf;
pub mod ldso;
pub mod runner;
pub mod shebang;

use runner::Runner;

/// `ARG_MAX` of Linux: bound of a single argument and of a shebang line.
pub const ARG_MAX: usize = 131072;

#[derive(Clone, Debug, Default)]
pub struct ExecveConfig {
    pub runner: Option<Runner>,
    /// Run dynamic ELF programs directly, letting the kernel load their
    /// interpreter.
    pub skip_elf_interp: bool,
}

/// An interpreter the program asks for, as written in the program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interpreter {
    pub path: BString,
    pub argument: Option<BString>,
}

fn detect_script(host_path: &[u8]) -> Result<Option<Interpreter>, ErrorKind> {
    Ok(shebang::extract(host_path)?.map(|s| Interpreter {
        path: s.interpreter,
        argument: s.argument,
    }))
}

/// `host_rootfs` prefixes the interpreter of host programs, which lives
/// in the host rootfs.
fn detect_elf(host_path: &[u8], host_rootfs: Option<&BStr>) -> Result<Option<Interpreter>, ErrorKind> {
    Ok(elf::extract_interp(host_path)?.map(|interp| {
        let path = match host_rootfs {
            Some(root) => {
                let mut path = BString::from(root.as_bytes());
                path.extend_from_slice(&interp);
                path
            }
            None => interp,
        };
        Interpreter {
            path,
            argument: None,
        }
    }))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecveResolution {
    /// What the kernel executes.
    pub host_path: BString,
    /// Canonical guest path of the program, `/proc/<pid>/exe` once the
    /// syscall succeeded.
    pub guest_path: BString,
    pub argv: Vec<BString>,
    pub envp: Vec<BString>,
    /// Number of programs inserted in front of the requested one.
    pub levels: usize,
    pub env_changed: bool,
}

impl ExecveResolution {
    pub fn argv_changed(&self) -> bool {
        self.levels > 0
    }
}

/// Translate `guest_path` and check that it exists, is executable and is a
/// regular file.
pub fn translate_and_check(
    translator: &mut Translator,
    ctx: &mut TraceeContext,
    guest_path: &BStr,
) -> Result<Translated, ErrorKind> {
    let translated = translator.translate(ctx, None, guest_path, true)?;
    let host = translated.host.as_slice();
    utils::access(host, AccessFlags::F_OK).map_err(|_| ErrorKind::NotFound)?;
    utils::access(host, AccessFlags::X_OK).map_err(|_| ErrorKind::AccessDenied)?;
    let st = utils::stat(host).map_err(|_| ErrorKind::PermissionDenied)?;
    if !utils::is_type(&st, SFlag::S_IFREG) {
        return Err(ErrorKind::PermissionDenied);
    }
    Ok(translated)
}

/// Replace `argv[0]` with `replacement`, shifting the other arguments.
pub fn substitute_argv0(argv: &mut Vec<BString>, replacement: Vec<BString>) {
    if argv.is_empty() {
        *argv = replacement;
    } else {
        argv.splice(0..1, replacement);
    }
}

/// Look for the interpreter `detect` reports for `program`, whose guest
/// path is `guest_program`. When there is one, it replaces `program` and
/// prefixes `argv`; its path is returned.
///
/// An interpreter doesn't request another interpreter on Linux: the
/// interpreter goes through `detect` once more and anything found there is
/// reported as `PermissionDenied`.
fn expand_interp(
    translator: &mut Translator,
    ctx: &mut TraceeContext,
    guest_program: &BStr,
    program: &mut Translated,
    argv: &mut Vec<BString>,
    detect: impl Fn(&[u8]) -> Result<Option<Interpreter>, ErrorKind>,
) -> Result<Option<BString>, ErrorKind> {
    let Some(interp) = detect(&program.host)? else {
        return Ok(None);
    };
    let translated = translate_and_check(translator, ctx, interp.path.as_bstr())?;
    if detect(&translated.host)?.is_some() {
        return Err(ErrorKind::PermissionDenied);
    }

    trace!(
        "expand interpreter: {} -> {} {} {}",
        argv.first().map_or(b"".as_bstr(), |a| a.as_bstr()),
        interp.path,
        interp.argument.as_ref().map_or(b"".as_bstr(), |a| a.as_bstr()),
        guest_program
    );
    let mut replacement = vec![interp.path.clone()];
    replacement.extend(interp.argument);
    replacement.push(guest_program.to_owned());
    substitute_argv0(argv, replacement);

    *program = translated;
    Ok(Some(interp.path))
}

/// Resolve the program `requested` of an `execve(2)` of the tracee `ctx`:
/// its script interpreter, then either the runner or its ELF interpreter.
pub fn resolve_execve(
    translator: &mut Translator,
    ctx: &mut TraceeContext,
    config: &ExecveConfig,
    requested: &BStr,
    mut argv: Vec<BString>,
    mut envp: Vec<BString>,
) -> Result<ExecveResolution, ErrorKind> {
    // a trigger left by a previous execve that failed
    ctx.trigger = None;

    let argv0 = argv.first().cloned().unwrap_or_else(|| requested.to_owned());
    let mut program = translate_and_check(translator, ctx, requested)?;
    let mut guest_program = requested.to_owned();
    let mut levels = 0;

    if let Some(interp) = expand_interp(
        translator,
        ctx,
        guest_program.as_bstr(),
        &mut program,
        &mut argv,
        detect_script,
    )? {
        guest_program = interp;
        levels += 1;
    }

    let mut env_changed = false;
    let host_path = match config.runner.as_ref() {
        Some(runner) if !runner.runs_natively(&program.host) => {
            let name = if levels > 0 { &guest_program } else { &argv0 };
            env_changed = runner.wrap(guest_program.as_bstr(), name.as_bstr(), &mut argv, &mut envp);
            // the runner opens its own files from the host until it reads
            // the program
            ctx.trigger = Some(guest_program.clone());
            levels += 1;
            runner.program.clone()
        }
        runner => {
            let host_rootfs = runner.and_then(|r| r.host_rootfs.as_ref().map(|root| (r, root.as_bstr())));
            let mut inhibit_rpath = false;
            if let Some((runner, root)) = host_rootfs {
                debug!("pid {}: {} runs natively", ctx.pid, program.host);
                let initial = runner.initial_ldso_paths.as_ref().map(|paths| paths.as_slice());
                inhibit_rpath = ldso::rebuild_host_ldso_paths(&program.host, root, initial, &mut envp)?;
                env_changed = true;
            }
            let root = host_rootfs.map(|(_, root)| root);
            if !config.skip_elf_interp
                && expand_interp(
                    translator,
                    ctx,
                    guest_program.as_bstr(),
                    &mut program,
                    &mut argv,
                    |path| detect_elf(path, root),
                )?
                .is_some()
            {
                levels += 1;
                if inhibit_rpath {
                    // the linker would search the guest paths of the program
                    argv.splice(1..1, [BString::from("--inhibit-rpath"), BString::from("")]);
                }
            }
            program.host.clone()
        }
    };

    debug!("pid {}: execve({}) -> {}", ctx.pid, requested, host_path);
    Ok(ExecveResolution {
        host_path,
        guest_path: program.guest,
        argv,
        envp,
        levels,
        env_changed,
    })
}

#[cfg(test)]
mod tests {
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::fs::PermissionsExt;

    use nix::unistd::Pid;

    use super::*;
    use crate::glue::Glue;

    struct Guest {
        dir: tempfile::TempDir,
        translator: Translator,
        ctx: TraceeContext,
    }

    impl Guest {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let translator =
                Translator::new(dir.path().as_os_str().as_bytes(), Glue::new(false)).unwrap();
            Self {
                dir,
                translator,
                ctx: TraceeContext::new(Pid::from_raw(1), "/"),
            }
        }

        fn file(&self, guest: &str, content: &[u8], mode: u32) {
            let path = self.dir.path().join(guest.trim_start_matches('/'));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, content).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        }

        fn host(&self, guest: &str) -> BString {
            let root = utils::realpath(self.dir.path().as_os_str().as_bytes()).unwrap();
            let mut host = root;
            host.extend_from_slice(guest.as_bytes());
            host
        }

        fn resolve(
            &mut self,
            config: &ExecveConfig,
            path: &str,
            argv: &[&str],
        ) -> Result<ExecveResolution, ErrorKind> {
            resolve_execve(
                &mut self.translator,
                &mut self.ctx,
                config,
                path.into(),
                argv.iter().copied().map(BString::from).collect(),
                vec![BString::from("HOME=/root")],
            )
        }
    }

    fn strings(items: &[&str]) -> Vec<BString> {
        items.iter().copied().map(BString::from).collect()
    }

    #[test]
    fn static_program() {
        let mut guest = Guest::new();
        guest.file("/bin/true", &elf::tests::elf64(None), 0o755);
        let res = guest.resolve(&ExecveConfig::default(), "/bin/true", &["true"]).unwrap();
        assert_eq!(res.host_path, guest.host("/bin/true"));
        assert_eq!(res.guest_path, "/bin/true");
        assert_eq!(res.argv, strings(&["true"]));
        assert_eq!(res.levels, 0);
        assert!(!res.argv_changed());
    }

    #[test]
    fn dynamic_program_runs_through_its_loader() {
        let mut guest = Guest::new();
        guest.file("/lib/ld.so", &elf::tests::elf64(None), 0o755);
        guest.file("/bin/ls", &elf::tests::elf64(Some(b"/lib/ld.so")), 0o755);
        let res = guest.resolve(&ExecveConfig::default(), "/bin/ls", &["ls", "-l"]).unwrap();
        assert_eq!(res.host_path, guest.host("/lib/ld.so"));
        assert_eq!(res.argv, strings(&["/lib/ld.so", "/bin/ls", "-l"]));
        assert_eq!(res.levels, 1);

        let config = ExecveConfig {
            skip_elf_interp: true,
            ..Default::default()
        };
        let res = guest.resolve(&config, "/bin/ls", &["ls"]).unwrap();
        assert_eq!(res.host_path, guest.host("/bin/ls"));
        assert_eq!(res.levels, 0);
    }

    #[test]
    fn script_then_loader() {
        let mut guest = Guest::new();
        guest.file("/lib/ld.so", &elf::tests::elf64(None), 0o755);
        guest.file("/bin/sh", &elf::tests::elf64(Some(b"/lib/ld.so")), 0o755);
        guest.file("/usr/bin/script", b"#!/bin/sh -e\nexit 0\n", 0o755);
        let res = guest
            .resolve(&ExecveConfig::default(), "/usr/bin/script", &["script", "a"])
            .unwrap();
        assert_eq!(res.host_path, guest.host("/lib/ld.so"));
        assert_eq!(
            res.argv,
            strings(&["/lib/ld.so", "/bin/sh", "-e", "/usr/bin/script", "a"])
        );
        assert_eq!(res.levels, 2);
    }

    #[test]
    fn interpreter_chains_are_refused() {
        let mut guest = Guest::new();
        guest.file("/bin/inner", b"#!/bin/sh\n", 0o755);
        guest.file("/bin/outer", b"#!/bin/inner\n", 0o755);
        assert_eq!(
            guest.resolve(&ExecveConfig::default(), "/bin/outer", &["outer"]),
            Err(ErrorKind::PermissionDenied)
        );

        guest.file("/lib/ld.so", &elf::tests::elf64(Some(b"/lib/ld2.so")), 0o755);
        guest.file("/bin/app", &elf::tests::elf64(Some(b"/lib/ld.so")), 0o755);
        assert_eq!(
            guest.resolve(&ExecveConfig::default(), "/bin/app", &["app"]),
            Err(ErrorKind::PermissionDenied)
        );
    }

    #[test]
    fn checks_on_the_program() {
        let mut guest = Guest::new();
        guest.file("/bin/data", b"not executable", 0o644);
        std::fs::create_dir_all(guest.dir.path().join("bin/dir")).unwrap();
        let config = ExecveConfig::default();
        assert_eq!(guest.resolve(&config, "/bin/missing", &[]), Err(ErrorKind::NotFound));
        assert_eq!(guest.resolve(&config, "/bin/data", &[]), Err(ErrorKind::AccessDenied));
        assert_eq!(guest.resolve(&config, "/bin/dir", &[]), Err(ErrorKind::PermissionDenied));
    }

    #[test]
    fn runner_takes_over() {
        let mut guest = Guest::new();
        guest.file("/bin/sh", &elf::tests::elf64(Some(b"/lib/ld.so")), 0o755);
        guest.file("/bin/script", b"#!/bin/sh\n", 0o755);
        let runner = Runner {
            program: "/usr/bin/qemu-arm".into(),
            args: strings(&["-L", "/"]),
            qemu_like: true,
            host_rootfs: None,
            initial_ldso_paths: None,
        };
        let config = ExecveConfig {
            runner: Some(runner),
            skip_elf_interp: false,
        };
        guest.ctx.trigger = Some("/stale".into());
        let res = guest.resolve(&config, "/bin/script", &["script"]).unwrap();
        assert_eq!(res.host_path, "/usr/bin/qemu-arm");
        assert_eq!(
            res.argv,
            strings(&[
                "/usr/bin/qemu-arm",
                "-L",
                "/",
                "-U",
                "LD_PRELOAD",
                "-U",
                "LD_LIBRARY_PATH",
                "-0",
                "/bin/sh",
                "/bin/sh",
                "/bin/script",
            ])
        );
        assert_eq!(res.levels, 2);
        assert!(!res.env_changed);
        assert_eq!(guest.ctx.trigger, Some(BString::from("/bin/sh")));
    }

    #[test]
    fn host_programs_skip_the_runner() {
        let hostfs = tempfile::tempdir().unwrap();
        let loader = hostfs.path().join("lib/ld-host.so");
        std::fs::create_dir_all(loader.parent().unwrap()).unwrap();
        std::fs::write(&loader, elf::tests::elf64(None)).unwrap();
        std::fs::set_permissions(&loader, std::fs::Permissions::from_mode(0o755)).unwrap();
        let hostfs_root = utils::realpath(hostfs.path().as_os_str().as_bytes()).unwrap();

        let mut guest = Guest::new();
        guest
            .translator
            .register(&hostfs_root, Some(ldso::HOST_ROOTFS.as_bytes()), true)
            .unwrap();
        guest.translator.install_bindings().unwrap();
        let native = elf::tests::Elf64 {
            machine: elf::HOST_MACHINES[0],
            interp: Some(b"/lib/ld-host.so".to_vec()),
            runpath: Some(b"/opt/lib".to_vec()),
            ..Default::default()
        };
        guest.file("/usr/bin/native", &native.build(), 0o755);
        guest.file("/usr/bin/foreign", &elf::tests::elf64(Some(b"/lib/ld.so")), 0o755);

        let runner = Runner {
            program: "/usr/bin/qemu-arm".into(),
            args: Vec::new(),
            qemu_like: true,
            host_rootfs: Some(ldso::HOST_ROOTFS.into()),
            initial_ldso_paths: None,
        };
        let config = ExecveConfig {
            runner: Some(runner),
            skip_elf_interp: false,
        };

        let res = guest.resolve(&config, "/usr/bin/native", &["native", "-v"]).unwrap();
        let mut loader_host = hostfs_root.clone();
        loader_host.extend_from_slice(b"/lib/ld-host.so");
        assert_eq!(res.host_path, loader_host);
        assert_eq!(
            res.argv,
            strings(&[
                "/host-rootfs/lib/ld-host.so",
                "--inhibit-rpath",
                "",
                "/usr/bin/native",
                "-v",
            ])
        );
        assert_eq!(res.levels, 1);
        assert!(res.env_changed);
        assert!(res.envp[1].starts_with(b"LD_LIBRARY_PATH=/host-rootfs/opt/lib:/host-rootfs/lib64:"));
        assert_eq!(guest.ctx.trigger, None);

        // foreign programs still go through the runner
        let res = guest.resolve(&config, "/usr/bin/foreign", &["foreign"]).unwrap();
        assert_eq!(res.host_path, "/usr/bin/qemu-arm");
        assert_eq!(guest.ctx.trigger, Some(BString::from("/usr/bin/foreign")));
    }

    #[test]
    fn substitute_in_empty_argv() {
        let mut argv = Vec::new();
        substitute_argv0(&mut argv, strings(&["/bin/sh", "/x"]));
        assert_eq!(argv, strings(&["/bin/sh", "/x"]));

        let mut argv = strings(&["x", "1"]);
        substitute_argv0(&mut argv, strings(&["/bin/sh", "/x"]));
        assert_eq!(argv, strings(&["/bin/sh", "/x", "1"]));
    }
}
