use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::config::{BindingSpec, Config};
use crate::error::ConfigError;

#[derive(Debug, Parser)]
#[command(name = "rebind")]
#[command(version, about = "Run programs with a translated view of the filesystem", long_about = None)]
#[command(after_help = "EXAMPLES:
    # Run a shell in another rootfs, with the host /proc and /dev
    rebind -r ./alpine -b /proc -b /dev

    # Bind a host directory somewhere else in the guest
    rebind -r ./alpine -b $HOME:/home/user -w /home/user ls

    # Run foreign binaries with QEMU user-mode
    rebind -r ./arm64-rootfs -q qemu-aarch64 --qemu /bin/sh
")]
pub struct Cli {
    /// Guest rootfs
    #[arg(short, long, value_name = "PATH")]
    pub rootfs: Option<PathBuf>,

    /// Make the host path visible at the guest path (same path by default)
    #[arg(short = 'b', long = "bind", value_name = "HOST[:GUEST]")]
    pub bindings: Vec<BindingSpec>,

    /// Bind the usual host files and directories (/etc/passwd, /dev, /proc...)
    #[arg(short = 'B', long)]
    pub recommended: bool,

    /// Initial working directory, in the guest
    #[arg(short = 'w', long, value_name = "DIR")]
    pub cwd: Option<PathBuf>,

    /// Bind the host cwd and start in it
    #[arg(short = 'W', long, conflicts_with = "cwd")]
    pub here: bool,

    /// Execute guest programs through this runner
    #[arg(short = 'q', long, value_name = "RUNNER[,ARGS]")]
    pub runner: Option<String>,

    /// The runner is QEMU user-mode: guest LD_* variables are passed with -E/-U
    #[arg(long, requires = "runner")]
    pub qemu: bool,

    /// Don't run ELF programs through their interpreter (ld.so)
    #[arg(long)]
    pub no_elf_interp: bool,

    /// Create glue entries in a scratch directory only, never in the rootfs
    #[arg(long)]
    pub dont_pollute_rootfs: bool,

    /// JSON config file, the command line wins over it
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// More logs (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Command to run, /bin/sh by default
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    pub command: Vec<OsString>,
}

impl Cli {
    fn overrides(&self) -> Config {
        let mut bindings = self.bindings.clone();
        let mut cwd = self.cwd.clone();
        if self.here {
            bindings.push(BindingSpec {
                host: ".".into(),
                guest: None,
                must_exist: true,
            });
            cwd = Some(".".into());
        }
        Config {
            rootfs: self.rootfs.clone(),
            bindings,
            recommended_bindings: self.recommended,
            cwd,
            runner: self.runner.clone(),
            qemu: self.qemu,
            skip_elf_interp: self.no_elf_interp,
            dont_pollute_rootfs: self.dont_pollute_rootfs,
            command: self.command.clone(),
        }
    }

    /// The config file, if any, with the command line on top of it.
    pub fn config(&self) -> Result<Config, ConfigError> {
        let base = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        Ok(base.merge(self.overrides()))
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::path::Path;

    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn command_keeps_its_options() {
        let cli = Cli::parse_from([
            "rebind", "-r", "/srv/guest", "-b", "/proc", "-b", "/home:/mnt", "ls", "-la", "/",
        ]);
        assert_eq!(cli.rootfs.as_deref(), Some(Path::new("/srv/guest")));
        assert_eq!(cli.bindings.len(), 2);
        assert_eq!(cli.bindings[1].guest.as_deref(), Some(Path::new("/mnt")));
        assert_eq!(cli.command, vec!["ls", "-la", "/"]);
    }

    #[test]
    fn bad_binding() {
        assert!(Cli::try_parse_from(["rebind", "-b", ":/mnt"]).is_err());
    }

    #[test]
    fn verbosity() {
        let cli = Cli::parse_from(["rebind", "-vv"]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.command.is_empty());
    }

    #[test]
    fn qemu_needs_a_runner() {
        assert!(Cli::try_parse_from(["rebind", "--qemu", "ls"]).is_err());
        let cli = Cli::parse_from(["rebind", "-q", "qemu-arm,-cpu,max", "--qemu", "ls"]);
        assert_eq!(cli.runner.as_deref(), Some("qemu-arm,-cpu,max"));
    }

    #[test]
    fn here_binds_the_cwd() {
        let cli = Cli::parse_from(["rebind", "-W", "make"]);
        let config = cli.config().unwrap();
        assert_eq!(config.cwd.as_deref(), Some(Path::new(".")));
        assert_eq!(config.bindings[0].host, Path::new("."));
        assert!(Cli::try_parse_from(["rebind", "-W", "-w", "/tmp"]).is_err());
    }

    #[test]
    fn config_file_under_the_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rebind.json");
        std::fs::write(
            &path,
            r#"{ "rootfs": "/srv/a", "bindings": [{ "host": "/proc" }], "skip_elf_interp": true }"#,
        )
        .unwrap();
        let cli = Cli::parse_from([
            OsStr::new("rebind"),
            OsStr::new("-c"),
            path.as_os_str(),
            OsStr::new("-r"),
            OsStr::new("/srv/b"),
            OsStr::new("-b"),
            OsStr::new("/dev"),
        ]);
        let config = cli.config().unwrap();
        assert_eq!(config.rootfs.as_deref(), Some(Path::new("/srv/b")));
        assert!(config.skip_elf_interp);
        let hosts: Vec<_> = config.bindings.iter().map(|b| b.host.as_path()).collect();
        assert_eq!(hosts, [Path::new("/proc"), Path::new("/dev")]);
    }
}
