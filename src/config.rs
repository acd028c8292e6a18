//! Startup configuration: an optional JSON file, overridden by the command
//! line.

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info};

use crate::error::ConfigError;
use crate::execve::ldso::HOST_ROOTFS;
use crate::execve::runner::Runner;
use crate::execve::ExecveConfig;
use crate::glue::Glue;
use crate::translator::Translator;

/// Host paths most programs expect to find, bound when they exist.
pub const RECOMMENDED_BINDINGS: &[&str] = &[
    "/etc/host.conf",
    "/etc/hosts",
    "/etc/hosts.equiv",
    "/etc/mtab",
    "/etc/netgroup",
    "/etc/networks",
    "/etc/passwd",
    "/etc/group",
    "/etc/nsswitch.conf",
    "/etc/resolv.conf",
    "/etc/localtime",
    "/dev/",
    "/sys/",
    "/proc/",
    "/tmp/",
    "/run/",
    "/var/run/dbus/system_bus_socket",
    "$HOME",
];

fn must_exist_default() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingSpec {
    pub host: PathBuf,
    /// Same as `host` when missing.
    #[serde(default)]
    pub guest: Option<PathBuf>,
    #[serde(default = "must_exist_default")]
    pub must_exist: bool,
}

impl BindingSpec {
    fn optional(host: &str) -> Self {
        Self {
            host: expand_variable(host),
            guest: None,
            must_exist: false,
        }
    }
}

/// A leading `$NAME` is replaced by the value of this environment
/// variable, when set.
fn expand_variable(path: &str) -> PathBuf {
    if let Some(name) = path.strip_prefix('$') {
        if let Some(value) = std::env::var_os(name) {
            return PathBuf::from(value);
        }
    }
    PathBuf::from(path)
}

impl FromStr for BindingSpec {
    type Err = ConfigError;

    /// `host[:guest]`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, guest) = match s.split_once(':') {
            Some((host, guest)) => (host, Some(guest)),
            None => (s, None),
        };
        if host.is_empty() || guest.is_some_and(str::is_empty) {
            return Err(ConfigError::BindingSyntax(s.to_string()));
        }
        Ok(Self {
            host: expand_variable(host),
            guest: guest.map(PathBuf::from),
            must_exist: true,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Guest rootfs, `/` by default.
    pub rootfs: Option<PathBuf>,
    pub bindings: Vec<BindingSpec>,
    /// Add [`RECOMMENDED_BINDINGS`].
    pub recommended_bindings: bool,
    /// Initial guest cwd.
    pub cwd: Option<PathBuf>,
    /// `program[,arg1,arg2...]`
    pub runner: Option<String>,
    /// The runner is QEMU user-mode.
    pub qemu: bool,
    pub skip_elf_interp: bool,
    pub dont_pollute_rootfs: bool,
    /// Command line only.
    #[serde(skip)]
    pub command: Vec<OsString>,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        fn from_file_inner(path: &Path) -> Result<Config, ConfigError> {
            let content = std::fs::read(path).map_err(|source| ConfigError::ConfigFile {
                path: path.to_path_buf(),
                source,
            })?;
            let config = serde_json::from_slice(&content).map_err(|source| {
                ConfigError::ConfigParse {
                    path: path.to_path_buf(),
                    source,
                }
            })?;
            debug!("loaded {}", path.display());
            Ok(config)
        }

        from_file_inner(path.as_ref())
    }

    /// Apply `over` on top of `self`: options set in `over` win, bindings
    /// are appended.
    pub fn merge(mut self, over: Config) -> Config {
        self.rootfs = over.rootfs.or(self.rootfs);
        self.bindings.extend(over.bindings);
        self.recommended_bindings |= over.recommended_bindings;
        self.cwd = over.cwd.or(self.cwd);
        self.runner = over.runner.or(self.runner);
        self.qemu |= over.qemu;
        self.skip_elf_interp |= over.skip_elf_interp;
        self.dont_pollute_rootfs |= over.dont_pollute_rootfs;
        if !over.command.is_empty() {
            self.command = over.command;
        }
        self
    }

    /// Every binding, in declaration order.
    pub fn declared_bindings(&self) -> Vec<BindingSpec> {
        let mut bindings = Vec::new();
        if self.recommended_bindings {
            bindings.extend(RECOMMENDED_BINDINGS.iter().map(|host| BindingSpec::optional(host)));
        }
        bindings.extend(self.bindings.iter().cloned());
        bindings
    }

    /// The rootfs with every binding installed.
    pub fn translator(&self) -> Result<Translator, ConfigError> {
        let rootfs = self.rootfs.clone().unwrap_or_else(|| PathBuf::from("/"));
        let glue = Glue::new(self.dont_pollute_rootfs);
        let mut translator = Translator::new(rootfs.as_os_str().as_bytes(), glue)?;

        for spec in self.declared_bindings() {
            translator.register(
                spec.host.as_os_str().as_bytes(),
                spec.guest.as_ref().map(|guest| guest.as_os_str().as_bytes()),
                spec.must_exist,
            )?;
        }
        if self.runner.is_some() && self.qemu {
            // where native host programs find their loader and libraries
            translator.register("/", Some(HOST_ROOTFS.as_bytes()), true)?;
        }
        translator.install_bindings()?;
        info!("guest rootfs = {}", translator.root());
        translator.bindings().dump();
        Ok(translator)
    }

    pub fn execve(&self) -> Result<ExecveConfig, ConfigError> {
        let runner = self
            .runner
            .as_deref()
            .map(|command| Runner::from_command(command, self.qemu))
            .transpose()?;
        Ok(ExecveConfig {
            runner,
            skip_elf_interp: self.skip_elf_interp,
        })
    }

    /// The command to launch, `/bin/sh` when none is given.
    pub fn command(&self) -> Vec<OsString> {
        if self.command.is_empty() {
            vec![OsString::from_vec(b"/bin/sh".to_vec())]
        } else {
            self.command.clone()
        }
    }
}
