use std::os::fd::RawFd;

use bstr::{BStr, BString, ByteSlice};
use log::{debug, trace, warn};
use nix::sys::stat::SFlag;

use crate::binding::{Binding, BindingSet, Side, Substitution};
use crate::canon::Walk;
use crate::error::{ConfigError, ErrorKind};
use crate::glue::Glue;
use crate::path::{check_length, compare_paths, is_absolute, strip_trailing_dir_marker, Comparison};
use crate::tracee::TraceeContext;
use crate::utils;

/// Hook fired with every host path the canonicalizer resolves.
pub trait AccessObserver {
    fn on_access(&self, host_path: &BStr);
}

impl<F: Fn(&BStr)> AccessObserver for F {
    fn on_access(&self, host_path: &BStr) {
        self(host_path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Translated {
    /// Canonical guest path.
    pub guest: BString,
    /// What the kernel gets.
    pub host: BString,
}

/// Everything a translation depends on: the rootfs, the bindings, the glue
/// and the observers. Built once at startup.
pub struct Translator {
    pub(crate) bindings: BindingSet,
    pub(crate) glue: Glue,
    observers: Vec<Box<dyn AccessObserver>>,
    runner_active: bool,
}

impl std::fmt::Debug for Translator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Translator")
            .field("bindings", &self.bindings)
            .field("glue", &self.glue)
            .field("observers", &self.observers.len())
            .field("runner_active", &self.runner_active)
            .finish()
    }
}

impl Translator {
    /// Use `rootfs` as the guest `/`.
    pub fn new(rootfs: impl AsRef<[u8]>, glue: Glue) -> Result<Self, ConfigError> {
        let rootfs = rootfs.as_ref();
        let root = utils::realpath(rootfs).map_err(|source| ConfigError::Rootfs {
            path: utils::os(rootfs).into(),
            source,
        })?;
        let st = utils::stat(&root).map_err(|source| ConfigError::Rootfs {
            path: utils::os(rootfs).into(),
            source,
        })?;
        if !utils::is_type(&st, SFlag::S_IFDIR) {
            return Err(ConfigError::Rootfs {
                path: utils::os(rootfs).into(),
                source: nix::errno::Errno::ENOTDIR,
            });
        }
        debug!("guest rootfs is {root}");
        Ok(Self {
            bindings: BindingSet::new(root),
            glue,
            observers: Vec::new(),
            runner_active: false,
        })
    }

    pub fn root(&self) -> &BStr {
        self.bindings.root()
    }

    pub fn bindings(&self) -> &BindingSet {
        &self.bindings
    }

    pub fn glue(&self) -> &Glue {
        &self.glue
    }

    pub fn add_observer(&mut self, observer: Box<dyn AccessObserver>) {
        self.observers.push(observer);
    }

    /// With a runner, the paths it opens itself are used untranslated until
    /// it opens the guest program.
    pub fn set_runner_active(&mut self, active: bool) {
        self.runner_active = active;
    }

    pub(crate) fn notify(&self, host_path: &BStr) {
        for observer in &self.observers {
            observer.on_access(host_path);
        }
    }

    pub fn register(
        &mut self,
        host: impl AsRef<[u8]>,
        guest: Option<&[u8]>,
        must_exist: bool,
    ) -> Result<(), ConfigError> {
        self.bindings.register(host, guest, must_exist)
    }

    /// Canonicalize the guest side of every registered binding and insert
    /// them, the latest declared first.
    pub fn install_bindings(&mut self) -> Result<(), ConfigError> {
        for declared in self.bindings.take_declared() {
            let final_type = match utils::lstat(&declared.host) {
                Ok(st) => match utils::file_type(&st) {
                    SFlag::S_IFBLK | SFlag::S_IFCHR => SFlag::S_IFREG,
                    other => other,
                },
                Err(_) => SFlag::S_IFREG,
            };

            let input = declared.guest_or_host().to_owned();
            let mut guest = BString::from("/");
            let mut walk = Walk::Install {
                final_type,
                glued: Vec::new(),
            };
            if let Err(kind) = self.canonicalize(&mut walk, input.as_bstr(), true, &mut guest, 0) {
                if declared.must_exist {
                    return Err(ConfigError::BindingGuest {
                        path: input.to_string(),
                        kind,
                    });
                }
                warn!("sanitizing the guest path (binding) \"{input}\": {kind}");
                continue;
            }
            if let Walk::Install { glued, .. } = &walk {
                if !glued.is_empty() {
                    debug!("{} glue entries for {}", glued.len(), guest);
                }
            }

            if guest.as_slice() == b"/" {
                warn!("can't create a binding in \"/\"");
                continue;
            }
            strip_trailing_dir_marker(&mut guest);
            self.bindings
                .insert(Binding::new(declared.host, guest, declared.must_exist));
        }
        Ok(())
    }

    /// Guest directory a dirfd of the tracee refers to.
    pub(crate) fn dirfd_base(&self, ctx: &TraceeContext, dirfd: RawFd) -> Result<BString, ErrorKind> {
        let link = format!("/proc/{}/fd/{}", ctx.pid, dirfd);
        let mut base = utils::readlink(link.as_bytes()).map_err(|_| ErrorKind::PermissionDenied)?;
        check_length(base.as_bstr())?;
        let st = utils::stat(&base)?;
        if !utils::is_type(&st, SFlag::S_IFDIR) {
            return Err(ErrorKind::NotADirectory);
        }
        self.detranslate(&mut base, None)?;
        Ok(base)
    }

    /// Translate the guest `path` of the tracee `ctx`, relative to `dirfd`
    /// (the cwd when `None`).
    pub fn translate(
        &mut self,
        ctx: &mut TraceeContext,
        dirfd: Option<RawFd>,
        path: &BStr,
        deref_final: bool,
    ) -> Result<Translated, ErrorKind> {
        check_length(path)?;
        let mut guest = if is_absolute(path) {
            BString::from("/")
        } else {
            match dirfd {
                None => ctx.cwd.clone(),
                Some(fd) => self.dirfd_base(ctx, fd)?,
            }
        };
        trace!("pid {}: translate(\"{}\" + \"{}\")", ctx.pid, guest, path);

        self.canonicalize(&mut Walk::Translate(ctx), path, deref_final, &mut guest, 0)?;

        if self.runner_active && ctx.is_delayed(path) {
            trace!("pid {}:          -> \"{}\" (delayed)", ctx.pid, path);
            return Ok(Translated {
                guest,
                host: path.to_owned(),
            });
        }

        let host = self.host_form(guest.as_bstr())?;
        trace!("pid {}:          -> \"{}\"", ctx.pid, host);
        Ok(Translated { guest, host })
    }

    /// Turn the host path `path` back into a guest path, in place.
    ///
    /// `referrer` is the host path of the symlink `path` was read from, if
    /// any. Without a referrer, a path outside of the guest namespace is an
    /// error. Returns whether `path` changed.
    pub fn detranslate(&self, path: &mut BString, referrer: Option<&BStr>) -> Result<bool, ErrorKind> {
        // relative symlink targets
        if !is_absolute(path) {
            return Ok(false);
        }

        let (sanity_check, follow_binding) = match referrer {
            None => (true, true),
            // links in "/proc" always point into the emulated namespace
            Some(referrer) if compare_paths("/proc", referrer) == Comparison::FirstIsPrefix => {
                (false, true)
            }
            // a link in a binding pointing into the same binding, ex. with
            // `-b /lib:/foo`, "/lib/a -> /lib/b" shows as "/foo/a -> /foo/b"
            Some(referrer) if !self.bindings.belongs_to_guestfs(referrer) => {
                let referee = self.bindings.resolve(Side::Host, path.as_slice());
                let container = self.bindings.resolve(Side::Host, referrer);
                let same = match (referee, container) {
                    (Some(referee), Some(container)) => {
                        compare_paths(&referee.host, &container.host) == Comparison::Equal
                    }
                    _ => false,
                };
                (false, same)
            }
            Some(_) => (false, false),
        };

        if follow_binding {
            match self.bindings.substitute(Side::Host, path)? {
                Substitution::NoSubstitutionNeeded => return Ok(false),
                Substitution::Substituted => return Ok(true),
                Substitution::NotABinding => {}
            }
        }

        let root = self.bindings.root();
        match compare_paths(root, path.as_slice()) {
            Comparison::FirstIsPrefix => {
                if root.as_bytes() != b"/" {
                    let stripped = BString::from(&path[root.len()..]);
                    *path = stripped;
                }
                Ok(true)
            }
            Comparison::Equal => {
                *path = BString::from("/");
                Ok(true)
            }
            _ if sanity_check => Err(ErrorKind::PermissionDenied),
            _ => Ok(false),
        }
    }
}
