//! Canonicalization of guest paths, `realpath(3)` done against the guest
//! rootfs and the bindings.

use bstr::{BStr, BString, ByteSlice};
use log::trace;
use nix::sys::stat::SFlag;

use crate::binding::{Side, Substitution};
use crate::error::ErrorKind;
use crate::glue::GlueOutcome;
use crate::path::{
    compare_paths, is_absolute, join, next_component, pop_component, Comparison, Finality,
    PATH_MAX,
};
use crate::proc::{readlink_proc, ProcLink};
use crate::tracee::TraceeContext;
use crate::translator::Translator;
use crate::utils;

/// Limit of nested symlinks, `MAXSYMLINKS` in `<sys/param.h>`.
pub const MAX_SYMLINKS: usize = 40;

/// On whose behalf a path is canonicalized.
pub enum Walk<'a> {
    /// A syscall argument of a tracee.
    Translate(&'a TraceeContext),
    /// The guest side of a binding being installed: missing components are
    /// glued instead of reported.
    Install {
        /// Type of the host side of the binding.
        final_type: SFlag,
        glued: Vec<GlueOutcome>,
    },
}

impl Walk<'_> {
    fn pid(&self) -> i32 {
        match self {
            Walk::Translate(ctx) => ctx.pid.as_raw(),
            Walk::Install { .. } => nix::unistd::getpid().as_raw(),
        }
    }

    fn tracee(&self) -> Option<&TraceeContext> {
        match self {
            Walk::Translate(ctx) => Some(ctx),
            Walk::Install { .. } => None,
        }
    }
}

enum Stat {
    Link,
    NotLink,
}

impl Translator {
    /// Host form of the canonical guest path `guest`.
    pub(crate) fn host_form(&self, guest: &BStr) -> Result<BString, ErrorKind> {
        let mut host = guest.to_owned();
        match self.bindings.substitute(Side::Guest, &mut host)? {
            Substitution::NotABinding => join(&[self.bindings.root().as_bytes(), guest.as_bytes()]),
            Substitution::NoSubstitutionNeeded | Substitution::Substituted => Ok(host),
        }
    }

    /// Compute the host form of `guest` and check that a non-final
    /// component is either a directory or a symlink. Observers hear about
    /// it when `notify` is set.
    fn unbind_stat(
        &mut self,
        walk: &mut Walk<'_>,
        finality: Finality,
        guest: &BStr,
        notify: bool,
    ) -> Result<(Stat, BString), ErrorKind> {
        let host = self.host_form(guest)?;
        if notify {
            self.notify(host.as_bstr());
        }

        let st = match utils::lstat(&host) {
            Ok(st) => Some(st),
            Err(e) => {
                if let Walk::Install { final_type, glued } = walk {
                    let outcome = self.glue.build(
                        &mut self.bindings,
                        guest,
                        host.as_bstr(),
                        finality,
                        *final_type,
                    )?;
                    glued.push(outcome);
                    let host = self.host_form(guest)?;
                    return Ok((Stat::NotLink, host));
                }
                trace!("lstat({host}): {e}");
                None
            }
        };
        let kind = st.as_ref().map(utils::file_type);

        if !finality.is_final()
            && kind != Some(SFlag::S_IFDIR)
            && kind != Some(SFlag::S_IFLNK)
            && !matches!(walk, Walk::Install { .. })
        {
            return Err(match kind {
                None => ErrorKind::NotFound,
                Some(_) => ErrorKind::NotADirectory,
            });
        }
        let stat = if kind == Some(SFlag::S_IFLNK) {
            Stat::Link
        } else {
            Stat::NotLink
        };
        Ok((stat, host))
    }

    /// Canonicalize `input` into `result`. A relative `input` is resolved
    /// against the guest directory already in `result`.
    ///
    /// The final symlink is followed only when `deref_final` is set, as
    /// `lstat(2)`-like syscalls require.
    pub fn canonicalize(
        &mut self,
        walk: &mut Walk<'_>,
        input: &BStr,
        deref_final: bool,
        result: &mut BString,
        depth: usize,
    ) -> Result<(), ErrorKind> {
        if depth > MAX_SYMLINKS {
            return Err(ErrorKind::SymlinkLoop);
        }
        if is_absolute(input) {
            *result = BString::from("/");
        } else if !is_absolute(result) {
            return Err(ErrorKind::InvalidArgument);
        }

        let mut cursor = input.as_bytes();
        let mut finality = Finality::NotFinal;
        while !finality.is_final() {
            let (component, next) = next_component(&mut cursor)?;
            finality = next;

            if component == b"." || component == b".." {
                if component == b".." {
                    pop_component(result);
                }
                if finality.is_final() {
                    finality = Finality::FinalForceDir;
                }
                continue;
            }

            let pid_component;
            let component = if component == b"self" && result.as_slice() == b"/proc" {
                pid_component = walk.pid().to_string();
                pid_component.as_bytes()
            } else {
                component
            };

            let tentative = join(&[result.as_slice(), component])?;
            let (stat, host) = self.unbind_stat(walk, finality, tentative.as_bstr(), true)?;

            if matches!(stat, Stat::NotLink) || (finality == Finality::Final && !deref_final) {
                *result = tentative;
                continue;
            }

            // some links in "/proc" are generated by the kernel for the host
            // namespace and have to be emulated
            let mut target = None;
            let comparison = compare_paths("/proc", result.as_slice());
            if matches!(comparison, Comparison::Equal | Comparison::FirstIsPrefix) {
                match readlink_proc(
                    self,
                    walk.tracee(),
                    result.as_bstr(),
                    component,
                    comparison,
                    host.as_bstr(),
                )? {
                    ProcLink::Canonicalize(emulated) => target = Some(emulated),
                    ProcLink::DontCanonicalize => match finality {
                        Finality::FinalForceDir => return Err(ErrorKind::NotADirectory),
                        Finality::Final => {
                            *result = tentative;
                            return Ok(());
                        }
                        Finality::NotFinal => {}
                    },
                    ProcLink::NotEmulated => {}
                }
            }

            let target = match target {
                Some(target) => target,
                None => {
                    let mut target = utils::readlink(&host)?;
                    if target.len() >= PATH_MAX {
                        return Err(ErrorKind::NameTooLong);
                    }
                    // absolute targets are host paths, ex. "/proc/self/cwd"
                    self.detranslate(&mut target, Some(host.as_bstr()))?;
                    target
                }
            };

            // relative targets are resolved against the directory of the
            // link, which `result` still holds
            self.canonicalize(walk, target.as_bstr(), true, result, depth + 1)?;

            // a non-final dereferenced link must be a directory, its
            // target was already notified
            let resolved = result.clone();
            let (stat, _) = self.unbind_stat(walk, finality, resolved.as_bstr(), false)?;
            if matches!(stat, Stat::Link) {
                log::warn!("{resolved} is still a link after dereference");
            }
        }

        // the marker of the path the tracee gave, not of link targets
        if depth == 0 && finality == Finality::FinalForceDir {
            *result = join(&[result.as_slice(), b""])?;
        }
        Ok(())
    }
}
