//! The binding table.
//!
//! Every binding is kept once in `bindings` and referenced from two
//! orderings, one per side. In each ordering a binding comes before the
//! bindings containing it, so the first match of a scan is always the most
//! specific one:
//!
//! ```text
//!   -b /bin:/foo/bin -b /usr/bin/more:/foo/bin/more
//!
//!   guest order: /foo/bin/more, /foo/bin, /
//! ```

use bstr::{BStr, BString, ByteSlice};
use log::{info, warn};
use nix::errno::Errno;

use crate::error::{ConfigError, ErrorKind};
use crate::path::{compare_paths, Comparison, PATH_MAX};
use crate::utils;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub host: BString,
    pub guest: BString,
    /// `false` for symmetric bindings, where both sides are the same text.
    pub needs_substitution: bool,
    pub must_exist: bool,
}

impl Binding {
    pub fn new(host: impl Into<BString>, guest: impl Into<BString>, must_exist: bool) -> Self {
        let host = host.into();
        let guest = guest.into();
        let needs_substitution = compare_paths(&host, &guest) != Comparison::Equal;
        Self {
            host,
            guest,
            needs_substitution,
            must_exist,
        }
    }

    fn side(&self, side: Side) -> &BStr {
        match side {
            Side::Guest => self.guest.as_bstr(),
            Side::Host => self.host.as_bstr(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Guest,
    Host,
}

impl Side {
    pub fn reverse(self) -> Side {
        match self {
            Side::Guest => Side::Host,
            Side::Host => Side::Guest,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Substitution {
    NotABinding,
    /// The path is under a symmetric binding: it is valid as is.
    NoSubstitutionNeeded,
    Substituted,
}

/// A binding as declared by the user, before its guest side got
/// canonicalized against the root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Declared {
    pub host: BString,
    pub guest: Option<BString>,
    pub must_exist: bool,
}

impl Declared {
    pub fn guest_or_host(&self) -> &BStr {
        self.guest.as_ref().unwrap_or(&self.host).as_bstr()
    }
}

#[derive(Debug)]
pub struct BindingSet {
    root: BString,
    bindings: Vec<Binding>,
    guest_order: Vec<usize>,
    host_order: Vec<usize>,
    declared: Vec<Declared>,
}

impl BindingSet {
    /// Create the table with the mandatory binding of the guest `/` onto the
    /// (already canonical) host `root`.
    pub fn new(root: impl Into<BString>) -> Self {
        let root = root.into();
        let mut this = Self {
            root: root.clone(),
            bindings: Vec::new(),
            guest_order: Vec::new(),
            host_order: Vec::new(),
            declared: Vec::new(),
        };
        this.insert(Binding::new(root, "/", true));
        this
    }

    pub fn root(&self) -> &BStr {
        self.root.as_bstr()
    }

    /// Record a binding request. The host side is resolved right now, the
    /// guest side later, once the root binding is installed.
    pub fn register(
        &mut self,
        host: impl AsRef<[u8]>,
        guest: Option<&[u8]>,
        must_exist: bool,
    ) -> Result<(), ConfigError> {
        let host = host.as_ref();
        let resolved = match utils::realpath(host) {
            Ok(resolved) => resolved,
            Err(source) if must_exist => {
                return Err(ConfigError::BindingHost {
                    path: utils::os(host).into(),
                    source,
                })
            }
            Err(e) => {
                log::debug!("skipping optional binding {}: {e}", host.as_bstr());
                return Ok(());
            }
        };
        if resolved.len() >= PATH_MAX {
            return Err(ConfigError::BindingHost {
                path: utils::os(host).into(),
                source: Errno::ENAMETOOLONG,
            });
        }
        self.declared.push(Declared {
            host: resolved,
            guest: guest.map(BString::from),
            must_exist,
        });
        Ok(())
    }

    /// Hand the registered bindings over for installation, the latest
    /// declared first.
    pub fn take_declared(&mut self) -> Vec<Declared> {
        let mut declared = std::mem::take(&mut self.declared);
        declared.reverse();
        declared
    }

    pub fn len(&self) -> usize {
        self.guest_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guest_order.is_empty()
    }

    /// Bindings in the order they are scanned for `side`.
    pub fn iter(&self, side: Side) -> impl Iterator<Item = &Binding> + '_ {
        let order = match side {
            Side::Guest => &self.guest_order,
            Side::Host => &self.host_order,
        };
        order.iter().map(|&index| &self.bindings[index])
    }

    /// Whether the host path `path` lies inside the guest rootfs.
    pub fn belongs_to_guestfs(&self, path: impl AsRef<[u8]>) -> bool {
        compare_paths(&self.root, path).first_contains_second()
    }

    /// Find the most specific binding whose `side` contains `path`.
    pub fn resolve(&self, side: Side, path: impl AsRef<[u8]>) -> Option<&Binding> {
        let path = path.as_ref();
        // a binding of a rootfs subdirectory would otherwise match the
        // rootfs itself, ex. `-r /usr/local/slackware -b /usr:/location`
        if side == Side::Host && self.root.as_slice() != b"/" && self.belongs_to_guestfs(path) {
            return None;
        }
        self.iter(side)
            .find(|binding| compare_paths(binding.side(side), path).first_contains_second())
    }

    /// Replace in `path` the leading `side` part of its binding by the other
    /// side.
    pub fn substitute(&self, side: Side, path: &mut BString) -> Result<Substitution, ErrorKind> {
        let Some(binding) = self.resolve(side, path.as_slice()) else {
            return Ok(Substitution::NotABinding);
        };
        if !binding.needs_substitution {
            return Ok(Substitution::NoSubstitutionNeeded);
        }

        let reference = binding.side(side);
        let replacement = binding.side(side.reverse());
        let tail = &path[reference.len().min(path.len())..];

        let substituted: BString = if replacement.as_bytes() == b"/" {
            // `-b /:/foo`, "/foo/bin" becomes "/bin" not "//bin"
            if tail.is_empty() {
                BString::from("/")
            } else {
                BString::from(tail)
            }
        } else if reference.as_bytes() == b"/" {
            // `-b /:/foo`, "/bin" becomes "/foo/bin" not "/foobin"
            let mut out = BString::from(replacement.as_bytes());
            if path.as_slice() != b"/" {
                out.extend_from_slice(path);
            }
            out
        } else {
            let mut out = BString::from(replacement.as_bytes());
            out.extend_from_slice(tail);
            out
        };

        if substituted.len() >= PATH_MAX {
            return Err(ErrorKind::NameTooLong);
        }
        *path = substituted;
        Ok(Substitution::Substituted)
    }

    /// Add a fully canonicalized binding to both orderings.
    ///
    /// Returns `false` when an installed binding already uses the same guest
    /// path: the installed one is kept since bindings are installed from the
    /// latest declared to the first.
    pub fn insert(&mut self, binding: Binding) -> bool {
        if let Some(existing) = self
            .iter(Side::Guest)
            .find(|existing| compare_paths(&binding.guest, &existing.guest) == Comparison::Equal)
        {
            warn!(
                "both '{}' and '{}' are bound to '{}', only the last binding is active.",
                existing.host, binding.host, binding.guest
            );
            return false;
        }

        let index = self.bindings.len();
        let guest_at = Self::insertion_point(&self.bindings, &self.guest_order, &binding, Side::Guest);
        let host_at = Self::insertion_point(&self.bindings, &self.host_order, &binding, Side::Host);
        self.bindings.push(binding);
        self.guest_order.insert(guest_at, index);
        self.host_order.insert(host_at, index);
        true
    }

    /// Right after the last binding the new one contains (or is equal to, on
    /// the host side), otherwise at the head.
    fn insertion_point(bindings: &[Binding], order: &[usize], new: &Binding, side: Side) -> usize {
        order
            .iter()
            .rposition(|&index| {
                matches!(
                    compare_paths(new.side(side), bindings[index].side(side)),
                    Comparison::FirstIsPrefix | Comparison::Equal
                )
            })
            .map_or(0, |position| position + 1)
    }

    /// Log every binding, `host` for symmetric ones and `host:guest`
    /// otherwise.
    pub fn dump(&self) {
        for binding in self.iter(Side::Guest) {
            if binding.needs_substitution {
                info!("binding = {}:{}", binding.host, binding.guest);
            } else {
                info!("binding = {}", binding.host);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(root: &str, bindings: &[(&str, &str)]) -> BindingSet {
        let mut set = BindingSet::new(root);
        for (host, guest) in bindings {
            set.insert(Binding::new(*host, *guest, true));
        }
        set
    }

    fn guests(set: &BindingSet) -> Vec<String> {
        set.iter(Side::Guest).map(|b| b.guest.to_string()).collect()
    }

    #[test]
    fn most_specific_binding_is_scanned_first() {
        let set = set(
            "/rootfs",
            &[("/bin", "/foo/bin"), ("/usr/bin/more", "/foo/bin/more")],
        );
        assert_eq!(guests(&set), vec!["/foo/bin/more", "/foo/bin", "/"]);

        let set = set_reversed();
        assert_eq!(guests(&set), vec!["/foo/bin/more", "/foo/bin", "/"]);
    }

    fn set_reversed() -> BindingSet {
        set(
            "/rootfs",
            &[("/usr/bin/more", "/foo/bin/more"), ("/bin", "/foo/bin")],
        )
    }

    #[test]
    fn guest_substitution() {
        let set = set("/rootfs", &[("/home/me/data", "/data")]);
        let mut path = BString::from("/data/file");
        assert_eq!(
            set.substitute(Side::Guest, &mut path),
            Ok(Substitution::Substituted)
        );
        assert_eq!(path, "/home/me/data/file");

        let mut path = BString::from("/etc/passwd");
        assert_eq!(
            set.substitute(Side::Guest, &mut path),
            Ok(Substitution::Substituted)
        );
        assert_eq!(path, "/rootfs/etc/passwd");

        let mut path = BString::from("/");
        set.substitute(Side::Guest, &mut path).unwrap();
        assert_eq!(path, "/rootfs");
    }

    #[test]
    fn host_substitution_skips_rootfs_paths() {
        let set = set("/usr/local/slackware", &[("/usr", "/location")]);

        let mut path = BString::from("/usr/local/slackware/bin");
        assert_eq!(
            set.substitute(Side::Host, &mut path),
            Ok(Substitution::NotABinding)
        );

        let mut path = BString::from("/usr/lib");
        assert_eq!(
            set.substitute(Side::Host, &mut path),
            Ok(Substitution::Substituted)
        );
        assert_eq!(path, "/location/lib");
    }

    #[test]
    fn root_replacement_and_root_reference() {
        let set = set("/", &[("/", "/foo")]);

        let mut path = BString::from("/foo/bin");
        set.substitute(Side::Guest, &mut path).unwrap();
        assert_eq!(path, "/bin");

        let mut path = BString::from("/foo");
        set.substitute(Side::Guest, &mut path).unwrap();
        assert_eq!(path, "/");

        let mut path = BString::from("/bin");
        // host "/" is shared by the root binding and `/:/foo`, the root
        // binding was installed first and is symmetric
        assert_eq!(
            set.substitute(Side::Host, &mut path),
            Ok(Substitution::NoSubstitutionNeeded)
        );
    }

    #[test]
    fn root_reference_prefixes_the_replacement() {
        let mut set = BindingSet {
            root: BString::from("/"),
            bindings: Vec::new(),
            guest_order: Vec::new(),
            host_order: Vec::new(),
            declared: Vec::new(),
        };
        set.insert(Binding::new("/", "/foo", true));

        let mut path = BString::from("/bin");
        set.substitute(Side::Host, &mut path).unwrap();
        assert_eq!(path, "/foo/bin");

        let mut path = BString::from("/");
        set.substitute(Side::Host, &mut path).unwrap();
        assert_eq!(path, "/foo");
    }

    #[test]
    fn symmetric_binding_needs_no_substitution() {
        let set = set("/rootfs", &[("/dev", "/dev")]);
        let mut path = BString::from("/dev/null");
        assert_eq!(
            set.substitute(Side::Guest, &mut path),
            Ok(Substitution::NoSubstitutionNeeded)
        );
        assert_eq!(path, "/dev/null");
    }

    #[test]
    fn guest_duplicates_keep_the_installed_binding() {
        let mut set = set("/rootfs", &[("/b", "/x")]);
        assert!(!set.insert(Binding::new("/a", "/x", true)));
        assert_eq!(set.len(), 2);
        assert_eq!(set.resolve(Side::Guest, "/x/y").unwrap().host, "/b");
    }

    #[test]
    fn host_duplicates_resolve_to_the_first_installed() {
        let set = set("/rootfs", &[("/data", "/one"), ("/data", "/two")]);
        assert_eq!(set.resolve(Side::Host, "/data/f").unwrap().guest, "/one");
    }

    #[test]
    fn substitution_overflow_is_an_error() {
        let long_host = format!("/{}", "h/".repeat(PATH_MAX / 2 - 8));
        let set = set("/rootfs", &[(long_host.as_str(), "/g")]);
        let mut path = BString::from(format!("/g/{}", "x".repeat(64)));
        assert_eq!(
            set.substitute(Side::Guest, &mut path),
            Err(ErrorKind::NameTooLong)
        );
    }

    #[test]
    fn registering_a_missing_host() {
        let mut set = BindingSet::new("/");
        assert!(set
            .register("/no/such/host/path", None, false)
            .is_ok());
        assert!(set.take_declared().is_empty());
        assert!(matches!(
            set.register("/no/such/host/path", None, true),
            Err(ConfigError::BindingHost { .. })
        ));
    }

    #[test]
    fn declared_bindings_come_back_latest_first() {
        let mut set = BindingSet::new("/");
        set.register("/", Some(b"/a".as_slice()), true).unwrap();
        set.register("/", Some(b"/b".as_slice()), true).unwrap();
        let declared = set.take_declared();
        assert_eq!(declared[0].guest_or_host(), "/b");
        assert_eq!(declared[1].guest_or_host(), "/a");
    }
}
