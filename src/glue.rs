//! Glue between the guest rootfs and the guest side of deep bindings.
//!
//! Assuming the host path `/opt` is bound to the guest path
//! `/black/holes/and/revelations`, and that this path can't be created in the
//! guest rootfs, the missing components are created in a scratch directory
//! and bound there:
//!
//! ```text
//!   $GUEST/black/ --> $GLUE/black/
//!                              ./holes
//!                              ./holes/and
//!                              ./holes/and/revelations --> $HOST/opt/
//! ```

use std::path::{Path, PathBuf};

use bstr::{BStr, BString, ByteSlice};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::stat::{Mode, SFlag};

use crate::binding::{Binding, BindingSet};
use crate::error::ErrorKind;
use crate::path::{compare_paths, join, Finality};
use crate::utils::{self, nix_retry};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlueOutcome {
    /// Type of the node standing for the missing component.
    pub file_type: SFlag,
    /// A synthetic binding was added to the table.
    pub created_binding: bool,
}

#[derive(Debug)]
pub struct Glue {
    tmpdir: PathBuf,
    root: Option<BString>,
    pollute_rootfs: bool,
}

impl Glue {
    pub fn new(dont_pollute_rootfs: bool) -> Self {
        let tmpdir = std::env::var_os("TMPDIR")
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"));
        Self {
            tmpdir,
            root: None,
            pollute_rootfs: !dont_pollute_rootfs,
        }
    }

    /// Create the scratch directory under `dir` instead of `$TMPDIR`.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tmpdir = dir.into();
        self
    }

    pub fn root(&self) -> Option<&BStr> {
        self.root.as_ref().map(|root| root.as_bstr())
    }

    fn ensure_root(&mut self) -> Result<BString, ErrorKind> {
        if let Some(root) = &self.root {
            return Ok(root.clone());
        }
        let template = self
            .tmpdir
            .join(format!("rebind-{}-XXXXXX", std::process::id()));
        let created = nix::unistd::mkdtemp(&template)?;
        let created = utils::into_bstring(created.into_os_string());
        debug!("glue rootfs is {}", created);
        self.root = Some(created.clone());
        Ok(created)
    }

    /// Make the missing component `guest_path` (whose current host form is
    /// `host_path`) exist, either in place or in the scratch tree.
    pub fn build(
        &mut self,
        bindings: &mut BindingSet,
        guest_path: &BStr,
        host_path: &BStr,
        finality: Finality,
        final_type: SFlag,
    ) -> Result<GlueOutcome, ErrorKind> {
        let glue_root = self.ensure_root()?;
        let belongs_to_glue = compare_paths(&glue_root, host_path).first_contains_second();

        let (file_type, mode) = if finality.is_final() {
            let mode = if belongs_to_glue { 0o777 } else { 0 };
            (final_type, mode)
        } else {
            (SFlag::S_IFDIR, 0o777)
        };
        let in_place = GlueOutcome {
            file_type,
            created_binding: false,
        };

        if self.pollute_rootfs || belongs_to_glue {
            match create_node(host_path, file_type, mode) {
                Ok(()) | Err(Errno::EEXIST) => return Ok(in_place),
                // pointed to by the binding being installed anyway
                Err(_) if finality.is_final() => return Ok(in_place),
                Err(e) if belongs_to_glue => {
                    warn!("can't create glue entry {host_path}: {e}");
                    return Err(e.into());
                }
                Err(e) => debug!("can't create {host_path} in the rootfs ({e}), gluing it"),
            }
        } else if finality.is_final() {
            return Ok(in_place);
        }

        let glue_host = join(&[glue_root.as_slice(), guest_path.as_bytes()])?;
        std::fs::create_dir_all(utils::os(&glue_host)).map_err(ErrorKind::from)?;
        debug!("glue binding {} -> {}", guest_path, glue_host);
        bindings.insert(Binding::new(glue_host, guest_path, false));
        Ok(GlueOutcome {
            file_type: SFlag::S_IFDIR,
            created_binding: true,
        })
    }
}

fn create_node(path: &[u8], file_type: SFlag, mode: u32) -> Result<(), Errno> {
    let perm = Mode::from_bits_truncate(mode);
    if file_type == SFlag::S_IFDIR {
        nix_retry!(nix::unistd::mkdir(utils::os(path), perm))
    } else {
        nix_retry!(nix::sys::stat::mknod(utils::os(path), file_type, perm, 0))
    }
}

/// Delete only empty regular files and directories, the ones created by the
/// guest inside the glue are left, and so are other kinds of nodes.
fn remove_empty(path: &Path) -> bool {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return false;
    };
    if meta.is_dir() {
        let Ok(entries) = std::fs::read_dir(path) else {
            return false;
        };
        let mut empty = true;
        for entry in entries {
            match entry {
                Ok(entry) => empty &= remove_empty(&entry.path()),
                Err(_) => empty = false,
            }
        }
        empty && std::fs::remove_dir(path).is_ok()
    } else if meta.is_file() && meta.len() == 0 {
        std::fs::remove_file(path).is_ok()
    } else {
        false
    }
}

impl Drop for Glue {
    fn drop(&mut self) {
        if let Some(root) = &self.root {
            let root = Path::new(utils::os(root));
            if !remove_empty(root) {
                info!("can't delete '{}'", root.display());
            }
        }
    }
}
