//! Emulation of the `/proc` links the kernel would resolve in the host
//! namespace.

use bstr::{BStr, BString, ByteSlice};

use crate::error::ErrorKind;
use crate::path::{Comparison, PATH_MAX};
use crate::tracee::TraceeContext;
use crate::translator::Translator;
use crate::utils;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcLink {
    /// The link is emulated, its guest target still has to be
    /// canonicalized.
    Canonicalize(BString),
    /// The target isn't a path (`pipe:[1234]`, `socket:[...]`).
    DontCanonicalize,
    NotEmulated,
}

#[derive(Clone, Copy, Debug)]
enum PerProcess {
    Cwd,
    Exe,
    Root,
}

static PER_PROCESS: phf::Map<&'static [u8], PerProcess> = phf::phf_map! {
    b"cwd" => PerProcess::Cwd,
    b"exe" => PerProcess::Exe,
    b"root" => PerProcess::Root,
};

fn parse_pid(bytes: &[u8]) -> Option<i32> {
    bytes.to_str().ok()?.parse().ok()
}

/// Resolve the link `component`, found in the guest directory `base` which
/// lies under `/proc`. `link_host` is the host form of the link.
pub fn readlink_proc(
    translator: &Translator,
    ctx: Option<&TraceeContext>,
    base: &BStr,
    component: &[u8],
    comparison: Comparison,
    link_host: &BStr,
) -> Result<ProcLink, ErrorKind> {
    // links directly under "/proc" ("self", "thread-self") are rewritten
    // or left to the kernel
    if comparison != Comparison::FirstIsPrefix {
        return Ok(ProcLink::NotEmulated);
    }
    let Some(rest) = base.strip_prefix(b"/proc/") else {
        return Ok(ProcLink::NotEmulated);
    };

    let mut fields = rest.split_str("/");
    let Some(pid) = fields.next().and_then(parse_pid) else {
        return Ok(ProcLink::NotEmulated);
    };
    match (fields.next(), fields.next()) {
        (None, _) => {
            let Some(ctx) = ctx.filter(|ctx| ctx.pid.as_raw() == pid) else {
                return Ok(ProcLink::NotEmulated);
            };
            let Some(entry) = PER_PROCESS.get(component) else {
                return Ok(ProcLink::NotEmulated);
            };
            let target = match entry {
                PerProcess::Cwd => ctx.cwd.clone(),
                PerProcess::Exe => match &ctx.exe {
                    Some(exe) => exe.clone(),
                    None => return Ok(ProcLink::NotEmulated),
                },
                PerProcess::Root => BString::from("/"),
            };
            Ok(ProcLink::Canonicalize(target))
        }
        (Some(b"fd"), None) => {
            if parse_pid(component).is_none() {
                return Ok(ProcLink::NotEmulated);
            }
            let mut target = utils::readlink(link_host)?;
            if target.len() >= PATH_MAX {
                return Err(ErrorKind::NameTooLong);
            }
            if !target.starts_with(b"/") {
                return Ok(ProcLink::DontCanonicalize);
            }
            translator.detranslate(&mut target, Some(link_host))?;
            Ok(ProcLink::Canonicalize(target))
        }
        _ => Ok(ProcLink::NotEmulated),
    }
}
