//! Byte-oriented path helpers shared by the binding table, the
//! canonicalizer and the syscall layer.
//!
//! Guest and host paths are raw bytes ([`BString`]), never `Path`s: the
//! tracee may hand us anything that isn't valid UTF-8, and we have to give
//! the exact same bytes back.

use bstr::{BStr, BString, ByteSlice};

use crate::error::ErrorKind;

pub const PATH_MAX: usize = libc::PATH_MAX as usize;
pub const NAME_MAX: usize = 255;

/// Position of a component inside the path being walked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Finality {
    NotFinal,
    Final,
    /// Last component, followed by a `/`: the caller expects a directory.
    FinalForceDir,
}

impl Finality {
    pub fn is_final(self) -> bool {
        !matches!(self, Finality::NotFinal)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    FirstIsPrefix,
    SecondIsPrefix,
    NotComparable,
}

impl Comparison {
    /// `true` when the first path is the second one or one of its parents.
    pub fn first_contains_second(self) -> bool {
        matches!(self, Comparison::Equal | Comparison::FirstIsPrefix)
    }
}

/// Extract the first component under `cursor` and move the cursor past it
/// and past the separators that follow.
pub fn next_component<'a>(cursor: &mut &'a [u8]) -> Result<(&'a [u8], Finality), ErrorKind> {
    let rest = *cursor;
    let start = rest.iter().position(|&c| c != b'/').unwrap_or(rest.len());
    let rest = &rest[start..];

    let length = rest.iter().position(|&c| c == b'/').unwrap_or(rest.len());
    if length > NAME_MAX {
        return Err(ErrorKind::NameTooLong);
    }
    let (component, rest) = rest.split_at(length);

    let want_dir = !rest.is_empty();
    let skip = rest.iter().position(|&c| c != b'/').unwrap_or(rest.len());
    *cursor = &rest[skip..];

    let finality = match (cursor.is_empty(), want_dir) {
        (false, _) => Finality::NotFinal,
        (true, true) => Finality::FinalForceDir,
        (true, false) => Finality::Final,
    };
    Ok((component, finality))
}

/// Remove the last component of the absolute `path`. `/` is left untouched.
pub fn pop_component(path: &mut BString) {
    if path.len() <= 1 {
        return;
    }

    let mut offset = path.len() - 1;
    while offset > 1 && path[offset] == b'/' {
        offset -= 1;
    }
    while offset > 1 && path[offset] != b'/' {
        offset -= 1;
    }
    path.truncate(offset);
}

/// Concatenate `segments`, putting exactly one `/` between two of them.
///
/// An empty segment still contributes a separator, which is how a trailing
/// `/` gets appended on purpose.
pub fn join(segments: &[&[u8]]) -> Result<BString, ErrorKind> {
    let mut out = BString::new(Vec::with_capacity(
        segments.iter().map(|s| s.len() + 1).sum(),
    ));
    for segment in segments {
        let mut segment = *segment;
        if !out.is_empty() {
            let ends_with_sep = out.last() == Some(&b'/');
            let starts_with_sep = segment.first() == Some(&b'/');
            if ends_with_sep && starts_with_sep {
                segment = &segment[1..];
            } else if !ends_with_sep && !starts_with_sep {
                out.push(b'/');
            }
        }
        out.extend_from_slice(segment);
    }

    if out.len() >= PATH_MAX {
        return Err(ErrorKind::NameTooLong);
    }
    Ok(out)
}

/// Compare two canonical paths of the same namespace, component-wise.
/// A single trailing `/` is ignored on both sides.
pub fn compare_paths(path1: impl AsRef<[u8]>, path2: impl AsRef<[u8]>) -> Comparison {
    fn compare_paths_inner(path1: &[u8], path2: &[u8]) -> Comparison {
        if path1.is_empty() || path2.is_empty() {
            return Comparison::NotComparable;
        }

        let path1 = path1.strip_suffix(b"/").unwrap_or(path1);
        let path2 = path2.strip_suffix(b"/").unwrap_or(path2);

        let (length_min, sentinel) = if path1.len() < path2.len() {
            (path1.len(), path2[path1.len()])
        } else {
            (path2.len(), path1.get(path2.len()).copied().unwrap_or(0))
        };

        if sentinel != b'/' && sentinel != 0 {
            return Comparison::NotComparable;
        }
        if path1[..length_min] != path2[..length_min] {
            return Comparison::NotComparable;
        }

        match path1.len().cmp(&path2.len()) {
            std::cmp::Ordering::Equal => Comparison::Equal,
            std::cmp::Ordering::Less => Comparison::FirstIsPrefix,
            std::cmp::Ordering::Greater => Comparison::SecondIsPrefix,
        }
    }

    compare_paths_inner(path1.as_ref(), path2.as_ref())
}

/// Length check applied to every path read from a tracee.
pub fn check_length(path: &BStr) -> Result<(), ErrorKind> {
    if path.len() >= PATH_MAX {
        return Err(ErrorKind::NameTooLong);
    }
    Ok(())
}

/// Drop the trailing `/` or `/.` of a canonical path, keeping `/` intact.
pub fn strip_trailing_dir_marker(path: &mut BString) {
    let len = path.len();
    if len > 2 && path.ends_with(b"/.") {
        path.truncate(len - 2);
    } else if len > 1 && path.ends_with(b"/") {
        path.truncate(len - 1);
    }
}

pub fn is_absolute(path: &[u8]) -> bool {
    path.first() == Some(&b'/')
}

pub(crate) fn display(path: &[u8]) -> &BStr {
    path.as_bstr()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn components(path: &str) -> Vec<(String, Finality)> {
        let mut cursor = path.as_bytes();
        let mut out = Vec::new();
        loop {
            let (component, finality) = next_component(&mut cursor).unwrap();
            out.push((String::from_utf8(component.to_vec()).unwrap(), finality));
            if finality.is_final() {
                break;
            }
        }
        out
    }

    #[test]
    fn next_component_walks_and_flags_trailing_slash() {
        assert_eq!(
            components("/usr//lib/"),
            vec![
                ("usr".to_string(), Finality::NotFinal),
                ("lib".to_string(), Finality::FinalForceDir)
            ]
        );
        assert_eq!(
            components("a/b"),
            vec![
                ("a".to_string(), Finality::NotFinal),
                ("b".to_string(), Finality::Final)
            ]
        );
        assert_eq!(components("/"), vec![(String::new(), Finality::Final)]);
    }

    #[test]
    fn next_component_rejects_long_names() {
        let long = format!("/{}", "x".repeat(NAME_MAX + 1));
        let mut cursor = long.as_bytes();
        assert_eq!(next_component(&mut cursor), Err(ErrorKind::NameTooLong));
    }

    #[test]
    fn pop_never_goes_past_root() {
        let mut path = BString::from("/a/b");
        pop_component(&mut path);
        assert_eq!(path, "/a");
        pop_component(&mut path);
        assert_eq!(path, "/");
        pop_component(&mut path);
        assert_eq!(path, "/");
    }

    #[test]
    fn join_puts_single_separators() {
        assert_eq!(join(&[b"/", b"usr"]).unwrap(), "/usr");
        assert_eq!(join(&[b"/root/", b"/usr"]).unwrap(), "/root/usr");
        assert_eq!(join(&[b"/root", b"usr"]).unwrap(), "/root/usr");
        assert_eq!(join(&[b"/root", b""]).unwrap(), "/root/");
        assert_eq!(join(&[b"/", b""]).unwrap(), "/");
    }

    #[test]
    fn join_refuses_overflow() {
        let long = vec![b'a'; PATH_MAX];
        assert_eq!(join(&[b"/", long.as_slice()]), Err(ErrorKind::NameTooLong));
    }

    #[test]
    fn comparisons() {
        assert_eq!(compare_paths("/usr", "/usr/"), Comparison::Equal);
        assert_eq!(compare_paths("/usr", "/usr/lib"), Comparison::FirstIsPrefix);
        assert_eq!(compare_paths("/usr/lib", "/usr"), Comparison::SecondIsPrefix);
        assert_eq!(compare_paths("/usr", "/usrlocal"), Comparison::NotComparable);
        assert_eq!(compare_paths("/", "/etc"), Comparison::FirstIsPrefix);
        assert_eq!(compare_paths("/", "/"), Comparison::Equal);
        assert_eq!(compare_paths("", "/"), Comparison::NotComparable);
    }

    #[test]
    fn trailing_markers_are_stripped() {
        let mut path = BString::from("/usr/.");
        strip_trailing_dir_marker(&mut path);
        assert_eq!(path, "/usr");
        let mut path = BString::from("/usr/");
        strip_trailing_dir_marker(&mut path);
        assert_eq!(path, "/usr");
        let mut path = BString::from("/");
        strip_trailing_dir_marker(&mut path);
        assert_eq!(path, "/");
    }
}
