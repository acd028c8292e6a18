use std::io::{BufRead, BufReader, Read};

use bstr::{BString, ByteSlice};

use crate::error::ErrorKind;
use crate::execve::ARG_MAX;
use crate::path::PATH_MAX;
use crate::utils;

/// `#!interpreter argument`, where the whole remainder of the line is one
/// single argument, spaces included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shebang {
    pub interpreter: BString,
    pub argument: Option<BString>,
}

fn is_blank(c: &u8) -> bool {
    matches!(c, b' ' | b'\t')
}

/// Parse the first line of a file. The end of `content` ends the
/// interpreter path, but an argument it cuts is dropped; a file ending
/// before the interpreter is not a script.
pub fn parse(content: &[u8]) -> Result<Option<Shebang>, ErrorKind> {
    let Some(rest) = content.strip_prefix(b"#!") else {
        return Ok(None);
    };
    let Some(start) = rest.iter().position(|c| !is_blank(c)) else {
        return Ok(None);
    };
    let rest = &rest[start..];
    let eol = rest.iter().position(|&c| c == b'\n' || c == b'\r');
    let line = &rest[..eol.unwrap_or(rest.len())];

    let interpreter_len = line.iter().position(is_blank).unwrap_or(line.len());
    let (interpreter, remainder) = line.split_at(interpreter_len);
    if interpreter.len() >= PATH_MAX {
        return Err(ErrorKind::NameTooLong);
    }
    if interpreter.is_empty() {
        return Err(ErrorKind::ExecFormat);
    }

    let remainder = remainder.trim_start_with(|c| c == ' ' || c == '\t');
    let remainder = remainder.trim_end_with(|c| c == ' ' || c == '\t');
    if remainder.len() >= ARG_MAX {
        return Err(ErrorKind::NameTooLong);
    }

    Ok(Some(Shebang {
        interpreter: BString::from(interpreter),
        argument: (eol.is_some() && !remainder.is_empty()).then(|| BString::from(remainder)),
    }))
}

/// Look for a shebang at the start of the host file `path`.
pub fn extract(path: &[u8]) -> Result<Option<Shebang>, ErrorKind> {
    let file = std::fs::File::open(utils::os(path))?;
    let limit = 2 + PATH_MAX + 1 + ARG_MAX + 1;
    let mut reader = BufReader::new(file.take(limit as u64));

    let mut magic = [0u8; 2];
    match reader.read_exact(&mut magic) {
        Ok(()) if &magic == b"#!" => {}
        Ok(()) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut line = magic.to_vec();
    reader.read_until(b'\n', &mut line)?;
    parse(&line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shebang(interpreter: &str, argument: Option<&str>) -> Option<Shebang> {
        Some(Shebang {
            interpreter: interpreter.into(),
            argument: argument.map(BString::from),
        })
    }

    #[test]
    fn interpreter_alone() {
        assert_eq!(parse(b"#!/bin/sh\necho hi\n"), Ok(shebang("/bin/sh", None)));
        assert_eq!(parse(b"#!  /bin/sh  \t\n"), Ok(shebang("/bin/sh", None)));
    }

    #[test]
    fn remainder_is_a_single_argument() {
        assert_eq!(
            parse(b"#!/usr/bin/env  python3 -u  \r\n"),
            Ok(shebang("/usr/bin/env", Some("python3 -u")))
        );
    }

    #[test]
    fn end_of_file() {
        assert_eq!(parse(b"#!/bin/sh"), Ok(shebang("/bin/sh", None)));
        assert_eq!(parse(b"#! /bin/sh \t"), Ok(shebang("/bin/sh", None)));
        // an argument without its end of line is lost
        assert_eq!(parse(b"#!/bin/sh -e"), Ok(shebang("/bin/sh", None)));
        assert_eq!(parse(b"#!/bin/sh -e\n"), Ok(shebang("/bin/sh", Some("-e"))));
        assert_eq!(parse(b"#!"), Ok(None));
        assert_eq!(parse(b"#!  \t"), Ok(None));
    }

    #[test]
    fn not_a_script() {
        assert_eq!(parse(b"\x7fELF\x02\x01"), Ok(None));
        assert_eq!(parse(b"#"), Ok(None));
        assert_eq!(parse(b""), Ok(None));
        assert_eq!(parse(b"#!\n"), Err(ErrorKind::ExecFormat));
    }

    #[test]
    fn overlong_parts() {
        let mut long_interp = b"#!/".to_vec();
        long_interp.extend(std::iter::repeat(b'a').take(PATH_MAX));
        assert_eq!(parse(&long_interp), Err(ErrorKind::NameTooLong));

        let mut long_arg = b"#!/bin/sh ".to_vec();
        long_arg.extend(std::iter::repeat(b'x').take(ARG_MAX));
        assert_eq!(parse(&long_arg), Err(ErrorKind::NameTooLong));
    }

    #[test]
    fn reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("script");
        std::fs::write(&script, "#!/bin/sh -x\nexit 0\n").unwrap();
        let binary = dir.path().join("binary");
        std::fs::write(&binary, [0x7f, b'E', b'L', b'F']).unwrap();
        let tiny = dir.path().join("tiny");
        std::fs::write(&tiny, "#").unwrap();

        use std::os::unix::ffi::OsStrExt;
        let bytes = |p: &std::path::Path| p.as_os_str().as_bytes().to_vec();
        assert_eq!(extract(&bytes(&script)), Ok(shebang("/bin/sh", Some("-x"))));
        assert_eq!(extract(&bytes(&binary)), Ok(None));
        assert_eq!(extract(&bytes(&tiny)), Ok(None));
        assert_eq!(
            extract(&bytes(&dir.path().join("missing"))),
            Err(ErrorKind::NotFound)
        );
    }
}
