//! Just enough of the ELF format to find the `PT_INTERP` program header
//! and the library search paths of the dynamic section.

use std::fs::File;
use std::os::unix::fs::FileExt;

use bstr::{BString, ByteSlice};

use crate::error::ErrorKind;
use crate::execve::ARG_MAX;
use crate::path::PATH_MAX;
use crate::utils;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;

const DT_NULL: u64 = 0;
const DT_STRTAB: u64 = 5;
const DT_RPATH: u64 = 15;
const DT_RUNPATH: u64 = 29;

/// `e_machine` values the host runs natively.
#[cfg(target_arch = "x86_64")]
pub const HOST_MACHINES: &[u16] = &[62, 3, 6];
#[cfg(target_arch = "aarch64")]
pub const HOST_MACHINES: &[u16] = &[183];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Class {
    Elf32,
    Elf64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    fn u16(self, bytes: &[u8]) -> u16 {
        let bytes = [bytes[0], bytes[1]];
        match self {
            Endian::Little => u16::from_le_bytes(bytes),
            Endian::Big => u16::from_be_bytes(bytes),
        }
    }

    fn u32(self, bytes: &[u8]) -> u32 {
        let bytes = [bytes[0], bytes[1], bytes[2], bytes[3]];
        match self {
            Endian::Little => u32::from_le_bytes(bytes),
            Endian::Big => u32::from_be_bytes(bytes),
        }
    }

    fn u64(self, bytes: &[u8]) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[..8]);
        match self {
            Endian::Little => u64::from_le_bytes(word),
            Endian::Big => u64::from_be_bytes(word),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElfHeader {
    pub class: Class,
    pub endian: Endian,
    pub machine: u16,
    pub phoff: u64,
    pub phentsize: u16,
    pub phnum: u16,
}

impl ElfHeader {
    /// Decode an ELF header, `bytes` being at least the 64 first bytes of
    /// the file (52 for ELF32).
    pub fn parse(bytes: &[u8]) -> Result<Self, ErrorKind> {
        if bytes.len() < 16 || &bytes[..4] != ELF_MAGIC {
            return Err(ErrorKind::ExecFormat);
        }
        let class = match bytes[4] {
            1 => Class::Elf32,
            2 => Class::Elf64,
            _ => return Err(ErrorKind::ExecFormat),
        };
        let endian = match bytes[5] {
            1 => Endian::Little,
            2 => Endian::Big,
            _ => return Err(ErrorKind::ExecFormat),
        };

        let header = match class {
            Class::Elf32 if bytes.len() >= 52 => ElfHeader {
                class,
                endian,
                machine: endian.u16(&bytes[18..]),
                phoff: endian.u32(&bytes[28..]) as u64,
                phentsize: endian.u16(&bytes[42..]),
                phnum: endian.u16(&bytes[44..]),
            },
            Class::Elf64 if bytes.len() >= 64 => ElfHeader {
                class,
                endian,
                machine: endian.u16(&bytes[18..]),
                phoff: endian.u64(&bytes[32..]),
                phentsize: endian.u16(&bytes[54..]),
                phnum: endian.u16(&bytes[56..]),
            },
            _ => return Err(ErrorKind::ExecFormat),
        };

        let expected_phentsize = match class {
            Class::Elf32 => 32,
            Class::Elf64 => 56,
        };
        if header.phnum >= 0xffff || header.phentsize != expected_phentsize {
            return Err(ErrorKind::Unsupported);
        }
        Ok(header)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ProgramHeader {
    kind: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
    memsz: u64,
}

impl ProgramHeader {
    fn parse(header: &ElfHeader, ph: &[u8]) -> Self {
        let endian = header.endian;
        match header.class {
            Class::Elf32 => ProgramHeader {
                kind: endian.u32(ph),
                offset: endian.u32(&ph[4..]) as u64,
                vaddr: endian.u32(&ph[8..]) as u64,
                filesz: endian.u32(&ph[16..]) as u64,
                memsz: endian.u32(&ph[20..]) as u64,
            },
            Class::Elf64 => ProgramHeader {
                kind: endian.u32(ph),
                offset: endian.u64(&ph[8..]),
                vaddr: endian.u64(&ph[16..]),
                filesz: endian.u64(&ph[32..]),
                memsz: endian.u64(&ph[40..]),
            },
        }
    }

    fn contains(&self, address: u64) -> bool {
        address >= self.vaddr && address - self.vaddr < self.memsz
    }
}

/// Read up to `len` bytes at `offset`, fewer at the end of the file.
fn read_exact_at(file: &File, len: usize, offset: u64) -> Result<Vec<u8>, ErrorKind> {
    let mut buf = vec![0; len];
    let mut done = 0;
    while done < len {
        let Some(at) = offset.checked_add(done as u64) else {
            break;
        };
        match file.read_at(&mut buf[done..], at) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    buf.truncate(done);
    Ok(buf)
}

/// An ELF file opened for inspection.
struct ElfFile {
    file: File,
    header: ElfHeader,
    program_headers: Vec<ProgramHeader>,
}

impl ElfFile {
    fn open(path: &[u8]) -> Result<Self, ErrorKind> {
        let file = File::open(utils::os(path))?;
        let header = ElfHeader::parse(&read_exact_at(&file, 64, 0)?)?;

        let mut program_headers = Vec::with_capacity(header.phnum as usize);
        for index in 0..header.phnum as u64 {
            let offset = (index * header.phentsize as u64)
                .checked_add(header.phoff)
                .ok_or(ErrorKind::ExecFormat)?;
            let ph = read_exact_at(&file, header.phentsize as usize, offset)?;
            if ph.len() < header.phentsize as usize {
                return Err(ErrorKind::ExecFormat);
            }
            program_headers.push(ProgramHeader::parse(&header, &ph));
        }
        Ok(Self {
            file,
            header,
            program_headers,
        })
    }

    fn find(&self, kind: u32) -> Option<&ProgramHeader> {
        self.program_headers.iter().find(|ph| ph.kind == kind)
    }

    /// `(d_tag, d_val)` entries of the `PT_DYNAMIC` segment, up to
    /// `DT_NULL`.
    fn dynamic_entries(&self) -> Result<Vec<(u64, u64)>, ErrorKind> {
        let Some(dynamic) = self.find(PT_DYNAMIC) else {
            return Ok(Vec::new());
        };
        let entry_size: u64 = match self.header.class {
            Class::Elf32 => 8,
            Class::Elf64 => 16,
        };
        if dynamic.filesz % entry_size != 0 || dynamic.filesz > ARG_MAX as u64 {
            return Err(ErrorKind::ExecFormat);
        }
        let bytes = read_exact_at(&self.file, dynamic.filesz as usize, dynamic.offset)?;
        if bytes.len() as u64 != dynamic.filesz {
            return Err(ErrorKind::ExecFormat);
        }

        let endian = self.header.endian;
        let mut entries = Vec::new();
        for entry in bytes.chunks_exact(entry_size as usize) {
            let (tag, value) = match self.header.class {
                Class::Elf32 => (endian.u32(entry) as u64, endian.u32(&entry[4..]) as u64),
                Class::Elf64 => (endian.u64(entry), endian.u64(&entry[8..])),
            };
            if tag == DT_NULL {
                break;
            }
            entries.push((tag, value));
        }
        Ok(entries)
    }

    /// Nul-terminated string at `offset`.
    fn string_at(&self, offset: u64) -> Result<BString, ErrorKind> {
        let bytes = read_exact_at(&self.file, ARG_MAX, offset)?;
        let end = bytes.find_byte(0).ok_or(ErrorKind::ExecFormat)?;
        Ok(BString::from(&bytes[..end]))
    }
}

/// Path of the program interpreter requested by the ELF file `path`, if
/// any.
pub fn extract_interp(path: &[u8]) -> Result<Option<BString>, ErrorKind> {
    let elf = ElfFile::open(path)?;
    let Some(interp) = elf.find(PT_INTERP) else {
        return Ok(None);
    };
    if interp.filesz >= PATH_MAX as u64 {
        return Err(ErrorKind::NameTooLong);
    }
    // a segment beyond the end of the file, like the kernel
    let bytes = read_exact_at(&elf.file, interp.filesz as usize, interp.offset)
        .map_err(|_| ErrorKind::AccessDenied)?;
    if bytes.len() as u64 != interp.filesz {
        return Err(ErrorKind::AccessDenied);
    }
    let end = bytes.find_byte(0).unwrap_or(bytes.len());
    Ok(Some(BString::from(&bytes[..end])))
}

/// Whether `path` is an ELF program the host runs natively. Anything
/// unreadable is not.
pub fn is_host_elf(path: &[u8]) -> bool {
    match ElfFile::open(path) {
        Ok(elf) => HOST_MACHINES.contains(&elf.header.machine),
        Err(_) => false,
    }
}

/// Search paths an ELF program gives its dynamic linker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LibraryPaths {
    pub class: Option<Class>,
    /// `DT_RPATH` entries, `:`-joined.
    pub rpath: Option<BString>,
    /// `DT_RUNPATH` entries, `:`-joined.
    pub runpath: Option<BString>,
}

fn append_paths(list: &mut Option<BString>, paths: BString) {
    match list {
        Some(list) => {
            list.push(b':');
            list.extend_from_slice(&paths);
        }
        None => *list = Some(paths),
    }
}

/// `DT_RPATH` and `DT_RUNPATH` of the ELF file `path`.
pub fn library_paths(path: &[u8]) -> Result<LibraryPaths, ErrorKind> {
    let elf = ElfFile::open(path)?;
    let mut paths = LibraryPaths {
        class: Some(elf.header.class),
        ..Default::default()
    };

    let entries = elf.dynamic_entries()?;
    // the first string table only
    let Some(&(_, strtab)) = entries.iter().find(|(tag, _)| *tag == DT_STRTAB) else {
        return Ok(paths);
    };
    let segment = elf
        .program_headers
        .iter()
        .find(|ph| ph.kind == PT_LOAD && ph.contains(strtab))
        .ok_or(ErrorKind::ExecFormat)?;
    let strtab_offset = segment
        .offset
        .checked_add(strtab - segment.vaddr)
        .ok_or(ErrorKind::ExecFormat)?;

    for &(tag, index) in &entries {
        let list = match tag {
            DT_RPATH => &mut paths.rpath,
            DT_RUNPATH => &mut paths.runpath,
            _ => continue,
        };
        let offset = strtab_offset.checked_add(index).ok_or(ErrorKind::ExecFormat)?;
        append_paths(list, elf.string_at(offset)?);
    }
    Ok(paths)
}
