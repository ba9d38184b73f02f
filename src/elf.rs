// Minimal ELF header parser.
//
// Reads only the bytes it needs - the 16-byte e_ident, the handful of header
// fields that locate the program header table, and the program headers
// themselves - rather than mapping or loading the whole file. 32-bit and
// 64-bit layouts share one code path driven by a small field-offset table
// instead of two parallel implementations.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::byteutils::{bytes_to_int, Endianness};
use crate::error::{BundleError, Result};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_NIDENT: usize = 16;
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;

const PT_INTERP: u64 = 3;

/// A single `(offset, width)` pair describing where a field lives relative to
/// the start of its containing structure.
#[derive(Clone, Copy)]
struct Field {
    offset: usize,
    width: usize,
}

/// The header fields needed to locate the program header table, for one
/// ELF class.
struct EhdrLayout {
    e_phoff: Field,
    e_phentsize: Field,
    e_phnum: Field,
}

const EHDR32: EhdrLayout = EhdrLayout {
    e_phoff: Field { offset: 28, width: 4 },
    e_phentsize: Field { offset: 42, width: 2 },
    e_phnum: Field { offset: 44, width: 2 },
};

const EHDR64: EhdrLayout = EhdrLayout {
    e_phoff: Field { offset: 32, width: 8 },
    e_phentsize: Field { offset: 54, width: 2 },
    e_phnum: Field { offset: 56, width: 2 },
};

/// The program header fields this parser cares about, for one ELF class.
struct PhdrLayout {
    p_type: Field,
    p_offset: Field,
    p_filesz: Field,
}

const PHDR32: PhdrLayout = PhdrLayout {
    p_type: Field { offset: 0, width: 4 },
    p_offset: Field { offset: 4, width: 4 },
    p_filesz: Field { offset: 16, width: 4 },
};

const PHDR64: PhdrLayout = PhdrLayout {
    p_type: Field { offset: 0, width: 4 },
    p_offset: Field { offset: 8, width: 8 },
    p_filesz: Field { offset: 32, width: 8 },
};

/// A parsed ELF executable or shared object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elf {
    pub source_path: PathBuf,
    pub bits: u8,
    pub endianness: Endianness,
    pub interpreter: Option<PathBuf>,
}

/// True iff the first four bytes of `path` match the ELF magic.
pub fn detect<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| BundleError::io(path, e))?;
    let mut buf = [0u8; 4];
    match file.read_exact(&mut buf) {
        Ok(()) => Ok(buf == ELF_MAGIC),
        // Files shorter than 4 bytes are simply not ELF.
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(BundleError::io(path, e)),
    }
}

impl Elf {
    /// Parses the ELF header and program headers of `path`, extracting the
    /// interpreter (`PT_INTERP`) if present.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Elf> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path).map_err(|e| BundleError::io(&path, e))?;

        let mut ident = [0u8; EI_NIDENT];
        file.read_exact(&mut ident)
            .map_err(|_| BundleError::NotElf { path: path.clone() })?;

        if ident[0..4] != ELF_MAGIC {
            return Err(BundleError::NotElf { path });
        }

        let bits = match ident[EI_CLASS] {
            1 => 32u8,
            2 => 64u8,
            other => {
                return Err(malformed(&path, &format!("invalid EI_CLASS {other}")));
            }
        };
        let endianness = match ident[EI_DATA] {
            1 => Endianness::Little,
            2 => Endianness::Big,
            other => {
                return Err(malformed(&path, &format!("invalid EI_DATA {other}")));
            }
        };

        let ehdr = if bits == 32 { &EHDR32 } else { &EHDR64 };
        let phdr = if bits == 32 { &PHDR32 } else { &PHDR64 };

        let phoff = read_field(&mut file, &path, 0, ehdr.e_phoff, endianness)?;
        let phentsize = read_field(&mut file, &path, 0, ehdr.e_phentsize, endianness)? as usize;
        let phnum = read_field(&mut file, &path, 0, ehdr.e_phnum, endianness)? as usize;

        let interpreter = find_interpreter(&mut file, &path, phoff, phentsize, phnum, phdr, endianness)?;

        Ok(Elf {
            source_path: path,
            bits,
            endianness,
            interpreter,
        })
    }
}

fn read_field(
    file: &mut File,
    path: &Path,
    base: u64,
    field: Field,
    endianness: Endianness,
) -> Result<u64> {
    file.seek(SeekFrom::Start(base + field.offset as u64))
        .map_err(|e| BundleError::io(path, e))?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf[..field.width])
        .map_err(|e| BundleError::io(path, e))?;
    bytes_to_int(&buf[..field.width], endianness).map_err(|_| malformed(path, "invalid integer field"))
}

#[allow(clippy::too_many_arguments)]
fn find_interpreter(
    file: &mut File,
    path: &Path,
    phoff: u64,
    phentsize: usize,
    phnum: usize,
    phdr: &PhdrLayout,
    endianness: Endianness,
) -> Result<Option<PathBuf>> {
    if phentsize == 0 {
        return Ok(None);
    }
    for i in 0..phnum {
        let base = phoff + (i * phentsize) as u64;
        let p_type = read_field(file, path, base, phdr.p_type, endianness)?;
        if p_type != PT_INTERP {
            continue;
        }
        let p_offset = read_field(file, path, base, phdr.p_offset, endianness)?;
        let p_filesz = read_field(file, path, base, phdr.p_filesz, endianness)? as usize;

        file.seek(SeekFrom::Start(p_offset))
            .map_err(|e| BundleError::io(path, e))?;
        let mut buf = vec![0u8; p_filesz];
        file.read_exact(&mut buf).map_err(|e| BundleError::io(path, e))?;
        while buf.last() == Some(&0) {
            buf.pop();
        }
        let interp = String::from_utf8(buf)
            .map_err(|_| malformed(path, "PT_INTERP is not valid UTF-8"))?;
        return Ok(Some(PathBuf::from(interp)));
    }
    Ok(None)
}

fn malformed(path: &Path, reason: &str) -> BundleError {
    BundleError::MalformedElf {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}
