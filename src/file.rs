// A file on disk, with its content hash and ELF-ness computed once and
// cached for the rest of the value's lifetime.
//
// This is an explicit contract, not an incidental optimization: callers are
// allowed to query `hash()`/is_elf()/elf() as many times as they like without
// re-reading the file, because bundling the same executable's dependency
// closure touches the same libraries repeatedly.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::elf::{self, Elf};
use crate::error::Result;
use crate::hash;

pub struct File {
    source_path: PathBuf,
    hash: RefCell<Option<String>>,
    is_elf: RefCell<Option<bool>>,
    elf: RefCell<Option<Option<Rc<Elf>>>>,
}

impl File {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        File {
            source_path: path.as_ref().to_path_buf(),
            hash: RefCell::new(None),
            is_elf: RefCell::new(None),
            elf: RefCell::new(None),
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    /// The lowercase hex SHA-256 of the file's contents, computed once.
    pub fn hash(&self) -> Result<String> {
        if let Some(h) = self.hash.borrow().as_ref() {
            return Ok(h.clone());
        }
        let h = hash::sha256_file(&self.source_path)?;
        *self.hash.borrow_mut() = Some(h.clone());
        Ok(h)
    }

    /// Whether the file's first four bytes are the ELF magic, computed once.
    pub fn is_elf(&self) -> Result<bool> {
        if let Some(v) = *self.is_elf.borrow() {
            return Ok(v);
        }
        let v = elf::detect(&self.source_path)?;
        *self.is_elf.borrow_mut() = Some(v);
        Ok(v)
    }

    /// The parsed `Elf` view of this file, or `None` if it isn't ELF.
    /// Parsed at most once; subsequent calls return the cached view.
    pub fn elf(&self) -> Result<Option<Rc<Elf>>> {
        if let Some(cached) = self.elf.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let view = if self.is_elf()? {
            Some(Rc::new(Elf::open(&self.source_path)?))
        } else {
            None
        };
        *self.elf.borrow_mut() = Some(view.clone());
        Ok(view)
    }

    /// True iff the source file's executable bit is set for its owner.
    pub fn is_executable(&self) -> Result<bool> {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(&self.source_path)
            .map_err(|e| crate::error::BundleError::io(&self.source_path, e))?;
        Ok(meta.permissions().mode() & 0o111 != 0)
    }
}

impl PartialEq for File {
    fn eq(&self, other: &Self) -> bool {
        // Two Files are the same payload iff their content hashes match,
        // regardless of where each was found on disk. Callers only compare
        // Files whose hash has already been probed successfully (the Bundle
        // never holds onto a File it failed to hash), so the expect here
        // documents that precondition rather than guarding against it.
        self.hash().expect("File::eq on an unhashable file") == other.hash().expect("File::eq on an unhashable file")
    }
}

impl Eq for File {}

impl std::hash::Hash for File {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash().expect("File::hash on an unhashable file").hash(state)
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("source_path", &self.source_path)
            .field("hash", &*self.hash.borrow())
            .field("is_elf", &*self.is_elf.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn hash_is_computed_once() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"payload").unwrap();
        let file = File::new(f.path());
        let h1 = file.hash().unwrap();
        // Mutate the file on disk; the cached hash must not change, proving
        // the file was only read once.
        std::fs::write(f.path(), b"different payload").unwrap();
        let h2 = file.hash().unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn distinct_content_hashes_differ() {
        let mut a = tempfile::NamedTempFile::new().unwrap();
        a.write_all(b"aaa").unwrap();
        let mut b = tempfile::NamedTempFile::new().unwrap();
        b.write_all(b"bbb").unwrap();
        assert_ne!(File::new(a.path()).hash().unwrap(), File::new(b.path()).hash().unwrap());
    }

    #[test]
    fn equality_and_hashing_are_by_content() {
        use std::collections::HashSet;
        let mut a = tempfile::NamedTempFile::new().unwrap();
        a.write_all(b"identical bytes").unwrap();
        let mut b = tempfile::NamedTempFile::new().unwrap();
        b.write_all(b"identical bytes").unwrap();

        let file_a = File::new(a.path());
        let file_b = File::new(b.path());
        assert_eq!(file_a, file_b);

        let mut set = HashSet::new();
        set.insert(file_a);
        set.insert(file_b);
        assert_eq!(set.len(), 1, "two files with identical content should dedup in a set");
    }

    #[test]
    fn is_elf_is_false_for_plain_text() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"#!/bin/sh\necho hi\n").unwrap();
        assert!(!File::new(f.path()).is_elf().unwrap());
    }
}
