// Assembles a content-addressed, relocatable bundle for one or more
// executables: places every file in the dependency closure into a
// deduplicated store keyed by content hash, links it back in at its
// original logical path, and emits a launcher per executable.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::deps;
use crate::elf::Elf;
use crate::error::{BundleError, Result};
use crate::file::File;
use crate::launcher;

/// Construction-time configuration shared by every executable added to a
/// `Bundle`. Plays the same role the teacher's `Config<'a>` plays for
/// dependency resolution: one borrowed/owned struct threaded through the
/// builder instead of a handful of loose parameters.
#[derive(Debug, Clone, Default)]
pub struct BundleOptions {
    pub ldd_binary: PathBuf,
    pub chroot: Option<PathBuf>,
    pub rename: Vec<(String, String)>,
    pub strict: bool,
}

impl BundleOptions {
    pub fn new(ldd_binary: impl Into<PathBuf>) -> Self {
        BundleOptions {
            ldd_binary: ldd_binary.into(),
            chroot: None,
            rename: Vec::new(),
            strict: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(chroot) = &self.chroot {
            if !chroot.is_dir() {
                return Err(BundleError::InvalidInput(format!(
                    "chroot {} is not a directory",
                    chroot.display()
                )));
            }
        }
        let mut seen_new = HashSet::new();
        let mut seen_old = HashSet::new();
        for (old, new) in &self.rename {
            if new.contains('/') || new.is_empty() {
                return Err(BundleError::InvalidInput(format!("invalid rename target {new:?}")));
            }
            if !seen_new.insert(new.as_str()) {
                return Err(BundleError::InvalidInput(format!("duplicate rename target {new:?}")));
            }
            if !seen_old.insert(old.as_str()) {
                return Err(BundleError::InvalidInput(format!("duplicate rename source {old:?}")));
            }
        }
        Ok(())
    }

    fn renamed(&self, original: &str) -> &str {
        self.rename
            .iter()
            .find(|(old, _)| old == original)
            .map(|(_, new)| new.as_str())
            .unwrap_or(original)
    }
}

/// A bundle under construction. Owns a private staging directory (removed
/// automatically on drop unless `finalize` has consumed it) and the store/
/// symlink bookkeeping needed to deduplicate payloads across executables.
pub struct Bundle {
    tempdir: Option<tempfile::TempDir>,
    bundle_id: String,
    options: BundleOptions,
    store: HashMap<String, PathBuf>,
    links: HashMap<PathBuf, String>,
    launcher_names: HashSet<String>,
}

impl Bundle {
    pub fn new(options: BundleOptions) -> Result<Bundle> {
        options.validate()?;
        let tempdir = tempfile::Builder::new()
            .prefix("exodus-")
            .tempdir()
            .map_err(|e| BundleError::io(std::env::temp_dir(), e))?;
        let bundle_id = tempdir
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("bundle")
            .to_string();
        fs::create_dir_all(tempdir.path().join("bin")).map_err(|e| BundleError::io(tempdir.path(), e))?;

        Ok(Bundle {
            tempdir: Some(tempdir),
            bundle_id,
            options,
            store: HashMap::new(),
            links: HashMap::new(),
            launcher_names: HashSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        self.tempdir
            .as_ref()
            .expect("Bundle used after finalize")
            .path()
    }

    pub fn store_entry_count(&self) -> usize {
        self.store.len()
    }

    pub fn launcher_count(&self) -> usize {
        self.launcher_names.len()
    }

    fn bundle_root_rel(&self) -> PathBuf {
        Path::new("usr/lib/exodus/bundles").join(&self.bundle_id)
    }

    /// Adds one executable (and its full dependency closure) to the bundle,
    /// emitting a launcher at `bin/<name>` (or `bin/<newname>` if renamed).
    pub fn add_executable(&mut self, path: &Path) -> Result<()> {
        let path = &resolve_executable(path)?;
        let elf = Elf::open(path)?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| BundleError::InvalidInput(format!("{} has no file name", path.display())))?;
        let launcher_name = self.options.renamed(name).to_string();
        if !self.launcher_names.insert(launcher_name.clone()) {
            return Err(BundleError::InvalidInput(format!(
                "launcher name {launcher_name:?} already claimed"
            )));
        }

        let binary_file = File::new(path);
        let binary_hash = binary_file.hash()?;
        let binary_store_rel = self.place_payload(&binary_file)?;
        let binary_symlink_rel = self
            .bundle_root_rel()
            .join("bin")
            .join(format!("{launcher_name}-x"));
        self.place_symlink(&binary_symlink_rel, &binary_store_rel, &binary_hash)?;

        let all_deps = deps::find_all_library_dependencies(
            &self.options.ldd_binary,
            self.options.chroot.as_deref(),
            path,
            self.options.strict,
        )?;

        // Sorted by original absolute path, so LIBPATH ordering is
        // deterministic and matches the order the spec describes.
        let sorted_deps: BTreeSet<PathBuf> = all_deps.into_iter().collect();

        let mut lib_dirs_rel: Vec<String> = Vec::new();
        let mut seen_dirs = HashSet::new();
        let mut interp_rel: Option<String> = None;

        for dep in &sorted_deps {
            let host_path = self.host_path(dep);
            let dep_file = File::new(&host_path);
            let dep_hash = dep_file.hash()?;
            let dep_store_rel = self.place_payload(&dep_file)?;

            let logical_rel = self.bundle_root_rel().join(strip_leading_slash(dep));
            self.place_symlink(&logical_rel, &dep_store_rel, &dep_hash)?;

            let logical_from_bin = from_bin(&logical_rel);
            if let Some(parent) = Path::new(&logical_from_bin).parent() {
                let parent = parent.to_string_lossy().into_owned();
                if seen_dirs.insert(parent.clone()) {
                    lib_dirs_rel.push(parent);
                }
            }

            if elf.interpreter.as_deref() == Some(dep.as_path()) {
                interp_rel = Some(logical_from_bin);
            }
        }

        let binary_rel = from_bin(&binary_symlink_rel);
        let script = match interp_rel {
            Some(interp_rel) => launcher::render(&interp_rel, &lib_dirs_rel, &binary_rel),
            None => launcher::render_static(&binary_rel),
        };
        self.write_launcher(&launcher_name, &script)?;

        log::info!(
            "added {} to bundle {} as {} ({} store entries so far)",
            path.display(),
            self.bundle_id,
            launcher_name,
            self.store.len()
        );
        Ok(())
    }

    fn host_path(&self, logical: &Path) -> PathBuf {
        match &self.options.chroot {
            Some(chroot) if logical.is_absolute() => chroot.join(strip_leading_slash(logical)),
            _ => logical.to_path_buf(),
        }
    }

    fn place_payload(&mut self, file: &File) -> Result<PathBuf> {
        let hash = file.hash()?;
        if let Some(existing) = self.store.get(&hash) {
            log::debug!("reusing store entry for {hash}");
            return Ok(existing.clone());
        }

        let store_rel = self
            .bundle_root_rel()
            .join("data")
            .join(&hash[0..2])
            .join(&hash);
        let store_abs = self.root().join(&store_rel);
        fs::create_dir_all(store_abs.parent().unwrap()).map_err(|e| BundleError::io(&store_abs, e))?;
        copy_or_hardlink(file.source_path(), &store_abs)?;

        let mode = if file.is_executable()? { 0o755 } else { 0o644 };
        fs::set_permissions(&store_abs, fs::Permissions::from_mode(mode))
            .map_err(|e| BundleError::io(&store_abs, e))?;

        self.store.insert(hash, store_rel.clone());
        Ok(store_rel)
    }

    fn place_symlink(&mut self, logical_rel: &Path, store_rel: &Path, hash: &str) -> Result<()> {
        if let Some(existing_hash) = self.links.get(logical_rel) {
            if existing_hash == hash {
                return Ok(());
            }
            return Err(BundleError::Conflict {
                logical_path: logical_rel.display().to_string(),
            });
        }

        let symlink_abs = self.root().join(logical_rel);
        let parent = symlink_abs.parent().expect("symlink path has a parent");
        fs::create_dir_all(parent).map_err(|e| BundleError::io(parent, e))?;
        let target = relative_path(parent, &self.root().join(store_rel));
        std::os::unix::fs::symlink(&target, &symlink_abs).map_err(|e| BundleError::io(&symlink_abs, e))?;

        self.links.insert(logical_rel.to_path_buf(), hash.to_string());
        Ok(())
    }

    fn write_launcher(&self, name: &str, script: &str) -> Result<()> {
        let path = self.root().join("bin").join(name);
        fs::write(&path, script).map_err(|e| BundleError::io(&path, e))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).map_err(|e| BundleError::io(&path, e))?;
        Ok(())
    }

    /// Moves the staging directory into `dest`, which must not already
    /// exist. Falls back to a recursive copy when the rename can't be done
    /// in place (e.g. `dest` is on a different filesystem).
    pub fn finalize(mut self, dest: &Path) -> Result<PathBuf> {
        let tempdir = self.tempdir.take().expect("Bundle used after finalize");
        let root = tempdir.path().to_path_buf();

        log::info!(
            "finalizing bundle {} at {} ({} launcher(s), {} store entries)",
            self.bundle_id,
            dest.display(),
            self.launcher_names.len(),
            self.store.len()
        );

        if fs::rename(&root, dest).is_err() {
            copy_dir_all(&root, dest).map_err(|e| BundleError::io(dest, e))?;
            assert_safe_to_remove(&root)?;
            fs::remove_dir_all(&root).map_err(|e| BundleError::io(&root, e))?;
        }
        // The directory at `root` either no longer exists (renamed away) or
        // was just removed explicitly above; don't let TempDir's Drop try
        // to remove it again.
        std::mem::forget(tempdir);
        Ok(dest.to_path_buf())
    }
}

/// Resolves `path` to a file that can actually be opened: bare names (no
/// directory component, e.g. `"ls"`) are searched for across `PATH`, exactly
/// as a shell would resolve them; anything containing a `/` is used as-is.
fn resolve_executable(path: &Path) -> Result<PathBuf> {
    if path.components().count() != 1 {
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(BundleError::InvalidInput(format!("{} is not a file", path.display())))
        };
    }

    let Some(path_var) = std::env::var_os("PATH") else {
        return Err(BundleError::InvalidInput(format!(
            "{} is not a file and PATH is not set",
            path.display()
        )));
    };

    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(path);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(BundleError::InvalidInput(format!(
        "{} not found in PATH",
        path.display()
    )))
}

fn strip_leading_slash(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

/// Expresses `rel` (relative to the bundle root) as a path relative to
/// `root/bin`, the directory the launcher script itself lives in.
fn from_bin(rel: &Path) -> String {
    format!("../{}", rel.display())
}

fn copy_or_hardlink(src: &Path, dst: &Path) -> Result<()> {
    if fs::hard_link(src, dst).is_ok() {
        return Ok(());
    }
    fs::copy(src, dst).map(|_| ()).map_err(|e| BundleError::io(dst, e))
}

fn relative_path(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from_dir.components().collect();
    let to: Vec<_> = to.components().collect();
    let common = from.iter().zip(to.iter()).take_while(|(a, b)| a == b).count();

    let mut result = PathBuf::new();
    for _ in common..from.len() {
        result.push("..");
    }
    for component in &to[common..] {
        result.push(component.as_os_str());
    }
    result
}

fn assert_safe_to_remove(path: &Path) -> Result<()> {
    if path.starts_with(std::env::temp_dir()) {
        Ok(())
    } else {
        Err(BundleError::InvalidInput(format!(
            "refusing to remove {} - not under the system temp directory",
            path.display()
        )))
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let dst_path = dst.join(entry.file_name());
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(target, &dst_path)?;
        } else if file_type.is_dir() {
            copy_dir_all(&entry.path(), &dst_path)?;
        } else {
            fs::copy(entry.path(), &dst_path)?;
            let perm = fs::metadata(entry.path())?.permissions();
            fs::set_permissions(&dst_path, perm)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fake_ldd(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("fake-ldd");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(script.as_bytes()).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn write_file(path: &Path, bytes: &[u8], executable: bool) {
        fs::write(path, bytes).unwrap();
        let mode = if executable { 0o755 } else { 0o644 };
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    /// A 32-bit little-endian ELF with a PT_INTERP segment, the same fixture
    /// builder used in `elf.rs`'s own tests.
    fn build_elf32(interp: &str) -> Vec<u8> {
        let mut interp_bytes = interp.as_bytes().to_vec();
        interp_bytes.push(0);
        let ehdr_size = 52usize;
        let phdr_size = 32usize;
        let phoff = ehdr_size;
        let interp_offset = phoff + phdr_size;
        let mut buf = vec![0u8; interp_offset + interp_bytes.len()];
        buf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        buf[4] = 1;
        buf[5] = 1;
        buf[6] = 1;
        buf[16..18].copy_from_slice(&2u16.to_le_bytes());
        buf[18..20].copy_from_slice(&3u16.to_le_bytes());
        buf[28..32].copy_from_slice(&(phoff as u32).to_le_bytes());
        buf[42..44].copy_from_slice(&(phdr_size as u16).to_le_bytes());
        buf[44..46].copy_from_slice(&1u16.to_le_bytes());
        let p = phoff;
        buf[p..p + 4].copy_from_slice(&3u32.to_le_bytes());
        buf[p + 4..p + 8].copy_from_slice(&(interp_offset as u32).to_le_bytes());
        buf[p + 16..p + 20].copy_from_slice(&(interp_bytes.len() as u32).to_le_bytes());
        buf[interp_offset..interp_offset + interp_bytes.len()].copy_from_slice(&interp_bytes);
        buf
    }

    #[test]
    fn add_executable_places_binary_and_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let interp = dir.path().join("ld-linux.so.2");
        write_file(&interp, b"pretend interpreter", true);
        let libc = dir.path().join("libc.so.6");
        write_file(&libc, b"pretend libc", false);

        let ldd = fake_ldd(
            dir.path(),
            &format!(
                "#!/bin/sh\n\
                 echo '\tlibc.so.6 => {} (0x1)'\n\
                 echo '\t{} (0x2)'\n",
                libc.display(),
                interp.display()
            ),
        );

        let binary = dir.path().join("app");
        write_file(&binary, &build_elf32(interp.to_str().unwrap()), true);

        let mut bundle = Bundle::new(BundleOptions::new(&ldd)).unwrap();
        bundle.add_executable(&binary).unwrap();

        assert_eq!(bundle.launcher_count(), 1);
        // binary + libc + interpreter = 3 distinct store entries.
        assert_eq!(bundle.store_entry_count(), 3);

        let launcher_path = bundle.root().join("bin/app");
        assert!(launcher_path.exists());
        let script = fs::read_to_string(&launcher_path).unwrap();
        assert!(script.contains("--library-path"));
        assert!(script.contains("--inhibit-cache"));
        for line in script.lines() {
            assert!(!line.trim_start().starts_with('/'));
        }
    }

    #[test]
    fn add_executable_resolves_a_bare_name_via_path() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("app");
        write_file(&binary, &build_elf32(""), true);

        let ldd = fake_ldd(dir.path(), "#!/bin/sh\necho '\tstatically linked'\n");

        let old_path = std::env::var_os("PATH");
        // SAFETY: no other test reads or depends on PATH; restored below.
        unsafe {
            std::env::set_var("PATH", dir.path());
        }
        let result = (|| {
            let mut bundle = Bundle::new(BundleOptions::new(&ldd)).unwrap();
            bundle.add_executable(Path::new("app"))
        })();
        match old_path {
            Some(value) => unsafe { std::env::set_var("PATH", value) },
            None => unsafe { std::env::remove_var("PATH") },
        }
        result.unwrap();
    }

    #[test]
    fn add_executable_rejects_an_unresolvable_bare_name() {
        let dir = tempfile::tempdir().unwrap();
        let ldd = fake_ldd(dir.path(), "#!/bin/sh\necho '\tstatically linked'\n");

        let old_path = std::env::var_os("PATH");
        unsafe {
            std::env::set_var("PATH", dir.path());
        }
        let result = (|| {
            let mut bundle = Bundle::new(BundleOptions::new(&ldd)).unwrap();
            bundle.add_executable(Path::new("definitely-not-on-path"))
        })();
        match old_path {
            Some(value) => unsafe { std::env::set_var("PATH", value) },
            None => unsafe { std::env::remove_var("PATH") },
        }
        assert!(matches!(result, Err(BundleError::InvalidInput(_))));
    }

    #[test]
    fn identical_content_dedups_to_one_store_entry() {
        let dir = tempfile::tempdir().unwrap();
        let interp = dir.path().join("ld-linux.so.2");
        write_file(&interp, b"same bytes", true);
        // Two distinct libraries that happen to share content.
        let liba = dir.path().join("liba.so");
        let libb = dir.path().join("libb.so");
        write_file(&liba, b"same bytes", false);
        write_file(&libb, b"same bytes", false);

        let ldd = fake_ldd(
            dir.path(),
            &format!(
                "#!/bin/sh\n\
                 echo '\tliba.so => {} (0x1)'\n\
                 echo '\tlibb.so => {} (0x2)'\n\
                 echo '\t{} (0x3)'\n",
                liba.display(),
                libb.display(),
                interp.display()
            ),
        );

        let binary = dir.path().join("app");
        write_file(&binary, &build_elf32(interp.to_str().unwrap()), true);

        let mut bundle = Bundle::new(BundleOptions::new(&ldd)).unwrap();
        bundle.add_executable(&binary).unwrap();

        // liba.so, libb.so, and the interpreter all share "same bytes", and
        // the binary itself is distinct: 2 store entries, not 4.
        assert_eq!(bundle.store_entry_count(), 2);
    }

    #[test]
    fn rename_places_launcher_under_new_name() {
        let dir = tempfile::tempdir().unwrap();
        let ldd = fake_ldd(dir.path(), "#!/bin/sh\necho '\tstatically linked'\n");
        let binary = dir.path().join("app");
        // A plain ELF with no PT_INTERP segment (PT_LOAD instead), so the
        // binary is treated as static and needs no library path.
        let mut bytes = build_elf32("/lib/ld-linux.so.2");
        bytes[52] = 1;
        write_file(&binary, &bytes, true);

        let mut options = BundleOptions::new(&ldd);
        options.rename.push(("app".to_string(), "myapp".to_string()));
        let mut bundle = Bundle::new(options).unwrap();
        bundle.add_executable(&binary).unwrap();

        assert!(bundle.root().join("bin/myapp").exists());
        assert!(!bundle.root().join("bin/app").exists());
    }

    #[test]
    fn static_binary_gets_a_direct_launcher() {
        let dir = tempfile::tempdir().unwrap();
        let ldd = fake_ldd(dir.path(), "#!/bin/sh\necho '\tstatically linked'\n");
        let binary = dir.path().join("app");
        let mut bytes = build_elf32("/lib/ld-linux.so.2");
        bytes[52] = 1; // no PT_INTERP segment -> Elf::interpreter() is None
        write_file(&binary, &bytes, true);

        let mut bundle = Bundle::new(BundleOptions::new(&ldd)).unwrap();
        bundle.add_executable(&binary).unwrap();

        let script = fs::read_to_string(bundle.root().join("bin/app")).unwrap();
        assert!(!script.contains("--library-path"));
    }

    #[test]
    fn duplicate_launcher_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ldd = fake_ldd(dir.path(), "#!/bin/sh\necho '\tstatically linked'\n");
        let mut bytes = build_elf32("/lib/ld-linux.so.2");
        bytes[52] = 1;

        let a = dir.path().join("a");
        write_file(&a, &bytes, true);
        let sub = dir.path().join("sub");
        fs::create_dir_all(&sub).unwrap();
        let b = sub.join("a");
        write_file(&b, &bytes, true);

        let mut bundle = Bundle::new(BundleOptions::new(&ldd)).unwrap();
        bundle.add_executable(&a).unwrap();
        assert!(bundle.add_executable(&b).is_err());
    }

    #[test]
    fn finalize_moves_staging_directory_to_destination() {
        let dir = tempfile::tempdir().unwrap();
        let ldd = fake_ldd(dir.path(), "#!/bin/sh\necho '\tstatically linked'\n");
        let mut bytes = build_elf32("/lib/ld-linux.so.2");
        bytes[52] = 1;
        let binary = dir.path().join("app");
        write_file(&binary, &bytes, true);

        let mut bundle = Bundle::new(BundleOptions::new(&ldd)).unwrap();
        bundle.add_executable(&binary).unwrap();

        let dest = dir.path().join("finished-bundle");
        let result = bundle.finalize(&dest).unwrap();
        assert_eq!(result, dest);
        assert!(dest.join("bin/app").exists());
    }

    #[test]
    fn dropping_an_unfinalized_bundle_removes_the_staging_directory() {
        let dir = tempfile::tempdir().unwrap();
        let ldd = fake_ldd(dir.path(), "#!/bin/sh\necho '\tstatically linked'\n");
        let bundle = Bundle::new(BundleOptions::new(&ldd)).unwrap();
        let root = bundle.root().to_path_buf();
        assert!(root.exists());
        drop(bundle);
        assert!(!root.exists());
    }

    #[test]
    fn colliding_logical_path_with_different_hash_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let ldd = fake_ldd(dir.path(), "#!/bin/sh\necho '\tstatically linked'\n");
        let mut bundle = Bundle::new(BundleOptions::new(&ldd)).unwrap();

        let logical = Path::new("usr/lib/exodus/bundles/x/usr/lib/libfoo.so");
        bundle.place_symlink(logical, Path::new("data/aa/aaaa"), "aaaa").unwrap();
        // Same logical path, different hash: two SONAMEs colliding.
        let err = bundle
            .place_symlink(logical, Path::new("data/bb/bbbb"), "bbbb")
            .unwrap_err();
        assert!(matches!(err, BundleError::Conflict { .. }));

        // Re-asserting the same (path, hash) pair is idempotent.
        bundle.place_symlink(logical, Path::new("data/aa/aaaa"), "aaaa").unwrap();
    }

    #[test]
    fn relative_path_computes_correct_dotdot_prefix() {
        let from = Path::new("/tmp/x/bin");
        let to = Path::new("/tmp/x/usr/lib/libc.so.6");
        assert_eq!(relative_path(from, to), PathBuf::from("../usr/lib/libc.so.6"));
    }
}
