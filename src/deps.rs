// Expands an executable's direct dependencies into the full transitive
// closure, by repeatedly re-tracing newly discovered libraries.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::elf;
use crate::error::Result;
use crate::ldd;

/// Translates a logical dependency path to where its bytes actually live on
/// the host filesystem, the same mapping `Bundle::host_path` applies before
/// reading a payload.
fn host_path(chroot: Option<&Path>, logical: &Path) -> PathBuf {
    match chroot {
        Some(root) if logical.is_absolute() => root.join(logical.strip_prefix("/").unwrap_or(logical)),
        _ => logical.to_path_buf(),
    }
}

/// Runs one trace against `binary` and returns its direct dependencies as
/// absolute paths. `strict` promotes unresolved ("not found") libraries from
/// a logged warning into a hard `TraceFailed`.
pub fn find_direct_library_dependencies(
    ldd_binary: &Path,
    chroot: Option<&Path>,
    binary: &Path,
    strict: bool,
) -> Result<HashSet<PathBuf>> {
    let lines = ldd::run_ldd(ldd_binary, binary, chroot, strict)?;
    Ok(lines.into_iter().map(PathBuf::from).collect())
}

/// Computes the transitive closure of `binary`'s dependencies.
///
/// The worklist starts with `binary` itself; each item processed contributes
/// its own direct dependencies (and, for the root, its interpreter even if
/// the trace tool happened not to report it) to the result and to the
/// worklist. Cycles in the dependency relation are harmless: the visited set
/// ensures every path is traced at most once. A path that doesn't exist, or
/// that isn't itself ELF, is treated as a leaf - it contributes no further
/// edges instead of failing the whole closure.
pub fn find_all_library_dependencies(
    ldd_binary: &Path,
    chroot: Option<&Path>,
    binary: &Path,
    strict: bool,
) -> Result<HashSet<PathBuf>> {
    let mut all = HashSet::new();
    let mut visited: HashSet<PathBuf> = HashSet::new();
    let mut worklist: Vec<PathBuf> = Vec::new();

    // The root is traced unconditionally - it's the artifact the caller
    // actually asked to bundle, so a trace failure here is a real error
    // rather than a leaf to skip over. `strict` only governs the root: once
    // a dependency is in the worklist, an unresolved grandchild is still
    // only ever a warning, never fatal to the closure.
    visited.insert(binary.to_path_buf());
    for dep in find_direct_library_dependencies(ldd_binary, chroot, binary, strict)? {
        if all.insert(dep.clone()) {
            worklist.push(dep);
        }
    }
    if let Ok(elf) = elf::Elf::open(binary) {
        if let Some(interp) = elf.interpreter {
            if all.insert(interp.clone()) {
                worklist.push(interp);
            }
        }
    }

    while let Some(item) = worklist.pop() {
        if !visited.insert(item.clone()) {
            continue;
        }

        // A dependency that isn't itself traceable ELF (a linker script, a
        // dangling path, a file the trace tool couldn't read) is a leaf: it
        // contributes no further edges instead of failing the whole closure.
        // `item` is a logical path; detection has to read it through the
        // same chroot mapping the rest of the pipeline uses, or it silently
        // inspects (or misses) the host's own copy instead of the chroot's.
        if !matches!(elf::detect(&host_path(chroot, &item)), Ok(true)) {
            continue;
        }

        let direct = match find_direct_library_dependencies(ldd_binary, chroot, &item, false) {
            Ok(deps) => deps,
            Err(_) => continue,
        };

        for dep in direct {
            if all.insert(dep.clone()) {
                worklist.push(dep);
            }
        }
    }

    Ok(all)
}
