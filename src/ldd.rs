// Drives a dynamic-linker trace tool against a binary and parses its output.
//
// Mirrors the classic shell `ldd`: run the trace tool, and if it fails or
// comes back empty for an ELF target, fall back to invoking the target's own
// interpreter with `--list` (the trick `ldd` itself uses when it's a shell
// script built for a different libc than the one on the host).

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::elf;
use crate::error::{BundleError, Result};

/// Runs `ldd_binary target` (optionally inside `chroot`) and returns its
/// stdout, split into lines.
///
/// Falls back to `<interpreter> --list target` when `ldd_binary` exits
/// nonzero, or succeeds but prints nothing for an ELF target. Libraries the
/// trace reports as `not found` are logged at `warn` regardless of `strict`;
/// when `strict` is set, their presence turns the whole trace into a
/// `TraceFailed` instead of a silent omission from the result.
pub fn run_ldd(ldd_binary: &Path, target: &Path, chroot: Option<&Path>, strict: bool) -> Result<Vec<String>> {
    log::debug!(
        "running {} {}{}",
        ldd_binary.display(),
        target.display(),
        chroot.map(|c| format!(" (chroot {})", c.display())).unwrap_or_default(),
    );

    let host_target = absolute(target, chroot);

    if let Ok((lines, raw)) = invoke(ldd_binary, &[], &host_target, target) {
        if !lines.is_empty() {
            return finish(target, &raw, lines, strict);
        }
    }

    // Either the trace tool failed outright, or it produced nothing - which
    // for a genuine ELF binary almost always means `ldd` is the wrong flavor
    // for this libc. Fall back to asking the binary's own interpreter.
    if elf::detect(&host_target)? {
        log::warn!(
            "{} produced no output for {}, falling back to the interpreter",
            ldd_binary.display(),
            target.display()
        );
        if let Ok(elf) = elf::Elf::open(&host_target) {
            if let Some(interp) = elf.interpreter {
                let interp_host = strip_chroot_for_exec(&interp, chroot);
                if let Ok((lines, raw)) = invoke(&interp_host, &["--list"], &host_target, target) {
                    return finish(target, &raw, lines, strict);
                }
            }
        }
    }

    Err(BundleError::TraceFailed {
        binary: target.to_path_buf(),
        reason: format!("{} and the interpreter --list fallback both failed", ldd_binary.display()),
    })
}

fn finish(target: &Path, raw: &str, lines: Vec<String>, strict: bool) -> Result<Vec<String>> {
    let unresolved = unresolved_dependencies(raw);
    for name in &unresolved {
        log::warn!("{}: {} not found", target.display(), name);
    }
    if strict && !unresolved.is_empty() {
        return Err(BundleError::TraceFailed {
            binary: target.to_path_buf(),
            reason: format!("unresolved under --strict: {}", unresolved.join(", ")),
        });
    }
    Ok(lines)
}

/// Extracts the library names from `NAME => not found` lines.
fn unresolved_dependencies(text: &str) -> Vec<String> {
    let mut names = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if let Some((name, rest)) = line.split_once("=>") {
            if rest.trim() == "not found" {
                names.push(name.trim().to_string());
            }
        }
    }
    names
}

fn absolute(target: &Path, chroot: Option<&Path>) -> PathBuf {
    match chroot {
        Some(root) if target.is_absolute() => root.join(target.strip_prefix("/").unwrap_or(target)),
        _ => target.to_path_buf(),
    }
}

fn strip_chroot_for_exec(interp: &Path, chroot: Option<&Path>) -> PathBuf {
    match chroot {
        Some(root) => root.join(interp.strip_prefix("/").unwrap_or(interp)),
        None => interp.to_path_buf(),
    }
}

/// Runs `tool extra_args... host_target` directly - `host_target` is already
/// the host-filesystem path (chroot-prefixed if applicable), so the tool
/// itself is never run inside an actual `chroot`. `target` is used only for
/// error messages, in its original (possibly chroot-relative) form.
fn invoke(tool: &Path, extra_args: &[&str], host_target: &Path, target: &Path) -> Result<(Vec<String>, String)> {
    let mut command = Command::new(tool);
    command.args(extra_args);
    command.arg(host_target);

    let output = command
        .output()
        .map_err(|e| BundleError::TraceFailed {
            binary: target.to_path_buf(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(BundleError::TraceFailed {
            binary: target.to_path_buf(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let parsed = parse_dependencies_from_ldd_output(&stdout)?;
    Ok((parsed, stdout))
}

/// Parses the textual output of `ldd`/`<interp> --list` into a deduplicated
/// list of absolute library paths, preserving first-occurrence order.
///
/// Recognized line shapes (others are ignored):
///   `NAME => PATH (0xADDR)`        resolved library at absolute PATH
///   `NAME => not found`            unresolved; contributes nothing
///   `/PATH (0xADDR)`               the linker itself
///   `NAME => (0xADDR)`             a virtual object (e.g. linux-vdso); ignored
///   `statically linked`            produces an empty list
pub fn parse_dependencies_from_ldd_output(text: &str) -> Result<Vec<String>> {
    let mut result = Vec::new();
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "statically linked" || line == "not a dynamic executable" {
            return Ok(Vec::new());
        }

        let path = if let Some((_name, rest)) = line.split_once("=>") {
            let rest = rest.trim();
            if rest.is_empty() || rest == "not found" {
                continue;
            }
            if let Some(paren) = rest.find('(') {
                rest[..paren].trim()
            } else {
                rest
            }
        } else if let Some(paren) = line.find('(') {
            line[..paren].trim()
        } else {
            continue;
        };

        if path.is_empty() {
            // `NAME => (0xADDR)`: a virtual object such as linux-vdso.so.1.
            continue;
        }
        if !path.starts_with('/') {
            return Err(BundleError::MalformedLddOutput {
                line: raw_line.to_string(),
            });
        }
        if !result.iter().any(|p: &String| p == path) {
            result.push(path.to_string());
        }
    }
    Ok(result)
}
