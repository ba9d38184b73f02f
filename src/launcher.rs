// Renders the POSIX shell launcher placed at `bin/<name>` in a finished
// bundle. The script resolves its own location through a symlink, then
// re-invokes the bundled interpreter against the bundled library path and
// the bundled binary - never touching an absolute host path.

/// Renders a launcher script.
///
/// `$HERE` in the rendered script is the directory containing the launcher
/// itself, i.e. `root/bin` - not the bundle root. `interp_rel`, `lib_dirs_rel`,
/// and `binary_rel` must already be expressed relative to that directory
/// (typically starting with `../`), using `/` as the separator regardless of
/// host platform, since the script always runs on Linux.
pub fn render(interp_rel: &str, lib_dirs_rel: &[String], binary_rel: &str) -> String {
    let library_path = lib_dirs_rel
        .iter()
        .map(|d| format!("$HERE/{d}"))
        .collect::<Vec<_>>()
        .join(":");

    format!(
        "#!/bin/sh\n\
         HERE=$(dirname \"$(readlink -f \"$0\")\")\n\
         exec \"$HERE/{interp_rel}\" \\\n\
         \t--library-path \"{library_path}\" \\\n\
         \t--inhibit-cache \\\n\
         \t\"$HERE/{binary_rel}\" \"$@\"\n"
    )
}

/// Renders a launcher for a statically-linked executable: no interpreter, no
/// library path, just a direct re-exec of the bundled binary.
pub fn render_static(binary_rel: &str) -> String {
    format!(
        "#!/bin/sh\n\
         HERE=$(dirname \"$(readlink -f \"$0\")\")\n\
         exec \"$HERE/{binary_rel}\" \"$@\"\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launcher_has_no_absolute_host_paths() {
        let script = render(
            "usr/lib/exodus/bundles/b1/lib/ld-linux.so.2",
            &["usr/lib/exodus/bundles/b1/lib".to_string()],
            "usr/lib/exodus/bundles/b1/bin/myapp-x",
        );
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("readlink -f"));
        assert!(script.contains("\"$@\""));
        assert!(script.contains("--inhibit-cache"));
        for line in script.lines() {
            assert!(
                !line.trim_start().starts_with('/'),
                "launcher line references an absolute path: {line:?}"
            );
        }
    }

    #[test]
    fn library_path_joins_multiple_directories_with_colons() {
        let script = render(
            "lib/ld.so",
            &["lib".to_string(), "lib64".to_string()],
            "bin/app-x",
        );
        assert!(script.contains("\"$HERE/lib:$HERE/lib64\""));
    }

    #[test]
    fn static_launcher_has_no_library_path_argument() {
        let script = render_static("../usr/lib/exodus/bundles/b1/bin/app-x");
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(!script.contains("--library-path"));
        assert!(!script.contains("--inhibit-cache"));
        for line in script.lines() {
            assert!(!line.trim_start().starts_with('/'));
        }
    }
}
