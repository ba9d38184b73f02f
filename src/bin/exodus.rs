use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use argh::FromArgs;
use termcolor::{BufferWriter, Color, ColorChoice, ColorSpec, WriteColor};

use exodus_bundling::bundle::{Bundle, BundleOptions};
use exodus_bundling::error::BundleError;

#[derive(FromArgs)]
/// Bundle an executable and its shared library closure into a relocatable tree.
struct Options {
    /// path to the ldd-compatible trace tool to drive (default: "ldd", found via PATH).
    #[argh(option, default = "\"ldd\".to_string()")]
    ldd: String,

    /// resolve dependencies as if running inside this chroot.
    #[argh(option)]
    chroot: Option<PathBuf>,

    /// rename a launcher, as OLD=NEW; may be given more than once.
    #[argh(option)]
    rename: Vec<String>,

    /// promote unresolved ("not found") dependencies to a hard error.
    #[argh(switch)]
    strict: bool,

    /// destination directory for the finished bundle (default: a fresh temp directory, printed to stdout).
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,

    #[argh(positional, greedy)]
    /// executables to bundle
    binaries: Vec<PathBuf>,
}

fn parse_rename(spec: &str) -> Result<(String, String), String> {
    match spec.split_once('=') {
        Some((old, new)) if !old.is_empty() && !new.is_empty() => Ok((old.to_string(), new.to_string())),
        _ => Err(format!("--rename {spec:?} is not of the form OLD=NEW")),
    }
}

fn print_error(message: &str) {
    let writer = BufferWriter::stderr(ColorChoice::Auto);
    let mut buffer = writer.buffer();
    let _ = buffer.set_color(ColorSpec::new().set_fg(Some(Color::Red)).set_bold(true));
    let _ = write!(&mut buffer, "error: ");
    let _ = buffer.reset();
    let _ = writeln!(&mut buffer, "{message}");
    let _ = writer.print(&buffer);
}

fn run(opts: Options) -> Result<PathBuf, ExitCode> {
    if opts.binaries.is_empty() {
        print_error("no binaries given");
        return Err(ExitCode::from(2));
    }

    let mut rename = Vec::with_capacity(opts.rename.len());
    for spec in &opts.rename {
        match parse_rename(spec) {
            Ok(pair) => rename.push(pair),
            Err(message) => {
                print_error(&message);
                return Err(ExitCode::from(2));
            }
        }
    }

    let bundle_options = BundleOptions {
        ldd_binary: PathBuf::from(&opts.ldd),
        chroot: opts.chroot.clone(),
        rename,
        strict: opts.strict,
    };

    let mut bundle = Bundle::new(bundle_options).map_err(|e| {
        print_error(&e.to_string());
        ExitCode::from(1)
    })?;

    for binary in &opts.binaries {
        if let Err(e) = bundle.add_executable(binary) {
            print_error(&format!("{}: {e}", binary.display()));
            return Err(exit_code_for(&e));
        }
    }

    let dest = match &opts.output {
        Some(dest) => dest.clone(),
        None => tempfile::Builder::new()
            .prefix("exodus-bundle-")
            .tempdir()
            .map_err(|e| {
                print_error(&format!("failed to allocate an output directory: {e}"));
                ExitCode::from(1)
            })?
            .into_path(),
    };

    bundle.finalize(&dest).map_err(|e| {
        print_error(&e.to_string());
        exit_code_for(&e)
    })
}

fn exit_code_for(_: &BundleError) -> ExitCode {
    ExitCode::from(1)
}

fn main() -> ExitCode {
    env_logger::init();
    let opts: Options = argh::from_env();

    match run(opts) {
        Ok(dest) => {
            println!("{}", dest.display());
            ExitCode::SUCCESS
        }
        Err(code) => code,
    }
}
