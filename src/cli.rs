//! Command-line options.
//!
//! Known flags go through clap. Anything else that looks like a flag is
//! peeled off beforehand and becomes a field on the global config, with
//! the value parsed as an int, then a float, then a string; a bare
//! `--flag` becomes `true`.

use camino::Utf8PathBuf;
use clap::Parser;

use crate::app::App;
use crate::loader::DescriptionHost;
use crate::value::Value;

fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

#[derive(Parser, Debug, Clone)]
#[command(name = "hancho", about = "A simple, pleasant build system.")]
pub struct Options {
    /// The name of the description file(s) to build
    #[arg(default_value = "build.hancho")]
    pub root_name: String,

    /// Change directory before starting the build
    #[arg(short = 'C', long, value_name = "PATH", default_value = ".")]
    pub chdir: Utf8PathBuf,

    /// Run N jobs in parallel (default = cpu count)
    #[arg(short, long, value_name = "N", default_value_t = default_jobs())]
    pub jobs: usize,

    /// Print verbose build info
    #[arg(short, long)]
    pub verbose: bool,

    /// Mute all output
    #[arg(short, long)]
    pub quiet: bool,

    /// Do not run commands
    #[arg(short = 'n', long = "dry_run")]
    pub dry_run: bool,

    /// Print debugging information
    #[arg(short, long)]
    pub debug: bool,

    /// Force rebuild of everything
    #[arg(short, long)]
    pub force: bool,

    /// Shuffle task order to shake out dependency issues
    #[arg(short, long)]
    pub shuffle: bool,

    /// Trace template and macro expansion
    #[arg(short = 'e', long)]
    pub trace: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options::parse_from(["hancho"])
    }
}

/// Long names clap knows about; everything else flag-shaped is ingested as
/// a config field.
const KNOWN_LONG: &[&str] = &[
    "chdir", "jobs", "verbose", "quiet", "dry_run", "debug", "force", "shuffle", "trace", "help",
];

/// Short flags, which may carry an attached value like `-j4`.
const KNOWN_SHORT: &[char] = &['C', 'j', 'v', 'q', 'n', 'd', 'f', 's', 'e', 'h'];

/// `--key=value` with the value read as int, then float, then string;
/// `--key` alone reads as true.
fn maybe_as_number(text: &str) -> Value {
    if let Ok(n) = text.parse::<i64>() {
        return Value::Int(n);
    }
    if let Ok(x) = text.parse::<f64>() {
        return Value::Float(x);
    }
    Value::Str(text.to_string())
}

/// Splits an unrecognized flag into key and optional value. Returns `None`
/// for non-flags and for anything clap will handle itself.
fn unknown_flag(arg: &str) -> Option<(&str, Option<&str>)> {
    let stripped = arg.strip_prefix('-')?;
    let long = stripped.strip_prefix('-');
    let body = long.unwrap_or(stripped);
    if body.is_empty() {
        return None;
    }

    if long.is_none() {
        // Short flags stay with clap, attached values included.
        let first = body.chars().next().expect("non-empty");
        if KNOWN_SHORT.contains(&first) {
            return None;
        }
    }

    let (key, value) = match body.split_once('=') {
        Some((key, value)) => (key, Some(value)),
        None => (body, None),
    };
    if long.is_some() && KNOWN_LONG.contains(&key) {
        return None;
    }
    Some((key, value))
}

/// Splits `argv` into clap-parsed [`Options`] and the unrecognized flag
/// fields.
pub fn parse_args<I, S>(argv: I) -> Result<(Options, Vec<(String, Value)>), clap::Error>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut known: Vec<String> = Vec::new();
    let mut extras: Vec<(String, Value)> = Vec::new();

    for (index, arg) in argv.into_iter().enumerate() {
        let arg: String = arg.into();
        if index == 0 {
            known.push(arg);
            continue;
        }
        match unknown_flag(&arg) {
            Some((key, value)) => {
                let value = value.map(maybe_as_number).unwrap_or(Value::Bool(true));
                extras.push((key.to_string(), value));
            }
            None => known.push(arg),
        }
    }

    let options = Options::try_parse_from(known)?;
    Ok((options, extras))
}

/// The whole front-end: parse `std::env::args`, build the app, load and
/// run. Returns the process exit code.
pub fn main(host: std::rc::Rc<dyn DescriptionHost>) -> i32 {
    let (options, extras) = match parse_args(std::env::args()) {
        Ok(parsed) => parsed,
        Err(err) => {
            let _ = err.print();
            return -1;
        }
    };

    #[cfg(feature = "logging")]
    if options.debug {
        init_logging();
    }

    let app = match App::with_flag_overrides(options, extras) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("hancho: {err}");
            return -1;
        }
    };
    app.run(host)
}

#[cfg(feature = "logging")]
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
