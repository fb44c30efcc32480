#![deny(
    unsafe_code,
    clippy::panic,
)]

//! A small, pleasant, file-oriented build system.
//!
//! Description files declare [`Task`]s that turn input files into output
//! files via shell commands or callbacks. Task fields are dynamic
//! [`Value`]s: literals, `{…}` template strings, callbacks, nested
//! [`Config`]s, or handles to other tasks. Dependencies are implicit —
//! embedding one task inside another's `source_files` makes the consumer
//! await the producer's outputs — and stale tasks run in parallel under a
//! counting job budget, rebuilt purely from file modification times.
//!
//! The crate embeds no scripting language: description files are executed
//! by a [`DescriptionHost`] the embedding program supplies, usually a
//! [`HostRegistry`] of compiled Rust closures.
//!
//! ```rust,ignore
//! let registry = hancho::HostRegistry::new();
//! registry.register("build.hancho", |hancho| {
//!     let compile = hancho.command("gcc -MMD -c {rel_source_files} -o {rel_build_files}", []);
//!     compile.invoke(
//!         hancho.app(),
//!         hancho::Value::list(["main.c"]),
//!         hancho::Value::list(["main.o"]),
//!         [("build_deps", hancho::Value::list(["main.d"]))],
//!     )?;
//!     Ok(hancho::Config::new())
//! });
//! std::process::exit(hancho::cli::main(std::rc::Rc::new(registry)));
//! ```

pub mod app;
pub mod cli;
pub mod config;
pub mod depfile;
pub mod error;
mod eval;
pub mod expand;
pub mod loader;
pub mod paths;
pub mod report;
pub mod task;
pub mod value;

pub use camino;

pub use crate::app::{App, LoadedModule};
pub use crate::cli::Options;
pub use crate::config::{Config, ConfigKind};
pub use crate::error::{BuildError, Cancelled};
pub use crate::expand::{MAX_EXPAND_DEPTH, expand};
pub use crate::loader::{DescriptionHost, HostRegistry, Scope};
pub use crate::report::Reporter;
pub use crate::task::{Action, Task};
pub use crate::value::{Builtin, Callback, Promise, TaskOutcome, Value};
