use camino::Utf8PathBuf;
use thiserror::Error;

/// Everything that can go wrong while setting up or running a single task.
///
/// Task-level errors are caught by the task driver, counted as a failure and
/// converted into a [`Cancelled`] resolution for downstream tasks; load-phase
/// errors abort the build.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("file not found: {0}")]
    PathMissing(Utf8PathBuf),

    #[error("build path {path} is not under root path {root}")]
    PathEscape { path: Utf8PathBuf, root: Utf8PathBuf },

    #[error("multiple tasks build {0}")]
    DuplicateOutput(Utf8PathBuf),

    #[error("expanding '{0}' failed to terminate")]
    ExpansionCycle(String),

    #[error("don't know how to expand a {0} value")]
    UnknownVariant(&'static str),

    #[error("task has no command")]
    MissingCommand,

    #[error("command entry is neither a string nor a callback, got a {0}")]
    InvalidCommand(&'static str),

    #[error("invalid depformat {0}")]
    InvalidDepFormat(String),

    #[error("command '{command}' exited with return code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("task needs {count} jobs, but the pool only has {jobs}")]
    JobOverflow { count: usize, jobs: usize },

    #[error("macro error: {0}")]
    Macro(String),

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("no description host can execute {0}")]
    NoHost(Utf8PathBuf),

    #[error("malformed depfile {path}: {message}")]
    Depfile { path: Utf8PathBuf, message: String },

    #[error("path {0} is not valid UTF-8")]
    NonUtf8Path(String),

    #[error("invalid glob pattern: {0}")]
    Glob(#[from] glob::PatternError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("callback error: {0}")]
    Userland(#[from] anyhow::Error),
}

/// Marker for a task that resolved without producing output because one of
/// its upstream tasks failed. Propagates silently through the await graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cancelled")
    }
}

/// How a task future can go wrong: a real error of its own, or a
/// cancellation inherited from upstream. The distinction drives the
/// fail/cancel counters.
#[derive(Debug)]
pub(crate) enum TaskFailure {
    Error(BuildError),
    Cancelled,
}

impl From<BuildError> for TaskFailure {
    fn from(err: BuildError) -> Self {
        TaskFailure::Error(err)
    }
}

impl From<Cancelled> for TaskFailure {
    fn from(_: Cancelled) -> Self {
        TaskFailure::Cancelled
    }
}
