//! Tasks: declarations of "make these outputs from these inputs by running
//! this command".
//!
//! A task carries two views of itself. `config` holds the raw inputs, which
//! may contain templates, callbacks and handles to other tasks. Once every
//! embedded future has resolved, `task_init` expands the interesting fields
//! into a typed [`Action`] snapshot, and the runner works off that.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use async_recursion::async_recursion;
use camino::Utf8PathBuf;
use console::Style;

use crate::app::App;
use crate::config::{Config, ConfigKind};
use crate::depfile;
use crate::error::{BuildError, Cancelled, TaskFailure};
use crate::eval;
use crate::paths::{self, one_path, path_list};
use crate::value::{Promise, TaskOutcome, Value, flatten};

const STYLE_RUN: Style = Style::new().green();
const STYLE_SKIP: Style = Style::new().cyan();
const STYLE_FAIL: Style = Style::new().red();
const STYLE_DIM: Style = Style::new().dim();

/// The fully expanded snapshot of a task at the moment of execution.
#[derive(Debug, Clone)]
pub struct Action {
    pub desc: String,
    pub command: Vec<Value>,
    pub depformat: String,
    pub job_count: usize,
    pub ext_build: bool,
    pub task_index: usize,
    pub base_path: Utf8PathBuf,
    pub source_files: Vec<String>,
    pub build_files: Vec<String>,
    pub abs_command_path: Utf8PathBuf,
    pub abs_source_path: Utf8PathBuf,
    pub abs_build_path: Utf8PathBuf,
    pub abs_command_files: Vec<Utf8PathBuf>,
    pub abs_source_files: Vec<Utf8PathBuf>,
    pub abs_build_files: Vec<Utf8PathBuf>,
    pub abs_build_deps: Vec<Utf8PathBuf>,
}

struct TaskData {
    config: Config,
    action: Option<Action>,
    reason: Option<String>,
    promise: Option<Promise>,
    stdout: String,
    stderr: String,
    returncode: Option<i32>,
}

/// A shared handle to a task. Embedding a task handle inside another
/// task's config declares a dependency: the value-walk awaits the
/// producer's promise and substitutes its output paths.
#[derive(Clone)]
pub struct Task {
    data: Rc<RefCell<TaskData>>,
}

impl Task {
    /// Declares a task: defaults, then `sources` left to right, then the
    /// override pairs. The task enters the pending queue and gets a
    /// promise when the driver next queues pending tasks.
    pub fn new<'a>(
        app: &Rc<App>,
        sources: &[&Config],
        overrides: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Task, BuildError> {
        let config = Config::new();
        config.merge(&defaults(app));
        for source in sources {
            config.merge(source);
        }
        for (key, value) in overrides {
            config.set(key, value);
        }

        if matches!(config.get("command"), None | Some(Value::Null)) {
            return Err(BuildError::MissingCommand);
        }

        let task = Task {
            data: Rc::new(RefCell::new(TaskData {
                config,
                action: None,
                reason: None,
                promise: None,
                stdout: String::new(),
                stderr: String::new(),
                returncode: None,
            })),
        };
        app.add_pending(task.clone());
        Ok(task)
    }

    pub fn config(&self) -> Config {
        self.data.borrow().config.clone()
    }

    pub fn action(&self) -> Option<Action> {
        self.data.borrow().action.clone()
    }

    pub fn reason(&self) -> Option<String> {
        self.data.borrow().reason.clone()
    }

    pub fn promise(&self) -> Option<Promise> {
        self.data.borrow().promise.clone()
    }

    pub(crate) fn set_promise(&self, promise: Promise) {
        self.data.borrow_mut().promise = Some(promise);
    }

    pub(crate) fn peek_outcome(&self) -> Option<TaskOutcome> {
        self.data.borrow().promise.as_ref().and_then(Promise::peek)
    }

    /// Captured stdout of the last shell command.
    pub fn stdout(&self) -> String {
        self.data.borrow().stdout.clone()
    }

    /// Captured stderr of the last shell command.
    pub fn stderr(&self) -> String {
        self.data.borrow().stderr.clone()
    }

    pub fn returncode(&self) -> Option<i32> {
        self.data.borrow().returncode
    }

    pub fn ptr_eq(&self, other: &Task) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// Truthiness of a flag, preferring the task's own config over the
    /// globals so single tasks can override e.g. `dry_run` or `verbose`.
    pub(crate) fn flag(&self, app: &Rc<App>, name: &str) -> bool {
        let config = self.config();
        config
            .get(name)
            .or_else(|| app.globals().get(name))
            .is_some_and(|v| v.is_truthy())
    }

    fn set_action(&self, action: Action) {
        self.data.borrow_mut().action = Some(action);
    }

    fn set_reason(&self, reason: String) {
        self.data.borrow_mut().reason = Some(reason);
    }

    fn set_process_output(&self, stdout: String, stderr: String, returncode: Option<i32>) {
        let mut data = self.data.borrow_mut();
        data.stdout = stdout;
        data.stderr = stderr;
        data.returncode = returncode;
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.borrow();
        f.debug_struct("Task")
            .field("config", &data.config)
            .field("action", &data.action)
            .field("reason", &data.reason)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// A command config is callable: invoking it clones the command,
    /// overrides the source/build file fields and constructs a task.
    /// `Value::Null` means "keep the command's own value".
    pub fn invoke<'a>(
        &self,
        app: &Rc<App>,
        source_files: Value,
        build_files: Value,
        overrides: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Task, BuildError> {
        if self.kind() != ConfigKind::Command {
            return Err(BuildError::UnknownVariant("non-command config"));
        }
        let config = Config::new();
        config.merge(self);
        if !matches!(source_files, Value::Null) {
            config.set("source_files", source_files);
        }
        if !matches!(build_files, Value::Null) {
            config.set("build_files", build_files);
        }
        for (key, value) in overrides {
            config.set(key, value);
        }
        Task::new(app, &[&config], [])
    }
}

/// Per-task field defaults. Path fields reference the global default
/// templates so the implicit path flow kicks in unless overridden.
fn defaults(app: &Rc<App>) -> Config {
    let globals = app.globals();
    let root_path = globals.get("root_path").unwrap_or(Value::Null);

    Config::from_pairs([
        ("desc", Value::from("{source_files} -> {build_files}")),
        ("root_path", root_path.clone()),
        ("repo_path", root_path),
        ("base_path", Value::from(app.topdir())),
        ("command", Value::Null),
        ("command_path", Value::from("{default_command_path}")),
        ("command_files", Value::List(vec![])),
        ("source_path", Value::from("{default_source_path}")),
        ("source_files", Value::List(vec![])),
        ("build_tag", Value::from("")),
        ("build_dir", Value::from("build")),
        ("build_path", Value::from("{default_build_path}")),
        ("build_files", Value::List(vec![])),
        ("build_deps", Value::List(vec![])),
        ("other_files", Value::List(vec![])),
    ])
}

/// Recursively replaces every task handle and promise inside `value` with
/// its resolved value. Configs and lists are walked in place; a resolved
/// value may itself contain further futures, so resolution recurses.
#[async_recursion(?Send)]
pub(crate) async fn await_variant(app: &Rc<App>, value: Value) -> Result<Value, Cancelled> {
    match value {
        Value::Task(task) => {
            // A task that has not been queued yet gets queued now, before
            // we try to await it.
            if task.promise().is_none() {
                app.queue_pending_tasks();
            }
            let promise = task.promise().expect("queued tasks carry a promise");
            match promise.wait().await {
                TaskOutcome::Finished(inner) => await_variant(app, inner).await,
                TaskOutcome::Cancelled => Err(Cancelled),
            }
        }
        Value::Promise(promise) => match promise.wait().await {
            TaskOutcome::Finished(inner) => await_variant(app, inner).await,
            TaskOutcome::Cancelled => Err(Cancelled),
        },
        Value::Config(config) => {
            // Walk by index so fields added mid-walk are still visited.
            let mut index = 0;
            loop {
                let Some((key, field)) = config.entry_at(index) else {
                    break;
                };
                let resolved = await_variant(app, field).await?;
                config.set(key, resolved);
                index += 1;
            }
            Ok(Value::Config(config))
        }
        Value::List(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(await_variant(app, item).await?);
            }
            Ok(Value::List(resolved))
        }
        other => Ok(other),
    }
}

/// Entry point for a task future. Failures are contained here: an error is
/// reported and counted, and either way downstream tasks observe a clean
/// outcome.
pub(crate) async fn run_task(app: Rc<App>, task: Task) -> TaskOutcome {
    match run_inner(&app, &task).await {
        Ok(value) => TaskOutcome::Finished(value),
        Err(TaskFailure::Cancelled) => {
            app.count_cancel();
            TaskOutcome::Cancelled
        }
        Err(TaskFailure::Error(err)) => {
            let reporter = app.reporter();
            reporter.line(&reporter.paint(&STYLE_FAIL, &format!("{err}")));
            app.count_fail();
            TaskOutcome::Cancelled
        }
    }
}

async fn run_inner(app: &Rc<App>, task: &Task) -> Result<Value, TaskFailure> {
    // Wait for every embedded future in the task's config.
    await_variant(app, Value::Config(task.config())).await?;

    // Everything awaited; the rest of the setup is synchronous.
    let action = task_init(app, task)?;
    task.set_action(action.clone());

    let reason = needs_rerun(app, task, &action)?;
    task.set_reason(reason.clone());

    if task.flag(app, "debug") {
        app.reporter().line(&format!("{task:?}"));
    }

    if !reason.is_empty() {
        let result = run_commands(app, task, &action, &reason).await?;
        app.count_pass();
        Ok(result)
    } else {
        let reporter = app.reporter();
        let prefix = reporter.paint(
            &STYLE_SKIP,
            &format!("[{}/{}]", action.task_index, app.tasks_total()),
        );
        reporter.sameline(&format!("{prefix} {}", action.desc));
        if task.flag(app, "verbose") || task.flag(app, "debug") {
            reporter.line(&reporter.paint(
                &STYLE_DIM,
                &format!("Files {} are up to date", action.build_files.join(" ")),
            ));
        }
        app.count_skip();
        Ok(output_files_value(&action))
    }
}

fn output_files_value(action: &Action) -> Value {
    Value::List(
        action
            .abs_build_files
            .iter()
            .map(|p| Value::Str(p.to_string()))
            .collect(),
    )
}

/// Expands the critical fields, computes the absolute path forms, claims
/// the output files and creates their directories.
fn task_init(app: &Rc<App>, task: &Task) -> Result<Action, BuildError> {
    let config = task.config();
    let topdir = app.topdir();

    let field = |name: &str| eval::lookup(app, &config, name);

    let desc = field("desc")?.stringify();
    let command = flatten(field("command")?);
    let depformat = field("depformat")?.stringify();
    let ext_build = field("ext_build")?.is_truthy();
    let job_count = match field("job_count")? {
        Value::Int(n) if n >= 0 => n as usize,
        other => {
            return Err(BuildError::Macro(format!(
                "job_count must be a non-negative integer, got {}",
                other.kind_name()
            )));
        }
    };

    let base_path_v = field("base_path")?;
    let command_path = field("command_path")?;
    let source_path = field("source_path")?;
    let build_path = field("build_path")?;

    let command_files = Value::List(flatten(field("command_files")?));
    let source_files = Value::List(flatten(field("source_files")?));
    let build_files = Value::List(flatten(field("build_files")?));
    let build_deps = Value::List(flatten(field("build_deps")?));

    let abs_command_path = one_path(paths::abs_path(
        &topdir,
        &paths::join_path(&[base_path_v.clone(), command_path])?,
        true,
    )?)?;
    let abs_source_path = one_path(paths::abs_path(
        &topdir,
        &paths::join_path(&[base_path_v.clone(), source_path])?,
        true,
    )?)?;
    let abs_build_path = one_path(paths::abs_path(
        &topdir,
        &paths::join_path(&[base_path_v.clone(), build_path])?,
        false,
    )?)?;

    let abs_files = |base: &Utf8PathBuf, files: &Value, strict: bool| -> Result<Vec<Utf8PathBuf>, BuildError> {
        let joined = paths::join_path(&[Value::from(base.clone()), files.clone()])?;
        path_list(paths::abs_path(&topdir, &Value::List(flatten(joined)), strict)?)
    };

    let abs_command_files = abs_files(&abs_command_path, &command_files, true)?;
    let abs_source_files = abs_files(&abs_source_path, &source_files, true)?;
    let abs_build_files = abs_files(&abs_build_path, &build_files, false)?;
    let abs_build_deps = abs_files(&abs_build_path, &build_deps, false)?;

    let root_path = app.root_path();
    if !abs_build_path.starts_with(&root_path) {
        return Err(BuildError::PathEscape {
            path: abs_build_path,
            root: root_path,
        });
    }

    // Claim output files; every output belongs to exactly one task.
    for abs_file in &abs_build_files {
        app.register_build_file(abs_file)?;
    }

    // Make sure the output directories exist.
    if !task.flag(app, "dry_run") {
        for abs_file in &abs_build_files {
            if let Some(parent) = abs_file.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }

    Ok(Action {
        desc,
        command,
        depformat,
        job_count,
        ext_build,
        task_index: app.next_task_index(),
        base_path: one_path(base_path_v)?,
        source_files: flatten(source_files).iter().map(Value::stringify).collect(),
        build_files: flatten(build_files).iter().map(Value::stringify).collect(),
        abs_command_path,
        abs_source_path,
        abs_build_path,
        abs_command_files,
        abs_source_files,
        abs_build_files,
        abs_build_deps,
    })
}

/// The staleness oracle. A non-empty reason string means the task must
/// run; an empty string means its outputs are up to date.
fn needs_rerun(app: &Rc<App>, task: &Task, action: &Action) -> Result<String, BuildError> {
    let files = action.abs_build_files.iter().map(|p| p.as_str());
    let files = files.collect::<Vec<_>>().join(" ");

    if task.flag(app, "force") {
        return Ok(format!("Files {files} forced to rebuild"));
    }
    if action.abs_source_files.is_empty() {
        return Ok("Always rebuild a target with no inputs".to_string());
    }
    if action.abs_build_files.is_empty() {
        return Ok("Always rebuild a target with no outputs".to_string());
    }

    for abs_file in &action.abs_build_files {
        if !abs_file.as_std_path().exists() {
            return Ok(format!("Rebuilding because {abs_file} is missing"));
        }
    }

    // The oldest output bounds every input: any input at least as new as
    // it (note the >=, writes within one timestamp tick count) forces a
    // rebuild.
    let mut min_out = None;
    for abs_file in &action.abs_build_files {
        let mtime = app.mtime(abs_file)?;
        min_out = Some(match min_out {
            Some(current) if current < mtime => current,
            _ => mtime,
        });
    }
    let min_out = min_out.expect("at least one build file");

    for abs_file in &action.abs_source_files {
        if app.mtime(abs_file)? >= min_out {
            return Ok(format!("Rebuilding because {abs_file} has changed"));
        }
    }

    for abs_file in &action.abs_command_files {
        if app.mtime(abs_file)? >= min_out {
            return Ok(format!("Rebuilding because {abs_file} has changed"));
        }
    }

    for module in app.loaded_modules() {
        if app.mtime(&module.path)? >= min_out {
            return Ok(format!("Rebuilding because {} has changed", module.path));
        }
    }

    // Check all dependencies in the depfiles, if present.
    for abs_depfile in &action.abs_build_deps {
        if !abs_depfile.as_std_path().exists() {
            continue;
        }
        if task.flag(app, "debug") {
            app.reporter().line(&format!("Found depfile {abs_depfile}"));
        }
        let text = std::fs::read_to_string(abs_depfile)?;
        // Depfile entries are relative to the compiler's working directory.
        for entry in depfile::parse(&action.depformat, abs_depfile, &text)? {
            let abs_file = paths::absolutize(&action.abs_command_path, &entry);
            if app.mtime(&abs_file)? >= min_out {
                return Ok(format!("Rebuilding because {abs_file} has changed"));
            }
        }
    }

    Ok(String::new())
}

/// Claims the task's job count, prints the status line and runs each
/// command entry in order. Jobs release when the permit drops, on every
/// path.
async fn run_commands(
    app: &Rc<App>,
    task: &Task,
    action: &Action,
    reason: &str,
) -> Result<Value, TaskFailure> {
    let _permit = app
        .acquire_jobs(action.job_count)
        .await
        .map_err(TaskFailure::Error)?;

    let reporter = app.reporter();
    let prefix = reporter.paint(
        &STYLE_RUN,
        &format!("[{}/{}]", action.task_index, app.tasks_total()),
    );
    reporter.sameline(&format!("{prefix} {}", action.desc));

    let chatty = task.flag(app, "verbose") || task.flag(app, "debug");
    if chatty {
        reporter.line(&reporter.paint(&STYLE_DIM, &format!("Reason: {reason}")));
    }

    let mut result = Value::List(vec![]);
    for command in &action.command {
        if chatty {
            let rel = action
                .abs_command_path
                .strip_prefix(app.root_path())
                .map(|p| p.to_string())
                .unwrap_or_else(|_| action.abs_command_path.to_string());
            let dry = if task.flag(app, "dry_run") { "(DRY RUN) " } else { "" };
            reporter.line(&format!("{rel}$ {dry}{}", command.stringify()));
        }
        result = run_command(app, task, action, command).await?;
    }

    Ok(result)
}

/// Runs a single command entry: callbacks are invoked with the task,
/// strings run in a subshell with the task's command path as cwd.
async fn run_command(
    app: &Rc<App>,
    task: &Task,
    action: &Action,
    command: &Value,
) -> Result<Value, TaskFailure> {
    if task.flag(app, "dry_run") {
        return Ok(output_files_value(action));
    }

    match command {
        Value::Callback(callback) => {
            let result = callback
                .invoke(task.clone())
                .await
                .map_err(|err| TaskFailure::Error(BuildError::Userland(err)))?;
            Ok(result)
        }
        Value::Str(command_text) => {
            let output = shell_command(command_text)
                .current_dir(&action.abs_command_path)
                .output()
                .await
                .map_err(|err| TaskFailure::Error(BuildError::Io(err)))?;

            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            task.set_process_output(stdout.clone(), stderr.clone(), output.status.code());

            let reporter = app.reporter();
            if !reporter.is_quiet() && (!stdout.is_empty() || !stderr.is_empty()) {
                if !stderr.is_empty() {
                    reporter.line("-----stderr-----");
                    reporter.line(stderr.trim_end());
                }
                if !stdout.is_empty() {
                    reporter.line("-----stdout-----");
                    reporter.line(stdout.trim_end());
                }
            }

            if !output.status.success() {
                return Err(TaskFailure::Error(BuildError::CommandFailed {
                    command: command_text.clone(),
                    code: output.status.code().unwrap_or(-1),
                }));
            }

            Ok(output_files_value(action))
        }
        other => Err(TaskFailure::Error(BuildError::InvalidCommand(
            other.kind_name(),
        ))),
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
