//! Application state and the task driver.
//!
//! One [`App`] owns everything a build needs: the global config, the
//! counters, the pending/queued task FIFOs, the directory stack and the job
//! semaphore. It is handed to every entry point instead of living in a
//! process global, so tests can run builds side by side.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use console::Style;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::cli::Options;
use crate::config::{self, Config};
use crate::error::BuildError;
use crate::loader::{self, DescriptionHost};
use crate::report::Reporter;
use crate::task::{self, Task};
use crate::value::{Promise, Value};

const STYLE_FAIL: Style = Style::new().red();
const STYLE_PASS: Style = Style::new().green();
const STYLE_NOTE: Style = Style::new().blue();

/// A description file that has been executed, together with the mtime it
/// had at load time. Any loaded file being newer than a task's outputs
/// forces a rebuild of that task.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub path: Utf8PathBuf,
    pub mtime: SystemTime,
}

pub struct App {
    globals: Config,
    reporter: Reporter,
    host: RefCell<Option<Rc<dyn DescriptionHost>>>,

    jobs_budget: usize,
    jobs: RefCell<Arc<Semaphore>>,

    tasks_total: Cell<usize>,
    tasks_pass: Cell<usize>,
    tasks_fail: Cell<usize>,
    tasks_skip: Cell<usize>,
    tasks_cancel: Cell<usize>,
    task_counter: Cell<usize>,
    mtime_calls: Cell<usize>,
    expand_depth: Cell<usize>,

    pending_tasks: RefCell<Vec<Task>>,
    queued_tasks: RefCell<VecDeque<Task>>,
    all_build_files: RefCell<HashSet<Utf8PathBuf>>,
    loaded_modules: RefCell<Vec<LoadedModule>>,
    dirstack: RefCell<Vec<Utf8PathBuf>>,
}

impl App {
    pub fn new(options: Options) -> Result<Rc<Self>, BuildError> {
        Self::with_flag_overrides(options, Vec::new())
    }

    /// Builds an app from parsed options plus any unrecognized `--key=value`
    /// flags, which become fields on the global config.
    pub fn with_flag_overrides(
        options: Options,
        extras: Vec<(String, Value)>,
    ) -> Result<Rc<Self>, BuildError> {
        let cwd = std::env::current_dir()?;
        let cwd = Utf8PathBuf::from_path_buf(cwd)
            .map_err(|p| BuildError::NonUtf8Path(p.display().to_string()))?;
        let root_path = crate::paths::absolutize(&cwd, options.chdir.as_str());

        let globals = config::global_defaults();
        globals.set("root_path", root_path.clone());
        globals.set("root_name", options.root_name.clone());
        globals.set("repo_path", root_path.clone());
        globals.set("repo_name", "");
        globals.set("jobs", options.jobs);
        globals.set("verbose", options.verbose);
        globals.set("quiet", options.quiet);
        globals.set("dry_run", options.dry_run);
        globals.set("debug", options.debug);
        globals.set("force", options.force);
        globals.set("shuffle", options.shuffle);
        globals.set("trace", options.trace);

        for (key, value) in extras {
            globals.set(key, value);
        }

        let reporter = Reporter::new();
        let quiet = globals.get("quiet").is_some_and(|v| v.is_truthy());
        let verbose = globals.get("verbose").is_some_and(|v| v.is_truthy());
        let use_color = globals.get("use_color").is_some_and(|v| v.is_truthy());
        reporter.configure(quiet, verbose, use_color);

        let jobs_budget = options.jobs.max(1);

        Ok(Rc::new(Self {
            globals,
            reporter,
            host: RefCell::new(None),
            jobs_budget,
            jobs: RefCell::new(Arc::new(Semaphore::new(jobs_budget))),
            tasks_total: Cell::new(0),
            tasks_pass: Cell::new(0),
            tasks_fail: Cell::new(0),
            tasks_skip: Cell::new(0),
            tasks_cancel: Cell::new(0),
            task_counter: Cell::new(0),
            mtime_calls: Cell::new(0),
            expand_depth: Cell::new(0),
            pending_tasks: RefCell::new(Vec::new()),
            queued_tasks: RefCell::new(VecDeque::new()),
            all_build_files: RefCell::new(HashSet::new()),
            loaded_modules: RefCell::new(Vec::new()),
            dirstack: RefCell::new(vec![root_path]),
        }))
    }

    /// A quiet app rooted at the current directory, for tests.
    pub fn for_testing() -> Rc<Self> {
        let options = Options::default();
        let app = Self::new(options).expect("app construction");
        app.globals.set("quiet", true);
        app.reporter.configure(true, false, false);
        app
    }

    /// Restores a fresh state, keeping the parsed options.
    pub fn reset(&self) {
        self.tasks_total.set(0);
        self.tasks_pass.set(0);
        self.tasks_fail.set(0);
        self.tasks_skip.set(0);
        self.tasks_cancel.set(0);
        self.task_counter.set(0);
        self.mtime_calls.set(0);
        self.expand_depth.set(0);
        self.pending_tasks.borrow_mut().clear();
        self.queued_tasks.borrow_mut().clear();
        self.all_build_files.borrow_mut().clear();
        self.loaded_modules.borrow_mut().clear();
        let root = self.root_path();
        *self.dirstack.borrow_mut() = vec![root];
        *self.jobs.borrow_mut() = Arc::new(Semaphore::new(self.jobs_budget));
    }

    pub fn globals(&self) -> Config {
        self.globals.clone()
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn log_text(&self) -> String {
        self.reporter.log_text()
    }

    pub fn root_path(&self) -> Utf8PathBuf {
        self.globals
            .get("root_path")
            .and_then(|v| v.as_str().map(Utf8PathBuf::from))
            .unwrap_or_default()
    }

    /// Truthiness of a global flag.
    pub fn flag(&self, name: &str) -> bool {
        self.globals.get(name).is_some_and(|v| v.is_truthy())
    }

    pub fn use_color(&self) -> bool {
        self.flag("use_color")
    }

    pub fn jobs_budget(&self) -> usize {
        self.jobs_budget
    }

    //// Directory stack

    /// Pushes a directory on the stack. The stack replaces process-wide
    /// chdir: globbing and absolutization during load resolve against
    /// [`App::topdir`], and subprocesses get their cwd via the spawn
    /// argument.
    pub(crate) fn pushdir(&self, path: &Utf8Path) -> Result<(), BuildError> {
        let top = self.topdir();
        let absolute = crate::paths::absolutize(&top, path.as_str());
        if !absolute.as_std_path().is_dir() {
            return Err(BuildError::PathMissing(absolute));
        }
        self.dirstack.borrow_mut().push(absolute);
        Ok(())
    }

    pub(crate) fn popdir(&self) {
        let mut stack = self.dirstack.borrow_mut();
        if stack.len() > 1 {
            stack.pop();
        }
    }

    pub fn topdir(&self) -> Utf8PathBuf {
        self.dirstack
            .borrow()
            .last()
            .cloned()
            .unwrap_or_else(|| self.root_path())
    }

    //// Expansion bookkeeping

    pub(crate) fn expand_enter(&self) {
        self.expand_depth.set(self.expand_depth.get() + 1);
    }

    pub(crate) fn expand_leave(&self) {
        self.expand_depth.set(self.expand_depth.get().saturating_sub(1));
    }

    pub fn expand_depth(&self) -> usize {
        self.expand_depth.get()
    }

    /// Emits an expansion trace line when `--trace` is on.
    pub(crate) fn trace(&self, line: impl FnOnce(usize) -> String) {
        if self.flag("trace") {
            let depth = self.expand_depth.get();
            self.reporter.line(&line(depth));
        }
    }

    //// Counters

    pub fn tasks_total(&self) -> usize {
        self.tasks_total.get()
    }

    pub fn tasks_pass(&self) -> usize {
        self.tasks_pass.get()
    }

    pub fn tasks_fail(&self) -> usize {
        self.tasks_fail.get()
    }

    pub fn tasks_skip(&self) -> usize {
        self.tasks_skip.get()
    }

    pub fn tasks_cancel(&self) -> usize {
        self.tasks_cancel.get()
    }

    pub fn mtime_calls(&self) -> usize {
        self.mtime_calls.get()
    }

    pub(crate) fn count_total(&self) {
        self.tasks_total.set(self.tasks_total.get() + 1);
    }

    pub(crate) fn count_pass(&self) {
        self.tasks_pass.set(self.tasks_pass.get() + 1);
    }

    pub(crate) fn count_fail(&self) {
        self.tasks_fail.set(self.tasks_fail.get() + 1);
    }

    pub(crate) fn count_skip(&self) {
        self.tasks_skip.set(self.tasks_skip.get() + 1);
    }

    pub(crate) fn count_cancel(&self) {
        self.tasks_cancel.set(self.tasks_cancel.get() + 1);
    }

    pub(crate) fn next_task_index(&self) -> usize {
        self.task_counter.set(self.task_counter.get() + 1);
        self.task_counter.get()
    }

    //// Filesystem probes

    /// Stats a file's mtime, tracking how many probes a build makes.
    pub(crate) fn mtime(&self, path: &Utf8Path) -> Result<SystemTime, BuildError> {
        self.mtime_calls.set(self.mtime_calls.get() + 1);
        let meta = std::fs::metadata(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                BuildError::PathMissing(path.to_path_buf())
            } else {
                BuildError::Io(err)
            }
        })?;
        Ok(meta.modified()?)
    }

    /// Claims an output path for a task. Every output path belongs to
    /// exactly one task.
    pub(crate) fn register_build_file(&self, path: &Utf8Path) -> Result<(), BuildError> {
        if !self.all_build_files.borrow_mut().insert(path.to_path_buf()) {
            return Err(BuildError::DuplicateOutput(path.to_path_buf()));
        }
        Ok(())
    }

    pub(crate) fn record_module(&self, path: Utf8PathBuf, mtime: SystemTime) {
        self.loaded_modules.borrow_mut().push(LoadedModule { path, mtime });
    }

    pub fn loaded_modules(&self) -> Vec<LoadedModule> {
        self.loaded_modules.borrow().clone()
    }

    //// Host

    pub(crate) fn set_host(&self, host: Rc<dyn DescriptionHost>) {
        *self.host.borrow_mut() = Some(host);
    }

    pub(crate) fn host(&self) -> Option<Rc<dyn DescriptionHost>> {
        self.host.borrow().clone()
    }

    //// Job pool

    /// Waits until `count` jobs are free and claims them. The permit
    /// releases the jobs when dropped, on success and failure alike.
    pub(crate) async fn acquire_jobs(
        &self,
        count: usize,
    ) -> Result<OwnedSemaphorePermit, BuildError> {
        if count > self.jobs_budget {
            return Err(BuildError::JobOverflow {
                count,
                jobs: self.jobs_budget,
            });
        }
        let semaphore = self.jobs.borrow().clone();
        let permit = semaphore
            .acquire_many_owned(count as u32)
            .await
            .expect("job semaphore never closes");
        Ok(permit)
    }

    //// Task queues

    pub(crate) fn add_pending(&self, task: Task) {
        self.count_total();
        self.pending_tasks.borrow_mut().push(task);
    }

    /// Promotes every pending task to the queued list, giving each a
    /// promise and a running future. With `--shuffle`, the pending batch is
    /// permuted first to shake out undeclared dependencies.
    pub fn queue_pending_tasks(self: &Rc<Self>) {
        let mut batch: Vec<Task> = {
            let mut pending = self.pending_tasks.borrow_mut();
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }
        if self.flag("shuffle") {
            use rand::seq::SliceRandom;
            debug!(count = batch.len(), "shuffling pending tasks");
            batch.shuffle(&mut rand::thread_rng());
        }
        for task in batch {
            let promise = Promise::new();
            task.set_promise(promise.clone());
            self.queued_tasks.borrow_mut().push_back(task.clone());
            let app = Rc::clone(self);
            tokio::task::spawn_local(async move {
                let outcome = task::run_task(app, task).await;
                promise.resolve(outcome);
            });
        }
    }

    /// Runs queued tasks until none are left.
    ///
    /// Tasks can create other tasks, so instead of blocking on whole
    /// batches we queue any newly pending tasks after awaiting each one.
    /// Awaiting in creation order walks the dependency graph in
    /// topological order, because a task cannot pass its value-walk until
    /// its producers resolve.
    pub async fn run_tasks(self: &Rc<Self>) -> i32 {
        let started = Instant::now();

        self.queue_pending_tasks();
        loop {
            let next = self.queued_tasks.borrow_mut().pop_front();
            let Some(task) = next else { break };
            if let Some(promise) = task.promise() {
                promise.wait().await;
            }
            self.queue_pending_tasks();
        }

        if self.flag("debug") || self.flag("verbose") {
            self.reporter.line(&format!(
                "Running tasks took {:.3} seconds",
                started.elapsed().as_secs_f64()
            ));
        }
        self.print_summary();

        if self.tasks_fail.get() > 0 { -1 } else { 0 }
    }

    fn print_summary(&self) {
        if self.flag("debug") {
            self.reporter
                .line(&format!("tasks total:     {}", self.tasks_total.get()));
            self.reporter
                .line(&format!("tasks passed:    {}", self.tasks_pass.get()));
            self.reporter
                .line(&format!("tasks failed:    {}", self.tasks_fail.get()));
            self.reporter
                .line(&format!("tasks skipped:   {}", self.tasks_skip.get()));
            self.reporter
                .line(&format!("tasks cancelled: {}", self.tasks_cancel.get()));
            self.reporter
                .line(&format!("mtime calls:     {}", self.mtime_calls.get()));
        }

        let summary = if self.tasks_fail.get() > 0 {
            self.reporter.paint(&STYLE_FAIL, "BUILD FAILED")
        } else if self.tasks_pass.get() > 0 {
            self.reporter.paint(&STYLE_PASS, "BUILD PASSED")
        } else {
            self.reporter.paint(&STYLE_NOTE, "BUILD CLEAN")
        };
        self.reporter.line(&format!("hancho: {summary}"));
    }

    /// Drives [`App::run_tasks`] on a fresh current-thread runtime. All
    /// task futures share this one event loop.
    pub fn build(self: &Rc<Self>) -> i32 {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                self.reporter
                    .line(&self.reporter.paint(&STYLE_FAIL, &format!("{err}")));
                return -1;
            }
        };
        let local = tokio::task::LocalSet::new();
        local.block_on(&runtime, self.run_tasks())
    }

    /// Loads the root description file through `host`, then runs the
    /// build. Load-phase errors abort with a nonzero result before any
    /// task future is created.
    pub fn run(self: &Rc<Self>, host: Rc<dyn DescriptionHost>) -> i32 {
        self.set_host(host);

        let started = Instant::now();
        if let Err(err) = loader::load_root(self) {
            self.reporter
                .line(&self.reporter.paint(&STYLE_FAIL, &format!("{err}")));
            return -1;
        }
        if self.flag("debug") || self.flag("verbose") {
            self.reporter.line(&format!(
                "Loading description files took {:.3} seconds",
                started.elapsed().as_secs_f64()
            ));
        }

        self.build()
    }
}
