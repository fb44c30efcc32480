//! The dynamic value model.
//!
//! Every task field is a [`Value`]: a scalar, a list, a nested config, a
//! user callback, a handle to another task, or a promise that resolves to
//! another value once its producer finishes. Template expansion reduces any
//! cycle-free value down to scalars and lists of scalars.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use tokio::sync::Notify;

use crate::config::Config;
use crate::task::Task;

pub type CallbackFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>>>>;

/// Opaque user code attached to a task field. Invoked with the task during
/// command dispatch; the result may itself require awaiting.
#[derive(Clone)]
pub struct Callback {
    func: Rc<dyn Fn(Task) -> CallbackFuture>,
}

impl Callback {
    /// Wraps a synchronous callback.
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(Task) -> anyhow::Result<Value> + 'static,
    {
        Self {
            func: Rc::new(move |task| {
                let result = func(task);
                Box::pin(async move { result })
            }),
        }
    }

    /// Wraps an async callback.
    pub fn new_async<F, Fut>(func: F) -> Self
    where
        F: Fn(Task) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + 'static,
    {
        Self {
            func: Rc::new(move |task| Box::pin(func(task))),
        }
    }

    pub(crate) fn invoke(&self, task: Task) -> CallbackFuture {
        (self.func)(task)
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callback(..)")
    }
}

/// Helpers callable from macro expressions. These live as ordinary entries
/// in the global config map, so identifier lookup finds them like any other
/// field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    AbsPath,
    RelPath,
    JoinPath,
    SwapExt,
    Flatten,
    Glob,
    Len,
    Color,
    Basename,
    Print,
    RunCmd,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::AbsPath => "abs_path",
            Builtin::RelPath => "rel_path",
            Builtin::JoinPath => "join_path",
            Builtin::SwapExt => "swap_ext",
            Builtin::Flatten => "flatten",
            Builtin::Glob => "glob",
            Builtin::Len => "len",
            Builtin::Color => "color",
            Builtin::Basename => "basename",
            Builtin::Print => "print",
            Builtin::RunCmd => "run_cmd",
        }
    }

    pub(crate) const ALL: [Builtin; 11] = [
        Builtin::AbsPath,
        Builtin::RelPath,
        Builtin::JoinPath,
        Builtin::SwapExt,
        Builtin::Flatten,
        Builtin::Glob,
        Builtin::Len,
        Builtin::Color,
        Builtin::Basename,
        Builtin::Print,
        Builtin::RunCmd,
    ];
}

/// What a task's promise eventually resolves to.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The task's output paths (or whatever its last command returned).
    Finished(Value),
    /// The task or one of its upstream dependencies failed.
    Cancelled,
}

/// A one-shot, multi-consumer cell holding a [`TaskOutcome`].
///
/// Every task gets one when it is queued; any number of downstream tasks can
/// await it. Resolution wakes all current waiters.
#[derive(Clone)]
pub struct Promise {
    cell: Rc<RefCell<Option<TaskOutcome>>>,
    notify: Rc<Notify>,
}

impl Promise {
    pub fn new() -> Self {
        Self {
            cell: Rc::new(RefCell::new(None)),
            notify: Rc::new(Notify::new()),
        }
    }

    /// Resolves the promise. A promise is resolved exactly once.
    pub fn resolve(&self, outcome: TaskOutcome) {
        *self.cell.borrow_mut() = Some(outcome);
        self.notify.notify_waiters();
    }

    /// Returns the outcome if the promise has already resolved.
    pub fn peek(&self) -> Option<TaskOutcome> {
        self.cell.borrow().clone()
    }

    /// Waits for resolution. Single-threaded cooperative scheduling means a
    /// resolution can only happen while we are suspended here, so the
    /// check-then-wait loop cannot miss a wakeup.
    pub async fn wait(&self) -> TaskOutcome {
        loop {
            let current = self.cell.borrow().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            self.notify.notified().await;
        }
    }

    fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Default for Promise {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.cell.borrow() {
            Some(outcome) => write!(f, "Promise({outcome:?})"),
            None => write!(f, "Promise(<pending>)"),
        }
    }
}

/// The universal field type.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Config(Config),
    Callback(Callback),
    Builtin(Builtin),
    Task(Task),
    Promise(Promise),
}

impl Value {
    /// Short type name, used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Config(_) => "config",
            Value::Callback(_) => "callback",
            Value::Builtin(_) => "builtin",
            Value::Task(_) => "task",
            Value::Promise(_) => "promise",
        }
    }

    /// Truthiness mirrors the usual scripting rules: null, false, zero, the
    /// empty string and the empty list are false; everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(x) => *x != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Builds a list value from anything convertible.
    pub fn list<T: Into<Value>>(items: impl IntoIterator<Item = T>) -> Value {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    /// Stringification used for template substitution.
    pub fn stringify(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(n) => n.to_string(),
            Value::Float(x) => x.to_string(),
            Value::Str(s) => s.clone(),
            Value::List(_) => {
                let parts: Vec<String> =
                    flatten(self.clone()).iter().map(Value::stringify).collect();
                parts.join(" ")
            }
            other => format!("<{}>", other.kind_name()),
        }
    }
}

/// Depth-first sequence of leaves from arbitrarily nested lists; scalars
/// pass through as a single-element sequence.
pub fn flatten(value: Value) -> Vec<Value> {
    match value {
        Value::List(items) => items.into_iter().flat_map(flatten).collect(),
        other => vec![other],
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Config(a), Value::Config(b)) => a.ptr_eq(b),
            (Value::Callback(a), Value::Callback(b)) => a.ptr_eq(b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Task(a), Value::Task(b)) => a.ptr_eq(b),
            (Value::Promise(a), Value::Promise(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(n as i64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Int(n as i64)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<Config> for Value {
    fn from(config: Config) -> Self {
        Value::Config(config)
    }
}

impl From<Task> for Value {
    fn from(task: Task) -> Self {
        Value::Task(task)
    }
}

impl From<Callback> for Value {
    fn from(callback: Callback) -> Self {
        Value::Callback(callback)
    }
}

impl From<camino::Utf8PathBuf> for Value {
    fn from(path: camino::Utf8PathBuf) -> Self {
        Value::Str(path.into_string())
    }
}
