//! Template expansion.
//!
//! We do not know in advance how users will nest strings, templates,
//! callbacks and lists inside task fields, so expansion is a dynamic
//! dispatch over [`Value`] that keeps recursing until only scalars and
//! lists of scalars remain. Field reads during macro evaluation expand
//! *at read time*, which lets fields reference each other freely; the
//! depth counter on the app turns runaway reference chains into an
//! [`BuildError::ExpansionCycle`] instead of a stack overflow.

use std::rc::Rc;

use crate::app::App;
use crate::config::Config;
use crate::error::BuildError;
use crate::eval;
use crate::value::{TaskOutcome, Value, flatten};

/// The maximum number of recursion levels for macro expansion.
pub const MAX_EXPAND_DEPTH: usize = 20;

/// First `{…}` span in `s`, if any.
fn macro_span(s: &str) -> Option<(usize, usize)> {
    let start = s.find('{')?;
    let end = start + s[start..].find('}')?;
    Some((start, end + 1))
}

/// A string that consists of exactly one macro, nothing else. Pure macros
/// keep the type of their result instead of stringifying it.
fn is_pure_macro(s: &str) -> bool {
    s.len() >= 2 && s.starts_with('{') && s.ends_with('}') && !s[1..s.len() - 1].contains('}')
}

struct DepthGuard<'a> {
    app: &'a App,
}

impl<'a> DepthGuard<'a> {
    fn enter(app: &'a App) -> Self {
        app.expand_enter();
        Self { app }
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.app.expand_leave();
    }
}

/// Expands all templates anywhere inside `value`, evaluating macros against
/// `scope`.
pub fn expand(app: &Rc<App>, scope: &Config, value: &Value) -> Result<Value, BuildError> {
    match value {
        Value::Config(_) => Ok(value.clone()),
        Value::Task(task) => match task.peek_outcome() {
            Some(TaskOutcome::Finished(resolved)) => expand(app, scope, &resolved),
            Some(TaskOutcome::Cancelled) => Err(BuildError::UnknownVariant("cancelled task")),
            None => Err(BuildError::UnknownVariant("unresolved task")),
        },
        Value::Promise(promise) => match promise.peek() {
            Some(TaskOutcome::Finished(resolved)) => expand(app, scope, &resolved),
            Some(TaskOutcome::Cancelled) => Err(BuildError::UnknownVariant("cancelled promise")),
            None => Err(BuildError::UnknownVariant("unresolved promise")),
        },
        Value::List(items) => {
            let expanded: Result<Vec<Value>, BuildError> =
                items.iter().map(|item| expand(app, scope, item)).collect();
            Ok(Value::List(expanded?))
        }
        Value::Str(s) if is_pure_macro(s) => eval_macro(app, scope, s),
        Value::Str(s) if macro_span(s).is_some() => {
            Ok(Value::Str(expand_template(app, scope, s)?))
        }
        Value::Null | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => {
            Ok(value.clone())
        }
        Value::Callback(_) | Value::Builtin(_) => Ok(value.clone()),
    }
}

/// Replaces every macro span in `template` with its stringified value.
fn expand_template(app: &Rc<App>, scope: &Config, template: &str) -> Result<String, BuildError> {
    app.trace(|depth| format!("{}┏ expand '{template}'", "┃".repeat(depth)));
    let _guard = DepthGuard::enter(app);

    let mut rest = template;
    let mut result = String::new();
    while let Some((start, end)) = macro_span(rest) {
        result.push_str(&rest[..start]);
        let value = eval_macro(app, scope, &rest[start..end])?;
        let parts: Vec<String> = flatten(value).iter().map(Value::stringify).collect();
        result.push_str(&parts.join(" "));
        rest = &rest[end..];
    }
    result.push_str(rest);

    drop(_guard);
    app.trace(|depth| format!("{}┗ '{result}'", "┃".repeat(depth)));
    Ok(result)
}

/// Evaluates the contents of one `{macro}` string.
fn eval_macro(app: &Rc<App>, scope: &Config, macro_src: &str) -> Result<Value, BuildError> {
    if app.expand_depth() > MAX_EXPAND_DEPTH {
        return Err(BuildError::ExpansionCycle(macro_src.to_string()));
    }
    app.trace(|depth| format!("{}┏ eval '{macro_src}'", "┃".repeat(depth)));
    let _guard = DepthGuard::enter(app);

    let inner = &macro_src[1..macro_src.len() - 1];
    let result = eval::eval_expression(app, scope, inner)?;

    drop(_guard);
    app.trace(|depth| format!("{}┗ {}", "┃".repeat(depth), result.stringify()));
    Ok(result)
}
