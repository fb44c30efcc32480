//! Pure path helpers shared by the template builtins and task setup.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::error::BuildError;
use crate::value::{Value, flatten};

/// Lexically normalizes a path: collapses `.` and redundant separators and
/// resolves `..` against the preceding component. No filesystem access.
pub fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                let popped = matches!(
                    out.components().next_back(),
                    Some(Utf8Component::Normal(_))
                ) && out.pop();
                if !popped && !matches!(out.components().next_back(), Some(Utf8Component::RootDir))
                {
                    out.push("..");
                }
            }
            other => out.push(other.as_str()),
        }
    }
    out
}

/// Absolutizes `path` against `base` (which must itself be absolute), then
/// normalizes the result.
pub fn absolutize(base: &Utf8Path, path: &str) -> Utf8PathBuf {
    normalize(&base.join(path))
}

fn scalar_path(value: &Value) -> Result<String, BuildError> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(BuildError::UnknownVariant(other.kind_name())),
    }
}

/// Value-level absolutize: lists map elementwise. With `strict`, a result
/// that does not exist on disk is an error.
pub fn abs_path(base: &Utf8Path, value: &Value, strict: bool) -> Result<Value, BuildError> {
    match value {
        Value::List(items) => {
            let mapped: Result<Vec<Value>, BuildError> = items
                .iter()
                .map(|item| abs_path(base, item, strict))
                .collect();
            Ok(Value::List(mapped?))
        }
        other => {
            let raw = scalar_path(other)?;
            let result = absolutize(base, &raw);
            if strict && !result.as_std_path().exists() {
                return Err(BuildError::PathMissing(result));
            }
            Ok(Value::Str(result.into_string()))
        }
    }
}

/// Strips a leading `base + "/"` off `value`, or returns `""` when equal.
///
/// This is a pure string operation on purpose: synthesizing `..` segments
/// misbehaves on symlink-bearing paths.
pub fn rel_path(value: &Value, base: &Value) -> Result<Value, BuildError> {
    let base = scalar_path(base)?;
    rel_path_str(value, &base)
}

fn rel_path_str(value: &Value, base: &str) -> Result<Value, BuildError> {
    match value {
        Value::List(items) => {
            let mapped: Result<Vec<Value>, BuildError> = items
                .iter()
                .map(|item| rel_path_str(item, base))
                .collect();
            Ok(Value::List(mapped?))
        }
        other => {
            let path = scalar_path(other)?;
            let result = if path == base {
                String::new()
            } else {
                let prefix = format!("{base}/");
                path.strip_prefix(&prefix).map(str::to_string).unwrap_or(path)
            };
            Ok(Value::Str(result))
        }
    }
}

/// All possible concatenations of the given path fragments.
///
/// Each argument may be a scalar or an arbitrarily nested list; arguments
/// are flattened and combined pairwise as a cartesian product. A product
/// with exactly one element collapses back to a scalar.
pub fn join_path(args: &[Value]) -> Result<Value, BuildError> {
    match args {
        [] => Ok(Value::Str(String::new())),
        [single] => Ok(Value::List(vec![single.clone()])),
        [a, b] => {
            let lhs = flatten(a.clone());
            let rhs = flatten(b.clone());
            let mut result = Vec::with_capacity(lhs.len() * rhs.len());
            for left in &lhs {
                let left = scalar_path(left)?;
                for right in &rhs {
                    let right = scalar_path(right)?;
                    let joined = Utf8Path::new(&left).join(&right);
                    result.push(Value::Str(joined.into_string()));
                }
            }
            if result.len() == 1 {
                Ok(result.into_iter().next().expect("len checked"))
            } else {
                Ok(Value::List(result))
            }
        }
        [first, rest @ ..] => {
            let tail = join_path(rest)?;
            join_path(&[first.clone(), tail])
        }
    }
}

/// Replaces the final extension of a filename (or of every filename in a
/// nested list). `new_ext` carries its own leading dot.
pub fn swap_ext(value: &Value, new_ext: &str) -> Result<Value, BuildError> {
    match value {
        Value::List(items) => {
            let mapped: Result<Vec<Value>, BuildError> = items
                .iter()
                .map(|item| swap_ext(item, new_ext))
                .collect();
            Ok(Value::List(mapped?))
        }
        other => {
            let name = scalar_path(other)?;
            Ok(Value::Str(format!("{}{new_ext}", strip_ext(&name))))
        }
    }
}

/// A value that must denote exactly one path: a string, or a
/// single-element list of one.
pub(crate) fn one_path(value: Value) -> Result<Utf8PathBuf, BuildError> {
    match value {
        Value::Str(s) => Ok(Utf8PathBuf::from(s)),
        Value::List(items) if items.len() == 1 => {
            one_path(items.into_iter().next().expect("len checked"))
        }
        other => Err(BuildError::UnknownVariant(other.kind_name())),
    }
}

/// Flattens a value into a list of paths; every leaf must be a string.
pub(crate) fn path_list(value: Value) -> Result<Vec<Utf8PathBuf>, BuildError> {
    flatten(value)
        .into_iter()
        .map(|item| match item {
            Value::Str(s) => Ok(Utf8PathBuf::from(s)),
            other => Err(BuildError::UnknownVariant(other.kind_name())),
        })
        .collect()
}

/// Everything before the final extension. A dot that starts the basename
/// does not count as an extension separator.
fn strip_ext(name: &str) -> &str {
    let basename_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    let basename = &name[basename_start..];
    match basename.rfind('.') {
        Some(dot) if dot > 0 => &name[..basename_start + dot],
        _ => name,
    }
}
