//! Configs: insertion-ordered bags of named [`Value`] fields.
//!
//! A config doubles as a record (task inputs, module namespaces) and as the
//! variable scope for template expansion. Parent configs are flattened into
//! the child at construction time, so field lookup never chases a pointer
//! chain.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::value::{Builtin, Value};

/// Subkinds exist only so factories can tell their products apart; behavior
/// is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKind {
    Plain,
    Command,
    Repo,
    Module,
    Include,
}

struct ConfigData {
    kind: ConfigKind,
    fields: IndexMap<String, Value>,
}

/// A cheaply clonable handle to a config record.
#[derive(Clone)]
pub struct Config {
    data: Rc<RefCell<ConfigData>>,
}

impl Config {
    pub fn new() -> Self {
        Self::with_kind(ConfigKind::Plain)
    }

    pub fn with_kind(kind: ConfigKind) -> Self {
        Self {
            data: Rc::new(RefCell::new(ConfigData {
                kind,
                fields: IndexMap::new(),
            })),
        }
    }

    /// Builds a plain config from key/value pairs.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        let config = Config::new();
        for (key, value) in pairs {
            config.set(key, value);
        }
        config
    }

    pub fn kind(&self) -> ConfigKind {
        self.data.borrow().kind
    }

    pub(crate) fn set_kind(&self, kind: ConfigKind) {
        self.data.borrow_mut().kind = kind;
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.borrow().fields.get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.data
            .borrow_mut()
            .fields
            .insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.borrow_mut().fields.shift_remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.borrow().fields.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.borrow().fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.borrow().fields.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.borrow().fields.keys().cloned().collect()
    }

    /// Snapshot of the fields in insertion order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.data
            .borrow()
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) fn entry_at(&self, index: usize) -> Option<(String, Value)> {
        self.data
            .borrow()
            .fields
            .get_index(index)
            .map(|(k, v)| (k.clone(), v.clone()))
    }

    /// Copies every field of `other` into `self`, overwriting existing keys.
    pub fn merge(&self, other: &Config) {
        for (key, value) in other.entries() {
            self.set(key, value);
        }
    }

    /// Merges each source left to right; later sources win.
    pub fn update(&self, sources: &[&Config]) {
        for source in sources {
            self.merge(source);
        }
    }

    /// Constructs a child of the same subkind with `self` flattened in,
    /// then the given pairs on top.
    pub fn extend<'a>(&self, pairs: impl IntoIterator<Item = (&'a str, Value)>) -> Config {
        let child = Config::with_kind(self.kind());
        child.merge(self);
        for (key, value) in pairs {
            child.set(key, value);
        }
        child
    }

    pub fn ptr_eq(&self, other: &Config) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.borrow();
        let mut map = f.debug_map();
        for (key, value) in &data.fields {
            map.entry(key, value);
        }
        map.finish()
    }
}

/// The global config: builtin helpers, CLI flag mirrors, and the default
/// field templates that drive the implicit path flow. Per-task configs fall
/// back to this scope during expansion.
pub(crate) fn global_defaults() -> Config {
    let config = Config::new();

    for builtin in Builtin::ALL {
        config.set(builtin.name(), Value::Builtin(builtin));
    }

    config.set("root_name", "build.hancho");
    config.set("repo_name", "");

    config.set("depformat", "gcc");
    config.set("job_count", 1);
    config.set("ext_build", false);

    config.set("verbose", false);
    config.set("quiet", false);
    config.set("dry_run", false);
    config.set("debug", false);
    config.set("force", false);
    config.set("shuffle", false);
    config.set("trace", false);
    config.set("use_color", true);

    config.set(
        "abs_command_path",
        "{abs_path(join_path(base_path, command_path))}",
    );
    config.set(
        "abs_source_path",
        "{abs_path(join_path(base_path, source_path))}",
    );
    config.set(
        "abs_build_path",
        "{abs_path(join_path(base_path, build_path))}",
    );

    config.set(
        "abs_command_files",
        "{flatten(join_path(abs_command_path, command_files))}",
    );
    config.set(
        "abs_source_files",
        "{flatten(join_path(abs_source_path, source_files))}",
    );
    config.set(
        "abs_build_files",
        "{flatten(join_path(abs_build_path, build_files))}",
    );
    config.set(
        "abs_build_deps",
        "{flatten(join_path(abs_build_path, build_deps))}",
    );

    config.set("rel_source_path", "{rel_path(abs_source_path, abs_command_path)}");
    config.set("rel_build_path", "{rel_path(abs_build_path, abs_command_path)}");

    config.set(
        "rel_command_files",
        "{rel_path(abs_command_files, abs_command_path)}",
    );
    config.set(
        "rel_source_files",
        "{rel_path(abs_source_files, abs_command_path)}",
    );
    config.set(
        "rel_build_files",
        "{rel_path(abs_build_files, abs_command_path)}",
    );
    config.set(
        "rel_build_deps",
        "{rel_path(abs_build_deps, abs_command_path)}",
    );

    config.set("default_command_path", "{base_path}");
    config.set("default_source_path", "{base_path}");
    config.set(
        "default_build_path",
        "{root_path}/{build_dir}/{build_tag}/{repo_name}/{rel_path(abs_source_path, repo_path)}",
    );

    config.set("command_path", "{default_command_path}");
    config.set("source_path", "{default_source_path}");
    config.set("build_path", "{default_build_path}");

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_is_left_to_right() {
        let a = Config::from_pairs([("x", Value::from(1)), ("y", Value::from(2))]);
        let b = Config::from_pairs([("y", Value::from(3)), ("z", Value::from(4))]);
        let merged = Config::new();
        merged.update(&[&a, &b]);

        assert_eq!(merged.get("x"), Some(Value::from(1)));
        assert_eq!(merged.get("y"), Some(Value::from(3)));
        assert_eq!(merged.get("z"), Some(Value::from(4)));
    }

    #[test]
    fn fields_keep_insertion_order() {
        let config = Config::new();
        config.set("c", 1);
        config.set("a", 2);
        config.set("b", 3);
        config.set("a", 4);
        assert_eq!(config.keys(), ["c", "a", "b"]);
    }

    #[test]
    fn extend_preserves_subkind() {
        let command = Config::with_kind(ConfigKind::Command);
        command.set("command", "true");
        let child = command.extend([("desc", Value::from("child"))]);

        assert_eq!(child.kind(), ConfigKind::Command);
        assert_eq!(child.get("command"), Some(Value::from("true")));
        assert_eq!(child.get("desc"), Some(Value::from("child")));
    }

    #[test]
    fn defaults_expose_builtins_as_values() {
        let defaults = global_defaults();
        assert_eq!(
            defaults.get("join_path"),
            Some(Value::Builtin(Builtin::JoinPath))
        );
        assert!(defaults.get("build_path").is_some());
    }
}
