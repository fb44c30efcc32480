//! Loading description files.
//!
//! The crate does not embed a scripting language. A description file is
//! executed by a [`DescriptionHost`] supplied by the embedder — usually a
//! [`HostRegistry`] that maps file names to compiled Rust closures. The
//! loader owns the part that *is* specified: resolving the file strictly,
//! scoping the directory stack around execution, recording the file for
//! staleness checks, and copying the module's public bindings out.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::app::App;
use crate::config::{Config, ConfigKind};
use crate::error::BuildError;
use crate::expand::expand;
use crate::paths::{self, one_path};
use crate::task::Task;
use crate::value::Value;

/// Executes description files. `scope` carries the module config the file
/// sees as `hancho`; the returned config is the file's namespace of public
/// bindings.
pub trait DescriptionHost {
    fn execute(&self, scope: &Scope, path: &Utf8Path) -> anyhow::Result<Config>;
}

type ModuleFn = Rc<dyn Fn(&Scope) -> anyhow::Result<Config>>;

/// The batteries-included host: description logic registered as Rust
/// closures, keyed by full path or bare file name.
#[derive(Clone, Default)]
pub struct HostRegistry {
    modules: Rc<RefCell<HashMap<String, ModuleFn>>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, module: F)
    where
        F: Fn(&Scope) -> anyhow::Result<Config> + 'static,
    {
        self.modules
            .borrow_mut()
            .insert(name.into(), Rc::new(module));
    }
}

impl DescriptionHost for HostRegistry {
    fn execute(&self, scope: &Scope, path: &Utf8Path) -> anyhow::Result<Config> {
        let module = {
            let modules = self.modules.borrow();
            modules
                .get(path.as_str())
                .or_else(|| path.file_name().and_then(|name| modules.get(name)))
                .cloned()
        };
        match module {
            Some(module) => module(scope),
            None => Err(BuildError::NoHost(path.to_path_buf()).into()),
        }
    }
}

/// What a description file works with: the app plus its module config. All
/// the factories live here.
pub struct Scope {
    app: Rc<App>,
    config: Config,
}

impl Scope {
    pub(crate) fn new(app: Rc<App>, config: Config) -> Self {
        Self { app, config }
    }

    pub fn app(&self) -> &Rc<App> {
        &self.app
    }

    /// Reads a field of the module config, falling back to the globals.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.config
            .get(key)
            .or_else(|| self.app.globals().get(key))
    }

    /// Sets a field on the module config.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.config.set(key, value);
    }

    /// Expands a value against the module config.
    pub fn expand(&self, value: &Value) -> Result<Value, BuildError> {
        expand(&self.app, &self.config, value)
    }

    /// Globs relative to the directory of the file being loaded.
    pub fn glob(&self, pattern: &str) -> Result<Vec<String>, BuildError> {
        let matches = crate::eval::glob_files(&self.app, pattern)?;
        Ok(crate::value::flatten(matches)
            .into_iter()
            .map(|v| v.stringify())
            .collect())
    }

    /// A fresh standalone config.
    pub fn config<'a>(&self, pairs: impl IntoIterator<Item = (&'a str, Value)>) -> Config {
        Config::from_pairs(pairs)
    }

    /// A child of the module config.
    pub fn extend<'a>(&self, pairs: impl IntoIterator<Item = (&'a str, Value)>) -> Config {
        self.config.extend(pairs)
    }

    /// A callable command config: the module config, the overrides, and
    /// the command itself on top.
    pub fn command<'a>(
        &self,
        command: impl Into<Value>,
        pairs: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Config {
        let config = Config::with_kind(ConfigKind::Command);
        config.merge(&self.config);
        for (key, value) in pairs {
            config.set(key, value);
        }
        config.set("command", command);
        config
    }

    /// Declares a task with the module config as its base.
    pub fn task<'a>(
        &self,
        pairs: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Task, BuildError> {
        Task::new(&self.app, &[&self.config], pairs)
    }

    /// Loads another description file; tasks it declares resolve relative
    /// to that file's own directory.
    pub fn module<'a>(
        &self,
        file_name: &str,
        pairs: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Config, BuildError> {
        load(&self.app, &self.config, file_name, false, pairs)
    }

    /// Like [`Scope::module`], but the caller's base path is preserved, so
    /// included declarations resolve relative to the caller.
    pub fn include<'a>(
        &self,
        file_name: &str,
        pairs: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Config, BuildError> {
        load(&self.app, &self.config, file_name, true, pairs)
    }

    /// Rebases a config onto a subdirectory that holds its own repository
    /// of sources, so its tasks build into their own build-dir subtree.
    pub fn repo<'a>(
        &self,
        repo_path: &str,
        pairs: impl IntoIterator<Item = (&'a str, Value)>,
    ) -> Result<Config, BuildError> {
        repo(&self.app, &self.config, repo_path, pairs)
    }
}

struct DirGuard<'a> {
    app: &'a App,
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        self.app.popdir();
    }
}

/// Loads a description file on behalf of `caller` and copies its public
/// bindings (names not starting with `_`, excluding `hancho`) into the
/// returned module config.
pub fn load<'a>(
    app: &Rc<App>,
    caller: &Config,
    file_name: &str,
    is_include: bool,
    overrides: impl IntoIterator<Item = (&'a str, Value)>,
) -> Result<Config, BuildError> {
    let file_name = expand(app, caller, &Value::from(file_name))?.stringify();
    let base_path = caller
        .get("base_path")
        .ok_or_else(|| BuildError::UnknownField("base_path".to_string()))?;

    let joined = paths::join_path(&[base_path, Value::from(file_name)])?;
    let pathname = one_path(paths::abs_path(&app.topdir(), &joined, true)?)?;
    let file_path = pathname
        .parent()
        .map(Utf8Path::to_path_buf)
        .unwrap_or_else(|| app.topdir());
    let file_base = pathname.file_name().unwrap_or_default().to_string();

    let kind = if is_include {
        ConfigKind::Include
    } else {
        ConfigKind::Module
    };
    let mod_config = Config::with_kind(kind);
    mod_config.merge(caller);
    for (key, value) in overrides {
        mod_config.set(key, value);
    }

    if !is_include {
        // Tasks declared by the module resolve relative to its own file.
        mod_config.set("base_path", file_path.clone());
        mod_config.set("base_name", file_base.clone());
    }

    let namespace = load_module(app, &file_path, &file_base, &mod_config)?;

    // Module loaded; copy its public bindings into the config.
    for (key, value) in namespace.entries() {
        if key.starts_with('_') || key == "hancho" {
            continue;
        }
        mod_config.set(key, value);
    }

    Ok(mod_config)
}

/// Executes one description file with the directory stack pointing at its
/// directory. The stack is restored on every exit path.
pub(crate) fn load_module(
    app: &Rc<App>,
    file_path: &Utf8Path,
    file_name: &str,
    config: &Config,
) -> Result<Config, BuildError> {
    app.pushdir(file_path)?;
    let _guard = DirGuard { app };

    let pathname = file_path.join(file_name);
    debug!(path = %pathname, "loading description file");
    if app.flag("debug") || app.flag("verbose") {
        app.reporter().line(&format!("Loading module {pathname}"));
    }

    let meta = std::fs::metadata(&pathname).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            BuildError::PathMissing(pathname.clone())
        } else {
            BuildError::Io(err)
        }
    })?;
    app.record_module(pathname.clone(), meta.modified()?);

    let host = app
        .host()
        .ok_or_else(|| BuildError::NoHost(pathname.clone()))?;
    let scope = Scope::new(Rc::clone(app), config.clone());
    host.execute(&scope, &pathname).map_err(BuildError::Userland)
}

/// Loads the root description file named by the options.
pub(crate) fn load_root(app: &Rc<App>) -> Result<(), BuildError> {
    let root_path = app.root_path();
    let root_name = app
        .globals()
        .get("root_name")
        .map(|v| v.stringify())
        .unwrap_or_else(|| "build.hancho".to_string());

    let root_config = Config::new();
    root_config.set("base_path", root_path.clone());
    root_config.set("base_name", root_name.clone());

    load_module(app, &root_path, &root_name, &root_config)?;
    Ok(())
}

/// Derives a repo config: `repo_path`/`repo_name` point at the
/// subdirectory and `base_path` is rebased onto it.
pub fn repo<'a>(
    app: &Rc<App>,
    caller: &Config,
    repo_path: &str,
    overrides: impl IntoIterator<Item = (&'a str, Value)>,
) -> Result<Config, BuildError> {
    let repo_path = expand(app, caller, &Value::from(repo_path))?.stringify();
    let base_path = caller
        .get("base_path")
        .ok_or_else(|| BuildError::UnknownField("base_path".to_string()))?;

    let joined = paths::join_path(&[base_path, Value::from(repo_path)])?;
    let abs_repo: Utf8PathBuf = one_path(paths::abs_path(&app.topdir(), &joined, false)?)?;
    let repo_name = abs_repo.file_name().unwrap_or_default().to_string();

    let config = Config::with_kind(ConfigKind::Repo);
    config.merge(caller);
    for (key, value) in overrides {
        config.set(key, value);
    }
    config.set("repo_path", abs_repo.clone());
    config.set("repo_name", repo_name);
    config.set("base_path", abs_repo);
    config.set("base_name", "");

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_file(dir: &std::path::Path, name: &str, contents: &str) -> Utf8PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        Utf8PathBuf::from_path_buf(path).unwrap()
    }

    #[test]
    fn registry_dispatches_by_file_name() {
        let temp = tempfile::tempdir().unwrap();
        write_file(temp.path(), "build.hancho", "");

        let app = App::for_testing();
        let registry = HostRegistry::new();
        registry.register("build.hancho", |hancho| {
            hancho.set("greeting", "hi");
            Ok(Config::new())
        });
        app.set_host(Rc::new(registry));

        let config = Config::new();
        config.set("base_path", temp.path().to_str().unwrap());
        config.set("base_name", "build.hancho");

        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        load_module(&app, &dir, "build.hancho", &config).unwrap();
        assert_eq!(config.get("greeting"), Some(Value::from("hi")));
        assert_eq!(app.loaded_modules().len(), 1);
    }

    #[test]
    fn missing_description_file_is_strict() {
        let temp = tempfile::tempdir().unwrap();
        let app = App::for_testing();
        app.set_host(Rc::new(HostRegistry::new()));

        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let before = app.topdir();
        let err = load_module(&app, &dir, "nope.hancho", &Config::new()).unwrap_err();
        assert!(matches!(err, BuildError::PathMissing(_)));
        // The directory stack unwinds on the error path.
        assert_eq!(app.topdir(), before);
    }

    #[test]
    fn load_copies_public_bindings_only() {
        let temp = tempfile::tempdir().unwrap();
        write_file(temp.path(), "rules.hancho", "");

        let app = App::for_testing();
        let registry = HostRegistry::new();
        registry.register("rules.hancho", |_| {
            let namespace = Config::new();
            namespace.set("cc_flags", "-O2");
            namespace.set("_private", "hidden");
            namespace.set("hancho", "shadow");
            Ok(namespace)
        });
        app.set_host(Rc::new(registry));

        let caller = Config::new();
        caller.set("base_path", temp.path().to_str().unwrap());
        caller.set("base_name", "build.hancho");

        let module = load(&app, &caller, "rules.hancho", false, []).unwrap();
        assert_eq!(module.get("cc_flags"), Some(Value::from("-O2")));
        assert!(module.get("_private").is_none());
        assert_ne!(module.get("hancho"), Some(Value::from("shadow")));
        assert_eq!(module.kind(), ConfigKind::Module);
    }

    #[test]
    fn include_keeps_the_callers_base_path() {
        let temp = tempfile::tempdir().unwrap();
        let sub = temp.path().join("sub");
        fs::create_dir(&sub).unwrap();
        write_file(&sub, "common.hancho", "");

        let app = App::for_testing();
        let registry = HostRegistry::new();
        registry.register("common.hancho", |_| Ok(Config::new()));
        app.set_host(Rc::new(registry));

        let caller_base = temp.path().to_str().unwrap().to_string();
        let caller = Config::new();
        caller.set("base_path", caller_base.as_str());
        caller.set("base_name", "build.hancho");

        let included = load(&app, &caller, "sub/common.hancho", true, []).unwrap();
        assert_eq!(included.get("base_path"), Some(Value::from(caller_base.as_str())));
        assert_eq!(included.get("base_name"), Some(Value::from("build.hancho")));

        let module = load(&app, &caller, "sub/common.hancho", false, []).unwrap();
        let module_base = module.get("base_path").unwrap().stringify();
        assert!(module_base.ends_with("/sub"));
        assert_eq!(module.get("base_name"), Some(Value::from("common.hancho")));
    }

    #[test]
    fn repo_rebases_paths() {
        let app = App::for_testing();
        let caller = Config::new();
        caller.set("base_path", "/work/project");

        let repo = repo(&app, &caller, "third_party/fmt", []).unwrap();
        assert_eq!(repo.kind(), ConfigKind::Repo);
        assert_eq!(
            repo.get("repo_path"),
            Some(Value::from("/work/project/third_party/fmt"))
        );
        assert_eq!(repo.get("repo_name"), Some(Value::from("fmt")));
        assert_eq!(
            repo.get("base_path"),
            Some(Value::from("/work/project/third_party/fmt"))
        );
        assert_eq!(repo.get("base_name"), Some(Value::from("")));
    }
}
