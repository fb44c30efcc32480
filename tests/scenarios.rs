//! End-to-end builds driven through a `HostRegistry` description host,
//! each inside its own temp directory.

use std::fs;
use std::path::Path;
use std::rc::Rc;

use camino::Utf8PathBuf;
use hancho::{App, Callback, Config, HostRegistry, Options, Value};

fn utf8(path: &Path) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(path.to_path_buf()).unwrap()
}

fn build_app(root: &Path, configure: impl FnOnce(&mut Options)) -> Rc<App> {
    let mut options = Options::default();
    options.chdir = utf8(root);
    options.quiet = true;
    configure(&mut options);
    App::new(options).unwrap()
}

fn run(root: &Path, registry: &HostRegistry, configure: impl FnOnce(&mut Options)) -> (Rc<App>, i32) {
    let app = build_app(root, configure);
    let code = app.run(Rc::new(registry.clone()));
    (app, code)
}

#[test]
fn minimum_task_builds_skips_and_rebuilds() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "# copy a.txt\n").unwrap();
    fs::write(root.join("a.txt"), "hello\n").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        hancho.task([
            ("command", Value::from("cp {abs_source_files} {abs_build_files}")),
            ("source_files", Value::list(["a.txt"])),
            ("build_files", Value::list(["a.copy"])),
        ])?;
        Ok(Config::new())
    });

    // First run copies the file.
    let (app, code) = run(root, &registry, |_| {});
    assert_eq!(code, 0);
    assert_eq!(app.tasks_pass(), 1);
    let copy = root.join("build").join("a.copy");
    assert_eq!(fs::read_to_string(&copy).unwrap(), "hello\n");

    // Second run has nothing to do.
    let (app, code) = run(root, &registry, |_| {});
    assert_eq!(code, 0);
    assert_eq!(app.tasks_pass(), 0);
    assert_eq!(app.tasks_skip(), 1);

    // Touching the input forces the third run to rebuild.
    fs::write(root.join("a.txt"), "hello again\n").unwrap();
    let (app, code) = run(root, &registry, |_| {});
    assert_eq!(code, 0);
    assert_eq!(app.tasks_pass(), 1);
    assert_eq!(fs::read_to_string(&copy).unwrap(), "hello again\n");
}

#[test]
fn force_flag_rebuilds_up_to_date_outputs() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();
    fs::write(root.join("in.txt"), "data").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        hancho.task([
            ("command", Value::from("cp {abs_source_files} {abs_build_files}")),
            ("source_files", Value::list(["in.txt"])),
            ("build_files", Value::list(["out.txt"])),
        ])?;
        Ok(Config::new())
    });

    let (app, code) = run(root, &registry, |_| {});
    assert_eq!((code, app.tasks_pass()), (0, 1));

    let (app, code) = run(root, &registry, |_| {});
    assert_eq!((code, app.tasks_skip()), (0, 1));

    let (app, code) = run(root, &registry, |options| options.force = true);
    assert_eq!((code, app.tasks_pass()), (0, 1));
}

#[test]
fn dependency_chain_orders_under_shuffle() {
    // A consumer embedding the producer's task handle must always run
    // after it, no matter how the pending queue is permuted.
    for _ in 0..5 {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::write(root.join("build.hancho"), "").unwrap();

        let registry = HostRegistry::new();
        registry.register("build.hancho", |hancho| {
            let first = hancho.task([
                ("command", Value::from("printf step1 > {abs_build_files}")),
                ("build_files", Value::list(["step1.out"])),
            ])?;
            hancho.task([
                ("command", Value::from("cp {abs_source_files} {abs_build_files}")),
                ("source_files", Value::List(vec![Value::Task(first)])),
                ("build_files", Value::list(["step2.out"])),
            ])?;
            Ok(Config::new())
        });

        let (app, code) = run(root, &registry, |options| {
            options.shuffle = true;
            options.jobs = 1;
        });
        assert_eq!(code, 0);
        assert_eq!(app.tasks_pass(), 2);
        let step2 = root.join("build").join("step2.out");
        assert_eq!(fs::read_to_string(step2).unwrap(), "step1");
    }
}

#[test]
fn expansion_cycle_fails_the_task_not_the_build_loop() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        hancho.task([
            ("command", Value::from("true")),
            ("desc", Value::from("{loop_a}")),
            ("loop_a", Value::from("{loop_b}")),
            ("loop_b", Value::from("{loop_a}")),
        ])?;
        hancho.task([
            ("command", Value::from("true")),
            ("desc", Value::from("fine")),
        ])?;
        Ok(Config::new())
    });

    let (app, code) = run(root, &registry, |_| {});
    assert_eq!(code, -1);
    assert_eq!(app.tasks_fail(), 1);
    // The healthy task still runs.
    assert_eq!(app.tasks_pass(), 1);
}

#[test]
fn gcc_depfile_extends_the_staleness_check() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();
    fs::write(root.join("src.c"), "int main() {}\n").unwrap();
    fs::write(root.join("hdr.h"), "#pragma once\n").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        hancho.task([
            ("command", Value::from("cp {abs_source_files} {abs_build_files}")),
            ("source_files", Value::list(["src.c"])),
            ("build_files", Value::list(["out.o"])),
            ("build_deps", Value::list(["out.d"])),
        ])?;
        Ok(Config::new())
    });

    // First build; the depfile appears afterwards, as a compiler would
    // emit it. Entries are relative to the command path.
    let (app, code) = run(root, &registry, |_| {});
    assert_eq!((code, app.tasks_pass()), (0, 1));
    fs::write(root.join("build").join("out.d"), "out.o: hdr.h src.c\n").unwrap();

    // Unchanged sources: no rebuild.
    let (app, code) = run(root, &registry, |_| {});
    assert_eq!((code, app.tasks_skip()), (0, 1));

    // Touching a header listed only in the depfile triggers a rebuild.
    fs::write(root.join("hdr.h"), "#pragma once // v2\n").unwrap();
    let (app, code) = run(root, &registry, |_| {});
    assert_eq!((code, app.tasks_pass()), (0, 1));
}

#[test]
fn duplicate_outputs_fail_the_loser() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        hancho.task([
            ("command", Value::from("printf one > {abs_build_files}")),
            ("build_files", Value::list(["dup.out"])),
        ])?;
        hancho.task([
            ("command", Value::from("printf two > {abs_build_files}")),
            ("build_files", Value::list(["dup.out"])),
        ])?;
        Ok(Config::new())
    });

    // Loading succeeds; the build fails when the second task to reach
    // task_init tries to claim the already-registered output, before it
    // runs anything. The winner's output is intact.
    let (app, code) = run(root, &registry, |_| {});
    assert_eq!(code, -1);
    assert_eq!(app.tasks_fail(), 1);
    assert_eq!(app.tasks_pass(), 1);
    let dup = root.join("build").join("dup.out");
    let contents = fs::read_to_string(dup).unwrap();
    assert!(contents == "one" || contents == "two", "got {contents:?}");
}

#[test]
fn cancellation_fans_out_without_multiplying_failures() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        let failing = hancho.task([
            ("command", Value::from("false")),
            ("build_files", Value::list(["never.out"])),
        ])?;
        for name in ["a.out", "b.out", "c.out"] {
            hancho.task([
                ("command", Value::from("cp {abs_source_files} {abs_build_files}")),
                (
                    "source_files",
                    Value::List(vec![Value::Task(failing.clone())]),
                ),
                ("build_files", Value::list([name])),
            ])?;
        }
        Ok(Config::new())
    });

    let (app, code) = run(root, &registry, |_| {});
    assert_eq!(code, -1);
    assert_eq!(app.tasks_fail(), 1);
    assert_eq!(app.tasks_cancel(), 3);
    assert_eq!(app.tasks_pass(), 0);
}

#[test]
fn cancellation_propagates_through_nesting() {
    // The failing producer is buried inside a nested list inside a nested
    // config; the consumer still resolves to cancelled.
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        let failing = hancho.task([("command", Value::from("false"))])?;
        let nested = Config::new();
        nested.set(
            "deep",
            Value::List(vec![Value::List(vec![Value::Task(failing)])]),
        );
        hancho.task([
            ("command", Value::from("true")),
            ("extra", Value::Config(nested)),
        ])?;
        Ok(Config::new())
    });

    let (app, code) = run(root, &registry, |_| {});
    assert_eq!(code, -1);
    assert_eq!(app.tasks_fail(), 1);
    assert_eq!(app.tasks_cancel(), 1);
}

#[test]
fn build_paths_outside_the_root_are_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();
    let elsewhere = tempfile::tempdir().unwrap();
    let elsewhere = elsewhere.path().to_str().unwrap().to_string();

    let registry = HostRegistry::new();
    registry.register("build.hancho", move |hancho| {
        hancho.task([
            ("command", Value::from("printf x > {abs_build_files}")),
            ("build_path", Value::from(elsewhere.as_str())),
            ("build_files", Value::list(["escape.out"])),
        ])?;
        Ok(Config::new())
    });

    let (app, code) = run(root, &registry, |_| {});
    assert_eq!(code, -1);
    assert_eq!(app.tasks_fail(), 1);
}

#[test]
fn job_overflow_is_a_task_failure() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        hancho.task([
            ("command", Value::from("true")),
            ("job_count", Value::from(3)),
        ])?;
        Ok(Config::new())
    });

    let (app, code) = run(root, &registry, |options| options.jobs = 2);
    assert_eq!(code, -1);
    assert_eq!(app.tasks_fail(), 1);
}

#[test]
fn dry_run_spawns_nothing() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();
    fs::write(root.join("in.txt"), "data").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        hancho.task([
            ("command", Value::from("cp {abs_source_files} {abs_build_files}")),
            ("source_files", Value::list(["in.txt"])),
            ("build_files", Value::list(["out.txt"])),
        ])?;
        Ok(Config::new())
    });

    let (app, code) = run(root, &registry, |options| options.dry_run = true);
    assert_eq!(code, 0);
    assert_eq!(app.tasks_pass(), 1);
    assert!(!root.join("build").join("out.txt").exists());
}

#[test]
fn editing_the_description_file_forces_rebuilds() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "# v1\n").unwrap();
    fs::write(root.join("in.txt"), "data").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        hancho.task([
            ("command", Value::from("cp {abs_source_files} {abs_build_files}")),
            ("source_files", Value::list(["in.txt"])),
            ("build_files", Value::list(["out.txt"])),
        ])?;
        Ok(Config::new())
    });

    let (app, code) = run(root, &registry, |_| {});
    assert_eq!((code, app.tasks_pass()), (0, 1));

    let (app, _) = run(root, &registry, |_| {});
    assert_eq!(app.tasks_skip(), 1);

    // A newer description file invalidates outputs built before the edit.
    fs::write(root.join("build.hancho"), "# v2\n").unwrap();
    let (app, code) = run(root, &registry, |_| {});
    assert_eq!((code, app.tasks_pass()), (0, 1));
}

#[test]
fn callback_commands_receive_the_task() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        let callback = Callback::new(|task| {
            let action = task.action().expect("runs after task_init");
            for path in &action.abs_build_files {
                std::fs::write(path, "from callback")?;
            }
            Ok(Value::List(
                action
                    .abs_build_files
                    .iter()
                    .map(|p| Value::from(p.clone()))
                    .collect(),
            ))
        });
        hancho.task([
            ("command", Value::Callback(callback)),
            ("build_files", Value::list(["gen.txt"])),
        ])?;
        Ok(Config::new())
    });

    let (app, code) = run(root, &registry, |_| {});
    assert_eq!(code, 0);
    assert_eq!(app.tasks_pass(), 1);
    let r#gen = root.join("build").join("gen.txt");
    assert_eq!(fs::read_to_string(r#gen).unwrap(), "from callback");
}

#[test]
fn command_configs_drive_repeated_invocations() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();
    fs::write(root.join("one.txt"), "1").unwrap();
    fs::write(root.join("two.txt"), "2").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        let copy = hancho.command("cp {abs_source_files} {abs_build_files}", []);
        for name in ["one", "two"] {
            copy.invoke(
                hancho.app(),
                Value::list([format!("{name}.txt")]),
                Value::list([format!("{name}.copy")]),
                [],
            )?;
        }
        Ok(Config::new())
    });

    let (app, code) = run(root, &registry, |_| {});
    assert_eq!(code, 0);
    assert_eq!(app.tasks_pass(), 2);
    assert_eq!(
        fs::read_to_string(root.join("build").join("one.copy")).unwrap(),
        "1"
    );
    assert_eq!(
        fs::read_to_string(root.join("build").join("two.copy")).unwrap(),
        "2"
    );
}

#[test]
fn submodules_build_into_their_own_subtree() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();
    let sub = root.join("lib");
    fs::create_dir(&sub).unwrap();
    fs::write(sub.join("lib.hancho"), "").unwrap();
    fs::write(sub.join("lib.c"), "// lib").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        hancho.module("lib/lib.hancho", [])?;
        Ok(Config::new())
    });
    registry.register("lib.hancho", |hancho| {
        hancho.task([
            ("command", Value::from("cp {abs_source_files} {abs_build_files}")),
            ("source_files", Value::list(["lib.c"])),
            ("build_files", Value::list(["lib.copy"])),
        ])?;
        Ok(Config::new())
    });

    let (app, code) = run(root, &registry, |_| {});
    assert_eq!(code, 0);
    assert_eq!(app.tasks_pass(), 1);
    // Outputs land under the root build dir, mirroring the source layout.
    let copy = root.join("build").join("lib").join("lib.copy");
    assert!(copy.exists(), "expected {}", copy.display());
}

#[test]
fn unknown_flags_surface_in_templates() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path();
    fs::write(root.join("build.hancho"), "").unwrap();

    let registry = HostRegistry::new();
    registry.register("build.hancho", |hancho| {
        let expanded = hancho.expand(&Value::from("level={opt_level}"))?;
        assert_eq!(expanded, Value::from("level=2"));
        Ok(Config::new())
    });

    let mut options = Options::default();
    options.chdir = utf8(root);
    options.quiet = true;
    let app = App::with_flag_overrides(options, vec![("opt_level".into(), Value::from(2))]).unwrap();
    assert_eq!(app.run(Rc::new(registry)), 0);
}
