//! Tests for kernel path resolution.

use super::*;
use crate::prompt::MockPrompter;
use crate::test_utils::{utf8_temp_dir, write_file};
use rstest::rstest;

const KERNEL: &str = "6.8.0-generic";

fn make_source_tree(root: &Utf8Path, relative: &str) -> Utf8PathBuf {
    write_file(root, &format!("{relative}/{KERNEL_HEADER}"), "");
    root.join(relative)
}

#[rstest]
#[case::source_link("lib/modules/6.8.0-generic/source")]
#[case::build_source("lib/modules/6.8.0-generic/build/source")]
#[case::build("lib/modules/6.8.0-generic/build")]
#[case::versioned_usr_src("usr/src/linux-6.8.0-generic")]
#[case::usr_src("usr/src/linux")]
fn finds_each_conventional_location(#[case] relative: &str) {
    let (_temp, dir) = utf8_temp_dir();
    let expected = make_source_tree(&dir, relative);
    let root = SystemRoot::new(dir);
    let env = Environment::default();

    let found = PathResolver::new(&root, &env, KERNEL)
        .resolve_source(None, None)
        .expect("source found");

    assert_eq!(found, expected);
}

#[test]
fn earlier_convention_wins() {
    let (_temp, dir) = utf8_temp_dir();
    let expected = make_source_tree(&dir, "lib/modules/6.8.0-generic/build");
    make_source_tree(&dir, "usr/src/linux");
    let root = SystemRoot::new(dir);
    let env = Environment::default();

    let found = PathResolver::new(&root, &env, KERNEL)
        .resolve_source(None, None)
        .expect("source found");

    assert_eq!(found, expected);
}

#[test]
fn invalid_explicit_path_never_falls_back() {
    let (_temp, dir) = utf8_temp_dir();
    make_source_tree(&dir, "usr/src/linux");
    let explicit = dir.join("elsewhere");
    std::fs::create_dir_all(&explicit).expect("mkdir");
    let root = SystemRoot::new(dir);
    let env = Environment::default();

    let err = PathResolver::new(&root, &env, KERNEL)
        .resolve_source(Some(&explicit), None)
        .expect_err("explicit path lacks header");

    assert!(
        matches!(err, InstallerError::KernelHeaderMissing { ref path, header } if *path == explicit && header == KERNEL_HEADER),
        "unexpected error: {err}"
    );
}

#[test]
fn invalid_environment_override_never_falls_back() {
    let (_temp, dir) = utf8_temp_dir();
    make_source_tree(&dir, "usr/src/linux");
    let root = SystemRoot::new(dir.clone());
    let env = Environment {
        sys_src: Some(dir.join("missing")),
        ..Environment::default()
    };

    let err = PathResolver::new(&root, &env, KERNEL)
        .resolve_source(None, None)
        .expect_err("missing override");

    assert!(matches!(err, InstallerError::KernelPathMissing { what: "source", .. }));
}

#[test]
fn include_path_is_trimmed_to_parent() {
    let (_temp, dir) = utf8_temp_dir();
    let source = make_source_tree(&dir, "opt/kernel");
    let root = SystemRoot::new(dir);
    let env = Environment::default();

    let found = PathResolver::new(&root, &env, KERNEL)
        .resolve_source(None, Some(&source.join("include")))
        .expect("parent of include path");

    assert_eq!(found, source);
}

#[test]
fn explicit_path_takes_precedence_over_environment() {
    let (_temp, dir) = utf8_temp_dir();
    let explicit = make_source_tree(&dir, "explicit");
    let from_env = make_source_tree(&dir, "from-env");
    let root = SystemRoot::new(dir);
    let env = Environment {
        sys_src: Some(from_env),
        ..Environment::default()
    };

    let found = PathResolver::new(&root, &env, KERNEL)
        .resolve_source(Some(&explicit), None)
        .expect("explicit path");

    assert_eq!(found, explicit);
}

#[test]
fn not_found_without_prompter() {
    let (_temp, dir) = utf8_temp_dir();
    let root = SystemRoot::new(dir);
    let env = Environment::default();

    let err = PathResolver::new(&root, &env, KERNEL)
        .resolve_source(None, None)
        .expect_err("nothing to find");

    assert!(matches!(err, InstallerError::KernelSourceNotFound { ref kernel } if kernel == KERNEL));
}

#[test]
fn prompt_retries_until_valid_answer() {
    let (_temp, dir) = utf8_temp_dir();
    let source = make_source_tree(&dir, "custom");
    let bad = dir.join("bad").to_string();
    let good = source.to_string();
    let root = SystemRoot::new(dir);
    let env = Environment::default();

    let mut prompter = MockPrompter::new();
    let mut answers = vec![bad, good].into_iter();
    prompter
        .expect_ask_path()
        .times(2)
        .returning(move |_| answers.next());

    let found = PathResolver::new(&root, &env, KERNEL)
        .interactive(&prompter)
        .resolve_source(None, None)
        .expect("second answer valid");

    assert_eq!(found, source);
}

#[test]
fn prompt_gives_up_after_attempt_limit() {
    let (_temp, dir) = utf8_temp_dir();
    let bad = dir.join("bad").to_string();
    let root = SystemRoot::new(dir);
    let env = Environment::default();

    let mut prompter = MockPrompter::new();
    prompter
        .expect_ask_path()
        .times(3)
        .returning(move |_| Some(bad.clone()));

    let err = PathResolver::new(&root, &env, KERNEL)
        .interactive(&prompter)
        .resolve_source(None, None)
        .expect_err("all answers invalid");

    assert!(matches!(err, InstallerError::PromptAttemptsExhausted { attempts: 3 }));
}

#[test]
fn output_follows_build_directory_for_module_source_link() {
    let (_temp, dir) = utf8_temp_dir();
    let source = make_source_tree(&dir, "lib/modules/6.8.0-generic/source");
    std::fs::create_dir_all(dir.join("lib/modules/6.8.0-generic/build")).expect("mkdir");
    let root = SystemRoot::new(dir.clone());
    let env = Environment::default();

    let paths = PathResolver::new(&root, &env, KERNEL)
        .resolve(PathOverrides {
            source: None,
            include: None,
            output: None,
        })
        .expect("paths");

    assert_eq!(paths.source, source);
    assert_eq!(paths.output, dir.join("lib/modules/6.8.0-generic/build"));
}

#[test]
fn output_defaults_to_source() {
    let (_temp, dir) = utf8_temp_dir();
    let source = make_source_tree(&dir, "usr/src/linux");
    let root = SystemRoot::new(dir);
    let env = Environment::default();

    let output = PathResolver::new(&root, &env, KERNEL)
        .resolve_output(&source, None)
        .expect("output");

    assert_eq!(output, source);
}

#[test]
fn missing_explicit_output_is_an_error() {
    let (_temp, dir) = utf8_temp_dir();
    let source = make_source_tree(&dir, "usr/src/linux");
    let root = SystemRoot::new(dir.clone());
    let env = Environment {
        sys_out: Some(dir.join("no-such-output")),
        ..Environment::default()
    };

    let err = PathResolver::new(&root, &env, KERNEL)
        .resolve_output(&source, None)
        .expect_err("missing output");

    assert!(matches!(err, InstallerError::KernelPathMissing { what: "output", .. }));
}
