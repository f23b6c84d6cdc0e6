//! Behaviour-driven tests for precompiled bundle search.
//!
//! Bundles are written to temporary directories laid out like an operator
//! directory, a distribution root, and a package directory.

use camino::Utf8PathBuf;
use kmodsmith_installer::artefact::matcher::{
    FoundBundle, MatchCriteria, PACKAGE_DIR, RootOrigin, SearchRoots, find_match,
};
use kmodsmith_installer::artefact::precompiled::PrecompiledArtefact;
use kmodsmith_installer::kernel::SystemRoot;
use kmodsmith_installer::module_spec::KernelModuleSpec;
use kmodsmith_installer::test_utils::{utf8_temp_dir, write_bundle};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use tempfile::TempDir;

const PROC_VERSION: &str = "Linux version 6.8.0-31-generic (buildd@lcy02-amd64-080)";
const DRIVER_VERSION: &str = "2.0";
const RELEASE: &str = "6.8.0-31-generic";

// ---------------------------------------------------------------------------
// Search world
// ---------------------------------------------------------------------------

struct SearchWorld {
    _temp: TempDir,
    root: Utf8PathBuf,
    system_root: Utf8PathBuf,
    package_dir: Utf8PathBuf,
    operator_dir: Option<Utf8PathBuf>,
    found: Option<FoundBundle>,
}

#[fixture]
fn search_world() -> SearchWorld {
    let (temp, root) = utf8_temp_dir();
    SearchWorld {
        _temp: temp,
        system_root: root.join("sysroot"),
        package_dir: root.join("package"),
        root,
        operator_dir: None,
        found: None,
    }
}

fn core_artefacts() -> Vec<PrecompiledArtefact> {
    vec![PrecompiledArtefact::for_module(
        &KernelModuleSpec::new("core", "core.ko"),
        "kernel",
    )]
}

// ---------------------------------------------------------------------------
// Step definitions
// ---------------------------------------------------------------------------

#[given("a package that ships a bundle for the running kernel")]
fn given_package_bundle(search_world: &mut SearchWorld) {
    let dir = search_world.package_dir.join(PACKAGE_DIR);
    std::fs::create_dir_all(&dir).expect("create package bundle dir");
    write_bundle(&dir, "acme.tar.zst", PROC_VERSION, DRIVER_VERSION, core_artefacts());
}

#[given("a package that ships a bundle for driver version \"{version}\"")]
fn given_package_bundle_version(search_world: &mut SearchWorld, version: String) {
    let dir = search_world.package_dir.join(PACKAGE_DIR);
    std::fs::create_dir_all(&dir).expect("create package bundle dir");
    write_bundle(&dir, "acme.tar.zst", PROC_VERSION, &version, core_artefacts());
}

#[given("the operator supplies a bundle for the running kernel")]
fn given_operator_bundle(search_world: &mut SearchWorld) {
    let dir = search_world.root.join("operator");
    std::fs::create_dir_all(&dir).expect("create operator dir");
    write_bundle(&dir, "acme.tar.zst", PROC_VERSION, DRIVER_VERSION, core_artefacts());
    search_world.operator_dir = Some(dir);
}

#[when("precompiled bundles are searched")]
fn when_searched(search_world: &mut SearchWorld) {
    let roots = SearchRoots::standard(
        search_world.operator_dir.as_deref(),
        &SystemRoot::new(search_world.system_root.clone()),
        RELEASE,
        &search_world.package_dir,
    );
    let expected = vec!["core.ko".to_owned()];
    search_world.found = find_match(
        &roots,
        &MatchCriteria {
            proc_version: PROC_VERSION,
            driver_version: DRIVER_VERSION,
            expected_filenames: &expected,
        },
    );
}

#[then("the package bundle is selected")]
fn then_package_selected(search_world: &mut SearchWorld) {
    let found = search_world.found.as_ref().expect("no bundle selected");
    assert_eq!(found.origin, RootOrigin::Package);
}

#[then("the operator bundle is selected")]
fn then_operator_selected(search_world: &mut SearchWorld) {
    let found = search_world.found.as_ref().expect("no bundle selected");
    assert_eq!(found.origin, RootOrigin::Operator);
}

#[then("no bundle is selected")]
fn then_none_selected(search_world: &mut SearchWorld) {
    assert!(search_world.found.is_none());
}

// ---------------------------------------------------------------------------
// Scenario bindings
// ---------------------------------------------------------------------------

#[scenario(
    path = "tests/features/precompiled.feature",
    name = "A bundle shipped with the package matches the running kernel"
)]
fn scenario_package_bundle(search_world: SearchWorld) {
    let _ = search_world;
}

#[scenario(
    path = "tests/features/precompiled.feature",
    name = "An operator bundle wins over the package bundle"
)]
fn scenario_operator_bundle(search_world: SearchWorld) {
    let _ = search_world;
}

#[scenario(
    path = "tests/features/precompiled.feature",
    name = "A bundle for another driver version is ignored"
)]
fn scenario_other_driver_version(search_world: SearchWorld) {
    let _ = search_world;
}
