//! Precompiled bundle search.
//!
//! Search roots are scanned in trust order: the operator's path, then the
//! distribution's per-kernel directory, then the bundles shipped with the
//! package. The first bundle that matches wins and scanning stops.

use super::bundle::PrecompiledBundle;
use crate::kernel::SystemRoot;
use camino::{Utf8Path, Utf8PathBuf};
use std::fmt;

/// Distribution bundle directory, relative to the system root. Bundles for
/// each kernel live in a subdirectory named after its release.
pub const DISTRIBUTION_DIR: &str = "usr/lib/kmodsmith/precompiled";

/// Directory of bundles shipped inside the package.
pub const PACKAGE_DIR: &str = "precompiled";

/// Where a search root came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootOrigin {
    /// Specified by the operator.
    Operator,
    /// Provided by the distribution.
    Distribution,
    /// Shipped with the package.
    Package,
}

impl fmt::Display for RootOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Operator => "operator-specified",
            Self::Distribution => "distribution",
            Self::Package => "package",
        })
    }
}

/// One directory (or bundle file) to search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRoot {
    /// Origin of the root.
    pub origin: RootOrigin,
    /// Directory of bundles, or a single bundle file.
    pub path: Utf8PathBuf,
}

/// Search roots in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRoots(Vec<SearchRoot>);

impl SearchRoots {
    /// Build the standard roots for kernel `release`.
    #[must_use]
    pub fn standard(
        operator: Option<&Utf8Path>,
        system_root: &SystemRoot,
        release: &str,
        package_dir: &Utf8Path,
    ) -> Self {
        let mut roots = Vec::with_capacity(3);
        if let Some(path) = operator {
            roots.push(SearchRoot {
                origin: RootOrigin::Operator,
                path: path.to_owned(),
            });
        }
        roots.push(SearchRoot {
            origin: RootOrigin::Distribution,
            path: system_root.join(DISTRIBUTION_DIR).join(release),
        });
        roots.push(SearchRoot {
            origin: RootOrigin::Package,
            path: package_dir.join(PACKAGE_DIR),
        });
        Self(roots)
    }

    /// Use explicit roots in the given order.
    #[must_use]
    pub fn from_roots(roots: Vec<SearchRoot>) -> Self {
        Self(roots)
    }

    /// Iterate over the roots in priority order.
    pub fn iter(&self) -> impl Iterator<Item = &SearchRoot> {
        self.0.iter()
    }
}

/// What a bundle must satisfy to be used.
#[derive(Debug, Clone, Copy)]
pub struct MatchCriteria<'a> {
    /// Proc-version signature of the running kernel.
    pub proc_version: &'a str,
    /// Driver version of the package.
    pub driver_version: &'a str,
    /// Module file names the bundle must provide.
    pub expected_filenames: &'a [String],
}

/// A matching bundle and the root it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundBundle {
    /// Origin of the root holding the bundle.
    pub origin: RootOrigin,
    /// The bundle.
    pub bundle: PrecompiledBundle,
}

/// Return the first bundle matching `criteria`.
#[must_use]
pub fn find_match(roots: &SearchRoots, criteria: &MatchCriteria<'_>) -> Option<FoundBundle> {
    for root in roots.iter() {
        for candidate in candidates(&root.path) {
            let bundle = match PrecompiledBundle::open(&candidate) {
                Ok(bundle) => bundle,
                Err(err) => {
                    log::debug!("skipping {candidate}: {err}");
                    continue;
                }
            };
            if bundle.manifest().matches(
                criteria.proc_version,
                criteria.driver_version,
                criteria.expected_filenames,
            ) {
                log::info!(
                    "found matching {} precompiled bundle {candidate} ({})",
                    root.origin,
                    bundle.description()
                );
                return Some(FoundBundle {
                    origin: root.origin,
                    bundle,
                });
            }
            log::debug!("{candidate} does not match this kernel and driver version");
        }
    }
    None
}

/// List candidate bundle files under `path`, sorted by name.
fn candidates(path: &Utf8Path) -> Vec<Utf8PathBuf> {
    if path.is_file() {
        return vec![path.to_owned()];
    }
    let Ok(entries) = path.read_dir_utf8() else {
        return Vec::new();
    };
    let mut files: Vec<Utf8PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.into_path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artefact::kind::ArtefactKind;
    use crate::artefact::precompiled::PrecompiledArtefact;
    use crate::test_utils::{utf8_temp_dir, write_bundle, write_file};

    const SIGNATURE: &str = "Linux version 6.8.0-31-generic (buildd@lcy02) #31-Ubuntu SMP";
    const RELEASE: &str = "6.8.0-31-generic";

    fn core() -> Vec<PrecompiledArtefact> {
        vec![PrecompiledArtefact::new(
            ArtefactKind::Module,
            "core.ko",
            "core.ko",
            "kernel",
        )]
    }

    fn expected() -> Vec<String> {
        vec!["core.ko".to_owned()]
    }

    struct Layout {
        _temp: tempfile::TempDir,
        system_root: SystemRoot,
        operator: Utf8PathBuf,
        distribution: Utf8PathBuf,
        package: Utf8PathBuf,
    }

    fn layout() -> Layout {
        let (temp, dir) = utf8_temp_dir();
        let operator = dir.join("operator");
        let distribution = dir.join("root").join(DISTRIBUTION_DIR).join(RELEASE);
        let package = dir.join("package");
        for path in [&operator, &distribution, &package.join(PACKAGE_DIR)] {
            std::fs::create_dir_all(path).expect("mkdir");
        }
        Layout {
            _temp: temp,
            system_root: SystemRoot::new(dir.join("root")),
            operator,
            distribution,
            package,
        }
    }

    fn search(layout: &Layout, operator: bool) -> Option<FoundBundle> {
        let roots = SearchRoots::standard(
            operator.then_some(layout.operator.as_path()),
            &layout.system_root,
            RELEASE,
            &layout.package,
        );
        let expected = expected();
        find_match(
            &roots,
            &MatchCriteria {
                proc_version: SIGNATURE,
                driver_version: "2.0",
                expected_filenames: &expected,
            },
        )
    }

    #[test]
    fn operator_root_wins_over_distribution_and_package() {
        let layout = layout();
        let op = write_bundle(&layout.operator, "b.tar.zst", SIGNATURE, "2.0", core());
        write_bundle(&layout.distribution, "a.tar.zst", SIGNATURE, "2.0", core());
        write_bundle(&layout.package.join(PACKAGE_DIR), "a.tar.zst", SIGNATURE, "2.0", core());

        let found = search(&layout, true).expect("match");

        assert_eq!(found.origin, RootOrigin::Operator);
        assert_eq!(found.bundle.path(), op);
    }

    #[test]
    fn distribution_root_wins_over_package() {
        let layout = layout();
        write_bundle(&layout.distribution, "a.tar.zst", SIGNATURE, "2.0", core());
        write_bundle(&layout.package.join(PACKAGE_DIR), "a.tar.zst", SIGNATURE, "2.0", core());

        let found = search(&layout, true).expect("match");

        assert_eq!(found.origin, RootOrigin::Distribution);
    }

    #[test]
    fn package_root_is_used_when_others_are_empty() {
        let layout = layout();
        let shipped =
            write_bundle(&layout.package.join(PACKAGE_DIR), "a.tar.zst", SIGNATURE, "2.0", core());

        let found = search(&layout, false).expect("match");

        assert_eq!(found.origin, RootOrigin::Package);
        assert_eq!(found.bundle.path(), shipped);
    }

    #[test]
    fn non_matching_and_unreadable_candidates_are_skipped() {
        let layout = layout();
        write_file(&layout.operator, "0-garbage.tar.zst", b"not an archive");
        write_bundle(&layout.operator, "1-other.tar.zst", "Linux version 5.15", "2.0", core());
        let good = write_bundle(&layout.operator, "2-good.tar.zst", SIGNATURE, "2.0", core());

        let found = search(&layout, true).expect("match");

        assert_eq!(found.bundle.path(), good);
    }

    #[test]
    fn operator_root_may_name_a_single_bundle() {
        let layout = layout();
        let file = write_bundle(&layout.operator, "only.tar.zst", SIGNATURE, "2.0", core());
        let roots = SearchRoots::from_roots(vec![SearchRoot {
            origin: RootOrigin::Operator,
            path: file.clone(),
        }]);
        let expected = expected();

        let found = find_match(
            &roots,
            &MatchCriteria {
                proc_version: SIGNATURE,
                driver_version: "2.0",
                expected_filenames: &expected,
            },
        )
        .expect("match");

        assert_eq!(found.bundle.path(), file);
    }

    #[test]
    fn no_match_when_driver_version_differs() {
        let layout = layout();
        write_bundle(&layout.package.join(PACKAGE_DIR), "a.tar.zst", SIGNATURE, "1.9", core());

        assert_eq!(search(&layout, true), None);
    }
}
