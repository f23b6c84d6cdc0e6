//! Best-effort build progress estimation.
//!
//! Before a full build the runner asks the module makefile how many objects,
//! links and modules it expects to produce. The counts become an ordered
//! [`ProgressPlan`] of `(expected line count, line prefix)` stages that a
//! [`ProgressTracker`] matches against build output. The estimate only
//! drives a progress indicator; a bad estimate never affects the build.

/// Expected counts reported by the counting pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildCounts {
    /// Number of objects compiled.
    pub objects: usize,
    /// Number of link steps.
    pub links: usize,
    /// Number of final modules produced.
    pub modules: usize,
}

impl Default for BuildCounts {
    /// Conservative defaults used when the counting pass fails.
    fn default() -> Self {
        Self {
            objects: 400,
            links: 8,
            modules: 4,
        }
    }
}

/// Parse the counting pass output.
///
/// The makefile prints `objects=N`, `links=N` and `modules=N` lines; any
/// other output is ignored. Returns `None` unless all three are present.
#[must_use]
pub fn parse_counts(output: &str) -> Option<BuildCounts> {
    let mut objects = None;
    let mut links = None;
    let mut modules = None;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let Ok(count) = value.trim().parse::<usize>() else {
            continue;
        };
        match key.trim() {
            "objects" => objects = Some(count),
            "links" => links = Some(count),
            "modules" => modules = Some(count),
            _ => {}
        }
    }

    Some(BuildCounts {
        objects: objects?,
        links: links?,
        modules: modules?,
    })
}

/// One stage of the progress plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressStage {
    /// Number of output lines expected for the stage.
    pub expected_lines: usize,
    /// Prefix identifying the stage's output lines.
    pub prefix: &'static str,
}

/// Ordered list of stages expected in a build's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressPlan {
    stages: Vec<ProgressStage>,
}

impl ProgressPlan {
    /// Derive the plan from counting pass results.
    #[must_use]
    pub fn from_counts(counts: BuildCounts) -> Self {
        Self {
            stages: vec![
                ProgressStage {
                    expected_lines: counts.objects,
                    prefix: "  CC",
                },
                ProgressStage {
                    expected_lines: counts.modules,
                    prefix: "  MODPOST",
                },
                ProgressStage {
                    expected_lines: counts.links,
                    prefix: "  LD",
                },
            ],
        }
    }

    /// Return the stages in order.
    #[must_use]
    pub fn stages(&self) -> &[ProgressStage] {
        &self.stages
    }

    /// Return the total number of expected lines.
    #[must_use]
    pub fn total_lines(&self) -> usize {
        self.stages.iter().map(|s| s.expected_lines).sum()
    }
}

impl Default for ProgressPlan {
    fn default() -> Self {
        Self::from_counts(BuildCounts::default())
    }
}

/// Receives progress updates.
pub trait ProgressSink {
    /// Report `percent` (0..=100) completion of the step named `label`.
    fn update(&mut self, label: &str, percent: u8);
}

/// A sink that discards progress.
#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&mut self, _label: &str, _percent: u8) {}
}

/// Matches build output lines against a plan.
#[derive(Debug)]
pub struct ProgressTracker<'p> {
    plan: &'p ProgressPlan,
    stage: usize,
    seen_in_stage: usize,
    seen_before_stage: usize,
}

impl<'p> ProgressTracker<'p> {
    /// Start tracking against `plan`.
    #[must_use]
    pub fn new(plan: &'p ProgressPlan) -> Self {
        Self {
            plan,
            stage: 0,
            seen_in_stage: 0,
            seen_before_stage: 0,
        }
    }

    /// Observe one output line; returns the new percentage when it changed.
    ///
    /// A line matching a later stage's prefix advances the tracker to that
    /// stage, crediting the earlier stages in full. Completion is capped at
    /// 99% until [`ProgressTracker::finish`] is called.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let before = self.percent();
        let stages = self.plan.stages();
        let matched = stages
            .iter()
            .enumerate()
            .skip(self.stage)
            .find(|(_, stage)| line.starts_with(stage.prefix))
            .map(|(index, _)| index)?;

        if matched > self.stage {
            self.seen_before_stage = stages
                .iter()
                .take(matched)
                .map(|s| s.expected_lines)
                .sum();
            self.stage = matched;
            self.seen_in_stage = 0;
        }
        self.seen_in_stage += 1;

        let after = self.percent();
        (after != before).then_some(after)
    }

    /// Return the current completion estimate.
    #[must_use]
    pub fn percent(&self) -> u8 {
        let total = self.plan.total_lines();
        if total == 0 {
            return 0;
        }
        let expected_here = self
            .plan
            .stages()
            .get(self.stage)
            .map_or(0, |s| s.expected_lines);
        let seen = self.seen_before_stage + self.seen_in_stage.min(expected_here);
        let percent = (seen.saturating_mul(100) / total).min(99);
        u8::try_from(percent).unwrap_or(99)
    }

    /// Mark the build as finished.
    #[must_use]
    pub fn finish(&self) -> u8 {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_complete_counts() {
        let counts = parse_counts("make: entering\nobjects=20\nlinks=2\nmodules=2\n")
            .expect("counts present");
        assert_eq!(
            counts,
            BuildCounts {
                objects: 20,
                links: 2,
                modules: 2
            }
        );
    }

    #[rstest]
    #[case::missing_links("objects=20\nmodules=2\n")]
    #[case::garbage("objects=many\nlinks=2\nmodules=2\n")]
    #[case::empty("")]
    fn incomplete_counts_are_rejected(#[case] output: &str) {
        assert_eq!(parse_counts(output), None);
    }

    #[test]
    fn tracker_advances_through_stages() {
        let plan = ProgressPlan::from_counts(BuildCounts {
            objects: 2,
            links: 1,
            modules: 1,
        });
        let mut tracker = ProgressTracker::new(&plan);

        assert_eq!(tracker.observe("  CC [M]  a.o"), Some(25));
        assert_eq!(tracker.observe("make[2]: nothing"), None);
        assert_eq!(tracker.observe("  CC [M]  b.o"), Some(50));
        assert_eq!(tracker.observe("  MODPOST Module.symvers"), Some(75));
        assert_eq!(tracker.observe("  LD [M]  core.ko"), Some(99));
        assert_eq!(tracker.finish(), 100);
    }

    #[test]
    fn tracker_never_moves_backwards_to_earlier_stage() {
        let plan = ProgressPlan::from_counts(BuildCounts {
            objects: 1,
            links: 1,
            modules: 1,
        });
        let mut tracker = ProgressTracker::new(&plan);
        tracker.observe("  LD [M]  core.ko");
        let after_link = tracker.percent();
        // Object lines after the link stage belong to an earlier stage.
        assert_eq!(tracker.observe("  CC [M]  core.mod.o"), None);
        assert_eq!(tracker.percent(), after_link);
    }

    #[test]
    fn overrun_stage_is_capped() {
        let plan = ProgressPlan::from_counts(BuildCounts {
            objects: 1,
            links: 0,
            modules: 0,
        });
        let mut tracker = ProgressTracker::new(&plan);
        tracker.observe("  CC a.o");
        tracker.observe("  CC b.o");
        assert_eq!(tracker.percent(), 99);
    }
}
