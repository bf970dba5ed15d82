use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;

use crate::{
    domain::{Lots, PositionSide, Price},
    replay::EngineView,
};

/// Reserved annotation when no check passed.
pub const NO_CHECKS_TAG: &str = "NC";
/// Upper bound on the combined annotation string.
pub const MAX_ANNOTATION_LEN: usize = 48;

/// The heterogeneous signal payload a strategy hands to its validations:
/// the fields the engine interprets, plus an opaque byte payload the
/// strategy owns.
#[derive(Debug, Clone, Default)]
pub struct SignalData {
    pub price: Price,
    pub volume: Lots,
    pub side: Option<PositionSide>,
    pub candidate_sl: Option<Price>,
    pub candidate_tp: Option<Price>,
    pub tags: Vec<String>,
    pub payload: Vec<u8>,
}

/// Outcome of one named check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Whether the pipeline stops at the first failure or runs every check and
/// reports all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ValidationMode {
    /// Every check must pass; evaluation stops at the first failure.
    #[default]
    All,
    /// Run everything; the verdict still requires all to pass, but every
    /// failure is collected for the report.
    Collect,
}

/// Checks are pure functions of the signal and the read-only engine view.
pub type CheckFn = Arc<dyn Fn(&SignalData, &EngineView<'_>) -> Verdict + Send + Sync>;

struct Check {
    name: String,
    order: u32,
    tag: String,
    run: CheckFn,
}

/// Result of running a signal through the pipeline: the verdict, the compact
/// annotation, and the failures for diagnostics.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub passed: bool,
    /// Tags of passed checks joined with `+`, truncated to
    /// [`MAX_ANNOTATION_LEN`]; [`NO_CHECKS_TAG`] when nothing passed.
    pub annotation: String,
    pub failures: Vec<(String, String)>,
}

// ================================================================================================
// ValidationRegistry
// ================================================================================================

/// Declarative, ordered, named signal-validation pipeline shared by
/// strategies. Execution order follows the declared `order` key (cheap
/// checks first by convention), ties broken by registration sequence.
#[derive(Default)]
pub struct ValidationRegistry {
    checks: Vec<Check>,
    mode: ValidationMode,
}

impl ValidationRegistry {
    pub fn new(mode: ValidationMode) -> Self {
        Self {
            checks: Vec::new(),
            mode,
        }
    }

    /// Registers a named check. Called at strategy construction.
    pub fn register_validation(
        &mut self,
        name: impl Into<String>,
        order: u32,
        short_tag: impl Into<String>,
        check: CheckFn,
    ) {
        self.checks.push(Check {
            name: name.into(),
            order,
            tag: short_tag.into(),
            run: check,
        });
        // Stable sort keeps registration sequence for equal orders.
        self.checks.sort_by_key(|c| c.order);
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Runs the pipeline over one signal.
    pub fn run(&self, signal: &SignalData, view: &EngineView<'_>) -> ValidationReport {
        let mut failures = Vec::new();
        let mut passed_tags: SmallVec<[&str; 8]> = SmallVec::new();

        for check in &self.checks {
            match (check.run)(signal, view) {
                Verdict::Pass => passed_tags.push(&check.tag),
                Verdict::Fail(reason) => {
                    debug!(check = %check.name, %reason, "Validation failed");
                    failures.push((check.name.clone(), reason));
                    if self.mode == ValidationMode::All {
                        break;
                    }
                }
            }
        }

        ValidationReport {
            passed: failures.is_empty(),
            annotation: compact_annotation(&passed_tags),
            failures,
        }
    }
}

/// Joins tags with `+`, bounded, with the reserved no-checks fallback.
fn compact_annotation(tags: &[&str]) -> String {
    if tags.is_empty() {
        return NO_CHECKS_TAG.to_string();
    }
    let mut out = String::new();
    for tag in tags {
        let addition = if out.is_empty() {
            tag.len()
        } else {
            tag.len() + 1
        };
        if out.len() + addition > MAX_ANNOTATION_LEN {
            break;
        }
        if !out.is_empty() {
            out.push('+');
        }
        out.push_str(tag);
    }
    out
}
