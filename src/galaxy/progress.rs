//! Step-by-step progress of a galaxy build.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Build stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BuildStage {
    GatherVectors,
    ReduceTo3d,
    AssignClusters,
    BuildIndex,
    PersistCache,
}

impl BuildStage {
    pub const ALL: [BuildStage; 5] = [
        BuildStage::GatherVectors,
        BuildStage::ReduceTo3d,
        BuildStage::AssignClusters,
        BuildStage::BuildIndex,
        BuildStage::PersistCache,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            BuildStage::GatherVectors => "gather vectors",
            BuildStage::ReduceTo3d => "reduce to 3D",
            BuildStage::AssignClusters => "assign clusters",
            BuildStage::BuildIndex => "build index",
            BuildStage::PersistCache => "persist cache",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Waiting,
    Done,
    Error,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Error)
    }
}

/// Receives `(stepIndex, status, detail)` updates.
///
/// Implementations may panic; the build catches and logs it.
pub trait BuildReporter: Send + Sync {
    fn report(&self, step: usize, status: StepStatus, detail: Option<&str>);
}

impl<F> BuildReporter for F
where
    F: Fn(usize, StepStatus, Option<&str>) + Send + Sync,
{
    fn report(&self, step: usize, status: StepStatus, detail: Option<&str>) {
        self(step, status, detail)
    }
}

pub struct NoopReporter;

impl BuildReporter for NoopReporter {
    fn report(&self, _step: usize, _status: StepStatus, _detail: Option<&str>) {}
}

/// Last reported state of one stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageState {
    pub stage: BuildStage,
    pub label: &'static str,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

struct ProgressInner {
    states: Vec<StageState>,
    reporters: Vec<Arc<dyn BuildReporter>>,
}

/// Fans one build's updates out to every attached reporter.
///
/// Reporters attached mid-build first see every stage as pending, then the
/// latest state of each stage that moved on. A finished stage is replayed as
/// `running` followed by its terminal status, so late reporters observe the
/// same sequence shape as the first caller.
///
/// Reporters are called with the internal lock held and must not report
/// back into the same `Progress`.
pub struct Progress {
    inner: Mutex<ProgressInner>,
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress {
    pub fn new() -> Self {
        let states = BuildStage::ALL
            .iter()
            .map(|&stage| StageState {
                stage,
                label: stage.label(),
                status: StepStatus::Pending,
                detail: None,
            })
            .collect();

        Self {
            inner: Mutex::new(ProgressInner {
                states,
                reporters: Vec::new(),
            }),
        }
    }

    pub fn attach(&self, reporter: Arc<dyn BuildReporter>) {
        // delivery happens under the lock so a replay never interleaves with
        // live updates
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for state in &inner.states {
            deliver(reporter.as_ref(), state.stage, StepStatus::Pending, None);
        }
        for state in inner.states.iter().filter(|s| s.status != StepStatus::Pending) {
            if state.status.is_terminal() {
                deliver(reporter.as_ref(), state.stage, StepStatus::Running, None);
            }
            deliver(
                reporter.as_ref(),
                state.stage,
                state.status,
                state.detail.as_deref(),
            );
        }
        inner.reporters.push(reporter);
    }

    /// Report every stage as pending.
    pub fn pending_all(&self) {
        for stage in BuildStage::ALL {
            self.report(stage, StepStatus::Pending, None);
        }
    }

    pub fn report(&self, stage: BuildStage, status: StepStatus, detail: Option<&str>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let state = &mut inner.states[stage.index()];
        state.status = status;
        state.detail = detail.map(str::to_string);

        for reporter in &inner.reporters {
            deliver(reporter.as_ref(), stage, status, detail);
        }
    }

    pub fn running(&self, stage: BuildStage) {
        self.report(stage, StepStatus::Running, None);
    }

    pub fn done(&self, stage: BuildStage, detail: Option<&str>) {
        self.report(stage, StepStatus::Done, detail);
    }

    pub fn error(&self, stage: BuildStage, detail: &str) {
        self.report(stage, StepStatus::Error, Some(detail));
    }

    pub fn states(&self) -> Vec<StageState> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .states
            .clone()
    }
}

fn deliver(reporter: &dyn BuildReporter, stage: BuildStage, status: StepStatus, detail: Option<&str>) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        reporter.report(stage.index(), status, detail)
    }));
    if result.is_err() {
        log::warn!(
            "progress reporter panicked on stage '{}' ({:?}), ignoring",
            stage.label(),
            status
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Events = Arc<Mutex<Vec<(usize, StepStatus, Option<String>)>>>;

    fn recorder() -> (Arc<dyn BuildReporter>, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let reporter = move |step: usize, status: StepStatus, detail: Option<&str>| {
            sink.lock()
                .unwrap()
                .push((step, status, detail.map(str::to_string)));
        };
        (Arc::new(reporter), events)
    }

    #[test]
    fn test_stage_order_and_labels() {
        for (i, stage) in BuildStage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
        assert_eq!(BuildStage::ReduceTo3d.label(), "reduce to 3D");
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&StepStatus::Waiting).unwrap();
        assert_eq!(json, "\"waiting\"");
    }

    #[test]
    fn test_fan_out() {
        let progress = Progress::new();
        let (first, first_events) = recorder();
        let (second, second_events) = recorder();
        progress.attach(first);
        progress.attach(second);
        first_events.lock().unwrap().clear();
        second_events.lock().unwrap().clear();

        progress.running(BuildStage::GatherVectors);
        progress.done(BuildStage::GatherVectors, Some("3 vectors"));

        let expected = vec![
            (0, StepStatus::Running, None),
            (0, StepStatus::Done, Some("3 vectors".to_string())),
        ];
        assert_eq!(*first_events.lock().unwrap(), expected);
        assert_eq!(*second_events.lock().unwrap(), expected);
    }

    #[test]
    fn test_late_attach_replays_state() {
        let progress = Progress::new();
        progress.pending_all();
        progress.running(BuildStage::GatherVectors);
        progress.done(BuildStage::GatherVectors, None);
        progress.running(BuildStage::ReduceTo3d);

        let (late, events) = recorder();
        progress.attach(late);

        let events = events.lock().unwrap();
        let stages = BuildStage::ALL.len();
        assert_eq!(events.len(), stages + 3);
        assert!(events[..stages].iter().all(|e| e.1 == StepStatus::Pending));
        assert_eq!(events[stages], (0, StepStatus::Running, None));
        assert_eq!(events[stages + 1], (0, StepStatus::Done, None));
        assert_eq!(events[stages + 2], (1, StepStatus::Running, None));
    }

    #[test]
    fn test_late_attach_sees_running_before_error() {
        let progress = Progress::new();
        progress.pending_all();
        progress.error(BuildStage::GatherVectors, "store unavailable");

        let (late, events) = recorder();
        progress.attach(late);

        let events = events.lock().unwrap();
        let stage0: Vec<_> = events.iter().filter(|e| e.0 == 0).collect();
        assert_eq!(stage0.len(), 3);
        assert_eq!(stage0[1].1, StepStatus::Running);
        assert_eq!(
            *stage0[2],
            (0, StepStatus::Error, Some("store unavailable".to_string()))
        );
    }

    #[test]
    fn test_panicking_reporter_is_swallowed() {
        let progress = Progress::new();
        let (good, events) = recorder();
        progress.attach(Arc::new(|_: usize, _: StepStatus, _: Option<&str>| {
            panic!("reporter failure")
        }));
        progress.attach(good);

        progress.running(BuildStage::BuildIndex);

        assert!(events
            .lock()
            .unwrap()
            .contains(&(3, StepStatus::Running, None)));
        assert_eq!(progress.states()[3].status, StepStatus::Running);
    }
}
