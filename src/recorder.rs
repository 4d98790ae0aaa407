//! Case recording: a [`Recorder`] observes the state of a
//! [`crate::system::group::Group`] after each solver iteration. Only an
//! in-memory sink is provided — file-based recorders are out of scope.

use crate::vecwrapper::VecWrapper;

/// One recorded iteration: the dotted coordinate the iteration occurred at
/// (`"<phase>|<n>"`) plus a flat snapshot of every numeric variable visible
/// at the root.
#[derive(Debug, Clone)]
pub struct RecordedCase {
    pub iteration_coordinate: String,
    pub params: Vec<(String, Vec<f64>)>,
    pub unknowns: Vec<(String, Vec<f64>)>,
    pub resids: Vec<(String, Vec<f64>)>,
}

fn snapshot(buf: &VecWrapper) -> Vec<(String, Vec<f64>)> {
    buf.iter_metadata()
        .filter_map(|m| buf.get_slice(&m.promoted_name).map(|s| (m.promoted_name.clone(), s.to_vec())))
        .collect()
}

/// Observes root-level state after each recorded iteration. Implementors
/// must not assume any particular call cadence beyond "at least once per
/// `Problem::run_model`/`run_apply_nonlinear` call".
pub trait Recorder: std::fmt::Debug {
    fn record_iteration(&mut self, iteration_coordinate: &str, params: &VecWrapper, unknowns: &VecWrapper, resids: &VecWrapper);
}

/// Accumulates every recorded case in memory, in call order.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    cases: Vec<RecordedCase>,
}

impl InMemoryRecorder {
    pub fn new() -> Self {
        InMemoryRecorder::default()
    }

    pub fn cases(&self) -> &[RecordedCase] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl Recorder for InMemoryRecorder {
    fn record_iteration(&mut self, iteration_coordinate: &str, params: &VecWrapper, unknowns: &VecWrapper, resids: &VecWrapper) {
        self.cases.push(RecordedCase {
            iteration_coordinate: iteration_coordinate.to_string(),
            params: snapshot(params),
            unknowns: snapshot(unknowns),
            resids: snapshot(resids),
        });
    }
}
