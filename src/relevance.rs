//! Relevance: per variable-of-interest, the subset of variables and
//! subsystems whose derivatives matter.
//!
//! A `None` VOI means "no partitioning requested" — every variable is
//! relevant and differential vectors are not split. A `Some(name)` VOI
//! restricts relevance to whatever was registered for that name, letting
//! setup allocate a private sub-buffer per VOI (see DESIGN.md: private
//! per-VOI buffers are the default, not shared).

use std::collections::{HashMap, HashSet};

/// Identifies a variable-of-interest: `None` is "all variables relevant".
pub type Voi = Option<String>;

/// Tracks, for each registered VOI, the top-level promoted variable names
/// and subsystem paths that participate in its derivative computation.
#[derive(Debug, Clone, Default)]
pub struct Relevance {
    vars: HashMap<String, HashSet<String>>,
    systems: HashMap<String, HashSet<String>>,
}

impl Relevance {
    pub fn new() -> Self {
        Relevance::default()
    }

    /// Registers `var_name` and `system_path` as relevant to `voi`.
    pub fn mark_relevant(&mut self, voi: &str, var_name: impl Into<String>, system_path: impl Into<String>) {
        self.vars
            .entry(voi.to_string())
            .or_default()
            .insert(var_name.into());
        self.systems
            .entry(voi.to_string())
            .or_default()
            .insert(system_path.into());
    }

    /// Whether `top_promoted_name` participates in `voi`'s derivative
    /// computation. A `None` VOI, or a VOI with no registered relevance set
    /// at all (i.e. relevance analysis was never run for it), is always
    /// relevant — this is the conservative default required so that a
    /// `Group` with no relevance information still computes a correct, if
    /// unpruned, transfer.
    pub fn is_relevant(&self, voi: &Voi, top_promoted_name: &str) -> bool {
        match voi {
            None => true,
            Some(key) => match self.vars.get(key) {
                None => true,
                Some(set) => set.contains(top_promoted_name),
            },
        }
    }

    pub fn is_system_relevant(&self, voi: &Voi, system_path: &str) -> bool {
        match voi {
            None => true,
            Some(key) => match self.systems.get(key) {
                None => true,
                Some(set) => set.contains(system_path),
            },
        }
    }

    pub fn known_vois(&self) -> impl Iterator<Item = &str> {
        self.vars.keys().map(String::as_str)
    }
}
