//! `Problem`: the outermost harness — wires a root [`Group`] to a
//! [`Communicator`] and drives `setup`, `run`, and `calc_gradient` through a
//! fluent builder.

use std::collections::HashMap;

use tracing::info;

use crate::comm::{Communicator, SingleRankCommunicator};
use crate::config::Config;
use crate::error::Result;
use crate::linalg::DenseBlock;
use crate::recorder::Recorder;
use crate::relevance::Voi;
use crate::solver::SolverStatus;
use crate::system::group::{Group, SetupState};
use crate::transfer::ScatterMode;
use crate::vecwrapper::VecWrapper;

/// Direction `calc_gradient` sweeps the tree in. Forward seeds one `wrt`
/// column at a time and reads every `of`; reverse seeds one `of` row at a
/// time and reads every `wrt` — pick whichever side is smaller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientMode {
    Forward,
    Reverse,
}

/// Where a top-level name resolves to: a source (unknown/state, backed by
/// `unknowns`/`resids`) or a target (param, backed by `params`). A
/// `calc_gradient` endpoint can legally be either — a "wrt" is usually an
/// `IndepVarComp` output (a source) but may instead name a param directly by
/// its own (connected) path rather than by its source's promoted name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Source,
    Target,
}

/// The outermost harness. Owns the root [`Group`], the [`Communicator`] it
/// runs under, process configuration, and any attached [`Recorder`]s.
#[derive(Debug)]
pub struct Problem {
    root: Group,
    comm: Box<dyn Communicator>,
    config: Config,
    recorders: Vec<Box<dyn Recorder>>,
    iteration: usize,
}

impl Problem {
    pub fn new(root: Group) -> Self {
        Problem {
            root,
            comm: Box::new(SingleRankCommunicator),
            config: Config::default(),
            recorders: Vec::new(),
            iteration: 0,
        }
    }

    pub fn with_communicator(mut self, comm: Box<dyn Communicator>) -> Self {
        self.comm = comm;
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn add_recorder(&mut self, recorder: Box<dyn Recorder>) {
        self.recorders.push(recorder);
    }

    pub fn root(&self) -> &Group {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Group {
        &mut self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the collection/resolution/allocation/transfer pipeline. A no-op
    /// if the root is already `Built` (structural mutations since the last
    /// `setup()` reset it back to `Unbuilt`).
    pub fn setup(&mut self) -> Result<()> {
        if self.root.setup_state() == SetupState::Built {
            return Ok(());
        }
        info!(target: "mdao_core::problem", "running setup");
        self.root.setup(self.comm.as_ref())
    }

    /// Drives one nonlinear solve of the whole tree and records the
    /// resulting iteration.
    pub fn run_model(&mut self) -> Result<SolverStatus> {
        self.setup()?;
        let status = self.root.solve_nonlinear(self.comm.as_ref())?;
        self.record_iteration("run_model");
        Ok(status)
    }

    /// Evaluates the residuals once without driving a solve (`apply_nonlinear`).
    pub fn run_apply_nonlinear(&mut self) -> Result<()> {
        self.setup()?;
        self.root.apply_nonlinear(self.comm.as_ref())?;
        self.record_iteration("apply_nonlinear");
        Ok(())
    }

    fn record_iteration(&mut self, phase: &str) {
        if self.recorders.is_empty() {
            return;
        }
        self.iteration += 1;
        let coordinate = format!("{phase}|{}", self.iteration);
        for recorder in &mut self.recorders {
            recorder.record_iteration(&coordinate, self.root.params(), self.root.unknowns(), self.root.resids());
        }
    }

    fn locate(&self, name: &str) -> Location {
        if self.root.unknowns().metadata(name).is_some() {
            Location::Source
        } else {
            Location::Target
        }
    }

    fn var_size(&self, name: &str, loc: Location) -> usize {
        match loc {
            Location::Source => self.root.unknowns().metadata(name).map_or(1, |m| m.size),
            Location::Target => self.root.params().metadata(name).map_or(1, |m| m.size),
        }
    }

    fn zero_voi(&mut self, voi: &Voi) {
        let (du, dr, dp) = self.root.voi_buffer_mut(voi);
        du.zero();
        dr.zero();
        dp.zero();
    }

    fn seed(&mut self, voi: &Voi, buf: SeedBuf, name: &str, idx: usize) {
        let (du, dr, dp) = self.root.voi_buffer_mut(voi);
        let target: &mut VecWrapper = match buf {
            SeedBuf::Du => du,
            SeedBuf::Dr => dr,
            SeedBuf::Dp => dp,
        };
        if let Some(slice) = target.get_slice_mut(name) {
            if idx < slice.len() {
                slice[idx] = 1.0;
            }
        }
    }

    fn read(&mut self, voi: &Voi, buf: SeedBuf, name: &str, idx: usize) -> f64 {
        let (du, dr, dp) = self.root.voi_buffer_mut(voi);
        let source: &VecWrapper = match buf {
            SeedBuf::Du => du,
            SeedBuf::Dr => dr,
            SeedBuf::Dp => dp,
        };
        source.get_slice(name).and_then(|s| s.get(idx)).copied().unwrap_or(0.0)
    }

    /// Computes total derivatives of every `of` with respect to every `wrt`.
    ///
    /// Forward mode seeds one `wrt` unit column at a time and reads every
    /// `of` row; reverse mode seeds one `of` unit row at a time and reads
    /// every `wrt` column. A source-typed endpoint (an unknown: an explicit
    /// output or state) is seeded/read through `dr`/`du`; a target-typed
    /// endpoint (a param named directly rather than through its source) is
    /// seeded/read through `dp`, per the forward/reverse RHS-buffer
    /// convention of [`Group::solve_linear`].
    pub fn calc_gradient(
        &mut self,
        of: &[&str],
        wrt: &[&str],
        mode: GradientMode,
    ) -> Result<HashMap<(String, String), DenseBlock>> {
        self.setup()?;
        self.root.linearize();
        let voi: Voi = None;
        let tolerance = self.config.solver.zero_rhs_tolerance;
        let of_locs: Vec<Location> = of.iter().map(|n| self.locate(n)).collect();
        let wrt_locs: Vec<Location> = wrt.iter().map(|n| self.locate(n)).collect();
        let of_sizes: Vec<usize> = of.iter().zip(&of_locs).map(|(n, l)| self.var_size(n, *l)).collect();
        let wrt_sizes: Vec<usize> = wrt.iter().zip(&wrt_locs).map(|(n, l)| self.var_size(n, *l)).collect();

        let mut blocks: HashMap<(String, String), DenseBlock> = of
            .iter()
            .zip(&of_sizes)
            .flat_map(|(o, &osz)| wrt.iter().zip(&wrt_sizes).map(move |(w, &wsz)| ((o.to_string(), w.to_string()), DenseBlock::zeros(osz, wsz))))
            .collect();

        match mode {
            GradientMode::Forward => {
                for (wi, &wname) in wrt.iter().enumerate() {
                    for col in 0..wrt_sizes[wi] {
                        self.zero_voi(&voi);
                        match wrt_locs[wi] {
                            // an unknown's unit perturbation enters directly as a residual seed
                            Location::Source => self.seed(&voi, SeedBuf::Dr, wname, col),
                            // a free param's perturbation must first be folded into dr via one apply_linear pass
                            Location::Target => {
                                self.seed(&voi, SeedBuf::Dp, wname, col);
                                self.root.apply_linear(ScatterMode::Forward, &voi, self.comm.as_ref())?;
                            }
                        }
                        self.root.solve_linear(&voi, ScatterMode::Forward, tolerance, self.comm.as_ref())?;
                        for (oi, &oname) in of.iter().enumerate() {
                            for row in 0..of_sizes[oi] {
                                let value = self.read(&voi, SeedBuf::Du, oname, row);
                                blocks.get_mut(&(oname.to_string(), wname.to_string())).unwrap().data[row * wrt_sizes[wi] + col] = value;
                            }
                        }
                    }
                }
            }
            GradientMode::Reverse => {
                for (oi, &oname) in of.iter().enumerate() {
                    for row in 0..of_sizes[oi] {
                        self.zero_voi(&voi);
                        self.seed(&voi, SeedBuf::Du, oname, row);
                        self.root.solve_linear(&voi, ScatterMode::Reverse, tolerance, self.comm.as_ref())?;
                        for (wi, &wname) in wrt.iter().enumerate() {
                            for col in 0..wrt_sizes[wi] {
                                let value = match wrt_locs[wi] {
                                    Location::Source => self.read(&voi, SeedBuf::Du, wname, col),
                                    Location::Target => self.read(&voi, SeedBuf::Dp, wname, col),
                                };
                                blocks.get_mut(&(oname.to_string(), wname.to_string())).unwrap().data[row * wrt_sizes[wi] + col] = value;
                            }
                        }
                    }
                }
            }
        }
        Ok(blocks)
    }
}

#[derive(Debug, Clone, Copy)]
enum SeedBuf {
    Du,
    Dr,
    Dp,
}
