//! `Component`: a leaf node of the composition tree.
//!
//! A component declares its own parameters, outputs and states, then
//! supplies a [`ComponentModel`] implementing the actual numerics. The
//! two-phase split (declare, then model) mirrors
//! `openmdao.core.component.Component` / `IndepVarComp`: variable
//! registration happens through `add_param`/`add_output`/`add_state` and is
//! locked once the owning group calls [`Component::close_setup`].

use std::collections::HashMap;

use crate::error::{NamingError, Result, RuntimeError};
use crate::linalg::Jacobian;
use crate::transfer::ScatterMode;
use crate::variable::{validate_local_name, Shape, VarKind};
use crate::vecwrapper::VecWrapper;

/// Finite-difference fallback configuration. The FD/complex-step engine
/// itself is out of scope; these options are carried so a component can at
/// least declare its intent and `force_fd` can be checked by a caller that
/// does implement it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdForm {
    Forward,
    Backward,
    Central,
    ComplexStep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdStepType {
    Absolute,
    Relative,
}

#[derive(Debug, Clone, Copy)]
pub struct FdOptions {
    pub force_fd: bool,
    pub form: FdForm,
    pub step_size: f64,
    pub step_type: FdStepType,
}

impl Default for FdOptions {
    fn default() -> Self {
        FdOptions {
            force_fd: false,
            form: FdForm::Forward,
            step_size: 1e-6,
            step_type: FdStepType::Relative,
        }
    }
}

/// Accessor handed to a [`ComponentModel`] during `solve_nonlinear` /
/// `apply_nonlinear`: translates the component's own locally-declared names
/// into whatever promoted name the owning group assigned them, and reads/
/// writes through that name into the group's shared buffers.
pub struct ComponentIo<'a> {
    local_to_promoted: &'a HashMap<String, String>,
    params: &'a VecWrapper,
    unknowns: &'a mut VecWrapper,
    resids: &'a mut VecWrapper,
}

impl<'a> ComponentIo<'a> {
    pub fn new(
        local_to_promoted: &'a HashMap<String, String>,
        params: &'a VecWrapper,
        unknowns: &'a mut VecWrapper,
        resids: &'a mut VecWrapper,
    ) -> Self {
        ComponentIo {
            local_to_promoted,
            params,
            unknowns,
            resids,
        }
    }

    fn promoted<'b>(&self, local: &'b str) -> &'b str
    where
        'a: 'b,
    {
        self.local_to_promoted.get(local).map(String::as_str).unwrap_or(local)
    }

    pub fn param(&self, local: &str) -> f64 {
        self.params.get_scalar(self.promoted(local)).unwrap_or(0.0)
    }

    pub fn param_slice(&self, local: &str) -> &[f64] {
        self.params.get_slice(self.promoted(local)).unwrap_or(&[])
    }

    pub fn output(&self, local: &str) -> f64 {
        self.unknowns.get_scalar(self.promoted(local)).unwrap_or(0.0)
    }

    pub fn output_slice(&self, local: &str) -> &[f64] {
        self.unknowns.get_slice(self.promoted(local)).unwrap_or(&[])
    }

    pub fn set_output(&mut self, local: &str, value: f64) {
        let name = self.promoted(local).to_string();
        self.unknowns.set_scalar(&name, value);
    }

    pub fn set_output_slice(&mut self, local: &str, values: &[f64]) {
        let name = self.promoted(local).to_string();
        if let Some(slice) = self.unknowns.get_slice_mut(&name) {
            slice.copy_from_slice(values);
        }
    }

    pub fn resid(&self, local: &str) -> f64 {
        self.resids.get_scalar(self.promoted(local)).unwrap_or(0.0)
    }

    pub fn set_resid(&mut self, local: &str, value: f64) {
        let name = self.promoted(local).to_string();
        self.resids.set_scalar(&name, value);
    }

    pub fn set_resid_slice(&mut self, local: &str, values: &[f64]) {
        let name = self.promoted(local).to_string();
        if let Some(slice) = self.resids.get_slice_mut(&name) {
            slice.copy_from_slice(values);
        }
    }
}

/// Accessor handed to a [`ComponentModel`] during `apply_linear`: the same
/// name-indirection as [`ComponentIo`], but over the differential (`d*`)
/// buffers, one slice per local parameter/output name.
pub struct DerivIo<'a> {
    local_to_promoted: &'a HashMap<String, String>,
    dparams: &'a mut VecWrapper,
    dunknowns: &'a mut VecWrapper,
    dresids: &'a mut VecWrapper,
}

impl<'a> DerivIo<'a> {
    pub fn new(
        local_to_promoted: &'a HashMap<String, String>,
        dparams: &'a mut VecWrapper,
        dunknowns: &'a mut VecWrapper,
        dresids: &'a mut VecWrapper,
    ) -> Self {
        DerivIo {
            local_to_promoted,
            dparams,
            dunknowns,
            dresids,
        }
    }

    fn promoted(&self, local: &str) -> String {
        self.local_to_promoted.get(local).cloned().unwrap_or_else(|| local.to_string())
    }

    pub fn param_slice(&self, local: &str) -> Vec<f64> {
        let name = self.promoted(local);
        self.dparams.get_slice(&name).map(<[f64]>::to_vec).unwrap_or_default()
    }

    pub fn set_param_slice(&mut self, local: &str, values: &[f64]) {
        let name = self.promoted(local);
        if let Some(slice) = self.dparams.get_slice_mut(&name) {
            slice.copy_from_slice(values);
        }
    }

    pub fn unknown_slice(&self, local: &str) -> Vec<f64> {
        let name = self.promoted(local);
        self.dunknowns.get_slice(&name).map(<[f64]>::to_vec).unwrap_or_default()
    }

    pub fn set_unknown_slice(&mut self, local: &str, values: &[f64]) {
        let name = self.promoted(local);
        if let Some(slice) = self.dunknowns.get_slice_mut(&name) {
            slice.copy_from_slice(values);
        }
    }

    pub fn resid_slice(&self, local: &str) -> Vec<f64> {
        let name = self.promoted(local);
        self.dresids.get_slice(&name).map(<[f64]>::to_vec).unwrap_or_default()
    }

    pub fn set_resid_slice(&mut self, local: &str, values: &[f64]) {
        let name = self.promoted(local);
        if let Some(slice) = self.dresids.get_slice_mut(&name) {
            slice.copy_from_slice(values);
        }
    }
}

/// The numerics a concrete component supplies. `apply_linear` returning
/// `Ok(false)` means "I don't implement this analytically"; the owning
/// [`Component`] then falls back to the cached [`Jacobian`] from the last
/// `linearize` call.
pub trait ComponentModel: std::fmt::Debug {
    fn solve_nonlinear(&mut self, io: &mut ComponentIo) -> Result<()>;

    fn apply_nonlinear(&mut self, _io: &mut ComponentIo) -> Result<()> {
        Ok(())
    }

    fn linearize(&mut self, _io: &ComponentIo) -> Option<Jacobian> {
        None
    }

    fn apply_linear(&mut self, _mode: ScatterMode, _io: &mut DerivIo) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DeclaredVar {
    pub name: String,
    pub kind: VarKind,
    pub shape: Shape,
    pub initial: Option<Vec<f64>>,
}

/// A leaf system. Variable declaration (`add_param`/`add_output`/
/// `add_state`) happens during construction; the owning [`super::Group`]
/// assigns absolute paths, promoted names and buffer slices during its own
/// `setup`.
#[derive(Debug)]
pub struct Component {
    path: String,
    params: Vec<DeclaredVar>,
    outputs: Vec<DeclaredVar>,
    setup_closed: bool,
    pub fd_options: FdOptions,
    model: Box<dyn ComponentModel>,
    jacobian: Option<Jacobian>,
}

impl Component {
    pub fn new(model: impl ComponentModel + 'static) -> Self {
        Component {
            path: String::new(),
            params: Vec::new(),
            outputs: Vec::new(),
            setup_closed: false,
            fd_options: FdOptions::default(),
            model: Box::new(model),
            jacobian: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn set_path(&mut self, path: String) {
        self.path = path;
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.setup_closed {
            return Err(NamingError::SetupClosed(name.to_string()).into());
        }
        validate_local_name(name)?;
        if self.params.iter().chain(self.outputs.iter()).any(|v| v.name == name) {
            return Err(NamingError::DuplicateName(name.to_string()).into());
        }
        Ok(())
    }

    pub fn add_param(&mut self, name: &str, shape: Shape) -> Result<()> {
        self.check_name(name)?;
        self.params.push(DeclaredVar {
            name: name.to_string(),
            kind: VarKind::Param,
            shape,
            initial: None,
        });
        Ok(())
    }

    pub fn add_output(&mut self, name: &str, shape: Shape, initial: Option<Vec<f64>>) -> Result<()> {
        self.check_name(name)?;
        self.outputs.push(DeclaredVar {
            name: name.to_string(),
            kind: VarKind::Output,
            shape,
            initial,
        });
        Ok(())
    }

    pub fn add_state(&mut self, name: &str, shape: Shape, initial: Option<Vec<f64>>) -> Result<()> {
        self.check_name(name)?;
        self.outputs.push(DeclaredVar {
            name: name.to_string(),
            kind: VarKind::State,
            shape,
            initial,
        });
        Ok(())
    }

    pub(crate) fn close_setup(&mut self) {
        self.setup_closed = true;
    }

    pub(crate) fn declared_params(&self) -> &[DeclaredVar] {
        &self.params
    }

    pub(crate) fn declared_outputs(&self) -> &[DeclaredVar] {
        &self.outputs
    }

    pub fn solve_nonlinear(&mut self, io: &mut ComponentIo) -> Result<()> {
        self.model.solve_nonlinear(io)
    }

    pub fn apply_nonlinear(&mut self, io: &mut ComponentIo) -> Result<()> {
        self.model.apply_nonlinear(io)
    }

    pub fn linearize(&mut self, io: &ComponentIo) {
        self.jacobian = self.model.linearize(io);
    }

    /// Forward/reverse linear-apply: prefer the model's own analytic
    /// `apply_linear`; otherwise fall back to the cached dense Jacobian
    /// from the last `linearize` call. The implicit `+1` diagonal
    /// for explicit outputs is *not* added here — the owning group adds it
    /// uniformly after this call returns, since it is identical for every
    /// component regardless of whether it supplied an analytic Jacobian.
    pub fn apply_linear(&mut self, mode: ScatterMode, io: &mut DerivIo) -> Result<()> {
        if self.model.apply_linear(mode, io)? {
            return Ok(());
        }
        let Some(jac) = self.jacobian.as_ref() else {
            return Err(RuntimeError::NotImplemented {
                component: self.path.clone(),
                method: "apply_linear".to_string(),
            }
            .into());
        };
        match mode {
            ScatterMode::Forward => {
                for ((out_local, in_local), block) in jac.blocks() {
                    let dp = io.param_slice(in_local);
                    let mut dr = io.resid_slice(out_local);
                    let mut cross = vec![0.0; block.rows];
                    block.matvec_accumulate(&dp, &mut cross);
                    for (d, c) in dr.iter_mut().zip(&cross) {
                        *d -= c;
                    }
                    io.set_resid_slice(out_local, &dr);
                }
            }
            ScatterMode::Reverse => {
                for ((out_local, in_local), block) in jac.blocks() {
                    let dr = io.resid_slice(out_local);
                    let mut cross = vec![0.0; block.cols];
                    block.matvec_transpose_accumulate(&dr, &mut cross);
                    let mut dp = io.param_slice(in_local);
                    for (d, c) in dp.iter_mut().zip(&cross) {
                        *d -= c;
                    }
                    io.set_param_slice(in_local, &dp);
                }
            }
        }
        Ok(())
    }
}

/// A component with no parameters whose outputs are set once at
/// construction and never touched again by `solve_nonlinear`. Grounded on
/// `openmdao.components.indep_var_comp.IndepVarComp`: because it declares no
/// params, the default linear-apply above contributes no cross term, so its
/// full linear behavior reduces to the group's diagonal add alone — an
/// identity pass-through of `du`/`dr`, exactly matching the original's
/// `rhs_vec[voi].vec[:] += sol_vec[voi].vec`.
#[derive(Debug, Default)]
pub struct IndepVarComp;

impl ComponentModel for IndepVarComp {
    fn solve_nonlinear(&mut self, _io: &mut ComponentIo) -> Result<()> {
        Ok(())
    }

    fn apply_linear(&mut self, _mode: ScatterMode, _io: &mut DerivIo) -> Result<bool> {
        Ok(true)
    }
}

impl Component {
    /// Builds an `IndepVarComp`-equivalent: a single output, its value fixed
    /// at `initial` for the lifetime of the component.
    pub fn indep_var(name: &str, shape: Shape, initial: Vec<f64>) -> Result<Self> {
        let mut c = Component::new(IndepVarComp);
        c.add_output(name, shape, Some(initial))?;
        Ok(c)
    }
}
