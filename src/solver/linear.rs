//! Linear solvers: dispatched by [`crate::system::group::Group::solve_linear`].
//!
//! Both solvers here treat the group's `apply_linear` as a black-box
//! operator — `A(x)` for forward mode, `A^T(x)` for reverse — and never
//! look inside it. This mirrors how OpenMDAO's own linear solvers are
//! written against `System._sys_apply_linear` rather than against any
//! concrete component's math.

use crate::comm::Communicator;
use crate::error::Result;
use crate::relevance::Voi;
use crate::system::group::Group;
use crate::transfer::ScatterMode;

use super::SolverStatus;

/// Solves the linear system implied by a group's `apply_linear` for one
/// mode/VOI. On return, the solution has been written into the
/// differential buffer the mode designates (`du` forward, `dr` reverse).
pub trait LinearSolver: std::fmt::Debug {
    fn solve(&mut self, group: &mut Group, voi: &Voi, mode: ScatterMode, comm: &dyn Communicator) -> Result<SolverStatus>;
}

/// Richardson/block-Gauss-Seidel iteration exploiting the fact that the
/// group-level diagonal (the implicit `+1` for every explicit output) is
/// exactly the identity by construction: the residual of one `apply_linear`
/// sweep is itself the correction to add to the current solution. Exact in
/// one pass for an acyclic parameter graph; iterative otherwise.
#[derive(Debug, Clone)]
pub struct LinearBlockGaussSeidel {
    pub maxiter: usize,
    pub atol: f64,
    pub rtol: f64,
}

impl Default for LinearBlockGaussSeidel {
    fn default() -> Self {
        LinearBlockGaussSeidel {
            maxiter: 20,
            atol: 1e-10,
            rtol: 1e-10,
        }
    }
}

impl LinearSolver for LinearBlockGaussSeidel {
    fn solve(&mut self, group: &mut Group, voi: &Voi, mode: ScatterMode, comm: &dyn Communicator) -> Result<SolverStatus> {
        let rhs = read_rhs(group, voi, mode);
        write_solution(group, voi, mode, &rhs);
        let rhs_norm = l2(&rhs);

        for it in 1..=self.maxiter {
            zero_computed(group, voi, mode);
            group.run_apply_linear(mode, voi, comm)?;
            let computed = read_computed(group, voi, mode);
            let resid: Vec<f64> = rhs.iter().zip(&computed).map(|(r, c)| r - c).collect();
            let resid_norm = l2(&resid);
            if resid_norm <= self.atol + self.rtol * rhs_norm {
                return Ok(SolverStatus::Converged { iterations: it });
            }
            add_to_solution(group, voi, mode, &resid);
        }
        Ok(SolverStatus::MaxIterExceeded { iterations: self.maxiter })
    }
}

/// Matrix-free restarted GMRES over the group's linear-apply operator,
/// grounded on `scipy_gmres.py`'s wrapping of `scipy.sparse.linalg.gmres`
/// around a `System`'s `apply_linear`.
#[derive(Debug, Clone)]
pub struct ScipyGmresStyleSolver {
    pub maxiter: usize,
    pub restart: usize,
    pub atol: f64,
    pub rtol: f64,
}

impl Default for ScipyGmresStyleSolver {
    fn default() -> Self {
        ScipyGmresStyleSolver {
            maxiter: 100,
            restart: 20,
            atol: 1e-10,
            rtol: 1e-10,
        }
    }
}

impl LinearSolver for ScipyGmresStyleSolver {
    fn solve(&mut self, group: &mut Group, voi: &Voi, mode: ScatterMode, comm: &dyn Communicator) -> Result<SolverStatus> {
        let rhs = read_rhs(group, voi, mode);
        let n = rhs.len();
        let b_norm = l2(&rhs).max(1e-300);
        let mut x = vec![0.0; n];
        let mut total_iters = 0usize;

        loop {
            let ax0 = apply_operator(group, voi, mode, comm, &x)?;
            let r0: Vec<f64> = rhs.iter().zip(&ax0).map(|(b, a)| b - a).collect();
            let beta = l2(&r0);
            if beta <= self.atol + self.rtol * b_norm || total_iters >= self.maxiter {
                write_solution(group, voi, mode, &x);
                return Ok(if beta <= self.atol + self.rtol * b_norm {
                    SolverStatus::Converged { iterations: total_iters }
                } else {
                    SolverStatus::MaxIterExceeded { iterations: total_iters }
                });
            }

            let m = self.restart.min(self.maxiter - total_iters).max(1);
            let mut v = vec![vec![0.0; n]; m + 1];
            for i in 0..n {
                v[0][i] = r0[i] / beta;
            }
            let mut h = vec![vec![0.0; m]; m + 1];
            let mut cs = vec![0.0; m];
            let mut sn = vec![0.0; m];
            let mut g = vec![0.0; m + 1];
            g[0] = beta;
            let mut k_used = 0;

            for k in 0..m {
                total_iters += 1;
                let w0 = apply_operator(group, voi, mode, comm, &v[k])?;
                let mut w = w0;
                for i in 0..=k {
                    let hik = dot(&w, &v[i]);
                    h[i][k] = hik;
                    for j in 0..n {
                        w[j] -= hik * v[i][j];
                    }
                }
                let hk1k = l2(&w);
                h[k + 1][k] = hk1k;
                if hk1k > 1e-14 {
                    for j in 0..n {
                        v[k + 1][j] = w[j] / hk1k;
                    }
                }
                for i in 0..k {
                    let (c, s) = (cs[i], sn[i]);
                    let h_ik = h[i][k];
                    let h_i1k = h[i + 1][k];
                    h[i][k] = c * h_ik + s * h_i1k;
                    h[i + 1][k] = -s * h_ik + c * h_i1k;
                }
                let (c, s) = givens(h[k][k], h[k + 1][k]);
                cs[k] = c;
                sn[k] = s;
                h[k][k] = c * h[k][k] + s * h[k + 1][k];
                h[k + 1][k] = 0.0;
                g[k + 1] = -sn[k] * g[k];
                g[k] *= cs[k];
                k_used = k + 1;
                if g[k + 1].abs() <= self.atol + self.rtol * b_norm || total_iters >= self.maxiter {
                    break;
                }
            }

            let mut y = vec![0.0; k_used];
            for i in (0..k_used).rev() {
                let mut sum = g[i];
                for j in (i + 1)..k_used {
                    sum -= h[i][j] * y[j];
                }
                y[i] = sum / h[i][i];
            }
            for i in 0..n {
                let mut delta = 0.0;
                for j in 0..k_used {
                    delta += v[j][i] * y[j];
                }
                x[i] += delta;
            }
        }
    }
}

fn read_rhs(group: &mut Group, voi: &Voi, mode: ScatterMode) -> Vec<f64> {
    let (du, dr, _dp) = group.voi_buffer_mut(voi);
    match mode {
        ScatterMode::Forward => dr.raw().to_vec(),
        ScatterMode::Reverse => du.raw().to_vec(),
    }
}

fn read_computed(group: &mut Group, voi: &Voi, mode: ScatterMode) -> Vec<f64> {
    read_rhs(group, voi, mode)
}

fn write_solution(group: &mut Group, voi: &Voi, mode: ScatterMode, x: &[f64]) {
    let (du, dr, _dp) = group.voi_buffer_mut(voi);
    match mode {
        ScatterMode::Forward => du.raw_mut().copy_from_slice(x),
        ScatterMode::Reverse => dr.raw_mut().copy_from_slice(x),
    }
}

fn zero_computed(group: &mut Group, voi: &Voi, mode: ScatterMode) {
    let (du, dr, _dp) = group.voi_buffer_mut(voi);
    match mode {
        ScatterMode::Forward => dr.zero(),
        ScatterMode::Reverse => du.zero(),
    }
}

fn add_to_solution(group: &mut Group, voi: &Voi, mode: ScatterMode, resid: &[f64]) {
    let (du, dr, _dp) = group.voi_buffer_mut(voi);
    let sol = match mode {
        ScatterMode::Forward => du.raw_mut(),
        ScatterMode::Reverse => dr.raw_mut(),
    };
    for (s, r) in sol.iter_mut().zip(resid) {
        *s += r;
    }
}

fn apply_operator(group: &mut Group, voi: &Voi, mode: ScatterMode, comm: &dyn Communicator, x: &[f64]) -> Result<Vec<f64>> {
    write_solution(group, voi, mode, x);
    zero_computed(group, voi, mode);
    group.run_apply_linear(mode, voi, comm)?;
    Ok(read_computed(group, voi, mode))
}

fn l2(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else if b.abs() > a.abs() {
        let t = a / b;
        let s = 1.0 / (1.0 + t * t).sqrt();
        (t * s, s)
    } else {
        let t = b / a;
        let c = 1.0 / (1.0 + t * t).sqrt();
        (c, t * c)
    }
}
