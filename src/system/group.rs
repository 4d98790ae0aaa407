//! `Group`: an internal node of the composition tree.
//!
//! Owns named children in insertion order, promotion patterns per child,
//! explicit connections, and (once [`Group::setup`] has run) the compiled
//! vector layout and scatter descriptors that drive execution. Grounded
//! throughout on `openmdao.core.group.Group`.
//!
//! `.connect()` takes root-level promoted names rather than per-group-
//! relative ones (see `DESIGN.md`); this keeps connection resolution a
//! single flat pass over the whole tree's variable space.

use std::collections::{HashMap, HashSet};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::DiGraph;

use crate::comm::Communicator;
use crate::error::{ConnectError, NamingError, OrderError, Result, RuntimeError, ShapeError};
use crate::relevance::Voi;
use crate::solver::linear::{LinearBlockGaussSeidel, LinearSolver};
use crate::solver::nonlinear::{NonlinearSinglePass, NonlinearSolver};
use crate::solver::SolverStatus;
use crate::system::component::{Component, ComponentIo, DerivIo};
use crate::system::System;
use crate::transfer::{compute_global_idxs, ConnectionEndpoints, DataTransfer, ScatterMode, SizesTable};
use crate::variable::{split_parent, validate_local_name, Shape, VarFlags, VarKind, VariableMetadata};
use crate::vecwrapper::{Flavor, VecWrapper};

/// A `.connect()` call as declared by the user, before resolution. Source
/// and target are root-level promoted names.
#[derive(Debug, Clone)]
struct ExplicitConnection {
    source: String,
    targets: Vec<String>,
    src_indices: Option<Vec<usize>>,
}

#[derive(Debug, Clone)]
struct ResolvedConnection {
    source: String,
    target: String,
    src_indices: Option<Vec<usize>>,
}

/// A variable as it bubbles up through nested promotion. `visible_name`
/// starts as the bare local name at the declaring component and is rewritten
/// at every enclosing group until it reaches the root, where it becomes the
/// variable's `top_promoted_name`.
#[derive(Debug, Clone)]
struct RawVar {
    rel_path: String,
    visible_name: String,
    kind: VarKind,
    shape: Shape,
}

fn promotion_matches(pattern: &str, name: &str) -> bool {
    if pattern == "*" {
        true
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else if let Some(suffix) = pattern.strip_prefix('*') {
        name.ends_with(suffix)
    } else {
        pattern == name
    }
}

/// Every ancestor `(owner_group_path, immediate_child_name)` pair on the way
/// up from `component_path` to the root, nearest first. Used to scope a
/// connection's scatter into every level's per-child transfer table.
fn ancestor_chain(component_path: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut cur = component_path.to_string();
    loop {
        let (parent, child) = split_parent(&cur);
        let pair = (parent.to_string(), child.to_string());
        let done = parent.is_empty();
        pairs.push(pair);
        if done {
            break;
        }
        cur = parent.to_string();
    }
    pairs
}

/// The compiled state produced by [`Group::setup`]: the flattened buffers
/// and the scatter descriptors keyed by `(owner_group_path,
/// immediate_child_name)`.
#[derive(Debug)]
struct CompiledGroup {
    u_sizes: SizesTable,
    p_sizes: SizesTable,
    unknowns: VecWrapper,
    resids: VecWrapper,
    params_buf: VecWrapper,
    io_maps: HashMap<String, HashMap<String, String>>,
    explicit_outputs_by_component: HashMap<String, Vec<String>>,
    fwd_by_owner_child: HashMap<(String, String), DataTransfer>,
    rev_by_owner_child: HashMap<(String, String), DataTransfer>,
    fwd_full_by_owner: HashMap<String, DataTransfer>,
    rev_full_by_owner: HashMap<String, DataTransfer>,
    voi_buffers: HashMap<Voi, (VecWrapper, VecWrapper, VecWrapper)>,
    unconnected_params: Vec<String>,
}

impl CompiledGroup {
    fn ensure_voi(&mut self, voi: &Voi) {
        if self.voi_buffers.contains_key(voi) {
            return;
        }
        let mut du = VecWrapper::empty(Flavor::Source);
        let mut dr = VecWrapper::empty(Flavor::Source);
        for meta in self.unknowns.iter_metadata() {
            du.push_numeric(meta.clone());
            dr.push_numeric(meta.clone());
        }
        let mut dp = VecWrapper::empty(Flavor::Target);
        for meta in self.params_buf.iter_metadata() {
            dp.push_numeric(meta.clone());
        }
        self.voi_buffers.insert(voi.clone(), (du, dr, dp));
    }
}

/// `Group::setup` / `Unbuilt`→`Built` invalidation state: any structural
/// change (`add`, `connect`, `set_order`) after `Built` resets to `Unbuilt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    Unbuilt,
    Built,
}

#[derive(Debug)]
pub struct Group {
    path: String,
    children: Vec<(String, System)>,
    promotes: HashMap<String, Vec<String>>,
    explicit_connections: Vec<ExplicitConnection>,
    order_override: Option<Vec<String>>,
    resolved_order: Option<Vec<String>>,
    setup_state: SetupState,
    nonlinear_solver: Box<dyn NonlinearSolver>,
    linear_solver: Box<dyn LinearSolver>,
    compiled: Option<CompiledGroup>,
}

impl Default for Group {
    fn default() -> Self {
        Group::new()
    }
}

impl Group {
    pub fn new() -> Self {
        Group {
            path: String::new(),
            children: Vec::new(),
            promotes: HashMap::new(),
            explicit_connections: Vec::new(),
            order_override: None,
            resolved_order: None,
            setup_state: SetupState::Unbuilt,
            nonlinear_solver: Box::new(NonlinearSinglePass),
            linear_solver: Box::new(LinearBlockGaussSeidel::default()),
            compiled: None,
        }
    }

    /// Constructs the root of a composition tree. Identical to `new()`;
    /// named separately so root construction reads as `Group::root()`.
    pub fn root() -> Self {
        Group::new()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn add(&mut self, name: &str, system: impl Into<System>, promotes: Vec<String>) -> Result<()> {
        validate_local_name(name)?;
        if self.children.iter().any(|(n, _)| n == name) {
            let err = NamingError::DuplicateName(name.to_string());
            tracing::warn!(group = %self.path, %err, "add rejected");
            return Err(err.into());
        }
        self.children.push((name.to_string(), system.into()));
        if !promotes.is_empty() {
            self.promotes.insert(name.to_string(), promotes);
        }
        self.setup_state = SetupState::Unbuilt;
        Ok(())
    }

    pub fn connect(&mut self, source: &str, targets: &[&str], src_indices: Option<Vec<usize>>) -> Result<()> {
        self.explicit_connections.push(ExplicitConnection {
            source: source.to_string(),
            targets: targets.iter().map(|s| s.to_string()).collect(),
            src_indices,
        });
        self.setup_state = SetupState::Unbuilt;
        Ok(())
    }

    pub fn set_nonlinear_solver(&mut self, solver: Box<dyn NonlinearSolver>) {
        self.nonlinear_solver = solver;
    }

    pub fn set_linear_solver(&mut self, solver: Box<dyn LinearSolver>) {
        self.linear_solver = solver;
    }

    pub fn list_order(&self) -> Option<&[String]> {
        self.resolved_order.as_deref()
    }

    pub fn setup_state(&self) -> SetupState {
        self.setup_state
    }

    pub fn unknowns(&self) -> &VecWrapper {
        &self.compiled.as_ref().expect("setup() must run before access").unknowns
    }

    pub fn params(&self) -> &VecWrapper {
        &self.compiled.as_ref().expect("setup() must run before access").params_buf
    }

    pub fn resids(&self) -> &VecWrapper {
        &self.compiled.as_ref().expect("setup() must run before access").resids
    }

    pub fn unknown(&self, top_promoted_name: &str) -> Option<f64> {
        self.compiled.as_ref()?.unknowns.get_scalar(top_promoted_name).ok()
    }

    pub fn param(&self, top_promoted_name: &str) -> Option<f64> {
        self.compiled.as_ref()?.params_buf.get_scalar(top_promoted_name).ok()
    }

    // ---- promotion / collection -------------------------------------------------

    fn assign_paths(&mut self, prefix: &str) {
        self.path = prefix.to_string();
        for (name, child) in &mut self.children {
            let child_path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            match child {
                System::Component(c) => c.set_path(child_path),
                System::Group(g) => g.assign_paths(&child_path),
            }
        }
    }

    fn raw_vars(&self) -> Vec<RawVar> {
        let mut out = Vec::new();
        for (cname, child) in &self.children {
            let child_vars = match child {
                System::Component(c) => c
                    .declared_params()
                    .iter()
                    .chain(c.declared_outputs().iter())
                    .map(|v| RawVar {
                        rel_path: v.name.clone(),
                        visible_name: v.name.clone(),
                        kind: v.kind,
                        shape: v.shape.clone(),
                    })
                    .collect::<Vec<_>>(),
                System::Group(g) => g.raw_vars(),
            };
            let patterns = self.promotes.get(cname);
            for v in child_vars {
                let matched = patterns.is_some_and(|pats| pats.iter().any(|p| promotion_matches(p, &v.visible_name)));
                let new_visible = if matched {
                    v.visible_name.clone()
                } else {
                    format!("{cname}.{}", v.visible_name)
                };
                out.push(RawVar {
                    rel_path: format!("{cname}.{}", v.rel_path),
                    visible_name: new_visible,
                    kind: v.kind,
                    shape: v.shape,
                });
            }
        }
        out
    }

    fn collect_connections(&self) -> Vec<ExplicitConnection> {
        let mut out = self.explicit_connections.clone();
        for (_, child) in &self.children {
            if let System::Group(g) = child {
                out.extend(g.collect_connections());
            }
        }
        out
    }

    // ---- connection resolution ---------------------------------------------------

    fn resolve(
        raw: &[RawVar],
        explicit: &[ExplicitConnection],
    ) -> Result<(Vec<VariableMetadata>, Vec<VariableMetadata>, Vec<ResolvedConnection>)> {
        let mut sources = Vec::new();
        let mut params = Vec::new();
        let mut source_by_top: HashMap<String, Vec<usize>> = HashMap::new();
        let mut param_by_top: HashMap<String, Vec<usize>> = HashMap::new();

        for v in raw {
            let mut meta = VariableMetadata::new(v.rel_path.clone(), v.kind, v.shape.clone());
            // `promoted_name` doubles as the backing VecWrapper's index key;
            // since every buffer in this crate lives at the root group,
            // promoted_name and top_promoted_name collapse to the same
            // root-visible name (intermediate promotion levels aren't
            // separately tracked or buffered).
            meta.promoted_name = v.visible_name.clone();
            meta.top_promoted_name = v.visible_name.clone();
            meta.flags = VarFlags {
                state: v.kind == VarKind::State,
                ..VarFlags::default()
            };
            if v.kind.is_source() {
                source_by_top.entry(meta.top_promoted_name.clone()).or_default().push(sources.len());
                sources.push(meta);
            } else {
                param_by_top.entry(meta.top_promoted_name.clone()).or_default().push(params.len());
                params.push(meta);
            }
        }

        if let Some(dup) = source_by_top.iter().find(|(_, idxs)| idxs.len() > 1) {
            return Err(NamingError::DuplicateName(dup.0.clone()).into());
        }

        let mut target_source: HashMap<String, (String, Option<Vec<usize>>, bool)> = HashMap::new();

        // implicit (promotion-merged) connections
        for (top_name, pidxs) in &param_by_top {
            if let Some(sidxs) = source_by_top.get(top_name) {
                let src_path = sources[sidxs[0]].path.clone();
                for &pidx in pidxs {
                    target_source.insert(params[pidx].path.clone(), (src_path.clone(), None, false));
                }
            }
        }

        // explicit connections, overriding/validated against implicit ones
        for conn in explicit {
            let src_idxs = source_by_top
                .get(&conn.source)
                .ok_or_else(|| ConnectError::NonexistentSource(conn.source.clone()))?;
            let src_path = sources[src_idxs[0]].path.clone();
            for target in &conn.targets {
                let tgt_idxs = match param_by_top.get(target) {
                    Some(idxs) => idxs,
                    None => {
                        if source_by_top.contains_key(target) {
                            return Err(ConnectError::InvalidTarget(target.clone()).into());
                        }
                        return Err(ConnectError::NonexistentTarget(target.clone()).into());
                    }
                };
                for &tidx in tgt_idxs {
                    let tgt_path = params[tidx].path.clone();
                    let entry = target_source.get(&tgt_path).cloned();
                    if let Some((existing_src, existing_idx, was_explicit)) = entry {
                        if was_explicit {
                            return Err(ShapeError::DoubleIndicesSpecified {
                                src: existing_src,
                                target: tgt_path,
                            }
                            .into());
                        }
                        if existing_src != src_path && existing_idx.is_none() {
                            return Err(ConnectError::MultipleSources {
                                target: tgt_path,
                                explicit: src_path.clone(),
                                implied: existing_src,
                            }
                            .into());
                        }
                    }
                    target_source.insert(tgt_path, (src_path.clone(), conn.src_indices.clone(), true));
                }
            }
        }

        // validate src_indices bounds and attach to param metadata
        let mut resolved = Vec::new();
        for p in &mut params {
            if let Some((src_path, src_indices, _)) = target_source.get(&p.path) {
                if let Some(idxs) = src_indices {
                    let src_size = sources.iter().find(|s| &s.path == src_path).map(|s| s.size).unwrap_or(0);
                    if let Some(&bad) = idxs.iter().find(|&&i| i >= src_size) {
                        return Err(ShapeError::IndicesOutOfRange {
                            target: p.path.clone(),
                            src: src_path.clone(),
                            index: bad,
                            source_size: src_size,
                        }
                        .into());
                    }
                }
                p.src_indices = src_indices.clone();
                resolved.push(ResolvedConnection {
                    source: src_path.clone(),
                    target: p.path.clone(),
                    src_indices: src_indices.clone(),
                });
            }
        }

        Ok((sources, params, resolved))
    }

    // ---- order -----------------------------------------------------------------

    fn immediate_child<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
        let rel = if prefix.is_empty() {
            path
        } else {
            path.strip_prefix(prefix)?.strip_prefix('.')?
        };
        rel.split('.').next()
    }

    fn break_cycles(n: usize, mut edges: HashSet<(usize, usize)>) -> HashSet<(usize, usize)> {
        loop {
            let mut g = DiGraph::<(), ()>::new();
            let nodes: Vec<_> = (0..n).map(|_| g.add_node(())).collect();
            for &(a, b) in &edges {
                g.add_edge(nodes[a], nodes[b], ());
            }
            let sccs = tarjan_scc(&g);
            let mut broke_any = false;
            for scc in &sccs {
                if scc.len() > 1 {
                    broke_any = true;
                    let scc_set: HashSet<usize> = scc.iter().map(|ix| ix.index()).collect();
                    let mut best = usize::MAX;
                    let mut best_count: isize = -1;
                    for &node in &scc_set {
                        let count =
                            edges.iter().filter(|&&(a, b)| b == node && !scc_set.contains(&a)).count() as isize;
                        if count > best_count || (count == best_count && node < best) {
                            best_count = count;
                            best = node;
                        }
                    }
                    edges.retain(|&(a, b)| !(b == best && scc_set.contains(&a)));
                }
            }
            if !broke_any {
                break;
            }
        }
        edges
    }

    fn toposort_idxs(n: usize, edges: &HashSet<(usize, usize)>) -> Vec<usize> {
        let mut g = DiGraph::<(), ()>::new();
        let nodes: Vec<_> = (0..n).map(|_| g.add_node(())).collect();
        for &(a, b) in edges {
            g.add_edge(nodes[a], nodes[b], ());
        }
        toposort(&g, None)
            .expect("acyclic by construction")
            .into_iter()
            .map(|ix| ix.index())
            .collect()
    }

    fn establish_order(&mut self, connections: &[ResolvedConnection]) -> Result<()> {
        let names: Vec<String> = self.children.iter().map(|(n, _)| n.clone()).collect();
        let idx_of: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (n.as_str(), i)).collect();
        let mut edges = HashSet::new();
        for c in connections {
            if let (Some(sc), Some(tc)) = (Self::immediate_child(&c.source, &self.path), Self::immediate_child(&c.target, &self.path)) {
                if let (Some(&a), Some(&b)) = (idx_of.get(sc), idx_of.get(tc)) {
                    if a != b {
                        edges.insert((a, b));
                    }
                }
            }
        }

        let order = if let Some(ov) = &self.order_override {
            let mut seen = HashSet::new();
            let mut duplicates = Vec::new();
            for n in ov {
                if !seen.insert(n.as_str()) {
                    duplicates.push(n.clone());
                }
            }
            if !duplicates.is_empty() {
                return Err(OrderError::DuplicateOrder {
                    group: self.path.clone(),
                    duplicates,
                }
                .into());
            }
            let want: HashSet<&str> = ov.iter().map(String::as_str).collect();
            let have: HashSet<&str> = names.iter().map(String::as_str).collect();
            if want != have {
                return Err(OrderError::BadOrder {
                    group: self.path.clone(),
                    missing: have.difference(&want).map(|s| s.to_string()).collect(),
                    extra: want.difference(&have).map(|s| s.to_string()).collect(),
                }
                .into());
            }
            ov.clone()
        } else {
            let acyclic = Self::break_cycles(names.len(), edges);
            Self::toposort_idxs(names.len(), &acyclic).into_iter().map(|i| names[i].clone()).collect()
        };
        self.resolved_order = Some(order);

        for (_, child) in &mut self.children {
            if let System::Group(g) = child {
                g.establish_order(connections)?;
            }
        }
        Ok(())
    }

    pub fn set_order(&mut self, order: Vec<String>) -> Result<()> {
        self.order_override = Some(order);
        self.setup_state = SetupState::Unbuilt;
        Ok(())
    }

    // ---- setup -------------------------------------------------------------------

    pub fn setup(&mut self, comm: &dyn Communicator) -> Result<()> {
        self.assign_paths("");
        let raw = self.raw_vars();
        let explicit = self.collect_connections();
        let (sources, params, resolved) = Self::resolve(&raw, &explicit).inspect_err(|err| {
            tracing::warn!(group = %self.path, phase = "resolve", %err, "setup failed");
        })?;

        self.establish_order(&resolved).inspect_err(|err| {
            tracing::warn!(group = %self.path, phase = "establish_order", %err, "setup failed");
        })?;

        let resolved_targets: HashSet<&str> = resolved.iter().map(|r| r.target.as_str()).collect();
        let unconnected_params: Vec<String> = params
            .iter()
            .filter(|p| !resolved_targets.contains(p.path.as_str()))
            .map(|p| p.top_promoted_name.clone())
            .collect();

        let local_sizes: Vec<usize> = sources.iter().map(|s| s.size).collect();
        let u_sizes = SizesTable::new(comm.allgather(&local_sizes));
        let local_psizes: Vec<usize> = params.iter().map(|p| p.size).collect();
        let p_sizes = SizesTable::new(comm.allgather(&local_psizes));

        let mut unknowns = VecWrapper::empty(Flavor::Source);
        let mut resids = VecWrapper::empty(Flavor::Source);
        let mut io_maps: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut explicit_outputs_by_component: HashMap<String, Vec<String>> = HashMap::new();
        for s in &sources {
            unknowns.push_numeric(s.clone());
            resids.push_numeric(s.clone());
            let (parent, local) = split_parent(&s.path);
            io_maps.entry(parent.to_string()).or_default().insert(local.to_string(), s.top_promoted_name.clone());
            if s.kind == VarKind::Output {
                explicit_outputs_by_component.entry(parent.to_string()).or_default().push(s.top_promoted_name.clone());
            }
        }
        let mut params_buf = VecWrapper::empty(Flavor::Target);
        for p in &params {
            params_buf.push_numeric(p.clone());
            let (parent, local) = split_parent(&p.path);
            io_maps.entry(parent.to_string()).or_default().insert(local.to_string(), p.top_promoted_name.clone());
        }

        // seed initial values declared on components
        self.seed_initial_values(&mut unknowns, &io_maps);

        // index lookups by absolute path: paths are unique, unlike
        // top_promoted_name which may legitimately collide across merged
        // connections.
        let source_idx_by_path: HashMap<&str, usize> =
            sources.iter().enumerate().map(|(i, s)| (s.path.as_str(), i)).collect();
        let param_idx_by_path: HashMap<&str, usize> =
            params.iter().enumerate().map(|(i, p)| (p.path.as_str(), i)).collect();

        let mut fwd_by_owner_child: HashMap<(String, String), DataTransfer> = HashMap::new();
        let mut rev_by_owner_child: HashMap<(String, String), DataTransfer> = HashMap::new();

        for conn in &resolved {
            let src_var_idx = source_idx_by_path[conn.source.as_str()];
            let tgt_var_idx = param_idx_by_path[conn.target.as_str()];
            let src_meta = &sources[src_var_idx];
            let tgt_meta = &params[tgt_var_idx];
            let conv = tgt_meta.unit_conv_or_identity();
            let (tgt_component_path, _) = split_parent(&conn.target);
            let chain = ancestor_chain(tgt_component_path);

            for mode in [ScatterMode::Forward, ScatterMode::Reverse] {
                let ep = ConnectionEndpoints {
                    src_var_idx,
                    tgt_var_idx,
                    src_total_size: src_meta.size,
                    tgt_src_indices: conn.src_indices.as_deref(),
                    src_is_distributed: false,
                    owning_rank_of_src: 0,
                    owning_rank_of_tgt: 0,
                    src_remote_on_this_rank: false,
                    tgt_remote_on_this_rank: false,
                };
                let (s_idx, t_idx) = compute_global_idxs(&u_sizes, &p_sizes, &ep, mode, comm.rank());
                let table = match mode {
                    ScatterMode::Forward => &mut fwd_by_owner_child,
                    ScatterMode::Reverse => &mut rev_by_owner_child,
                };
                for (owner, child) in &chain {
                    table
                        .entry((owner.clone(), child.clone()))
                        .or_insert_with(|| DataTransfer::new(mode))
                        .push(s_idx.clone(), t_idx.clone(), conv);
                }
            }
        }

        let mut fwd_full_by_owner: HashMap<String, DataTransfer> = HashMap::new();
        for ((owner, _child), xfer) in &fwd_by_owner_child {
            let e = fwd_full_by_owner.entry(owner.clone()).or_insert_with(|| DataTransfer::new(ScatterMode::Forward));
            e.src_idx.extend_from_slice(&xfer.src_idx);
            e.tgt_idx.extend_from_slice(&xfer.tgt_idx);
            e.conv.extend_from_slice(&xfer.conv);
        }
        let mut rev_full_by_owner: HashMap<String, DataTransfer> = HashMap::new();
        for ((owner, _child), xfer) in &rev_by_owner_child {
            let e = rev_full_by_owner.entry(owner.clone()).or_insert_with(|| DataTransfer::new(ScatterMode::Reverse));
            e.src_idx.extend_from_slice(&xfer.src_idx);
            e.tgt_idx.extend_from_slice(&xfer.tgt_idx);
            e.conv.extend_from_slice(&xfer.conv);
        }

        self.compiled = Some(CompiledGroup {
            u_sizes,
            p_sizes,
            unknowns,
            resids,
            params_buf,
            io_maps,
            explicit_outputs_by_component,
            fwd_by_owner_child,
            rev_by_owner_child,
            fwd_full_by_owner,
            rev_full_by_owner,
            voi_buffers: HashMap::new(),
            unconnected_params,
        });
        self.close_component_setup();
        self.setup_state = SetupState::Built;
        Ok(())
    }

    fn close_component_setup(&mut self) {
        for (_, child) in &mut self.children {
            match child {
                System::Component(c) => c.close_setup(),
                System::Group(g) => g.close_component_setup(),
            }
        }
    }

    fn seed_initial_values(&self, unknowns: &mut VecWrapper, io_maps: &HashMap<String, HashMap<String, String>>) {
        for (_, child) in &self.children {
            match child {
                System::Component(c) => {
                    if let Some(map) = io_maps.get(c.path()) {
                        for v in c.declared_outputs() {
                            if let Some(initial) = &v.initial {
                                if let Some(top_name) = map.get(&v.name) {
                                    if let Some(slice) = unknowns.get_slice_mut(top_name) {
                                        let n = slice.len().min(initial.len());
                                        slice[..n].copy_from_slice(&initial[..n]);
                                    }
                                }
                            }
                        }
                    }
                }
                System::Group(g) => g.seed_initial_values(unknowns, io_maps),
            }
        }
    }

    // ---- execution -----------------------------------------------------------------

    pub fn solve_nonlinear(&mut self, comm: &dyn Communicator) -> Result<SolverStatus> {
        let mut solver = std::mem::replace(&mut self.nonlinear_solver, Box::new(NonlinearSinglePass));
        let result = solver.solve(self, comm);
        self.nonlinear_solver = solver;
        result
    }

    pub(crate) fn drive_children_solve_nonlinear(&mut self, comm: &dyn Communicator) -> Result<()> {
        let mut compiled = self.compiled.take().expect("setup() must run before solve_nonlinear");
        if let Err(err) = Self::check_unconnected_params(&self.path, &compiled) {
            self.compiled = Some(compiled);
            return Err(err);
        }
        let result =
            Self::exec_solve_nonlinear(&self.path.clone(), &mut self.children, self.resolved_order.as_deref(), &mut compiled, comm);
        self.compiled = Some(compiled);
        result
    }

    fn check_unconnected_params(group_path: &str, compiled: &CompiledGroup) -> Result<()> {
        if let Some(name) = compiled.unconnected_params.first() {
            let err = RuntimeError::UnconnectedParam(name.clone());
            tracing::warn!(group = %group_path, %err, "solve failed");
            return Err(err.into());
        }
        Ok(())
    }

    pub(crate) fn unknowns_raw_copy(&self) -> Vec<f64> {
        self.compiled.as_ref().map(|c| c.unknowns.raw().to_vec()).unwrap_or_default()
    }

    fn exec_solve_nonlinear(
        owner_path: &str,
        children: &mut [(String, System)],
        order: Option<&[String]>,
        compiled: &mut CompiledGroup,
        comm: &dyn Communicator,
    ) -> Result<()> {
        let seq: Vec<String> = match order {
            Some(o) => o.to_vec(),
            None => children.iter().map(|(n, _)| n.clone()).collect(),
        };
        for name in &seq {
            if let Some(t) = compiled.fwd_by_owner_child.get(&(owner_path.to_string(), name.clone())) {
                t.transfer(compiled.unknowns.raw_mut(), compiled.params_buf.raw_mut(), false);
            }
            let (_, sys) = children.iter_mut().find(|(n, _)| n == name).expect("child in execution order");
            match sys {
                System::Component(c) => {
                    let io_map = compiled.io_maps.get(c.path()).cloned().unwrap_or_default();
                    let mut io = ComponentIo::new(&io_map, &compiled.params_buf, &mut compiled.unknowns, &mut compiled.resids);
                    c.solve_nonlinear(&mut io)?;
                }
                System::Group(g) => {
                    let g_path = g.path().to_string();
                    Self::exec_solve_nonlinear(&g_path, &mut g.children, g.resolved_order.as_deref(), compiled, comm)?;
                }
            }
        }
        Ok(())
    }

    /// Runs one `linearize` pass over every component in execution order,
    /// caching each model's analytic [`crate::linalg::Jacobian`] (if any) for
    /// the dense fallback in [`Component::apply_linear`]. Must be called
    /// before a forward/reverse sweep if any component in the tree relies on
    /// `linearize` rather than an analytic `apply_linear`.
    pub fn linearize(&mut self) {
        let mut compiled = self.compiled.take().expect("setup() must run before linearize");
        Self::exec_linearize(&mut self.children, self.resolved_order.as_deref(), &mut compiled);
        self.compiled = Some(compiled);
    }

    fn exec_linearize(children: &mut [(String, System)], order: Option<&[String]>, compiled: &mut CompiledGroup) {
        let seq: Vec<String> = match order {
            Some(o) => o.to_vec(),
            None => children.iter().map(|(n, _)| n.clone()).collect(),
        };
        for name in &seq {
            let (_, sys) = children.iter_mut().find(|(n, _)| n == name).expect("child in execution order");
            match sys {
                System::Component(c) => {
                    let io_map = compiled.io_maps.get(c.path()).cloned().unwrap_or_default();
                    let io = ComponentIo::new(&io_map, &compiled.params_buf, &mut compiled.unknowns, &mut compiled.resids);
                    c.linearize(&io);
                }
                System::Group(g) => {
                    Self::exec_linearize(&mut g.children, g.resolved_order.as_deref(), compiled);
                }
            }
        }
    }

    pub fn apply_nonlinear(&mut self, comm: &dyn Communicator) -> Result<()> {
        let mut compiled = self.compiled.take().expect("setup() must run before apply_nonlinear");
        if let Err(err) = Self::check_unconnected_params(&self.path, &compiled) {
            self.compiled = Some(compiled);
            return Err(err);
        }
        let result = Self::exec_apply_nonlinear(&self.path.clone(), &mut self.children, self.resolved_order.as_deref(), &mut compiled, comm);
        self.compiled = Some(compiled);
        result
    }

    fn exec_apply_nonlinear(
        owner_path: &str,
        children: &mut [(String, System)],
        order: Option<&[String]>,
        compiled: &mut CompiledGroup,
        comm: &dyn Communicator,
    ) -> Result<()> {
        let seq: Vec<String> = match order {
            Some(o) => o.to_vec(),
            None => children.iter().map(|(n, _)| n.clone()).collect(),
        };
        for name in &seq {
            if let Some(t) = compiled.fwd_by_owner_child.get(&(owner_path.to_string(), name.clone())) {
                t.transfer(compiled.unknowns.raw_mut(), compiled.params_buf.raw_mut(), false);
            }
            let (_, sys) = children.iter_mut().find(|(n, _)| n == name).expect("child in execution order");
            match sys {
                System::Component(c) => {
                    let io_map = compiled.io_maps.get(c.path()).cloned().unwrap_or_default();
                    let mut io = ComponentIo::new(&io_map, &compiled.params_buf, &mut compiled.unknowns, &mut compiled.resids);
                    c.apply_nonlinear(&mut io)?;
                }
                System::Group(g) => {
                    let g_path = g.path().to_string();
                    Self::exec_apply_nonlinear(&g_path, &mut g.children, g.resolved_order.as_deref(), compiled, comm)?;
                }
            }
        }
        Ok(())
    }

    /// Runs one forward/reverse linear-apply sweep over the whole tree. This
    /// is the raw operator a [`crate::solver::linear::LinearSolver`]
    /// iterates to solve a linear system; calling it directly just
    /// evaluates `A(x)` (forward) or `A^T(x)` (reverse) once.
    pub fn apply_linear(&mut self, mode: ScatterMode, voi: &Voi, comm: &dyn Communicator) -> Result<()> {
        self.run_apply_linear(mode, voi, comm)
    }

    pub(crate) fn run_apply_linear(&mut self, mode: ScatterMode, voi: &Voi, comm: &dyn Communicator) -> Result<()> {
        let mut compiled = self.compiled.take().expect("setup() must run before apply_linear");
        if let Err(err) = Self::check_unconnected_params(&self.path, &compiled) {
            self.compiled = Some(compiled);
            return Err(err);
        }
        compiled.ensure_voi(voi);
        let result =
            Self::exec_apply_linear(&self.path.clone(), &mut self.children, self.resolved_order.as_deref(), &mut compiled, mode, voi, None, comm);
        self.compiled = Some(compiled);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn exec_apply_linear(
        owner_path: &str,
        children: &mut [(String, System)],
        order: Option<&[String]>,
        compiled: &mut CompiledGroup,
        mode: ScatterMode,
        voi: &Voi,
        gs_outputs: Option<&HashSet<String>>,
        comm: &dyn Communicator,
    ) -> Result<()> {
        let seq: Vec<String> = match order {
            Some(o) => o.to_vec(),
            None => children.iter().map(|(n, _)| n.clone()).collect(),
        };

        match mode {
            ScatterMode::Forward => {
                for name in &seq {
                    if let Some(t) = compiled.fwd_by_owner_child.get(&(owner_path.to_string(), name.clone())) {
                        let (du, _dr, dp) = compiled.voi_buffers.get_mut(voi).expect("voi buffers ensured");
                        t.transfer(du.raw_mut(), dp.raw_mut(), true);
                    }
                    let (_, sys) = children.iter_mut().find(|(n, _)| n == name).expect("child in execution order");
                    match sys {
                        System::Component(c) => {
                            Self::apply_linear_to_component(c, compiled, mode, voi, gs_outputs)?;
                        }
                        System::Group(g) => {
                            let g_path = g.path().to_string();
                            Self::exec_apply_linear(&g_path, &mut g.children, g.resolved_order.as_deref(), compiled, mode, voi, gs_outputs, comm)?;
                        }
                    }
                }
            }
            ScatterMode::Reverse => {
                for name in &seq {
                    let (_, sys) = children.iter_mut().find(|(n, _)| n == name).expect("child in execution order");
                    match sys {
                        System::Component(c) => {
                            Self::apply_linear_to_component(c, compiled, mode, voi, gs_outputs)?;
                        }
                        System::Group(g) => {
                            let g_path = g.path().to_string();
                            Self::exec_apply_linear(&g_path, &mut g.children, g.resolved_order.as_deref(), compiled, mode, voi, gs_outputs, comm)?;
                        }
                    }
                }
                if let Some(t) = compiled.rev_full_by_owner.get(owner_path) {
                    let (du, _dr, dp) = compiled.voi_buffers.get_mut(voi).expect("voi buffers ensured");
                    t.transfer(du.raw_mut(), dp.raw_mut(), true);
                }
            }
        }
        Ok(())
    }

    fn apply_linear_to_component(
        c: &mut Component,
        compiled: &mut CompiledGroup,
        mode: ScatterMode,
        voi: &Voi,
        gs_outputs: Option<&HashSet<String>>,
    ) -> Result<()> {
        let io_map = compiled.io_maps.get(c.path()).cloned().unwrap_or_default();
        {
            let (du, dr, dp) = compiled.voi_buffers.get_mut(voi).expect("voi buffers ensured");
            let mut dio = DerivIo::new(&io_map, dp, du, dr);
            c.apply_linear(mode, &mut dio)?;
        }
        let outputs = compiled.explicit_outputs_by_component.get(c.path()).cloned().unwrap_or_default();
        let (du, dr, _dp) = compiled.voi_buffers.get_mut(voi).expect("voi buffers ensured");
        for pn in &outputs {
            if let Some(mask) = gs_outputs {
                if !mask.contains(pn) {
                    continue;
                }
            }
            match mode {
                ScatterMode::Forward => {
                    let u = du.get_slice(pn).map(<[f64]>::to_vec).unwrap_or_default();
                    if let Some(r) = dr.get_slice_mut(pn) {
                        for (ri, ui) in r.iter_mut().zip(&u) {
                            *ri += ui;
                        }
                    }
                }
                ScatterMode::Reverse => {
                    let r = dr.get_slice(pn).map(<[f64]>::to_vec).unwrap_or_default();
                    if let Some(u) = du.get_slice_mut(pn) {
                        for (ui, ri) in u.iter_mut().zip(&r) {
                            *ui += ri;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Solves `A x = rhs` for the given mode/VOI, where `rhs` is whichever
    /// of `dr` (forward) / `du` (reverse) the caller has already populated.
    /// Short-circuits to a zero solution when the RHS norm is below
    /// `tolerance`.
    pub fn solve_linear(&mut self, voi: &Voi, mode: ScatterMode, tolerance: f64, comm: &dyn Communicator) -> Result<SolverStatus> {
        {
            let (du, dr, _dp) = self.voi_buffer_mut(voi);
            let rhs_norm = match mode {
                ScatterMode::Forward => dr.norm(),
                ScatterMode::Reverse => du.norm(),
            };
            if rhs_norm < tolerance {
                match mode {
                    ScatterMode::Forward => du.zero(),
                    ScatterMode::Reverse => dr.zero(),
                }
                return Ok(SolverStatus::Converged { iterations: 0 });
            }
        }
        let mut linear_solver = std::mem::replace(&mut self.linear_solver, Box::new(LinearBlockGaussSeidel::default()));
        let result = linear_solver.solve(self, voi, mode, comm);
        self.linear_solver = linear_solver;
        result
    }

    pub(crate) fn voi_buffer_mut(&mut self, voi: &Voi) -> (&mut VecWrapper, &mut VecWrapper, &mut VecWrapper) {
        let compiled = self.compiled.as_mut().expect("setup() must run before accessing differential buffers");
        compiled.ensure_voi(voi);
        let (du, dr, dp) = compiled.voi_buffers.get_mut(voi).expect("voi buffers ensured");
        (du, dr, dp)
    }
}
