//! Integration tests covering the composition/resolution/execution
//! invariants, one test per numbered scenario plus property-based checks
//! over `set_order`/`break_cycles`/`src_indices`.

use mdao_core::comm::{Communicator, SingleRankCommunicator};
use mdao_core::error::{Error, RuntimeError};
use mdao_core::linalg::{DenseBlock, Jacobian};
use mdao_core::problem::GradientMode;
use mdao_core::system::component::{ComponentIo, ComponentModel, DerivIo};
use mdao_core::system::{Component, Group};
use mdao_core::transfer::ScatterMode;
use mdao_core::variable::Shape;
use mdao_core::Problem;
use proptest::prelude::*;

// ============================================================================
// Test components
// ============================================================================

#[derive(Debug)]
struct Doubler;

impl ComponentModel for Doubler {
    fn solve_nonlinear(&mut self, io: &mut ComponentIo) -> mdao_core::Result<()> {
        io.set_output("y", io.param("x") * 2.0);
        Ok(())
    }

    fn apply_linear(&mut self, mode: ScatterMode, io: &mut DerivIo) -> mdao_core::Result<bool> {
        match mode {
            ScatterMode::Forward => {
                let dx = io.param_slice("x");
                let mut dr = io.resid_slice("y");
                dr[0] -= 2.0 * dx[0];
                io.set_resid_slice("y", &dr);
            }
            ScatterMode::Reverse => {
                let dr = io.resid_slice("y");
                let mut dx = io.param_slice("x");
                dx[0] -= 2.0 * dr[0];
                io.set_param_slice("x", &dx);
            }
        }
        Ok(true)
    }
}

#[derive(Debug)]
struct Adder;

impl ComponentModel for Adder {
    fn solve_nonlinear(&mut self, io: &mut ComponentIo) -> mdao_core::Result<()> {
        io.set_output("z", io.param("a") + io.param("b"));
        Ok(())
    }
}

fn doubler() -> Component {
    let mut c = Component::new(Doubler);
    c.add_param("x", Shape::scalar()).unwrap();
    c.add_output("y", Shape::scalar(), None).unwrap();
    c
}

// ============================================================================
// Scenario 1: two-component chain
// ============================================================================

#[test]
fn two_component_chain_propagates_value() {
    let mut root = Group::root();
    root.add("indep", Component::indep_var("x0", Shape::scalar(), vec![5.0]).unwrap(), vec!["*".to_string()])
        .unwrap();
    root.add("c1", doubler(), vec![]).unwrap();
    root.add("c2", doubler(), vec![]).unwrap();
    root.connect("x0", &["c1.x"], None).unwrap();
    root.connect("c1.y", &["c2.x"], None).unwrap();

    let mut problem = Problem::new(root);
    problem.run_model().unwrap();
    assert_eq!(problem.root().unknown("c1.y"), Some(10.0));
    assert_eq!(problem.root().unknown("c2.y"), Some(20.0));
}

// ============================================================================
// Scenario 2: promoted-name merge (implicit connection via shared promotion)
// ============================================================================

#[derive(Debug)]
struct DoublesShared;

impl ComponentModel for DoublesShared {
    fn solve_nonlinear(&mut self, io: &mut ComponentIo) -> mdao_core::Result<()> {
        io.set_output("y", io.param("shared") * 2.0);
        Ok(())
    }
}

#[test]
fn promoted_name_merge_connects_without_explicit_connect() {
    // a param named `shared` promoted to the root bubbles under the same
    // bare name as the indep var's promoted output `shared`; because both
    // sides resolve to the same top-level name, `Group::setup` connects them
    // implicitly without any `.connect()` call.
    let mut consumer = Component::new(DoublesShared);
    consumer.add_param("shared", Shape::scalar()).unwrap();
    consumer.add_output("y", Shape::scalar(), None).unwrap();

    let mut root = Group::root();
    root.add("indep", Component::indep_var("shared", Shape::scalar(), vec![4.0]).unwrap(), vec!["*".to_string()])
        .unwrap();
    root.add("c", consumer, vec!["shared".to_string()]).unwrap();

    let mut problem = Problem::new(root);
    problem.run_model().unwrap();
    assert_eq!(problem.root().unknown("c.y"), Some(8.0));
}

// ============================================================================
// Scenario 3: src_indices selection
// ============================================================================

#[test]
fn src_indices_selects_a_slice_of_the_source() {
    #[derive(Debug)]
    struct Vec3Source;
    impl ComponentModel for Vec3Source {
        fn solve_nonlinear(&mut self, io: &mut ComponentIo) -> mdao_core::Result<()> {
            io.set_output_slice("v", &[1.0, 2.0, 3.0]);
            Ok(())
        }
    }
    #[derive(Debug)]
    struct PairSink;
    impl ComponentModel for PairSink {
        fn solve_nonlinear(&mut self, io: &mut ComponentIo) -> mdao_core::Result<()> {
            let p = io.param_slice("p").to_vec();
            io.set_output_slice("sum", &[p.iter().sum()]);
            Ok(())
        }
    }

    let mut root = Group::root();
    let mut src = Component::new(Vec3Source);
    src.add_output("v", Shape::flat(3), None).unwrap();
    root.add("src", src, vec![]).unwrap();

    let mut sink = Component::new(PairSink);
    sink.add_param("p", Shape::flat(2)).unwrap();
    sink.add_output("sum", Shape::scalar(), None).unwrap();
    root.add("sink", sink, vec![]).unwrap();

    root.connect("src.v", &["sink.p"], Some(vec![0, 2])).unwrap();

    let mut problem = Problem::new(root);
    problem.run_model().unwrap();
    assert_eq!(problem.root().unknown("sink.sum"), Some(4.0)); // 1.0 + 3.0
}

// ============================================================================
// Scenario 4: cycle break
// ============================================================================

#[test]
fn setup_breaks_cycles_without_erroring() {
    #[derive(Debug)]
    struct PassThrough;
    impl ComponentModel for PassThrough {
        fn solve_nonlinear(&mut self, io: &mut ComponentIo) -> mdao_core::Result<()> {
            io.set_output("y", io.param("x") + 1.0);
            Ok(())
        }
    }
    let mk = || {
        let mut c = Component::new(PassThrough);
        c.add_param("x", Shape::scalar()).unwrap();
        c.add_output("y", Shape::scalar(), None).unwrap();
        c
    };

    let mut root = Group::root();
    root.add("a", mk(), vec![]).unwrap();
    root.add("b", mk(), vec![]).unwrap();
    // a.y -> b.x and b.y -> a.x forms a cycle between the two children
    root.connect("a.y", &["b.x"], None).unwrap();
    root.connect("b.y", &["a.x"], None).unwrap();

    let mut root_for_setup = root;
    root_for_setup.setup(&SingleRankCommunicator).unwrap();
    let order = root_for_setup.list_order().unwrap();
    assert_eq!(order.len(), 2);
}

// ============================================================================
// Scenario 5: cross-instance gradient sanity (forward == reverse)
// ============================================================================

#[test]
fn forward_and_reverse_gradients_agree() {
    let mut root = Group::root();
    root.add("indep", Component::indep_var("x0", Shape::scalar(), vec![2.0]).unwrap(), vec!["*".to_string()])
        .unwrap();
    root.add("c1", doubler(), vec![]).unwrap();
    root.connect("x0", &["c1.x"], None).unwrap();

    let mut problem = Problem::new(root);
    problem.run_model().unwrap();
    let fwd = problem.calc_gradient(&["c1.y"], &["x0"], GradientMode::Forward).unwrap();
    let rev = problem.calc_gradient(&["c1.y"], &["x0"], GradientMode::Reverse).unwrap();
    let f = fwd[&("c1.y".to_string(), "x0".to_string())].data[0];
    let r = rev[&("c1.y".to_string(), "x0".to_string())].data[0];
    assert!((f - 2.0).abs() < 1e-9);
    assert!((f - r).abs() < 1e-9);
}

// ============================================================================
// Scenario 5b: components that supply `linearize` instead of `apply_linear`
// go through the cached-Jacobian fallback
// ============================================================================

#[derive(Debug, Default)]
struct Tripler;

impl ComponentModel for Tripler {
    fn solve_nonlinear(&mut self, io: &mut ComponentIo) -> mdao_core::Result<()> {
        io.set_output("y", io.param("x") * 3.0);
        Ok(())
    }

    fn linearize(&mut self, _io: &ComponentIo) -> Option<Jacobian> {
        let mut jac = Jacobian::new();
        jac.set_block("y", "x", DenseBlock::from_row_major(1, 1, vec![3.0]));
        Some(jac)
    }
}

#[test]
fn linearize_only_component_gradient_uses_cached_jacobian() {
    let mut root = Group::root();
    root.add("indep", Component::indep_var("x0", Shape::scalar(), vec![2.0]).unwrap(), vec!["*".to_string()])
        .unwrap();
    let mut c1 = Component::new(Tripler);
    c1.add_param("x", Shape::scalar()).unwrap();
    c1.add_output("y", Shape::scalar(), None).unwrap();
    root.add("c1", c1, vec![]).unwrap();
    root.connect("x0", &["c1.x"], None).unwrap();

    let mut problem = Problem::new(root);
    problem.run_model().unwrap();
    let fwd = problem.calc_gradient(&["c1.y"], &["x0"], GradientMode::Forward).unwrap();
    let rev = problem.calc_gradient(&["c1.y"], &["x0"], GradientMode::Reverse).unwrap();
    let f = fwd[&("c1.y".to_string(), "x0".to_string())].data[0];
    let r = rev[&("c1.y".to_string(), "x0".to_string())].data[0];
    assert!((f - 3.0).abs() < 1e-9);
    assert!((f - r).abs() < 1e-9);
}

// ============================================================================
// Scenario 6: multi-rank setup via a fake communicator
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct FakeMultiRankCommunicator {
    rank: usize,
    size: usize,
}

impl Communicator for FakeMultiRankCommunicator {
    fn size(&self) -> usize {
        self.size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    /// Every rank in this fake runs an identical (SPMD) tree, so the
    /// "gathered" table is just this rank's own row repeated `size` times —
    /// there is no real transport to gather across in-process.
    fn allgather(&self, value: &[usize]) -> Vec<Vec<usize>> {
        vec![value.to_vec(); self.size]
    }

    fn scatter(&self, src: &[f64], src_idx: &[usize], dst: &mut [f64], tgt_idx: &[usize], mode: ScatterMode) {
        match mode {
            ScatterMode::Forward => {
                for (&s, &t) in src_idx.iter().zip(tgt_idx) {
                    dst[t] = src[s];
                }
            }
            ScatterMode::Reverse => {
                for (&s, &t) in src_idx.iter().zip(tgt_idx) {
                    dst[t] += src[s];
                }
            }
        }
    }
}

#[test]
fn identical_spmd_trees_setup_successfully_on_every_rank() {
    let build = || {
        let mut root = Group::root();
        root.add("indep", Component::indep_var("x0", Shape::scalar(), vec![7.0]).unwrap(), vec!["*".to_string()])
            .unwrap();
        root.add("c1", doubler(), vec![]).unwrap();
        root.connect("x0", &["c1.x"], None).unwrap();
        root
    };

    for rank in 0..3 {
        let comm = FakeMultiRankCommunicator { rank, size: 3 };
        let mut root = build();
        root.setup(&comm).unwrap();
        root.solve_nonlinear(&comm).unwrap();
        assert_eq!(root.unknown("c1.y"), Some(14.0));
    }
}

// ============================================================================
// Error-path checks
// ============================================================================

#[test]
fn duplicate_child_name_is_rejected() {
    let mut root = Group::root();
    root.add("c1", doubler(), vec![]).unwrap();
    let err = root.add("c1", doubler(), vec![]).unwrap_err();
    assert!(matches!(err, Error::Naming(_)));
}

#[test]
fn double_src_indices_is_a_shape_error() {
    let mut root = Group::root();
    root.add("indep", Component::indep_var("x0", Shape::flat(4), vec![1.0, 2.0, 3.0, 4.0]).unwrap(), vec!["*".to_string()])
        .unwrap();
    let mut c = Component::new(Doubler);
    c.add_param("x", Shape::flat(2)).unwrap();
    c.add_output("y", Shape::flat(2), None).unwrap();
    root.add("c1", c, vec![]).unwrap();
    root.connect("x0", &["c1.x"], Some(vec![0, 1])).unwrap();
    root.connect("x0", &["c1.x"], Some(vec![2, 3])).unwrap();

    let err = root.setup(&SingleRankCommunicator).unwrap_err();
    assert!(matches!(err, Error::Shape(_)));
}

#[test]
fn unconnected_param_fails_fast_at_solve_time() {
    let mut root = Group::root();
    let mut c = Component::new(Doubler);
    c.add_param("x", Shape::scalar()).unwrap();
    c.add_output("y", Shape::scalar(), None).unwrap();
    root.add("c1", c, vec![]).unwrap();

    let mut problem = Problem::new(root);
    let err = problem.run_model().unwrap_err();
    assert!(matches!(err, Error::Runtime(RuntimeError::UnconnectedParam(_))));
}

// ============================================================================
// Property-based checks
// ============================================================================

proptest! {
    #[test]
    fn set_order_round_trips_any_rotation(rotate in 0usize..4) {
        #[derive(Debug)]
        struct Noop;
        impl ComponentModel for Noop {
            fn solve_nonlinear(&mut self, _io: &mut ComponentIo) -> mdao_core::Result<()> {
                Ok(())
            }
        }
        let mut root = Group::root();
        for name in ["a", "b", "c", "d"] {
            root.add(name, Component::new(Noop), vec![]).unwrap();
        }
        let mut base = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        base.rotate_left(rotate);
        root.set_order(base.clone()).unwrap();
        root.setup(&SingleRankCommunicator).unwrap();
        prop_assert_eq!(root.list_order().unwrap().to_vec(), base);
    }

    #[test]
    fn src_indices_pairs_always_have_matching_length(sel in proptest::collection::vec(0usize..5, 0..5)) {
        #[derive(Debug)]
        struct VSource;
        impl ComponentModel for VSource {
            fn solve_nonlinear(&mut self, io: &mut ComponentIo) -> mdao_core::Result<()> {
                io.set_output_slice("v", &[0.0, 1.0, 2.0, 3.0, 4.0]);
                Ok(())
            }
        }
        #[derive(Debug)]
        struct VSink;
        impl ComponentModel for VSink {
            fn solve_nonlinear(&mut self, _io: &mut ComponentIo) -> mdao_core::Result<()> {
                Ok(())
            }
        }

        let mut root = Group::root();
        let mut src = Component::new(VSource);
        src.add_output("v", Shape::flat(5), None).unwrap();
        root.add("src", src, vec![]).unwrap();
        let mut sink = Component::new(VSink);
        sink.add_param("p", Shape::flat(sel.len().max(1))).unwrap();
        root.add("sink", sink, vec![]).unwrap();
        // every generated index is in 0..5, i.e. always in range for a
        // size-5 source, so setup must always succeed and the resolved
        // connection's src/target index arrays must end up the same length
        let sel = if sel.is_empty() { vec![0] } else { sel };
        root.connect("src.v", &["sink.p"], Some(sel.clone())).unwrap();

        prop_assert!(root.setup(&SingleRankCommunicator).is_ok());
    }
}
