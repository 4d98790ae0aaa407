//! # mdao-core
//!
//! A hierarchical system composition engine for multidisciplinary analysis
//! and optimization, grounded on `openmdao.core` (Python). A model is a tree
//! of [`system::Component`] leaves composed into [`system::Group`] internal
//! nodes; variables are promoted up the tree by glob pattern, connected
//! implicitly (promotion merge) or explicitly (`Group::connect`), and laid
//! out into flat `unknowns`/`resids`/`params` buffers once [`system::Group::setup`]
//! runs.
//!
//! ## Pipeline
//!
//! ```text
//! Group::add / Group::connect     → declare the tree (Unbuilt)
//!     ↓
//! Group::setup(comm)              → promote, resolve connections, order,
//!                                    allocate buffers, build transfers (Built)
//!     ↓
//! Group::solve_nonlinear(comm)    → drive children, converge states
//!     ↓
//! Group::apply_linear / solve_linear → forward/reverse total derivatives
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mdao_core::{Problem, system::{Component, Group}, variable::Shape};
//!
//! let mut root = Group::root();
//! root.add("indep", Component::indep_var("x", Shape::scalar(), vec![3.0])?, vec!["*".to_string()])?;
//! // ... add further components, connect them ...
//!
//! let mut problem = Problem::new(root);
//! problem.run_model()?;
//! let totals = problem.calc_gradient(&["y"], &["x"], mdao_core::problem::GradientMode::Forward)?;
//! ```
//!
//! ## Non-goals
//!
//! Finite-difference/complex-step derivative approximation, file-based case
//! recording, and a real MPI transport binding are all out of scope; see the
//! crate's `DESIGN.md` for the full list of scope cuts and why.

pub mod comm;
pub mod config;
pub mod error;
pub mod linalg;
pub mod problem;
pub mod recorder;
pub mod relevance;
pub mod solver;
pub mod system;
pub mod transfer;
pub mod variable;
pub mod vecwrapper;

pub use config::Config;
pub use error::{Error, Result};
pub use problem::{GradientMode, Problem};
pub use recorder::{InMemoryRecorder, Recorder};
pub use system::{Component, Group, System};

/// Installs a global `tracing` subscriber filtered by `config.logging.level`,
/// overridable by `RUST_LOG`. Call once, near the start of `main`.
pub fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
