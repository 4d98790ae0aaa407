//! Error taxonomy.
//!
//! Every family mirrors a phase of the setup/runtime lifecycle: naming
//! errors during variable registration, connect errors during connection
//! resolution, shape errors during layout, order errors when overriding
//! execution order, and runtime errors raised while the tree is executing.
//! All are fail-fast: setup errors abort `setup()`, runtime errors propagate
//! through `solve_nonlinear`/`apply_linear` uncaught.

use thiserror::Error;

/// Errors raised while a [`crate::system::component::Component`] registers
/// its variables.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NamingError {
    #[error("duplicate variable name '{0}'")]
    DuplicateName(String),

    #[error("invalid variable name '{0}': names may not contain '.' or '/'")]
    InvalidName(String),

    #[error("cannot add variable '{0}': setup has already closed this system")]
    SetupClosed(String),
}

/// Errors raised while resolving explicit or promotion-implied connections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("connection source '{0}' does not resolve to any variable")]
    NonexistentSource(String),

    #[error("connection target '{0}' does not resolve to any variable")]
    NonexistentTarget(String),

    #[error("connection target '{0}' resolves to a source-typed (output/state) variable")]
    InvalidTarget(String),

    #[error(
        "target '{target}' has conflicting sources: explicit connection names '{explicit}' \
         but promotion implies '{implied}'"
    )]
    MultipleSources {
        target: String,
        explicit: String,
        implied: String,
    },
}

/// Errors raised while computing variable shapes and indices.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("variable '{0}' has neither an initial value nor an explicit shape")]
    MissingShape(String),

    #[error(
        "src_indices for target '{target}' reference index {index}, which is out of range \
         for source '{src}' of size {source_size}"
    )]
    IndicesOutOfRange {
        target: String,
        src: String,
        index: usize,
        source_size: usize,
    },

    #[error(
        "connection '{src}' -> '{target}' specifies src_indices on both endpoints; \
         the composition of a source-side and target-side src_indices selection is \
         ambiguous and must be expressed as a single target-side selection"
    )]
    DoubleIndicesSpecified { src: String, target: String },
}

/// Errors raised by [`crate::system::group::Group::set_order`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderError {
    #[error(
        "new order is not a permutation of current children of '{group}': \
         missing {missing:?}, extra {extra:?}"
    )]
    BadOrder {
        group: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },

    #[error("duplicate name(s) found in order list for '{group}': {duplicates:?}")]
    DuplicateOrder {
        group: String,
        duplicates: Vec<String>,
    },
}

/// Errors raised while the tree is executing (after a successful `setup()`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("attempted to read remote variable '{0}' on a rank that does not own it")]
    RemoteAccess(String),

    #[error("parameter '{0}' has no connected source at solve time")]
    UnconnectedParam(String),

    #[error("component '{component}' does not implement required method '{method}'")]
    NotImplemented { component: String, method: String },
}

/// Top-level error type aggregating every family above.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Naming(#[from] NamingError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
