//! Configuration system.
//!
//! Loads process-wide tunables (solver defaults, numeric tolerances, logging)
//! from `mdao.toml`, an optional `mdao.local.toml` override, and environment
//! variables under the `MDAO_` prefix.
//!
//! ## Example
//!
//! ```toml
//! # mdao.toml
//! [solver]
//! default_nonlinear_maxiter = 50
//! default_linear_maxiter = 100
//! zero_rhs_tolerance = 1e-15
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! MDAO_SOLVER__DEFAULT_NONLINEAR_MAXITER=100
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub solver: SolverConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Defaults consulted by solvers that do not have an explicit per-call
/// override; individual solver instances may still be constructed with
/// their own values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_nl_maxiter")]
    pub default_nonlinear_maxiter: usize,

    #[serde(default = "default_ln_maxiter")]
    pub default_linear_maxiter: usize,

    /// RHS vectors with L2 norm below this are treated as exactly zero by
    /// `solve_linear`.
    #[serde(default = "default_zero_rhs_tolerance")]
    pub zero_rhs_tolerance: f64,

    #[serde(default = "default_atol")]
    pub default_atol: f64,

    #[serde(default = "default_rtol")]
    pub default_rtol: f64,
}

fn default_nl_maxiter() -> usize {
    20
}
fn default_ln_maxiter() -> usize {
    100
}
fn default_zero_rhs_tolerance() -> f64 {
    1e-15
}
fn default_atol() -> f64 {
    1e-10
}
fn default_rtol() -> f64 {
    1e-10
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            default_nonlinear_maxiter: default_nl_maxiter(),
            default_linear_maxiter: default_ln_maxiter(),
            zero_rhs_tolerance: default_zero_rhs_tolerance(),
            default_atol: default_atol(),
            default_rtol: default_rtol(),
        }
    }
}

/// Logging configuration consumed by [`crate::init_tracing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            solver: SolverConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration by layering, in order: built-in defaults,
    /// `mdao.toml`, `mdao.local.toml`, then `MDAO_*` environment variables.
    pub fn load() -> crate::error::Result<Self> {
        Figment::from(figment::providers::Serialized::defaults(Config::default()))
            .merge(Toml::file("mdao.toml"))
            .merge(Toml::file("mdao.local.toml"))
            .merge(Env::prefixed("MDAO_").split("__"))
            .extract()
            .map_err(|e| crate::error::Error::Config(e.to_string()))
    }
}
