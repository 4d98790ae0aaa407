//! # mdao CLI
//!
//! Builds a chain of linear components (`y = slope * x + intercept`) from a
//! TOML model description, runs it, and optionally reports total
//! derivatives. A thin demonstration harness over [`mdao_core::Problem`];
//! see `demos/chain.toml` for the model format.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin mdao -- run demos/chain.toml
//! cargo run --bin mdao -- grad demos/chain.toml --of c2.y --wrt x0
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mdao_core::problem::GradientMode;
use mdao_core::system::component::{ComponentIo, ComponentModel, DerivIo};
use mdao_core::system::{Component, Group};
use mdao_core::transfer::ScatterMode;
use mdao_core::variable::Shape;
use mdao_core::{init_tracing, Config, Problem};
use serde::Deserialize;
use tracing::info;

#[derive(Parser)]
#[command(name = "mdao", about = "Drives a chain model described by a TOML file")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the model to convergence and print every unknown.
    Run { model: String },
    /// Run the model, then report d(of)/d(wrt).
    Grad {
        model: String,
        #[arg(long)]
        of: String,
        #[arg(long)]
        wrt: String,
        #[arg(long, value_enum, default_value = "forward")]
        mode: GradMode,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum GradMode {
    Forward,
    Reverse,
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    #[serde(default)]
    indep: Vec<IndepSpec>,
    #[serde(default)]
    component: Vec<LinearSpec>,
}

#[derive(Debug, Deserialize)]
struct IndepSpec {
    name: String,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct LinearSpec {
    name: String,
    input: String,
    slope: f64,
    intercept: f64,
}

/// `y = slope * x + intercept`, grounded on `openmdao.test_suite`'s
/// canonical single-param/single-output demo components.
#[derive(Debug)]
struct Linear {
    slope: f64,
    intercept: f64,
}

impl ComponentModel for Linear {
    fn solve_nonlinear(&mut self, io: &mut ComponentIo) -> mdao_core::Result<()> {
        let x = io.param("x");
        io.set_output("y", self.slope * x + self.intercept);
        Ok(())
    }

    fn apply_linear(&mut self, mode: ScatterMode, io: &mut DerivIo) -> mdao_core::Result<bool> {
        match mode {
            ScatterMode::Forward => {
                let dx = io.param_slice("x");
                let mut dr = io.resid_slice("y");
                dr[0] -= self.slope * dx[0];
                io.set_resid_slice("y", &dr);
            }
            ScatterMode::Reverse => {
                let dr = io.resid_slice("y");
                let mut dx = io.param_slice("x");
                dx[0] -= self.slope * dr[0];
                io.set_param_slice("x", &dx);
            }
        }
        Ok(true)
    }
}

fn build_root(model: &ModelFile) -> Result<Group> {
    let mut root = Group::root();
    for indep in &model.indep {
        let comp = Component::indep_var(&indep.name, Shape::scalar(), vec![indep.value])
            .with_context(|| format!("declaring indep var '{}'", indep.name))?;
        root.add(&indep.name, comp, vec!["*".to_string()])?;
    }
    for spec in &model.component {
        let mut comp = Component::new(Linear {
            slope: spec.slope,
            intercept: spec.intercept,
        });
        comp.add_param("x", Shape::scalar())?;
        comp.add_output("y", Shape::scalar(), None)?;
        root.add(&spec.name, comp, vec![])?;
        let target = format!("{}.x", spec.name);
        root.connect(&spec.input, &[target.as_str()], None)?;
    }
    Ok(root)
}

fn main() -> Result<()> {
    let config = Config::load().unwrap_or_default();
    init_tracing(&config);
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { model } => {
            let text = std::fs::read_to_string(&model).with_context(|| format!("reading model file '{model}'"))?;
            let parsed: ModelFile = toml::from_str(&text).with_context(|| format!("parsing model file '{model}'"))?;
            let root = build_root(&parsed)?;
            let mut problem = Problem::new(root);
            let status = problem.run_model()?;
            info!(?status, "model run complete");
            for (name, value) in problem
                .root()
                .unknowns()
                .names()
                .filter_map(|n| problem.root().unknown(n).map(|v| (n.to_string(), v)))
            {
                println!("{name} = {value}");
            }
        }
        Commands::Grad { model, of, wrt, mode } => {
            let text = std::fs::read_to_string(&model).with_context(|| format!("reading model file '{model}'"))?;
            let parsed: ModelFile = toml::from_str(&text).with_context(|| format!("parsing model file '{model}'"))?;
            let root = build_root(&parsed)?;
            let mut problem = Problem::new(root);
            problem.run_model()?;
            let gmode = match mode {
                GradMode::Forward => GradientMode::Forward,
                GradMode::Reverse => GradientMode::Reverse,
            };
            let totals = problem.calc_gradient(&[of.as_str()], &[wrt.as_str()], gmode)?;
            let block = totals.get(&(of.clone(), wrt.clone())).context("requested endpoints did not resolve to a gradient block")?;
            println!("d({of})/d({wrt}) = {}", block.data[0]);
        }
    }
    Ok(())
}
