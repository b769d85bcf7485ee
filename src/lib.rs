//! Static-analysis toolkit for JVM bytecode: a stackless three-address IR
//! with explicit runtime checks, SSA conversion, Rapid Type Analysis call
//! graphs, and a class-flow fixed-point analysis over abstract domains.
//!
//! The pipeline: [`classpath`] locates classes, [`classfile`] parses them,
//! [`opcode`] disassembles code attributes, [`lower`] recodes bytecode into
//! the [`ir`] representation, [`ssa`] converts it, [`rta`] computes the
//! reachable program and dispatch caches into a [`program::Program`], and
//! [`classflow`] runs the [`solver`] over the [`domains`] lattices.

pub mod callgraph;
pub mod cfg;
pub mod classfile;
pub mod classflow;
pub mod classpath;
pub mod descriptor;
pub mod domains;
pub mod error;
pub mod hierarchy;
pub mod ir;
pub mod lower;
pub mod natives;
pub mod opcode;
pub mod program;
pub mod rta;
pub mod solver;
pub mod ssa;

#[cfg(test)]
pub(crate) mod test_fixtures;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the logging facade with stderr output.
pub fn init_logging() {
    let init_result = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("classflow=info,warn")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
    let _ = init_result;
}
