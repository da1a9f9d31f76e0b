//! Sketch-based nearest-genome search for workspace assemblies and reads.

pub mod about;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod homology;
pub mod orchestrator;
pub mod reference;
pub mod resolver;
pub mod rpc;
pub mod server;
pub mod sketch;
pub mod translate;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{HomologyError, Result};
pub use orchestrator::HomologyService;
