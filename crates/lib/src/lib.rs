//! nimbus-lib: Core logic for the nimbus deploy tool
//!
//! Nimbus builds a simulation program and its native dependencies from
//! source into a content-addressed store, assembles versioned environment
//! trees from those artifacts, and replicates everything to a fleet of
//! remote hosts:
//!
//! - `config`: the validated YAML configuration model
//! - `package`: one buildable unit (hash, source, build script, artifact)
//! - `graph`: dependency-ordered package instantiation
//! - `build`: the build pipeline and environment assembly
//! - `links`: stable named symlinks ("latest") inside environments
//! - `sync`: store/environment replication over ssh and rsync
//! - `check`: remote state inspection
//! - `update`: pinned-ref updates from GitHub branches

pub mod build;
pub mod check;
pub mod config;
pub mod consts;
pub mod graph;
pub mod hash;
pub mod links;
pub mod package;
pub mod process;
pub mod sync;
pub mod update;
