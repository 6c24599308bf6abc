//! The build pipeline: dependency-ordered package builds and environment
//! assembly.
//!
//! Packages build strictly sequentially, in topological order; a failed
//! build stops the run since later packages may depend on the failed one.
//! Environments are then assembled as numbered `<version>-<n>`
//! directories: real directories, leaf files as symlinks into the store,
//! plus a `manifest` file that doubles as the idempotence key.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::EnvConfig;
use crate::consts::{MANIFEST_FILE, MAX_BUILD_NUMBER};
use crate::graph::PackageList;
use crate::package::PackageError;

/// Errors raised while building packages or assembling environments.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Package(#[from] PackageError),

  #[error("environment '{env}' names undefined package")]
  UnknownEnvPackage { env: String },

  #[error("out of range while trying to find a build number for '{env}' version {version}")]
  NumberExhausted { env: String, version: String },

  #[error("failed to walk '{path}': {source}")]
  Walk {
    path: PathBuf,
    #[source]
    source: walkdir::Error,
  },

  #[error("i/o error on '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// What happened to one environment during assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleOutcome {
  /// A new numbered instance was created at this path.
  Created(PathBuf),
  /// An existing instance already matches the manifest; nothing was done.
  AlreadyExists(PathBuf),
}

/// Drives package builds and environment assembly for one configuration.
pub struct Builder {
  list: PackageList,
  force: bool,
}

impl Builder {
  pub fn new(list: PackageList, force: bool) -> Self {
    Self { list, force }
  }

  pub fn list(&self) -> &PackageList {
    &self.list
  }

  /// Build every package in dependency order, then assemble every
  /// declared environment.
  pub async fn build_all(&self) -> Result<Vec<AssembleOutcome>, BuildError> {
    let overrides = BTreeMap::new();
    for package in self.list.in_order() {
      package.build(&overrides).await?;
    }

    let mut outcomes = Vec::with_capacity(self.list.envs().len());
    for env in self.list.envs() {
      outcomes.push(self.assemble(env)?);
    }
    Ok(outcomes)
  }

  /// Assemble one environment: claim the first free `<version>-<n>`
  /// slot, unless an existing instance already holds an identical
  /// manifest (and `force` is unset), in which case assembly is skipped.
  pub fn assemble(&self, env: &EnvConfig) -> Result<AssembleOutcome, BuildError> {
    let Some(final_package) = self.list.get(&env.name) else {
      return Err(BuildError::UnknownEnvPackage {
        env: env.name.clone(),
      });
    };

    let dest = self.list.prefix.join(&env.dest);
    std::fs::create_dir_all(&dest).map_err(|e| BuildError::Io {
      path: dest.clone(),
      source: e,
    })?;

    let manifest = final_package.manifest();
    let version = &final_package.config.version;

    let mut target = None;
    for n in 1..=MAX_BUILD_NUMBER {
      let path = dest.join(format!("{version}-{n}"));
      if !path.is_dir() {
        target = Some(path);
        break;
      }

      // Missing manifest file reads as empty: a foreign or damaged
      // instance never matches and never blocks a new number.
      let existing = std::fs::read_to_string(path.join(MANIFEST_FILE)).unwrap_or_default();
      if !self.force && existing == manifest {
        info!(env = %env.name, path = %path.display(), "environment already exists");
        return Ok(AssembleOutcome::AlreadyExists(path));
      }
    }

    let Some(path) = target else {
      return Err(BuildError::NumberExhausted {
        env: env.name.clone(),
        version: version.clone(),
      });
    };

    info!(env = %env.name, path = %path.display(), "assembling environment");
    std::fs::create_dir(&path).map_err(|e| BuildError::Io {
      path: path.clone(),
      source: e,
    })?;

    mirror(&final_package.out(), &path)?;
    for package in final_package.closure() {
      mirror(&package.out(), &path)?;
    }

    let manifest_path = path.join(MANIFEST_FILE);
    std::fs::write(&manifest_path, &manifest).map_err(|e| BuildError::Io {
      path: manifest_path,
      source: e,
    })?;

    Ok(AssembleOutcome::Created(path))
  }
}

/// Mirror one artifact tree into an environment directory: directories
/// are created for real, leaf files become symlinks back into the store
/// so environments share disk via links, never copies.
fn mirror(artifact: &Path, env_dir: &Path) -> Result<(), BuildError> {
  for entry in WalkDir::new(artifact) {
    let entry = entry.map_err(|e| BuildError::Walk {
      path: artifact.to_path_buf(),
      source: e,
    })?;

    let rel = match entry.path().strip_prefix(artifact) {
      Ok(rel) if !rel.as_os_str().is_empty() => rel,
      _ => continue,
    };
    let dst = env_dir.join(rel);

    if entry.file_type().is_dir() {
      std::fs::create_dir_all(&dst).map_err(|e| BuildError::Io {
        path: dst.clone(),
        source: e,
      })?;
    } else {
      match std::os::unix::fs::symlink(entry.path(), &dst) {
        Ok(()) => {}
        // Another package already linked this file; first one wins
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
          debug!(path = %dst.display(), "already linked");
        }
        Err(e) => {
          return Err(BuildError::Io {
            path: dst,
            source: e,
          })
        }
      }
    }
  }
  Ok(())
}
