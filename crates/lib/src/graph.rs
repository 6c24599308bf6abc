//! Dependency-ordered package instantiation.
//!
//! [`PackageList`] turns the declared `depends` edges into a directed
//! acyclic graph, topologically sorts it, and instantiates one
//! [`Package`] per node with its dependency objects already wired in.
//! Construction order guarantees there are no forward references; a
//! cycle surfaces as an explicit sort failure, never as silent
//! misordering.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::debug;

use crate::config::{Config, ConfigError, EnvConfig};
use crate::package::{builder_script, Package, PackageError, PackagePaths};

/// Errors raised while constructing or preflighting the package graph.
#[derive(Debug, Error)]
pub enum GraphError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Package(#[from] PackageError),

  #[error("dependency cycle involving package '{package}'")]
  DependencyCycle { package: String },

  #[error("build script for package '{package}' not found at '{script}'")]
  ScriptMissing { package: String, script: PathBuf },

  #[error("build script for package '{package}' ('{script}') is not executable")]
  ScriptNotExecutable { package: String, script: PathBuf },

  #[error("'{path}' doesn't exist. Are you sure that '{package}' is installed?")]
  MissingArtifact { package: String, path: PathBuf },

  #[error("failed to create directory '{path}': {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Options controlling graph construction and preflight checks.
#[derive(Debug, Clone, Default)]
pub struct PackageListOptions {
  /// Override directory for build scripts.
  pub extra_scripts: Option<PathBuf>,
  /// Verify every build script exists and is executable before any work.
  pub check_scripts: bool,
  /// Verify every artifact directory already exists (for read-only
  /// consumers like sync, which must never imply a build).
  pub check_existence: bool,
}

/// The instantiated, dependency-ordered set of packages.
#[derive(Debug)]
pub struct PackageList {
  pub prefix: PathBuf,
  pub store_dir: PathBuf,
  pub cache_dir: PathBuf,
  packages: BTreeMap<String, Arc<Package>>,
  order: Vec<String>,
  envs: Vec<EnvConfig>,
}

impl PackageList {
  pub fn new(
    config_dir: &Path,
    config: &Config,
    prefix: &Path,
    options: PackageListOptions,
  ) -> Result<Self, GraphError> {
    let store_dir = prefix.join(&config.paths.store);
    let cache_dir = prefix.join(".cache");
    for dir in [&store_dir, &cache_dir] {
      std::fs::create_dir_all(dir).map_err(|e| GraphError::CreateDir {
        path: dir.clone(),
        source: e,
      })?;
    }

    let scripts_dir = config_dir.join("scripts");
    if options.check_scripts {
      check_scripts(config, &scripts_dir, options.extra_scripts.as_deref())?;
    }

    let order = topological_order(config)?;
    debug!(order = ?order, "resolved build order");

    let mut packages: BTreeMap<String, Arc<Package>> = BTreeMap::new();
    for name in &order {
      let Some(build) = config.package(name) else {
        // Unreachable with a validated config; keep the named error
        // rather than panicking on an unvalidated one.
        return Err(
          ConfigError::UnknownDependency {
            package: name.clone(),
            dependency: name.clone(),
          }
          .into(),
        );
      };

      let mut depends = Vec::with_capacity(build.depends.len());
      for dep in &build.depends {
        match packages.get(dep) {
          Some(pkg) => depends.push(pkg.clone()),
          None => {
            return Err(
              ConfigError::UnknownDependency {
                package: name.clone(),
                dependency: dep.clone(),
              }
              .into(),
            )
          }
        }
      }

      let paths = PackagePaths {
        config_dir: config_dir.to_path_buf(),
        scripts_dir: scripts_dir.clone(),
        extra_scripts: options.extra_scripts.clone(),
        store_dir: store_dir.clone(),
        cache_dir: cache_dir.clone(),
      };
      let package = Package::new(paths, build.clone(), depends)?;
      packages.insert(name.clone(), Arc::new(package));
    }

    let list = Self {
      prefix: prefix.to_path_buf(),
      store_dir,
      cache_dir,
      packages,
      order,
      envs: config.envs.clone(),
    };

    if options.check_existence {
      list.check_existence()?;
    }

    Ok(list)
  }

  /// Map of name to package.
  pub fn packages(&self) -> &BTreeMap<String, Arc<Package>> {
    &self.packages
  }

  pub fn get(&self, name: &str) -> Option<&Arc<Package>> {
    self.packages.get(name)
  }

  /// Packages in topological order: every dependency precedes its
  /// dependents.
  pub fn in_order(&self) -> impl Iterator<Item = &Arc<Package>> {
    self.order.iter().filter_map(|name| self.packages.get(name))
  }

  /// The declared (environment name, destination) pairs.
  pub fn envs(&self) -> &[EnvConfig] {
    &self.envs
  }

  fn check_existence(&self) -> Result<(), GraphError> {
    for package in self.in_order() {
      let out = package.out();
      if !out.is_dir() {
        return Err(GraphError::MissingArtifact {
          package: package.fullname(),
          path: out,
        });
      }
    }
    Ok(())
  }
}

/// Topologically sort the declared dependency graph; a cycle names one
/// participating package.
fn topological_order(config: &Config) -> Result<Vec<String>, GraphError> {
  let mut graph: DiGraph<String, ()> = DiGraph::new();
  let mut indices: HashMap<&str, NodeIndex> = HashMap::new();

  for build in &config.builds {
    let idx = graph.add_node(build.name.clone());
    indices.insert(&build.name, idx);
  }

  for build in &config.builds {
    let Some(&to) = indices.get(build.name.as_str()) else {
      continue;
    };
    for dep in &build.depends {
      if let Some(&from) = indices.get(dep.as_str()) {
        // Edge from dependency to dependent
        graph.add_edge(from, to, ());
      }
    }
  }

  let sorted = toposort(&graph, None).map_err(|cycle| GraphError::DependencyCycle {
    package: graph[cycle.node_id()].clone(),
  })?;

  Ok(sorted.into_iter().map(|idx| graph[idx].clone()).collect())
}

/// Fail fast, naming the first package whose build script is missing or
/// not executable.
fn check_scripts(
  config: &Config,
  scripts_dir: &Path,
  extra_scripts: Option<&Path>,
) -> Result<(), GraphError> {
  for build in &config.builds {
    let script = builder_script(scripts_dir, extra_scripts, &build.name);
    if !script.is_file() {
      return Err(GraphError::ScriptMissing {
        package: build.name.clone(),
        script,
      });
    }
    if !is_executable(&script) {
      return Err(GraphError::ScriptNotExecutable {
        package: build.name.clone(),
        script,
      });
    }
  }
  Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
  use std::os::unix::fs::PermissionsExt;
  std::fs::metadata(path)
    .map(|m| m.permissions().mode() & 0o111 != 0)
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::parse_config;
  use tempfile::TempDir;

  fn write_script(dir: &Path, name: &str) {
    let scripts = dir.join("scripts");
    std::fs::create_dir_all(&scripts).unwrap();
    let path = scripts.join(format!("build_{name}.sh"));
    std::fs::write(&path, "#!/bin/sh\n").unwrap();
    make_executable(&path);
  }

  fn make_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).unwrap();
  }

  fn config_of(content: &str) -> Config {
    parse_config(content, Path::new("config.yaml")).unwrap()
  }

  const CHAIN: &str = r#"
paths:
  store: store
builds:
  - name: a
    version: "1.0"
  - name: b
    version: "1.0"
    depends: [a]
  - name: c
    version: "1.0"
    depends: [b, a]
"#;

  #[test]
  fn empty_config_builds_empty_list() {
    let temp = TempDir::new().unwrap();
    let config = config_of("paths:\n  store: store\nbuilds: []\n");
    let list = PackageList::new(
      temp.path(),
      &config,
      temp.path(),
      PackageListOptions::default(),
    )
    .unwrap();
    assert!(list.packages().is_empty());
    assert!(list.store_dir.is_dir());
  }

  #[test]
  fn dependencies_precede_dependents() {
    let temp = TempDir::new().unwrap();
    for name in ["a", "b", "c"] {
      write_script(temp.path(), name);
    }
    let config = config_of(CHAIN);
    let list = PackageList::new(
      temp.path(),
      &config,
      temp.path(),
      PackageListOptions::default(),
    )
    .unwrap();

    let order: Vec<&str> = list.in_order().map(|p| p.config.name.as_str()).collect();
    let pos = |name: &str| order.iter().position(|n| *n == name).unwrap();
    assert!(pos("a") < pos("b"));
    assert!(pos("b") < pos("c"));

    // Dependency objects are wired, not just names
    let c = list.get("c").unwrap();
    assert_eq!(c.depends.len(), 2);
    assert_eq!(c.depends[0].config.name, "b");
    assert_eq!(c.depends[1].config.name, "a");
  }

  #[test]
  fn cycle_is_an_explicit_error() {
    let temp = TempDir::new().unwrap();
    for name in ["a", "b"] {
      write_script(temp.path(), name);
    }
    let config = config_of(
      r#"
paths:
  store: store
builds:
  - name: a
    version: "1.0"
    depends: [b]
  - name: b
    version: "1.0"
    depends: [a]
"#,
    );
    let err = PackageList::new(
      temp.path(),
      &config,
      temp.path(),
      PackageListOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, GraphError::DependencyCycle { .. }));
  }

  #[test]
  fn check_scripts_names_first_offender() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "a");
    let config = config_of(
      r#"
paths:
  store: store
builds:
  - name: a
    version: "1.0"
  - name: missing
    version: "1.0"
"#,
    );
    let err = PackageList::new(
      temp.path(),
      &config,
      temp.path(),
      PackageListOptions {
        check_scripts: true,
        ..Default::default()
      },
    )
    .unwrap_err();
    match err {
      GraphError::ScriptMissing { package, .. } => assert_eq!(package, "missing"),
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn check_scripts_rejects_non_executable() {
    let temp = TempDir::new().unwrap();
    let scripts = temp.path().join("scripts");
    std::fs::create_dir_all(&scripts).unwrap();
    std::fs::write(scripts.join("build_a.sh"), "#!/bin/sh\n").unwrap();

    let config = config_of(
      r#"
paths:
  store: store
builds:
  - name: a
    version: "1.0"
"#,
    );
    let err = PackageList::new(
      temp.path(),
      &config,
      temp.path(),
      PackageListOptions {
        check_scripts: true,
        ..Default::default()
      },
    )
    .unwrap_err();
    assert!(matches!(err, GraphError::ScriptNotExecutable { package, .. } if package == "a"));
  }

  #[test]
  fn check_existence_requires_artifacts() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "a");
    let config = config_of(
      r#"
paths:
  store: store
builds:
  - name: a
    version: "1.0"
"#,
    );

    let err = PackageList::new(
      temp.path(),
      &config,
      temp.path(),
      PackageListOptions {
        check_existence: true,
        ..Default::default()
      },
    )
    .unwrap_err();
    assert!(matches!(err, GraphError::MissingArtifact { .. }));

    // Satisfy the check by materializing the artifact directory
    let list = PackageList::new(
      temp.path(),
      &config,
      temp.path(),
      PackageListOptions::default(),
    )
    .unwrap();
    std::fs::create_dir_all(list.get("a").unwrap().out()).unwrap();
    PackageList::new(
      temp.path(),
      &config,
      temp.path(),
      PackageListOptions {
        check_existence: true,
        ..Default::default()
      },
    )
    .unwrap();
  }
}
