//! Configuration model for nimbus.
//!
//! The configuration is a single YAML document describing the packages to
//! build, where their sources come from, which environments to assemble,
//! which symlinks to maintain, and which remote areas to sync to.
//!
//! All validation happens at load time, before any build work starts:
//! paths that must be relative, references to undefined packages, and
//! self-dependencies are rejected here. Cycles in the dependency graph
//! surface later, during topological sorting.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file '{path}': {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse config file '{path}': {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("path '{path}' for '{field}' must be relative")]
  AbsolutePath { field: String, path: PathBuf },

  #[error("package '{name}' is defined more than once")]
  DuplicatePackage { name: String },

  #[error("package '{package}' depends on undefined package '{dependency}'")]
  UnknownDependency { package: String, dependency: String },

  #[error("package '{name}' depends on itself")]
  SelfDependency { name: String },
}

/// Source descriptor for a package: where its code comes from.
///
/// A closed set of variants; packages with no `src` entry build from
/// nothing but their script (for example, repackaging a vendor blob the
/// script downloads itself).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
  /// A git remote pinned to an exact ref.
  Git {
    url: String,
    #[serde(rename = "ref")]
    rev: String,
    /// Optional SSH identity file used when fetching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<PathBuf>,
  },
  /// A file shipped next to the configuration.
  File { path: PathBuf },
}

/// One buildable unit as declared in the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageConfig {
  pub name: String,
  pub version: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub src: Option<SourceConfig>,
  #[serde(default)]
  pub depends: Vec<String>,
}

impl PackageConfig {
  pub fn fullname(&self) -> String {
    format!("{}-{}", self.name, self.version)
  }
}

/// Filesystem layout: everything nimbus writes lives under `prefix`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
  /// Default installation prefix; the CLI may override it.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub prefix: Option<PathBuf>,
  /// Store directory, relative to the prefix.
  pub store: PathBuf,
}

/// A named environment: `name` is the final package, `dest` the directory
/// (relative to the prefix) that receives `<version>-<n>` instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvConfig {
  pub name: String,
  pub dest: PathBuf,
}

/// One remote destination host participating in fleet replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaConfig {
  pub name: String,
  pub host: String,
}

/// The complete validated configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
  pub paths: PathsConfig,
  pub builds: Vec<PackageConfig>,
  #[serde(default)]
  pub envs: Vec<EnvConfig>,
  /// Symlink rules: subdirectory -> { link name -> target }.
  /// The target `"^"` resolves to the highest semver sibling directory.
  #[serde(default)]
  pub links: BTreeMap<String, BTreeMap<String, String>>,
  #[serde(default)]
  pub areas: Vec<AreaConfig>,
}

impl Config {
  /// Look up a package definition by name.
  pub fn package(&self, name: &str) -> Option<&PackageConfig> {
    self.builds.iter().find(|b| b.name == name)
  }

  /// Validate cross-references and path requirements.
  pub fn validate(&self) -> Result<(), ConfigError> {
    require_relative("paths.store", &self.paths.store)?;
    for env in &self.envs {
      require_relative(&format!("envs.{}.dest", env.name), &env.dest)?;
    }

    let mut names: HashSet<&str> = HashSet::new();
    for build in &self.builds {
      if !names.insert(&build.name) {
        return Err(ConfigError::DuplicatePackage {
          name: build.name.clone(),
        });
      }
      if let Some(SourceConfig::File { path }) = &build.src {
        require_relative(&format!("builds.{}.src.path", build.name), path)?;
      }
    }

    for build in &self.builds {
      for dep in &build.depends {
        if dep == &build.name {
          return Err(ConfigError::SelfDependency {
            name: build.name.clone(),
          });
        }
        if !names.contains(dep.as_str()) {
          return Err(ConfigError::UnknownDependency {
            package: build.name.clone(),
            dependency: dep.clone(),
          });
        }
      }
    }

    Ok(())
  }
}

fn require_relative(field: &str, path: &Path) -> Result<(), ConfigError> {
  if path.is_absolute() {
    return Err(ConfigError::AbsolutePath {
      field: field.to_string(),
      path: path.to_path_buf(),
    });
  }
  Ok(())
}

/// Load and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
  let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
    path: path.to_path_buf(),
    source: e,
  })?;
  parse_config(&content, path)
}

/// Parse and validate configuration content.
///
/// Split from [`load_config`] so callers that already hold the raw text
/// (the `update` rewrite path) can reuse the same validation.
pub fn parse_config(content: &str, path: &Path) -> Result<Config, ConfigError> {
  let config: Config = serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
    path: path.to_path_buf(),
    source: e,
  })?;
  config.validate()?;
  Ok(config)
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let Ok(stripped) = path.strip_prefix("~") else {
    return path.to_path_buf();
  };
  match std::env::var_os("HOME") {
    Some(home) => PathBuf::from(home).join(stripped),
    None => path.to_path_buf(),
  }
}
