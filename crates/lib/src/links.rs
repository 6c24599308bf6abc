//! Stable named symlinks inside environment destinations.
//!
//! Each configured subdirectory gets a set of links (for example
//! `latest`). A literal target is used as-is; the sentinel `"^"`
//! resolves to the highest semantic version among sibling directories
//! that are real directories (not symlinks). Links are recreated on
//! every run. Dangling links are reported without failing the run, so
//! the tree stays usable while the operator gets warned.

use std::path::{Path, PathBuf};

use semver::Version;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;

/// The sentinel target meaning "highest semver sibling directory".
pub const LATEST: &str = "^";

/// Errors raised while creating environment links.
#[derive(Debug, Error)]
pub enum LinkError {
  #[error("failed to read directory '{path}': {source}")]
  ReadDir {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("no versioned directories in '{path}' to resolve 'latest' from")]
  NoVersions { path: PathBuf },

  #[error("failed to create symlink '{path}': {source}")]
  Symlink {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Find the highest semver-named real directory under `base`.
///
/// Hidden entries, symlinks, and names that don't parse as a semantic
/// version are ignored. No candidates at all is a hard failure: a
/// "latest" link must never silently point at nothing.
pub fn get_latest(base: &Path) -> Result<String, LinkError> {
  let entries = std::fs::read_dir(base).map_err(|e| LinkError::ReadDir {
    path: base.to_path_buf(),
    source: e,
  })?;

  let mut latest: Option<(Version, String)> = None;
  for entry in entries {
    let entry = entry.map_err(|e| LinkError::ReadDir {
      path: base.to_path_buf(),
      source: e,
    })?;

    let name = entry.file_name().to_string_lossy().to_string();
    if name.starts_with('.') {
      continue;
    }
    if entry
      .file_type()
      .map(|t| t.is_symlink())
      .unwrap_or(true)
    {
      continue;
    }
    let Ok(version) = Version::parse(&name) else {
      continue;
    };

    match &latest {
      Some((best, _)) if *best >= version => {}
      _ => latest = Some((version, name)),
    }
  }

  match latest {
    Some((_, name)) => Ok(name),
    None => Err(LinkError::NoVersions {
      path: base.to_path_buf(),
    }),
  }
}

/// Create every configured symlink under `prefix`, then validate each
/// subdirectory's links.
///
/// Links are written relative (the target is a sibling name, not an
/// absolute path) so the tree stays relocatable.
pub fn make_links(config: &Config, prefix: &Path) -> Result<(), LinkError> {
  for (subdir, links) in &config.links {
    let base = prefix.join(subdir);
    for (source, target) in links {
      let target = if target == LATEST {
        get_latest(&base)?
      } else {
        target.clone()
      };

      let path = base.join(source);
      match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
          return Err(LinkError::Symlink {
            path,
            source: e,
          })
        }
      }
      std::os::unix::fs::symlink(&target, &path).map_err(|e| LinkError::Symlink {
        path: path.clone(),
        source: e,
      })?;
      info!(link = %path.display(), target = %target, "created symlink");
    }

    validate(&base);
  }
  Ok(())
}

/// Warn about symlinks under `base` whose target is not an existing
/// directory. Non-fatal: the run completes, the operator is told.
fn validate(base: &Path) {
  let Ok(entries) = std::fs::read_dir(base) else {
    return;
  };

  for entry in entries.flatten() {
    let name = entry.file_name().to_string_lossy().to_string();
    if name.starts_with('.') {
      continue;
    }
    let path = entry.path();
    if !path
      .symlink_metadata()
      .map(|m| m.file_type().is_symlink())
      .unwrap_or(false)
    {
      continue;
    }

    let target = match std::fs::read_link(&path) {
      Ok(target) => target,
      Err(e) => {
        warn!(link = %path.display(), error = %e, "failed to read symlink");
        continue;
      }
    };
    let resolved = if target.is_absolute() {
      target.clone()
    } else {
      base.join(&target)
    };
    if !resolved.is_dir() {
      warn!("'{name}' links to '{}' which doesn't exist!", target.display());
    }
  }
}
