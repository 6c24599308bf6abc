mod build;
mod check;
mod links;
mod sync;
mod update;

pub use build::cmd_build;
pub use check::cmd_check;
pub use links::cmd_links;
pub use sync::cmd_sync;
pub use update::cmd_update;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use nimbus_lib::config::{expand_tilde, load_config, Config};

/// The explicit CLI context threaded into every subcommand: the loaded
/// configuration, where it lives, and the selected installation prefix.
pub struct Context {
  pub config_path: PathBuf,
  pub config_dir: PathBuf,
  pub config: Config,
  pub prefix: PathBuf,
}

impl Context {
  pub fn load(config_path: &Path, prefix: Option<&Path>) -> Result<Self> {
    let config = load_config(config_path)?;

    let config_path = std::fs::canonicalize(config_path)
      .with_context(|| format!("failed to resolve '{}'", config_path.display()))?;
    let config_dir = config_path
      .parent()
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("/"));

    let prefix = match prefix {
      Some(prefix) => prefix.to_path_buf(),
      None => {
        let configured = config
          .paths
          .prefix
          .as_deref()
          .context("no installation prefix: pass --prefix or set paths.prefix in the config")?;
        expand_tilde(configured)
      }
    };
    std::fs::create_dir_all(&prefix)
      .with_context(|| format!("failed to create prefix '{}'", prefix.display()))?;

    Ok(Self {
      config_path,
      config_dir,
      config,
      prefix,
    })
  }
}
