//! Fleet replication of the store, environments, and symlinks.
//!
//! Synchronization is split into a pure planning step and an execution
//! step. The plan, computed locally, holds three transfer sets:
//!
//! 1. every package's artifact directory under the store,
//! 2. per environment, the numbered instances whose stored manifest
//!    matches the package's current manifest (stale or foreign entries
//!    are never pushed),
//! 3. a shell script recreating every top-level environment symlink,
//!    with the local prefix rewritten to the destination prefix.
//!
//! Per host, the three steps run strictly in order (symlink targets
//! reference environment directories, which reference store paths).
//! Across hosts, execution fans out in parallel unless the caller forces
//! serial processing. Every host is attempted; failures are collected
//! and one representative error is re-raised after all attempts.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::{AreaConfig, Config};
use crate::consts::MANIFEST_FILE;
use crate::graph::PackageList;

/// Options restricting the remote-execution channel: non-interactive
/// auth, no host-key prompts (fleet members are pre-trusted), bounded
/// connect timeout. Reused by every ssh and rsync invocation.
const SSH_OPTIONS: &[&str] = &[
  "-o",
  "BatchMode=yes",
  "-o",
  "StrictHostKeyChecking=no",
  "-o",
  "ConnectTimeout=10",
];

/// Errors raised while planning or executing synchronization.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("environment '{env}' names undefined package")]
  UnknownEnvPackage { env: String },

  #[error("failed to read directory '{path}': {source}")]
  ReadDir {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to spawn '{program}': {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("'{command}' exited with status {code:?}")]
  CommandFailed {
    command: String,
    code: Option<i32>,
  },

  #[error("sync task for '{area}' aborted: {message}")]
  TaskAborted { area: String, message: String },

  #[error("sync failed for area(s): {areas}")]
  AreasFailed {
    areas: String,
    #[source]
    source: Box<SyncError>,
  },
}

/// Caller-selectable synchronization behavior.
#[derive(Debug, Clone)]
pub struct SyncOptions {
  /// Prefix used on the remote hosts; defaults to the local prefix.
  pub dest_prefix: Option<PathBuf>,
  /// Record the commands instead of executing anything.
  pub dry_run: bool,
  /// Fan hosts out concurrently (default) or process them one by one.
  pub parallel: bool,
}

impl Default for SyncOptions {
  fn default() -> Self {
    Self {
      dest_prefix: None,
      dry_run: false,
      parallel: true,
    }
  }
}

/// One environment's transfer set: validated local instances and their
/// remote destination directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvTransfer {
  pub sources: Vec<PathBuf>,
  pub dest: PathBuf,
}

/// Everything to replicate, computed once and shared by all hosts.
#[derive(Debug, Clone)]
pub struct SyncPlan {
  pub store_sources: Vec<PathBuf>,
  pub store_dest: PathBuf,
  pub envs: Vec<EnvTransfer>,
  pub link_script: String,
}

/// Commands executed (or recorded, in dry-run mode) for one area.
#[derive(Debug, Clone)]
pub struct AreaSync {
  pub area: String,
  pub host: String,
  pub commands: Vec<String>,
}

/// Compute the transfer sets against the local tree.
pub fn compute_plan(
  config: &Config,
  list: &PackageList,
  dest_prefix: &Path,
) -> Result<SyncPlan, SyncError> {
  let store_sources: Vec<PathBuf> = list.in_order().map(|p| p.out()).collect();
  let store_dest = dest_prefix.join(&config.paths.store);

  let mut envs = Vec::with_capacity(config.envs.len());
  let mut link_script = String::from("set -e\n");

  for env in &config.envs {
    let Some(package) = list.get(&env.name) else {
      return Err(SyncError::UnknownEnvPackage {
        env: env.name.clone(),
      });
    };

    let local_dest = list.prefix.join(&env.dest);
    let remote_dest = dest_prefix.join(&env.dest);
    let manifest = package.manifest();

    let mut sources = Vec::new();
    if local_dest.is_dir() {
      for entry in read_dir_sorted(&local_dest)? {
        let path = local_dest.join(&entry);
        let Ok(meta) = path.symlink_metadata() else {
          continue;
        };

        if meta.file_type().is_symlink() {
          // Top-level symlinks are recreated remotely, not transferred
          let Ok(target) = std::fs::read_link(&path) else {
            continue;
          };
          link_script.push_str(&format!(
            "ln -s -f -n {} {}\n",
            shell_quote(&target.display().to_string()),
            shell_quote(&remote_dest.join(&entry).display().to_string()),
          ));
          continue;
        }

        if !meta.is_dir() || !is_numbered_instance(&entry, &package.config.version) {
          continue;
        }
        let stored = std::fs::read_to_string(path.join(MANIFEST_FILE)).unwrap_or_default();
        if stored == manifest {
          sources.push(path);
        } else {
          debug!(path = %path.display(), "manifest mismatch, not pushing");
        }
      }
    }

    envs.push(EnvTransfer {
      sources,
      dest: remote_dest,
    });
  }

  Ok(SyncPlan {
    store_sources,
    store_dest,
    envs,
    link_script,
  })
}

/// Replicate the plan to every configured area.
///
/// Returns the per-area command records on full success. If any area
/// failed, every other area has still been attempted; the error names
/// the failed areas and carries one representative cause.
pub async fn sync(
  config: &Config,
  list: &PackageList,
  options: &SyncOptions,
) -> Result<Vec<AreaSync>, SyncError> {
  let dest_prefix = options
    .dest_prefix
    .clone()
    .unwrap_or_else(|| list.prefix.clone());
  let plan = Arc::new(compute_plan(config, list, &dest_prefix)?);

  let results = if options.parallel {
    let mut set = JoinSet::new();
    for area in config.areas.clone() {
      let plan = plan.clone();
      let dry_run = options.dry_run;
      set.spawn(async move {
        let result = sync_area(&area, &plan, dry_run).await;
        (area, result)
      });
    }

    let mut results = Vec::new();
    while let Some(joined) = set.join_next().await {
      match joined {
        Ok(pair) => results.push(pair),
        Err(e) => {
          let area = AreaConfig {
            name: "<unknown>".to_string(),
            host: String::new(),
          };
          let err = SyncError::TaskAborted {
            area: area.name.clone(),
            message: e.to_string(),
          };
          results.push((area, Err(err)));
        }
      }
    }
    results
  } else {
    let mut results = Vec::new();
    for area in config.areas.clone() {
      let result = sync_area(&area, &plan, options.dry_run).await;
      results.push((area, result));
    }
    results
  };

  aggregate(results)
}

/// Collect per-area outcomes: log each failure with its host, then
/// re-raise one representative error naming every failed area.
fn aggregate(
  results: Vec<(AreaConfig, Result<Vec<String>, SyncError>)>,
) -> Result<Vec<AreaSync>, SyncError> {
  let mut synced = Vec::new();
  let mut failed = Vec::new();

  for (area, result) in results {
    match result {
      Ok(commands) => {
        info!(area = %area.name, host = %area.host, "synced");
        synced.push(AreaSync {
          area: area.name,
          host: area.host,
          commands,
        });
      }
      Err(e) => {
        error!(area = %area.name, host = %area.host, error = %e, "sync failed");
        failed.push((area.name, e));
      }
    }
  }

  if !failed.is_empty() {
    let areas = failed
      .iter()
      .map(|(name, _)| name.as_str())
      .collect::<Vec<_>>()
      .join(", ");
    let (_, representative) = failed.remove(0);
    return Err(SyncError::AreasFailed {
      areas,
      source: Box::new(representative),
    });
  }

  Ok(synced)
}

/// Push the plan to one host: ensure directories, then store, then
/// environments, then symlinks, strictly in that order.
async fn sync_area(
  area: &AreaConfig,
  plan: &SyncPlan,
  dry_run: bool,
) -> Result<Vec<String>, SyncError> {
  info!(area = %area.name, host = %area.host, "syncing");
  let mut commands = Vec::new();

  let mut dirs: Vec<String> = vec![plan.store_dest.display().to_string()];
  dirs.extend(plan.envs.iter().map(|t| t.dest.display().to_string()));
  let mut mkdir = ssh_args(&area.host);
  mkdir.push("--".to_string());
  mkdir.push("mkdir".to_string());
  mkdir.push("-p".to_string());
  mkdir.extend(dirs);
  commands.push(run_command("ssh", &mkdir, None, dry_run).await?);

  if !plan.store_sources.is_empty() {
    let args = rsync_args(&plan.store_sources, &area.host, &plan.store_dest);
    commands.push(run_command("rsync", &args, None, dry_run).await?);
  }

  for transfer in &plan.envs {
    if transfer.sources.is_empty() {
      continue;
    }
    let args = rsync_args(&transfer.sources, &area.host, &transfer.dest);
    commands.push(run_command("rsync", &args, None, dry_run).await?);
  }

  if plan.link_script.lines().count() > 1 {
    let mut args = ssh_args(&area.host);
    args.push("--".to_string());
    args.push("/bin/sh".to_string());
    args.push("-s".to_string());
    commands.push(run_command("ssh", &args, Some(&plan.link_script), dry_run).await?);
  }

  Ok(commands)
}

/// The reused ssh argument vector for `host`.
pub(crate) fn ssh_args(host: &str) -> Vec<String> {
  let mut args: Vec<String> = SSH_OPTIONS.iter().map(|s| s.to_string()).collect();
  args.push("-T".to_string());
  args.push(host.to_string());
  args
}

fn rsync_args(sources: &[PathBuf], host: &str, dest: &Path) -> Vec<String> {
  let mut args = vec![
    "-a".to_string(),
    "--info=progress2".to_string(),
    "-e".to_string(),
    format!("ssh {}", SSH_OPTIONS.join(" ")),
  ];
  args.extend(sources.iter().map(|s| s.display().to_string()));
  args.push(format!("{}:{}/", host, dest.display()));
  args
}

/// Run one external command, or record it in dry-run mode. Returns the
/// rendered command line.
pub(crate) async fn run_command(
  program: &str,
  args: &[String],
  stdin: Option<&str>,
  dry_run: bool,
) -> Result<String, SyncError> {
  let rendered = format!("{} {}", program, args.join(" "));
  if dry_run {
    info!(command = %rendered, "dry-run, not executing");
    return Ok(rendered);
  }
  debug!(command = %rendered, "executing");

  let mut command = Command::new(program);
  command.args(args);
  if stdin.is_some() {
    command.stdin(Stdio::piped());
  }

  let mut child = command.spawn().map_err(|e| SyncError::Spawn {
    program: program.to_string(),
    source: e,
  })?;

  if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
    let bytes = input.as_bytes().to_vec();
    pipe.write_all(&bytes).await.map_err(|e| SyncError::Spawn {
      program: program.to_string(),
      source: e,
    })?;
    // Dropping the pipe closes the child's stdin
  }

  let status = child.wait().await.map_err(|e| SyncError::Spawn {
    program: program.to_string(),
    source: e,
  })?;
  if !status.success() {
    return Err(SyncError::CommandFailed {
      command: rendered,
      code: status.code(),
    });
  }
  Ok(rendered)
}

/// Is `name` a `<version>-<n>` instance directory for `version`?
fn is_numbered_instance(name: &str, version: &str) -> bool {
  name
    .strip_prefix(version)
    .and_then(|rest| rest.strip_prefix('-'))
    .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

fn shell_quote(s: &str) -> String {
  format!("'{}'", s.replace('\'', r"'\''"))
}

fn read_dir_sorted(path: &Path) -> Result<Vec<String>, SyncError> {
  let entries = std::fs::read_dir(path).map_err(|e| SyncError::ReadDir {
    path: path.to_path_buf(),
    source: e,
  })?;
  let mut names = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|e| SyncError::ReadDir {
      path: path.to_path_buf(),
      source: e,
    })?;
    names.push(entry.file_name().to_string_lossy().to_string());
  }
  names.sort();
  Ok(names)
}
