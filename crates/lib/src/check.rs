//! Remote state inspection.
//!
//! A small POSIX shell collector is piped over ssh to each area and
//! emits tab-separated records describing the remote environment
//! destinations (symlinks with their targets, real directories, other
//! entries) and the remote store contents. The parsed state is compared
//! against the local store so operators can see which artifacts a host
//! is missing before deciding to sync.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::Config;
use crate::sync::ssh_args;

/// Errors raised while collecting or parsing remote state.
#[derive(Debug, Error)]
pub enum CheckError {
  #[error("failed to run ssh to '{host}': {source}")]
  Spawn {
    host: String,
    #[source]
    source: std::io::Error,
  },

  #[error("remote collector on '{host}' exited with status {code:?}")]
  CollectorFailed { host: String, code: Option<i32> },

  #[error("unparsable collector record: '{line}'")]
  Parse { line: String },

  #[error("failed to read local store '{path}': {source}")]
  ReadStore {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// One entry under a remote environment destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEntry {
  Link { name: String, target: String },
  Dir { name: String },
  Other { name: String },
}

/// Parsed remote state for one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteState {
  /// Entries per environment destination, keyed by the remote path.
  pub envs: BTreeMap<String, Vec<RemoteEntry>>,
  /// Artifact directory names present in the remote store.
  pub store: Vec<String>,
}

/// Outcome of checking one area.
#[derive(Debug)]
pub struct AreaReport {
  pub area: String,
  pub host: String,
  pub state: Result<RemoteState, CheckError>,
  /// Local store entries the remote store does not have.
  pub missing_store: Vec<String>,
}

/// Generate the collector script for the given remote layout.
///
/// Globs that match nothing expand to themselves; the `[ -e ]` guard
/// keeps empty directories from producing phantom records.
pub fn collector_script(env_dests: &[PathBuf], store: &Path) -> String {
  let mut script = String::from("set -e\n");
  for dest in env_dests {
    script.push_str(&format!("printf 'env\\t%s\\n' '{}'\n", dest.display()));
    script.push_str(&format!(
      concat!(
        "for f in '{dest}'/*; do\n",
        "  [ -e \"$f\" ] || [ -h \"$f\" ] || continue\n",
        "  name=$(basename \"$f\")\n",
        "  if [ -h \"$f\" ]; then printf 'link\\t%s\\t%s\\n' \"$name\" \"$(readlink \"$f\")\"\n",
        "  elif [ -d \"$f\" ]; then printf 'dir\\t%s\\n' \"$name\"\n",
        "  else printf 'other\\t%s\\n' \"$name\"\n",
        "  fi\n",
        "done\n",
      ),
      dest = dest.display()
    ));
  }
  script.push_str(&format!(
    concat!(
      "for f in '{store}'/*; do\n",
      "  [ -e \"$f\" ] || continue\n",
      "  printf 'obj\\t%s\\n' \"$(basename \"$f\")\"\n",
      "done\n",
    ),
    store = store.display()
  ));
  script
}

/// Parse the collector's tab-separated output.
pub fn parse_collector_output(output: &str) -> Result<RemoteState, CheckError> {
  let mut state = RemoteState::default();
  let mut current_env: Option<String> = None;

  for line in output.lines() {
    if line.is_empty() {
      continue;
    }
    let fields: Vec<&str> = line.split('\t').collect();
    match fields.as_slice() {
      ["env", dest] => {
        state.envs.insert(dest.to_string(), Vec::new());
        current_env = Some(dest.to_string());
      }
      ["link", name, target] => {
        push_entry(
          &mut state,
          &current_env,
          RemoteEntry::Link {
            name: name.to_string(),
            target: target.to_string(),
          },
        )?;
      }
      ["dir", name] => {
        push_entry(
          &mut state,
          &current_env,
          RemoteEntry::Dir {
            name: name.to_string(),
          },
        )?;
      }
      ["other", name] => {
        push_entry(
          &mut state,
          &current_env,
          RemoteEntry::Other {
            name: name.to_string(),
          },
        )?;
      }
      ["obj", name] => state.store.push(name.to_string()),
      _ => {
        return Err(CheckError::Parse {
          line: line.to_string(),
        })
      }
    }
  }

  Ok(state)
}

fn push_entry(
  state: &mut RemoteState,
  current_env: &Option<String>,
  entry: RemoteEntry,
) -> Result<(), CheckError> {
  let Some(env) = current_env else {
    return Err(CheckError::Parse {
      line: format!("{entry:?} outside any env section"),
    });
  };
  if let Some(entries) = state.envs.get_mut(env) {
    entries.push(entry);
  }
  Ok(())
}

/// Collect and compare remote state for every configured area.
///
/// Per-host failures are isolated: every area is attempted and reported,
/// and a failing collector shows up in that area's report rather than
/// aborting the others.
pub async fn check(
  config: &Config,
  prefix: &Path,
  dest_prefix: Option<&Path>,
) -> Result<Vec<AreaReport>, CheckError> {
  let dest_prefix = dest_prefix.unwrap_or(prefix);
  let env_dests: Vec<PathBuf> = config
    .envs
    .iter()
    .map(|e| dest_prefix.join(&e.dest))
    .collect();
  let store = dest_prefix.join(&config.paths.store);
  let script = collector_script(&env_dests, &store);

  let local_store = local_store_entries(&prefix.join(&config.paths.store))?;

  let mut set = JoinSet::new();
  for area in config.areas.clone() {
    let script = script.clone();
    set.spawn(async move {
      let state = collect(&area.host, &script).await;
      (area, state)
    });
  }

  let mut reports = Vec::new();
  while let Some(joined) = set.join_next().await {
    let Ok((area, state)) = joined else {
      continue;
    };

    let missing_store = match &state {
      Ok(state) => local_store
        .iter()
        .filter(|name| !state.store.contains(*name))
        .cloned()
        .collect(),
      Err(e) => {
        error!(area = %area.name, host = %area.host, error = %e, "check failed");
        Vec::new()
      }
    };

    reports.push(AreaReport {
      area: area.name,
      host: area.host,
      state,
      missing_store,
    });
  }

  reports.sort_by(|a, b| a.area.cmp(&b.area));
  Ok(reports)
}

/// Run the collector on one host and parse its output.
async fn collect(host: &str, script: &str) -> Result<RemoteState, CheckError> {
  info!(host, "collecting remote state");

  let mut args = ssh_args(host);
  args.push("--".to_string());
  args.push("/bin/sh".to_string());
  args.push("-s".to_string());

  let mut child = Command::new("ssh")
    .args(&args)
    .stdin(Stdio::piped())
    .stdout(Stdio::piped())
    .spawn()
    .map_err(|e| CheckError::Spawn {
      host: host.to_string(),
      source: e,
    })?;

  if let Some(mut pipe) = child.stdin.take() {
    pipe
      .write_all(script.as_bytes())
      .await
      .map_err(|e| CheckError::Spawn {
        host: host.to_string(),
        source: e,
      })?;
  }

  let output = child
    .wait_with_output()
    .await
    .map_err(|e| CheckError::Spawn {
      host: host.to_string(),
      source: e,
    })?;
  if !output.status.success() {
    return Err(CheckError::CollectorFailed {
      host: host.to_string(),
      code: output.status.code(),
    });
  }

  parse_collector_output(&String::from_utf8_lossy(&output.stdout))
}

fn local_store_entries(store: &Path) -> Result<Vec<String>, CheckError> {
  if !store.is_dir() {
    return Ok(Vec::new());
  }
  let entries = std::fs::read_dir(store).map_err(|e| CheckError::ReadStore {
    path: store.to_path_buf(),
    source: e,
  })?;
  let mut names = Vec::new();
  for entry in entries {
    let entry = entry.map_err(|e| CheckError::ReadStore {
      path: store.to_path_buf(),
      source: e,
    })?;
    names.push(entry.file_name().to_string_lossy().to_string());
  }
  names.sort();
  Ok(names)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_full_collector_output() {
    let output = "env\t/prog/sim/versions\n\
                  link\tlatest\t1.4.0-2\n\
                  dir\t1.4.0-2\n\
                  other\tREADME\n\
                  obj\tabc123-solver-1.0.0\n\
                  obj\tdef456-flowsim-1.4.0\n";

    let state = parse_collector_output(output).unwrap();
    assert_eq!(
      state.envs["/prog/sim/versions"],
      vec![
        RemoteEntry::Link {
          name: "latest".to_string(),
          target: "1.4.0-2".to_string(),
        },
        RemoteEntry::Dir {
          name: "1.4.0-2".to_string(),
        },
        RemoteEntry::Other {
          name: "README".to_string(),
        },
      ]
    );
    assert_eq!(
      state.store,
      vec!["abc123-solver-1.0.0", "def456-flowsim-1.4.0"]
    );
  }

  #[test]
  fn parse_empty_output() {
    let state = parse_collector_output("").unwrap();
    assert!(state.envs.is_empty());
    assert!(state.store.is_empty());
  }

  #[test]
  fn unknown_record_is_an_error() {
    let err = parse_collector_output("bogus\tentry\n").unwrap_err();
    assert!(matches!(err, CheckError::Parse { .. }));
  }

  #[test]
  fn entry_before_env_section_is_an_error() {
    let err = parse_collector_output("dir\torphan\n").unwrap_err();
    assert!(matches!(err, CheckError::Parse { .. }));
  }

  #[test]
  fn collector_script_lists_every_dest() {
    let script = collector_script(
      &[PathBuf::from("/prog/sim/versions")],
      Path::new("/prog/sim/versions/.store"),
    );
    assert!(script.contains("printf 'env\\t%s\\n' '/prog/sim/versions'"));
    assert!(script.contains("readlink"));
    assert!(script.contains("'/prog/sim/versions/.store'/*"));
  }
}
