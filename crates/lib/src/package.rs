//! One buildable unit: hash derivation, source resolution, and the build
//! script invocation.
//!
//! A [`Package`] owns its definition, references to its already-built
//! dependency objects, and an eagerly computed [`BuildHash`] binding every
//! input that affects the build output. The hash is the basis of content
//! addressing: `<store>/<hash>-<name>-<version>` existing is the single
//! source of truth for "already built".

use std::collections::{BTreeMap, HashSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{PackageConfig, SourceConfig};
use crate::consts::{BUILD_LOG_FILE, MAX_BUILD_NUMBER, TOOL_IDENT};
use crate::hash::{BuildHash, Hasher};
use crate::process::for_each_line;

/// Errors raised by package hashing, fetching, or building.
#[derive(Debug, Error)]
pub enum PackageError {
  #[error("package '{package}': failed to read build script '{path}': {source}")]
  ReadScript {
    package: String,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("package '{package}': failed to read source file '{path}': {source}")]
  ReadSource {
    package: String,
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("package '{package}': failed to serialize definition: {source}")]
  SerializeDefinition {
    package: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("package '{package}': failed to run git: {source}")]
  GitSpawn {
    package: String,
    #[source]
    source: std::io::Error,
  },

  #[error("package '{package}': 'git {args}' exited with status {code:?}")]
  GitFailed {
    package: String,
    args: String,
    code: Option<i32>,
  },

  #[error("package '{package}': failed to spawn build script '{script}': {source}")]
  Spawn {
    package: String,
    script: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("package '{package}': build script exited with status {code:?}, see {log}")]
  BuildFailed {
    package: String,
    code: Option<i32>,
    log: PathBuf,
  },

  #[error("i/o error on '{path}': {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Directory layout every package resolves its paths against.
#[derive(Debug, Clone)]
pub struct PackagePaths {
  /// Directory containing the configuration file; file sources are
  /// resolved relative to it.
  pub config_dir: PathBuf,
  /// Builtin build-script directory.
  pub scripts_dir: PathBuf,
  /// Per-deployment override directory for build scripts.
  pub extra_scripts: Option<PathBuf>,
  /// The content-addressed artifact store.
  pub store_dir: PathBuf,
  /// Scratch space; git checkouts are cached here.
  pub cache_dir: PathBuf,
}

/// Resolve the build script for `name`: the extra-scripts directory wins
/// when it holds a matching file, otherwise the builtin directory.
pub fn builder_script(scripts_dir: &Path, extra_scripts: Option<&Path>, name: &str) -> PathBuf {
  let file = format!("build_{name}.sh");
  if let Some(extra) = extra_scripts {
    let candidate = extra.join(&file);
    if candidate.is_file() {
      return candidate;
    }
  }
  scripts_dir.join(file)
}

/// Whether a single package build ran or was skipped as already built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
  Built,
  Skipped,
}

/// A package wired into its dependency graph, ready to build.
#[derive(Debug)]
pub struct Package {
  paths: PackagePaths,
  pub config: PackageConfig,
  pub depends: Vec<Arc<Package>>,
  buildhash: BuildHash,
}

impl Package {
  /// Construct a package, computing its build hash.
  ///
  /// The hash covers the canonical JSON of the definition, the build
  /// script bytes, the source file bytes for file-type sources, and each
  /// dependency's hash in declaration order. Unreadable scripts or source
  /// files fail here, before any build work.
  pub fn new(
    paths: PackagePaths,
    config: PackageConfig,
    depends: Vec<Arc<Package>>,
  ) -> Result<Self, PackageError> {
    let mut hasher = Hasher::new();

    let definition =
      serde_json::to_string(&config).map_err(|e| PackageError::SerializeDefinition {
        package: config.name.clone(),
        source: e,
      })?;
    hasher.update(definition.as_bytes());

    let script = builder_script(&paths.scripts_dir, paths.extra_scripts.as_deref(), &config.name);
    let script_bytes = std::fs::read(&script).map_err(|e| PackageError::ReadScript {
      package: config.name.clone(),
      path: script.clone(),
      source: e,
    })?;
    hasher.update(&script_bytes);

    // Local file edits must invalidate the cache; pinned git refs are
    // immutable and hash through the definition alone.
    if let Some(SourceConfig::File { path }) = &config.src {
      let src = paths.config_dir.join(path);
      let src_bytes = std::fs::read(&src).map_err(|e| PackageError::ReadSource {
        package: config.name.clone(),
        path: src.clone(),
        source: e,
      })?;
      hasher.update(&src_bytes);
    }

    for dep in &depends {
      hasher.update(dep.buildhash().0.as_bytes());
    }

    Ok(Self {
      paths,
      config,
      depends,
      buildhash: hasher.finish(),
    })
  }

  pub fn fullname(&self) -> String {
    self.config.fullname()
  }

  pub fn buildhash(&self) -> &BuildHash {
    &self.buildhash
  }

  /// The content-addressed artifact directory for this package.
  pub fn out(&self) -> PathBuf {
    self
      .paths
      .store_dir
      .join(format!("{}-{}", self.buildhash, self.fullname()))
  }

  /// Where this package's source lives on disk, without fetching it.
  pub fn src(&self) -> Option<PathBuf> {
    match &self.config.src {
      None => None,
      Some(SourceConfig::Git { rev, .. }) => Some(
        self
          .paths
          .cache_dir
          .join(format!("{}-{}.git", self.config.name, rev)),
      ),
      Some(SourceConfig::File { path }) => Some(self.paths.config_dir.join(path)),
    }
  }

  /// The resolved build script path.
  pub fn builder(&self) -> PathBuf {
    builder_script(
      &self.paths.scripts_dir,
      self.paths.extra_scripts.as_deref(),
      &self.config.name,
    )
  }

  /// The transitive dependency closure, deduplicated by name.
  pub fn closure(&self) -> Vec<Arc<Package>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut stack: Vec<Arc<Package>> = self.depends.clone();
    let mut result = Vec::new();

    while let Some(pkg) = stack.pop() {
      if !seen.insert(pkg.config.name.clone()) {
        continue;
      }
      stack.extend(pkg.depends.iter().cloned());
      result.push(pkg);
    }

    result
  }

  /// Sorted, newline-joined output paths of the closure plus this
  /// package. Doubles as the environment idempotence key.
  pub fn manifest(&self) -> String {
    let mut lines: Vec<String> = self
      .closure()
      .iter()
      .map(|p| p.out().display().to_string())
      .collect();
    lines.push(self.out().display().to_string());
    lines.sort();
    let mut manifest = lines.join("\n");
    manifest.push('\n');
    manifest
  }

  /// Materialize a git source in the cache, or reset an existing
  /// checkout to a pristine state.
  ///
  /// Fresh path: init, add remote, fetch the exact ref, detached
  /// checkout; a failure removes the partial cache directory before
  /// propagating. Existing path: hard reset plus a recursive clean of
  /// untracked files, which clears residue from a previous failed build
  /// without a full re-clone. File and absent sources are a no-op.
  pub async fn fetch_or_reset(&self) -> Result<(), PackageError> {
    let Some(SourceConfig::Git { url, rev, key }) = &self.config.src else {
      return Ok(());
    };
    let Some(src) = self.src() else {
      return Ok(());
    };

    if src.is_dir() {
      debug!(package = %self.config.name, path = %src.display(), "resetting cached checkout");
      self.git(&src, key.as_deref(), &["reset", "--hard"]).await?;
      self.git(&src, key.as_deref(), &["clean", "-fdx"]).await?;
      return Ok(());
    }

    info!(package = %self.config.name, url = %url, rev = %rev, "fetching source");
    std::fs::create_dir_all(&src).map_err(|e| PackageError::Io {
      path: src.clone(),
      source: e,
    })?;

    let result = self.checkout(&src, url, rev, key.as_deref()).await;
    if result.is_err() {
      let _ = std::fs::remove_dir_all(&src);
    }
    result
  }

  async fn checkout(
    &self,
    src: &Path,
    url: &str,
    rev: &str,
    key: Option<&Path>,
  ) -> Result<(), PackageError> {
    self.git(src, key, &["init", "--branch", "main"]).await?;
    self.git(src, key, &["remote", "add", "origin", url]).await?;
    self.git(src, key, &["fetch", "origin", rev]).await?;
    self.git(src, key, &["checkout", "--detach", "FETCH_HEAD"]).await
  }

  async fn git(&self, cwd: &Path, key: Option<&Path>, args: &[&str]) -> Result<(), PackageError> {
    let mut command = Command::new("git");
    command.args(args).current_dir(cwd);
    if let Some(key) = key {
      command.env(
        "GIT_SSH_COMMAND",
        format!("ssh -i {} -o BatchMode=yes", key.display()),
      );
    }

    let status = command.status().await.map_err(|e| PackageError::GitSpawn {
      package: self.config.name.clone(),
      source: e,
    })?;

    if !status.success() {
      return Err(PackageError::GitFailed {
        package: self.config.name.clone(),
        args: args.join(" "),
        code: status.code(),
      });
    }
    Ok(())
  }

  /// Build this package if its artifact does not exist yet.
  ///
  /// Creating the output directory doubles as the mutual-exclusion
  /// primitive: `AlreadyExists` means another run (or a previous one)
  /// owns this artifact, and the build is skipped.
  pub async fn build(
    &self,
    overrides: &BTreeMap<String, String>,
  ) -> Result<BuildOutcome, PackageError> {
    let out = self.out();
    match std::fs::create_dir(&out) {
      Ok(()) => {}
      Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
        info!(package = %self.fullname(), path = %out.display(), "already built, skipping");
        return Ok(BuildOutcome::Skipped);
      }
      Err(e) => {
        return Err(PackageError::Io {
          path: out,
          source: e,
        })
      }
    }

    info!(package = %self.fullname(), "building");

    if let Err(e) = self.fetch_or_reset().await {
      let _ = std::fs::remove_dir_all(&out);
      return Err(e);
    }

    match self.run_build(overrides).await {
      Ok(()) => Ok(BuildOutcome::Built),
      Err(e @ PackageError::BuildFailed { .. }) => {
        self.quarantine();
        Err(e)
      }
      Err(e) => {
        let _ = std::fs::remove_dir_all(&out);
        Err(e)
      }
    }
  }

  /// Invoke the build script with the constructed environment, teeing its
  /// output to our stdout/stderr and the build log.
  pub async fn run_build(&self, overrides: &BTreeMap<String, String>) -> Result<(), PackageError> {
    let out = self.out();
    let log_path = out.join(BUILD_LOG_FILE);
    let definition =
      serde_json::to_string(&self.config).map_err(|e| PackageError::SerializeDefinition {
        package: self.config.name.clone(),
        source: e,
      })?;

    let mut log = std::fs::File::create(&log_path).map_err(|e| PackageError::Io {
      path: log_path.clone(),
      source: e,
    })?;
    writeln!(log, "{TOOL_IDENT}")
      .and_then(|()| writeln!(log, "Build date: {}", chrono::Local::now()))
      .and_then(|()| writeln!(log, "----- BUILD CONFIG -----"))
      .and_then(|()| writeln!(log, "{definition}"))
      .and_then(|()| writeln!(log, "------ BUILD  LOG ------"))
      .map_err(|e| PackageError::Io {
        path: log_path.clone(),
        source: e,
      })?;

    let script = self.builder();
    let mut command = Command::new(&script);
    command
      .current_dir(self.src().unwrap_or_else(|| out.clone()))
      .stdout(Stdio::piped())
      .stderr(Stdio::piped());
    for dep in &self.depends {
      command.env(&dep.config.name, dep.out());
    }
    command.env("tmp", &self.paths.cache_dir);
    command.env("out", &out);
    if let Some(src) = self.src() {
      command.env("src", src);
    }
    for (key, value) in overrides {
      command.env(key, value);
    }

    let mut child = command.spawn().map_err(|e| PackageError::Spawn {
      package: self.config.name.clone(),
      script,
      source: e,
    })?;

    let log = Arc::new(Mutex::new(log));
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (status, drained_out, drained_err) = tokio::join!(
      child.wait(),
      tee(stdout, self.config.name.clone(), log.clone(), false),
      tee(stderr, self.config.name.clone(), log.clone(), true),
    );

    let status = status.map_err(|e| PackageError::Io {
      path: log_path.clone(),
      source: e,
    })?;
    if !status.success() {
      return Err(PackageError::BuildFailed {
        package: self.fullname(),
        code: status.code(),
        log: log_path,
      });
    }

    for drained in [drained_out, drained_err] {
      drained.map_err(|e| PackageError::Io {
        path: log_path.clone(),
        source: e,
      })?;
    }
    Ok(())
  }

  /// Rename a failed build's output aside to `fail-<name>-<version>-<n>`
  /// so the canonical path is free for a retry and the partial output
  /// stays inspectable.
  fn quarantine(&self) -> Option<PathBuf> {
    let out = self.out();
    for n in 1..=MAX_BUILD_NUMBER {
      let candidate = self
        .paths
        .store_dir
        .join(format!("fail-{}-{}", self.fullname(), n));
      if candidate.exists() {
        continue;
      }
      return match std::fs::rename(&out, &candidate) {
        Ok(()) => {
          warn!(
            package = %self.fullname(),
            path = %candidate.display(),
            "build failed, output moved aside"
          );
          Some(candidate)
        }
        Err(e) => {
          warn!(package = %self.fullname(), error = %e, "failed to move failed output aside");
          None
        }
      };
    }
    warn!(package = %self.fullname(), "no free slot to move failed output aside");
    None
  }
}

/// Forward one child stream, line by line, to our own output and the
/// build log. A missing stream (not captured) is a no-op.
async fn tee<R>(
  stream: Option<R>,
  label: String,
  log: Arc<Mutex<std::fs::File>>,
  to_stderr: bool,
) -> std::io::Result<()>
where
  R: AsyncRead + Unpin,
{
  let Some(stream) = stream else {
    return Ok(());
  };

  for_each_line(stream, |line| {
    let line = format!("{label}> {line}");
    if to_stderr {
      eprintln!("{line}");
    } else {
      println!("{line}");
    }
    if let Ok(mut log) = log.lock() {
      let _ = writeln!(log, "{line}");
    }
  })
  .await
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn paths_in(dir: &Path) -> PackagePaths {
    PackagePaths {
      config_dir: dir.to_path_buf(),
      scripts_dir: dir.join("scripts"),
      extra_scripts: None,
      store_dir: dir.join("store"),
      cache_dir: dir.join("cache"),
    }
  }

  fn write_script(dir: &Path, name: &str, content: &str) {
    let scripts = dir.join("scripts");
    std::fs::create_dir_all(&scripts).unwrap();
    std::fs::write(scripts.join(format!("build_{name}.sh")), content).unwrap();
  }

  fn definition(name: &str, version: &str, depends: &[&str]) -> PackageConfig {
    PackageConfig {
      name: name.to_string(),
      version: version.to_string(),
      src: None,
      depends: depends.iter().map(|s| s.to_string()).collect(),
    }
  }

  fn package(dir: &Path, config: PackageConfig, depends: Vec<Arc<Package>>) -> Package {
    Package::new(paths_in(dir), config, depends).unwrap()
  }

  #[test]
  fn identical_inputs_identical_hash() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "a", "content");

    let one = package(temp.path(), definition("a", "0.0", &[]), vec![]);
    let two = package(temp.path(), definition("a", "0.0", &[]), vec![]);
    assert_eq!(one.buildhash(), two.buildhash());
  }

  #[test]
  fn script_content_changes_hash() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "a", "content");
    let before = package(temp.path(), definition("a", "0.0", &[]), vec![]);

    write_script(temp.path(), "a", "different content");
    let after = package(temp.path(), definition("a", "0.0", &[]), vec![]);
    assert_ne!(before.buildhash(), after.buildhash());
  }

  #[test]
  fn version_changes_hash() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "a", "content");

    let v0 = package(temp.path(), definition("a", "0.0", &[]), vec![]);
    let v1 = package(temp.path(), definition("a", "1.0", &[]), vec![]);
    assert_ne!(v0.buildhash(), v1.buildhash());
  }

  #[test]
  fn dependency_hash_propagates_to_dependents_only() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "a", "content");
    write_script(temp.path(), "b", "content");
    write_script(temp.path(), "c", "content");

    let a = Arc::new(package(temp.path(), definition("a", "0.0", &[]), vec![]));
    let b = package(temp.path(), definition("b", "0.0", &["a"]), vec![a.clone()]);
    let c = package(temp.path(), definition("c", "0.0", &[]), vec![]);

    write_script(temp.path(), "a", "changed content");
    let a2 = Arc::new(package(temp.path(), definition("a", "0.0", &[]), vec![]));
    let b2 = package(temp.path(), definition("b", "0.0", &["a"]), vec![a2.clone()]);
    let c2 = package(temp.path(), definition("c", "0.0", &[]), vec![]);

    assert_ne!(a.buildhash(), a2.buildhash());
    assert_ne!(b.buildhash(), b2.buildhash());
    assert_eq!(c.buildhash(), c2.buildhash());
  }

  #[test]
  fn file_source_content_is_hashed() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "a", "content");
    std::fs::write(temp.path().join("input.tar"), "original").unwrap();

    let config = PackageConfig {
      src: Some(SourceConfig::File {
        path: PathBuf::from("input.tar"),
      }),
      ..definition("a", "0.0", &[])
    };

    let before = package(temp.path(), config.clone(), vec![]);
    std::fs::write(temp.path().join("input.tar"), "edited").unwrap();
    let after = package(temp.path(), config, vec![]);
    assert_ne!(before.buildhash(), after.buildhash());
  }

  #[test]
  fn git_source_hashes_ref_not_content() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "a", "content");

    let git_config = |rev: &str| PackageConfig {
      src: Some(SourceConfig::Git {
        url: "https://example.com/a.git".to_string(),
        rev: rev.to_string(),
        key: None,
      }),
      ..definition("a", "0.0", &[])
    };

    let pinned = package(temp.path(), git_config("aaa111"), vec![]);
    let repinned = package(temp.path(), git_config("bbb222"), vec![]);
    assert_ne!(pinned.buildhash(), repinned.buildhash());

    // Populating the cache path must not affect the hash
    let cache = pinned.src().unwrap();
    std::fs::create_dir_all(&cache).unwrap();
    std::fs::write(cache.join("residue"), "leftover").unwrap();
    let again = package(temp.path(), git_config("aaa111"), vec![]);
    assert_eq!(pinned.buildhash(), again.buildhash());
  }

  #[test]
  fn out_path_is_hash_name_version() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "a", "content");

    let pkg = package(temp.path(), definition("a", "2.1", &[]), vec![]);
    let out = pkg.out();
    assert!(out.starts_with(temp.path().join("store")));
    let name = out.file_name().unwrap().to_str().unwrap();
    assert_eq!(name, format!("{}-a-2.1", pkg.buildhash()));
  }

  #[test]
  fn source_path_resolution() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "a", "content");

    let none = package(temp.path(), definition("a", "0.0", &[]), vec![]);
    assert_eq!(none.src(), None);

    let git = package(
      temp.path(),
      PackageConfig {
        src: Some(SourceConfig::Git {
          url: "https://example.com/a.git".to_string(),
          rev: "abc123".to_string(),
          key: None,
        }),
        ..definition("a", "0.0", &[])
      },
      vec![],
    );
    assert_eq!(git.src(), Some(temp.path().join("cache/a-abc123.git")));

    std::fs::write(temp.path().join("local.tar"), "data").unwrap();
    let file = package(
      temp.path(),
      PackageConfig {
        src: Some(SourceConfig::File {
          path: PathBuf::from("local.tar"),
        }),
        ..definition("a", "0.0", &[])
      },
      vec![],
    );
    assert_eq!(file.src(), Some(temp.path().join("local.tar")));
  }

  #[test]
  fn extra_scripts_override_wins() {
    let temp = TempDir::new().unwrap();
    write_script(temp.path(), "a", "builtin");
    let extra = temp.path().join("extra");
    std::fs::create_dir_all(&extra).unwrap();
    std::fs::write(extra.join("build_a.sh"), "override").unwrap();

    let mut paths = paths_in(temp.path());
    paths.extra_scripts = Some(extra.clone());
    let pkg = Package::new(paths, definition("a", "0.0", &[]), vec![]).unwrap();
    assert_eq!(pkg.builder(), extra.join("build_a.sh"));

    // No override file for "b": falls back to the builtin directory
    write_script(temp.path(), "b", "builtin");
    let mut paths = paths_in(temp.path());
    paths.extra_scripts = Some(extra);
    let pkg = Package::new(paths, definition("b", "0.0", &[]), vec![]).unwrap();
    assert_eq!(pkg.builder(), temp.path().join("scripts/build_b.sh"));
  }

  #[test]
  fn missing_script_fails_with_path() {
    let temp = TempDir::new().unwrap();
    let err = Package::new(paths_in(temp.path()), definition("ghost", "0.0", &[]), vec![])
      .unwrap_err();
    match err {
      PackageError::ReadScript { package, path, .. } => {
        assert_eq!(package, "ghost");
        assert!(path.ends_with("build_ghost.sh"));
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn manifest_covers_sorted_closure() {
    let temp = TempDir::new().unwrap();
    for name in ["a", "b", "c"] {
      write_script(temp.path(), name, "content");
    }

    let a = Arc::new(package(temp.path(), definition("a", "0.0", &[]), vec![]));
    let b = Arc::new(package(
      temp.path(),
      definition("b", "0.0", &["a"]),
      vec![a.clone()],
    ));
    let c = package(temp.path(), definition("c", "0.0", &["b"]), vec![b.clone()]);

    let manifest = c.manifest();
    let mut expected: Vec<String> = vec![
      a.out().display().to_string(),
      b.out().display().to_string(),
      c.out().display().to_string(),
    ];
    expected.sort();
    let mut expected = expected.join("\n");
    expected.push('\n');
    assert_eq!(manifest, expected);
  }

  #[test]
  fn closure_deduplicates_diamonds() {
    let temp = TempDir::new().unwrap();
    for name in ["base", "left", "right", "top"] {
      write_script(temp.path(), name, "content");
    }

    let base = Arc::new(package(temp.path(), definition("base", "0.0", &[]), vec![]));
    let left = Arc::new(package(
      temp.path(),
      definition("left", "0.0", &["base"]),
      vec![base.clone()],
    ));
    let right = Arc::new(package(
      temp.path(),
      definition("right", "0.0", &["base"]),
      vec![base.clone()],
    ));
    let top = package(
      temp.path(),
      definition("top", "0.0", &["left", "right"]),
      vec![left, right],
    );

    let names: Vec<String> = top
      .closure()
      .iter()
      .map(|p| p.config.name.clone())
      .collect();
    assert_eq!(names.len(), 3);
    for name in ["base", "left", "right"] {
      assert!(names.contains(&name.to_string()));
    }
  }
}
