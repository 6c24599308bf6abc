//! Pinned-ref updates from GitHub branches.
//!
//! `update` rewrites a package's pinned git ref to the latest commit of
//! a named branch. The GitHub query is separated from the pure config
//! mutation so the rewrite logic is testable without the network; the
//! CLI owns the diff-and-confirm step before anything is written back.

use serde::Deserialize;
use thiserror::Error;

use crate::config::{Config, SourceConfig};

const GITHUB_API: &str = "https://api.github.com";

/// Errors raised while querying GitHub or rewriting the configuration.
#[derive(Debug, Error)]
pub enum UpdateError {
  #[error("unknown package '{package}'. Must be one of: {known}")]
  UnknownPackage { package: String, known: String },

  #[error("package '{package}' has no git source to update")]
  NotGit { package: String },

  #[error("package '{package}' source '{url}' is not a GitHub remote")]
  NotGitHub { package: String, url: String },

  #[error("GitHub request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("GitHub returned {status} for '{url}'")]
  Status {
    status: reqwest::StatusCode,
    url: String,
  },
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAuthor {
  pub name: String,
  pub email: String,
}

impl std::fmt::Display for GitHubAuthor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{} <{}>", self.name, self.email)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubCommitInfo {
  pub author: GitHubAuthor,
  pub committer: GitHubAuthor,
  pub message: String,
}

impl std::fmt::Display for GitHubCommitInfo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "Message: {}\nAuthored by: {}\nCommitted by: {}",
      self.message, self.author, self.committer
    )
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubCommit {
  pub sha: String,
  pub commit: GitHubCommitInfo,
}

impl std::fmt::Display for GitHubCommit {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Commit {}\n{}", self.sha, self.commit)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubBranch {
  pub name: String,
  pub commit: GitHubCommit,
}

/// What an update changed, for the CLI's confirmation display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateChange {
  pub package: String,
  pub old_rev: String,
  pub new_rev: String,
  pub old_version: String,
  pub new_version: String,
}

impl UpdateChange {
  pub fn is_noop(&self) -> bool {
    self.old_rev == self.new_rev && self.old_version == self.new_version
  }
}

/// Extract `(owner, repo)` from a GitHub remote URL.
///
/// Accepts the https, ssh scp-like, and ssh URL forms.
pub fn parse_github_remote(url: &str) -> Option<(String, String)> {
  let rest = url
    .strip_prefix("https://github.com/")
    .or_else(|| url.strip_prefix("git@github.com:"))
    .or_else(|| url.strip_prefix("ssh://git@github.com/"))?;

  let mut parts = rest.splitn(2, '/');
  let owner = parts.next()?;
  let repo = parts.next()?.trim_end_matches('/');
  let repo = repo.strip_suffix(".git").unwrap_or(repo);
  if owner.is_empty() || repo.is_empty() || repo.contains('/') {
    return None;
  }
  Some((owner.to_string(), repo.to_string()))
}

/// Resolve the GitHub `(owner, repo)` a package's git source points at.
///
/// The named errors here are the preflight for `update`: unknown
/// package, sourceless package, or a remote we don't know how to query.
pub fn github_remote(config: &Config, package: &str) -> Result<(String, String), UpdateError> {
  let Some(build) = config.package(package) else {
    let known = config
      .builds
      .iter()
      .map(|b| b.name.as_str())
      .collect::<Vec<_>>()
      .join(", ");
    return Err(UpdateError::UnknownPackage {
      package: package.to_string(),
      known,
    });
  };

  let Some(SourceConfig::Git { url, .. }) = &build.src else {
    return Err(UpdateError::NotGit {
      package: package.to_string(),
    });
  };

  parse_github_remote(url).ok_or_else(|| UpdateError::NotGitHub {
    package: package.to_string(),
    url: url.clone(),
  })
}

/// Fetch the latest commit of `branch` from the GitHub REST API.
pub async fn get_branch_info(
  owner: &str,
  repo: &str,
  branch: &str,
) -> Result<GitHubBranch, UpdateError> {
  let url = format!("{GITHUB_API}/repos/{owner}/{repo}/branches/{branch}");
  let client = reqwest::Client::new();
  let response = client
    .get(&url)
    .header("Accept", "application/vnd.github+json")
    .header("X-GitHub-Api-Version", "2022-11-28")
    .header("User-Agent", "nimbus")
    .send()
    .await?;

  if !response.status().is_success() {
    return Err(UpdateError::Status {
      status: response.status(),
      url,
    });
  }
  Ok(response.json().await?)
}

/// Rewrite the configured ref (and optionally version) of `package` to
/// the branch's latest commit. Pure: the caller decides whether and
/// where to persist the mutated configuration.
pub fn apply_update(
  config: &mut Config,
  package: &str,
  info: &GitHubBranch,
  new_version: Option<&str>,
) -> Result<UpdateChange, UpdateError> {
  github_remote(config, package)?;

  let Some(build) = config.builds.iter_mut().find(|b| b.name == package) else {
    return Err(UpdateError::UnknownPackage {
      package: package.to_string(),
      known: String::new(),
    });
  };
  let Some(SourceConfig::Git { rev, .. }) = &mut build.src else {
    return Err(UpdateError::NotGit {
      package: package.to_string(),
    });
  };

  let change = UpdateChange {
    package: package.to_string(),
    old_rev: rev.clone(),
    new_rev: info.commit.sha.clone(),
    old_version: build.version.clone(),
    new_version: new_version.unwrap_or(&build.version).to_string(),
  };

  *rev = change.new_rev.clone();
  if let Some(version) = new_version {
    build.version = version.to_string();
  }

  Ok(change)
}
