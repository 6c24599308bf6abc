//! Implementation of the `nimbus update` command.

use anyhow::{Context as _, Result};

use nimbus_lib::update::{apply_update, get_branch_info, github_remote};

use crate::output::{print_info, print_success, symbols};
use crate::prompts::confirm;

use super::Context;

/// Pin a package's source ref to the latest commit of a branch, showing
/// the found commit and the resulting change before writing anything.
pub fn cmd_update(
  ctx: &Context,
  package: &str,
  branch: &str,
  version: Option<&str>,
  yes: bool,
) -> Result<()> {
  let (owner, repo) = github_remote(&ctx.config, package)?;

  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  let info = rt.block_on(get_branch_info(&owner, &repo, branch))?;

  eprintln!("Found commit:");
  eprintln!("{}", info.commit);

  let mut config = ctx.config.clone();
  let change = apply_update(&mut config, package, &info, version)?;

  if change.is_noop() {
    print_info(&format!("'{package}' is already pinned to {}", change.new_rev));
    return Ok(());
  }

  println!(
    "{package}: ref {} {} {}",
    change.old_rev,
    symbols::ARROW,
    change.new_rev
  );
  if change.old_version != change.new_version {
    println!(
      "{package}: version {} {} {}",
      change.old_version,
      symbols::ARROW,
      change.new_version
    );
  }

  if !confirm("Write the updated configuration?", yes)? {
    print_info("aborted, nothing written");
    return Ok(());
  }

  let yaml = serde_yaml::to_string(&config).context("failed to serialize configuration")?;
  std::fs::write(&ctx.config_path, yaml)
    .with_context(|| format!("failed to write '{}'", ctx.config_path.display()))?;
  print_success(&format!("updated {}", ctx.config_path.display()));
  Ok(())
}
