//! Implementation of the `nimbus sync` command.

use std::path::PathBuf;

use anyhow::{Context as _, Result};

use nimbus_lib::graph::{PackageList, PackageListOptions};
use nimbus_lib::sync::{sync, SyncOptions};

use crate::output::{print_info, print_success, symbols};

use super::Context;

/// Replicate the store, validated environment instances, and symlinks
/// to every configured area.
///
/// The package list is consumed read-only: every artifact must already
/// exist locally, syncing never implies a build.
pub fn cmd_sync(
  ctx: &Context,
  dest_prefix: Option<PathBuf>,
  dry_run: bool,
  no_async: bool,
) -> Result<()> {
  let list = PackageList::new(
    &ctx.config_dir,
    &ctx.config,
    &ctx.prefix,
    PackageListOptions {
      extra_scripts: None,
      check_scripts: false,
      check_existence: true,
    },
  )?;

  let options = SyncOptions {
    dest_prefix,
    dry_run,
    parallel: !no_async,
  };

  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  let report = rt.block_on(sync(&ctx.config, &list, &options))?;

  for area in &report {
    if dry_run {
      print_info(&format!("{} ({}) would run:", area.area, area.host));
      for command in &area.commands {
        println!("    {command}");
      }
    } else {
      print_success(&format!(
        "{} {} {}",
        area.area,
        symbols::ARROW,
        area.host
      ));
    }
  }
  Ok(())
}
