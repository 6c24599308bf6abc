//! Implementation of the `nimbus check` command.

use std::path::PathBuf;

use anyhow::{Context as _, Result};

use nimbus_lib::check::{check, RemoteEntry};

use crate::output::{print_error, print_info, print_success};

use super::Context;

/// Show the deployed state on every area: environment entries, and
/// which local store artifacts each host is missing.
pub fn cmd_check(ctx: &Context, dest_prefix: Option<PathBuf>) -> Result<()> {
  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  let reports = rt.block_on(check(&ctx.config, &ctx.prefix, dest_prefix.as_deref()))?;

  let mut failed = false;
  for report in &reports {
    match &report.state {
      Err(e) => {
        print_error(&format!("{} ({}): {e}", report.area, report.host));
        failed = true;
      }
      Ok(state) => {
        print_success(&format!("{} ({})", report.area, report.host));
        for (dest, entries) in &state.envs {
          println!("  {dest}:");
          for entry in entries {
            match entry {
              RemoteEntry::Link { name, target } => println!("    {name} -> {target}"),
              RemoteEntry::Dir { name } => println!("    {name}/"),
              RemoteEntry::Other { name } => println!("    {name}"),
            }
          }
        }
        if report.missing_store.is_empty() {
          print_info("store is up to date");
        } else {
          print_info(&format!(
            "missing {} store artifact(s): {}",
            report.missing_store.len(),
            report.missing_store.join(", ")
          ));
        }
      }
    }
  }

  if failed {
    anyhow::bail!("check failed for one or more areas");
  }
  Ok(())
}
