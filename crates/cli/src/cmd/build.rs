//! Implementation of the `nimbus build` command.

use std::path::PathBuf;

use anyhow::{Context as _, Result};

use nimbus_lib::build::{AssembleOutcome, Builder};
use nimbus_lib::graph::{PackageList, PackageListOptions};

use crate::output::{print_info, print_success};

use super::Context;

/// Build every package in dependency order, then assemble the declared
/// environments. Script preflight runs before any build starts.
pub fn cmd_build(ctx: &Context, force: bool, extra_scripts: Option<PathBuf>) -> Result<()> {
  let list = PackageList::new(
    &ctx.config_dir,
    &ctx.config,
    &ctx.prefix,
    PackageListOptions {
      extra_scripts,
      check_scripts: true,
      check_existence: false,
    },
  )?;

  let package_count = list.packages().len();
  let builder = Builder::new(list, force);

  let rt = tokio::runtime::Runtime::new().context("failed to create async runtime")?;
  let outcomes = rt.block_on(builder.build_all())?;

  print_success(&format!("{package_count} package(s) up to date"));
  for outcome in outcomes {
    match outcome {
      AssembleOutcome::Created(path) => {
        print_success(&format!("environment created at {}", path.display()));
      }
      AssembleOutcome::AlreadyExists(path) => {
        print_info(&format!("environment already exists at {}", path.display()));
      }
    }
  }
  Ok(())
}
