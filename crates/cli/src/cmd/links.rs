//! Implementation of the `nimbus links` command.

use anyhow::Result;

use nimbus_lib::links::make_links;

use crate::output::print_success;

use super::Context;

pub fn cmd_links(ctx: &Context) -> Result<()> {
  make_links(&ctx.config, &ctx.prefix)?;

  let count: usize = ctx.config.links.values().map(|links| links.len()).sum();
  print_success(&format!("{count} symlink(s) written"));
  Ok(())
}
