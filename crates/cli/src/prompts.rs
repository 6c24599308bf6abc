use std::io::{self, IsTerminal, Write};

use anyhow::{bail, Result};

/// Ask for a yes/no confirmation on stderr.
///
/// `assume_yes` (the `--yes` flag) bypasses the prompt; outside a
/// terminal the prompt refuses rather than hanging a batch job.
pub fn confirm(message: &str, assume_yes: bool) -> Result<bool> {
  if assume_yes {
    return Ok(true);
  }

  if !io::stdin().is_terminal() || !io::stderr().is_terminal() {
    bail!("cannot prompt for confirmation in non-interactive mode; use --yes to proceed");
  }

  write!(io::stderr(), "{message} [y/N] ")?;
  io::stderr().flush()?;

  let mut answer = String::new();
  io::stdin().read_line(&mut answer)?;
  Ok(matches!(
    answer.trim().to_ascii_lowercase().as_str(),
    "y" | "yes"
  ))
}
