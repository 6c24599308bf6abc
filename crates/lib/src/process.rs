//! Line-buffered draining of child-process output.
//!
//! Build scripts and transfer tools write progress with both newlines and
//! bare carriage returns (progress meters). Output is split on either CR
//! or LF so that every update becomes its own line, and each segment is
//! decoded permissively: invalid byte sequences are replaced rather than
//! aborting the drain.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Read `reader` to EOF, invoking `emit` once per line.
///
/// Lines are terminated by CR or LF; a CRLF pair counts as a single
/// terminator. A trailing partial line (no terminator before EOF) is
/// still emitted, so prompts like `password: ` are not swallowed.
pub async fn for_each_line<R, F>(mut reader: R, mut emit: F) -> std::io::Result<()>
where
  R: AsyncRead + Unpin,
  F: FnMut(&str),
{
  let mut buf = [0u8; 8192];
  let mut pending: Vec<u8> = Vec::new();
  let mut last_was_cr = false;

  loop {
    let n = reader.read(&mut buf).await?;
    if n == 0 {
      break;
    }

    for &byte in &buf[..n] {
      match byte {
        b'\r' => {
          emit(&String::from_utf8_lossy(&pending));
          pending.clear();
          last_was_cr = true;
        }
        b'\n' => {
          // CRLF: the CR already terminated this line
          if !last_was_cr {
            emit(&String::from_utf8_lossy(&pending));
            pending.clear();
          }
          last_was_cr = false;
        }
        _ => {
          pending.push(byte);
          last_was_cr = false;
        }
      }
    }
  }

  if !pending.is_empty() {
    emit(&String::from_utf8_lossy(&pending));
  }

  Ok(())
}
