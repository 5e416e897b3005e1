use std::sync::Arc;

use nodectl_protocol::{Command, Response, MAX_COMMAND_LINE};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::handlers;

// ---------------------------------------------------------------------------
// Connection handler
// ---------------------------------------------------------------------------

/// Serve a single command on one connection, then close it.
///
/// Nothing is written back when the command line cannot be read or is
/// empty. The write side is shut down on every path; both halves are
/// dropped when this returns.
pub async fn handle_connection<R, W>(reader: R, mut writer: W, peer: String, config: Arc<Config>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    debug!(peer = %peer, "new connection");

    let mut reader = BufReader::new(reader);
    if let Some(line) = read_command_line(&mut reader, &peer).await {
        dispatch(&line, &mut reader, &mut writer, &peer, &config).await;
    }

    if let Err(e) = writer.shutdown().await {
        debug!(peer = %peer, error = %e, "shutdown failed");
    }
    debug!(peer = %peer, "connection closed");
}

/// Read one `\n`-terminated line. Returns `None` on I/O errors, on EOF
/// before the newline, on lines longer than `MAX_COMMAND_LINE` and on
/// lines that are not UTF-8.
async fn read_command_line<R: AsyncBufRead + Unpin>(reader: &mut R, peer: &str) -> Option<String> {
    let mut buf = Vec::new();
    let limit = MAX_COMMAND_LINE as u64;
    if let Err(e) = reader.take(limit).read_until(b'\n', &mut buf).await {
        warn!(peer = %peer, error = %e, "failed to read command line");
        return None;
    }

    if buf.last() != Some(&b'\n') {
        if buf.len() as u64 >= limit {
            warn!(peer = %peer, max = MAX_COMMAND_LINE, "command line too long");
        } else {
            debug!(peer = %peer, "connection closed before end of command line");
        }
        return None;
    }

    match String::from_utf8(buf) {
        Ok(line) => Some(line),
        Err(_) => {
            warn!(peer = %peer, "command line is not valid UTF-8");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

async fn dispatch<R, W>(line: &str, reader: &mut R, writer: &mut W, peer: &str, config: &Config)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let cmd = match Command::parse(line) {
        Ok(Some(cmd)) => cmd,
        Ok(None) => {
            debug!(peer = %peer, "empty command line");
            return;
        }
        Err(e) => {
            info!(peer = %peer, error = %e, "rejected command line");
            handlers::write_response(writer, &Response::from(e), peer).await;
            return;
        }
    };

    match cmd {
        Command::Upload { path, size } => {
            info!(peer = %peer, path = %path, size, "upload");
            handlers::handle_upload(reader, writer, &path, size, peer).await;
        }
        Command::Read { path } => {
            info!(peer = %peer, path = %path, "read");
            handlers::handle_read(writer, &path, peer).await;
        }
        Command::Exec { raw } => {
            info!(peer = %peer, command = %raw, "exec");
            handlers::handle_exec(writer, &raw, &config.shell, peer).await;
        }
    }
}
