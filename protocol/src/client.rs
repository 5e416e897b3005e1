//! Host-side helpers for talking to `nodectld`.
//!
//! Each helper consumes one freshly connected stream, since the guest closes
//! the connection after a single command. The stream can be a vsock socket,
//! a TCP socket (development fallback) or anything else implementing the
//! tokio I/O traits.

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{Command, Response};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("guest returned error: {0}")]
    Remote(String),

    #[error("unexpected response from guest: {0:?}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

async fn send_line<S: AsyncWrite + Unpin>(stream: &mut S, cmd: &Command) -> std::io::Result<()> {
    stream.write_all(cmd.to_line().as_bytes()).await
}

/// Push `data` to `path` inside the guest. Returns the byte count the guest
/// reports as written.
pub async fn upload<S>(stream: S, path: &str, data: &[u8]) -> Result<u64, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    check_path(path)?;
    let mut stream = BufReader::new(stream);
    let cmd = Command::Upload {
        path: path.to_string(),
        size: data.len() as u64,
    };
    let sent = async {
        send_line(stream.get_mut(), &cmd).await?;
        stream.get_mut().write_all(data).await?;
        stream.get_mut().flush().await
    }
    .await;

    // A guest that rejects the upload answers and hangs up without reading
    // the payload; its status line is still worth more than the write error.
    let mut line = String::new();
    let received = stream.read_line(&mut line).await;
    if let Err(send_err) = sent {
        return match Response::parse(&line) {
            Some(Response::Error(msg)) => Err(ClientError::Remote(msg)),
            _ => Err(ClientError::Io(send_err)),
        };
    }
    received?;
    match Response::parse(&line) {
        Some(Response::Uploaded(n)) => Ok(n),
        Some(Response::Error(msg)) => Err(ClientError::Remote(msg)),
        None => Err(ClientError::UnexpectedResponse(line)),
    }
}

/// Pull the content of `path` out of the guest.
///
/// Reads carry no framing, so a failure is only recognised when the guest
/// sent a single `ERR` line and closed. A file whose entire content looks
/// exactly like that is reported as an error too.
pub async fn read<S>(mut stream: S, path: &str) -> Result<Vec<u8>, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    check_path(path)?;
    let cmd = Command::Read {
        path: path.to_string(),
    };
    send_line(&mut stream, &cmd).await?;
    stream.flush().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    if let Some(msg) = single_error_line(&buf) {
        return Err(ClientError::Remote(msg));
    }
    Ok(buf)
}

/// Run `command` through the guest shell and collect everything it printed
/// on stdout and stderr, interleaved as the guest relayed it.
pub async fn exec<S>(mut stream: S, command: &str) -> Result<Vec<u8>, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if command.contains('\n') {
        return Err(ClientError::InvalidCommand(
            "command must be a single line".into(),
        ));
    }
    let cmd = match Command::parse(command) {
        Ok(Some(cmd @ Command::Exec { .. })) => cmd,
        Ok(Some(_)) | Err(_) => {
            return Err(ClientError::InvalidCommand(format!(
                "{command:?} would be parsed as a file transfer"
            )));
        }
        Ok(None) => return Err(ClientError::InvalidCommand("empty command".into())),
    };
    send_line(&mut stream, &cmd).await?;
    stream.flush().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(buf)
}

fn check_path(path: &str) -> Result<(), ClientError> {
    if path.is_empty() || path.contains([' ', '\n']) {
        return Err(ClientError::InvalidCommand(format!(
            "path {path:?} cannot be sent on a command line"
        )));
    }
    Ok(())
}

fn single_error_line(buf: &[u8]) -> Option<String> {
    let body = buf.strip_suffix(b"\n")?;
    if body.contains(&b'\n') {
        return None;
    }
    match Response::parse(std::str::from_utf8(body).ok()?)? {
        Response::Error(msg) => Some(msg),
        Response::Uploaded(_) => None,
    }
}
