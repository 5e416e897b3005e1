//! Command handlers. Each one runs to completion on the connection it is
//! given and reports failures to the host as an `ERR` line; nothing here
//! propagates errors back to the connection loop.

use std::io;
use std::path::Path;
use std::process::Stdio;

use nodectl_protocol::Response;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

/// Chunk size for upload copies and exec output relays.
const COPY_BUF_SIZE: usize = 64 * 1024;

pub async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response, peer: &str) {
    let line = response.to_line();
    let result = async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }
    .await;
    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "failed to write response");
    }
}

// ---------------------------------------------------------------------------
// UPLOAD
// ---------------------------------------------------------------------------

/// Create (or truncate) `path` and copy exactly `size` bytes from `reader`
/// into it. A short transfer leaves the partial file in place.
pub async fn handle_upload<R, W>(reader: &mut R, writer: &mut W, path: &str, size: u64, peer: &str)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut file = match File::create(path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(peer = %peer, path = %path, error = %e, "upload: cannot create file");
            let resp = Response::error(format!("cannot create file: {e}"));
            write_response(writer, &resp, peer).await;
            return;
        }
    };

    let (copied, result) = copy_exact(reader, &mut file, size).await;
    let resp = match result {
        Ok(()) => {
            info!(peer = %peer, path = %path, bytes = copied, "upload complete");
            Response::Uploaded(copied)
        }
        Err(e) => {
            warn!(peer = %peer, path = %path, copied, expected = size, error = %e, "upload failed");
            Response::error(format!("upload failed after {copied} bytes: {e}"))
        }
    };
    write_response(writer, &resp, peer).await;
}

/// Copy exactly `size` bytes, returning how many reached `dst` along with
/// the outcome. Each chunk is flushed before it is counted, so the count
/// matches what the file holds when the host is told. Running out of input
/// early is an `UnexpectedEof` error.
async fn copy_exact<R, W>(src: &mut R, dst: &mut W, size: u64) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let buf_len = usize::try_from(size).unwrap_or(usize::MAX).min(COPY_BUF_SIZE);
    let mut buf = vec![0u8; buf_len];
    let mut copied: u64 = 0;

    while copied < size {
        let want = (size - copied).min(buf_len as u64) as usize;
        let n = match src.read(&mut buf[..want]).await {
            Ok(0) => {
                let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed early");
                return (copied, dst.flush().await.and(Err(eof)));
            }
            Ok(n) => n,
            Err(e) => return (copied, dst.flush().await.and(Err(e))),
        };
        let written = async {
            dst.write_all(&buf[..n]).await?;
            dst.flush().await
        }
        .await;
        if let Err(e) = written {
            return (copied, Err(e));
        }
        copied += n as u64;
    }

    (copied, Ok(()))
}

// ---------------------------------------------------------------------------
// READ
// ---------------------------------------------------------------------------

/// Stream the whole of `path` to the host, unframed. The host sees the end
/// of the file as the end of the connection.
pub async fn handle_read<W: AsyncWrite + Unpin>(writer: &mut W, path: &str, peer: &str) {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(peer = %peer, path = %path, error = %e, "read: cannot open file");
            let resp = Response::error(format!("cannot open file: {e}"));
            write_response(writer, &resp, peer).await;
            return;
        }
    };

    match tokio::io::copy(&mut file, writer).await {
        Ok(n) => info!(peer = %peer, path = %path, bytes = n, "read complete"),
        // Usually the host hanging up mid-transfer; the data is unframed, so
        // there is nothing more to tell it.
        Err(e) => debug!(peer = %peer, path = %path, error = %e, "read interrupted"),
    }
}

// ---------------------------------------------------------------------------
// Exec
// ---------------------------------------------------------------------------

/// Run `raw` through `<shell> -c` and relay stdout and stderr to the host
/// as they arrive. Returns once the process has exited and both streams are
/// drained. The exit status is only logged.
///
/// Commands run with full daemon privileges. The host is trusted; the VM is
/// the isolation boundary.
pub async fn handle_exec<W: AsyncWrite + Unpin>(writer: &mut W, raw: &str, shell: &Path, peer: &str) {
    let spawned = Command::new(shell)
        .arg("-c")
        .arg(raw)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(c) => c,
        Err(e) => {
            warn!(peer = %peer, shell = %shell.display(), error = %e, "exec: failed to start command");
            let resp = Response::error(format!("cannot start command: {e}"));
            write_response(writer, &resp, peer).await;
            return;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (relayed, status) = tokio::join!(relay_output(stdout, stderr, writer, peer), child.wait());

    match status {
        Ok(status) => info!(
            peer = %peer,
            exit_code = status.code().unwrap_or(-1),
            relayed_bytes = relayed,
            "exec complete"
        ),
        Err(e) => warn!(peer = %peer, error = %e, "exec: failed to wait on command"),
    }
}

/// Forward chunks from both child streams to `writer` in arrival order until
/// both reach EOF. Once the host stops accepting data, output is drained and
/// dropped so the child never stalls on a full pipe. Returns the number of
/// bytes delivered.
async fn relay_output<W: AsyncWrite + Unpin>(
    mut stdout: Option<ChildStdout>,
    mut stderr: Option<ChildStderr>,
    writer: &mut W,
    peer: &str,
) -> u64 {
    let mut out_buf = vec![0u8; COPY_BUF_SIZE];
    let mut err_buf = vec![0u8; COPY_BUF_SIZE];
    let mut relayed: u64 = 0;
    let mut host_open = true;

    while stdout.is_some() || stderr.is_some() {
        let (from_stdout, result) = tokio::select! {
            r = read_chunk(&mut stdout, &mut out_buf) => (true, r),
            r = read_chunk(&mut stderr, &mut err_buf) => (false, r),
        };

        let n = match result {
            Ok(n) if n > 0 => n,
            closed => {
                if let Err(e) = closed {
                    debug!(peer = %peer, from_stdout, error = %e, "exec: output stream error");
                }
                if from_stdout {
                    stdout = None;
                } else {
                    stderr = None;
                }
                continue;
            }
        };

        if !host_open {
            continue;
        }
        let chunk = if from_stdout { &out_buf[..n] } else { &err_buf[..n] };
        let written = async {
            writer.write_all(chunk).await?;
            writer.flush().await
        }
        .await;
        match written {
            Ok(()) => relayed += n as u64,
            Err(e) => {
                debug!(peer = %peer, error = %e, "exec: host stopped reading, discarding output");
                host_open = false;
            }
        }
    }

    relayed
}

/// Read from `src` if it is still open; a closed stream never completes so
/// it drops out of the `select!`.
async fn read_chunk<R: AsyncRead + Unpin>(src: &mut Option<R>, buf: &mut [u8]) -> io::Result<usize> {
    match src {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_exact_full() {
        let mut src: &[u8] = b"0123456789";
        let mut dst = Vec::new();
        let (n, res) = copy_exact(&mut src, &mut dst, 4).await;
        assert!(res.is_ok());
        assert_eq!(n, 4);
        assert_eq!(dst, b"0123");
        // the rest stays unread
        assert_eq!(src, b"456789");
    }

    #[tokio::test]
    async fn test_copy_exact_short_input() {
        let mut src: &[u8] = &[7u8; 40];
        let mut dst = Vec::new();
        let (n, res) = copy_exact(&mut src, &mut dst, 100).await;
        assert_eq!(n, 40);
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(dst.len(), 40);
    }

    #[tokio::test]
    async fn test_copy_exact_zero() {
        let mut src: &[u8] = b"ignored";
        let mut dst = Vec::new();
        let (n, res) = copy_exact(&mut src, &mut dst, 0).await;
        assert!(res.is_ok());
        assert_eq!(n, 0);
        assert!(dst.is_empty());
    }

    #[tokio::test]
    async fn test_copy_exact_spans_many_chunks() {
        let data: Vec<u8> = (0..(COPY_BUF_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let mut src: &[u8] = &data;
        let mut dst = Vec::new();
        let (n, res) = copy_exact(&mut src, &mut dst, data.len() as u64).await;
        assert!(res.is_ok());
        assert_eq!(n, data.len() as u64);
        assert_eq!(dst, data);
    }

    #[tokio::test]
    async fn test_exec_relays_stdout_and_stderr() {
        let mut out = Vec::new();
        handle_exec(&mut out, "echo out; echo err 1>&2", Path::new("/bin/sh"), "test").await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
    }

    #[tokio::test]
    async fn test_exec_missing_shell() {
        let mut out = Vec::new();
        handle_exec(&mut out, "true", Path::new("/nonexistent/sh"), "test").await;
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("ERR cannot start command:"), "{text}");
        assert!(text.ends_with('\n'));
    }

    /// Accepts up to `budget` bytes, then fails every write as if the host
    /// had hung up.
    struct HungUp {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl HungUp {
        fn after(budget: usize) -> Self {
            Self {
                accepted: Vec::new(),
                budget,
            }
        }
    }

    impl AsyncWrite for HungUp {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            let room = self.budget - self.accepted.len();
            if room == 0 {
                return std::task::Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            let n = room.min(buf.len());
            self.accepted.extend_from_slice(&buf[..n]);
            std::task::Poll::Ready(Ok(n))
        }
        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_copy_exact_counts_only_bytes_the_file_took() {
        if !Path::new("/dev/full").exists() {
            return;
        }
        // Every write to /dev/full fails with ENOSPC once flushed.
        let mut dst = File::create("/dev/full").await.unwrap();
        let mut src: &[u8] = b"hello";
        let (n, res) = copy_exact(&mut src, &mut dst, 5).await;
        assert_eq!(n, 0);
        assert_eq!(res.unwrap_err().raw_os_error(), Some(libc::ENOSPC));

        // The write error wins over the short input.
        let mut dst = File::create("/dev/full").await.unwrap();
        let mut src: &[u8] = b"hello";
        let (n, res) = copy_exact(&mut src, &mut dst, 10).await;
        assert_eq!(n, 0);
        assert_eq!(res.unwrap_err().raw_os_error(), Some(libc::ENOSPC));
    }

    #[tokio::test]
    async fn test_read_ends_quietly_when_host_leaves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big");
        std::fs::write(&path, vec![b'a'; 1_000_000]).unwrap();

        let mut writer = HungUp::after(1000);
        let done = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            handle_read(&mut writer, path.to_str().unwrap(), "test"),
        )
        .await;
        assert!(done.is_ok(), "read stalled once the host went away");
        assert_eq!(writer.accepted.len(), 1000);
        assert!(writer.accepted.iter().all(|&b| b == b'a'), "no status line after data");
    }

    #[tokio::test]
    async fn test_exec_keeps_draining_after_host_leaves() {
        // The child must still run to exit.
        let mut writer = HungUp::after(0);
        let done = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            handle_exec(&mut writer, "head -c 1000000 /dev/zero", Path::new("/bin/sh"), "test"),
        )
        .await;
        assert!(done.is_ok(), "exec stalled once the host went away");
        assert!(writer.accepted.is_empty());
    }
}
