use std::net::{IpAddr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::unix::AsyncFd;
use tokio::io::ReadBuf;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;
use crate::connection::handle_connection;

// ---------------------------------------------------------------------------
// Vsock listener
// ---------------------------------------------------------------------------

const AF_VSOCK: i32 = 40;
const VMADDR_CID_ANY: u32 = u32::MAX;

#[repr(C)]
struct SockaddrVm {
    svm_family: u16,
    svm_reserved1: u16,
    svm_port: u32,
    svm_cid: u32,
    svm_flags: u8,
    svm_zero: [u8; 3],
}

/// The host-facing control socket: `AF_VSOCK` on the port read from the
/// port file, bound to any CID so the hypervisor side can reach it.
pub struct VsockListener {
    async_fd: AsyncFd<OwnedFd>,
}

impl VsockListener {
    pub fn bind(port: u32) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                AF_VSOCK,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                0,
            )
        };
        if fd < 0 {
            bail!(
                "socket(AF_VSOCK) failed: {}",
                std::io::Error::last_os_error()
            );
        }
        // Owned from here on so every early return closes it.
        let owned_fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let addr = SockaddrVm {
            svm_family: AF_VSOCK as u16,
            svm_reserved1: 0,
            svm_port: port,
            svm_cid: VMADDR_CID_ANY,
            svm_flags: 0,
            svm_zero: [0; 3],
        };

        let ret = unsafe {
            libc::bind(
                owned_fd.as_raw_fd(),
                &addr as *const SockaddrVm as *const libc::sockaddr,
                std::mem::size_of::<SockaddrVm>() as u32,
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            bail!("bind(vsock port {port}) failed: {err}");
        }

        let ret = unsafe { libc::listen(owned_fd.as_raw_fd(), 128) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            bail!("listen(vsock) failed: {err}");
        }

        let async_fd = AsyncFd::new(owned_fd).context("registering vsock listener")?;
        Ok(Self { async_fd })
    }

    /// Wait for the next host command connection. The CID is only used to
    /// tag the connection's log lines.
    pub async fn accept(&self) -> std::io::Result<(VsockStream, u32)> {
        loop {
            let mut guard = self.async_fd.readable().await?;

            match guard.try_io(|inner| {
                let client_fd = unsafe {
                    libc::accept4(
                        inner.get_ref().as_raw_fd(),
                        std::ptr::null_mut(),
                        std::ptr::null_mut(),
                        libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                    )
                };
                if client_fd >= 0 {
                    Ok(client_fd)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(Ok(client_fd)) => {
                    let owned = unsafe { OwnedFd::from_raw_fd(client_fd) };
                    let peer_cid = peer_cid(&owned);
                    let stream = VsockStream::new(owned)?;
                    return Ok((stream, peer_cid));
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }
}

/// CID of the connected peer, for logging only.
fn peer_cid(fd: &OwnedFd) -> u32 {
    let mut peer_addr: SockaddrVm = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<SockaddrVm>() as u32;
    unsafe {
        libc::getpeername(
            fd.as_raw_fd(),
            &mut peer_addr as *mut SockaddrVm as *mut libc::sockaddr,
            &mut addr_len,
        );
    }
    peer_addr.svm_cid
}

/// One host connection: the command line and upload payload come in, the
/// status line, file bytes or exec output go out. Dropping it is how the
/// daemon signals end of response to the host.
pub struct VsockStream {
    inner: AsyncFd<OwnedFd>,
}

impl VsockStream {
    fn new(fd: OwnedFd) -> std::io::Result<Self> {
        let inner = AsyncFd::new(fd)?;
        Ok(Self { inner })
    }
}

impl tokio::io::AsyncRead for VsockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            let mut guard = match self.inner.poll_read_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe {
                    libc::read(fd, unfilled.as_mut_ptr() as *mut libc::c_void, unfilled.len())
                };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl tokio::io::AsyncWrite for VsockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        loop {
            let mut guard = match self.inner.poll_write_ready(cx) {
                Poll::Ready(Ok(guard)) => guard,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            match guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
                if n >= 0 {
                    Ok(n as usize)
                } else {
                    Err(std::io::Error::last_os_error())
                }
            }) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        let fd = self.inner.get_ref().as_raw_fd();
        let ret = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
        if ret == 0 {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(std::io::Error::last_os_error()))
        }
    }
}

// ---------------------------------------------------------------------------
// Binding
// ---------------------------------------------------------------------------

pub enum Listener {
    Vsock(VsockListener),
    Tcp(TcpListener),
}

/// Kernel objects providing the guest end of virtio-vsock, in load order.
const VSOCK_MODULES: [&str; 3] = [
    "vsock.ko",
    "vmw_vsock_virtio_transport_common.ko",
    "vmw_vsock_virtio_transport.ko",
];

fn kernel_release() -> String {
    std::process::Command::new("uname")
        .arg("-r")
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Best effort: images that start nodectld as init can come up before
/// anything has loaded the vsock transport, so the control port would never
/// bind. Failures are logged and left for the bind retries to report.
fn load_vsock_modules() {
    let release = kernel_release();
    let dir = format!("/lib/modules/{release}/kernel/net/vmw_vsock");
    info!(kernel = %release, "control port unbound, loading vsock transport");

    for module in VSOCK_MODULES {
        let path = format!("{dir}/{module}");
        match std::process::Command::new("insmod").arg(&path).output() {
            Ok(out) if out.status.success() => info!(module, "loaded"),
            // EEXIST: already in the kernel
            Ok(out) if String::from_utf8_lossy(&out.stderr).contains("File exists") => {}
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                warn!(module, path = %path, error = %stderr.trim(), "insmod failed");
            }
            Err(e) => warn!(module, error = %e, "cannot run insmod"),
        }
    }
}

const BIND_RETRIES: u32 = 20;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Bind the control channel. Vsock first, loading the transport modules if
/// needed; TCP on `tcp_fallback` only when one is configured. Any other
/// outcome is an error and the daemon exits.
pub async fn listen(port: u32, tcp_fallback: Option<IpAddr>) -> Result<Listener> {
    let mut last_err = match VsockListener::bind(port) {
        Ok(listener) => {
            info!(port, "listening on vsock");
            return Ok(Listener::Vsock(listener));
        }
        Err(e) => {
            info!(error = %e, "vsock not available, loading kernel modules");
            e
        }
    };

    load_vsock_modules();
    for attempt in 0..BIND_RETRIES {
        tokio::time::sleep(BIND_RETRY_DELAY).await;
        match VsockListener::bind(port) {
            Ok(listener) => {
                info!(port, attempt, "listening on vsock (after module load)");
                return Ok(Listener::Vsock(listener));
            }
            Err(e) => last_err = e,
        }
    }

    let Some(ip) = tcp_fallback else {
        return Err(last_err.context(format!("cannot listen on vsock port {port}")));
    };

    warn!(error = %last_err, port, "vsock unavailable, falling back to TCP");
    let listener = bind_tcp(ip, port).await?;
    if !ip.is_loopback() {
        warn!(addr = %ip, "TCP fallback is reachable from the network without authentication");
    }
    Ok(Listener::Tcp(listener))
}

async fn bind_tcp(ip: IpAddr, port: u32) -> Result<TcpListener> {
    let port = u16::try_from(port).with_context(|| format!("port {port} does not fit TCP"))?;
    let addr = SocketAddr::new(ip, port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind TCP fallback on {addr}"))?;
    info!(addr = %addr, "listening on TCP (fallback)");
    Ok(listener)
}

// ---------------------------------------------------------------------------
// Accept loop
// ---------------------------------------------------------------------------

/// Accept connections forever, one task per connection. Accept failures
/// are logged and the loop carries on at once.
pub async fn serve(listener: Listener, config: Arc<Config>) {
    match listener {
        Listener::Vsock(vsock) => loop {
            match vsock.accept().await {
                Ok((stream, peer_cid)) => {
                    let peer = format!("vsock:cid={peer_cid}");
                    let (reader, writer) = tokio::io::split(stream);
                    tokio::spawn(handle_connection(reader, writer, peer, config.clone()));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        },
        Listener::Tcp(tcp) => loop {
            match tcp.accept().await {
                Ok((stream, addr)) => {
                    let peer = format!("tcp:{addr}");
                    let (reader, writer) = stream.into_split();
                    tokio::spawn(handle_connection(reader, writer, peer, config.clone()));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        },
    }
}
