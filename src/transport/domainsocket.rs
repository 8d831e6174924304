//! Unix domain socket transport
//!
//! Pathname sockets take an advisory `flock` on `<path>.lock` so two
//! processes cannot bind the same path; the lock file is removed on
//! graceful close. Paths starting with `@` are abstract sockets and
//! skip both the lock and filesystem cleanup.

use std::fs::File;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::Destination;
use crate::error::{Error, Result};

use super::{ConnHandler, Connection, Dialer, Listener, ListenerBuilder, StreamSettings};

fn socket_path(settings: &StreamSettings) -> Result<String> {
    settings
        .unix_path
        .clone()
        .ok_or_else(|| Error::Config("domainsocket requires unix_path".into()))
}

/// Advisory lock guarding a pathname socket.
struct FileLocker {
    path: PathBuf,
    file: File,
}

impl FileLocker {
    fn acquire(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            return Err(Error::Transport(format!(
                "failed to lock {}: another instance holds it",
                path.display()
            )));
        }
        Ok(Self { path, file })
    }
}

impl Drop for FileLocker {
    fn drop(&mut self) {
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            warn!("failed to unlock {}", self.path.display());
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("failed to remove {}: {}", self.path.display(), e);
        }
    }
}

/// Domain socket dialer
pub struct DomainSocketDialer;

#[async_trait]
impl Dialer for DomainSocketDialer {
    async fn dial(&self, _dest: &Destination, settings: &StreamSettings) -> Result<Connection> {
        let path = socket_path(settings)?;
        let stream = UnixStream::connect(&path).await?;
        Ok(Connection::from_stream(stream, None, None))
    }
}

/// Domain socket listener
pub struct DomainSocketListenerBuilder;

#[async_trait]
impl ListenerBuilder for DomainSocketListenerBuilder {
    async fn listen(
        &self,
        _addr: SocketAddr,
        settings: &StreamSettings,
        handler: ConnHandler,
    ) -> Result<Box<dyn Listener>> {
        let path = socket_path(settings)?;
        let abstract_socket = path.starts_with('@');

        let locker = if abstract_socket {
            None
        } else {
            // A stale socket file from a crashed run blocks bind; the
            // lock tells a live owner apart from a dead one.
            let locker = FileLocker::acquire(PathBuf::from(format!("{}.lock", path)))?;
            let _ = std::fs::remove_file(&path);
            Some(locker)
        };

        let listener = UnixListener::bind(&path)
            .map_err(|e| Error::Transport(format!("failed to listen domain socket {}: {}", path, e)))?;
        let token = CancellationToken::new();

        let accept_token = token.clone();
        let socket_file = if abstract_socket { None } else { Some(path.clone()) };
        tokio::spawn(async move {
            let _locker = locker;
            loop {
                let stream = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(e) => {
                            warn!("domainsocket accept error: {}", e);
                            continue;
                        }
                    },
                    _ = accept_token.cancelled() => {
                        debug!("domainsocket listener closed");
                        if let Some(path) = &socket_file {
                            let _ = std::fs::remove_file(path);
                        }
                        return;
                    }
                };
                handler(Connection::from_stream(stream, None, None));
            }
        });

        Ok(Box::new(DomainSocketListenerHandle { token }))
    }
}

struct DomainSocketListenerHandle {
    token: CancellationToken,
}

impl Listener for DomainSocketListenerHandle {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn close(&self) {
        self.token.cancel();
    }
}
