//! HTTP server hosting the WebDAV view, built on hyper.

use super::AvfsDavFs;
use crate::handler::ArchiveFs;
use dav_server::DavHandler;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// Handle to a WebDAV server running in the background.
pub struct AvfsWebDavServer {
    addr: SocketAddr,
    fs: Arc<ArchiveFs>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl AvfsWebDavServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL to mount this server from a WebDAV client.
    pub fn mount_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn archive_fs(&self) -> &ArchiveFs {
        &self.fs
    }

    /// Stop accepting connections and unmount the archive.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.fs.unmount();
    }
}

/// Mount `fs` if needed and build the request handler for it.
fn dav_handler(fs: &Arc<ArchiveFs>) -> io::Result<DavHandler> {
    if !fs.is_mounted() {
        fs.mount()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    }

    Ok(DavHandler::builder()
        .filesystem(Box::new(AvfsDavFs::new(Arc::clone(fs))))
        .build_handler())
}

fn spawn_connection(stream: TcpStream, dav_server: DavHandler) {
    let io = TokioIo::new(stream);
    tokio::spawn(async move {
        if let Err(err) = http1::Builder::new()
            .serve_connection(
                io,
                service_fn(move |req| {
                    let dav_server = dav_server.clone();
                    async move { Ok::<_, Infallible>(dav_server.handle(req).await) }
                }),
            )
            .await
        {
            error!("Connection error: {:?}", err);
        }
    });
}

/// Serve `fs` over WebDAV on localhost and block until the process exits.
///
/// Port 0 picks a free port.
pub async fn serve(fs: ArchiveFs, port: u16) -> io::Result<()> {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let fs = Arc::new(fs);
    let dav_server = dav_handler(&fs)?;

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    info!(
        "Serving '{}' read-only on http://{}",
        fs.config().volume_label,
        local_addr
    );
    info!("Mount it with any WebDAV client, for example:");
    info!("  mount -t davfs http://{} /mnt/avfs", local_addr);
    info!("Press Ctrl+C to stop the server");

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        debug!("Connection from {}", remote_addr);
        spawn_connection(stream, dav_server.clone());
    }
}

/// Serve `fs` over WebDAV in the background.
pub async fn serve_background(fs: ArchiveFs, port: u16) -> io::Result<AvfsWebDavServer> {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let fs = Arc::new(fs);
    let dav_server = dav_handler(&fs)?;

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    info!("WebDAV server started on http://{}", local_addr);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            debug!("Connection from {}", remote_addr);
                            spawn_connection(stream, dav_server.clone());
                        }
                        Err(e) => error!("Accept error: {:?}", e),
                    }
                }
                _ = &mut shutdown_rx => {
                    info!("WebDAV server shutting down");
                    break;
                }
            }
        }
    });

    Ok(AvfsWebDavServer {
        addr: local_addr,
        fs,
        shutdown_tx: Some(shutdown_tx),
    })
}
