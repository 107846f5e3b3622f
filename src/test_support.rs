//! Shared helpers for unit tests: a scripted in-process device and
//! synthetic JPEG payloads.

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, RgbImage};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;

pub(crate) type DeviceSocket = WebSocketStream<TcpStream>;

/// Encode a small gradient image as JPEG
pub(crate) fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8])
    });

    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, 90)
        .encode(image.as_raw(), width, height, ColorType::Rgb8)
        .unwrap();
    buffer
}

/// Poll `condition` until it holds or five seconds pass
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// WebSocket server standing in for the camera device
pub(crate) struct FakeDevice {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    requested_paths: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeDevice {
    /// Accept every upgrade, on any path
    pub(crate) async fn spawn<H, Fut>(handler: H) -> Self
    where
        H: Fn(DeviceSocket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn_on_path(None, handler).await
    }

    /// Reject upgrades (HTTP 404) unless the request path equals `path`
    pub(crate) async fn spawn_on_path<H, Fut>(path: Option<&'static str>, handler: H) -> Self
    where
        H: Fn(DeviceSocket) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let requested_paths = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(handler);

        let task = {
            let accepted = Arc::clone(&accepted);
            let requested_paths = Arc::clone(&requested_paths);
            tokio::spawn(async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    let accepted = Arc::clone(&accepted);
                    let requested_paths = Arc::clone(&requested_paths);
                    let handler = Arc::clone(&handler);

                    tokio::spawn(async move {
                        let callback = move |request: &Request, response: Response| {
                            let requested = request.uri().path().to_string();
                            requested_paths.lock().push(requested.clone());
                            match path {
                                Some(expected) if requested != expected => {
                                    let mut rejection = ErrorResponse::new(Some("not found".into()));
                                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                                    Err(rejection)
                                }
                                _ => Ok(response),
                            }
                        };

                        if let Ok(socket) =
                            tokio_tungstenite::accept_hdr_async(tcp, callback).await
                        {
                            accepted.fetch_add(1, Ordering::SeqCst);
                            handler(socket).await;
                        }
                    });
                }
            })
        };

        Self {
            addr,
            accepted,
            requested_paths,
            task,
        }
    }

    /// `host:port` without a scheme
    pub(crate) fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Completed WebSocket upgrades
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub(crate) fn requested_paths(&self) -> Vec<String> {
        self.requested_paths.lock().clone()
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}
