//! Actix Web preview server exposing the latest segmentation outputs.
//!
//! The server runs on a dedicated thread so the dispatcher never touches the
//! Actix runtime. Handlers only read the [`PreviewBoard`].

use std::{net::SocketAddr, sync::Arc, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use tokio::sync::oneshot;
use tracing::{error, info};
use vision::{OutputChannel, pipeline::telemetry};

use crate::{html::INDEX_HTML, preview::board::PreviewBoard};

#[derive(Default)]
/// Handle for the preview server thread.
pub struct PreviewServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PreviewServer {
    /// Signal the server to stop and block until the thread exits.
    pub fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Spawn the preview server thread bound to `addr`.
pub fn spawn_preview_server(addr: SocketAddr, board: Arc<PreviewBoard>) -> Result<PreviewServer> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = telemetry::spawn_thread("seg-preview-server", move || {
        if let Err(err) = actix_web::rt::System::new().block_on(async move {
            let data = web::Data::from(board);
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(data.clone())
                    .route("/", web::get().to(index_route))
                    .route("/status", web::get().to(status_handler))
                    .route("/metrics", web::get().to(metrics_handler))
                    .route("/stream.mjpg", web::get().to(stream_handler))
                    .route("/{topic}.png", web::get().to(image_handler))
            })
            .workers(1)
            .bind(addr)?
            .run();

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        }) {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn preview server thread")?;
    info!("HTTP preview available at http://{addr}/ (stream at /stream.mjpg)");
    Ok(PreviewServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
    })
}

async fn index_route() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(INDEX_HTML)
}

/// Latest PNG for one output topic, e.g. `/seg_image.png`.
async fn image_handler(topic: web::Path<String>, board: web::Data<PreviewBoard>) -> HttpResponse {
    let Some(channel) = OutputChannel::from_topic(&topic) else {
        return HttpResponse::NotFound().body(format!("unknown topic {topic}"));
    };
    match board.png(channel) {
        Some(png) => HttpResponse::Ok()
            .content_type("image/png")
            .append_header(("Cache-Control", "no-cache"))
            .body(png),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn status_handler(board: web::Data<PreviewBoard>) -> HttpResponse {
    HttpResponse::Ok().json(board.status())
}

async fn metrics_handler() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

/// Stream the overlay as MJPEG over a multipart response.
async fn stream_handler(board: web::Data<PreviewBoard>) -> HttpResponse {
    let stream = stream! {
        let mut interval = actix_web::rt::time::interval(Duration::from_millis(33));
        let mut last_sent = 0u64;
        loop {
            interval.tick().await;
            let Some((frame, jpeg)) = board.overlay_jpeg() else {
                continue;
            };
            if frame == last_sent {
                continue;
            }
            last_sent = frame;
            let mut payload = Vec::with_capacity(jpeg.len() + 64);
            payload.extend_from_slice(b"--frame\r\n");
            payload.extend_from_slice(format!("X-Sequence: {frame}\r\n").as_bytes());
            payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
            payload.extend_from_slice(&jpeg);
            payload.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(payload));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Content-Type", "multipart/x-mixed-replace; boundary=frame"))
        .streaming(stream)
}
