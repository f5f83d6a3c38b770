//! The readiness HTTP listener.
//!
//! Every role serves `/ready`: 503 while starting, 200 once every
//! subservice reached `Running`. The query surface itself is served by a
//! separate component and is not part of this binary.

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, StatusCode,
};
use observability_deps::tracing::info;
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio_util::sync::CancellationToken;

async fn route(req: Request<Body>, ready: Arc<AtomicBool>) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/ready") => {
            if ready.load(Ordering::SeqCst) {
                Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ready\n"))
            } else {
                Response::builder()
                    .status(StatusCode::SERVICE_UNAVAILABLE)
                    .body(Body::from("starting\n"))
            }
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty()),
    };
    Ok(response.expect("static response builders"))
}

/// Serve `/ready` on `addr` until `shutdown`.
pub async fn serve(
    addr: SocketAddr,
    ready: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> Result<(), String> {
    let make_service = make_service_fn(move |_conn| {
        let ready = Arc::clone(&ready);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| route(req, Arc::clone(&ready))))
        }
    });

    let server = hyper::Server::try_bind(&addr)
        .map_err(|e| format!("binding {addr}: {e}"))?
        .serve(make_service);
    info!(%addr, "http listener up");

    server
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| format!("http server: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn get_status(req_path: &str, ready: bool) -> StatusCode {
        let flag = Arc::new(AtomicBool::new(ready));
        let req = Request::builder()
            .method(Method::GET)
            .uri(req_path)
            .body(Body::empty())
            .unwrap();
        route(req, flag).await.unwrap().status()
    }

    #[tokio::test]
    async fn ready_endpoint_tracks_flag() {
        assert_eq!(
            get_status("/ready", false).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(get_status("/ready", true).await, StatusCode::OK);
        assert_eq!(get_status("/other", true).await, StatusCode::NOT_FOUND);
    }
}
