use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::session::session_start::SessionStart;

pub const SESSION_PATH: &str = "/session";

/// What the broker tells a node to do
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlEvent {
    StartSession(SessionStart),
    StopSession,
    /// the broker sent a session start that could not be parsed
    MalformedSessionStart(String),
}

/// Accepts the broker's session notifications: `POST /session` with a [SessionStart] body, and
///  `DELETE /session`. Each connection is served on its own task and carries a single request,
///  and connections that do not complete within `request_timeout` are dropped.
pub async fn run_control_server(listener: TcpListener, events: mpsc::Sender<ControlEvent>, request_timeout: Duration) -> anyhow::Result<()> {
    info!("control listener on http://{}", listener.local_addr()?);
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("control connection from {:?}", peer);
        let io = TokioIo::new(stream);

        let events = events.clone();
        let service = service_fn(move |req| {
            let events = events.clone();
            async move {
                Ok::<_, hyper::Error>(on_request(req, &events).await)
            }
        });

        tokio::spawn(async move {
            let connection = http1::Builder::new()
                .keep_alive(false)
                .serve_connection(io, service);
            match time::timeout(request_timeout, connection).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!("error serving control connection from {:?}: {:?}", peer, err),
                Err(_) => warn!("control connection from {:?} did not complete a request within {:?} - closing", peer, request_timeout),
            }
        });
    }
}

async fn on_request(req: Request<Incoming>, events: &mpsc::Sender<ControlEvent>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let event = match (&method, path.as_str()) {
        (&Method::POST, SESSION_PATH) => {
            let body = match req.into_body().collect().await {
                Ok(body) => body.to_bytes(),
                Err(e) => {
                    warn!("error reading session start: {}", e);
                    return response(StatusCode::BAD_REQUEST, e.to_string());
                }
            };
            match serde_json::from_slice::<SessionStart>(&body) {
                Ok(start) => ControlEvent::StartSession(start),
                Err(e) => ControlEvent::MalformedSessionStart(e.to_string()),
            }
        }
        (&Method::DELETE, SESSION_PATH) => ControlEvent::StopSession,
        (method, path) => {
            debug!("unsupported control request {} {}", method, path);
            return response(StatusCode::NOT_FOUND, "");
        }
    };

    let result = match &event {
        ControlEvent::MalformedSessionStart(reason) => response(StatusCode::BAD_REQUEST, reason.clone()),
        _ => response(StatusCode::ACCEPTED, ""),
    };

    if events.send(event).await.is_err() {
        return response(StatusCode::SERVICE_UNAVAILABLE, "node is shutting down");
    }
    result
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}
