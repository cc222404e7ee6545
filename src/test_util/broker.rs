use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::session::session_start::Registration;

/// An in-process broker that accepts registrations and reports them. It only implements the
///  registration endpoint, session notifications are sent by tests directly.
pub struct TestBroker {
    pub addr: SocketAddr,
    pub registrations: mpsc::UnboundedReceiver<Registration>,
    num_requests: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl TestBroker {
    pub async fn spawn() -> TestBroker {
        Self::spawn_with(0, false).await
    }

    /// The first `num_failures` registrations are answered with 503. With `close_connections`,
    ///  every response carries `Connection: close`.
    pub async fn spawn_with(num_failures: usize, close_connections: bool) -> TestBroker {
        let listener = TcpListener::bind("127.0.0.1:0").await
            .expect("test broker should bind to a local port");
        let addr = listener.local_addr()
            .expect("bound listener should have an address");
        let (sender, registrations) = mpsc::unbounded_channel();
        let num_requests = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let counter = num_requests.clone();
        let broker_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let stream = select! {
                    _ = broker_shutdown.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => stream,
                        Err(_) => return,
                    },
                };

                let sender = sender.clone();
                let counter = counter.clone();
                let connection_shutdown = broker_shutdown.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let sender = sender.clone();
                        let counter = counter.clone();
                        async move {
                            let previous = counter.fetch_add(1, Ordering::SeqCst);
                            let body = req.into_body().collect().await?.to_bytes();

                            let mut response = Response::new(Full::new(Bytes::new()));
                            if previous < num_failures {
                                *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                            }
                            else if let Ok(registration) = serde_json::from_slice::<Registration>(&body) {
                                let _ = sender.send(registration);
                            }
                            else {
                                *response.status_mut() = StatusCode::BAD_REQUEST;
                            }
                            if close_connections {
                                response.headers_mut().insert(header::CONNECTION, header::HeaderValue::from_static("close"));
                            }
                            Ok::<_, hyper::Error>(response)
                        }
                    });

                    select! {
                        _ = connection_shutdown.cancelled() => {}
                        _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service) => {}
                    }
                });
            }
        });

        TestBroker {
            addr,
            registrations,
            num_requests,
            shutdown,
        }
    }

    /// the number of registration requests so far, including rejected ones
    pub fn num_requests(&self) -> usize {
        self.num_requests.load(Ordering::SeqCst)
    }

    /// closes the listener and all open connections
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
