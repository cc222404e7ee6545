use std::cmp::min;
use std::future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, bail};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::client::conn::http1;
use hyper::{header, Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::{select, time};
use tracing::{debug, info, trace, warn};

use crate::session::session_start::Registration;

pub const REGISTER_PATH: &str = "/register";

/// An open HTTP/1 connection to the broker.
pub struct BrokerConnection {
    sender: http1::SendRequest<Full<Bytes>>,
    connection: JoinHandle<()>,
    persistent: bool,
}
impl BrokerConnection {
    pub async fn connect(addr: SocketAddr) -> anyhow::Result<BrokerConnection> {
        let stream = TcpStream::connect(addr).await?;
        let (sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
        let connection = tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("connection to {:?} closed with error: {:?}", addr, err);
            }
        });

        Ok(BrokerConnection {
            sender,
            connection,
            persistent: true,
        })
    }

    pub async fn send(&mut self, method: Method, path: &str, body: Bytes) -> anyhow::Result<(StatusCode, Bytes)> {
        self.sender.ready().await?;

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, "broker")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Full::new(body))?;

        let response = self.sender.send_request(request).await?;
        self.persistent = is_keep_alive(&response);
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        Ok((status, body))
    }

    /// `false` if the last response announced that the broker closes the connection after it
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// completes when the connection is closed, typically by the broker
    pub async fn closed(&mut self) {
        if let Err(e) = (&mut self.connection).await {
            warn!("broker connection task failed: {}", e);
        }
    }
}

fn is_keep_alive(response: &Response<Incoming>) -> bool {
    let has_token = |token: &str| response.headers().get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token));

    if response.version() == Version::HTTP_10 {
        has_token("keep-alive")
    }
    else {
        !has_token("close")
    }
}

/// Registration with the broker, with a timeout and one retry per attempt.
pub struct BrokerClient {
    broker_addr: SocketAddr,
    timeout: Duration,
}

impl BrokerClient {
    pub fn new(broker_addr: SocketAddr, timeout: Duration) -> BrokerClient {
        BrokerClient {
            broker_addr,
            timeout,
        }
    }

    pub fn broker_addr(&self) -> SocketAddr {
        self.broker_addr
    }

    /// Registers this node with the broker, retrying once if the first attempt fails or times
    ///  out.
    pub async fn register(&self, registration: &Registration) -> anyhow::Result<BrokerConnection> {
        let body = Bytes::from(serde_json::to_vec(registration)?);

        match self.try_register(body.clone()).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                warn!("registration with broker {} failed, retrying once: {:#}", self.broker_addr, e);
                self.try_register(body).await
            }
        }
    }

    async fn try_register(&self, body: Bytes) -> anyhow::Result<BrokerConnection> {
        let attempt = async {
            let mut connection = BrokerConnection::connect(self.broker_addr).await?;
            let (status, response_body) = connection.send(Method::POST, REGISTER_PATH, body).await?;
            if !status.is_success() {
                bail!("broker rejected registration with {}: {}", status, String::from_utf8_lossy(&response_body));
            }
            Ok(connection)
        };

        let connection = time::timeout(self.timeout, attempt).await
            .map_err(|_| anyhow!("no response from broker {} within {:?}", self.broker_addr, self.timeout))??;
        debug!("registered with broker {}", self.broker_addr);
        Ok(connection)
    }
}

/// A node's registration with the broker, kept alive by re-posting it every `check_interval`.
///
/// A re-registration that fails (after its retry) means that the broker is lost. A persistent
///  connection being closed is not a loss by itself, since brokers close idle connections, but
///  it triggers a re-registration right away, at most once per `min_spacing`.
pub struct BrokerLink {
    registration: Registration,
    check_interval: Duration,
    min_spacing: Duration,
    registered_at: Instant,
    connection: Option<BrokerConnection>,
}

impl BrokerLink {
    pub async fn register(client: &BrokerClient, registration: Registration, check_interval: Duration, min_spacing: Duration) -> anyhow::Result<BrokerLink> {
        let connection = client.register(&registration).await?;
        info!("registered with broker {}", client.broker_addr());

        let mut result = BrokerLink {
            registration,
            check_interval,
            min_spacing,
            registered_at: Instant::now(),
            connection: None,
        };
        result.keep(connection);
        Ok(result)
    }

    fn keep(&mut self, connection: BrokerConnection) {
        self.registered_at = Instant::now();
        if connection.is_persistent() {
            self.connection = Some(connection);
        }
        else {
            trace!("broker does not keep the connection open - relying on periodic re-registration");
            self.connection = None;
        }
    }

    async fn connection_closed(connection: &mut Option<BrokerConnection>) {
        match connection {
            Some(connection) => connection.closed().await,
            None => future::pending().await,
        }
    }

    /// Completes when the broker is lost, returning the reason. Timing state is kept in the
    ///  link, so dropping the returned future and calling this again does not delay the next
    ///  check.
    pub async fn lost(&mut self, client: &BrokerClient) -> anyhow::Error {
        loop {
            select! {
                _ = Self::connection_closed(&mut self.connection) => {
                    debug!("broker connection closed - re-registering");
                    self.connection = None;
                    time::sleep_until(self.registered_at + self.min_spacing).await;
                }
                _ = time::sleep_until(self.registered_at + self.check_interval) => {
                    trace!("re-registering with broker {}", client.broker_addr());
                }
            }

            match client.register(&self.registration).await {
                Ok(connection) => self.keep(connection),
                Err(e) => {
                    self.connection = None;
                    return e;
                }
            }
        }
    }
}

/// Delays between re-registration attempts: doubling from an initial delay, up to a maximum.
pub struct RetryDelay {
    next: Duration,
    max: Duration,
}

impl RetryDelay {
    pub fn new(initial: Duration, max: Duration) -> RetryDelay {
        RetryDelay {
            next: min(initial, max),
            max,
        }
    }

    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        let result = self.next;
        self.next = min(self.next.saturating_mul(2), self.max);
        result
    }
}
