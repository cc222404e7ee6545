use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::clock::Clock;
use crate::config::{ConfigError, NodeConfig};
use crate::session::session::Session;
use crate::session::session_error::SessionError;
use crate::session::session_start::Registration;
use crate::session::telemetry::{StopReason, TelemetryRecord, TelemetrySender};
use crate::transport::broker_client::{BrokerClient, BrokerLink, RetryDelay};
use crate::transport::control_server::{run_control_server, ControlEvent};
use crate::transport::data_plane::{DataPlane, DataPlaneFactory};

/// A frame always fits into a single UDP datagram
pub const MAX_DATAGRAM_LEN: usize = 64*1024;

/// A relay node: registers with the broker, and runs sessions as the broker starts and stops
///  them.
pub struct Node {
    config: Arc<NodeConfig>,
    session: Arc<Mutex<Session>>,
    shutdown: CancellationToken,
}

impl Node {
    /// Returns the node together with the receiving end of its telemetry queue
    pub fn new(config: NodeConfig, data_plane_factory: Arc<dyn DataPlaneFactory>, shutdown: CancellationToken) -> Result<(Node, mpsc::Receiver<TelemetryRecord>), ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let (telemetry, telemetry_receiver) = TelemetrySender::new(config.telemetry_queue_size);
        let session = Session::new(config.clone(), Arc::new(Clock::new()), data_plane_factory, telemetry, shutdown.clone())?;

        let node = Node {
            config,
            session: Arc::new(Mutex::new(session)),
            shutdown,
        };
        Ok((node, telemetry_receiver))
    }

    pub fn session(&self) -> &Arc<Mutex<Session>> {
        &self.session
    }

    /// Runs until the shutdown token is cancelled, or until the broker can not be reached
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.config.control_addr).await?;
        let registration = Registration {
            name: self.config.node_name.clone(),
            devices: self.config.devices.clone(),
            control_addr: listener.local_addr()?,
        };
        let (control_sender, control_receiver) = mpsc::channel(16);

        let result = select! {
            result = run_control_server(listener, control_sender, self.config.control_request_timeout) => result,
            result = self.run_control_loop(registration, control_receiver) => result,
        };

        self.session.lock().await
            .stop_session(StopReason::Shutdown).await;
        result
    }

    async fn run_control_loop(&self, registration: Registration, mut control_events: mpsc::Receiver<ControlEvent>) -> anyhow::Result<()> {
        let broker = BrokerClient::new(self.config.broker_addr, self.config.registration_timeout);
        let mut link = self.register(&broker, &registration).await?;

        loop {
            select! {
                _ = self.shutdown.cancelled() => {
                    info!("shutting down");
                    return Ok(());
                }
                event = control_events.recv() => {
                    match event {
                        Some(event) => self.on_control_event(event).await,
                        None => return Err(anyhow!("control listener terminated")),
                    }
                }
                err = link.lost(&broker) => {
                    self.session.lock().await
                        .handle_fatal(err.context(format!("lost broker {}", self.config.broker_addr))).await;
                    match self.reregister(&broker, &registration).await? {
                        Some(new_link) => link = new_link,
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn register(&self, broker: &BrokerClient, registration: &Registration) -> anyhow::Result<BrokerLink> {
        BrokerLink::register(broker, registration.clone(), self.config.broker_check_interval, self.config.reregistration_delay).await
    }

    /// Registers again after the broker was lost, backing off between attempts. Returns `None`
    ///  if the node shuts down in the meantime.
    async fn reregister(&self, broker: &BrokerClient, registration: &Registration) -> anyhow::Result<Option<BrokerLink>> {
        let mut delays = RetryDelay::new(self.config.reregistration_delay, self.config.max_reregistration_delay);
        let mut attempt = 0;
        loop {
            attempt += 1;
            select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                _ = time::sleep(delays.next_delay()) => {}
            }

            match self.register(broker, registration).await {
                Ok(link) => return Ok(Some(link)),
                Err(e) if attempt < self.config.max_reregistration_attempts => {
                    warn!("re-registration attempt {} with broker {} failed: {:#}", attempt, self.config.broker_addr, e);
                }
                Err(e) => {
                    return Err(e.context(format!("giving up on broker {} after {} re-registration attempts", self.config.broker_addr, attempt)));
                }
            }
        }
    }

    async fn on_control_event(&self, event: ControlEvent) {
        debug!("control event: {:?}", event);

        let mut session = self.session.lock().await;
        match event {
            ControlEvent::StartSession(start) => {
                match session.start_session(&start).await {
                    Ok(stop_token) => {
                        if let Some(data_plane) = session.data_plane() {
                            tokio::spawn(run_session(self.config.clone(), self.session.clone(), data_plane, stop_token));
                        }
                    }
                    Err(e) => {
                        error!(session_id = start.id, "cannot start session: {}", e);
                    }
                }
            }
            ControlEvent::StopSession => {
                session.stop_session(StopReason::Requested).await;
            }
            ControlEvent::MalformedSessionStart(reason) => {
                session.handle_fatal(anyhow!("malformed session start: {}", reason)).await;
            }
        }
    }
}

/// The per-session loop: waits for datagrams with a timeout of `timeout_additive`, and drives
///  the periodic activities (clock sync, health reports, member timeouts and retransmission)
///  in between. Runs until the session's stop token is cancelled.
///
/// The session lock is taken for each activity, but not while waiting for a datagram.
pub async fn run_session(config: Arc<NodeConfig>, session: Arc<Mutex<Session>>, data_plane: Arc<dyn DataPlane>, stop_token: CancellationToken) {
    let clock = session.lock().await.clock().clone();
    let receive_timeout = config.timeout_additive();
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    let mut health_ticks = time::interval_at(Instant::now() + config.health_interval, config.health_interval);
    let sync_due = time::sleep(Duration::ZERO);
    tokio::pin!(sync_due);

    debug!("starting session loop");
    loop {
        let result: Result<(), SessionError> = select! {
            _ = stop_token.cancelled() => break,
            received = time::timeout(receive_timeout, data_plane.recv(&mut buf)) => {
                let mut session = session.lock().await;
                let dispatched = match received {
                    Ok(Ok(len)) => session.on_datagram(&buf[..len]).await,
                    Ok(Err(e)) => Err(SessionError::DataPlane(e)),
                    Err(_) => Ok(()),
                };
                match dispatched {
                    Ok(()) => {
                        session.check_members(clock.local_us() as f64 / 1e6);
                        session.retransmission_tick().await
                    }
                    Err(e) => Err(e),
                }
            }
            _ = &mut sync_due => {
                let next_round = session.lock().await
                    .sync_tick().await;
                next_round.map(|interval| sync_due.as_mut().reset(Instant::now() + interval))
            }
            _ = health_ticks.tick() => {
                session.lock().await
                    .health_tick().await
            }
        };

        if let Err(e) = result {
            if !e.is_fatal() {
                warn!("{}", e);
                continue;
            }

            let mut session = session.lock().await;
            // the session may have been stopped while this loop waited for the lock
            if !stop_token.is_cancelled() {
                session.handle_fatal(e.into()).await;
            }
            break;
        }
    }
    debug!("session loop terminated");
}
