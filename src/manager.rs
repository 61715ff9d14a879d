//! Pool manager.
//!
//! Owns the ordered endpoint list, supervises the Stratum client through
//! its command/event channels, and couples pool events to the mining
//! engine. Exactly one pool is active at any moment; on persistent failure
//! the manager retries the active endpoint a configured number of times
//! and then rotates through the list. An endpoint whose host is the
//! literal `"exit"` acts as a sentinel that shuts the supervisor down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::endpoint::{Endpoint, EndpointError};
use crate::engine::{wire_engine_events, EngineEvent, EngineMode, MiningEngine};
use crate::stratum::{
    ClientCommand, ClientEvent, ClientSettings, LinkStatus, PleaSnapshot, StratumClient,
};

/// Backoff before any reconnect attempt, logged as a countdown.
const RECONNECT_COUNTDOWN_TICKS: u64 = 3;

/// Manager tunables.
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Attempts on the active endpoint after a failure before rotating.
    pub reconnect_tries: u32,

    /// Seconds between hashrate progress reports.
    pub hashrate_reporting_time: u64,

    /// Execution modes handed to the engine on start.
    pub engine_modes: Vec<EngineMode>,

    /// Client timeouts.
    pub client: ClientSettings,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            reconnect_tries: 3,
            hashrate_reporting_time: 60,
            engine_modes: vec![EngineMode::Cpu],
            client: ClientSettings::default(),
        }
    }
}

/// What the reconnect policy decided to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectPlan {
    /// No endpoints configured; nothing to do.
    Abort,
    /// Connect to the active endpoint again.
    RetryCurrent,
    /// Rotate to the endpoint at this index and connect.
    Install(usize),
    /// Stop the supervisor (exit sentinel or nothing left to try).
    Stop,
}

/// Pool connection supervisor.
pub struct PoolManager {
    settings: ManagerSettings,
    engine: Arc<dyn MiningEngine>,
    connections: Vec<Arc<Endpoint>>,
    active: usize,
    reconnect_try: u32,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    client: Option<StratumClient>,
    command_tx: mpsc::Sender<ClientCommand>,
    event_rx: mpsc::Receiver<ClientEvent>,
    status: Arc<LinkStatus>,
    pleas: Arc<PleaSnapshot>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    submit_time: Instant,
}

impl PoolManager {
    pub fn new(engine: Arc<dyn MiningEngine>, settings: ManagerSettings) -> Self {
        let shutdown = CancellationToken::new();
        let (event_tx, event_rx) = mpsc::channel(100);
        let (command_tx, command_rx) = mpsc::channel(100);
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();

        let client = StratumClient::new(
            settings.client.clone(),
            event_tx,
            command_rx,
            shutdown.clone(),
        );
        let status = client.status();
        let pleas = client.pleas_snapshot();

        Self {
            settings,
            engine,
            connections: Vec::new(),
            active: 0,
            reconnect_try: 0,
            running: Arc::new(AtomicBool::new(false)),
            shutdown,
            tracker: TaskTracker::new(),
            client: Some(client),
            command_tx,
            event_rx,
            status,
            pleas,
            engine_tx,
            engine_rx,
            submit_time: Instant::now(),
        }
    }

    /// Token that stops the supervisor when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Append a pool endpoint. The first one becomes the client's current
    /// endpoint.
    pub fn add_connection(&mut self, uri: &str) -> Result<(), EndpointError> {
        let endpoint = Arc::new(Endpoint::from_uri(uri)?);
        info!(host = %endpoint.host(), port = endpoint.port(), "Pool connection added");
        self.connections.push(Arc::clone(&endpoint));
        if self.connections.len() == 1 {
            let _ = self
                .command_tx
                .try_send(ClientCommand::SetEndpoint(Arc::clone(&endpoint)));
            self.engine.set_pool_addresses(endpoint.host(), endpoint.port());
        }
        Ok(())
    }

    /// Drop every endpoint and tear down any live connection.
    pub fn clear_connections(&mut self) {
        self.connections.clear();
        self.active = 0;
        self.reconnect_try = 0;
        self.engine.set_pool_addresses("", 0);
        if self.status.is_connected() {
            let _ = self.command_tx.try_send(ClientCommand::Disconnect);
        }
    }

    /// Run the supervisor until it is stopped.
    ///
    /// Fails when no endpoints are defined. Spawns the client task and the
    /// hashrate reporting task, connects to the selected pool, and then
    /// loops over client and engine events.
    pub async fn run(mut self) -> anyhow::Result<()> {
        if self.connections.is_empty() {
            warn!("Manager has no connections defined");
            anyhow::bail!("no pool connections defined");
        }

        self.running.store(true, Ordering::Release);

        wire_engine_events(self.engine.as_ref(), self.engine_tx.clone());

        let client = self.client.take().ok_or_else(|| anyhow::anyhow!("client already taken"))?;
        self.tracker.spawn(async move {
            if let Err(e) = client.run().await {
                error!(error = %e, "Stratum client error");
            }
        });

        self.spawn_reporting_task();

        self.log_selected_pool();
        self.send(ClientCommand::Connect).await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.stop().await;
                    break;
                }

                event = self.event_rx.recv() => match event {
                    Some(event) => self.handle_client_event(event).await,
                    None => break,
                },

                event = self.engine_rx.recv() => match event {
                    Some(event) => self.handle_engine_event(event).await,
                    None => break,
                },
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        Ok(())
    }

    /// Stop the supervisor: disconnect the client, stop the engine, and
    /// release the tasks. Idempotent.
    async fn stop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("Shutting down");
            if self.status.is_connected() {
                self.send(ClientCommand::Disconnect).await;
            }
            if self.engine.is_mining() {
                info!("Shutting down miners");
                self.engine.stop();
            }
            self.shutdown.cancel();
        }
    }

    async fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected => {
                info!(host = %self.active_host(), "Connected to pool");
                if !self.engine.is_mining() {
                    info!("Spinning up miners");
                    self.engine.start(&self.settings.engine_modes);
                }
            }

            ClientEvent::Disconnected { retrying } => {
                info!(host = %self.active_host(), "Disconnected from pool");
                if self.engine.is_mining() {
                    info!("Shutting down miners");
                    self.engine.stop();
                }
                if !retrying && self.running.load(Ordering::Acquire) {
                    self.try_reconnect().await;
                }
            }

            ClientEvent::ResetWork => {
                debug!("Current job abandoned");
            }

            ClientEvent::WorkReceived(work) => {
                self.reconnect_try = 0;
                self.engine.set_work(work);
            }

            ClientEvent::SolutionAccepted { stale, round_trip } => {
                info!(
                    elapsed_ms = self.submit_time.elapsed().as_millis() as u64,
                    round_trip_ms = round_trip.as_millis() as u64,
                    stale,
                    host = %self.active_host(),
                    "**Accepted"
                );
                self.engine.accepted_solution(stale);
            }

            ClientEvent::SolutionRejected { stale, round_trip } => {
                warn!(
                    elapsed_ms = self.submit_time.elapsed().as_millis() as u64,
                    round_trip_ms = round_trip.as_millis() as u64,
                    stale,
                    host = %self.active_host(),
                    "**Rejected"
                );
                self.engine.rejected_solution(stale);
            }
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::SolutionFound(solution) => {
                // Solutions pass through only on a live login; submitting
                // into a dead socket would log a nonce that never gets a
                // response.
                if self.status.is_connected() {
                    self.submit_time = Instant::now();
                    self.send(ClientCommand::SubmitSolution(solution)).await;
                } else {
                    warn!(nonce = %solution.nonce(), "Nonce wasted; waiting for connection");
                }
            }

            EngineEvent::MinerRestart => {
                info!("Restarting miners");
                if self.engine.is_mining() {
                    info!("Shutting down miners");
                    self.engine.stop();
                }
                self.engine.start(&self.settings.engine_modes);
            }
        }
    }

    /// Backoff, then act on the reconnect policy.
    async fn try_reconnect(&mut self) {
        if self.connections.is_empty() {
            warn!("Manager has no connections defined");
            return;
        }

        for i in (1..=RECONNECT_COUNTDOWN_TICKS).rev() {
            info!(seconds = i, "Retrying in");
            tokio::select! {
                _ = sleep(Duration::from_secs(1)) => {}
                _ = self.shutdown.cancelled() => return,
            }
        }

        match self.plan_reconnect() {
            ReconnectPlan::Abort => {}
            ReconnectPlan::RetryCurrent => {
                self.log_selected_pool();
                self.send(ClientCommand::Connect).await;
            }
            ReconnectPlan::Install(index) => {
                let endpoint = Arc::clone(&self.connections[index]);
                self.send(ClientCommand::SetEndpoint(Arc::clone(&endpoint))).await;
                self.engine.set_pool_addresses(endpoint.host(), endpoint.port());
                self.log_selected_pool();
                self.send(ClientCommand::Connect).await;
            }
            ReconnectPlan::Stop => {
                info!("Exiting because reconnecting is not possible");
                self.stop().await;
            }
        }
    }

    /// Reconnect policy: retry the active endpoint `reconnect_tries` times,
    /// then rotate. Endpoints marked unrecoverable are skipped; the
    /// `"exit"` sentinel stops the supervisor.
    fn plan_reconnect(&mut self) -> ReconnectPlan {
        if self.connections.is_empty() {
            return ReconnectPlan::Abort;
        }

        if self.connections.len() == 1 {
            if self.connections[0].is_unrecoverable() {
                warn!("The only pool endpoint is unrecoverable");
                return ReconnectPlan::Stop;
            }
            return ReconnectPlan::RetryCurrent;
        }

        if !self.connections[self.active].is_unrecoverable()
            && self.reconnect_try < self.settings.reconnect_tries
        {
            self.reconnect_try += 1;
            return ReconnectPlan::RetryCurrent;
        }

        self.reconnect_try = 0;
        for _ in 0..self.connections.len() {
            self.active = (self.active + 1) % self.connections.len();
            let endpoint = &self.connections[self.active];
            if endpoint.host() == "exit" {
                return ReconnectPlan::Stop;
            }
            if !endpoint.is_unrecoverable() {
                return ReconnectPlan::Install(self.active);
            }
        }

        warn!("All pool endpoints are unrecoverable");
        ReconnectPlan::Stop
    }

    fn spawn_reporting_task(&self) {
        let engine = Arc::clone(&self.engine);
        let pleas = Arc::clone(&self.pleas);
        let command_tx = self.command_tx.clone();
        let shutdown = self.shutdown.clone();
        let report_every = self.settings.hashrate_reporting_time;

        self.tracker.spawn(async move {
            let mut ticker = interval(Duration::from_secs(1));
            let mut elapsed = 0u64;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        elapsed += 1;
                        if elapsed > report_every {
                            let progress = engine.mining_progress();
                            match pleas.oldest_age() {
                                Some(age) => info!(
                                    %progress,
                                    pending_requests = pleas.count(),
                                    oldest_pending_ms = age.as_millis() as u64,
                                    "Mining progress"
                                ),
                                None => info!(%progress, "Mining progress"),
                            }
                            let _ = command_tx
                                .send(ClientCommand::SubmitHashrate(
                                    format!("{:.0}", progress.hash_rate),
                                ))
                                .await;
                            elapsed = 0;
                        }
                    }
                }
            }
        });
    }

    fn log_selected_pool(&self) {
        let endpoint = &self.connections[self.active];
        info!(
            pool = %format_args!("{}:{}", endpoint.host(), endpoint.port()),
            "Selected pool"
        );
    }

    fn active_host(&self) -> &str {
        self.connections
            .get(self.active)
            .map(|ep| ep.host())
            .unwrap_or("")
    }

    async fn send(&self, command: ClientCommand) {
        if self.command_tx.send(command).await.is_err() {
            debug!("Client command channel closed");
        }
    }
}
