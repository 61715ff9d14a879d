//! Stratum client implementation.
//!
//! The client is a single task owning one connection at a time: DNS
//! resolution, dialing, the subscribe/authorize handshake, dialect
//! autodetection, the watchdog, and submission tracking all run inside its
//! loop, so the protocol state machine has exactly one writer. Other tasks
//! interact through [`ClientCommand`]s and observe through
//! [`ClientEvent`]s; the atomic [`LinkStatus`] flags exist only so they can
//! also read connection state without a round trip.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connection::{Connection, Transport};
use super::error::StratumError;
use super::messages::{value_empty, ClientCommand, ClientEvent, RpcEnvelope};
use super::pleas::{PleaQueue, PleaSnapshot};
use crate::endpoint::{Endpoint, StratumMode, VERSION_AUTODETECT};
use crate::u256::U256;
use crate::work::{diff_to_target, Solution, Work, DIFF1_TARGET};

/// Watchdog period.
const WORKLOOP_INTERVAL: Duration = Duration::from_millis(1000);

/// Maximum number of requests left unanswered before submissions are
/// throttled locally.
const PARALLEL_REQUEST_LIMIT: usize = 32;

/// Extranonce1 in effect until the pool assigns one.
const INITIAL_EXTRA_NONCE1: &str = "f000000f";

// Fixed request ids. Stratum has no request/response correlation beyond
// these; pools are known to misbehave even here (see ID_POOL_QUIRK).
const ID_SUBSCRIBE: u64 = 1;
const ID_EXTRANONCE_SUBSCRIBE: u64 = 2;
const ID_AUTHORIZE: u64 = 3;
const ID_SUBMIT: u64 = 4;
const ID_GETWORK: u64 = 5;
const ID_HASHRATE: u64 = 9;
/// Some pools reply to subscribe/authorize errors with this id instead of
/// echoing the request id.
const ID_POOL_QUIRK: u64 = 999;

/// Tunable client timeouts.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// How long a request may stay unanswered before the watchdog acts.
    pub response_timeout: Duration,

    /// How long the connection may go without a new job.
    pub work_timeout: Duration,

    /// Whether hashrate figures are forwarded to the pool.
    pub submit_hashrate: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(2),
            work_timeout: Duration::from_secs(180),
            submit_hashrate: false,
        }
    }
}

/// Connection state flags, written only by the client task.
///
/// Observers on other tasks (the manager deciding whether a found solution
/// is worth submitting, for instance) read them through this shared handle.
#[derive(Debug, Default)]
pub struct LinkStatus {
    connected: AtomicBool,
    connecting: AtomicBool,
    disconnecting: AtomicBool,
    subscribed: AtomicBool,
    authorized: AtomicBool,
    authpending: AtomicBool,
}

macro_rules! status_flag {
    ($get:ident, $set:ident, $field:ident) => {
        pub fn $get(&self) -> bool {
            self.$field.load(Ordering::Acquire)
        }

        pub(crate) fn $set(&self, value: bool) {
            self.$field.store(value, Ordering::Release);
        }
    };
}

impl LinkStatus {
    status_flag!(is_connected, set_connected, connected);
    status_flag!(is_connecting, set_connecting, connecting);
    status_flag!(is_disconnecting, set_disconnecting, disconnecting);
    status_flag!(is_subscribed, set_subscribed, subscribed);
    status_flag!(is_authorized, set_authorized, authorized);
    status_flag!(is_authpending, set_authpending, authpending);

    /// Logged in end to end: transport up, subscribed, and authorized.
    pub fn is_logged_in(&self) -> bool {
        self.is_connected() && self.is_subscribed() && self.is_authorized()
    }

    pub(crate) fn clear(&self) {
        self.set_connected(false);
        self.set_connecting(false);
        self.set_disconnecting(false);
        self.set_subscribed(false);
        self.set_authorized(false);
        self.set_authpending(false);
    }
}

/// Why a driven session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// The connection failed or was rejected. During autodetection this
    /// advances to the next dialect; once the dialect is confirmed it
    /// returns control to the manager.
    Dropped,

    /// The endpoint was marked unrecoverable; no further attempts.
    Fatal,

    /// Disconnect was requested through a command.
    Manual,

    /// Shutdown token fired.
    Shutdown,
}

/// Stratum client task.
pub struct StratumClient {
    settings: ClientSettings,
    endpoint: Option<Arc<Endpoint>>,
    status: Arc<LinkStatus>,
    event_tx: mpsc::Sender<ClientEvent>,
    command_rx: mpsc::Receiver<ClientCommand>,
    shutdown: CancellationToken,
    user_agent: String,

    // Per-connection protocol state
    extra_nonce1: String,
    next_work_target: U256,
    current: Option<Work>,
    last_notify: Instant,
    login_announced: bool,
    pleas: PleaQueue,
}

impl StratumClient {
    pub fn new(
        settings: ClientSettings,
        event_tx: mpsc::Sender<ClientEvent>,
        command_rx: mpsc::Receiver<ClientCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            settings,
            endpoint: None,
            status: Arc::new(LinkStatus::default()),
            event_tx,
            command_rx,
            shutdown,
            user_agent: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            extra_nonce1: INITIAL_EXTRA_NONCE1.to_string(),
            next_work_target: DIFF1_TARGET,
            current: None,
            last_notify: Instant::now(),
            login_announced: false,
            pleas: PleaQueue::new(),
        }
    }

    /// Shared connection state flags for observers.
    pub fn status(&self) -> Arc<LinkStatus> {
        Arc::clone(&self.status)
    }

    /// Shared view of the outstanding-request queue for observers.
    pub fn pleas_snapshot(&self) -> Arc<PleaSnapshot> {
        self.pleas.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn into_command_rx(self) -> mpsc::Receiver<ClientCommand> {
        self.command_rx
    }

    /// Run the client until shutdown. Idles between connections waiting
    /// for commands.
    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),

                cmd = self.command_rx.recv() => match cmd {
                    None => return Ok(()),
                    Some(ClientCommand::SetEndpoint(endpoint)) => {
                        self.endpoint = Some(endpoint);
                    }
                    Some(ClientCommand::Connect) => self.run_connection().await,
                    Some(ClientCommand::Disconnect) => {}
                    Some(ClientCommand::SubmitSolution(_)) => {
                        // No connection, so the work cannot be current.
                        self.emit(ClientEvent::SolutionRejected {
                            stale: true,
                            round_trip: Duration::ZERO,
                        })
                        .await;
                    }
                    Some(ClientCommand::SubmitHashrate(_)) => {}
                },
            }
        }
    }

    /// One full connection cycle: resolve, dial, drive the protocol, and
    /// autodetect the dialect across internal reconnects. Returns once
    /// control goes back to the manager; exactly one control-returning
    /// `Disconnected { retrying: false }` is emitted per cycle.
    async fn run_connection(&mut self) {
        let Some(endpoint) = self.endpoint.clone() else {
            warn!("No endpoint installed; cannot connect");
            return;
        };

        self.status.clear();
        self.status.set_connecting(true);
        self.reset_connection_state();

        // A scheme-declared dialect skips autodetection entirely.
        if endpoint.version() < VERSION_AUTODETECT {
            endpoint.set_mode(endpoint.mode(), true);
        } else if !endpoint.mode_confirmed() && endpoint.mode() == StratumMode::Unknown {
            endpoint.set_mode(StratumMode::EnergiStratum, false);
        }

        // Resolve on every connect; load balancers rotate their answers.
        let mut addrs: VecDeque<SocketAddr> =
            match lookup_host((endpoint.host(), endpoint.port())).await {
                Ok(iter) => iter.collect(),
                Err(e) => {
                    warn!(host = %endpoint.host(), error = %e, "Could not resolve host");
                    self.status.clear();
                    self.emit(ClientEvent::Disconnected { retrying: false }).await;
                    return;
                }
            };

        loop {
            let mut conn = loop {
                let Some(addr) = addrs.front().copied() else {
                    warn!(host = %endpoint.host(), "No more IP addresses to try");
                    self.status.clear();
                    self.emit(ClientEvent::Disconnected { retrying: false }).await;
                    return;
                };

                match Connection::dial(&endpoint, addr, self.settings.response_timeout).await {
                    Ok(conn) => break conn,
                    Err(StratumError::TlsHandshake(e)) => {
                        // Certificates bind to the host name; other
                        // addresses would fail the same way.
                        warn!(host = %endpoint.host(), error = %e, "TLS handshake failed");
                        endpoint.mark_unrecoverable();
                        self.status.clear();
                        self.emit(ClientEvent::Disconnected { retrying: false }).await;
                        return;
                    }
                    Err(e) => {
                        warn!(%addr, error = %e, "Connection attempt failed");
                        addrs.pop_front();
                    }
                }
            };

            self.status.set_connecting(false);
            self.status.set_connected(true);
            info!(host = %endpoint.host(), port = endpoint.port(), "Socket connected");

            let end = self.drive(&mut conn, &endpoint).await;

            self.status.set_disconnecting(true);
            // Initiates close_notify on TLS; bounded like any response.
            let _ = timeout(self.settings.response_timeout, conn.shutdown()).await;
            drop(conn);

            info!(host = %endpoint.host(), "Socket disconnected");
            self.status.clear();
            self.pleas.clear();

            match end {
                SessionEnd::Dropped
                    if !endpoint.mode_confirmed() && !endpoint.is_unrecoverable() =>
                {
                    match endpoint.mode().downgrade() {
                        Some(next) => {
                            endpoint.set_mode(next, false);
                            self.emit(ClientEvent::Disconnected { retrying: true }).await;
                            debug!(mode = ?next, "Subscription rejected; retrying with previous stratum mode");
                            self.status.set_connecting(true);
                            self.reset_connection_state();
                            continue;
                        }
                        None => {
                            // Every known dialect was rejected.
                            endpoint.mark_unrecoverable();
                            self.emit(ClientEvent::Disconnected { retrying: false }).await;
                            return;
                        }
                    }
                }
                _ => {
                    self.emit(ClientEvent::Disconnected { retrying: false }).await;
                    return;
                }
            }
        }
    }

    fn reset_connection_state(&mut self) {
        // The pool may never send an initial set_difficulty, in which case
        // difficulty 1 applies for the whole connection.
        self.extra_nonce1 = INITIAL_EXTRA_NONCE1.to_string();
        self.next_work_target = DIFF1_TARGET;
        self.current = None;
        self.login_announced = false;
        self.pleas.clear();
    }

    /// Drive one established connection: send the subscribe, then loop over
    /// incoming frames, commands, and watchdog ticks until the session ends.
    pub(crate) async fn drive(
        &mut self,
        conn: &mut dyn Transport,
        endpoint: &Arc<Endpoint>,
    ) -> SessionEnd {
        self.pleas.clear();
        let subscribe = subscribe_request(endpoint);
        self.pleas.enqueue();
        if let Err(e) = conn.write_message(&subscribe).await {
            warn!(error = %e, "Socket write failed");
            return SessionEnd::Dropped;
        }

        self.last_notify = Instant::now();

        let mut watchdog = interval_at(Instant::now() + WORKLOOP_INTERVAL, WORKLOOP_INTERVAL);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,

                msg = conn.read_message() => match msg {
                    Ok(Some(msg)) => {
                        if let Some(end) = self.handle_message(conn, endpoint, msg).await {
                            return end;
                        }
                    }
                    Ok(None) => {
                        info!(host = %endpoint.host(), "Connection remotely closed");
                        return self.classify_read_failure(endpoint);
                    }
                    Err(StratumError::InvalidMessage(e)) => {
                        warn!(error = %e, "Got invalid json message; discarding");
                    }
                    Err(e) => {
                        warn!(error = %e, "Socket read failed");
                        return self.classify_read_failure(endpoint);
                    }
                },

                cmd = self.command_rx.recv() => match cmd {
                    None => return SessionEnd::Shutdown,
                    Some(ClientCommand::Disconnect) => return SessionEnd::Manual,
                    Some(ClientCommand::SubmitSolution(solution)) => {
                        if let Some(end) =
                            self.submit_solution(conn, endpoint, *solution).await
                        {
                            return end;
                        }
                    }
                    Some(ClientCommand::SubmitHashrate(rate)) => self.submit_hashrate(&rate),
                    Some(ClientCommand::Connect) => {
                        warn!("Connect requested while a connection is active; ignoring");
                    }
                    Some(ClientCommand::SetEndpoint(endpoint)) => {
                        debug!("Endpoint replaced; takes effect on the next connect");
                        self.endpoint = Some(endpoint);
                    }
                },

                _ = watchdog.tick() => {
                    if let Some(end) = self.watchdog_tick(conn, endpoint).await {
                        return end;
                    }
                }
            }
        }
    }

    /// Periodic timeout enforcement.
    async fn watchdog_tick(
        &mut self,
        conn: &mut dyn Transport,
        endpoint: &Arc<Endpoint>,
    ) -> Option<SessionEnd> {
        if self.pleas.count() > 0 {
            if let Some(age) = self.pleas.oldest_age() {
                if age >= self.settings.response_timeout {
                    if !endpoint.mode_confirmed() && !endpoint.is_unrecoverable() {
                        // The login went unanswered. Some pools do not
                        // reply at all to a dialect they do not speak, so
                        // synthesize the error reply to advance
                        // autodetection.
                        self.pleas.clear();
                        let fake = RpcEnvelope {
                            id: Some(ID_SUBSCRIBE),
                            jsonrpc: None,
                            method: None,
                            params: Value::Null,
                            result: Value::Null,
                            error: Value::Bool(true),
                        };
                        return self.handle_message(conn, endpoint, fake).await;
                    }

                    warn!(
                        timeout_secs = self.settings.response_timeout.as_secs(),
                        "No response received within the response timeout"
                    );
                    self.status.set_subscribed(false);
                    self.status.set_authorized(false);
                    self.pleas.clear();
                    return Some(SessionEnd::Dropped);
                }
            }
        }

        if self.status.is_connected() && self.last_notify.elapsed() > self.settings.work_timeout {
            warn!(
                timeout_secs = self.settings.work_timeout.as_secs(),
                "No new work received within the work timeout"
            );
            self.status.set_subscribed(false);
            self.status.set_authorized(false);
            self.pleas.clear();
            return Some(SessionEnd::Dropped);
        }

        None
    }

    /// Dispatch one incoming frame. Returns the session end when the frame
    /// terminates the connection.
    async fn handle_message(
        &mut self,
        conn: &mut dyn Transport,
        endpoint: &Arc<Endpoint>,
        msg: RpcEnvelope,
    ) -> Option<SessionEnd> {
        let mut is_notification = msg.is_notification();
        let mut method = msg.method().to_string();
        // nrg-proxy pushes jobs as bare result arrays with no method.
        let mut params_from_result = false;

        if is_notification
            && method.is_empty()
            && endpoint.mode() == StratumMode::NrgProxy
            && msg.result.is_array()
        {
            method = "mining.notify".to_string();
            params_from_result = true;
        }

        // Envelope sanity. client.get_version is exempt from the payload
        // check: it legitimately carries empty params.
        if (msg.rpc_version() == 2 && msg.jsonrpc.as_deref() != Some("2.0"))
            || (is_notification
                && method != "client.get_version"
                && value_empty(&msg.params)
                && value_empty(&msg.result))
        {
            warn!("Pool sent an invalid jsonrpc message; disconnecting");
            self.status.set_subscribed(false);
            self.status.set_authorized(false);
            return Some(SessionEnd::Dropped);
        }

        if !is_notification {
            match msg.id() {
                ID_SUBSCRIBE => {
                    if let Some(end) = self.handle_subscribe_reply(conn, endpoint, &msg).await {
                        return Some(end);
                    }
                }

                ID_EXTRANONCE_SUBSCRIBE => {
                    // Acknowledgement only; extranonce changes arrive as
                    // mining.set_extranonce notifications.
                }

                ID_AUTHORIZE => {
                    if let Some(end) = self.handle_authorize_reply(conn, endpoint, &msg).await {
                        return Some(end);
                    }
                }

                ID_SUBMIT => {
                    let round_trip = self.pleas.dequeue();
                    let mut success = msg.is_success();
                    if success {
                        if let Some(flag) = msg.result.as_bool() {
                            success = flag;
                        }
                    }
                    if success {
                        self.emit(ClientEvent::SolutionAccepted {
                            stale: false,
                            round_trip,
                        })
                        .await;
                    } else {
                        let reason = msg.error_reason();
                        if !reason.is_empty() {
                            warn!(reason = %reason, "Reject reason");
                        }
                        self.emit(ClientEvent::SolutionRejected {
                            stale: true,
                            round_trip,
                        })
                        .await;
                    }
                }

                ID_GETWORK => {
                    // First job in nrg-proxy mode arrives as the getwork
                    // reply; reinterpret it as a notify.
                    if endpoint.mode() == StratumMode::NrgProxy && msg.result.is_array() {
                        is_notification = true;
                        method = "mining.notify".to_string();
                        params_from_result = true;
                    }
                }

                ID_HASHRATE => {
                    if !msg.is_success() {
                        warn!(reason = %msg.error_reason(), "Submit hashrate failed");
                    }
                }

                ID_POOL_QUIRK => {
                    let _ = self.pleas.dequeue();
                    if !msg.is_success() {
                        if !self.status.is_subscribed() {
                            warn!(reason = %msg.error_reason(), "Subscription failed");
                            return Some(SessionEnd::Dropped);
                        } else if !self.status.is_authorized() {
                            warn!(reason = %msg.error_reason(), "Worker not authorized");
                            return Some(SessionEnd::Dropped);
                        }
                    }
                }

                id => {
                    debug!(id, "Got response for unknown message id; discarding");
                }
            }
        }

        // Broadcasts are only honored once the dialect is settled.
        if is_notification && endpoint.mode_confirmed() {
            let params = if params_from_result {
                &msg.result
            } else {
                &msg.params
            };

            match method.as_str() {
                "mining.notify" => self.process_notify(params).await,

                "mining.set_difficulty" => {
                    if let Some(arr) = params.as_array() {
                        let difficulty =
                            arr.first().and_then(Value::as_f64).unwrap_or(1.0).max(0.0001);
                        self.next_work_target = diff_to_target(difficulty);
                        info!(
                            difficulty,
                            target = %self.next_work_target,
                            "Difficulty set"
                        );
                        // Force the next notify through even if its payload
                        // matches the current job.
                        self.current = None;
                    }
                }

                "mining.set_extranonce" => {
                    if let Some(enonce) = params.as_array().and_then(|a| a.first()).and_then(Value::as_str)
                    {
                        self.set_extra_nonce(enonce);
                    }
                }

                "client.get_version" => {
                    let reply = match msg.rpc_version() {
                        2 => json!({
                            "id": msg.id(),
                            "jsonrpc": "2.0",
                            "result": self.user_agent,
                        }),
                        _ => json!({
                            "id": msg.id(),
                            "result": self.user_agent,
                            "error": null,
                        }),
                    };
                    if let Err(e) = conn.write_message(&reply).await {
                        warn!(error = %e, "Socket write failed");
                        return Some(SessionEnd::Dropped);
                    }
                }

                other => {
                    warn!(method = %other, "Got unknown method from pool; discarding");
                    let mut reply = json!({
                        "id": msg.id(),
                        "error": "Method not found",
                    });
                    if msg.rpc_version() == 2 {
                        reply["jsonrpc"] = json!("2.0");
                    }
                    if let Err(e) = conn.write_message(&reply).await {
                        warn!(error = %e, "Socket write failed");
                        return Some(SessionEnd::Dropped);
                    }
                }
            }
        }

        None
    }

    /// Reply to our subscribe (id 1): dialect confirmation plus the
    /// per-dialect login continuation.
    async fn handle_subscribe_reply(
        &mut self,
        conn: &mut dyn Transport,
        endpoint: &Arc<Endpoint>,
        msg: &RpcEnvelope,
    ) -> Option<SessionEnd> {
        let _ = self.pleas.dequeue();

        if !endpoint.mode_confirmed() {
            if !msg.is_success() {
                // Autodetection continues with the next dialect.
                return Some(SessionEnd::Dropped);
            }
            // Whatever mode this attempt used is now frozen.
            endpoint.set_mode(endpoint.mode(), true);
        }

        match endpoint.mode() {
            StratumMode::Stratum => {
                info!("Stratum mode detected: STRATUM");
                self.status.set_subscribed(msg.is_success());
                if !self.status.is_subscribed() {
                    warn!(reason = %msg.error_reason(), "Could not subscribe to stratum server");
                    endpoint.mark_unrecoverable();
                    return Some(SessionEnd::Fatal);
                }
                info!("Subscribed");
                self.apply_subscribe_extranonce(msg);

                self.status.set_authpending(true);
                self.pleas.enqueue();
                if let Err(e) = conn.write_message(&authorize_request(endpoint, true)).await {
                    warn!(error = %e, "Socket write failed");
                    return Some(SessionEnd::Dropped);
                }
            }

            StratumMode::NrgProxy => {
                info!("Stratum mode detected: nrg-proxy");
                self.status.set_subscribed(msg.is_success());
                if !self.status.is_subscribed() {
                    warn!(reason = %msg.error_reason(), "Could not login to nrg-proxy server");
                    endpoint.mark_unrecoverable();
                    return Some(SessionEnd::Fatal);
                }
                info!("Logged in to nrg-proxy server");
                self.apply_subscribe_extranonce(msg);

                // The subscribe doubles as the login acknowledgement.
                self.status.set_authorized(true);
                self.announce_connected(endpoint).await;

                self.pleas.enqueue();
                if let Err(e) = conn.write_message(&authorize_request(endpoint, true)).await {
                    warn!(error = %e, "Socket write failed");
                    return Some(SessionEnd::Dropped);
                }
            }

            StratumMode::EnergiStratum => {
                info!("Stratum mode detected: NRGSTRATUM");
                self.status.set_subscribed(msg.is_success());
                if !self.status.is_subscribed() {
                    warn!(reason = %msg.error_reason(), "Could not subscribe to stratum server");
                    endpoint.mark_unrecoverable();
                    return Some(SessionEnd::Fatal);
                }
                info!("Subscribed to stratum server");
                self.apply_subscribe_extranonce(msg);

                self.pleas.enqueue();
                if let Err(e) = conn.write_message(&authorize_request(endpoint, false)).await {
                    warn!(error = %e, "Socket write failed");
                    return Some(SessionEnd::Dropped);
                }
            }

            StratumMode::Unknown => {
                debug!("Subscribe reply with no dialect in effect; discarding");
            }
        }

        None
    }

    /// Reply to our authorize (id 3).
    async fn handle_authorize_reply(
        &mut self,
        conn: &mut dyn Transport,
        endpoint: &Arc<Endpoint>,
        msg: &RpcEnvelope,
    ) -> Option<SessionEnd> {
        let _ = self.pleas.dequeue();

        // Some pools return an error, others a bare false result.
        let mut success = msg.is_success();
        if success {
            if let Some(flag) = msg.result.as_bool() {
                success = flag;
            }
        }

        self.status.set_authpending(false);
        self.status.set_authorized(success);
        if !success {
            warn!(user = %endpoint.user(), reason = %msg.error_reason(), "Worker not authorized");
            endpoint.mark_unrecoverable();
            return Some(SessionEnd::Fatal);
        }

        info!(user = %endpoint.user(), "Authorized worker");
        self.announce_connected(endpoint).await;

        if endpoint.mode() == StratumMode::NrgProxy {
            // Prime the first job; the reply is handled as a notify.
            let req = json!({
                "id": ID_GETWORK,
                "jsonrpc": "2.0",
                "method": "getwork",
                "params": [],
            });
            if let Err(e) = conn.write_message(&req).await {
                warn!(error = %e, "Socket write failed");
                return Some(SessionEnd::Dropped);
            }
        }

        None
    }

    /// Accept or ignore a job broadcast.
    async fn process_notify(&mut self, params: &Value) {
        let Some(arr) = params.as_array() else {
            return;
        };

        // Placeholder notifies without coinbase parts carry nothing minable.
        let coinbase1 = arr.get(2).and_then(Value::as_str).unwrap_or("");
        let coinbase2 = arr.get(3).and_then(Value::as_str).unwrap_or("");
        if coinbase1.is_empty() || coinbase2.is_empty() {
            return;
        }

        let reset_job = arr.get(8).and_then(Value::as_bool).unwrap_or(false);

        match Work::from_notify_params(arr, &self.extra_nonce1, self.next_work_target) {
            Ok(work) => {
                if reset_job || self.current.as_ref() != Some(&work) {
                    self.emit(ClientEvent::ResetWork).await;
                    self.current = Some(work.clone());
                    self.last_notify = Instant::now();
                    self.emit(ClientEvent::WorkReceived(work)).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to parse job"),
        }
    }

    /// Submit a solved share, or reject it locally.
    async fn submit_solution(
        &mut self,
        conn: &mut dyn Transport,
        endpoint: &Arc<Endpoint>,
        solution: Solution,
    ) -> Option<SessionEnd> {
        if self.current.as_ref() != Some(solution.work()) {
            debug!(job = %solution.job_name(), "Stale solution; the job has moved on");
            self.emit(ClientEvent::SolutionRejected {
                stale: true,
                round_trip: Duration::ZERO,
            })
            .await;
            return None;
        }

        if !self.status.is_subscribed() || !self.status.is_authorized() {
            warn!("Not authorized");
            self.emit(ClientEvent::SolutionRejected {
                stale: true,
                round_trip: Duration::ZERO,
            })
            .await;
            return None;
        }

        if self.pleas.count() > PARALLEL_REQUEST_LIMIT {
            warn!("Reject reason: throttling submitted requests");
            self.emit(ClientEvent::SolutionRejected {
                stale: true,
                round_trip: Duration::ZERO,
            })
            .await;
            return None;
        }

        let mut req = json!({
            "id": ID_SUBMIT,
            "jsonrpc": "2.0",
            "method": "mining.submit",
            "params": [
                endpoint.user(),
                solution.job_name(),
                solution.extra_nonce2(),
                solution.time(),
                solution.nonce(),
                solution.hash_mix_hex(),
                solution.block_transaction(),
                solution.work().merkle_root_hex(),
            ],
        });
        if let Some(worker) = endpoint.worker() {
            req["worker"] = json!(worker);
        }

        self.pleas.enqueue();
        if let Err(e) = conn.write_message(&req).await {
            warn!(error = %e, "Socket write failed");
            return Some(SessionEnd::Dropped);
        }

        None
    }

    /// Forward a hashrate figure.
    ///
    /// There is no stratum method for this, and the rpc variant collides
    /// with the ids some pools use for job pushes, so nothing goes on the
    /// wire; the figure is only validated and traced.
    fn submit_hashrate(&self, rate: &str) {
        if rate.is_empty() || !self.settings.submit_hashrate || !self.status.is_connected() {
            return;
        }
        trace!(rate, "Hashrate recorded");
    }

    /// Fire `Connected` once per login, after the dialect is settled.
    async fn announce_connected(&mut self, endpoint: &Arc<Endpoint>) {
        if endpoint.mode_confirmed() && !self.login_announced {
            self.login_announced = true;
            self.last_notify = Instant::now();
            self.emit(ClientEvent::Connected).await;
        }
    }

    fn apply_subscribe_extranonce(&mut self, msg: &RpcEnvelope) {
        if let Some(enonce) = msg.result.get(1).and_then(Value::as_str) {
            if !enonce.is_empty() {
                self.set_extra_nonce(enonce);
            }
        }
    }

    fn set_extra_nonce(&mut self, enonce: &str) {
        info!(extranonce = %enonce, "Extranonce set");
        self.extra_nonce1 = enonce.to_string();
    }

    /// A failed read tears the session down; failing while the authorize
    /// is outstanding points at bad credentials and poisons the endpoint.
    fn classify_read_failure(&mut self, endpoint: &Arc<Endpoint>) -> SessionEnd {
        if self.status.is_authpending() {
            warn!("Error while waiting for authorization from pool");
            warn!("Double check your pool credentials");
            endpoint.mark_unrecoverable();
            return SessionEnd::Fatal;
        }
        SessionEnd::Dropped
    }

    async fn emit(&self, event: ClientEvent) {
        if self.event_tx.send(event).await.is_err() {
            trace!("Event receiver dropped");
        }
    }
}

/// Build the subscribe for the dialect in effect. Modes 1 and 2 carry the
/// login in the subscribe itself.
fn subscribe_request(endpoint: &Endpoint) -> Value {
    match endpoint.mode() {
        StratumMode::NrgProxy | StratumMode::EnergiStratum => {
            let mut req = json!({
                "id": ID_SUBSCRIBE,
                "method": "mining.subscribe",
                "params": [format!("{}{}", endpoint.login_user(), endpoint.path())],
            });
            if let Some(worker) = endpoint.worker() {
                req["worker"] = json!(worker);
            }
            req
        }
        _ => json!({
            "id": ID_SUBSCRIBE,
            "jsonrpc": "2.0",
            "method": "mining.subscribe",
            "params": [],
        }),
    }
}

/// Build the authorize. The full user string, worker suffix included, is
/// what pools bill shares against.
fn authorize_request(endpoint: &Endpoint, with_jsonrpc: bool) -> Value {
    let mut req = json!({
        "id": ID_AUTHORIZE,
        "method": "mining.authorize",
        "params": [
            format!("{}{}", endpoint.user(), endpoint.path()),
            endpoint.pass(),
        ],
    });
    if with_jsonrpc {
        req["jsonrpc"] = json!("2.0");
    }
    req
}
