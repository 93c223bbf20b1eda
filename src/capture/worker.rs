//! Capture state machine
//!
//! One `Capture` per interface. A worker task drives the state machine
//! and owns all mutable capture state; a blocking packet task reads the
//! source and feeds the flow log. External entry points send typed
//! commands over the command channel and await a oneshot reply, which is
//! the sole synchronization mechanism. The flow log is guarded by a lock
//! held only across `add` and the rotate swap, never across writeout.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CaptureConfig;
use crate::core::flow::{AggFlowMap, FlowEntry, FlowLog};
use crate::core::packet::EndpointKey;

use super::source::{CaptureSource, CaptureStats, SourceError, SourceInitFn};
use super::{ErrorMap, InterfaceStats, State, ERROR_THRESHOLD};

/// State and statistics returned by the `Status` command
#[derive(Debug, Clone, Serialize)]
pub struct CaptureStatus {
    pub state: State,
    pub stats: InterfaceStats,
}

/// Snapshot and statistics returned by the `Rotate` command
#[derive(Debug)]
pub struct RotateResult {
    pub flows: AggFlowMap,
    pub stats: InterfaceStats,
}

/// Commands served by the state machine worker
enum CaptureCommand {
    Status {
        reply: oneshot::Sender<CaptureStatus>,
    },
    Errors {
        reply: oneshot::Sender<ErrorMap>,
    },
    Flows {
        reply: oneshot::Sender<std::collections::HashMap<EndpointKey, FlowEntry>>,
    },
    Update {
        config: CaptureConfig,
        done: oneshot::Sender<()>,
    },
    Rotate {
        reply: oneshot::Sender<RotateResult>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable command-channel endpoint of a capture. All methods return
/// `None` once the capture has closed.
#[derive(Clone)]
pub struct CaptureHandle {
    iface: String,
    cmd_tx: mpsc::Sender<CaptureCommand>,
}

impl CaptureHandle {
    pub fn iface(&self) -> &str {
        &self.iface
    }

    async fn command<T>(
        &self,
        cmd: CaptureCommand,
        reply_rx: oneshot::Receiver<T>,
    ) -> Option<T> {
        if self.cmd_tx.send(cmd).await.is_err() {
            warn!(iface = %self.iface, "cannot reach closed capture");
            return None;
        }
        reply_rx.await.ok()
    }

    /// Current state plus statistics collected since the last rotation
    pub async fn status(&self) -> Option<CaptureStatus> {
        let (tx, rx) = oneshot::channel();
        self.command(CaptureCommand::Status { reply: tx }, rx).await
    }

    /// Copy of the decode error map
    pub async fn errors(&self) -> Option<ErrorMap> {
        let (tx, rx) = oneshot::channel();
        self.command(CaptureCommand::Errors { reply: tx }, rx).await
    }

    /// Read-only view of the live flow log
    pub async fn flows(&self) -> Option<std::collections::HashMap<EndpointKey, FlowEntry>> {
        let (tx, rx) = oneshot::channel();
        self.command(CaptureCommand::Flows { reply: tx }, rx).await
    }

    /// Apply a new configuration. A no-op if it equals the current one,
    /// otherwise the capture source is reinitialized. Resolves once the
    /// command has been processed.
    pub async fn update(&self, config: CaptureConfig) -> Option<()> {
        let (tx, rx) = oneshot::channel();
        self.command(CaptureCommand::Update { config, done: tx }, rx)
            .await
    }

    /// Rotate the flow log, returning the aggregated snapshot and the
    /// statistics delta since the previous rotation.
    pub async fn rotate(&self) -> Option<RotateResult> {
        let (tx, rx) = oneshot::channel();
        self.command(CaptureCommand::Rotate { reply: tx }, rx).await
    }
}

/// A running capture: handle plus worker task
pub struct Capture {
    handle: CaptureHandle,
    worker: JoinHandle<()>,
}

impl Capture {
    /// Create a capture for `iface` and start its state machine
    pub fn spawn(iface: &str, config: CaptureConfig, source_init: SourceInitFn) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);

        let worker = CaptureWorker {
            iface: iface.to_string(),
            config,
            state: State::Initializing,
            cmd_rx,
            error_tx,
            error_rx,
            source_init,
            inner: Arc::new(CaptureInner {
                flow_log: Mutex::new(FlowLog::new()),
                err_map: Mutex::new(ErrorMap::new()),
                packets_logged: AtomicU64::new(0),
            }),
            activation: None,
            last_rotation_stats: CaptureStats::default(),
            packets_logged_at_rotation: 0,
            started_at: Utc::now(),
        };

        Self {
            handle: CaptureHandle {
                iface: iface.to_string(),
                cmd_tx,
            },
            worker: tokio::spawn(worker.run()),
        }
    }

    pub fn handle(&self) -> &CaptureHandle {
        &self.handle
    }

    pub fn iface(&self) -> &str {
        &self.handle.iface
    }

    /// Shut the capture down and wait for the worker to finish
    pub async fn close(self) {
        let (tx, rx) = oneshot::channel();
        if self
            .handle
            .cmd_tx
            .send(CaptureCommand::Close { done: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        if let Err(e) = self.worker.await {
            warn!(iface = %self.handle.iface, "capture worker panicked: {e}");
        }
    }
}

/// State shared between the worker and the packet task for the lifetime
/// of the capture. Survives source reinitialization: the flow log keeps
/// its (possibly unrotated) flows across a reset.
struct CaptureInner {
    flow_log: Mutex<FlowLog>,
    err_map: Mutex<ErrorMap>,
    packets_logged: AtomicU64,
}

/// Per-source-activation resources, torn down on every reset
struct Activation {
    source: Arc<Mutex<Box<dyn CaptureSource>>>,
    stop: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

struct CaptureWorker {
    iface: String,
    config: CaptureConfig,
    state: State,

    cmd_rx: mpsc::Receiver<CaptureCommand>,
    // the worker keeps one sender so the channel never closes while
    // packet tasks come and go
    error_tx: mpsc::Sender<String>,
    error_rx: mpsc::Receiver<String>,

    source_init: SourceInitFn,
    inner: Arc<CaptureInner>,
    activation: Option<Activation>,

    last_rotation_stats: CaptureStats,
    packets_logged_at_rotation: u64,
    started_at: DateTime<Utc>,
}

impl CaptureWorker {
    async fn run(mut self) {
        loop {
            debug!(iface = %self.iface, state = %self.state, "interface state transition");
            self.state = match self.state {
                State::Initializing => self.initializing(),
                State::Capturing => self.capturing().await,
                State::Error => self.in_error().await,
                State::Closing => {
                    self.closing().await;
                    return;
                }
            };
        }
    }

    fn initializing(&mut self) -> State {
        info!(iface = %self.iface, "initializing capture");

        match (self.source_init)(&self.iface, &self.config) {
            Ok(source) => {
                let source = Arc::new(Mutex::new(source));
                let stop = Arc::new(AtomicBool::new(false));
                let task = tokio::task::spawn_blocking({
                    let iface = self.iface.clone();
                    let source = Arc::clone(&source);
                    let stop = Arc::clone(&stop);
                    let inner = Arc::clone(&self.inner);
                    let error_tx = self.error_tx.clone();
                    move || packet_loop(&iface, &source, &stop, &inner, &error_tx)
                });

                self.activation = Some(Activation { source, stop, task });
                self.started_at = Utc::now();
                State::Capturing
            }
            Err(e) => {
                error!(iface = %self.iface, "failed to create new packet source: {e}");
                State::Error
            }
        }
    }

    async fn capturing(&mut self) -> State {
        info!(iface = %self.iface, "capturing packets");

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if let Some(next) = self.execute(cmd).await {
                            return next;
                        }
                    }
                    // all handles dropped; tear down
                    None => return State::Closing,
                },
                Some(err) = self.error_rx.recv() => {
                    error!(iface = %self.iface, "{err}");
                    return State::Error;
                }
            }
        }
    }

    async fn in_error(&mut self) -> State {
        info!(iface = %self.iface, "waiting for configuration update to re-initialize");

        loop {
            match self.cmd_rx.recv().await {
                Some(cmd) => {
                    if let Some(next) = self.execute(cmd).await {
                        return next;
                    }
                }
                None => return State::Closing,
            }
        }
    }

    async fn closing(&mut self) {
        self.reset().await;
        self.cmd_rx.close();
        info!(iface = %self.iface, "capture closed");
    }

    /// Execute a command; a returned state is the next FSM state
    async fn execute(&mut self, cmd: CaptureCommand) -> Option<State> {
        match cmd {
            CaptureCommand::Status { reply } => {
                let status = CaptureStatus {
                    state: self.state,
                    stats: self.interface_stats(),
                };
                let _ = reply.send(status);
                None
            }
            CaptureCommand::Errors { reply } => {
                let _ = reply.send(self.inner.err_map.lock().clone());
                None
            }
            CaptureCommand::Flows { reply } => {
                let _ = reply.send(self.inner.flow_log.lock().flows().clone());
                None
            }
            CaptureCommand::Update { config, done } => {
                let next = if self.needs_reinitialization(&config) {
                    info!(iface = %self.iface, "interface received updated configuration");
                    self.reset().await;
                    self.config = config;
                    Some(State::Initializing)
                } else {
                    None
                };
                let _ = done.send(());
                next
            }
            CaptureCommand::Rotate { reply } => {
                let flows = {
                    let mut flow_log = self.inner.flow_log.lock();
                    if flow_log.is_empty() {
                        debug!(iface = %self.iface, "there are currently no flow records available");
                    }
                    flow_log.rotate()
                };

                let stats = self.interface_stats();
                self.last_rotation_stats = self.try_get_capture_stats();
                self.packets_logged_at_rotation =
                    self.inner.packets_logged.load(Ordering::Relaxed);

                let _ = reply.send(RotateResult { flows, stats });
                None
            }
            CaptureCommand::Close { done } => {
                let _ = done.send(());
                Some(State::Closing)
            }
        }
    }

    /// Whether applying `config` requires tearing down the capture
    /// source. Structural comparison over all fields, including the ring
    /// buffer geometry.
    fn needs_reinitialization(&self, config: &CaptureConfig) -> bool {
        self.config != *config
    }

    /// Close the source, stop the packet task and clear derived state.
    /// The flow log and total packet counter survive: they correspond to
    /// flows that have not been rotated out yet.
    async fn reset(&mut self) {
        if let Some(activation) = self.activation.take() {
            info!(iface = %self.iface, "closing capture handle");

            activation.stop.store(true, Ordering::Release);
            activation.source.lock().close();
            if let Err(e) = activation.task.await {
                warn!(iface = %self.iface, "packet task panicked: {e}");
            }
        }

        // discard any stale fatal error from the torn-down packet task
        while self.error_rx.try_recv().is_ok() {}

        self.last_rotation_stats = CaptureStats::default();
        self.inner.err_map.lock().clear();
    }

    fn try_get_capture_stats(&self) -> CaptureStats {
        let Some(activation) = &self.activation else {
            return CaptureStats::default();
        };
        match activation.source.lock().stats() {
            Ok(stats) => stats,
            Err(e) => {
                warn!(iface = %self.iface, "failed to get capture stats: {e}");
                CaptureStats::default()
            }
        }
    }

    fn interface_stats(&self) -> InterfaceStats {
        let src = self.try_get_capture_stats();
        let logged = self.inner.packets_logged.load(Ordering::Relaxed);

        InterfaceStats {
            received_total: src.packets_received,
            received: src
                .packets_received
                .saturating_sub(self.last_rotation_stats.packets_received),
            processed_total: logged,
            processed: logged.saturating_sub(self.packets_logged_at_rotation),
            dropped: src
                .packets_dropped
                .saturating_sub(self.last_rotation_stats.packets_dropped),
            started_at: self.started_at,
        }
    }
}

/// Packet-processing loop, run on a blocking thread.
///
/// Reads the source until it is closed, feeding every decodable packet
/// into the flow log. Decode failures accumulate in the error map and
/// are logged once per distinct message; crossing the consecutive-failure
/// threshold reports a fatal error and ends the task.
fn packet_loop(
    iface: &str,
    source: &Mutex<Box<dyn CaptureSource>>,
    stop: &AtomicBool,
    inner: &CaptureInner,
    error_tx: &mpsc::Sender<String>,
) {
    let mut buf = Vec::with_capacity(super::SNAPLEN as usize);
    let mut consecutive_failures = 0u64;

    loop {
        if stop.load(Ordering::Acquire) {
            return;
        }

        // the source lock is released between polls so the worker can
        // query stats while the task idles
        let result = source.lock().next_packet(&mut buf);
        match result {
            Ok(pkt) => {
                let added = inner
                    .flow_log
                    .lock()
                    .add(pkt.ip_layer, pkt.pkt_type, pkt.total_len);
                match added {
                    Ok(()) => {
                        consecutive_failures = 0;
                        inner.packets_logged.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        consecutive_failures += 1;

                        let msg = e.to_string();
                        {
                            let mut err_map = inner.err_map.lock();
                            let count = err_map.entry(msg.clone()).or_insert(0);
                            if *count == 0 {
                                warn!(iface, error = %msg, "discovered faulty packet");
                            }
                            *count += 1;
                        }

                        if consecutive_failures > ERROR_THRESHOLD {
                            let _ = error_tx.blocking_send(format!(
                                "the last {ERROR_THRESHOLD} packets could not be decoded"
                            ));
                            return;
                        }
                    }
                }
            }
            Err(SourceError::Timeout) => {}
            // expected during shutdown
            Err(SourceError::Closed) => return,
            Err(e) => {
                let _ = error_tx.blocking_send(e.to_string());
                return;
            }
        }
    }
}
