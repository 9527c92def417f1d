//! One simulated IPC process.
//!
//! A node owns an [`EnrollmentTask`] and feeds it from a single event queue:
//! operations from the fabric, flow lifecycle, timer expiries, manager
//! requests, address changes and the periodic watchdog and neighbors-enroller
//! ticks. Events are handled one at a time, in arrival order.

use crate::config::ProcessConfig;
use crate::fabric::Fabric;
use crate::timers::TokioTimers;
use anyhow::{Context, Result, bail};
use enrollment_core::messages::{DataTransferConstants, QosCube, RemoteOperation};
use enrollment_core::security::AuthProfile;
use enrollment_core::transport::{FlowHandle, PortId, SystemClock, TimerId};
use enrollment_core::{
    Collaborators, EnrollmentConfig, EnrollmentEvent, EnrollmentTask, EventBus, LocalProcess,
    LoggingNotifier, ManagerEnrollRequest, NeighborDirectory, RangeAddressAssigner,
    SecurityManager, Subscription,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, info, warn};

/// Everything a node reacts to.
#[derive(Debug)]
pub enum NodeEvent {
    /// JSON-encoded remote operation received on a port
    Operation { port: PortId, data: Vec<u8> },
    FlowAllocated { handle: FlowHandle, port: PortId },
    FlowAllocationFailed { handle: FlowHandle, reason: String },
    FlowDeallocated { port: PortId },
    TimerFired(TimerId),
    /// Enrollment request from the IPC manager
    Enroll(ManagerEnrollRequest),
    /// New local address, announced to every peer
    ChangeAddress(u64),
    WatchdogTick,
    EnrollerTick,
    Shutdown,
}

struct Node {
    name: String,
    task: Arc<EnrollmentTask>,
    timers: Arc<TokioTimers>,
    rx: mpsc::UnboundedReceiver<NodeEvent>,
}

impl Node {
    async fn run(mut self) {
        debug!("{} event loop started", self.name);
        while let Some(event) = self.rx.recv().await {
            if matches!(event, NodeEvent::Shutdown) {
                break;
            }
            self.handle(event);
        }
        self.timers.cancel_all();
        debug!("{} event loop stopped", self.name);
    }

    fn handle(&self, event: NodeEvent) {
        match event {
            NodeEvent::Operation { port, data } => match RemoteOperation::from_json(&data) {
                Ok(operation) => {
                    if let Err(e) = self.task.process_remote_operation(port, operation) {
                        debug!("{}: operation on port {} dropped: {}", self.name, port, e);
                    }
                }
                Err(e) => warn!("{}: undecodable operation on port {}: {}", self.name, port, e),
            },
            NodeEvent::FlowAllocated { handle, port } => {
                if let Err(e) = self.task.flow_allocated(handle, port) {
                    warn!("{}: flow {} on port {}: {}", self.name, handle, port, e);
                }
            }
            NodeEvent::FlowAllocationFailed { handle, reason } => {
                self.task.flow_allocation_failed(handle, &reason)
            }
            NodeEvent::FlowDeallocated { port } => self.task.flow_deallocated(port),
            NodeEvent::TimerFired(id) => {
                if let Err(e) = self.task.timer_expired(id) {
                    warn!("{}: timer on port {}: {}", self.name, id.port, e);
                }
            }
            NodeEvent::Enroll(request) => {
                let id = request.correlation_id;
                if let Err(e) = self.task.process_enrollment_request(request) {
                    warn!("{}: enrollment request {} refused: {}", self.name, id, e);
                }
            }
            NodeEvent::ChangeAddress(address) => {
                let announced = self.task.change_address(address);
                info!("{}: now at address {}, told {} peers", self.name, address, announced);
            }
            NodeEvent::WatchdogTick => {
                let probes = self.task.watchdog().send_probes();
                if probes > 0 {
                    debug!("{}: sent {} watchdog probes", self.name, probes);
                }
            }
            NodeEvent::EnrollerTick => self.task.enroll_neighbors(),
            NodeEvent::Shutdown => {}
        }
    }
}

/// Queue a tick on the node every `period`, starting one period from now.
fn spawn_ticker(
    period: Duration,
    tx: mpsc::UnboundedSender<NodeEvent>,
    tick: fn() -> NodeEvent,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            if tx.send(tick()).is_err() {
                break;
            }
        }
    })
}

/// Enrollment events of one node, as a stream.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<EnrollmentEvent>,
    _subscription: Subscription,
}

impl EventStream {
    pub async fn next(&mut self) -> Option<EnrollmentEvent> {
        self.rx.recv().await
    }
}

/// Control side of a running node.
pub struct NodeHandle {
    name: String,
    task: Arc<EnrollmentTask>,
    tx: mpsc::UnboundedSender<NodeEvent>,
    event_loop: JoinHandle<()>,
    tickers: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// Build the node for `process`, attach it to the fabric and start it.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        process: &ProcessConfig,
        config: EnrollmentConfig,
        fabric: &Arc<Fabric>,
    ) -> Result<Self> {
        config
            .validate()
            .with_context(|| format!("Invalid enrollment configuration for {}", process.name))?;
        let range = &process.address_range;
        if range.first == 0 || range.first > range.last {
            bail!(
                "{}: address range {}..={} is empty",
                process.name,
                range.first,
                range.last
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        fabric.attach(&process.name, tx.clone());
        let endpoint = Arc::new(fabric.endpoint(&process.name));

        let directory = Arc::new(NeighborDirectory::new());
        if process.is_bootstrap() {
            directory.set_address(process.address);
            directory.set_data_transfer_constants(DataTransferConstants::default());
            directory.add_qos_cubes(vec![
                QosCube::new(1, "unreliable"),
                QosCube {
                    ordered_delivery: true,
                    partial_delivery: false,
                    max_allowable_gap: 0,
                    ..QosCube::new(2, "reliable")
                },
            ]);
        }

        let security = SecurityManager::new().with_default_profile(AuthProfile {
            policy: process.auth_policy.clone(),
            password: process.password.clone(),
        });
        let timers = Arc::new(TokioTimers::new(tx.clone()));
        let events = Arc::new(EventBus::new());
        let local = LocalProcess::new(process.name.clone(), process.supporting_difs.clone())
            .assigned_to(process.dif_name.clone());

        let task = EnrollmentTask::new(
            local,
            config.clone(),
            directory.clone(),
            events,
            Collaborators {
                channel: endpoint.clone(),
                flows: endpoint,
                security: Arc::new(security),
                addresses: Arc::new(RangeAddressAssigner::new(
                    process.address_range.first..=process.address_range.last,
                    directory,
                )),
                timers: timers.clone(),
                clock: Arc::new(SystemClock),
                manager: Arc::new(LoggingNotifier),
            },
        );

        let mut tickers = vec![spawn_ticker(config.watchdog_period(), tx.clone(), || {
            NodeEvent::WatchdogTick
        })];
        match config.neighbors_enroller_period() {
            Some(period) => tickers.push(spawn_ticker(period, tx.clone(), || NodeEvent::EnrollerTick)),
            None => debug!("{}: neighbors enroller disabled", process.name),
        }

        let node = Node {
            name: process.name.clone(),
            task: task.clone(),
            timers,
            rx,
        };
        let event_loop = tokio::spawn(node.run());

        info!(
            "Started {} in {} (address {})",
            process.name, process.dif_name, process.address
        );

        Ok(Self {
            name: process.name.clone(),
            task,
            tx,
            event_loop,
            tickers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task(&self) -> &Arc<EnrollmentTask> {
        &self.task
    }

    /// Queue an enrollment request as the IPC manager would.
    pub fn enroll(&self, request: ManagerEnrollRequest) -> Result<()> {
        self.tx
            .send(NodeEvent::Enroll(request))
            .map_err(|_| anyhow::anyhow!("{} has stopped", self.name))
    }

    /// Move the node to a new address.
    pub fn change_address(&self, address: u64) -> Result<()> {
        self.tx
            .send(NodeEvent::ChangeAddress(address))
            .map_err(|_| anyhow::anyhow!("{} has stopped", self.name))
    }

    /// Subscribe to this node's enrollment events.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.task.events().subscribe(move |event| {
            let _ = tx.send(event);
        });
        EventStream {
            rx,
            _subscription: subscription,
        }
    }

    /// Stop the tickers and the event loop, then wait for the loop to finish.
    pub async fn shutdown(self) {
        for ticker in &self.tickers {
            ticker.abort();
        }
        let _ = self.tx.send(NodeEvent::Shutdown);
        if let Err(e) = self.event_loop.await {
            warn!("{} event loop ended abnormally: {}", self.name, e);
        }
    }
}
