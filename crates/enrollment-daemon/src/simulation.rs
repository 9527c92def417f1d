//! A set of nodes sharing one fabric, built from a [`DaemonConfig`].

use crate::config::DaemonConfig;
use crate::fabric::Fabric;
use crate::node::NodeHandle;
use anyhow::{Result, anyhow};
use enrollment_core::ManagerEnrollRequest;
use futures::future::join_all;
use std::sync::Arc;
use tracing::info;

pub struct Simulation {
    config: DaemonConfig,
    fabric: Arc<Fabric>,
    nodes: Vec<NodeHandle>,
    next_correlation_id: u64,
}

impl Simulation {
    /// Start one node per configured process. Must run inside a tokio runtime.
    pub fn start(config: DaemonConfig) -> Result<Self> {
        config.validate()?;
        let fabric = Fabric::new();
        let nodes = config
            .processes
            .iter()
            .map(|process| NodeHandle::spawn(process, config.enrollment.clone(), &fabric))
            .collect::<Result<Vec<_>>>()?;

        info!("Started {} processes", nodes.len());
        Ok(Self {
            config,
            fabric,
            nodes,
            next_correlation_id: 1,
        })
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&NodeHandle> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Ask `from` to enroll to `neighbor`. Returns the correlation id.
    pub fn enroll(&mut self, from: &str, neighbor: &str) -> Result<u64> {
        let process = self
            .config
            .process(from)
            .ok_or_else(|| anyhow!("Unknown process {}", from))?;
        let request = ManagerEnrollRequest {
            correlation_id: self.next_correlation_id,
            dif_name: process.dif_name.clone(),
            supporting_dif: process.supporting_dif().to_string(),
            neighbor_name: neighbor.to_string(),
        };
        let node = self
            .node(from)
            .ok_or_else(|| anyhow!("Process {} is not running", from))?;
        node.enroll(request)?;

        self.next_correlation_id += 1;
        Ok(self.next_correlation_id - 1)
    }

    /// Issue the enrollments listed in each process's `neighbors`.
    pub fn enroll_configured_neighbors(&mut self) -> Result<usize> {
        let pairs: Vec<(String, String)> = self
            .config
            .processes
            .iter()
            .flat_map(|p| p.neighbors.iter().map(|n| (p.name.clone(), n.clone())))
            .collect();

        for (from, neighbor) in &pairs {
            info!("Requesting enrollment of {} to {}", from, neighbor);
            self.enroll(from, neighbor)?;
        }
        Ok(pairs.len())
    }

    /// Crash `name`: its flows vanish and its event loop stops.
    pub async fn crash(&mut self, name: &str) -> Result<()> {
        let index = self
            .nodes
            .iter()
            .position(|n| n.name() == name)
            .ok_or_else(|| anyhow!("Process {} is not running", name))?;
        self.fabric.sever(name);
        self.nodes.remove(index).shutdown().await;
        Ok(())
    }

    pub async fn shutdown(self) {
        join_all(self.nodes.into_iter().map(NodeHandle::shutdown)).await;
        info!("All processes stopped");
    }
}
