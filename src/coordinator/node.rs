//! One node of the supervision tree, run as an actor.
//!
//! All of a node's allocation state lives inside a single tokio task served
//! over an mpsc channel, so decisions for one parent-children group are
//! linearized by construction and no lock spans the tree. Children receive
//! their grants through a watch channel: a child can only ever hold what the
//! channel handed it, which is what makes quota conservation enforceable.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

use super::allocation::{Allocation, Demand, allocate};
use crate::error::{Result, StewardError};
use crate::session::Priority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorLevel {
    Executive,
    Operational,
    Tactical,
    Agent,
}

impl CoordinatorLevel {
    pub fn child_level(&self) -> Option<CoordinatorLevel> {
        match self {
            Self::Executive => Some(Self::Operational),
            Self::Operational => Some(Self::Tactical),
            Self::Tactical => Some(Self::Agent),
            Self::Agent => None,
        }
    }
}

impl std::fmt::Display for CoordinatorLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Executive => "executive",
            Self::Operational => "operational",
            Self::Tactical => "tactical",
            Self::Agent => "agent",
        };
        write!(f, "{}", s)
    }
}

enum NodeCommand {
    SetQuota {
        quota: u64,
    },
    AttachChild {
        child: String,
        respond: oneshot::Sender<watch::Receiver<u64>>,
    },
    DetachChild {
        child: String,
    },
    /// Predictive path: update this child's demand estimate for the next
    /// epoch without forcing a recompute.
    ReportDemand {
        child: String,
        amount: u64,
        priority: Priority,
    },
    /// Reactive path: the child is saturated, recompute immediately.
    ReportSaturation {
        child: String,
        amount: u64,
        priority: Priority,
        respond: oneshot::Sender<Result<Allocation>>,
    },
    Recompute {
        respond: oneshot::Sender<Result<Allocation>>,
    },
    CurrentAllocation {
        respond: oneshot::Sender<Option<Allocation>>,
    },
}

/// Cheap clonable handle to a spawned coordinator node.
#[derive(Clone)]
pub struct NodeHandle {
    id: String,
    level: CoordinatorLevel,
    tx: mpsc::Sender<NodeCommand>,
}

struct NodeTask {
    id: String,
    quota: u64,
    epoch: u64,
    demands: HashMap<String, (u64, Priority)>,
    grant_channels: HashMap<String, watch::Sender<u64>>,
    latest: Option<Allocation>,
}

impl NodeHandle {
    /// Spawn a node with `quota` and a predictive recompute interval.
    pub fn spawn(
        id: impl Into<String>,
        level: CoordinatorLevel,
        quota: u64,
        recompute_interval: Duration,
    ) -> Self {
        let id = id.into();
        let (tx, mut rx) = mpsc::channel::<NodeCommand>(64);

        let mut task = NodeTask {
            id: id.clone(),
            quota,
            epoch: 0,
            demands: HashMap::new(),
            grant_channels: HashMap::new(),
            latest: None,
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(recompute_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    cmd = rx.recv() => {
                        match cmd {
                            Some(cmd) => task.handle(cmd),
                            None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = task.recompute() {
                            error!(node = %task.id, error = %e, "Interval allocation failed");
                        }
                    }
                }
            }
            debug!(node = %task.id, "Coordinator node stopped");
        });

        Self { id, level, tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn level(&self) -> CoordinatorLevel {
        self.level
    }

    async fn send(&self, cmd: NodeCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| StewardError::Coordination(format!("node {} is gone", self.id)))
    }

    /// Called by the parent with this node's own grant.
    pub async fn set_quota(&self, quota: u64) -> Result<()> {
        self.send(NodeCommand::SetQuota { quota }).await
    }

    /// Register a child and get the channel its grants arrive on.
    pub async fn attach_child(&self, child: impl Into<String>) -> Result<watch::Receiver<u64>> {
        let (respond, rx) = oneshot::channel();
        self.send(NodeCommand::AttachChild {
            child: child.into(),
            respond,
        })
        .await?;
        rx.await
            .map_err(|_| StewardError::Coordination(format!("node {} dropped attach", self.id)))
    }

    pub async fn detach_child(&self, child: impl Into<String>) -> Result<()> {
        self.send(NodeCommand::DetachChild {
            child: child.into(),
        })
        .await
    }

    pub async fn report_demand(
        &self,
        child: impl Into<String>,
        amount: u64,
        priority: Priority,
    ) -> Result<()> {
        self.send(NodeCommand::ReportDemand {
            child: child.into(),
            amount,
            priority,
        })
        .await
    }

    /// Saturation report: recomputes immediately and returns the new epoch's
    /// allocation.
    pub async fn report_saturation(
        &self,
        child: impl Into<String>,
        amount: u64,
        priority: Priority,
    ) -> Result<Allocation> {
        let (respond, rx) = oneshot::channel();
        self.send(NodeCommand::ReportSaturation {
            child: child.into(),
            amount,
            priority,
            respond,
        })
        .await?;
        rx.await
            .map_err(|_| StewardError::Coordination(format!("node {} dropped saturation", self.id)))?
    }

    pub async fn recompute(&self) -> Result<Allocation> {
        let (respond, rx) = oneshot::channel();
        self.send(NodeCommand::Recompute { respond }).await?;
        rx.await
            .map_err(|_| StewardError::Coordination(format!("node {} dropped recompute", self.id)))?
    }

    pub async fn current_allocation(&self) -> Result<Option<Allocation>> {
        let (respond, rx) = oneshot::channel();
        self.send(NodeCommand::CurrentAllocation { respond }).await?;
        rx.await
            .map_err(|_| StewardError::Coordination(format!("node {} dropped query", self.id)))
    }

    /// Forward grants from `parent_grants` into this node's quota, keeping
    /// the sub-tree's budget in lock-step with what the parent handed down.
    pub fn bind_parent(&self, mut parent_grants: watch::Receiver<u64>) {
        let handle = self.clone();
        tokio::spawn(async move {
            while parent_grants.changed().await.is_ok() {
                let granted = *parent_grants.borrow_and_update();
                if handle.set_quota(granted).await.is_err() {
                    break;
                }
            }
        });
    }
}

impl NodeTask {
    fn handle(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::SetQuota { quota } => {
                debug!(node = %self.id, quota, "Quota updated");
                self.quota = quota;
                // A shrunk quota must not leave stale over-grants visible.
                if let Err(e) = self.recompute() {
                    error!(node = %self.id, error = %e, "Recompute after quota change failed");
                }
            }
            NodeCommand::AttachChild { child, respond } => {
                let (tx, rx) = watch::channel(0);
                self.grant_channels.insert(child.clone(), tx);
                self.demands.entry(child).or_insert((0, Priority::P1));
                let _ = respond.send(rx);
            }
            NodeCommand::DetachChild { child } => {
                self.grant_channels.remove(&child);
                self.demands.remove(&child);
            }
            NodeCommand::ReportDemand {
                child,
                amount,
                priority,
            } => {
                self.demands.insert(child, (amount, priority));
            }
            NodeCommand::ReportSaturation {
                child,
                amount,
                priority,
                respond,
            } => {
                self.demands.insert(child, (amount, priority));
                let _ = respond.send(self.recompute());
            }
            NodeCommand::Recompute { respond } => {
                let _ = respond.send(self.recompute());
            }
            NodeCommand::CurrentAllocation { respond } => {
                let _ = respond.send(self.latest.clone());
            }
        }
    }

    fn recompute(&mut self) -> Result<Allocation> {
        self.epoch += 1;
        let demands: Vec<Demand> = self
            .demands
            .iter()
            .map(|(child, (amount, priority))| Demand {
                child: child.clone(),
                amount: *amount,
                priority: *priority,
            })
            .collect();

        let allocation = allocate(self.quota, &demands, self.epoch)?;

        for grant in &allocation.grants {
            if let Some(tx) = self.grant_channels.get(&grant.child) {
                // A closed receiver just means the child went away.
                let _ = tx.send(grant.granted);
            }
        }

        info!(
            node = %self.id,
            epoch = allocation.epoch,
            granted = allocation.total_granted(),
            quota = self.quota,
            shortfall = allocation.shortfall.len(),
            "Allocation recomputed"
        );
        self.latest = Some(allocation.clone());
        Ok(allocation)
    }
}
