//! Network addresses of cluster tasks and the per-learner cluster spec

use relay_common::TopologyError;
use serde::{Deserialize, Serialize};

use crate::shape::{ClusterShape, Role};
use crate::topology::{TaskRef, Topology};

/// Per-node IPs and per-task ports for both roles.
///
/// Port lists are indexed by local task index and are shared by every node of a role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterAddresses {
    pub learner_ips: Vec<String>,
    pub actor_ips: Vec<String>,
    pub learner_grpc_ports: Vec<u16>,
    pub actor_grpc_ports: Vec<u16>,
    /// Ports aisrv connects to, one per learner task
    pub learner_svr_ports: Vec<u16>,
    /// Ports aisrv connects to, one per actor task
    pub actor_svr_ports: Vec<u16>,
}

/// Members of one learner task's training group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub learner: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Vec<String>>,
}

impl ClusterSpec {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn check_len<T>(field: &'static str, list: &[T], expected: usize) -> Result<(), TopologyError> {
    // An empty list means "not supplied"
    if list.is_empty() || list.len() == expected {
        return Ok(());
    }
    Err(TopologyError::AddressMismatch {
        field,
        expected,
        actual: list.len(),
    })
}

fn missing(field: &'static str, expected: usize) -> TopologyError {
    TopologyError::AddressMismatch {
        field,
        expected,
        actual: 0,
    }
}

impl ClusterAddresses {
    /// Check every supplied list against the shape counts
    pub fn validate(&self, shape: &ClusterShape) -> Result<(), TopologyError> {
        check_len("learner_ips", &self.learner_ips, shape.learner_node_count)?;
        check_len("actor_ips", &self.actor_ips, shape.actor_node_count)?;
        check_len(
            "learner_grpc_ports",
            &self.learner_grpc_ports,
            shape.tasks_per_learner_node,
        )?;
        check_len(
            "actor_grpc_ports",
            &self.actor_grpc_ports,
            shape.tasks_per_actor_node,
        )?;
        check_len(
            "learner_svr_ports",
            &self.learner_svr_ports,
            shape.tasks_per_learner_node,
        )?;
        check_len(
            "actor_svr_ports",
            &self.actor_svr_ports,
            shape.tasks_per_actor_node,
        )?;
        Ok(())
    }

    fn ip(&self, role: Role, node: usize) -> Result<&str, TopologyError> {
        let (field, list) = match role {
            Role::Learner => ("learner_ips", &self.learner_ips),
            Role::Actor => ("actor_ips", &self.actor_ips),
        };
        list.get(node)
            .map(String::as_str)
            .ok_or_else(|| missing(field, node + 1))
    }

    fn grpc(&self, role: Role, task: usize) -> Result<u16, TopologyError> {
        let (field, list) = match role {
            Role::Learner => ("learner_grpc_ports", &self.learner_grpc_ports),
            Role::Actor => ("actor_grpc_ports", &self.actor_grpc_ports),
        };
        list.get(task).copied().ok_or_else(|| missing(field, task + 1))
    }

    fn svr(&self, role: Role, task: usize) -> Result<u16, TopologyError> {
        let (field, list) = match role {
            Role::Learner => ("learner_svr_ports", &self.learner_svr_ports),
            Role::Actor => ("actor_svr_ports", &self.actor_svr_ports),
        };
        list.get(task).copied().ok_or_else(|| missing(field, task + 1))
    }

    /// IP address of this process's node
    pub fn ip_address(&self, topo: &Topology) -> Result<&str, TopologyError> {
        self.ip(topo.role(), topo.node_index())
    }

    /// Port aisrv uses to reach this task
    pub fn svr_port(&self, topo: &Topology) -> Result<u16, TopologyError> {
        self.svr(topo.role(), topo.local_task_index())
    }

    pub fn grpc_port(&self, topo: &Topology) -> Result<u16, TopologyError> {
        self.grpc(topo.role(), topo.local_task_index())
    }

    /// `ip:svr_port` of the learner task this process feeds
    pub fn learner_endpoint(&self, topo: &Topology) -> Result<String, TopologyError> {
        let home = topo.home_learner();
        Ok(format!(
            "{}:{}",
            self.ip(Role::Learner, home.node)?,
            self.svr(Role::Learner, home.local_task)?
        ))
    }

    /// Training group of the learner task this process belongs to.
    ///
    /// The actor entry is omitted when the learner task serves no actors.
    pub fn cluster_spec(&self, topo: &Topology) -> Result<ClusterSpec, TopologyError> {
        let home = topo.home_learner();
        let learner = format!(
            "{}:{}",
            self.ip(Role::Learner, home.node)?,
            self.grpc(Role::Learner, home.local_task)?
        );

        let actors = topo
            .actors_for_learner(home.node, home.local_task)
            .iter()
            .map(|TaskRef { node, local_task }| {
                Ok(format!(
                    "{}:{}",
                    self.ip(Role::Actor, *node)?,
                    self.grpc(Role::Actor, *local_task)?
                ))
            })
            .collect::<Result<Vec<_>, TopologyError>>()?;

        Ok(ClusterSpec {
            learner: vec![learner],
            actor: if actors.is_empty() { None } else { Some(actors) },
        })
    }
}
