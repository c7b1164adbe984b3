//! Static cluster-shape parameters

use relay_common::TopologyError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process role inside the training cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Learner,
    Actor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Learner => "learner",
            Role::Actor => "actor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster shape as seen by one process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterShape {
    /// Number of learner nodes
    pub learner_node_count: usize,
    /// Number of actor nodes (may be zero)
    pub actor_node_count: usize,
    /// Learner tasks (one per accelerator) on each learner node
    pub tasks_per_learner_node: usize,
    /// Actor tasks on each actor node
    pub tasks_per_actor_node: usize,
    /// Role of this process
    pub role: Role,
    /// Index of this process's node among nodes of the same role
    pub node_index: usize,
    /// Index of this process's task within its node
    pub local_task_index: usize,
}

impl Default for ClusterShape {
    fn default() -> Self {
        Self {
            learner_node_count: 1,
            actor_node_count: 1,
            tasks_per_learner_node: 1,
            tasks_per_actor_node: 1,
            role: Role::Learner,
            node_index: 0,
            local_task_index: 0,
        }
    }
}

impl ClusterShape {
    pub fn new(
        learner_node_count: usize,
        actor_node_count: usize,
        tasks_per_learner_node: usize,
        tasks_per_actor_node: usize,
    ) -> Self {
        Self {
            learner_node_count,
            actor_node_count,
            tasks_per_learner_node,
            tasks_per_actor_node,
            ..Self::default()
        }
    }

    /// Set which process this shape describes
    pub fn for_process(mut self, role: Role, node_index: usize, local_task_index: usize) -> Self {
        self.role = role;
        self.node_index = node_index;
        self.local_task_index = local_task_index;
        self
    }

    pub fn node_count(&self, role: Role) -> usize {
        match role {
            Role::Learner => self.learner_node_count,
            Role::Actor => self.actor_node_count,
        }
    }

    pub fn tasks_per_node(&self, role: Role) -> usize {
        match role {
            Role::Learner => self.tasks_per_learner_node,
            Role::Actor => self.tasks_per_actor_node,
        }
    }

    pub fn actor_task_count(&self) -> usize {
        self.actor_node_count * self.tasks_per_actor_node
    }

    pub fn learner_task_count(&self) -> usize {
        self.learner_node_count * self.tasks_per_learner_node
    }

    /// Check counts and this process's indices
    pub fn validate(&self) -> Result<(), TopologyError> {
        if self.learner_node_count == 0 {
            return Err(TopologyError::ZeroCount("learner_node_count"));
        }
        if self.tasks_per_learner_node == 0 {
            return Err(TopologyError::ZeroCount("tasks_per_learner_node"));
        }
        if self.tasks_per_actor_node == 0 {
            return Err(TopologyError::ZeroCount("tasks_per_actor_node"));
        }

        let count = self.node_count(self.role);
        if self.node_index >= count {
            return Err(TopologyError::NodeIndexOutOfRange {
                role: self.role.to_string(),
                index: self.node_index,
                count,
            });
        }

        let tasks = self.tasks_per_node(self.role);
        if self.local_task_index >= tasks {
            return Err(TopologyError::TaskIndexOutOfRange {
                role: self.role.to_string(),
                index: self.local_task_index,
                count: tasks,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_shape_is_valid() {
        assert!(ClusterShape::default().validate().is_ok());
    }

    #[test]
    fn test_node_index_out_of_range() {
        let shape = ClusterShape::new(2, 4, 1, 1).for_process(Role::Learner, 2, 0);
        assert_eq!(
            shape.validate(),
            Err(TopologyError::NodeIndexOutOfRange {
                role: "learner".into(),
                index: 2,
                count: 2
            })
        );
    }

    #[test]
    fn test_actor_without_actor_nodes() {
        let shape = ClusterShape::new(1, 0, 1, 1).for_process(Role::Actor, 0, 0);
        assert!(matches!(
            shape.validate(),
            Err(TopologyError::NodeIndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_zero_learner_tasks_rejected() {
        let shape = ClusterShape::new(1, 1, 0, 1);
        assert_eq!(
            shape.validate(),
            Err(TopologyError::ZeroCount("tasks_per_learner_node"))
        );
    }

    #[test]
    fn test_role_deserializes_lowercase() {
        let role: Role = serde_json::from_str("\"actor\"").unwrap();
        assert_eq!(role, Role::Actor);
    }
}
