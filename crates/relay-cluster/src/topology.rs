//! Topology assignment
//!
//! [`assign`] is a pure function of the [`ClusterShape`]: no randomness, no global state.

use std::collections::BTreeMap;

use relay_common::TopologyError;
use tracing::debug;

use crate::shape::{ClusterShape, Role};

/// Where an actor task reports to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LearnerAssignment {
    /// Learner node index
    pub learner_node: usize,
    /// Learner task index within that node
    pub learner_local_task: usize,
    /// Position of the actor among actors sharing that learner task
    pub actor_rank: usize,
}

/// A task addressed by node and local task index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskRef {
    pub node: usize,
    pub local_task: usize,
}

/// Per-process view of the cluster, immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    role: Role,
    node_index: usize,
    local_task_index: usize,
    world_rank: usize,
    home: TaskRef,
    actor_to_learner: BTreeMap<usize, LearnerAssignment>,
    learner_to_actors: BTreeMap<TaskRef, Vec<TaskRef>>,
}

/// Compute the topology for the process described by `shape`
pub fn assign(shape: &ClusterShape) -> Result<Topology, TopologyError> {
    shape.validate()?;

    let learner_nodes = shape.learner_node_count;
    let learner_tasks = shape.tasks_per_learner_node;
    let actor_tasks_per_node = shape.tasks_per_actor_node;
    let world_rank = shape.tasks_per_node(shape.role) * shape.node_index + shape.local_task_index;

    // Every learner task is present, even with no actors.
    let mut learner_to_actors: BTreeMap<TaskRef, Vec<TaskRef>> = (0..learner_nodes)
        .flat_map(|node| (0..learner_tasks).map(move |local_task| TaskRef { node, local_task }))
        .map(|task| (task, Vec::new()))
        .collect();
    let mut actor_to_learner = BTreeMap::new();

    for learner_node in 0..learner_nodes {
        // Actor world ranks owned by this node, in ascending order
        let owned = (0..shape.actor_task_count()).filter(|wr| wr % learner_nodes == learner_node);

        for (position, actor_wr) in owned.enumerate() {
            let learner_local_task = position % learner_tasks;
            let assignment = LearnerAssignment {
                learner_node,
                learner_local_task,
                actor_rank: position / learner_tasks,
            };
            actor_to_learner.insert(actor_wr, assignment);

            let learner = TaskRef {
                node: learner_node,
                local_task: learner_local_task,
            };
            learner_to_actors.entry(learner).or_default().push(TaskRef {
                node: actor_wr / actor_tasks_per_node,
                local_task: actor_wr % actor_tasks_per_node,
            });
        }
    }

    let home = match shape.role {
        Role::Learner => TaskRef {
            node: shape.node_index,
            local_task: shape.local_task_index,
        },
        Role::Actor => {
            // validate() guarantees this actor's rank was assigned above
            let a = actor_to_learner[&world_rank];
            TaskRef {
                node: a.learner_node,
                local_task: a.learner_local_task,
            }
        }
    };

    debug!(
        role = %shape.role,
        world_rank,
        actors = actor_to_learner.len(),
        learners = learner_to_actors.len(),
        "Computed cluster topology"
    );

    Ok(Topology {
        role: shape.role,
        node_index: shape.node_index,
        local_task_index: shape.local_task_index,
        world_rank,
        home,
        actor_to_learner,
        learner_to_actors,
    })
}

impl Topology {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn node_index(&self) -> usize {
        self.node_index
    }

    pub fn local_task_index(&self) -> usize {
        self.local_task_index
    }

    pub fn world_rank(&self) -> usize {
        self.world_rank
    }

    /// Job name in the per-learner training group
    pub fn job_name(&self) -> &'static str {
        self.role.as_str()
    }

    /// Task index in the per-learner training group; the learner is always the hub (0)
    pub fn task_index(&self) -> usize {
        match self.role {
            Role::Learner => 0,
            Role::Actor => self
                .actor_to_learner
                .get(&self.world_rank)
                .map(|a| a.actor_rank)
                .unwrap_or(0),
        }
    }

    /// Learner assignment for an actor world rank
    pub fn learner_for_actor(&self, actor_world_rank: usize) -> Option<LearnerAssignment> {
        self.actor_to_learner.get(&actor_world_rank).copied()
    }

    /// Actors served by a learner task, in assignment order
    pub fn actors_for_learner(&self, learner_node: usize, learner_local_task: usize) -> &[TaskRef] {
        self.learner_to_actors
            .get(&TaskRef {
                node: learner_node,
                local_task: learner_local_task,
            })
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Learner task this process belongs to: itself for a learner, its hub for an actor
    pub fn home_learner(&self) -> TaskRef {
        self.home
    }

    /// Learner-local task index an actor reports to
    pub fn learner_local_rank(&self) -> Option<usize> {
        match self.role {
            Role::Learner => None,
            Role::Actor => Some(self.home_learner().local_task),
        }
    }

    pub fn actor_to_learner(&self) -> &BTreeMap<usize, LearnerAssignment> {
        &self.actor_to_learner
    }

    pub fn learner_to_actors(&self) -> &BTreeMap<TaskRef, Vec<TaskRef>> {
        &self.learner_to_actors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_world_rank() {
        let shape = ClusterShape::new(2, 3, 4, 2).for_process(Role::Actor, 2, 1);
        let topo = assign(&shape).unwrap();
        assert_eq!(topo.world_rank(), 5);

        let shape = ClusterShape::new(2, 3, 4, 2).for_process(Role::Learner, 1, 3);
        let topo = assign(&shape).unwrap();
        assert_eq!(topo.world_rank(), 7);
        assert_eq!(topo.task_index(), 0);
        assert_eq!(topo.job_name(), "learner");
    }

    #[test]
    fn test_known_assignment() {
        // 2 learner nodes x 2 tasks, 3 actor nodes x 2 tasks = 6 actor ranks.
        // node 0 owns [0, 2, 4], node 1 owns [1, 3, 5].
        let shape = ClusterShape::new(2, 3, 2, 2).for_process(Role::Actor, 2, 0);
        let topo = assign(&shape).unwrap();

        let a4 = topo.learner_for_actor(4).unwrap();
        assert_eq!(
            a4,
            LearnerAssignment {
                learner_node: 0,
                learner_local_task: 0,
                actor_rank: 1
            }
        );
        assert_eq!(topo.world_rank(), 4);
        assert_eq!(topo.task_index(), 1);
        assert_eq!(topo.learner_local_rank(), Some(0));

        assert_eq!(
            topo.actors_for_learner(0, 0),
            &[
                TaskRef { node: 0, local_task: 0 },
                TaskRef { node: 2, local_task: 0 }
            ]
        );
        assert_eq!(topo.actors_for_learner(0, 1), &[TaskRef { node: 1, local_task: 0 }]);
        assert_eq!(topo.actors_for_learner(1, 1), &[TaskRef { node: 1, local_task: 1 }]);
    }

    #[test]
    fn test_more_learners_than_actors() {
        let shape = ClusterShape::new(3, 1, 1, 1);
        let topo = assign(&shape).unwrap();
        assert_eq!(topo.actors_for_learner(0, 0).len(), 1);
        assert!(topo.actors_for_learner(1, 0).is_empty());
        assert!(topo.actors_for_learner(2, 0).is_empty());
        assert_eq!(topo.learner_to_actors().len(), 3);
    }

    #[test]
    fn test_invalid_shape_fails_fast() {
        let shape = ClusterShape::new(1, 1, 1, 1).for_process(Role::Actor, 3, 0);
        assert!(assign(&shape).is_err());
    }

    fn shapes() -> impl Strategy<Value = ClusterShape> {
        (1usize..6, 0usize..8, 1usize..5, 1usize..5).prop_map(|(ln, an, lt, at)| {
            ClusterShape::new(ln, an, lt, at)
        })
    }

    proptest! {
        /// Property: the same shape always yields the same topology
        #[test]
        fn test_assign_is_deterministic(shape in shapes()) {
            prop_assert_eq!(assign(&shape).unwrap(), assign(&shape).unwrap());
        }

        /// Property: every actor rank has exactly one learner task, and every learner
        /// task lists each of its actors exactly once
        #[test]
        fn test_assignment_covers_every_actor(shape in shapes()) {
            let topo = assign(&shape).unwrap();
            let actor_tasks = shape.actor_task_count();

            prop_assert_eq!(topo.actor_to_learner().len(), actor_tasks);
            prop_assert_eq!(topo.learner_to_actors().len(), shape.learner_task_count());

            let listed: usize = topo.learner_to_actors().values().map(Vec::len).sum();
            prop_assert_eq!(listed, actor_tasks);

            for wr in 0..actor_tasks {
                let a = topo.learner_for_actor(wr).unwrap();
                let me = TaskRef {
                    node: wr / shape.tasks_per_actor_node,
                    local_task: wr % shape.tasks_per_actor_node,
                };
                let peers = topo.actors_for_learner(a.learner_node, a.learner_local_task);
                prop_assert_eq!(peers.iter().filter(|t| **t == me).count(), 1);
                prop_assert_eq!(peers[a.actor_rank], me);
            }
        }
    }
}
