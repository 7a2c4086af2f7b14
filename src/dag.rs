//! Scheduler (C7): owns the task DAG, resolves dependencies into ready
//! waves respecting concurrency caps (spec §4.7).
//!
//! Structurally grounded on the teacher's `dag/builder.rs` (`PhaseGraph`,
//! `DagBuilder`) and `dag/scheduler.rs` (`DagScheduler`, wave computation),
//! but the cycle-detection algorithm is new: the teacher's builder proves
//! a cycle exists via Kahn's algorithm and reports an unordered member set.
//! Spec §4.9 and §8 scenario 4 require the exact cycle path, so this module
//! uses DFS with an explicit recursion stack instead.

use crate::errors::{PlanError, SchedulerError};
use crate::model::{Plan, Task, TaskId};
use std::collections::{HashMap, HashSet, VecDeque};

/// Adjacency views over a Plan's tasks, generalized from the teacher's
/// `PhaseGraph`.
#[derive(Debug, Clone)]
pub struct PlanGraph {
    tasks: HashMap<TaskId, Task>,
    /// task_id -> tasks that depend on it
    dependents: HashMap<TaskId, Vec<TaskId>>,
    order: Vec<TaskId>,
}

impl PlanGraph {
    /// Build a graph from a plan's tasks, checking structural invariants
    /// (spec §3 Task invariants) but NOT cycles — cycle detection is a
    /// separate, explicit step (`detect_cycle`) so callers can report a
    /// precise path rather than fail at construction time.
    pub fn build(plan: &Plan) -> Result<Self, PlanError> {
        let mut tasks = HashMap::new();
        for task in &plan.tasks {
            if tasks.insert(task.task_id.clone(), task.clone()).is_some() {
                return Err(PlanError::DuplicateTask {
                    task_id: task.task_id.clone(),
                });
            }
        }

        let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in &plan.tasks {
            for dep in &task.depends_on {
                if dep == &task.task_id {
                    return Err(PlanError::SelfDependency {
                        task_id: task.task_id.clone(),
                    });
                }
                if !tasks.contains_key(dep) {
                    return Err(PlanError::DanglingDependency {
                        task_id: task.task_id.clone(),
                        dep_id: dep.clone(),
                    });
                }
                dependents.entry(dep.clone()).or_default().push(task.task_id.clone());
            }
        }

        let order = plan.tasks.iter().map(|t| t.task_id.clone()).collect();

        Ok(Self {
            tasks,
            dependents,
            order,
        })
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn dependents_of(&self, id: &str) -> &[TaskId] {
        self.dependents.get(id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.order.iter()
    }

    /// DFS with an explicit recursion stack. Returns the first cycle found
    /// as an ordered path, e.g. `["T1", "T2", "T1"]`, rendered by callers
    /// as `"T1 → T2 → T1"` (spec §4.9, §8 scenario 4).
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();

        for start in &self.order {
            if marks.contains_key(start.as_str()) {
                continue;
            }
            if let Some(path) = self.dfs_from(start, &mut marks, &mut stack) {
                return Some(path);
            }
        }
        None
    }

    fn dfs_from<'a>(
        &'a self,
        node: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<TaskId>> {
        marks.insert(node, Mark::Visiting);
        stack.push(node);

        if let Some(task) = self.tasks.get(node) {
            for dep in &task.depends_on {
                match marks.get(dep.as_str()) {
                    Some(Mark::Visiting) => {
                        // Found the back-edge; extract the cycle portion of
                        // the stack starting at `dep`.
                        let start_idx = stack.iter().position(|n| *n == dep.as_str()).unwrap();
                        let mut path: Vec<TaskId> =
                            stack[start_idx..].iter().map(|s| s.to_string()).collect();
                        path.push(dep.clone());
                        return Some(path);
                    }
                    Some(Mark::Done) => continue,
                    None => {
                        if let Some(path) = self.dfs_from(dep.as_str(), marks, stack) {
                            return Some(path);
                        }
                    }
                }
            }
        }

        stack.pop();
        marks.insert(node, Mark::Done);
        None
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Visiting,
    Done,
}

/// Status of a single task as tracked by the Scheduler (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
}

struct TaskNode {
    status: TaskStatus,
    priority: i32,
}

/// Maintains the task DAG and emits ready waves (spec §4.7).
pub struct DagScheduler {
    graph: PlanGraph,
    nodes: HashMap<TaskId, TaskNode>,
    running_count: usize,
    max_concurrency: usize,
}

impl DagScheduler {
    pub fn seed(graph: PlanGraph, max_concurrency: usize) -> Self {
        let mut nodes = HashMap::new();
        for id in graph.task_ids() {
            let priority = graph.task(id).map(|t| t.priority).unwrap_or(0);
            nodes.insert(
                id.clone(),
                TaskNode {
                    status: TaskStatus::Pending,
                    priority,
                },
            );
        }
        Self {
            graph,
            nodes,
            running_count: 0,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn remaining(&self) -> usize {
        self.nodes
            .values()
            .filter(|n| !matches!(n.status, TaskStatus::Completed | TaskStatus::Failed))
            .count()
    }

    fn deps_satisfied(&self, task_id: &str) -> bool {
        match self.graph.task(task_id) {
            Some(task) => task.depends_on.iter().all(|d| {
                matches!(
                    self.nodes.get(d).map(|n| n.status),
                    Some(TaskStatus::Completed)
                )
            }),
            None => false,
        }
    }

    /// Returns tasks whose dependencies are all completed, stably ordered
    /// by (priority desc, task_id lexicographic) (spec §4.7), capped by the
    /// remaining concurrency slots.
    pub fn ready(&mut self) -> Vec<TaskId> {
        let slots = self.max_concurrency.saturating_sub(self.running_count);
        if slots == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<TaskId> = self
            .nodes
            .iter()
            .filter(|(_, n)| matches!(n.status, TaskStatus::Pending))
            .map(|(id, _)| id.clone())
            .filter(|id| self.deps_satisfied(id))
            .collect();

        candidates.sort_by(|a, b| {
            let pa = self.nodes[a].priority;
            let pb = self.nodes[b].priority;
            pb.cmp(&pa).then_with(|| a.cmp(b))
        });
        candidates.truncate(slots);

        for id in &candidates {
            if let Some(node) = self.nodes.get_mut(id) {
                node.status = TaskStatus::Ready;
            }
        }
        candidates
    }

    pub fn mark_running(&mut self, task_id: &str) {
        if let Some(node) = self.nodes.get_mut(task_id) {
            node.status = TaskStatus::Running;
            self.running_count += 1;
        }
    }

    /// Idempotent: marking an already-completed task completed is a no-op
    /// (spec §8 invariant).
    pub fn mark_completed(&mut self, task_id: &str) {
        if let Some(node) = self.nodes.get_mut(task_id) {
            if matches!(node.status, TaskStatus::Completed) {
                return;
            }
            if matches!(node.status, TaskStatus::Running) {
                self.running_count = self.running_count.saturating_sub(1);
            }
            node.status = TaskStatus::Completed;
        }
    }

    /// If `terminal`, transitively marks dependents failed with reason
    /// `upstream_failed` (spec §4.7, §7).
    pub fn mark_failed(&mut self, task_id: &str, terminal: bool) {
        let was_running = matches!(
            self.nodes.get(task_id).map(|n| n.status),
            Some(TaskStatus::Running)
        );
        if let Some(node) = self.nodes.get_mut(task_id) {
            node.status = TaskStatus::Failed;
        }
        if was_running {
            self.running_count = self.running_count.saturating_sub(1);
        }

        if terminal {
            self.fail_dependents(task_id);
        }
    }

    fn fail_dependents(&mut self, task_id: &str) {
        let mut queue: VecDeque<TaskId> = self.graph.dependents_of(task_id).to_vec().into();
        let mut visited: HashSet<TaskId> = HashSet::new();
        while let Some(dep) = queue.pop_front() {
            if !visited.insert(dep.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get_mut(&dep) {
                if matches!(node.status, TaskStatus::Completed | TaskStatus::Failed) {
                    continue;
                }
                node.status = TaskStatus::Failed;
            }
            for next in self.graph.dependents_of(&dep).to_vec() {
                queue.push_back(next);
            }
        }
    }

    /// Stuck: no running, no ready, remaining > 0 (spec §4.7).
    pub fn is_stuck(&self) -> bool {
        if self.remaining() == 0 {
            return false;
        }
        let any_running = self.running_count > 0;
        let any_ready_candidate = self
            .nodes
            .iter()
            .filter(|(_, n)| matches!(n.status, TaskStatus::Pending))
            .any(|(id, _)| self.deps_satisfied(id));
        !any_running && !any_ready_candidate
    }

    pub fn check_deadlock(&self) -> Result<(), SchedulerError> {
        if self.is_stuck() {
            Err(SchedulerError::Deadlock {
                remaining: self.remaining(),
            })
        } else {
            Ok(())
        }
    }

    pub fn all_completed(&self) -> bool {
        self.nodes
            .values()
            .all(|n| matches!(n.status, TaskStatus::Completed))
    }

    pub fn any_failed(&self) -> bool {
        self.nodes
            .values()
            .any(|n| matches!(n.status, TaskStatus::Failed))
    }

    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.nodes.get(task_id).map(|n| n.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Plan, PlanGlobals, Task};
    use std::collections::HashMap as Map;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            task_id: id.to_string(),
            task_kind: "edit".to_string(),
            pattern_id: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            metadata: Map::new(),
            retries: None,
            timeout_secs: None,
            priority: 0,
        }
    }

    fn plan(tasks: Vec<Task>) -> Plan {
        Plan {
            schema_version: 1,
            plan_id: "p1".to_string(),
            globals: PlanGlobals::default(),
            tasks,
        }
    }

    #[test]
    fn build_detects_dangling_dependency() {
        let p = plan(vec![task("T1", &["T2"])]);
        let err = PlanGraph::build(&p).unwrap_err();
        assert!(matches!(err, PlanError::DanglingDependency { .. }));
    }

    #[test]
    fn build_detects_self_dependency() {
        let p = plan(vec![task("T1", &["T1"])]);
        let err = PlanGraph::build(&p).unwrap_err();
        assert!(matches!(err, PlanError::SelfDependency { .. }));
    }

    #[test]
    fn build_detects_duplicate_task() {
        let p = plan(vec![task("T1", &[]), task("T1", &[])]);
        let err = PlanGraph::build(&p).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateTask { .. }));
    }

    #[test]
    fn detect_cycle_reports_exact_path() {
        let p = plan(vec![task("T1", &["T2"]), task("T2", &["T1"])]);
        let graph = PlanGraph::build(&p).unwrap();
        let cycle = graph.detect_cycle().unwrap();
        // The cycle must be renderable as "T1 → T2 → T1" (in some rotation).
        assert_eq!(cycle.len(), 3);
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn detect_cycle_none_for_diamond() {
        let p = plan(vec![
            task("T1", &[]),
            task("T2", &["T1"]),
            task("T3", &["T1"]),
            task("T4", &["T2", "T3"]),
        ]);
        let graph = PlanGraph::build(&p).unwrap();
        assert!(graph.detect_cycle().is_none());
    }

    #[test]
    fn scheduler_diamond_waves() {
        let p = plan(vec![
            task("T1", &[]),
            task("T2", &["T1"]),
            task("T3", &["T1"]),
            task("T4", &["T2", "T3"]),
        ]);
        let graph = PlanGraph::build(&p).unwrap();
        let mut sched = DagScheduler::seed(graph, 4);

        let wave1 = sched.ready();
        assert_eq!(wave1, vec!["T1".to_string()]);
        sched.mark_running("T1");
        sched.mark_completed("T1");

        let mut wave2 = sched.ready();
        wave2.sort();
        assert_eq!(wave2, vec!["T2".to_string(), "T3".to_string()]);
        sched.mark_running("T2");
        sched.mark_running("T3");
        sched.mark_completed("T2");
        sched.mark_completed("T3");

        let wave3 = sched.ready();
        assert_eq!(wave3, vec!["T4".to_string()]);
        sched.mark_running("T4");
        sched.mark_completed("T4");

        assert!(sched.all_completed());
        assert_eq!(sched.remaining(), 0);
    }

    #[test]
    fn scheduler_respects_concurrency_cap() {
        let p = plan(vec![task("A", &[]), task("B", &[]), task("C", &[])]);
        let graph = PlanGraph::build(&p).unwrap();
        let mut sched = DagScheduler::seed(graph, 2);
        let wave = sched.ready();
        assert_eq!(wave.len(), 2);
    }

    #[test]
    fn scheduler_tie_break_by_priority_then_id() {
        let mut t_a = task("A", &[]);
        t_a.priority = 1;
        let t_b = task("B", &[]);
        let p = plan(vec![t_b, t_a]);
        let graph = PlanGraph::build(&p).unwrap();
        let mut sched = DagScheduler::seed(graph, 1);
        let wave = sched.ready();
        assert_eq!(wave, vec!["A".to_string()]);
    }

    #[test]
    fn mark_failed_terminal_propagates_to_dependents() {
        let p = plan(vec![task("T1", &[]), task("T2", &["T1"]), task("T3", &["T2"])]);
        let graph = PlanGraph::build(&p).unwrap();
        let mut sched = DagScheduler::seed(graph, 4);
        sched.ready();
        sched.mark_running("T1");
        sched.mark_failed("T1", true);

        assert_eq!(sched.status_of("T2"), Some(TaskStatus::Failed));
        assert_eq!(sched.status_of("T3"), Some(TaskStatus::Failed));
    }

    #[test]
    fn mark_completed_is_idempotent() {
        let p = plan(vec![task("T1", &[])]);
        let graph = PlanGraph::build(&p).unwrap();
        let mut sched = DagScheduler::seed(graph, 4);
        sched.ready();
        sched.mark_running("T1");
        sched.mark_completed("T1");
        sched.mark_completed("T1");
        assert_eq!(sched.status_of("T1"), Some(TaskStatus::Completed));
    }

    #[test]
    fn is_stuck_when_remaining_but_nothing_runnable() {
        let p = plan(vec![task("T1", &["T2"]), task("T2", &["T1"])]);
        // This would be rejected by detect_cycle in real use; here we
        // exercise is_stuck directly with a graph built bypassing cycle
        // rejection isn't possible since build() checks dangling deps only.
        // Instead simulate stuckness via a failed dependency that never
        // completes: T2 depends on T1, T1 is marked failed non-terminal.
        let graph = PlanGraph::build(&plan(vec![task("T1", &[]), task("T2", &["T1"])])).unwrap();
        let _ = p;
        let mut sched = DagScheduler::seed(graph, 4);
        sched.ready();
        sched.mark_running("T1");
        sched.mark_failed("T1", false);
        assert!(sched.is_stuck());
        assert!(sched.check_deadlock().is_err());
    }

    #[test]
    fn empty_plan_has_zero_remaining() {
        let p = plan(vec![]);
        let graph = PlanGraph::build(&p).unwrap();
        let sched = DagScheduler::seed(graph, 4);
        assert_eq!(sched.remaining(), 0);
        assert!(sched.all_completed());
    }
}
