//! Dependency-driven scheduler for round-based protocols.
//!
//! The [`Scheduler`] keeps a DAG of opaque task nodes in a single table keyed by [`TaskId`]. All
//! edges are stored as ids, never as references. A node is ready once its upstream set is empty;
//! ready nodes are handed out through two queues:
//!
//! - the *ready* queue holds everything that may run in the current round,
//! - the *next-round* queue holds [`TaskKind::Round`] tasks that became ready while a round was
//!   already in progress. They are promoted once the ready queue runs dry (the round barrier).
//!
//! Closures ([`Scheduler::add_closure`]) are nodes that wait not only for their dependencies but
//! for every task that transitively depends on them, including tasks that are only registered
//! while the dependencies are running. This is what allows "continue after the whole sub-protocol"
//! to be expressed without knowing how many rounds the sub-protocol takes.
//!
//! The scheduler knows nothing about what a task does; the [`crate::runtime`] binds code to ids.
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    fmt,
};

use thiserror::Error;
use tracing::{debug, trace};

/// Identifies a node of the task graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How a ready task is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// One network round-trip worth of work. Becoming ready mid-round defers it to the next round.
    Round,
    /// Local work on data that is already available. Runs in the current round.
    Continuation,
}

/// Violations of the scheduling invariants.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The id was never handed out by this scheduler.
    #[error("task {0} does not exist")]
    UnknownTask(TaskId),
    /// Neither the ready nor the next-round queue contains a task.
    #[error("no task is ready and none is scheduled for the next round")]
    NoTasks,
    /// The task still has unfinished dependencies.
    #[error("task {0} still has unfinished dependencies")]
    NotReady(TaskId),
    /// An edge points to a node that is no longer in the table.
    #[error("task graph is inconsistent, node {0} is missing")]
    MissingNode(TaskId),
}

#[derive(Debug)]
struct Node {
    kind: TaskKind,
    upstream: BTreeSet<TaskId>,
    downstream: Vec<TaskId>,
    closures: Vec<TaskId>,
}

impl Node {
    fn new(kind: TaskKind) -> Self {
        Self {
            kind,
            upstream: BTreeSet::new(),
            downstream: vec![],
            closures: vec![],
        }
    }
}

/// The task table together with its ready and next-round queues.
#[derive(Debug, Default)]
pub struct Scheduler {
    nodes: HashMap<TaskId, Node>,
    ready: VecDeque<TaskId>,
    next_round: VecDeque<TaskId>,
    next_id: u64,
    round: usize,
    round_active: bool,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task that becomes ready once all `deps` have been removed.
    ///
    /// Dependencies that already completed are treated as satisfied.
    pub fn add_task(&mut self, kind: TaskKind, deps: &[TaskId]) -> Result<TaskId, Error> {
        self.check_ids(deps)?;
        let id = self.fresh_id();
        let mut node = Node::new(kind);
        for dep in deps {
            if let Some(upstream) = self.nodes.get_mut(dep) {
                if node.upstream.insert(*dep) {
                    upstream.downstream.push(id);
                }
            }
        }
        let ready = node.upstream.is_empty();
        self.nodes.insert(id, node);
        trace!(%id, ?kind, ?deps, "task added");
        if ready {
            self.enqueue(id, kind);
        }
        Ok(id)
    }

    /// Registers a closure over `deps`.
    ///
    /// The closure becomes ready only after every dependency *and* every task downstream of a
    /// dependency (transitively, including tasks added later) has been removed.
    pub fn add_closure(&mut self, deps: &[TaskId]) -> Result<TaskId, Error> {
        self.check_ids(deps)?;
        let id = self.fresh_id();
        let mut node = Node::new(TaskKind::Continuation);
        for dep in deps {
            if let Some(upstream) = self.nodes.get_mut(dep) {
                if node.upstream.insert(*dep) {
                    upstream.closures.push(id);
                }
            }
        }
        let ready = node.upstream.is_empty();
        self.nodes.insert(id, node);
        trace!(%id, ?deps, "closure added");
        if ready {
            self.enqueue(id, TaskKind::Continuation);
        }
        Ok(id)
    }

    /// Returns the task that should run next.
    ///
    /// If the ready queue is empty, the next-round queue is promoted first (round barrier).
    pub fn current_task(&mut self) -> Result<TaskId, Error> {
        if self.ready.is_empty() {
            if self.next_round.is_empty() {
                return Err(Error::NoTasks);
            }
            std::mem::swap(&mut self.ready, &mut self.next_round);
            self.round += 1;
            self.round_active = false;
            debug!(round = self.round, tasks = self.ready.len(), "round barrier");
        }
        self.ready.front().copied().ok_or(Error::NoTasks)
    }

    /// Removes the current task (see [`Scheduler::current_task`]) and returns its id.
    pub fn pop_task(&mut self) -> Result<TaskId, Error> {
        let id = self.current_task()?;
        self.ready.pop_front();
        self.complete(id)?;
        Ok(id)
    }

    /// Removes a ready task, wherever it is queued.
    pub fn remove_task(&mut self, id: TaskId) -> Result<(), Error> {
        let Some(node) = self.nodes.get(&id) else {
            return Err(Error::UnknownTask(id));
        };
        if !node.upstream.is_empty() {
            return Err(Error::NotReady(id));
        }
        if let Some(pos) = self.ready.iter().position(|t| *t == id) {
            self.ready.remove(pos);
        } else if let Some(pos) = self.next_round.iter().position(|t| *t == id) {
            self.next_round.remove(pos);
        }
        self.complete(id)
    }

    /// Whether `id` is still in the task table (i.e. has not been removed yet).
    pub fn contains(&self, id: TaskId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Whether a task can run without crossing a round barrier.
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Number of tasks that have not completed yet.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the task table is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of round barriers crossed so far.
    pub fn round(&self) -> usize {
        self.round
    }

    fn fresh_id(&mut self) -> TaskId {
        let id = TaskId(self.next_id);
        self.next_id += 1;
        id
    }

    fn check_ids(&self, deps: &[TaskId]) -> Result<(), Error> {
        match deps.iter().find(|d| d.0 >= self.next_id) {
            Some(d) => Err(Error::UnknownTask(*d)),
            None => Ok(()),
        }
    }

    fn enqueue(&mut self, id: TaskId, kind: TaskKind) {
        match kind {
            TaskKind::Round if self.round_active => self.next_round.push_back(id),
            _ => self.ready.push_back(id),
        }
    }

    fn complete(&mut self, id: TaskId) -> Result<(), Error> {
        let node = self.nodes.remove(&id).ok_or(Error::MissingNode(id))?;
        if node.kind == TaskKind::Round {
            self.round_active = true;
        }
        for &down in &node.downstream {
            for &closure in &node.closures {
                self.thread_closure(closure, down)?;
            }
            let n = self.nodes.get_mut(&down).ok_or(Error::MissingNode(down))?;
            n.upstream.remove(&id);
            if n.upstream.is_empty() {
                let kind = n.kind;
                self.enqueue(down, kind);
            }
        }
        for &closure in &node.closures {
            let n = self
                .nodes
                .get_mut(&closure)
                .ok_or(Error::MissingNode(closure))?;
            n.upstream.remove(&id);
            if n.upstream.is_empty() {
                self.enqueue(closure, TaskKind::Continuation);
            }
        }
        trace!(%id, remaining = self.nodes.len(), "task completed");
        Ok(())
    }

    /// Makes `closure` additionally wait for `down` and everything downstream of it.
    fn thread_closure(&mut self, closure: TaskId, down: TaskId) -> Result<(), Error> {
        let n = self.nodes.get_mut(&down).ok_or(Error::MissingNode(down))?;
        if n.upstream.contains(&closure) {
            // `down` waits for the closure itself, waiting on it would deadlock
            return Ok(());
        }
        if !n.closures.contains(&closure) {
            n.closures.push(closure);
        }
        let c = self
            .nodes
            .get_mut(&closure)
            .ok_or(Error::MissingNode(closure))?;
        c.upstream.insert(down);
        Ok(())
    }
}
