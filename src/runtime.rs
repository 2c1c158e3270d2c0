//! Binds code to scheduler nodes and drives a party's side of a protocol.
//!
//! A [`Runtime`] owns the [`Scheduler`], the closures bound to its nodes and the party's
//! [`Channel`]. Three shapes of task exist:
//!
//! - *round* tasks receive a [`Comm`] on which they queue messages for the neighbouring parties,
//! - *continuation* tasks only see already-available data,
//! - *barriers* ([`Runtime::add_and`] and [`Runtime::add_closure`]) carry no code at all.
//!
//! Execution is single-threaded and cooperative: [`Runtime::run_next`] runs exactly one task body
//! to completion, then marks the task complete. The sends a round body queued are issued right
//! away. Its receives are only awaited once something may read them: before the next
//! continuation or barrier runs, before the round barrier is crossed and when a driver returns.
//! All round tasks that are ready together therefore send before any of them waits.
//! A body receives a [`Task`] handle instead of the runtime, so it can extend the task graph
//! (including with tasks that depend on itself) but can never run another task while it is
//! executing.
use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::debug;

use crate::{
    channel::{self, Channel},
    scheduler::{self, Scheduler, TaskId, TaskKind},
};

/// The error type task bodies may fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised while building or running the task graph.
#[derive(Debug, Error)]
pub enum Error {
    /// The scheduler rejected an operation.
    #[error(transparent)]
    Scheduler(#[from] scheduler::Error),
    /// A message could not be sent or received.
    #[error(transparent)]
    Channel(#[from] channel::Error),
    /// A scheduled node has no bound closure.
    #[error("task {0} has no bound closure")]
    MissingPayload(TaskId),
    /// A pending receive was read before the round that requested it completed.
    #[error("the requested message has not been received yet")]
    RecvPending,
    /// A pending receive will never complete, or its message was already taken.
    #[error("the requested message is no longer available")]
    RecvCancelled,
    /// A task body failed.
    #[error("task '{name}' failed: {source}")]
    Task {
        /// The name the task was registered with.
        name: String,
        /// The error returned by the task body.
        source: BoxError,
    },
}

type RoundFn = Box<dyn FnOnce(&mut Comm, &mut Task<'_>) -> Result<(), BoxError>>;
type ContinuationFn = Box<dyn FnOnce(&mut Task<'_>) -> Result<(), BoxError>>;

enum Payload {
    Round(RoundFn),
    Continuation(ContinuationFn),
    Barrier,
}

struct Entry {
    name: String,
    payload: Payload,
}

#[derive(Default)]
struct Registry {
    sched: Scheduler,
    entries: HashMap<TaskId, Entry>,
}

impl Registry {
    fn add(
        &mut self,
        kind: TaskKind,
        deps: &[TaskId],
        name: &str,
        payload: Payload,
    ) -> Result<TaskId, Error> {
        let id = self.sched.add_task(kind, deps)?;
        let name = name.to_string();
        debug!(%id, %name, "task scheduled");
        self.entries.insert(id, Entry { name, payload });
        Ok(id)
    }

    fn add_closure(&mut self, dep: TaskId) -> Result<TaskId, Error> {
        let id = self.sched.add_closure(&[dep])?;
        let name = format!("closure of {dep}");
        let payload = Payload::Barrier;
        self.entries.insert(id, Entry { name, payload });
        Ok(id)
    }
}

/// Queued network operations of one round task.
///
/// Sends are issued by the runtime as soon as the round body returns. Receives are awaited later,
/// before the first continuation that could read them, and are delivered through the returned
/// [`PendingRecv`] handles.
#[derive(Debug)]
pub struct Comm {
    party: usize,
    parties: usize,
    sends: Vec<(usize, Vec<u8>)>,
    recvs: Vec<(usize, usize, oneshot::Sender<Vec<u8>>)>,
}

impl Comm {
    fn new(party: usize, parties: usize) -> Self {
        Self {
            party,
            parties,
            sends: vec![],
            recvs: vec![],
        }
    }

    /// The index of the party this runtime runs for.
    pub fn party(&self) -> usize {
        self.party
    }

    /// The index of the next party on the ring.
    pub fn next(&self) -> usize {
        (self.party + 1) % self.parties
    }

    /// The index of the previous party on the ring.
    pub fn prev(&self) -> usize {
        (self.party + self.parties - 1) % self.parties
    }

    /// Queues `msg` for `party`.
    pub fn send_to(&mut self, party: usize, msg: Vec<u8>) {
        self.sends.push((party, msg));
    }

    /// Queues a receive of exactly `len` bytes from `party`.
    pub fn recv_from(&mut self, party: usize, len: usize) -> PendingRecv {
        let (tx, rx) = oneshot::channel();
        self.recvs.push((party, len, tx));
        PendingRecv(rx)
    }

    /// Queues `msg` for the next party.
    pub fn send_next(&mut self, msg: Vec<u8>) {
        self.send_to(self.next(), msg)
    }

    /// Queues a receive of exactly `len` bytes from the previous party.
    pub fn recv_prev(&mut self, len: usize) -> PendingRecv {
        self.recv_from(self.prev(), len)
    }
}

/// A message that will be available to every continuation that runs after the requesting round
/// task.
#[derive(Debug)]
pub struct PendingRecv(oneshot::Receiver<Vec<u8>>);

impl PendingRecv {
    /// Takes the received message.
    pub fn get(&mut self) -> Result<Vec<u8>, Error> {
        match self.0.try_recv() {
            Ok(msg) => Ok(msg),
            Err(TryRecvError::Empty) => Err(Error::RecvPending),
            Err(TryRecvError::Closed) => Err(Error::RecvCancelled),
        }
    }
}

/// The handle a running task body receives.
pub struct Task<'a> {
    id: TaskId,
    reg: &'a mut Registry,
}

impl Task<'_> {
    /// The id of the running task.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// See [`Runtime::add_round`].
    pub fn add_round<F>(&mut self, deps: &[TaskId], name: &str, f: F) -> Result<TaskId, Error>
    where
        F: FnOnce(&mut Comm, &mut Task<'_>) -> Result<(), BoxError> + 'static,
    {
        self.reg
            .add(TaskKind::Round, deps, name, Payload::Round(Box::new(f)))
    }

    /// See [`Runtime::add_continuation`].
    pub fn add_continuation<F>(
        &mut self,
        deps: &[TaskId],
        name: &str,
        f: F,
    ) -> Result<TaskId, Error>
    where
        F: FnOnce(&mut Task<'_>) -> Result<(), BoxError> + 'static,
    {
        let payload = Payload::Continuation(Box::new(f));
        self.reg.add(TaskKind::Continuation, deps, name, payload)
    }

    /// See [`Runtime::add_closure`].
    pub fn add_closure(&mut self, dep: TaskId) -> Result<TaskId, Error> {
        self.reg.add_closure(dep)
    }

    /// See [`Runtime::add_and`].
    pub fn add_and(&mut self, deps: &[TaskId], name: &str) -> Result<TaskId, Error> {
        self.reg
            .add(TaskKind::Continuation, deps, name, Payload::Barrier)
    }

    /// Schedules a round task that runs after the current task.
    pub fn then_round<F>(&mut self, name: &str, f: F) -> Result<TaskId, Error>
    where
        F: FnOnce(&mut Comm, &mut Task<'_>) -> Result<(), BoxError> + 'static,
    {
        let id = self.id;
        self.add_round(&[id], name, f)
    }

    /// Schedules a continuation that runs after the current task.
    pub fn then_continuation<F>(&mut self, name: &str, f: F) -> Result<TaskId, Error>
    where
        F: FnOnce(&mut Task<'_>) -> Result<(), BoxError> + 'static,
    {
        let id = self.id;
        self.add_continuation(&[id], name, f)
    }
}

/// Drives the task graph of one party.
pub struct Runtime<C: Channel> {
    channel: C,
    party: usize,
    parties: usize,
    reg: Registry,
    pending: Vec<QueuedRecv>,
}

struct QueuedRecv {
    party: usize,
    len: usize,
    tx: oneshot::Sender<Vec<u8>>,
    task: String,
}

impl<C: Channel> Runtime<C> {
    /// Creates a runtime for `party` out of `parties` communicating over `channel`.
    pub fn new(channel: C, party: usize, parties: usize) -> Self {
        Self {
            channel,
            party,
            parties,
            reg: Registry::default(),
            pending: vec![],
        }
    }

    /// The index of the party this runtime runs for.
    pub fn party(&self) -> usize {
        self.party
    }

    /// Direct access to the channel, e.g. for a setup phase outside of the task graph.
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    /// Consumes the runtime and returns its channel.
    pub fn into_channel(self) -> C {
        self.channel
    }

    /// Registers a round task. Its body may queue messages on the [`Comm`] it receives.
    pub fn add_round<F>(&mut self, deps: &[TaskId], name: &str, f: F) -> Result<TaskId, Error>
    where
        F: FnOnce(&mut Comm, &mut Task<'_>) -> Result<(), BoxError> + 'static,
    {
        self.reg
            .add(TaskKind::Round, deps, name, Payload::Round(Box::new(f)))
    }

    /// Registers a continuation task, which runs on already-available data only.
    pub fn add_continuation<F>(
        &mut self,
        deps: &[TaskId],
        name: &str,
        f: F,
    ) -> Result<TaskId, Error>
    where
        F: FnOnce(&mut Task<'_>) -> Result<(), BoxError> + 'static,
    {
        let payload = Payload::Continuation(Box::new(f));
        self.reg.add(TaskKind::Continuation, deps, name, payload)
    }

    /// Registers a barrier that completes after `dep` and everything that (transitively) depends
    /// on it, however many rounds that takes.
    pub fn add_closure(&mut self, dep: TaskId) -> Result<TaskId, Error> {
        self.reg.add_closure(dep)
    }

    /// Registers a barrier that completes once all `deps` have completed.
    pub fn add_and(&mut self, deps: &[TaskId], name: &str) -> Result<TaskId, Error> {
        self.reg
            .add(TaskKind::Continuation, deps, name, Payload::Barrier)
    }

    /// Runs the current task, issues the sends it queued and marks it complete.
    ///
    /// Queued receives are awaited before the task runs if it is a continuation or a barrier, or
    /// if it is the first task of a new round.
    pub async fn run_next(&mut self) -> Result<(), Error> {
        if !self.reg.sched.has_ready() {
            self.resolve_recvs().await?;
        }
        let id = self.reg.sched.current_task()?;
        let Entry { name, payload } = self
            .reg
            .entries
            .remove(&id)
            .ok_or(Error::MissingPayload(id))?;
        if !matches!(payload, Payload::Round(_)) {
            self.resolve_recvs().await?;
        }
        debug!(%id, %name, round = self.reg.sched.round(), "running task");
        let mut comm = Comm::new(self.party, self.parties);
        let mut task = Task {
            id,
            reg: &mut self.reg,
        };
        let result = match payload {
            Payload::Round(f) => f(&mut comm, &mut task),
            Payload::Continuation(f) => f(&mut task),
            Payload::Barrier => Ok(()),
        };
        if let Err(source) = result {
            return Err(Error::Task { name, source });
        }
        for (party, msg) in comm.sends {
            channel::send_to(&mut self.channel, party, &name, msg).await?;
        }
        self.pending
            .extend(comm.recvs.into_iter().map(|(party, len, tx)| QueuedRecv {
                party,
                len,
                tx,
                task: name.clone(),
            }));
        self.reg.sched.remove_task(id)?;
        Ok(())
    }

    /// Runs tasks until `id` has completed.
    pub async fn run_until_task_completes(&mut self, id: TaskId) -> Result<(), Error> {
        while self.reg.sched.contains(id) {
            self.run_next().await?;
        }
        self.resolve_recvs().await
    }

    /// Runs the tasks of one round, i.e. until the next round barrier would be crossed.
    pub async fn run_one_round(&mut self) -> Result<(), Error> {
        self.run_next().await?;
        while self.reg.sched.has_ready() {
            self.run_next().await?;
        }
        self.resolve_recvs().await
    }

    /// Runs until the task graph is empty.
    pub async fn run_all(&mut self) -> Result<(), Error> {
        while !self.reg.sched.is_empty() {
            self.run_next().await?;
        }
        self.resolve_recvs().await
    }

    /// Whether all registered tasks have completed.
    pub fn is_done(&self) -> bool {
        self.reg.sched.is_empty()
    }

    /// The number of tasks that have not completed yet.
    pub fn pending_tasks(&self) -> usize {
        self.reg.sched.len()
    }

    /// The number of round barriers crossed so far.
    pub fn round_index(&self) -> usize {
        self.reg.sched.round()
    }

    // Awaits queued receives in the order they were requested.
    async fn resolve_recvs(&mut self) -> Result<(), Error> {
        for QueuedRecv {
            party,
            len,
            tx,
            task,
        } in std::mem::take(&mut self.pending)
        {
            let msg = channel::recv_from(&mut self.channel, party, &task, len).await?;
            // the body may have dropped its handle
            let _ = tx.send(msg);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use futures::future::try_join3;

    use super::*;
    use crate::channel::SimpleChannel;

    fn single() -> Runtime<SimpleChannel> {
        let channel = SimpleChannel::channels(1).remove(0);
        Runtime::new(channel, 0, 1)
    }

    #[tokio::test]
    async fn runs_in_dependency_order() -> Result<(), Error> {
        let mut rt = single();
        let log = Rc::new(RefCell::new(vec![]));
        let l = log.clone();
        let a = rt.add_continuation(&[], "a", move |_| {
            l.borrow_mut().push("a");
            Ok(())
        })?;
        let l = log.clone();
        let b = rt.add_round(&[a], "b", move |_, _| {
            l.borrow_mut().push("b");
            Ok(())
        })?;
        let l = log.clone();
        rt.add_continuation(&[b, a], "c", move |_| {
            l.borrow_mut().push("c");
            Ok(())
        })?;
        rt.run_all().await?;
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
        assert!(rt.is_done());
        Ok(())
    }

    fn countdown(n: usize, counter: Rc<RefCell<usize>>) -> RoundFn {
        Box::new(move |_, task| {
            *counter.borrow_mut() += 1;
            if n > 1 {
                task.then_round("countdown", countdown(n - 1, counter))?;
            }
            Ok(())
        })
    }

    #[tokio::test]
    async fn closure_waits_for_self_extending_protocol() -> Result<(), Error> {
        let mut rt = single();
        let counter = Rc::new(RefCell::new(0));
        let first = rt.add_round(&[], "countdown", countdown(5, counter.clone()))?;
        let done = rt.add_closure(first)?;
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        let c = counter.clone();
        rt.add_continuation(&[done], "after", move |_| {
            *s.borrow_mut() = Some(*c.borrow());
            Ok(())
        })?;
        rt.run_until_task_completes(done).await?;
        assert_eq!(*counter.borrow(), 5);
        assert_eq!(rt.round_index(), 4);
        rt.run_all().await?;
        assert_eq!(*seen.borrow(), Some(5));
        Ok(())
    }

    #[tokio::test]
    async fn and_joins_independent_branches() -> Result<(), Error> {
        let mut rt = single();
        let log = Rc::new(RefCell::new(vec![]));
        let mut branches = vec![];
        for i in 0..3 {
            let l = log.clone();
            branches.push(rt.add_round(&[], "branch", move |_, _| {
                l.borrow_mut().push(i);
                Ok(())
            })?);
        }
        let join = rt.add_and(&branches, "join")?;
        let l = log.clone();
        rt.add_continuation(&[join], "after", move |_| {
            assert_eq!(l.borrow().len(), 3);
            l.borrow_mut().push(99);
            Ok(())
        })?;
        rt.run_one_round().await?;
        assert_eq!(*log.borrow(), vec![0, 1, 2, 99]);
        assert!(rt.is_done());
        Ok(())
    }

    #[tokio::test]
    async fn failing_task_reports_its_name() {
        let mut rt = single();
        rt.add_continuation(&[], "broken", |_| Err("boom".into()))
            .unwrap();
        match rt.run_all().await {
            Err(Error::Task { name, source }) => {
                assert_eq!(name, "broken");
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_runtime_has_no_tasks() {
        let mut rt = single();
        assert!(matches!(
            rt.run_next().await,
            Err(Error::Scheduler(scheduler::Error::NoTasks))
        ));
    }

    #[tokio::test]
    async fn pending_recv_is_unavailable_inside_the_round() {
        let mut rt = single();
        rt.add_round(&[], "peek", |comm, _| {
            // the receive is only performed after the body returns
            let mut pending = comm.recv_from(0, 0);
            assert!(matches!(pending.get(), Err(Error::RecvPending)));
            Ok(())
        })
        .unwrap();
        // there is no channel to party 0 itself, so the queued receive fails
        assert!(matches!(rt.run_all().await, Err(Error::Channel(_))));
    }

    fn ring_party(rt: &mut Runtime<SimpleChannel>, out: Rc<RefCell<Vec<u8>>>) -> Result<(), Error> {
        rt.add_round(&[], "ring", move |comm, task| {
            comm.send_next(vec![comm.party() as u8; 4]);
            let mut pending = comm.recv_prev(4);
            task.then_continuation("ring result", move |_| {
                *out.borrow_mut() = pending.get()?;
                Ok(())
            })?;
            Ok(())
        })?;
        Ok(())
    }

    #[tokio::test]
    async fn round_messages_travel_around_the_ring() -> Result<(), Error> {
        let mut runtimes: Vec<_> = SimpleChannel::channels(3)
            .into_iter()
            .enumerate()
            .map(|(i, c)| Runtime::new(c, i, 3))
            .collect();
        let outs: Vec<_> = (0..3).map(|_| Rc::new(RefCell::new(vec![]))).collect();
        for (rt, out) in runtimes.iter_mut().zip(&outs) {
            ring_party(rt, out.clone())?;
        }
        let mut it = runtimes.iter_mut();
        let (a, b, c) = (it.next().unwrap(), it.next().unwrap(), it.next().unwrap());
        try_join3(a.run_all(), b.run_all(), c.run_all()).await?;
        assert_eq!(*outs[0].borrow(), vec![2; 4]);
        assert_eq!(*outs[1].borrow(), vec![0; 4]);
        assert_eq!(*outs[2].borrow(), vec![1; 4]);
        Ok(())
    }
}
