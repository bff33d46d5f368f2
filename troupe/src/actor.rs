//! Actors, their handles, and the per-actor dispatch loop.
//!
//! An actor is a value implementing [`Actor`], animated by a tokio task that owns it
//! exclusively. Everything else in the process holds only an [`ActorService`]: a handle onto the
//! actor's [`Mailbox`]. All effects on an actor arrive as envelopes in that mailbox and are
//! processed one at a time, in batches, by [`ActorCell::run`].
//!
//! # Lifecycle
//!
//! Actors move monotonically through [`LifecycleState`]:
//!
//!  - `Running` until [`Activation::quit`] is called, a peer asks it to quit, a handler faults,
//!    or it runs out of things to do (no handlers, promises, requests, monitors, streams or
//!    linked tasks).
//!  - `Quitting` while its exit hook runs and outstanding work (replies to its own requests,
//!    streams that outlive the actor) drains.
//!  - `Closed` once nothing remains. Monitors are told, linked and dependent peers are asked
//!    to quit, and the actor waits until the peers it must outlive have closed. Meanwhile it
//!    answers everything else as if it were already dead.
//!  - `Dead`: the mailbox is closed, and every later envelope is answered by
//!    [`bounce`] on the sender's side.
//!
//! # Links
//!
//! [`Activation::link`] ties two actors symmetrically: whichever closes first asks the other to
//! quit and waits for it. [`Activation::depend_on`] is directional: the dependent quits when
//! the actor it depends on closes, and that actor waits for the dependent; the dependent closing
//! first does not disturb the other side. [`Activation::monitor`] is a one-way notification.

use super::behaviour::Behaviour;
use super::behaviour::Incoming;
use super::command::CommandId;
use super::command::Current;
use super::command::Inflight;
use super::command::PromiseEntry;
use super::command::PromiseId;
use super::error::ActorResult;
use super::error::Error;
use super::mailbox::Mailbox;
use super::stream::OutputId;
use super::stream::StreamMessage;
use super::stream::Streams;
use super::system::System;

use parking_lot::RwLock;

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::select;
use tokio_util::sync::CancellationToken;

use tracing::Instrument;

/// The type of process-unique actor IDs. Zero is reserved for [`ActorService::null`].
pub type ActorId = u64;

/// The type of process-unique linked task IDs.
pub type TaskId = u64;

/// Deferred work run inside an actor's own context.
pub(crate) type LocalAction<A> =
    Box<dyn FnOnce(&mut A, &mut Activation<A>) -> ActorResult + Send>;

type MonitorFn<A> =
    Box<dyn FnOnce(&mut A, &mut Activation<A>, Option<Error>) -> ActorResult + Send>;

//---------------------------------------------------------------------------

const BUMP_AMOUNT: u8 = 10;

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);
#[doc(hidden)]
pub fn next_actor_id() -> ActorId {
    NEXT_ACTOR_ID.fetch_add(BUMP_AMOUNT.into(), Ordering::Relaxed)
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(5);

//---------------------------------------------------------------------------

/// Where an actor is in its life. Never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    Running,
    Quitting,
    Closed,
    Dead,
}

/// The kind of relationship an actor keeps with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
    /// Symmetric: either side closing asks the other to quit.
    Link,
    /// Held by the dependent: it quits when the peer closes.
    Depend,
    /// Held by the actor being depended upon: the peer must die first.
    Kill,
    /// Held by the monitored actor: the peer is notified when it closes.
    Monitor,
}

impl Relation {
    fn mirror(self) -> Relation {
        match self {
            Relation::Depend => Relation::Kill,
            Relation::Kill => Relation::Depend,
            r => r,
        }
    }
}

/// Delivered as an ordinary message to every subscriber of an actor's state-change feed.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub actor: ActorService,
    pub state: LifecycleState,
    /// The terminal error, once one has been recorded.
    pub error: Option<Error>,
}

pub(crate) enum Envelope {
    Message {
        payload: Box<dyn Any + Send>,
        type_id: TypeId,
        type_name: &'static str,
    },
    Command(Incoming),
    Reply {
        id: CommandId,
        from: ActorService,
        result: Result<Box<dyn Any + Send>, Error>,
    },
    PreReply {
        id: CommandId,
        processor: ActorService,
    },
    Cancel {
        promise: PromiseId,
    },
    Link {
        peer: ActorService,
        relation: Relation,
    },
    Unlink {
        peer: ActorService,
        relation: Relation,
    },
    Quit {
        from: Option<ActorService>,
        error: Option<Error>,
        /// The sender wants a `Closed` notice back once the recipient has closed.
        watch: bool,
    },
    Closed {
        peer: ActorService,
        error: Option<Error>,
    },
    Subscribe {
        subscriber: ActorService,
    },
    Stream(StreamMessage),
    Local(Box<dyn Any + Send>),
    Batch(Vec<Envelope>),
}

impl Envelope {
    pub(crate) fn message<M: Any + Send>(message: M) -> Self {
        Envelope::Message {
            payload: Box::new(message),
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
        }
    }

    fn local<A: 'static>(action: LocalAction<A>) -> Self {
        Envelope::Local(Box::new(action))
    }
}

//---------------------------------------------------------------------------

/// A shareable handle onto an actor's mailbox.
///
/// Handles compare, hash and order by actor ID. A handle outlives its actor: once the actor
/// is dead, anything sent through the handle is answered with [`Error::ActorDead`] (commands)
/// or a synthesized notice (monitors, links, streams), and plain messages are dropped.
#[derive(Clone)]
pub struct ActorService {
    inner: Option<Arc<ServiceInner>>,
}

struct ServiceInner {
    actor_id: ActorId,
    name: String,
    mailbox: Mailbox<Envelope>,
    exit_status: RwLock<Option<ActorResult>>,
}

impl ActorService {
    pub(crate) fn new(name: &str) -> Self {
        ActorService {
            inner: Some(Arc::new(ServiceInner {
                actor_id: next_actor_id(),
                name: name.to_owned(),
                mailbox: Mailbox::new(),
                exit_status: RwLock::new(None),
            })),
        }
    }

    /// A handle bound to no actor. Every command sent to it fails with [`Error::ActorNull`].
    pub fn null() -> Self {
        ActorService { inner: None }
    }

    pub fn id(&self) -> ActorId {
        self.inner.as_ref().map_or(0, |i| i.actor_id)
    }

    pub fn name(&self) -> &str {
        self.inner.as_ref().map_or("null", |i| &i.name)
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Sends a fire-and-forget message from outside any actor.
    pub fn send_message<M: Any + Send>(&self, message: M) {
        self.deliver(Envelope::message(message))
    }

    /// Asks the actor to quit, recording `error` as its terminal error.
    pub fn send_quit(&self, error: Option<Error>) {
        self.deliver(Envelope::Quit { from: None, error, watch: false })
    }

    /// `None` while the actor is alive; its exit status once it is dead.
    pub fn exit_status(&self) -> Option<ActorResult> {
        match &self.inner {
            None => Some(Err(Error::ActorNull)),
            Some(i) => i.exit_status.read().clone(),
        }
    }

    /// The error the actor terminated with, if it has terminated with one.
    pub fn close_error(&self) -> Option<Error> {
        match self.exit_status() {
            Some(Err(e)) => Some(e),
            _ => None,
        }
    }

    pub fn is_dead(&self) -> bool {
        self.exit_status().is_some()
    }

    pub(crate) fn deliver(&self, envelope: Envelope) {
        match &self.inner {
            None => bounce(self, Error::ActorNull, Some(Error::ActorNull), envelope),
            Some(inner) => if let Err(envelope) = inner.mailbox.push(envelope) {
                let exit = match &*inner.exit_status.read() {
                    Some(Err(e)) => Some(e.clone()),
                    _ => None,
                };
                bounce(self, Error::ActorDead, exit, envelope)
            }
        }
    }

    fn mailbox(&self) -> Option<&Mailbox<Envelope>> {
        self.inner.as_ref().map(|i| &i.mailbox)
    }

    /// Records the exit status and closes the mailbox, returning whatever was still queued.
    fn mark_dead(&self, exit: &Option<Error>) -> Vec<Envelope> {
        match &self.inner {
            None => Vec::new(),
            Some(inner) => {
                *inner.exit_status.write() = Some(match exit {
                    None => Ok(()),
                    Some(e) => Err(e.clone()),
                });
                inner.mailbox.take_head_and_close().unwrap_or_default()
            }
        }
    }
}

impl std::fmt::Debug for ActorService {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "#<ActorService {} {:?}>", self.id(), self.name())
    }
}

impl std::hash::Hash for ActorService {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id().hash(state)
    }
}

impl Eq for ActorService {}
impl PartialEq for ActorService {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Ord for ActorService {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id().cmp(&other.id())
    }
}

impl PartialOrd for ActorService {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Answers an envelope that `target` can no longer process, on `target`'s behalf.
///
/// `error` is the reply for commands and streams; `exit` is the terminal error reported to
/// links and monitors.
pub(crate) fn bounce(target: &ActorService, error: Error, exit: Option<Error>, envelope: Envelope) {
    match envelope {
        Envelope::Batch(items) =>
            for e in items {
                bounce(target, error.clone(), exit.clone(), e)
            },
        Envelope::Command(incoming) => {
            tracing::trace!(?target, command = incoming.type_name(), "bouncing command");
            incoming.promise.origin.deliver(Envelope::Reply {
                id: incoming.promise.id,
                from: target.clone(),
                result: Err(error),
            })
        }
        Envelope::Link { peer, relation: Relation::Monitor } =>
            peer.deliver(Envelope::Closed { peer: target.clone(), error: exit }),
        Envelope::Link { peer, .. } =>
            peer.deliver(Envelope::Quit { from: Some(target.clone()), error: exit, watch: false }),
        Envelope::Quit { from: Some(from), watch: true, .. } =>
            from.deliver(Envelope::Closed { peer: target.clone(), error: exit }),
        Envelope::Subscribe { subscriber } =>
            subscriber.deliver(Envelope::message(StateChange {
                actor: target.clone(),
                state: LifecycleState::Dead,
                error: exit,
            })),
        Envelope::Stream(StreamMessage::Request { stream, consumer, .. }) =>
            consumer.deliver(Envelope::Stream(StreamMessage::UpstreamStopped {
                stream,
                error: Some(error),
            })),
        Envelope::Stream(StreamMessage::Reply { stream, producer, .. }) =>
            producer.deliver(Envelope::Stream(StreamMessage::DownstreamStopped {
                stream,
                consumer: target.clone(),
                error: Some(error),
            })),
        _ => tracing::trace!(?target, "dropping undeliverable envelope"),
    }
}

//---------------------------------------------------------------------------

/// The contract every actor type fulfils.
///
/// Only [`behaviour`][Actor::behaviour] is required. It is called once when the actor starts;
/// use [`Activation::become_behaviour`] to switch tables later.
#[allow(unused_variables)]
pub trait Actor: Send + Sized + 'static {
    /// Builds the table of commands, messages and filters this actor answers.
    fn behaviour(&self) -> Behaviour<Self>;

    /// Runs inside the new actor before it processes any envelope.
    fn started(&mut self, t: &mut Activation<Self>) -> ActorResult {
        Ok(())
    }

    /// Runs once, when the actor starts quitting.
    fn exit_hook(&mut self, t: &mut Activation<Self>) -> ActorResult {
        Ok(())
    }

    /// Decides what a handler error or panic means. The default quits with the error.
    fn on_fault(&mut self, t: &mut Activation<Self>, error: Error) {
        t.quit(Some(error))
    }
}

//---------------------------------------------------------------------------

/// Envelopes produced while handling envelopes, delivered batched per destination.
pub(crate) struct Outbox {
    pending: Vec<Pending>,
}

struct Pending {
    to: ActorService,
    envelope: Envelope,
    /// Kept when a panicking step is rolled back: the bookkeeping it reports has already
    /// changed.
    committed: bool,
}

impl Outbox {
    fn new() -> Self {
        Outbox { pending: Vec::new() }
    }

    /// Queues `envelope`. Plain messages, commands, delegation notices and quit requests are
    /// the effects of a handler, and are dropped if that handler panics; everything else is
    /// runtime bookkeeping and always goes out.
    pub(crate) fn push(&mut self, to: &ActorService, envelope: Envelope) {
        let committed = !matches!(envelope,
                                  Envelope::Message { .. } |
                                  Envelope::Command(_) |
                                  Envelope::PreReply { .. } |
                                  Envelope::Quit { .. });
        self.pending.push(Pending { to: to.clone(), envelope, committed })
    }

    pub(crate) fn push_committed(&mut self, to: &ActorService, envelope: Envelope) {
        self.pending.push(Pending { to: to.clone(), envelope, committed: true })
    }

    fn mark(&self) -> usize {
        self.pending.len()
    }

    /// Drops the uncommitted envelopes queued since `mark`, returning them with their
    /// destinations.
    fn discard_since(&mut self, mark: usize) -> Vec<(ActorService, Envelope)> {
        let tail = self.pending.split_off(std::cmp::min(mark, self.pending.len()));
        let mut discarded = Vec::new();
        for p in tail.into_iter() {
            if p.committed {
                self.pending.push(p);
            } else {
                discarded.push((p.to, p.envelope));
            }
        }
        discarded
    }

    /// Sends everything queued. Destinations are served in the order they were first
    /// addressed, each receiving its envelopes in push order.
    fn deliver(&mut self) {
        let mut order: Vec<ActorService> = Vec::new();
        let mut queues: HashMap<ActorId, Vec<Envelope>> = HashMap::new();
        for Pending { to, envelope, .. } in std::mem::take(&mut self.pending).into_iter() {
            let queue = queues.entry(to.id()).or_default();
            if queue.is_empty() {
                order.push(to);
            }
            queue.push(envelope);
        }
        for to in order.into_iter() {
            let mut envelopes = match queues.remove(&to.id()) {
                Some(es) => es,
                None => continue,
            };
            let envelope = if envelopes.len() == 1 {
                match envelopes.pop() {
                    Some(e) => e,
                    None => continue,
                }
            } else {
                Envelope::Batch(envelopes)
            };
            to.deliver(envelope);
        }
    }
}

/// Everything an actor owns apart from its user-level state.
pub(crate) struct Core<A> {
    pub(crate) me: ActorService,
    pub(crate) system: System,
    pub(crate) state: LifecycleState,
    pub(crate) exit: Option<Error>,
    pub(crate) behaviour: Option<Behaviour<A>>,
    pub(crate) outbox: Outbox,
    pub(crate) current: Option<Current>,
    next_command_id: CommandId,
    pub(crate) inflight: HashMap<CommandId, Inflight<A>>,
    pub(crate) promises: HashMap<PromiseId, PromiseEntry<A>>,
    pub(crate) reissued: Vec<Incoming>,
    pub(crate) deferred: VecDeque<LocalAction<A>>,
    pub(crate) links: HashMap<ActorService, Relation>,
    pub(crate) watchers: HashSet<ActorService>,
    awaiting: HashMap<ActorService, Vec<MonitorFn<A>>>,
    waiting_for: HashSet<ActorService>,
    subscribers: HashSet<ActorService>,
    linked_tasks: HashMap<TaskId, CancellationToken>,
    pub(crate) streams: Streams<A>,
    exit_hook_ran: bool,
}

impl<A: Actor> Core<A> {
    fn new(me: ActorService, system: System) -> Self {
        Core {
            me,
            system,
            state: LifecycleState::Running,
            exit: None,
            behaviour: None,
            outbox: Outbox::new(),
            current: None,
            next_command_id: 1,
            inflight: HashMap::new(),
            promises: HashMap::new(),
            reissued: Vec::new(),
            deferred: VecDeque::new(),
            links: HashMap::new(),
            watchers: HashSet::new(),
            awaiting: HashMap::new(),
            waiting_for: HashSet::new(),
            subscribers: HashSet::new(),
            linked_tasks: HashMap::new(),
            streams: Streams::new(),
            exit_hook_ran: false,
        }
    }

    pub(crate) fn next_command_id(&mut self) -> CommandId {
        let id = self.next_command_id;
        self.next_command_id += 1;
        id
    }

    pub(crate) fn defer(&mut self, action: LocalAction<A>) {
        self.deferred.push_back(action)
    }

    pub(crate) fn reply(&mut self, promise: &PromiseId, result: Result<Box<dyn Any + Send>, Error>) {
        let envelope = Envelope::Reply { id: promise.id, from: self.me.clone(), result };
        self.outbox.push(&promise.origin, envelope)
    }

    fn can_quit(&self) -> bool {
        self.behaviour.as_ref().map_or(true, |b| !b.has_handlers())
            && self.promises.is_empty()
            && self.inflight.is_empty()
            && self.awaiting.is_empty()
            && self.streams.is_empty()
            && self.linked_tasks.is_empty()
    }

    fn set_state(&mut self, state: LifecycleState) {
        tracing::debug!(from = ?self.state, to = ?state, "state change");
        self.state = state;
        let subscribers: Vec<ActorService> = self.subscribers.iter().cloned().collect();
        for s in subscribers {
            let change = StateChange { actor: self.me.clone(), state, error: self.exit.clone() };
            self.outbox.push_committed(&s, Envelope::message(change));
        }
    }

    /// Starts quitting. A no-op unless the actor is still running.
    pub(crate) fn quit(&mut self, error: Option<Error>) {
        if self.state != LifecycleState::Running {
            return;
        }
        match &error {
            None => tracing::debug!("quitting"),
            Some(e) => tracing::debug!(%e, "quitting with error"),
        }
        self.exit = error.clone();
        self.behaviour = None;
        self.set_state(LifecycleState::Quitting);

        for (promise, entry) in std::mem::take(&mut self.promises).into_iter() {
            match entry {
                PromiseEntry::Promised { on_cancel } => if let Some(f) = on_cancel {
                    self.defer(f)
                },
                PromiseEntry::Paused { live } => live.store(false, Ordering::Relaxed),
                PromiseEntry::Proxy { .. } => (),
            }
            self.reply(&promise, Err(Error::ActorDead));
        }
        for incoming in std::mem::take(&mut self.reissued).into_iter() {
            self.reply(&incoming.promise, Err(Error::ActorDead));
        }
        for peer in std::mem::take(&mut self.awaiting).into_keys() {
            let envelope = Envelope::Unlink { peer: self.me.clone(), relation: Relation::Monitor };
            self.outbox.push(&peer, envelope);
        }
        for (task_id, token) in self.linked_tasks.drain() {
            tracing::trace!(task_id, "cancelling linked task");
            token.cancel();
        }
        self.close_streams_for_quit(error);
    }

    fn add_relation(&mut self, peer: ActorService, relation: Relation) {
        tracing::trace!(?peer, ?relation, "relation added");
        match relation {
            Relation::Monitor => { self.watchers.insert(peer); }
            r => { self.links.insert(peer, r); }
        }
    }

    fn remove_relation(&mut self, peer: &ActorService, relation: Relation) {
        match relation {
            Relation::Monitor => { self.watchers.remove(peer); }
            r => if self.links.get(peer) == Some(&r) {
                self.links.remove(peer);
            }
        }
    }

    /// Tells watchers, asks linked and dependent peers to quit, and starts waiting for the
    /// peers this actor must outlive.
    fn enter_closed(&mut self) {
        self.set_state(LifecycleState::Closed);
        for w in std::mem::take(&mut self.watchers).into_iter() {
            let envelope = Envelope::Closed { peer: self.me.clone(), error: self.exit.clone() };
            self.outbox.push(&w, envelope);
        }
        for (peer, relation) in std::mem::take(&mut self.links).into_iter() {
            let watch = relation != Relation::Depend;
            let envelope = Envelope::Quit { from: Some(self.me.clone()), error: self.exit.clone(), watch };
            self.outbox.push(&peer, envelope);
            if watch {
                self.waiting_for.insert(peer);
            }
        }
        if !self.waiting_for.is_empty() {
            tracing::debug!(count = self.waiting_for.len(), "waiting for dependents");
        }
    }
}

//---------------------------------------------------------------------------

/// The context handed to every handler: the actor's own bookkeeping, minus its user state.
///
/// Everything sent through an `Activation` is buffered and delivered when the current
/// envelope has been handled. A panic discards the buffer.
pub struct Activation<'activation, A> {
    pub(crate) core: &'activation mut Core<A>,
}

impl<'activation, A: Actor> Activation<'activation, A> {
    /// This actor's own handle.
    pub fn service(&self) -> &ActorService {
        &self.core.me
    }

    pub fn id(&self) -> ActorId {
        self.core.me.id()
    }

    pub fn system(&self) -> &System {
        &self.core.system
    }

    pub fn state(&self) -> LifecycleState {
        self.core.state
    }

    pub fn send_message<M: Any + Send>(&mut self, to: &ActorService, message: M) {
        self.core.outbox.push(to, Envelope::message(message))
    }

    pub fn send_quit(&mut self, to: &ActorService, error: Option<Error>) {
        self.core.outbox.push(to, Envelope::Quit { from: None, error, watch: false })
    }

    /// Starts quitting with `error` as the terminal error. Ignored unless running.
    pub fn quit(&mut self, error: Option<Error>) {
        self.core.quit(error)
    }

    /// Replaces the behaviour table. Ignored unless running.
    pub fn become_behaviour(&mut self, behaviour: Behaviour<A>) {
        if self.core.state == LifecycleState::Running {
            self.core.behaviour = Some(behaviour);
        }
    }

    /// Drops the behaviour table. The actor quits as soon as nothing else is outstanding.
    pub fn clear_behaviour(&mut self) {
        self.core.behaviour = None;
    }

    /// Ties this actor and `peer` together: whichever closes first takes the other down.
    pub fn link(&mut self, peer: &ActorService) {
        self.core.links.insert(peer.clone(), Relation::Link);
        let envelope = Envelope::Link { peer: self.core.me.clone(), relation: Relation::Link };
        self.core.outbox.push(peer, envelope)
    }

    /// Makes this actor quit when `peer` closes; `peer` then waits for this actor to close.
    pub fn depend_on(&mut self, peer: &ActorService) {
        self.core.links.insert(peer.clone(), Relation::Depend);
        let envelope = Envelope::Link { peer: self.core.me.clone(), relation: Relation::Kill };
        self.core.outbox.push(peer, envelope)
    }

    pub fn unlink(&mut self, peer: &ActorService) {
        if let Some(relation) = self.core.links.remove(peer) {
            let envelope = Envelope::Unlink { peer: self.core.me.clone(), relation: relation.mirror() };
            self.core.outbox.push(peer, envelope)
        }
    }

    /// Runs `on_close` with `peer`'s terminal error once `peer` has closed, or promptly if it
    /// is already dead. The actor counts as busy until then.
    pub fn monitor<F>(&mut self, peer: &ActorService, on_close: F)
    where
        F: FnOnce(&mut A, &mut Activation<A>, Option<Error>) -> ActorResult + Send + 'static,
    {
        let callbacks = self.core.awaiting.entry(peer.clone()).or_default();
        callbacks.push(Box::new(on_close));
        if callbacks.len() == 1 {
            let envelope = Envelope::Link { peer: self.core.me.clone(), relation: Relation::Monitor };
            self.core.outbox.push(peer, envelope)
        }
    }

    pub fn demonitor(&mut self, peer: &ActorService) {
        if self.core.awaiting.remove(peer).is_some() {
            let envelope = Envelope::Unlink { peer: self.core.me.clone(), relation: Relation::Monitor };
            self.core.outbox.push(peer, envelope)
        }
    }

    /// Subscribes this actor to `target`'s [`StateChange`] feed. The current state is reported
    /// straight away; a dead target reports `Dead` once.
    pub fn subscribe_state(&mut self, target: &ActorService) {
        let envelope = Envelope::Subscribe { subscriber: self.core.me.clone() };
        self.core.outbox.push(target, envelope)
    }

    /// Starts a new actor in this actor's [`System`].
    pub fn spawn<B: Actor>(&mut self, name: &str, actor: B) -> ActorService {
        self.core.system.spawn_named(name, actor)
    }

    /// Starts a new actor and [links][Self::link] it to this one.
    pub fn spawn_link<B: Actor>(&mut self, name: &str, actor: B) -> ActorService {
        let child = self.spawn(name, actor);
        self.link(&child);
        child
    }

    /// Runs `boot` as a tokio task tied to this actor. Quitting cancels the task; the task
    /// failing is a fault of the actor. Uses `name` for log messages emitted by the task.
    pub fn linked_task<F>(&mut self, name: tracing::Span, boot: F)
    where
        F: 'static + Send + futures::Future<Output = ActorResult>,
    {
        if self.core.state != LifecycleState::Running {
            return;
        }
        let token = CancellationToken::new();
        let task_id = NEXT_TASK_ID.fetch_add(BUMP_AMOUNT.into(), Ordering::Relaxed);
        name.record("task_id", &task_id);
        {
            let token = token.clone();
            let me = self.core.me.clone();
            tokio::spawn(async move {
                tracing::trace!(task_id, "linked task start");
                let result = select! {
                    _ = token.cancelled() => {
                        tracing::trace!(task_id, "linked task cancelled");
                        return;
                    }
                    result = boot => result,
                };
                match &result {
                    Ok(()) => tracing::trace!(task_id, "linked task normal stop"),
                    Err(e) => tracing::error!(task_id, "linked task error: {}", e),
                }
                let release: LocalAction<A> = local_fn(move |_a: &mut A, t: &mut Activation<A>| {
                    t.core.linked_tasks.remove(&task_id);
                    result
                });
                me.deliver(Envelope::local(release));
            }.instrument(name));
        }
        self.core.linked_tasks.insert(task_id, token);
    }

    /// Runs `action` in this actor after `duration`, unless the actor has quit by then.
    pub fn after<F>(&mut self, duration: Duration, action: F)
    where
        F: FnOnce(&mut A, &mut Activation<A>) -> ActorResult + Send + 'static,
    {
        let me = self.core.me.clone();
        let action: LocalAction<A> = Box::new(action);
        self.linked_task(crate::name!(parent: None, "after"), async move {
            tokio::time::sleep(duration).await;
            me.deliver(Envelope::local(action));
            Ok(())
        });
    }

    pub(crate) fn defer<F>(&mut self, action: F)
    where
        F: FnOnce(&mut A, &mut Activation<A>) -> ActorResult + Send + 'static,
    {
        self.core.defer(Box::new(action))
    }

    fn handle(&mut self, a: &mut A, envelope: Envelope) -> ActorResult {
        match envelope {
            Envelope::Message { payload, type_id, type_name } => {
                let handler = match self.core.behaviour.as_ref() {
                    Some(b) => b.message_handler(&type_id),
                    None => None,
                };
                match handler {
                    Some(h) => (*h)(a, self, payload),
                    None => {
                        tracing::trace!(message = type_name, "no handler; dropping message");
                        Ok(())
                    }
                }
            }
            Envelope::Command(incoming) => self.handle_command(a, incoming),
            Envelope::Reply { id, from, result } => self.handle_reply(a, id, from, result),
            Envelope::PreReply { id, processor } => {
                self.handle_pre_reply(id, processor);
                Ok(())
            }
            Envelope::Cancel { promise } => self.handle_cancel(a, promise),
            Envelope::Link { peer, relation } => {
                self.core.add_relation(peer, relation);
                Ok(())
            }
            Envelope::Unlink { peer, relation } => {
                self.core.remove_relation(&peer, relation);
                Ok(())
            }
            Envelope::Quit { from, error, watch } => {
                match from {
                    None => self.core.quit(error),
                    Some(peer) => {
                        if watch {
                            self.core.watchers.insert(peer.clone());
                        }
                        match self.core.links.remove(&peer) {
                            Some(Relation::Kill) => tracing::debug!(?peer, "dependent closed"),
                            _ => self.core.quit(error),
                        }
                    }
                }
                Ok(())
            }
            Envelope::Closed { peer, error } => {
                self.core.waiting_for.remove(&peer);
                if let Some(callbacks) = self.core.awaiting.remove(&peer) {
                    for callback in callbacks.into_iter() {
                        callback(a, self, error.clone())?;
                    }
                }
                Ok(())
            }
            Envelope::Subscribe { subscriber } => {
                let change = StateChange {
                    actor: self.core.me.clone(),
                    state: self.core.state,
                    error: self.core.exit.clone(),
                };
                self.core.outbox.push_committed(&subscriber, Envelope::message(change));
                self.core.subscribers.insert(subscriber);
                Ok(())
            }
            Envelope::Stream(m) => self.handle_stream(a, m),
            Envelope::Local(action) => match action.downcast::<LocalAction<A>>() {
                Ok(action) => {
                    let action = *action;
                    action(a, self)
                }
                Err(_) => {
                    tracing::warn!("local action for a different actor type");
                    Ok(())
                }
            },
            Envelope::Batch(items) => {
                for e in items.into_iter() {
                    self.handle(a, e)?;
                }
                Ok(())
            }
        }
    }
}

pub(crate) fn local_fn<A, F>(f: F) -> LocalAction<A>
where
    A: Actor,
    F: FnOnce(&mut A, &mut Activation<A>) -> ActorResult + Send + 'static,
{
    Box::new(f)
}

//---------------------------------------------------------------------------

/// An actor together with its bookkeeping: the state owned by one dispatch task.
pub(crate) struct ActorCell<A> {
    actor: A,
    core: Core<A>,
}

impl<A: Actor> ActorCell<A> {
    pub(crate) fn new(actor: A, me: ActorService, system: System) -> Self {
        ActorCell { actor, core: Core::new(me, system) }
    }

    fn with_activation<R, F>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut A, &mut Activation<A>) -> R,
    {
        let mut t = Activation { core: &mut self.core };
        f(&mut self.actor, &mut t)
    }

    /// The actor's mainloop.
    pub(crate) async fn run(mut self) {
        tracing::trace!("start");
        let me = self.core.me.clone();
        let mailbox = match me.mailbox() {
            Some(m) => m,
            None => return,
        };

        self.core.behaviour = Some(self.actor.behaviour());
        self.guarded(|a, t| a.started(t));

        loop {
            self.settle();
            if self.core.state == LifecycleState::Dead {
                break;
            }
            tracing::trace!(actor_id = ?me.id(), "mainloop top");
            let batch = loop {
                if let Some(batch) = mailbox.take_head() {
                    break batch;
                }
                mailbox.notified().await;
            };
            for envelope in batch.into_iter() {
                self.dispatch(envelope);
            }
        }

        match &self.core.exit {
            None => tracing::trace!("normal stop"),
            Some(e) => tracing::error!("error stop: {}", e),
        }
    }

    fn dispatch(&mut self, envelope: Envelope) {
        match (self.core.state, envelope) {
            (_, Envelope::Batch(items)) =>
                for e in items.into_iter() {
                    self.dispatch(e)
                },
            (LifecycleState::Closed, envelope) | (LifecycleState::Dead, envelope) =>
                self.dispatch_closed(envelope),
            (_, envelope) => {
                self.guarded(move |a, t| t.handle(a, envelope));
                self.run_deferred();
                self.core.outbox.deliver();
            }
        }
    }

    /// While waiting for dependents, everything is answered as if already dead, except
    /// close notices from awaited peers and state-feed subscriptions.
    fn dispatch_closed(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Batch(items) =>
                for e in items.into_iter() {
                    self.dispatch_closed(e)
                },
            Envelope::Closed { peer, .. } => {
                self.core.waiting_for.remove(&peer);
            }
            Envelope::Subscribe { subscriber } => {
                self.core.subscribers.insert(subscriber);
            }
            Envelope::Local(_) => (),
            envelope => bounce(&self.core.me, Error::ActorDead, self.core.exit.clone(), envelope),
        }
    }

    /// Runs `f`, converting a panic or error into a fault. One bad envelope never takes the
    /// mainloop down with it.
    fn guarded<F>(&mut self, f: F)
    where
        F: FnOnce(&mut A, &mut Activation<A>) -> ActorResult,
    {
        let mark = self.core.outbox.mark();
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.with_activation(f)));
        match result {
            Ok(Ok(())) => (),
            Ok(Err(e)) => self.fault(e),
            Err(payload) => {
                let e = Error::from_panic(payload);
                self.roll_back(mark, &e);
                self.fault(e);
            }
        }
    }

    /// Undoes what a panicking step sent since `mark`. Requests it issued are failed back
    /// to this actor, and the command or stream it was working on is answered with `error`.
    fn roll_back(&mut self, mark: usize, error: &Error) {
        let me = self.core.me.clone();
        for (to, envelope) in self.core.outbox.discard_since(mark).into_iter() {
            if let Envelope::Command(incoming) = envelope {
                if incoming.promise.origin == me {
                    let reply = Envelope::Reply { id: incoming.promise.id, from: to, result: Err(error.clone()) };
                    self.core.outbox.push(&me, reply);
                }
            }
        }
        self.core.abandon_streams_in_flight(error);
        match self.core.current.take() {
            None => tracing::error!(%error, "handler panicked"),
            Some(current) => {
                tracing::error!(%error, command = current.type_name, "command handler panicked");
                if let Some(id) = current.accepted {
                    self.core.streams.forget_output(&id);
                }
                if !current.settled {
                    self.core.reissued.retain(|i| i.promise != current.promise);
                    self.core.drop_promise(&current.promise);
                    self.core.reply(&current.promise, Err(error.clone()));
                }
            }
        }
    }

    fn fault(&mut self, e: Error) {
        tracing::debug!(%e, "fault");
        let hook = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let e = e.clone();
            self.with_activation(move |a, t| a.on_fault(t, e))
        }));
        if hook.is_err() {
            tracing::error!("fault hook panicked");
            self.core.quit(Some(e));
        }
    }

    fn run_deferred(&mut self) {
        while let Some(action) = self.core.deferred.pop_front() {
            self.guarded(move |a, t| action(a, t));
        }
    }

    /// End-of-batch processing: ready stream outputs, resumed commands, state transitions.
    fn settle(&mut self) {
        loop {
            self.run_deferred();
            let ready: Vec<OutputId> = self.core.streams.take_ready();
            let mut progressed = !ready.is_empty();
            for id in ready.into_iter() {
                self.guarded(move |a, t| t.flush_output(a, &id));
            }
            while let Some(incoming) = self.core.reissued.pop() {
                progressed = true;
                self.dispatch(Envelope::Command(incoming));
            }
            if self.check_transitions() {
                progressed = true;
            }
            self.core.outbox.deliver();
            if !progressed {
                break;
            }
        }
    }

    fn check_transitions(&mut self) -> bool {
        let before = self.core.state;
        loop {
            self.run_deferred();
            match self.core.state {
                LifecycleState::Running => {
                    if !self.core.can_quit() {
                        break;
                    }
                    tracing::debug!("nothing left to do");
                    self.core.quit(None);
                }
                LifecycleState::Quitting => {
                    if !self.core.exit_hook_ran {
                        self.core.exit_hook_ran = true;
                        self.guarded(|a, t| a.exit_hook(t));
                        continue;
                    }
                    if !self.core.can_quit() {
                        break;
                    }
                    self.core.enter_closed();
                }
                LifecycleState::Closed => {
                    if !self.core.waiting_for.is_empty() {
                        break;
                    }
                    self.finalize();
                }
                LifecycleState::Dead => break,
            }
        }
        self.core.state != before
    }

    fn finalize(&mut self) {
        let exit = self.core.exit.clone();
        let leftovers = self.core.me.mark_dead(&exit);
        self.core.set_state(LifecycleState::Dead);
        self.core.subscribers.clear();
        self.core.outbox.deliver();
        for envelope in leftovers.into_iter() {
            bounce(&self.core.me, Error::ActorDead, exit.clone(), envelope);
        }
        self.core.system.actor_finished(&self.core.me);
    }
}
