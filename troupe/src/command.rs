//! Request/reply correlation, promises, and suspended commands.
//!
//! Every command carries a [`PromiseId`] naming the requester and its correlation id. The
//! receiving actor answers it exactly once: synchronously from the handler, later through a
//! [`Promise`], after pausing and resuming it, or by delegating it to another actor. Whatever
//! settles a promise first removes its entry; every later attempt finds nothing and is a no-op.

use super::actor::Activation;
use super::actor::Actor;
use super::actor::ActorService;
use super::actor::Core;
use super::actor::Envelope;
use super::actor::LifecycleState;
use super::actor::LocalAction;
use super::actor::local_fn;
use super::behaviour::Answer;
use super::behaviour::Command;
use super::behaviour::Describe;
use super::behaviour::Filtered;
use super::behaviour::Incoming;
use super::behaviour::Status;
use super::config::QUEUE_COMPACTION;
use super::error::ActorResult;
use super::error::Error;
use super::stream::OutputId;
use super::stream::StreamOpen;

use std::any::Any;
use std::any::TypeId;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// Per-actor correlation counter. Never reused within an actor's lifetime.
pub type CommandId = u64;

/// Globally names one request/response exchange: who asked, and under which id.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PromiseId {
    pub origin: ActorService,
    pub id: CommandId,
}

/// Cancels an outbound request; see [`Activation::cancel_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    id: CommandId,
}

impl RequestHandle {
    pub(crate) fn from_id(id: CommandId) -> Self {
        RequestHandle { id }
    }

    pub fn id(&self) -> CommandId {
        self.id
    }
}

/// The command currently being handled.
pub(crate) struct Current {
    pub(crate) promise: PromiseId,
    pub(crate) type_name: &'static str,
    pub(crate) resumed: bool,
    pub(crate) stream: Option<StreamOpen>,
    /// A promise, pause or delegation has taken over answering the command.
    pub(crate) claimed: bool,
    /// The requester has already been answered from within the handler.
    pub(crate) settled: bool,
    pub(crate) accepted: Option<OutputId>,
}

impl Current {
    fn of(incoming: &Incoming) -> Self {
        Current {
            promise: incoming.promise.clone(),
            type_name: incoming.type_name,
            resumed: incoming.resumed,
            stream: incoming.stream.clone(),
            claimed: false,
            settled: false,
            accepted: None,
        }
    }
}

pub(crate) enum PromiseEntry<A> {
    Promised { on_cancel: Option<LocalAction<A>> },
    Paused { live: Arc<AtomicBool> },
    /// Answered by forwarding the reply to our own outbound request.
    Proxy { request: CommandId },
}

pub(crate) type ReplyFn<A> = Box<
    dyn FnOnce(&mut A, &mut Activation<A>, Result<Box<dyn Any + Send>, Error>, &ActorService) -> ActorResult
        + Send>;

pub(crate) fn reply_fn<A, F>(f: F) -> ReplyFn<A>
where
    A: Actor,
    F: FnOnce(&mut A, &mut Activation<A>, Result<Box<dyn Any + Send>, Error>, &ActorService) -> ActorResult
        + Send + 'static,
{
    Box::new(f)
}

pub(crate) struct Inflight<A> {
    pub(crate) destination: ActorService,
    pub(crate) processor: ReplyFn<A>,
}

impl<A: Actor> Core<A> {
    fn note_settled(&mut self, promise: &PromiseId) {
        if let Some(current) = self.current.as_mut() {
            if &current.promise == promise {
                current.settled = true;
            }
        }
    }

    /// Forgets a promise without answering it.
    pub(crate) fn drop_promise(&mut self, promise: &PromiseId) {
        if let Some(PromiseEntry::Paused { live }) = self.promises.remove(promise) {
            live.store(false, Ordering::Relaxed);
        }
    }
}

//---------------------------------------------------------------------------

/// The right to answer one command later.
///
/// Consumed by [`resolve`][Promise::resolve] or [`fail`][Promise::fail]. Both return `false` if
/// the exchange was already settled or cancelled.
pub struct Promise<R> {
    id: PromiseId,
    _reply: PhantomData<fn(R)>,
}

impl<R: Any + Send> Promise<R> {
    pub fn id(&self) -> &PromiseId {
        &self.id
    }

    pub fn resolve<A: Actor>(self, t: &mut Activation<A>, value: R) -> bool {
        t.settle(&self.id, Ok(Box::new(value)))
    }

    pub fn fail<A: Actor>(self, t: &mut Activation<A>, error: Error) -> bool {
        t.settle(&self.id, Err(error))
    }

    pub fn is_live<A: Actor>(&self, t: &Activation<A>) -> bool {
        t.core.promises.contains_key(&self.id)
    }
}

impl<R> std::fmt::Debug for Promise<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "#<Promise {:?}>", self.id)
    }
}

/// A command detached from the dispatch loop, waiting to be resumed or cancelled.
pub struct Paused {
    incoming: Incoming,
    live: Arc<AtomicBool>,
}

impl Paused {
    pub fn promise_id(&self) -> &PromiseId {
        &self.incoming.promise
    }

    pub fn command<C: Command>(&self) -> Option<&C> {
        self.incoming.command::<C>()
    }

    pub fn command_mut<C: Command>(&mut self) -> Option<&mut C> {
        self.incoming.command_mut::<C>()
    }

    pub fn replace<C: Command>(&mut self, command: C) {
        self.incoming.replace(command)
    }

    /// Makes a resume run the pausing filter again rather than continue after it.
    pub fn rerun_filter(mut self) -> Self {
        self.incoming.next_filter = self.incoming.at_filter.map(|i| i + 1);
        self
    }

    /// False once the requester cancelled or the actor quit.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for Paused {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "#<Paused {:?} live={}>", self.incoming, self.is_live())
    }
}

/// A FIFO of paused commands that skips cancelled entries.
///
/// Cancelled entries are not removed eagerly; every time the queue doubles past its last
/// checkpoint it is compacted if at least half of it is dead.
pub struct CommandQueue {
    items: VecDeque<Paused>,
    checkpoint: usize,
}

impl CommandQueue {
    pub fn new() -> Self {
        CommandQueue { items: VecDeque::new(), checkpoint: *QUEUE_COMPACTION }
    }

    pub fn push(&mut self, paused: Paused) {
        self.items.push_back(paused);
        if self.items.len() >= self.checkpoint {
            self.compact();
        }
    }

    pub fn pop(&mut self) -> Option<Paused> {
        while let Some(p) = self.items.pop_front() {
            if p.is_live() {
                return Some(p);
            }
        }
        None
    }

    /// Number of retained entries, live or not.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.iter().all(|p| !p.is_live())
    }

    pub fn live_count(&self) -> usize {
        self.items.iter().filter(|p| p.is_live()).count()
    }

    pub fn drain(&mut self) -> Vec<Paused> {
        self.items.drain(..).filter(|p| p.is_live()).collect()
    }

    fn compact(&mut self) {
        let dead = self.items.iter().filter(|p| !p.is_live()).count();
        if dead * 2 >= self.items.len() {
            tracing::trace!(dead, total = self.items.len(), "compacting command queue");
            self.items.retain(|p| p.is_live());
        }
        self.checkpoint = std::cmp::max(self.items.len() * 2, *QUEUE_COMPACTION);
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

//---------------------------------------------------------------------------

impl<'activation, A: Actor> Activation<'activation, A> {
    /// Sends `command` to `dest`; `on_reply` runs here with the reply or error, exactly once.
    pub fn request<C, F>(&mut self, dest: &ActorService, command: C, on_reply: F) -> RequestHandle
    where
        C: Command,
        F: FnOnce(&mut A, &mut Activation<A>, Result<C::Reply, Error>) -> ActorResult + Send + 'static,
    {
        let processor = reply_fn(move |a: &mut A,
                                       t: &mut Activation<A>,
                                       result: Result<Box<dyn Any + Send>, Error>,
                                       _from: &ActorService| {
            on_reply(a, t, result.and_then(downcast_reply::<C::Reply>))
        });
        self.send_request_raw(dest,
                              Box::new(command),
                              TypeId::of::<C>(),
                              std::any::type_name::<C>(),
                              None,
                              processor)
    }

    pub(crate) fn send_request_raw(
        &mut self,
        dest: &ActorService,
        payload: Box<dyn Any + Send>,
        type_id: TypeId,
        type_name: &'static str,
        stream: Option<StreamOpen>,
        processor: ReplyFn<A>,
    ) -> RequestHandle {
        let id = self.core.next_command_id();
        let incoming = Incoming {
            promise: PromiseId { origin: self.core.me.clone(), id },
            payload,
            type_id,
            type_name,
            next_filter: None,
            at_filter: None,
            resumed: false,
            stream,
        };
        tracing::trace!(?dest, id, command = type_name, "request");
        self.core.inflight.insert(id, Inflight { destination: dest.clone(), processor });
        self.core.outbox.push(dest, Envelope::Command(incoming));
        RequestHandle { id }
    }

    /// Withdraws an outbound request. Its reply processor sees [`Error::Cancelled`] straight
    /// away and any later reply is ignored. `false` if it had already been answered.
    pub fn cancel_request(&mut self, handle: &RequestHandle) -> bool {
        match self.core.inflight.remove(&handle.id) {
            None => false,
            Some(Inflight { destination, processor }) => {
                let promise = PromiseId { origin: self.core.me.clone(), id: handle.id };
                self.core.outbox.push(&destination, Envelope::Cancel { promise });
                self.core.defer(local_fn(move |a: &mut A, t: &mut Activation<A>| {
                    processor(a, t, Err(Error::Cancelled), &destination)
                }));
                true
            }
        }
    }

    pub(crate) fn handle_reply(
        &mut self,
        a: &mut A,
        id: CommandId,
        from: ActorService,
        result: Result<Box<dyn Any + Send>, Error>,
    ) -> ActorResult {
        match self.core.inflight.remove(&id) {
            Some(inflight) => (inflight.processor)(a, self, result, &from),
            None => {
                tracing::trace!(id, ?from, "reply for unknown request");
                Ok(())
            }
        }
    }

    pub(crate) fn handle_pre_reply(&mut self, id: CommandId, processor: ActorService) {
        if let Some(inflight) = self.core.inflight.get_mut(&id) {
            inflight.destination = processor;
        }
    }

    pub(crate) fn handle_cancel(&mut self, a: &mut A, promise: PromiseId) -> ActorResult {
        match self.core.promises.remove(&promise) {
            Some(PromiseEntry::Promised { on_cancel }) => match on_cancel {
                Some(f) => f(a, self),
                None => Ok(()),
            },
            Some(PromiseEntry::Paused { live }) => {
                live.store(false, Ordering::Relaxed);
                Ok(())
            }
            Some(PromiseEntry::Proxy { request }) => {
                self.cancel_request(&RequestHandle { id: request });
                Ok(())
            }
            None => {
                tracing::trace!(?promise, "cancel for settled command");
                Ok(())
            }
        }
    }

    //-----------------------------------------------------------------------

    /// The command being handled, if any.
    pub fn current_promise(&self) -> Option<&PromiseId> {
        self.core.current.as_ref().map(|c| &c.promise)
    }

    /// Takes over answering the current command. The handler then returns [`Answer::Pending`].
    pub fn promise<R: Any + Send>(&mut self) -> Result<Promise<R>, Error> {
        self.make_promise(None)
    }

    /// Like [`promise`][Self::promise], with a callback run if the requester cancels.
    pub fn promise_with_cancel<R, F>(&mut self, on_cancel: F) -> Result<Promise<R>, Error>
    where
        R: Any + Send,
        F: FnOnce(&mut A, &mut Activation<A>) -> ActorResult + Send + 'static,
    {
        self.make_promise(Some(local_fn(on_cancel)))
    }

    fn make_promise<R: Any + Send>(&mut self, on_cancel: Option<LocalAction<A>>) -> Result<Promise<R>, Error> {
        let current = self.core.current.as_mut().ok_or(Error::NoCurrentCommand)?;
        current.claimed = true;
        let id = current.promise.clone();
        self.core.promises.insert(id.clone(), PromiseEntry::Promised { on_cancel });
        Ok(Promise { id, _reply: PhantomData })
    }

    /// Answers `promise` if nothing has answered or cancelled it yet.
    pub(crate) fn settle(&mut self, promise: &PromiseId, result: Result<Box<dyn Any + Send>, Error>) -> bool {
        match self.core.promises.remove(promise) {
            None => false,
            Some(entry) => {
                if let PromiseEntry::Paused { live } = entry {
                    live.store(false, Ordering::Relaxed);
                }
                self.core.note_settled(promise);
                self.core.reply(promise, result);
                true
            }
        }
    }

    /// Detaches the command being handled. Resuming it runs the handler again with `command`,
    /// skipping the filter chain.
    pub fn pause<C: Command>(&mut self, command: C) -> Result<Paused, Error> {
        let current = self.core.current.as_mut().ok_or(Error::NoCurrentCommand)?;
        current.claimed = true;
        let mut incoming = Incoming::new(current.promise.clone(), command);
        incoming.resumed = current.resumed;
        incoming.stream = current.stream.clone();
        incoming.next_filter = Some(0);
        Ok(self.park(incoming))
    }

    /// Detaches a command handed to a filter. Resuming it continues with the next filter.
    pub fn pause_command(&mut self, incoming: Incoming) -> Paused {
        self.claim(&incoming.promise);
        self.park(incoming)
    }

    fn claim(&mut self, promise: &PromiseId) {
        if let Some(current) = self.core.current.as_mut() {
            if &current.promise == promise {
                current.claimed = true;
            }
        }
    }

    fn park(&mut self, incoming: Incoming) -> Paused {
        let live = Arc::new(AtomicBool::new(true));
        self.core.promises.insert(incoming.promise.clone(), PromiseEntry::Paused { live: Arc::clone(&live) });
        Paused { incoming, live }
    }

    /// Feeds a paused command back into the dispatch loop before the next mailbox drain.
    /// `false` if it was cancelled in the meantime.
    pub fn resume_command(&mut self, paused: Paused) -> bool {
        let Paused { mut incoming, live } = paused;
        if !live.swap(false, Ordering::Relaxed) {
            return false;
        }
        self.core.promises.remove(&incoming.promise);
        incoming.resumed = true;
        self.core.reissued.push(incoming);
        true
    }

    /// Resumes every live command in `queue`, preserving queue order.
    pub fn resume_commands(&mut self, queue: &mut CommandQueue) -> usize {
        let mut resumed = Vec::new();
        for paused in queue.drain().into_iter() {
            let Paused { mut incoming, live } = paused;
            if live.swap(false, Ordering::Relaxed) {
                self.core.promises.remove(&incoming.promise);
                incoming.resumed = true;
                resumed.push(incoming);
            }
        }
        let count = resumed.len();
        // The reissue queue is popped from the back.
        self.core.reissued.extend(resumed.into_iter().rev());
        count
    }

    /// Answers a paused command with `error`. `false` if it was already cancelled.
    pub fn cancel_command(&mut self, paused: Paused, error: Error) -> bool {
        if !paused.live.swap(false, Ordering::Relaxed) {
            return false;
        }
        let promise = paused.incoming.promise;
        self.core.promises.remove(&promise);
        self.core.note_settled(&promise);
        self.core.reply(&promise, Err(error));
        true
    }

    pub fn cancel_commands(&mut self, queue: &mut CommandQueue, error: Error) -> usize {
        let mut count = 0;
        for paused in queue.drain().into_iter() {
            if self.cancel_command(paused, error.clone()) {
                count += 1;
            }
        }
        count
    }

    /// Hands the current command to `dest`, which answers the requester directly.
    pub fn delegate<C: Command>(&mut self, dest: &ActorService, command: C) -> Result<(), Error> {
        let current = self.core.current.as_mut().ok_or(Error::NoCurrentCommand)?;
        current.claimed = true;
        let mut incoming = Incoming::new(current.promise.clone(), command);
        incoming.resumed = current.resumed;
        incoming.stream = current.stream.clone();
        self.delegate_incoming(dest, incoming);
        Ok(())
    }

    /// Hands `incoming` to `dest`. A command that was paused here is proxied instead: the
    /// requester may still cancel through this actor, so the reply is relayed back through it.
    pub fn delegate_incoming(&mut self, dest: &ActorService, incoming: Incoming) {
        self.claim(&incoming.promise);
        let Incoming { promise, payload, type_id, type_name, resumed, stream, .. } = incoming;
        if resumed || self.core.promises.contains_key(&promise) {
            if stream.is_some() {
                tracing::warn!(command = type_name, "proxied command cannot carry a stream");
            }
            self.core.drop_promise(&promise);
            let original = promise.clone();
            let processor = reply_fn(move |_a: &mut A,
                                           t: &mut Activation<A>,
                                           result: Result<Box<dyn Any + Send>, Error>,
                                           _from: &ActorService| {
                t.settle(&original, result);
                Ok(())
            });
            let handle = self.send_request_raw(dest, payload, type_id, type_name, None, processor);
            self.core.promises.insert(promise, PromiseEntry::Proxy { request: handle.id });
        } else {
            let pre_reply = Envelope::PreReply { id: promise.id, processor: dest.clone() };
            self.core.outbox.push(&promise.origin, pre_reply);
            let incoming = Incoming {
                promise,
                payload,
                type_id,
                type_name,
                next_filter: None,
                at_filter: None,
                resumed: false,
                stream,
            };
            self.core.outbox.push(dest, Envelope::Command(incoming));
        }
    }

    //-----------------------------------------------------------------------

    pub(crate) fn handle_command(&mut self, a: &mut A, incoming: Incoming) -> ActorResult {
        let filters = match self.core.behaviour.as_ref() {
            Some(b) if self.core.state == LifecycleState::Running => b.filters.clone(),
            _ => {
                self.core.reply(&incoming.promise, Err(Error::ActorDead));
                return Ok(());
            }
        };
        let promise = incoming.promise.clone();
        tracing::trace!(command = incoming.type_name, ?promise, "command");

        let start = incoming.next_filter.unwrap_or(filters.len()).min(filters.len());
        let mut incoming = incoming;
        for i in (0..start).rev() {
            incoming.at_filter = Some(i);
            incoming.next_filter = Some(i);
            self.core.current = Some(Current::of(&incoming));
            let outcome = (*filters[i])(a, self, incoming);
            let current = self.core.current.take();
            match outcome {
                Ok(Filtered::Pass(next)) => incoming = next,
                Ok(Filtered::Held) => return Ok(()),
                Err(e) => {
                    self.fail_command(&promise, current, e);
                    return Ok(());
                }
            }
        }

        let handler = match self.core.behaviour.as_ref() {
            Some(b) => b.command_handler(&incoming.type_id),
            None => {
                self.core.reply(&promise, Err(Error::ActorDead));
                return Ok(());
            }
        };
        let handler = match handler {
            Some(h) => h,
            None => {
                let result: Result<Box<dyn Any + Send>, Error> = if incoming.is::<Describe>() {
                    Ok(Box::new(self.describe()))
                } else if incoming.is::<Status>() {
                    Ok(Box::new(self.status()))
                } else {
                    Err(Error::UnknownCommand(incoming.type_name))
                };
                self.core.drop_promise(&promise);
                self.core.reply(&promise, result);
                return Ok(());
            }
        };

        self.core.current = Some(Current::of(&incoming));
        let outcome = (*handler)(a, self, incoming.payload);
        let current = self.core.current.take();
        match outcome {
            Ok(Answer::Value(v)) => match current {
                Some(c) if c.claimed && !self.core.promises.contains_key(&promise) =>
                    tracing::warn!(?promise, command = c.type_name,
                                   "ignoring value from a handler that already handed off its command"),
                _ => {
                    self.core.drop_promise(&promise);
                    self.core.reply(&promise, Ok(v));
                }
            },
            Ok(Answer::Pending) => if !current.map_or(false, |c| c.claimed) {
                tracing::warn!(?promise, "handler left its command unanswered");
                self.core.reply(&promise, Err(Error::msg("command left unanswered")));
            },
            Err(e) => self.fail_command(&promise, current, e),
        }
        Ok(())
    }

    fn fail_command(&mut self, promise: &PromiseId, current: Option<Current>, error: Error) {
        tracing::debug!(?promise, %error, "command failed");
        if let Some(id) = current.and_then(|c| c.accepted) {
            self.core.streams.forget_output(&id);
        }
        self.core.drop_promise(promise);
        self.core.reply(promise, Err(error));
    }
}

pub(crate) fn downcast_reply<R: Any + Send>(v: Box<dyn Any + Send>) -> Result<R, Error> {
    v.downcast::<R>().map(|r| *r).map_err(|_| Error::ReplyType(std::any::type_name::<R>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Job(u32);
    impl Command for Job {
        type Reply = ();
    }

    fn paused(n: u32) -> Paused {
        let promise = PromiseId { origin: ActorService::null(), id: n as CommandId };
        Paused { incoming: Incoming::new(promise, Job(n)), live: Arc::new(AtomicBool::new(true)) }
    }

    #[test]
    fn pop_skips_cancelled_entries() {
        let mut q = CommandQueue::new();
        let ps: Vec<Paused> = (0..5).map(paused).collect();
        let flags: Vec<_> = ps.iter().map(|p| Arc::clone(&p.live)).collect();
        for p in ps {
            q.push(p);
        }
        flags[0].store(false, Ordering::Relaxed);
        flags[2].store(false, Ordering::Relaxed);
        assert_eq!(q.live_count(), 3);
        let order: Vec<u32> = std::iter::from_fn(|| q.pop()).map(|p| p.command::<Job>().unwrap().0).collect();
        assert_eq!(order, vec![1, 3, 4]);
        assert!(q.is_empty());
    }

    #[test]
    fn compaction_bounds_dead_entries() {
        let mut q = CommandQueue::new();
        let mut flags = Vec::new();
        for n in 0..(*QUEUE_COMPACTION as u32 * 4) {
            let p = paused(n);
            let live = Arc::clone(&p.live);
            live.store(false, Ordering::Relaxed);
            flags.push(live);
            q.push(p);
        }
        assert!(q.len() < *QUEUE_COMPACTION);
        assert_eq!(q.live_count(), 0);
        assert!(q.pop().is_none());
    }

    #[test]
    fn rerun_filter_rewinds_one_step() {
        let mut p = paused(1);
        p.incoming.at_filter = Some(2);
        p.incoming.next_filter = Some(2);
        let p = p.rerun_filter();
        assert_eq!(p.incoming.next_filter, Some(3));
    }
}
