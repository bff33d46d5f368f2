//! Pull-based streams between actors, with one outstanding request per direction.
//!
//! A consumer opens a stream by sending a stream-opening command; the producer's handler
//! calls [`Activation::accept_stream`] and answers [`Streaming`]. From then on the consumer
//! sends one request at a time, carrying its credit (the most items it will take) and the
//! item type it expects, and the producer answers each request with at most one batch.
//! Either side may stop the stream; the other side hears about it exactly once.

use super::actor::Activation;
use super::actor::Actor;
use super::actor::ActorService;
use super::actor::Core;
use super::actor::Envelope;
use super::actor::local_fn;
use super::behaviour::Command;
use super::command::CommandId;
use super::command::RequestHandle;
use super::command::reply_fn;
use super::error::ActorResult;
use super::error::Error;

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::collections::HashSet;
use std::marker::PhantomData;

/// Per-actor counter naming the streams an actor consumes.
pub type StreamId = u64;

/// Names one stream an actor produces: the consumer's stream id plus the consumer itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OutputId {
    pub stream: StreamId,
    pub consumer: ActorService,
}

/// Attached to a stream-opening command.
#[derive(Clone, Debug)]
pub(crate) struct StreamOpen {
    pub(crate) stream: StreamId,
}

/// The reply to a stream-opening command whose handler accepted the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Streaming;

pub(crate) enum StreamMessage {
    Request {
        stream: StreamId,
        consumer: ActorService,
        max_len: usize,
        item_type: TypeId,
        item_name: &'static str,
    },
    Reply {
        stream: StreamId,
        producer: ActorService,
        data: Box<dyn Any + Send>,
        last: bool,
    },
    Ack {
        stream: StreamId,
        consumer: ActorService,
    },
    UpstreamStopped {
        stream: StreamId,
        error: Option<Error>,
    },
    DownstreamStopped {
        stream: StreamId,
        consumer: ActorService,
        error: Option<Error>,
    },
}

//---------------------------------------------------------------------------

/// The consuming end of a stream.
#[allow(unused_variables)]
pub trait StreamInput<A: Actor>: Send + 'static {
    type Item: Any + Send;

    /// A batch of at most the requested number of items.
    fn on_data(&mut self, a: &mut A, t: &mut Activation<A>, items: Vec<Self::Item>) -> ActorResult;

    /// The stream is over: `None` for a graceful end.
    fn on_close(&mut self, a: &mut A, t: &mut Activation<A>, error: Option<Error>) -> ActorResult {
        Ok(())
    }
}

/// What a [`StreamOutput`] has for an outstanding request.
#[derive(Debug)]
pub enum Pull<T> {
    Data(Vec<T>),
    /// The final batch.
    Last(Vec<T>),
    /// Nothing yet; call [`Activation::flush_later`] once there is.
    Pending,
    /// The stream is over without a final batch.
    Finished(Option<Error>),
}

/// The producing end of a stream.
#[allow(unused_variables)]
pub trait StreamOutput<A: Actor>: Send + 'static {
    type Item: Any + Send;

    /// Produces at most `max_len` items. An empty `Data` counts as `Pending`.
    fn pull(&mut self, a: &mut A, t: &mut Activation<A>, id: &OutputId, max_len: usize) -> Pull<Self::Item>;

    /// The consumer acknowledged everything sent so far.
    fn on_ack(&mut self, a: &mut A, t: &mut Activation<A>, id: &OutputId) -> ActorResult {
        Ok(())
    }

    fn on_close(&mut self, a: &mut A, t: &mut Activation<A>, id: &OutputId, error: Option<&Error>) -> ActorResult {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputOptions {
    /// Close the output, with the actor's terminal error, when the actor quits.
    pub close_with_actor: bool,
    /// After the final batch, keep the output until the consumer acknowledges it.
    pub close_after_ack: bool,
}

impl Default for OutputOptions {
    fn default() -> Self {
        OutputOptions { close_with_actor: true, close_after_ack: false }
    }
}

/// Events seen by an [`input_fn`] closure.
#[derive(Debug)]
pub enum StreamEvent<T> {
    Data(Vec<T>),
    Closed(Option<Error>),
}

pub struct FnInput<A, T, F> {
    f: F,
    _phantom: PhantomData<fn(&mut A) -> T>,
}

/// A [`StreamInput`] from a closure.
pub fn input_fn<A, T, F>(f: F) -> FnInput<A, T, F>
where
    A: Actor,
    T: Any + Send,
    F: FnMut(&mut A, &mut Activation<A>, StreamEvent<T>) -> ActorResult + Send + 'static,
{
    FnInput { f, _phantom: PhantomData }
}

impl<A, T, F> StreamInput<A> for FnInput<A, T, F>
where
    A: Actor,
    T: Any + Send,
    F: FnMut(&mut A, &mut Activation<A>, StreamEvent<T>) -> ActorResult + Send + 'static,
{
    type Item = T;

    fn on_data(&mut self, a: &mut A, t: &mut Activation<A>, items: Vec<T>) -> ActorResult {
        (self.f)(a, t, StreamEvent::Data(items))
    }

    fn on_close(&mut self, a: &mut A, t: &mut Activation<A>, error: Option<Error>) -> ActorResult {
        (self.f)(a, t, StreamEvent::Closed(error))
    }
}

/// A [`StreamOutput`] draining an iterator; its last batch is marked final.
pub struct IterOutput<I: Iterator> {
    items: std::iter::Peekable<I>,
}

impl<I: Iterator> IterOutput<I> {
    pub fn new<T: IntoIterator<IntoIter = I>>(items: T) -> Self {
        IterOutput { items: items.into_iter().peekable() }
    }
}

impl<A, I> StreamOutput<A> for IterOutput<I>
where
    A: Actor,
    I: Iterator + Send + 'static,
    I::Item: Any + Send,
{
    type Item = I::Item;

    fn pull(&mut self, _a: &mut A, _t: &mut Activation<A>, _id: &OutputId, max_len: usize) -> Pull<I::Item> {
        let batch: Vec<_> = self.items.by_ref().take(max_len).collect();
        if self.items.peek().is_none() {
            if batch.is_empty() { Pull::Finished(None) } else { Pull::Last(batch) }
        } else {
            Pull::Data(batch)
        }
    }
}

//---------------------------------------------------------------------------

enum ErasedPull {
    Data(Box<dyn Any + Send>),
    Last(Box<dyn Any + Send>),
    Pending,
    Finished(Option<Error>),
}

trait ErasedInput<A>: Send {
    fn deliver(&mut self, a: &mut A, t: &mut Activation<A>, data: Box<dyn Any + Send>) -> ActorResult;
    fn close(&mut self, a: &mut A, t: &mut Activation<A>, error: Option<Error>) -> ActorResult;
}

impl<A: Actor, I: StreamInput<A>> ErasedInput<A> for I {
    fn deliver(&mut self, a: &mut A, t: &mut Activation<A>, data: Box<dyn Any + Send>) -> ActorResult {
        match data.downcast::<Vec<I::Item>>() {
            Ok(items) => self.on_data(a, t, *items),
            Err(_) => Err(Error::ReplyType(std::any::type_name::<Vec<I::Item>>())),
        }
    }

    fn close(&mut self, a: &mut A, t: &mut Activation<A>, error: Option<Error>) -> ActorResult {
        self.on_close(a, t, error)
    }
}

trait ErasedOutput<A>: Send {
    fn batch_type(&self) -> TypeId;
    fn pull(&mut self, a: &mut A, t: &mut Activation<A>, id: &OutputId, max_len: usize) -> ErasedPull;
    fn ack(&mut self, a: &mut A, t: &mut Activation<A>, id: &OutputId) -> ActorResult;
    fn close(&mut self, a: &mut A, t: &mut Activation<A>, id: &OutputId, error: Option<&Error>) -> ActorResult;
}

impl<A: Actor, O: StreamOutput<A>> ErasedOutput<A> for O {
    fn batch_type(&self) -> TypeId {
        TypeId::of::<Vec<O::Item>>()
    }

    fn pull(&mut self, a: &mut A, t: &mut Activation<A>, id: &OutputId, max_len: usize) -> ErasedPull {
        match StreamOutput::pull(self, a, t, id, max_len) {
            Pull::Data(items) if items.is_empty() => ErasedPull::Pending,
            Pull::Data(items) => ErasedPull::Data(Box::new(items)),
            Pull::Last(items) => ErasedPull::Last(Box::new(items)),
            Pull::Pending => ErasedPull::Pending,
            Pull::Finished(e) => ErasedPull::Finished(e),
        }
    }

    fn ack(&mut self, a: &mut A, t: &mut Activation<A>, id: &OutputId) -> ActorResult {
        self.on_ack(a, t, id)
    }

    fn close(&mut self, a: &mut A, t: &mut Activation<A>, id: &OutputId, error: Option<&Error>) -> ActorResult {
        self.on_close(a, t, id, error)
    }
}

struct InputState<A> {
    producer: ActorService,
    /// The opening command, while it is unanswered.
    opening: Option<CommandId>,
    established: bool,
    waiting: bool,
    suspended: bool,
    max_len: usize,
    /// The type of the batches this input expects.
    item_type: TypeId,
    item_name: &'static str,
    handler: Option<Box<dyn ErasedInput<A>>>,
}

struct OutputState<A> {
    source: Option<Box<dyn ErasedOutput<A>>>,
    options: OutputOptions,
    /// The credit of the outstanding request, if there is one.
    credit: Option<usize>,
    /// The final batch went out; waiting for the acknowledgement.
    finished: bool,
}

/// An actor's stream tables.
pub(crate) struct Streams<A> {
    next_id: StreamId,
    inputs: HashMap<StreamId, InputState<A>>,
    outputs: HashMap<OutputId, OutputState<A>>,
    ready: HashSet<OutputId>,
    /// The output whose source is out of its table entry, being pulled.
    pulling: Option<OutputId>,
    /// The input whose handler is out of its table entry, receiving a batch.
    receiving: Option<StreamId>,
}

impl<A> Streams<A> {
    pub(crate) fn new() -> Self {
        Streams {
            next_id: 1,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            ready: HashSet::new(),
            pulling: None,
            receiving: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.outputs.is_empty()
    }

    pub(crate) fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub(crate) fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Outputs marked ready since the last call.
    pub(crate) fn take_ready(&mut self) -> Vec<OutputId> {
        let outputs = &self.outputs;
        self.ready.drain().filter(|id| outputs.contains_key(id)).collect()
    }

    /// Drops an output without telling the consumer.
    pub(crate) fn forget_output(&mut self, id: &OutputId) {
        self.outputs.remove(id);
        self.ready.remove(id);
    }
}

impl<A: Actor> Core<A> {
    /// Schedules closing every input, and every output tied to the actor's lifetime.
    pub(crate) fn close_streams_for_quit(&mut self, error: Option<Error>) {
        let inputs: Vec<StreamId> = self.streams.inputs.keys().copied().collect();
        for stream in inputs.into_iter() {
            let error = error.clone();
            self.defer(local_fn(move |a: &mut A, t: &mut Activation<A>| t.finish_input(a, stream, error, true)));
        }
        let outputs: Vec<OutputId> = self.streams.outputs.iter()
            .filter(|(_, o)| o.options.close_with_actor)
            .map(|(id, _)| id.clone())
            .collect();
        for id in outputs.into_iter() {
            let error = error.clone();
            self.defer(local_fn(move |a: &mut A, t: &mut Activation<A>| t.close_output_now(a, &id, error, true)));
        }
    }

    /// Ends the streams whose handlers were running when a panic unwound through them. Their
    /// sources or sinks are lost, so the peers are told without calling back into them.
    pub(crate) fn abandon_streams_in_flight(&mut self, error: &Error) {
        if let Some(id) = self.streams.pulling.take() {
            tracing::debug!(?id, "output abandoned");
            self.streams.forget_output(&id);
            let stopped = StreamMessage::UpstreamStopped { stream: id.stream, error: Some(error.clone()) };
            self.outbox.push(&id.consumer, Envelope::Stream(stopped));
        }
        if let Some(stream) = self.streams.receiving.take() {
            if let Some(state) = self.streams.inputs.remove(&stream) {
                tracing::debug!(stream, "input abandoned");
                let stopped = StreamMessage::DownstreamStopped {
                    stream,
                    consumer: self.me.clone(),
                    error: Some(error.clone()),
                };
                self.outbox.push(&state.producer, Envelope::Stream(stopped));
            }
        }
    }
}

//---------------------------------------------------------------------------

impl<'activation, A: Actor> Activation<'activation, A> {
    /// Opens a stream from `producer` with the configured default credit.
    pub fn open_stream<C, I>(&mut self, producer: &ActorService, command: C, input: I) -> StreamId
    where
        C: Command<Reply = Streaming>,
        I: StreamInput<A>,
    {
        let max_len = self.core.system.config().stream_max_len;
        self.open_stream_with_credit(producer, command, max_len, input)
    }

    /// Opens a stream from `producer`, never asking for more than `max_len` items at once.
    pub fn open_stream_with_credit<C, I>(
        &mut self,
        producer: &ActorService,
        command: C,
        max_len: usize,
        input: I,
    ) -> StreamId
    where
        C: Command<Reply = Streaming>,
        I: StreamInput<A>,
    {
        let stream = self.core.streams.next_id;
        self.core.streams.next_id += 1;
        let processor = reply_fn(move |a: &mut A,
                                       t: &mut Activation<A>,
                                       result: Result<Box<dyn Any + Send>, Error>,
                                       from: &ActorService| {
            t.stream_opened(a, stream, result, from)
        });
        let handle = self.send_request_raw(producer,
                                           Box::new(command),
                                           TypeId::of::<C>(),
                                           std::any::type_name::<C>(),
                                           Some(StreamOpen { stream }),
                                           processor);
        tracing::trace!(stream, ?producer, max_len, "opening stream");
        self.core.streams.inputs.insert(stream, InputState {
            producer: producer.clone(),
            opening: Some(handle.id()),
            established: false,
            waiting: false,
            suspended: false,
            max_len: std::cmp::max(max_len, 1),
            item_type: TypeId::of::<Vec<I::Item>>(),
            item_name: std::any::type_name::<I::Item>(),
            handler: Some(Box::new(input)),
        });
        stream
    }

    fn stream_opened(
        &mut self,
        a: &mut A,
        stream: StreamId,
        result: Result<Box<dyn Any + Send>, Error>,
        from: &ActorService,
    ) -> ActorResult {
        let state = match self.core.streams.inputs.get_mut(&stream) {
            Some(s) => s,
            None => return Ok(()),
        };
        state.opening = None;
        match result {
            Ok(v) if (*v).is::<Streaming>() => {
                state.established = true;
                state.producer = from.clone();
                self.request_more(stream);
                Ok(())
            }
            Ok(_) => self.finish_input(a, stream, Some(Error::NotStreamReply), true),
            Err(e) => self.finish_input(a, stream, Some(e), false),
        }
    }

    fn request_more(&mut self, stream: StreamId) {
        let consumer = self.core.me.clone();
        if let Some(s) = self.core.streams.inputs.get_mut(&stream) {
            if s.established && !s.waiting && !s.suspended {
                s.waiting = true;
                let request = StreamMessage::Request {
                    stream,
                    consumer,
                    max_len: s.max_len,
                    item_type: s.item_type,
                    item_name: s.item_name,
                };
                self.core.outbox.push(&s.producer, Envelope::Stream(request));
            }
        }
    }

    /// Stops asking for data until [`resume_stream`][Self::resume_stream].
    pub fn suspend_stream(&mut self, stream: StreamId) {
        if let Some(s) = self.core.streams.inputs.get_mut(&stream) {
            s.suspended = true;
        }
    }

    pub fn resume_stream(&mut self, stream: StreamId) {
        if let Some(s) = self.core.streams.inputs.get_mut(&stream) {
            s.suspended = false;
        }
        self.request_more(stream)
    }

    /// Tells the producer everything received so far has been consumed.
    pub fn ack_stream(&mut self, stream: StreamId) {
        let consumer = self.core.me.clone();
        if let Some(s) = self.core.streams.inputs.get(&stream) {
            self.core.outbox.push(&s.producer, Envelope::Stream(StreamMessage::Ack { stream, consumer }));
        }
    }

    /// Stops consuming. The input's `on_close` runs after the current handler.
    pub fn close_stream(&mut self, stream: StreamId) {
        self.defer(move |a, t| t.finish_input(a, stream, None, true))
    }

    pub fn is_stream_open(&self, stream: StreamId) -> bool {
        self.core.streams.inputs.contains_key(&stream)
    }

    pub(crate) fn finish_input(
        &mut self,
        a: &mut A,
        stream: StreamId,
        error: Option<Error>,
        notify: bool,
    ) -> ActorResult {
        let state = match self.core.streams.inputs.remove(&stream) {
            Some(s) => s,
            None => return Ok(()),
        };
        tracing::trace!(stream, ?error, "input closed");
        if let Some(id) = state.opening {
            self.cancel_request(&RequestHandle::from_id(id));
        }
        if notify {
            let stopped = StreamMessage::DownstreamStopped {
                stream,
                consumer: self.core.me.clone(),
                error: error.clone(),
            };
            self.core.outbox.push(&state.producer, Envelope::Stream(stopped));
        }
        match state.handler {
            Some(mut h) => h.close(a, self, error),
            None => Ok(()),
        }
    }

    fn handle_stream_reply(
        &mut self,
        a: &mut A,
        stream: StreamId,
        producer: ActorService,
        data: Box<dyn Any + Send>,
        last: bool,
    ) -> ActorResult {
        let handler = match self.core.streams.inputs.get_mut(&stream) {
            Some(s) if s.established => {
                s.waiting = false;
                s.handler.take()
            }
            _ => {
                let stopped = StreamMessage::DownstreamStopped {
                    stream,
                    consumer: self.core.me.clone(),
                    error: Some(Error::BadStream),
                };
                self.core.outbox.push(&producer, Envelope::Stream(stopped));
                return Ok(());
            }
        };
        let mut handler = match handler {
            Some(h) => h,
            None => return Ok(()),
        };
        self.core.streams.receiving = Some(stream);
        let result = handler.deliver(a, self, data);
        self.core.streams.receiving = None;
        if let Some(s) = self.core.streams.inputs.get_mut(&stream) {
            s.handler = Some(handler);
        }
        result?;
        if last {
            let ack = StreamMessage::Ack { stream, consumer: self.core.me.clone() };
            self.core.outbox.push(&producer, Envelope::Stream(ack));
            self.finish_input(a, stream, None, false)
        } else {
            self.request_more(stream);
            Ok(())
        }
    }

    //-----------------------------------------------------------------------

    /// Takes on producing the stream the current command opens. The handler then answers
    /// [`Streaming`].
    pub fn accept_stream<O>(&mut self, output: O, options: OutputOptions) -> Result<OutputId, Error>
    where
        O: StreamOutput<A>,
    {
        let current = self.core.current.as_mut().ok_or(Error::BadStream)?;
        if current.accepted.is_some() {
            return Err(Error::BadStream);
        }
        let open = current.stream.as_ref().ok_or(Error::BadStream)?;
        let id = OutputId { stream: open.stream, consumer: current.promise.origin.clone() };
        current.accepted = Some(id.clone());
        tracing::trace!(?id, "stream accepted");
        self.core.streams.outputs.insert(id.clone(), OutputState {
            source: Some(Box::new(output)),
            options,
            credit: None,
            finished: false,
        });
        Ok(id)
    }

    /// Marks `id` as having data; it is flushed at the end of the current batch.
    pub fn flush_later(&mut self, id: &OutputId) {
        if self.core.streams.outputs.contains_key(id) {
            self.core.streams.ready.insert(id.clone());
        }
    }

    /// Ends the output, telling the consumer `error`. Runs after the current handler.
    pub fn close_output(&mut self, id: &OutputId, error: Option<Error>) {
        let id = id.clone();
        self.defer(move |a, t| t.close_output_now(a, &id, error, true))
    }

    pub fn is_output_open(&self, id: &OutputId) -> bool {
        self.core.streams.outputs.contains_key(id)
    }

    fn handle_stream_request(
        &mut self,
        a: &mut A,
        id: OutputId,
        max_len: usize,
        item_type: TypeId,
        item_name: &'static str,
    ) -> ActorResult {
        let matches = match self.core.streams.outputs.get_mut(&id) {
            None => {
                let stopped = StreamMessage::UpstreamStopped { stream: id.stream, error: Some(Error::BadStream) };
                self.core.outbox.push(&id.consumer, Envelope::Stream(stopped));
                return Ok(());
            }
            Some(o) => {
                let matches = o.source.as_ref().map_or(true, |s| s.batch_type() == item_type);
                if matches {
                    o.credit = Some(std::cmp::max(max_len, 1));
                }
                matches
            }
        };
        if matches {
            self.flush_output(a, &id)
        } else {
            self.close_output_now(a, &id, Some(Error::WrongTypeRequested(item_name)), true)
        }
    }

    pub(crate) fn flush_output(&mut self, a: &mut A, id: &OutputId) -> ActorResult {
        let (max_len, mut source) = match self.core.streams.outputs.get_mut(id) {
            Some(o) if !o.finished => match (o.credit, o.source.take()) {
                (Some(n), Some(s)) => (n, s),
                (_, s) => {
                    o.source = s;
                    return Ok(());
                }
            },
            _ => return Ok(()),
        };
        self.core.streams.pulling = Some(id.clone());
        let pulled = source.pull(a, self, id, max_len);
        self.core.streams.pulling = None;
        let o = match self.core.streams.outputs.get_mut(id) {
            Some(o) => o,
            None => return Ok(()),
        };
        o.source = Some(source);
        let (data, last) = match pulled {
            ErasedPull::Pending => return Ok(()),
            ErasedPull::Finished(error) => return self.close_output_now(a, id, error, true),
            ErasedPull::Data(data) => (data, false),
            ErasedPull::Last(data) => (data, true),
        };
        o.credit = None;
        if last && o.options.close_after_ack {
            o.finished = true;
        }
        let close_now = last && !o.options.close_after_ack;
        let reply = StreamMessage::Reply { stream: id.stream, producer: self.core.me.clone(), data, last };
        self.core.outbox.push(&id.consumer, Envelope::Stream(reply));
        if close_now {
            self.close_output_now(a, id, None, false)
        } else {
            Ok(())
        }
    }

    pub(crate) fn close_output_now(
        &mut self,
        a: &mut A,
        id: &OutputId,
        error: Option<Error>,
        notify: bool,
    ) -> ActorResult {
        let state = match self.core.streams.outputs.remove(id) {
            Some(s) => s,
            None => return Ok(()),
        };
        self.core.streams.ready.remove(id);
        tracing::trace!(?id, ?error, "output closed");
        if notify {
            let stopped = StreamMessage::UpstreamStopped { stream: id.stream, error: error.clone() };
            self.core.outbox.push(&id.consumer, Envelope::Stream(stopped));
        }
        match state.source {
            Some(mut s) => s.close(a, self, id, error.as_ref()),
            None => Ok(()),
        }
    }

    fn handle_stream_ack(&mut self, a: &mut A, id: OutputId) -> ActorResult {
        let mut source = match self.core.streams.outputs.get_mut(&id) {
            None => return Ok(()),
            Some(o) if o.finished => return self.close_output_now(a, &id, None, false),
            Some(o) => match o.source.take() {
                Some(s) => s,
                None => return Ok(()),
            },
        };
        self.core.streams.pulling = Some(id.clone());
        let result = source.ack(a, self, &id);
        self.core.streams.pulling = None;
        if let Some(o) = self.core.streams.outputs.get_mut(&id) {
            o.source = Some(source);
        }
        result
    }

    pub(crate) fn handle_stream(&mut self, a: &mut A, message: StreamMessage) -> ActorResult {
        match message {
            StreamMessage::Request { stream, consumer, max_len, item_type, item_name } =>
                self.handle_stream_request(a, OutputId { stream, consumer }, max_len, item_type, item_name),
            StreamMessage::Reply { stream, producer, data, last } =>
                self.handle_stream_reply(a, stream, producer, data, last),
            StreamMessage::Ack { stream, consumer } =>
                self.handle_stream_ack(a, OutputId { stream, consumer }),
            StreamMessage::UpstreamStopped { stream, error } =>
                self.finish_input(a, stream, error, false),
            StreamMessage::DownstreamStopped { stream, consumer, error } =>
                self.close_output_now(a, &OutputId { stream, consumer }, error, false),
        }
    }
}
