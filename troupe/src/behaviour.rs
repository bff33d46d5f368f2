//! Behaviour tables: what an actor answers, and how.

use super::actor::Activation;
use super::actor::Actor;
use super::actor::LifecycleState;
use super::command::PromiseId;
use super::error::ActorResult;
use super::error::Error;
use super::stream::StreamOpen;

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

/// A request that expects a reply of type [`Command::Reply`].
pub trait Command: Any + Send {
    type Reply: Any + Send;
}

/// What a command handler produced.
#[derive(Debug)]
pub enum Answer<R> {
    /// Reply now.
    Value(R),
    /// The handler made a promise, paused the command or delegated it; the reply comes later.
    Pending,
}

impl<R> From<R> for Answer<R> {
    fn from(value: R) -> Self {
        Answer::Value(value)
    }
}

/// The outcome of a command filter.
pub enum Filtered {
    /// Continue with the next filter, or the handler.
    Pass(Incoming),
    /// The filter took the command (paused or delegated it).
    Held,
}

/// A command in flight, before its payload has been handed to a typed handler.
pub struct Incoming {
    pub(crate) promise: PromiseId,
    pub(crate) payload: Box<dyn Any + Send>,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    /// How many filters remain to run; `None` means the whole chain.
    pub(crate) next_filter: Option<usize>,
    /// The filter currently looking at the command.
    pub(crate) at_filter: Option<usize>,
    /// Set once the command has been paused and resumed.
    pub(crate) resumed: bool,
    pub(crate) stream: Option<StreamOpen>,
}

impl Incoming {
    pub(crate) fn new<C: Command>(promise: PromiseId, command: C) -> Self {
        Incoming {
            promise,
            payload: Box::new(command),
            type_id: TypeId::of::<C>(),
            type_name: std::any::type_name::<C>(),
            next_filter: None,
            at_filter: None,
            resumed: false,
            stream: None,
        }
    }

    pub fn promise_id(&self) -> &PromiseId {
        &self.promise
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<C: Command>(&self) -> bool {
        self.type_id == TypeId::of::<C>()
    }

    pub fn command<C: Command>(&self) -> Option<&C> {
        self.payload.downcast_ref::<C>()
    }

    pub fn command_mut<C: Command>(&mut self) -> Option<&mut C> {
        self.payload.downcast_mut::<C>()
    }

    /// Swaps the payload for `command`, which may be of a different type.
    pub fn replace<C: Command>(&mut self, command: C) {
        self.payload = Box::new(command);
        self.type_id = TypeId::of::<C>();
        self.type_name = std::any::type_name::<C>();
    }

    pub fn is_resumed(&self) -> bool {
        self.resumed
    }
}

impl std::fmt::Debug for Incoming {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "#<Incoming {} {:?}>", self.type_name, self.promise)
    }
}

pub(crate) type CommandFn<A> = Arc<
    dyn Fn(&mut A, &mut Activation<A>, Box<dyn Any + Send>) -> Result<Answer<Box<dyn Any + Send>>, Error>
        + Send + Sync>;
pub(crate) type MessageFn<A> =
    Arc<dyn Fn(&mut A, &mut Activation<A>, Box<dyn Any + Send>) -> ActorResult + Send + Sync>;
pub(crate) type FilterFn<A> =
    Arc<dyn Fn(&mut A, &mut Activation<A>, Incoming) -> Result<Filtered, Error> + Send + Sync>;

fn command_fn<A, F>(f: F) -> CommandFn<A>
where
    F: Fn(&mut A, &mut Activation<A>, Box<dyn Any + Send>) -> Result<Answer<Box<dyn Any + Send>>, Error>
        + Send + Sync + 'static,
{
    Arc::new(f)
}

fn message_fn<A, F>(f: F) -> MessageFn<A>
where
    F: Fn(&mut A, &mut Activation<A>, Box<dyn Any + Send>) -> ActorResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// An actor's table of handlers, keyed by the runtime type of what arrives.
///
/// Filters run before every command handler, most recently added first. Commands with no
/// handler are answered with [`Error::UnknownCommand`]; messages with no handler are dropped.
pub struct Behaviour<A> {
    commands: HashMap<TypeId, (&'static str, CommandFn<A>)>,
    messages: HashMap<TypeId, (&'static str, MessageFn<A>)>,
    pub(crate) filters: Vec<FilterFn<A>>,
}

impl<A: Actor> Behaviour<A> {
    pub fn new() -> Self {
        Behaviour {
            commands: HashMap::new(),
            messages: HashMap::new(),
            filters: Vec::new(),
        }
    }

    pub fn on_command<C, F>(mut self, handler: F) -> Self
    where
        C: Command,
        F: Fn(&mut A, &mut Activation<A>, C) -> Result<Answer<C::Reply>, Error> + Send + Sync + 'static,
    {
        let name = std::any::type_name::<C>();
        let f = command_fn(move |a: &mut A, t: &mut Activation<A>, payload: Box<dyn Any + Send>| {
            let command = payload.downcast::<C>().map_err(|_| Error::UnknownCommand(name))?;
            Ok(match handler(a, t, *command)? {
                Answer::Value(r) => Answer::Value(Box::new(r) as Box<dyn Any + Send>),
                Answer::Pending => Answer::Pending,
            })
        });
        self.commands.insert(TypeId::of::<C>(), (name, f));
        self
    }

    pub fn on_message<M, F>(mut self, handler: F) -> Self
    where
        M: Any + Send,
        F: Fn(&mut A, &mut Activation<A>, M) -> ActorResult + Send + Sync + 'static,
    {
        let name = std::any::type_name::<M>();
        let f = message_fn(move |a: &mut A, t: &mut Activation<A>, payload: Box<dyn Any + Send>| {
            match payload.downcast::<M>() {
                Ok(m) => handler(a, t, *m),
                Err(_) => Ok(()),
            }
        });
        self.messages.insert(TypeId::of::<M>(), (name, f));
        self
    }

    /// Appends a filter. It runs before the filters added earlier.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&mut A, &mut Activation<A>, Incoming) -> Result<Filtered, Error> + Send + Sync + 'static,
    {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn has_handlers(&self) -> bool {
        !self.commands.is_empty() || !self.messages.is_empty()
    }

    pub fn command_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.commands.values().map(|(n, _)| *n).collect();
        names.sort_unstable();
        names
    }

    pub fn message_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.messages.values().map(|(n, _)| *n).collect();
        names.sort_unstable();
        names
    }

    pub(crate) fn command_handler(&self, type_id: &TypeId) -> Option<CommandFn<A>> {
        self.commands.get(type_id).map(|(_, h)| Arc::clone(h))
    }

    pub(crate) fn message_handler(&self, type_id: &TypeId) -> Option<MessageFn<A>> {
        self.messages.get(type_id).map(|(_, h)| Arc::clone(h))
    }
}

impl<A: Actor> Default for Behaviour<A> {
    fn default() -> Self {
        Self::new()
    }
}

//---------------------------------------------------------------------------
// Commands every actor answers.

/// Lists the commands and messages an actor handles.
#[derive(Debug, Clone)]
pub struct Describe;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub name: String,
    pub commands: Vec<&'static str>,
    pub messages: Vec<&'static str>,
}

impl Command for Describe {
    type Reply = Description;
}

/// Reports an actor's bookkeeping counters.
#[derive(Debug, Clone)]
pub struct Status;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: LifecycleState,
    pub commands: usize,
    pub messages: usize,
    pub filters: usize,
    pub inflight: usize,
    pub promises: usize,
    pub inputs: usize,
    pub outputs: usize,
    pub links: usize,
}

impl Command for Status {
    type Reply = StatusReport;
}

impl<'activation, A: Actor> Activation<'activation, A> {
    pub fn describe(&self) -> Description {
        let (commands, messages) = match &self.core.behaviour {
            Some(b) => (b.command_names(), b.message_names()),
            None => (Vec::new(), Vec::new()),
        };
        Description { name: self.core.me.name().to_owned(), commands, messages }
    }

    pub fn status(&self) -> StatusReport {
        let b = self.core.behaviour.as_ref();
        StatusReport {
            state: self.core.state,
            commands: b.map_or(0, |b| b.commands.len()),
            messages: b.map_or(0, |b| b.messages.len()),
            filters: b.map_or(0, |b| b.filters.len()),
            inflight: self.core.inflight.len(),
            promises: self.core.promises.len(),
            inputs: self.core.streams.input_count(),
            outputs: self.core.streams.output_count(),
            links: self.core.links.len(),
        }
    }
}
