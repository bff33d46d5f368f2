//! The runtime's error taxonomy.

/// Responses to events must have type `ActorResult`.
pub type ActorResult = Result<(), Error>;

/// Every failure the runtime reports, either as an error reply, as a close reason for a
/// stream, or as the terminal error of an actor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The target actor has already terminated.
    #[error("actor is dead")]
    ActorDead,

    /// The target handle was never bound to an actor.
    #[error("actor handle is null")]
    ActorNull,

    /// The request was explicitly cancelled.
    #[error("cancelled")]
    Cancelled,

    /// No handler is registered for this command type.
    #[error("unknown command: {0}")]
    UnknownCommand(&'static str),

    /// A stream was accepted outside of a stream-opening command.
    #[error("bad stream")]
    BadStream,

    /// A stream-opening command was answered with something other than a stream.
    #[error("reply does not open a stream")]
    NotStreamReply,

    /// A broadcaster's drop policy evicted this consumer.
    #[error("stream consumer is too slow")]
    StreamConsumerSlow,

    /// The stream's source cannot produce the requested item type.
    #[error("wrong item type requested: {0}")]
    WrongTypeRequested(&'static str),

    /// The requested offset is no longer (or not yet) retained.
    #[error("offset {0} is out of range")]
    OffsetOutOfRange(u64),

    /// Waiting on something that can never happen.
    #[error("not gonna happen")]
    NotGonnaHappen,

    #[error("not found")]
    NotFound,

    #[error("already registered")]
    AlreadyRegistered,

    /// A promise or pause was requested while no command was being handled.
    #[error("no command is being processed")]
    NoCurrentCommand,

    /// A reply payload did not have the type the requester expected.
    #[error("reply has unexpected type, expected {0}")]
    ReplyType(&'static str),

    /// A handler panicked.
    #[error("panic: {message}")]
    Panic { message: String, backtrace: String },

    /// An application-level failure.
    #[error("{0}")]
    Message(String),
}

impl Error {
    pub fn msg<S: Into<String>>(message: S) -> Self {
        Error::Message(message.into())
    }

    /// Converts the payload of a caught panic into an [`Error::Panic`].
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Error::Panic {
            message,
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        }
    }
}

impl From<&str> for Error {
    fn from(v: &str) -> Self {
        Error::msg(v)
    }
}

impl From<String> for Error {
    fn from(v: String) -> Self {
        Error::Message(v)
    }
}

impl From<std::io::Error> for Error {
    fn from(v: std::io::Error) -> Self {
        Error::msg(format!("{}", v))
    }
}
