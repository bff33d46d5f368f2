#![doc = include_str!("../README.md")]

pub mod actor;
pub mod behaviour;
pub mod broadcaster;
pub mod command;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod stream;
pub mod system;
pub mod tracer;

#[doc(inline)]
pub use tracer::convenient_logging;

#[doc(inline)]
pub use actor::Activation;
#[doc(inline)]
pub use actor::Actor;
#[doc(inline)]
pub use actor::ActorService;
#[doc(inline)]
pub use behaviour::Answer;
#[doc(inline)]
pub use behaviour::Behaviour;
#[doc(inline)]
pub use behaviour::Command;
#[doc(inline)]
pub use error::ActorResult;
#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use system::System;
