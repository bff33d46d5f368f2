//! Services built on the troupe runtime's public actor API.

pub mod registry;
pub mod restart;
