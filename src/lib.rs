#![warn(clippy::all)]
#![allow(clippy::module_inception)]
#![allow(clippy::new_without_default)]

pub mod client;
pub mod encoding;
pub mod error;
pub mod protocol;
pub mod raft;
pub mod session;
pub mod storage;

pub use client::{Client, Consistency, Options};
pub use error::{Error, Result};
pub use raft::Server;
pub use session::{ApplyContext, Registry, StateMachine};
