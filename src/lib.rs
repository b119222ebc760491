//! `race-core`: a configurable runtime for composing concurrent and
//! distributed simulation/data-processing applications out of message
//! passing parts.
//!
//! A process hosts one [`runtime::Runtime`] built from a [`config::Config`].
//! The Runtime wires together:
//!
//! - [`clock`] — a scaled, pausable notion of time every Entity schedules
//!   against.
//! - [`bus`] — in-process publish/subscribe over [`channel::Channel`] paths.
//! - [`entity`] — the unit of concurrent execution, driven through a
//!   lifecycle by a [`supervisor::Supervisor`].
//! - [`topic`] — on-demand flow control layered over the Bus, so a Provider
//!   only produces while somebody holds a demand record for its
//!   [`topic::ChannelTopic`].
//! - [`remote`] — cross-process Bus bridging between peer Runtimes.
//!
//! Applications implement [`entity::Entity`], register a constructor against
//! an implementation identifier, and call [`runtime::Runtime::build`] with a
//! parsed [`config::Config`]. The `race` binary is a thin CLI driver around
//! the same surface.

pub mod bus;
pub mod channel;
pub mod clock;
pub mod config;
pub mod entity;
pub mod error;
pub mod remote;
pub mod runtime;
pub mod supervisor;
pub mod topic;

pub use entity::{Entity, EntityContext, EntityHandle};
pub use error::RaceError;
pub use runtime::{EntityFactory, Runtime};
