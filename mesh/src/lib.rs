//! Mesh coordination for huddle
//!
//! This crate ties the pieces together: a [`MeshCoordinator`] actor that
//! joins the signaling endpoint, discovers peers, calls them, answers their
//! calls and watches who is speaking, driven through a [`MeshHandle`]. The
//! [`Roster`] turns the published events into a participant list.

pub mod commands;
pub mod coordinator;
pub mod handle;
pub mod roster;

// Re-export commonly used types
pub use commands::MeshCommand;
pub use coordinator::{MeshCoordinator, MeshSnapshot};
pub use handle::MeshHandle;
pub use roster::{Participant, Roster};
