//! Services - business logic and state management
//!
//! This module contains the core business logic services:
//! - `participant` - Event loop owning the alert level of one client
//! - `accuracy_gate` - Drops the level when location fixes get too coarse
//! - `watching` - Phone-usage detector and its calibration
//! - `visual` - Camera crosswalk classifier hysteresis
//! - `relevance` - Nearby crosswalk lookup, caching and selection
//! - `presence` - Room membership and critical tracking
//! - `timers` - Cancellable per-concern timers
//! - `relay` - Server side rooms and distance-based notifications

pub mod accuracy_gate;
pub mod participant;
pub mod presence;
pub mod relay;
pub mod relevance;
pub mod timers;
pub mod visual;
pub mod watching;

// Re-export commonly used types
pub use participant::{Participant, ParticipantEvent, Snapshot};
pub use presence::PresenceCoordinator;
pub use relay::{run_relay, RoomRegistry};
pub use relevance::RelevanceEngine;
