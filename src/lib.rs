//! Crosswalk guard library
//!
//! Exposes the participant and relay building blocks for the binaries and
//! integration tests.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
