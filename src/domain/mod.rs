//! Domain models - core types, geometry and the alert state machine
//!
//! - `types` - AlertLevel, Role, Location, crosswalk geometries
//! - `geo` - haversine distance and bearings
//! - `alert` - Trigger and the AlertMachine that applies them

pub mod alert;
pub mod geo;
pub mod types;

pub use alert::{AlertMachine, Transition, Trigger};
pub use types::{AlertLevel, CrosswalkId, DangeredCrosswalk, Location, Role};
