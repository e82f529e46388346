//! Race shows: entities, phases and the phase controller.

pub mod controller;
pub mod entity;
pub mod phase;
pub mod state;
