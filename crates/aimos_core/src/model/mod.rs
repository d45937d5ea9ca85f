//! Domain model for the memory core.
//!
//! # Responsibility
//! - Define the atom, snapshot and BTSM records shared by every layer.
//! - Keep validation rules next to the types they protect.
//!
//! # Invariants
//! - Atoms and snapshots are immutable once created.
//! - Cross-component references are string/UUID ids only.

pub mod atom;
pub mod mpd;
pub mod snapshot;
pub mod time;
