//! # Map
//!
//! This module implements the [`DistField`] type, a fixed size voxel grid centred on the vehicle
//! storing occupancy and the distance to the nearest obstacle. The grid is a ring buffer: moving
//! the volume only clears the planes of voxels which enter it, the rest of the data stays where it
//! is in memory and is re-addressed through the volume's offset.

// ------------------------------------------------------------------------------------------------
// MODS
// ------------------------------------------------------------------------------------------------

/// Implements the [`DistField`] type
mod dist_field;

/// Voxel traversal along rays
mod raycast;

// ------------------------------------------------------------------------------------------------
// EXPORTS
// ------------------------------------------------------------------------------------------------

pub use dist_field::{
    DistField, DistFieldError, DistFieldParams, Distance, InsertReport, OccupiedSnapshot, Voxel,
};
