//! # Equipment Interface
//!
//! This module defines the structures exchanged with equipment drivers.

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

pub mod depth;
pub mod fc;
