//! Command implementations

pub mod cooldown;
pub mod keys;
