//! Common types shared across the event relay components.

#![warn(clippy::pedantic)]

/// Module for identifier newtypes
pub mod types;

/// Module for the explicit caller context
pub mod context;

/// Module for the event envelope and its codec
pub mod envelope;
