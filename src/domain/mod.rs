//! Core domain types for the volley dispatch engine.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Batches and batch snapshots
//! - The item typestate machine and its transitions

pub mod batch;
pub mod item;
