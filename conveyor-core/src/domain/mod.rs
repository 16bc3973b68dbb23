//! Core domain types
//!
//! This module contains the core domain structures used across Conveyor services.
//! These types represent the fundamental business entities and are shared between
//! orchestrator (for persistence and dispatch) and runners (for execution).

pub mod job;
pub mod runner;
pub mod trace;
