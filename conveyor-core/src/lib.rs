//! Conveyor Core
//!
//! Core types and abstractions for the Conveyor job dispatch system.
//!
//! This crate contains:
//! - Domain types: Core business entities (Job, Runner, TraceEntry)
//! - DTOs: Data transfer objects for the runner-facing protocol

pub mod domain;
pub mod dto;
