//! Data Transfer Objects for inter-service communication
//!
//! This module contains DTOs exchanged between the orchestrator, runners and
//! job producers. DTOs are lightweight representations of domain entities
//! optimized for network transfer.

pub mod job;
pub mod runner;
pub mod trace;
