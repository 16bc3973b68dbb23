//! Conveyor Orchestrator
//!
//! Job dispatch and admission control for a fleet of polling runners.
//!
//! - `admission`: bounded concurrency for the eligible-jobs query
//! - `repository`: job and runner persistence (Postgres or in-memory)
//! - `lock`: short-lived per-job dispatch leases
//! - `service`: dispatcher, trace sink, reaper and administration logic
//! - `api`: axum HTTP surface

pub mod admission;
pub mod api;
pub mod config;
pub mod db;
pub mod events;
pub mod lock;
pub mod metrics;
pub mod repository;
pub mod service;
pub mod storage;
