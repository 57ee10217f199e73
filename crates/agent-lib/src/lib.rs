//! Event pipeline for autonomous container remediation
//!
//! This crate provides:
//! - Typed event contracts and the bus they travel on
//! - The coordination store with atomic claim-with-TTL
//! - The Monitor, Analyzer, Responder, Alert and Observability stages
//! - A generic stage runner, health tracking and the coordinator service

pub mod alert;
pub mod analyzer;
pub mod bus;
pub mod coordinator;
pub mod events;
pub mod health;
pub mod http;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod responder;
pub mod runner;
pub mod store;


pub use events::{Channel, Envelope, Event, Inbound};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{EventLogger, ObservabilityHandler, PipelineMetrics};
pub use runner::{Emitter, RunnerStats, StageHandler, StageRunner, SubscribedRunner};
