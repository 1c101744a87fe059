//! The per-service traffic plane: pause gating, rollout cohort selection,
//! health probing, upstream targets with inflight tracking and drains, load
//! balancing across writers and readers, and the service middleware chain.
pub mod balancer;
pub mod buffer;
pub mod client;
pub mod error_pages;
pub mod health;
pub mod pause;
pub mod rollout;
pub mod service;
pub mod target;
