//! Sleepgate - A reverse proxy that puts a docker compose project to sleep
//!
//! This library provides an activity-driven gateway that:
//! - Forwards HTTP traffic to a single target service of the project
//! - Starts the project's containers when traffic arrives while it is down
//! - Serves a self-refreshing loading page until the project is ready
//! - Checks readiness through container state, healthchecks and an HTTP probe
//! - Stops every container of the project after a configurable idle period
//! - Tunnels WebSocket upgrades and uses connection pooling to the target

pub mod assets;
pub mod config;
pub mod docker;
pub mod error;
pub mod gateway;
pub mod monitor;
pub mod orchestrator;
pub mod pool;
pub mod proxy;
pub mod readiness;
pub mod state;
