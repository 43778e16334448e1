//! Fleet Streaming Gateway
//!
//! Relays a fleet of RTSP cameras into Kinesis Video Streams, one relay
//! process per camera. The camera list lives in AWS AppConfig; the gateway
//! fetches it with instance-role credentials, launches a relay per camera
//! and restarts the whole fleet when triggered.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          camfleet-gateway                            │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                                                                      │
//! │  ┌──────────────────┐        ┌──────────────────┐                    │
//! │  │  HTTP API (axum) │        │  Poll loop       │                    │
//! │  │  apply / refresh │        │  version change  │                    │
//! │  └────────┬─────────┘        └────────┬─────────┘                    │
//! │           └────────────┬──────────────┘                              │
//! │                        ▼                                             │
//! │  ┌──────────────────────────────────┐                                │
//! │  │  GatewayRuntime (fleet lock)     │                                │
//! │  └───┬──────────────┬───────────┬───┘                                │
//! │      ▼              ▼           ▼                                    │
//! │  ┌─────────────┐ ┌──────────────┐ ┌───────────────────────────────┐  │
//! │  │ Credential  │ │ FleetConfig  │ │ ProcessSupervisor             │  │
//! │  │ Provider    │ │ Loader       │ │  cam-a ─▶ relay process       │  │
//! │  │ (IMDSv2)    │ │ (AppConfig)  │ │  cam-b ─▶ relay process       │  │
//! │  └─────────────┘ └──────────────┘ │  cam-c ─▶ relay process       │  │
//! │                                   └───────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod credentials;
pub mod error;
pub mod fleet;
pub mod loader;
pub mod metrics;
pub mod runtime;
pub mod sigv4;
pub mod supervisor;

pub use camfleet_capacity_planner::{select_tier, CapacityError, CapacityTier, TierTable};
pub use error::{Error, Result};
pub use fleet::{CameraStreamSpec, FleetConfiguration};
pub use runtime::{FleetStatus, GatewayRuntime, RetryPolicy};
