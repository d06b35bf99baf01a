// SPDX-License-Identifier: MIT OR Apache-2.0

//! # dbcluster
//!
//! A master/slave aware database cluster client: one logical handle over
//! multiple physical endpoints, splitting traffic between a write pool
//! (masters) and a read pool (slaves).
//!
//! ## Features
//!
//! - **Round-robin balancing** — strict rotation over each pool's healthy
//!   endpoints
//! - **Failure quarantine** — transient failures move an endpoint out of
//!   rotation and retry the call on another node
//! - **Background recovery** — a per-pool health checker probes quarantined
//!   endpoints and reinstates the ones that recovered
//! - **Galera aware** — optional `wsrep_ready` gating for MySQL-family
//!   clusters
//! - **Pluggable drivers** — any backend behind the [`driver::Driver`] /
//!   [`driver::Connection`] traits, resolved by name from a registry
//! - **Async-first** — built on `tokio`
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dbcluster::{connect_master_slaves, ClusterOptions, Value};
//!
//! # async fn example() -> dbcluster::Result<()> {
//! let (cluster, errors) = connect_master_slaves(
//!     "postgres",
//!     &["postgres://app@10.0.0.1/orders", "postgres://app@10.0.0.2/orders"],
//!     &["postgres://app@10.0.1.1/orders", "postgres://app@10.0.1.2/orders"],
//!     ClusterOptions::new(),
//! )
//! .await?;
//! assert!(errors.iter().all(Option::is_none));
//!
//! // Writes land on a master, reads on a slave.
//! cluster
//!     .exec("INSERT INTO orders (sku) VALUES ($1)", &[Value::from("A-1")])
//!     .await?;
//! let rows = cluster.query("SELECT * FROM orders", &[]).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! - [`cluster`] — The cluster handle, dispatch and retry logic
//! - [`balancer`] — Per-pool rotation, quarantine and health checking
//! - [`driver`] — Driver traits, registry, values and rows
//! - [`bind`] — Placeholder rebinding, named parameters, `IN` expansion
//! - [`error`] — Error types and transient-failure classification
//! - [`testkit`] — In-memory driver for tests

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod balancer;
pub mod bind;
pub mod cluster;
pub mod driver;
pub mod error;
pub mod testkit;

pub use balancer::{Balancer, Endpoint, DEFAULT_HEALTH_CHECK_PERIOD};
pub use bind::{expand_in, named, rebind};
pub use cluster::{connect_master_slaves, Cluster, ClusterOptions, Transaction};
pub use driver::{
    register, Connection, Driver, ExecResult, FromRow, FromValue, Placeholder, PoolStats, Row,
    Value,
};
pub use error::{parse_error, Error, Result};
