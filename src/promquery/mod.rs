//! Metric Query Polling
//!
//! Failure conditions are evaluated against live metric queries. This module
//! owns everything between a query string and the stream of samples a
//! condition evaluator reads:
//!
//! - [`MetricsBackend`]: instant-query interface, implemented for Prometheus
//!   by [`PrometheusClient`]. A scripted backend for tests lives in `mock`
//!   behind the `test-util` feature.
//! - [`QueryPubSub`]: one background poller per distinct query string, fanning
//!   samples out to every [`Subscription`] on that query
//! - [`queries`]: templates for well-known queries such as mesh success rate
//!
//! # Example
//!
//! ```ignore
//! let backend = Arc::new(PrometheusClient::new("http://prometheus:9090", timeout)?);
//! let pubsub = QueryPubSub::new(backend, Duration::from_secs(5), root_token);
//!
//! let mut sub = pubsub.subscribe("scalar(up)").await;
//! while let Some(value) = sub.recv().await {
//!     println!("sampled {}", value);
//! }
//! pubsub.unsubscribe(sub).await;
//! ```

pub mod client;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod pubsub;
pub mod queries;

pub use client::{MetricsBackend, PrometheusClient, QueryError, QueryValue, Sample};
#[cfg(any(test, feature = "test-util"))]
pub use mock::ScriptedBackend;
pub use pubsub::{QueryPubSub, Subscription, SUBSCRIBER_BUFFER};

/// Default interval between two executions of the same query
pub const DEFAULT_POLLING_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
