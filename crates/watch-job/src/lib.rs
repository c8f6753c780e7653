//! Watch Job
//!
//! Lifecycle orchestration of resource watches across a changing set of
//! remote Kubernetes clusters.
//!
//! A [`WatchJob`] binds a fixed list of [`WatchResource`]s (object type plus
//! reconciler) to every cluster it is asked to watch. For each cluster it
//! launches one watch session through a pluggable [`ClusterWatchEngine`],
//! arbitrates early failure within a short grace period, and reports the
//! outcome to registered hooks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use watch_job::{ClusterInfo, ConnectionDefaults, EngineFactory, HookHandler, WatchJob, WatchResource};
//!
//! # async fn example(factory: Arc<dyn EngineFactory>, resources: Vec<WatchResource>) -> Result<(), watch_job::WatchJobError> {
//! let mut job = WatchJob::new(ConnectionDefaults::default(), resources, factory)?;
//! job.add_hook_handler(
//!     HookHandler::new()
//!         .on_succeeded(|cluster| println!("watching {}", cluster.key))
//!         .on_failed(|cluster, err| eprintln!("{} failed: {err}", cluster.key)),
//! );
//!
//! let edge = ClusterInfo::new("https://10.0.0.12:6443", "token", "edge-1");
//! job.start_watch(&[edge]).await?;
//! job.stop_all();
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - **Orchestrator**: [`job`] owns the session, config and cluster caches
//! - **Hooks**: [`hook`] succeeded / failed / stopped callbacks
//! - **Connection config**: [`config`] per-cluster derivation from defaults
//! - **Engine seams**: [`engine`] and [`reconcile`] traits implemented by callers
//! - **Event mapping**: [`handler`] and [`reference`] resolve controller owners

pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod hook;
pub mod job;
mod keyed_lock;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod reconcile;
pub mod reference;
pub mod resource;

pub use cluster::ClusterInfo;
pub use config::{ConnectionConfig, ConnectionDefaults};
pub use engine::{ClusterWatchEngine, EngineFactory};
pub use error::{EngineError, ReconcileError, WatchJobError};
pub use handler::{ControllerOwner, EnqueueRequestForController};
pub use hook::{HookHandler, HookKind};
pub use job::{DEFAULT_GRACE_PERIOD, SessionInfo, WatchJob};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockBehavior, MockEngineFactory};
pub use reconcile::{ReconcileResult, Reconciler, Request};
pub use reference::{MULTICLUSTER_CONTROLLER_ANNOTATION, MulticlusterReference};
pub use resource::{MappingMode, WatchOptions, WatchResource};
