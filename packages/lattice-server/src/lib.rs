//! Lattice server — the coordination plane of the Lattice data grid.
//!
//! Everything that turns the `lattice-core` data structures into a
//! running, replicated service lives here:
//!
//! - **Sessions** ([`session`]): auth state machine, op pipeline
//!   (rate limit, interceptors, policy, resolvers, write concern),
//!   broadcast
//! - **Journal** ([`journal`]): capped mutation ring with a durable tail
//! - **Executors** ([`executor`]): key-striped, backpressured work queues
//! - **Scheduler** ([`scheduler`]): cooperative tasklets for long queries
//! - **Writer** ([`writer`]): per-connection write coalescing
//! - **Sync** ([`sync`]): Merkle anti-entropy responder and initiator
//! - **Cluster** ([`cluster`]): membership, partition map, fan-out,
//!   handoff
//! - **Queries** ([`query`]): planner, indexes, cursor pagination
//! - **Security** ([`security`], [`auth`], [`resolver`]): policies,
//!   authenticators, conflict resolvers
//! - **Storage** ([`storage`]): the adapter seam plus retry queue
//! - **Bootstrap** ([`node`]): env-free wiring of all of the above

pub mod auth;
pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod journal;
pub mod limiter;
pub mod logging;
pub mod maps;
pub mod network;
pub mod node;
pub mod query;
pub mod resolver;
pub mod scheduler;
pub mod security;
pub mod session;
pub mod storage;
pub mod sync;
pub mod writer;

pub use auth::{AuthError, Authenticator, JwtAuthenticator, StaticTokenAuthenticator};
pub use cluster::{ClusterCoordinator, ClusterEvent, ClusterTransport, HandoffPlan};
pub use config::NodeConfig;
pub use error::ServerError;
pub use journal::{EventJournal, JournalEvent, JournalStore};
pub use maps::MapRegistry;
pub use node::{Collaborators, LatticeNode};
pub use query::QueryEngine;
pub use resolver::{ConflictResolvers, ExpressionResolver, Resolution, ResolverEvaluator};
pub use security::{Action, Policy, PolicyEngine};
pub use session::{OpInterceptor, OpOutcome, OpPipeline, SessionHandler, SessionRegistry};
pub use storage::{MemoryStorageAdapter, StorageAdapter, StorageError};
pub use sync::{SyncResponder, SyncSession};
