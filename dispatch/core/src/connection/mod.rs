//! Connections
//!
//! Pooled provider connections and the lifecycle state machine each of them
//! carries.

pub mod pool;
pub mod state;

pub use pool::{ConnectionId, ConnectionPool, PoolStats, PooledConnection};
pub use state::{
    ConnectionState, ConnectionStateMachine, ConnectionStateRecord, TransitionMetadata,
};
