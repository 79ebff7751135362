// src/core/signal.rs

//! Integer signal numbers understood by instance runtimes.

/// Ordinary termination, delivered on `Kill` and group shutdown.
pub const SHUT_DOWN_SIGNAL: i32 = 15;

/// Group-triggered death: the enclosing group failed and every member must
/// exit together.
pub const GROUP_EXIT_SIGNAL: i32 = 64;

/// Kill one instance and drop its invoke-order state.
pub const KILL_INSTANCE: i32 = 2;

/// Kill one group member instance.
pub const KILL_GROUP_INSTANCE: i32 = 3;

/// Synchronous variant of [`KILL_INSTANCE`].
pub const KILL_INSTANCE_SYNC: i32 = 4;

/// Kill every instance owned by the caller.
pub const KILL_ALL_INSTANCES: i32 = 5;

/// Initiates the shared-memory handshake; the reply carries a queue handle.
pub const ACCELERATE: i32 = 100;
