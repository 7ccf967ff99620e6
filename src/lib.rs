// Girder - concurrency primitives and a managed WebSocket server for tokio
//
// This crate re-exports the member crates behind cargo features.

// Re-export optional crates
#[cfg(feature = "sync")]
pub use girder_sync as sync;

#[cfg(feature = "websocket")]
pub use girder_websocket as websocket;

// Prelude for common imports
pub mod prelude {
    #[cfg(feature = "sync")]
    pub use girder_sync::{
        Pool, PoolError, ScheduleOptions, Semaphore, SemaphoreGuard, schedule,
    };

    #[cfg(feature = "websocket")]
    pub use girder_websocket::{
        CloseCause, CloseCode, CloseFrame, Connection, ConnectionHandle, ConnectionState,
        Message, Options, WebSocketError, WebSocketHandler, WebSocketResult, WebSocketServer,
    };
}
