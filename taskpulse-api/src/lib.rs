// TaskPulse API Library
//
// HTTP and WebSocket adapter over the realtime hub

pub mod http;

// Re-export commonly used types
pub use http::{create_router, AppState};
