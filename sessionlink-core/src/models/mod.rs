pub mod id;
pub mod video_call;

pub use id::{generate_id, CallId, ConnectionId};
pub use video_call::{normalize_connections, VideoCall};
