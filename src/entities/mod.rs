pub mod prelude;

pub mod upload_chunks;
pub mod upload_sessions;
