pub mod assembly;
pub mod chunk_receiver;
pub mod error;
pub mod lifecycle;
pub mod reaper;
pub mod session_registry;
pub mod storage;
pub mod upload_service;
