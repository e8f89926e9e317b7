pub mod api;
pub mod config;
pub mod downloader;
pub mod events;
pub mod installer;
pub mod notify;
pub mod resume;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod update;
