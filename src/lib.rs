// Library interface for testing

pub mod buffer;
pub mod config;
pub mod constants;
pub mod db;
pub mod hls;
pub mod ipfs;
pub mod playlist;
pub mod queries;
pub mod record;
pub mod schedule;
pub mod schema;
pub mod signal;
pub mod streaming;
pub mod uploader;
