pub mod api;
pub mod archive;
pub mod config;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod pipeline;
pub mod table;
pub mod types;
