pub mod cache;
pub mod cachified;
pub mod cluster;
pub mod config;
pub mod content;
pub mod error;
pub mod github;
pub mod logger;
pub mod og;
pub mod posts;
pub mod rss;
pub mod server;
pub mod views;
mod query_string;
mod test_data;
mod text_utils;
