pub mod config;
pub mod db;
pub mod fetch;
pub mod invoice;
pub mod jobs;
pub mod notify;
pub mod render;
pub mod store;
