pub mod client;
pub mod config;
pub mod groups;
pub mod metadata;
pub mod sink;
pub mod source;
