pub mod assets;
pub mod audio;
pub mod classifier;
pub mod config;
pub mod domain;
pub mod download;
pub mod error;
pub mod inat;
pub mod output;
pub mod pipeline;
pub mod workspace;
