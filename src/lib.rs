pub mod cli;
pub mod config;
pub mod entities;
pub mod error;
pub mod render;
pub mod sources;
pub mod transform;
