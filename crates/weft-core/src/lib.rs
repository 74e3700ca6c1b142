//! Core weft library (thread engine, providers, tools, persistence).

pub mod auth;
pub mod config;
pub mod conversations;
pub mod core;
pub mod images;
pub mod logging;
pub mod prompts;
pub mod providers;
pub mod tools;
