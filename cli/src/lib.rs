//! relaybox CLI - build, inspect and run relay images.

pub mod commands;
pub mod output;
