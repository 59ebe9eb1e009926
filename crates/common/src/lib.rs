//! Shared types, error definitions, and helpers used across all warden crates.

pub mod error;
pub mod types;

pub use {
    error::{Error, FromMessage, Result, WardenError},
    types::{ContainerMode, IpcContext, Provider, ToolOutput, truncate_chars},
};
