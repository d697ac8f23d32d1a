// mcpd-daemon library entry point: the MCP execution core.

pub mod cache;
pub mod config;
pub mod engine;
pub mod entities;
pub mod events;
pub mod registry;
pub mod rpc;
pub mod runtime;
pub mod store;
