// mcpd-common: shared types and protocol definitions for the mcpd workspace

pub mod path;
pub mod protocol;
pub mod types;
