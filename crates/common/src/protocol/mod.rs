pub mod events;
pub mod jsonrpc;
pub mod methods;
