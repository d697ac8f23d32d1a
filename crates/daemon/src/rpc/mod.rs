// MCP message handling: JSON-RPC methods mapped onto the core. Framing is
// left to the transport.

pub mod methods;
