// MCP method names served by the daemon's message handler.

// ── Session ────────────────────────────────────────────────────────
pub const INITIALIZE: &str = "initialize";
pub const PING: &str = "ping";

// ── Tools ──────────────────────────────────────────────────────────
pub const TOOLS_LIST: &str = "tools/list";
pub const TOOLS_CALL: &str = "tools/call";

// ── Resources ──────────────────────────────────────────────────────
pub const RESOURCES_LIST: &str = "resources/list";
pub const RESOURCES_READ: &str = "resources/read";

// ── Prompts ────────────────────────────────────────────────────────
pub const PROMPTS_LIST: &str = "prompts/list";
pub const PROMPTS_GET: &str = "prompts/get";

// ── Daemon extensions ──────────────────────────────────────────────
pub const CALLS_DISPATCH: &str = "calls/dispatch";
pub const CALLS_GET: &str = "calls/get";
pub const CACHE_PURGE: &str = "cache/purge";

/// Every method the handler dispatches.
pub const SUPPORTED_METHODS: &[&str] = &[
    INITIALIZE,
    PING,
    TOOLS_LIST,
    TOOLS_CALL,
    RESOURCES_LIST,
    RESOURCES_READ,
    PROMPTS_LIST,
    PROMPTS_GET,
    CALLS_DISPATCH,
    CALLS_GET,
    CACHE_PURGE,
];
