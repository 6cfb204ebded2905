// Timing constants for the account scheduler. Durations are milliseconds
// unless the name says otherwise.

/// Affinity lock default: keep routing to the most recently used account for
/// this long to maximize upstream prompt-cache hits.
pub const TIME_WINDOW_LOCK_MS: u64 = 60_000;

/// Cooldowns at or below this are worth sleeping through instead of switching
/// accounts (switching would discard the upstream cache).
pub const SHORT_WAIT_THRESHOLD_MS: u64 = 10_000;

/// Never tell a caller to wait longer than this; surface an overloaded error
/// instead.
pub const MAX_WAIT_BEFORE_ERROR_MS: u64 = 60_000;

/// Cooldown applied when the upstream rate-limits without a parseable reset
/// window.
pub const DEFAULT_COOLDOWN_MS: u64 = 60_000;

/// Access tokens are cached per account and re-resolved after this interval.
pub const TOKEN_REFRESH_INTERVAL_MS: i64 = 10 * 60 * 1000;

/// Budget for extracting credentials from a local database file.
pub const DB_EXTRACT_TIMEOUT_SECS: u64 = 5;

/// Retry-After fallback when an overload error carries no reset window.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

pub const FLOW_RETENTION_DAYS: u64 = 7;
pub const BACKUP_RETENTION: usize = 10;

/// Project id used when discovery fails on every endpoint.
pub const DEFAULT_PROJECT_ID: &str = "cloud-code-default";

/// Upstream endpoints, tried in order.
pub const UPSTREAM_ENDPOINTS: &[&str] = &[
    "https://cloudcode-pa.googleapis.com",
    "https://daily-cloudcode-pa.sandbox.googleapis.com",
];

pub const TOKEN_EXCHANGE_URL: &str = "https://oauth2.googleapis.com/token";
pub const OAUTH_CLIENT_ID_ENV: &str = "GANTRY_OAUTH_CLIENT_ID";

// Model catalog. The upstream serves the thinking-enabled variants; dated
// client ids are normalized onto them before selection.

pub const MODEL_OPUS_THINKING: &str = "claude-opus-4-5-thinking";
pub const MODEL_SONNET_THINKING: &str = "claude-sonnet-4-5-thinking";
pub const MODEL_SONNET: &str = "claude-sonnet-4-5";

pub const SUPPORTED_MODELS: &[&str] =
    &[MODEL_OPUS_THINKING, MODEL_SONNET_THINKING, MODEL_SONNET];

/// Dated alias -> canonical id. Clients pin dated ids; the upstream only
/// knows the canonical ones.
pub const MODEL_ALIASES: &[(&str, &str)] = &[
    ("claude-opus-4-5-20251101", MODEL_OPUS_THINKING),
    ("claude-sonnet-4-5-20250929", MODEL_SONNET_THINKING),
    ("claude-opus-4-5", MODEL_OPUS_THINKING),
    ("claude-sonnet-4-5-thinking-20250929", MODEL_SONNET_THINKING),
];

/// Model substituted for requests classified as background housekeeping.
pub const FREE_MODEL_FOR_BACKGROUND: &str = MODEL_SONNET;

/// Lowercase fragments that identify background housekeeping requests
/// (title generation, summarization chores) sent by coding clients between
/// user turns. Matched against the system prompt and the first messages.
pub const BACKGROUND_TASK_PATTERNS: &[&str] = &[
    "summarize conversation title",
    "title this chat",
    "generate a short title",
    "write a 5-10 word title",
    "summarize this conversation",
    "generate a concise title",
    "topic detection",
    "write a commit message",
    "isnewtopic",
];

pub const USER_AGENT: &str = concat!("gantry/", env!("CARGO_PKG_VERSION"));
