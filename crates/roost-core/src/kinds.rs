//! Event kind constants used by the cache.

pub const PROFILE: u32 = 0;
pub const FOLLOWS: u32 = 3;
pub const MESSAGE: u32 = 9;
pub const THREAD: u32 = 11;
pub const DIRECT_MESSAGE: u32 = 14;
pub const DIRECT_MESSAGE_FILE: u32 = 15;
pub const MUTES: u32 = 10000;
pub const RELAYS: u32 = 10002;
pub const ROOMS: u32 = 10009;
pub const INBOX_RELAYS: u32 = 10050;
pub const APP_DATA: u32 = 30078;
pub const EVENT_TIME: u32 = 31923;
pub const ALERT: u32 = 32830;
pub const ALERT_STATUS: u32 = 32831;

/// Kinds where only the newest event per author is kept
pub fn is_replaceable(kind: u32) -> bool {
    kind == PROFILE || kind == FOLLOWS || (10000..20000).contains(&kind)
}

/// Kinds where only the newest event per author and `d` tag is kept
pub fn is_parameterized_replaceable(kind: u32) -> bool {
    (30000..40000).contains(&kind)
}
