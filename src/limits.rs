//! Hard input limits. Everything here exists to bound memory and WAL
//! growth from a single misbehaving client, not to express policy.

pub const MAX_FACILITIES: usize = 4_096;
pub const MAX_USERS: usize = 16_384;
pub const MAX_REQUESTS_PER_FACILITY: usize = 65_536;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TITLE_LEN: usize = 256;
pub const MAX_SLOT_LEN: usize = 64;
pub const MAX_USERNAME_LEN: usize = 64;
pub const MAX_EMAIL_LEN: usize = 256;
pub const MAX_COLOR_LEN: usize = 32;

pub const MAX_EQUIPMENT_ITEMS: usize = 64;
pub const MAX_EQUIPMENT_NAME_LEN: usize = 128;

/// Longest accepted wire line (one JSON command).
pub const MAX_WIRE_LINE_LEN: usize = 64 * 1024;
