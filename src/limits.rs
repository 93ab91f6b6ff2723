// Hard limits per tenant. Exceeding any of these is a validation error, never a panic.

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_VEHICLES_PER_TENANT: usize = 100_000;
pub const MAX_REQUESTS_PER_TENANT: usize = 1_000_000;
pub const MAX_WORK_ORDERS_PER_TENANT: usize = 1_000_000;

pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_CATEGORY_LEN: usize = 128;
pub const MAX_NOTES_LEN: usize = 4_096;
pub const MAX_DESCRIPTION_LEN: usize = 4_096;
pub const MAX_ATTACHMENTS: usize = 16;
pub const MAX_ATTACHMENT_REF_LEN: usize = 512;
pub const MAX_ACTOR_LEN: usize = 128;

/// Upper bound on `horizon_days` in the schedule file.
pub const MAX_HORIZON_DAYS: u32 = 366;
/// Upper bound on blocks per weekday class.
pub const MAX_BLOCKS_PER_DAY: usize = 48;
