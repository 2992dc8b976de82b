// Hard caps applied per tenant engine. Exceeding any of them is reported as
// `EngineError::LimitExceeded` (or an io error for tenant creation).

pub const MAX_ITEMS_PER_TENANT: usize = 100_000;
/// Cap on rentals of one item that are ACTIVE at once. Ended and confirmed
/// rentals do not count.
pub const MAX_ACTIVE_RENTALS_PER_ITEM: usize = 50_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_USER_ID_LEN: usize = 256;
pub const MAX_STOCK: u32 = 1_000_000;
/// Longest single rental, in days (inclusive count).
pub const MAX_RENTAL_DAYS: i64 = 3660;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;
