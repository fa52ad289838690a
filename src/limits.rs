//! Hard limits enforced by the engine and the tenant manager.

use crate::model::Money;

pub const MAX_LOTS_PER_TENANT: usize = 10_000;
pub const MAX_LOT_CAPACITY: i64 = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_ADDRESS_LEN: usize = 512;
pub const MAX_POSTAL_CODE_LEN: usize = 16;
pub const MAX_REQUESTER_LEN: usize = 256;
/// 1,000,000.00 per hour.
pub const MAX_UNIT_PRICE: Money = Money::from_cents(100_000_000);

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 256;

/// WAL appends attempted before an operation fails as unavailable.
pub const MAX_COMMIT_ATTEMPTS: usize = 3;
