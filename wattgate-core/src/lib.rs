//! wattgate Core - Domain Types and Pure Logic
//!
//! Data structures, the error taxonomy and side-effect free helpers shared by
//! the storage and API crates. Nothing in here performs I/O; the upstream
//! provider is only described as a trait.

pub mod clock;
pub mod consumption;
pub mod dates;
pub mod error;
pub mod session;
pub mod types;
pub mod upstream;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use consumption::total_consumption;
pub use dates::{clamp_date_range, latest_available_date, parse_query_date, DateRange};
pub use error::{
    AccessError, AuthError, ConfigError, GatewayError, GatewayResult, StoreError, StoreResult,
};
pub use session::{SessionClaims, SigningKey, MIN_SIGNING_KEY_BYTES};
pub use types::{AccessToken, Aggregation, ConsumptionQuery, CustomerId, LookupScope};
pub use upstream::{UpstreamApi, UpstreamFailure, UpstreamResult};

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 digest of `parts`, each part separated by a NUL byte
/// so that `["ab", "c"]` and `["a", "bc"]` never collide.
pub fn digest_key<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}
