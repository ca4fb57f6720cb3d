pub mod session;

pub use session::{CommitTriple, Meta, Session, SessionStatus};

use serde::{Deserialize, Serialize};

/// Normalized on-chain asset fields, as returned (and cached) by the read
/// proxy. Values are trimmed/validated at the point of normalization so
/// downstream code never has to re-check them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetFields {
    pub blob_id: String,
    pub size_bytes: u64,
    pub mime: String,
    pub created_at: Option<String>,
    pub owner: Option<String>,
}
