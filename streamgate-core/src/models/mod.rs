pub mod media;

pub use media::{MediaDescriptor, UpstreamLocator};

use serde::{Deserialize, Serialize};

/// Identity of an authenticated upstream bot account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub id: i64,
    pub username: String,
}

impl std::fmt::Display for AccountInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{} ({})", self.username, self.id)
    }
}
