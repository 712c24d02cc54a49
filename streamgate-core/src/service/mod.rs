pub mod identity;
pub mod media;
pub mod session;
pub mod signing;

pub use identity::{IdentityClaims, IdentityVerifier};
pub use media::MediaService;
pub use session::{SessionStore, StreamSession};
