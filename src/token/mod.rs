//! Downstream credential minting and the per-identity session cache

pub mod minter;
pub mod session_cache;
pub mod signer;

pub use minter::{DownstreamMinter, map_scopes};
pub use session_cache::{SessionCache, SessionEntry, SessionHandle};
pub use signer::{HmacTokenSigner, RsaTokenSigner, TokenSigner, generate_rsa_pem};
