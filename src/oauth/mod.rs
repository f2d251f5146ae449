//! Embedded OAuth2 authorization server and SSO delegation
//!
//! The gateway is both an RFC 6749 authorization server for its machine
//! clients and, optionally, an OAuth2 client of an external IdP that the
//! interactive authorize flow delegates end-user authentication to.

pub mod device;
pub mod metadata;
pub mod provider;
pub mod scope;
pub mod sso;
pub mod store;

pub use provider::{AuthorizeParams, OAuth2Provider};
pub use sso::SsoClient;
pub use store::{ClientRecord, IdentitySession, OAuth2Store};
