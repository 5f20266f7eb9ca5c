//! Inbound token authentication.
//!
//! [`PublicKeyCache`] holds the controller's verification key, [`TokenAuthGate`]
//! checks a token against it and the request headers, and
//! [`require_probe_auth`] wires the gate into the router as a middleware.

mod gate;
mod key_cache;
mod middleware;

pub use gate::{AuthError, RequestContext, TokenAuthGate, VerifiedOrigin};
pub use key_cache::{
    CachedPublicKey, KeySource, PublicKeyCache, PublicKeyFetcher, StaticKeyConfig, KEY_FRESHNESS,
};
pub use middleware::require_probe_auth;

#[cfg(test)]
pub(crate) mod fixtures {
    pub(crate) use super::gate::tests::{mint, SIGNING_PEM};
    pub(crate) use super::key_cache::tests::PUBLIC_PEM;
}
