//! Seam to address validation tokens (RFC 9000 Section 8.1)

use std::net::SocketAddr;

/// Checks the token carried by a client Initial.
///
/// A rejected token refuses that one connection attempt.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &[u8], remote_addr: SocketAddr) -> bool;
}

/// Accepts every token, including an empty one
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllTokens;

impl TokenValidator for AcceptAllTokens {
    fn validate(&self, _token: &[u8], _remote_addr: SocketAddr) -> bool {
        true
    }
}
