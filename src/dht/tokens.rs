//! Rolling write tokens bound to the requester's address.

use std::net::SocketAddr;

use getrandom::getrandom;
use tracing::trace;

use crate::messages::Token;

const SECRET_SIZE: usize = 8;

/// Wire-visible token length.
pub const TOKEN_SIZE: usize = 64;

#[derive(Clone)]
/// Token generator keeping the current and the previous secret, so tokens
/// issued just before a rotation stay valid for one more period. The
/// rotation period must exceed a typical search duration.
pub struct Tokens {
    secret: [u8; SECRET_SIZE],
    old_secret: [u8; SECRET_SIZE],
}

impl Tokens {
    pub fn new() -> Tokens {
        Tokens {
            secret: random_secret(),
            old_secret: random_secret(),
        }
    }

    /// Token for `addr` under the current (or, with `old`, the previous)
    /// secret.
    pub fn make_token(&self, addr: &SocketAddr, old: bool) -> Token {
        let secret = if old { &self.old_secret } else { &self.secret };

        // Counter-mode SHA-1 over (secret, ip, port), concatenated digests
        // truncated to TOKEN_SIZE.
        let mut out = Vec::with_capacity(TOKEN_SIZE);
        let mut counter: u8 = 0;
        while out.len() < TOKEN_SIZE {
            let mut sha = sha1_smol::Sha1::new();
            sha.update(secret);
            match addr.ip() {
                std::net::IpAddr::V4(ip) => sha.update(&ip.octets()),
                std::net::IpAddr::V6(ip) => sha.update(&ip.octets()),
            }
            sha.update(&addr.port().to_be_bytes());
            sha.update(&[counter]);
            out.extend_from_slice(&sha.digest().bytes());
            counter += 1;
        }
        out.truncate(TOKEN_SIZE);
        out
    }

    /// A token matches when it verifies under either secret.
    pub fn token_match(&self, token: &[u8], addr: &SocketAddr) -> bool {
        token == self.make_token(addr, false) || token == self.make_token(addr, true)
    }

    pub fn rotate(&mut self) {
        trace!("rotating token secrets");
        self.old_secret = self.secret;
        self.secret = random_secret();
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Tokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Tokens(_)")
    }
}

fn random_secret() -> [u8; SECRET_SIZE] {
    let mut bytes = [0_u8; SECRET_SIZE];
    getrandom(&mut bytes).expect("getrandom");
    bytes
}
