//! Manage tokens for remote client addresses.

use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    fmt::{self, Debug, Formatter},
    net::SocketAddrV4,
    time::{Duration, Instant},
};

use tracing::trace;

const SECRET_SIZE: usize = 20;
/// Size of the tokens we issue, a full sha1 digest.
pub const TOKEN_SIZE: usize = 20;

/// Tokens generator.
///
/// A token is the sha1 digest of a secret followed by the requester's `ip:port`.
/// No per address state is kept, and tokens issued under the previous secret are
/// still accepted.
///
/// Read [BEP_0005](https://www.bittorrent.org/beps/bep_0005.html) for more information.
pub struct Tokens {
    rng: StdRng,
    prev_secret: [u8; SECRET_SIZE],
    curr_secret: [u8; SECRET_SIZE],
    last_updated: Instant,
}

impl Debug for Tokens {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Tokens (_)")
    }
}

impl Tokens {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Create a tokens generator drawing its secrets from `rng`.
    pub fn from_rng(mut rng: StdRng) -> Self {
        Tokens {
            prev_secret: rng.gen(),
            curr_secret: rng.gen(),
            rng,
            last_updated: Instant::now(),
        }
    }

    // === Public Methods ===

    /// Returns `true` if the current secret is older than `interval`.
    pub fn should_update(&self, interval: Duration) -> bool {
        self.last_updated.elapsed() > interval
    }

    /// Returns `true` if `token` was issued to `address` under the current or previous secret.
    pub fn validate(&self, address: SocketAddrV4, token: &[u8]) -> bool {
        let prev = Self::internal_generate_token(address, &self.prev_secret);
        let curr = Self::internal_generate_token(address, &self.curr_secret);

        token == curr || token == prev
    }

    pub fn rotate(&mut self) {
        trace!(context = "tokens", "Rotating secrets");

        self.prev_secret = self.curr_secret;
        self.curr_secret = self.rng.gen();

        self.last_updated = Instant::now();
    }

    pub fn generate_token(&self, address: SocketAddrV4) -> [u8; TOKEN_SIZE] {
        Self::internal_generate_token(address, &self.curr_secret)
    }

    // === Private Methods ===

    fn internal_generate_token(
        address: SocketAddrV4,
        secret: &[u8; SECRET_SIZE],
    ) -> [u8; TOKEN_SIZE] {
        let mut hasher = sha1_smol::Sha1::new();

        hasher.update(secret);
        hasher.update(address.to_string().as_bytes());

        hasher.digest().bytes()
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn valid_tokens() {
        let tokens = Tokens::new();

        let address = SocketAddrV4::new([127, 0, 0, 1].into(), 6881);
        let token = tokens.generate_token(address);

        assert!(tokens.validate(address, &token))
    }

    #[test]
    fn tokens_are_bound_to_address() {
        let tokens = Tokens::new();

        let address = SocketAddrV4::new([127, 0, 0, 1].into(), 6881);
        let token = tokens.generate_token(address);

        assert!(!tokens.validate(SocketAddrV4::new([127, 0, 0, 2].into(), 6881), &token));
        assert!(!tokens.validate(SocketAddrV4::new([127, 0, 0, 1].into(), 6882), &token));
        assert!(!tokens.validate(address, &token[..4]));
    }

    #[test]
    fn survives_one_rotation() {
        let mut tokens = Tokens::from_rng(StdRng::seed_from_u64(42));

        let address = SocketAddrV4::new([10, 0, 0, 1].into(), 1234);
        let token = tokens.generate_token(address);

        tokens.rotate();
        assert!(tokens.validate(address, &token));

        tokens.rotate();
        assert!(!tokens.validate(address, &token));
    }

    #[test]
    fn should_update() {
        let mut tokens = Tokens::new();

        assert!(!tokens.should_update(Duration::from_secs(60)));

        let Some(past) = Instant::now().checked_sub(Duration::from_secs(61)) else {
            return;
        };
        tokens.last_updated = past;
        assert!(tokens.should_update(Duration::from_secs(60)));

        tokens.rotate();
        assert!(!tokens.should_update(Duration::from_secs(60)));
    }
}
