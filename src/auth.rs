//! Connection authentication.
//!
//! Two ways in when a password is configured: a plain `AUTH password`,
//! or a two-step HMAC challenge that never puts the secret on the
//! wire. The challenge is `client_random || "---" || unix_millis ||
//! "---" || server_random` and the expected answer is its HMAC-SHA256
//! under the shared secret, delivered within one minute.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const MINIMUM_SECRET_LENGTH: usize = 32;
const RANDOM_BYTES: usize = 64;
const CHALLENGE_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    Ok,
    InvalidSignature,
    DeadlinePassed,
    NoChallengeInFlight,
}

/// Per-connection authenticator over a shared secret.
pub struct Authenticator {
    secret: Vec<u8>,
    challenge: Option<(Vec<u8>, Instant)>,
}

impl Authenticator {
    /// Secrets below the minimum length are refused at configuration
    /// time; this only asserts the invariant.
    pub fn new(secret: &[u8]) -> Self {
        debug_assert!(secret.len() >= MINIMUM_SECRET_LENGTH);
        Authenticator {
            secret: secret.to_vec(),
            challenge: None,
        }
    }

    /// Plain AUTH comparison.
    pub fn check_password(&self, attempt: &[u8]) -> bool {
        // constant-time via HMAC over both sides
        let ours = signature(&self.secret, &self.secret);
        let theirs = signature(&self.secret, attempt);
        attempt.len() == self.secret.len() && ours == theirs
    }

    /// Step one: combine the client's random bytes with ours and a
    /// timestamp. The same bytes must be signed within the deadline.
    pub fn generate_challenge(&mut self, client_random: &[u8]) -> Result<Vec<u8>, String> {
        if client_random.len() != RANDOM_BYTES {
            return Err(format!(
                "challenge requires exactly {RANDOM_BYTES} random bytes"
            ));
        }
        let mut server_random = [0u8; RANDOM_BYTES];
        rand::thread_rng().fill_bytes(&mut server_random);

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        let mut challenge = Vec::with_capacity(2 * RANDOM_BYTES + 24);
        challenge.extend_from_slice(client_random);
        challenge.extend_from_slice(b"---");
        challenge.extend_from_slice(millis.to_string().as_bytes());
        challenge.extend_from_slice(b"---");
        challenge.extend_from_slice(&server_random);

        self.challenge = Some((challenge.clone(), Instant::now() + CHALLENGE_DEADLINE));
        Ok(challenge)
    }

    /// Step two: verify the signature over the outstanding challenge.
    /// The challenge is consumed either way.
    pub fn validate_signature(&mut self, signature_bytes: &[u8]) -> ValidationStatus {
        let Some((challenge, deadline)) = self.challenge.take() else {
            return ValidationStatus::NoChallengeInFlight;
        };
        if Instant::now() > deadline {
            return ValidationStatus::DeadlinePassed;
        }
        if signature(&self.secret, &challenge) != signature_bytes {
            return ValidationStatus::InvalidSignature;
        }
        ValidationStatus::Ok
    }
}

fn signature(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Client-side half, used by peers and tests.
pub fn sign_challenge(secret: &[u8], challenge: &[u8]) -> Vec<u8> {
    signature(secret, challenge)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"a-very-long-shared-secret-for-tests!";

    #[test]
    fn password_comparison() {
        let authenticator = Authenticator::new(SECRET);
        assert!(authenticator.check_password(SECRET));
        assert!(!authenticator.check_password(b"wrong"));
        assert!(!authenticator.check_password(b""));
    }

    #[test]
    fn challenge_round_trip() {
        let mut authenticator = Authenticator::new(SECRET);
        let challenge = authenticator.generate_challenge(&[7u8; 64]).unwrap();

        let answer = sign_challenge(SECRET, &challenge);
        assert_eq!(
            authenticator.validate_signature(&answer),
            ValidationStatus::Ok
        );

        // the challenge is spent
        assert_eq!(
            authenticator.validate_signature(&answer),
            ValidationStatus::NoChallengeInFlight
        );
    }

    #[test]
    fn wrong_secret_fails_validation() {
        let mut authenticator = Authenticator::new(SECRET);
        let challenge = authenticator.generate_challenge(&[7u8; 64]).unwrap();

        let answer = sign_challenge(b"some-other-equally-long-secret!!", &challenge);
        assert_eq!(
            authenticator.validate_signature(&answer),
            ValidationStatus::InvalidSignature
        );
    }

    #[test]
    fn challenge_requires_full_entropy() {
        let mut authenticator = Authenticator::new(SECRET);
        assert!(authenticator.generate_challenge(&[1u8; 10]).is_err());
    }
}
