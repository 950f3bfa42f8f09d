//! Session tokens

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Token alphabet: digits 1-9 and uppercase letters without `O`
pub const TOKEN_ALPHABET: &[u8] = b"123456789ABCDEFGHIJKLMNPQRSTUVWXYZ";

/// Token length in characters
pub const TOKEN_LENGTH: usize = 8;

/// Correlates a robot session with the server side
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Draw a fresh token
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let token = (0..TOKEN_LENGTH)
            .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
            .collect();
        Token(token)
    }

    /// Accept a token string if it has the right shape
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == TOKEN_LENGTH && s.bytes().all(|b| TOKEN_ALPHABET.contains(&b));
        valid.then(|| Token(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Token {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
