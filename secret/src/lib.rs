//! A string wrapper for credentials which never shows up in debug output and
//! is wiped from memory when dropped.

use std::{borrow::Cow, fmt, ops::Deref};

use serde::Deserialize;
use zeroize::Zeroize;

/// A credential, such as an access token.
///
/// Use [Secret::revealed] to get the underlying value.
#[derive(Clone, Deserialize)]
#[serde(from = "String")]
pub struct Secret(Cow<'static, str>);

impl Drop for Secret {
    fn drop(&mut self) {
        if let Cow::Owned(ref mut s) = self.0 {
            s.zeroize()
        }
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Secret")
            .field(&format_args!("****"))
            .finish()
    }
}

impl Secret {
    /// Expose the underlying value.
    pub fn revealed(&self) -> &str {
        self.0.deref()
    }

    /// Compare against a presented credential without short-circuiting on
    /// the first differing byte.
    pub fn matches(&self, candidate: &str) -> bool {
        let expected = self.revealed().as_bytes();
        let candidate = candidate.as_bytes();
        if expected.len() != candidate.len() {
            return false;
        }

        expected
            .iter()
            .zip(candidate)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value.into())
    }
}

impl From<&'static str> for Secret {
    fn from(value: &'static str) -> Self {
        Secret(value.into())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn secret_hidden_debug() {
        let token = Secret::from("secret garden");

        assert!(!format!("{token:?}").contains("secret garden"));
        assert_eq!(&format!("{token:?}"), "Secret(****)");
        assert_eq!(token.revealed(), "secret garden");
    }

    #[test]
    fn matches_exact_value_only() {
        let token = Secret::from(String::from("push-token"));

        assert!(token.matches("push-token"));
        assert!(!token.matches("push-tokem"));
        assert!(!token.matches("push"));
        assert!(!token.matches(""));
    }
}
