use base64::Engine;
use rand::RngCore;
use subtle::ConstantTimeEq;

/// Mint a per-call stream secret: 128 random bits, base64url without padding.
pub fn mint_stream_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Constant-time comparison of a supplied stream token against the per-call
/// secret.
///
/// Equal-length mismatches and unequal-length tokens both return false. When
/// lengths differ, the comparison still runs against a dummy of the expected
/// length so timing stays uniform.
pub fn token_matches(supplied: &str, expected: &str) -> bool {
    let supplied = supplied.as_bytes();
    let expected = expected.as_bytes();

    if supplied.len() != expected.len() {
        let dummy = vec![0u8; expected.len()];
        let _ = dummy.ct_eq(expected);
        return false;
    }

    supplied.ct_eq(expected).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_tokens_match() {
        let token = mint_stream_token();
        assert!(token_matches(&token, &token));
    }

    #[test]
    fn same_length_mismatch_rejected() {
        let a = "a".repeat(22);
        let b = "b".repeat(22);
        assert!(!token_matches(&a, &b));
    }

    #[test]
    fn different_length_rejected() {
        assert!(!token_matches("short", "a-much-longer-expected-token"));
        assert!(!token_matches("", "x"));
        assert!(!token_matches("x", ""));
    }

    #[test]
    fn minted_tokens_are_unique_and_url_safe() {
        let a = mint_stream_token();
        let b = mint_stream_token();
        assert_ne!(a, b);
        // 16 bytes -> 22 base64url chars, no padding
        assert_eq!(a.len(), 22);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
