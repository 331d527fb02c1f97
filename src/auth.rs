//! C2 — AuthVerifier.
//!
//! Verifies EIP-191 personal-sign signatures of the canonical tunnel message
//! and mints the single-use nonces that back both the initial challenge and
//! the add-agent flow.

use alloy_primitives::{Address as AlloyAddress, Signature};
use rand::RngCore;

use crate::address::AgentAddress;
use crate::protocol::canonical_message;

/// Signed messages are only accepted within this many seconds of "now".
pub const TIMESTAMP_SKEW_SECS: i64 = 30;

/// Generates 32 cryptographically random bytes, lowercase hex-encoded.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Verifies a single EIP-191 personal-sign signature over the canonical
/// tunnel message, AND that `timestamp` is within [`TIMESTAMP_SKEW_SECS`] of
/// `now`. Any parse/recovery failure from the underlying crypto primitive is
/// treated as "invalid" rather than propagated.
pub fn verify_signature(
    address: &AgentAddress,
    nonce: &str,
    timestamp: i64,
    now: i64,
    signature_hex: &str,
) -> bool {
    if (now - timestamp).abs() > TIMESTAMP_SKEW_SECS {
        return false;
    }
    let message = canonical_message(address.as_str(), nonce, timestamp);
    recover_matches(address, &message, signature_hex)
}

fn recover_matches(address: &AgentAddress, message: &str, signature_hex: &str) -> bool {
    let Some(sig_bytes) = decode_signature(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let Ok(recovered) = signature.recover_address_from_msg(message.as_bytes()) else {
        return false;
    };
    addresses_equal(&recovered, address)
}

fn addresses_equal(recovered: &AlloyAddress, expected: &AgentAddress) -> bool {
    format!("{recovered:#x}").eq_ignore_ascii_case(expected.as_str())
}

fn decode_signature(raw: &str) -> Option<Vec<u8>> {
    let raw = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(raw).ok()
}

/// One (address, signature) pair presented to `verifyAll`.
pub struct AgentSignature<'a> {
    pub address: &'a AgentAddress,
    pub signature: &'a str,
}

/// Batch-verifies a whole `auth` frame's agent list against one nonce and
/// timestamp. Succeeds only if every agent verifies; a single failure fails
/// the whole batch (no partial tunnel).
pub fn verify_all(agents: &[AgentSignature<'_>], nonce: &str, timestamp: i64, now: i64) -> bool {
    !agents.is_empty()
        && agents
            .iter()
            .all(|a| verify_signature(a.address, nonce, timestamp, now, a.signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_signer::Signer;
    use alloy_signer_local::PrivateKeySigner;

    async fn signed_agent(nonce: &str, timestamp: i64) -> (AgentAddress, String) {
        let signer = PrivateKeySigner::random();
        let address = AgentAddress::parse(&format!("{:#x}", signer.address())).unwrap();
        let message = canonical_message(address.as_str(), nonce, timestamp);
        let signature = signer.sign_message(message.as_bytes()).await.unwrap();
        (address, hex::encode(signature.as_bytes()))
    }

    #[tokio::test]
    async fn accepts_valid_signature_within_skew() {
        let now = 1_700_000_000i64;
        let nonce = "deadbeef";
        let (address, sig) = signed_agent(nonce, now).await;
        assert!(verify_signature(&address, nonce, now, now, &sig));
    }

    #[tokio::test]
    async fn rejects_stale_timestamp() {
        let now = 1_700_000_000i64;
        let nonce = "deadbeef";
        let (address, sig) = signed_agent(nonce, now).await;
        assert!(!verify_signature(&address, nonce, now, now + 31, &sig));
    }

    #[test]
    fn rejects_garbage_signature() {
        let address = AgentAddress::parse("0x0000000000000000000000000000000000000001").unwrap();
        assert!(!verify_signature(&address, "n", 0, 0, "not-hex"));
    }

    #[tokio::test]
    async fn verify_all_fails_atomically() {
        let now = 1_700_000_000i64;
        let nonce = "deadbeef";
        let (good_addr, good_sig) = signed_agent(nonce, now).await;
        let bad_addr =
            AgentAddress::parse("0x0000000000000000000000000000000000000002").unwrap();
        let agents = vec![
            AgentSignature {
                address: &good_addr,
                signature: &good_sig,
            },
            AgentSignature {
                address: &bad_addr,
                signature: &good_sig,
            },
        ];
        assert!(!verify_all(&agents, nonce, now, now));
    }
}
