use anyhow::{anyhow, Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

fn decode_fixed<const N: usize>(hex_value: &str, what: &str) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_value.trim()).with_context(|| format!("{what} is not hex"))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow!("{what} must be {N} bytes, got {len}"))
}

/// Verifies a detached Ed25519 signature over a downloaded payload.
///
/// Errors when the key or signature is malformed or when the signature does not match.
pub fn verify_payload_signature(
    payload: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<()> {
    let key_bytes = decode_fixed::<32>(public_key_hex, "ed25519 public key")?;
    let signature_bytes = decode_fixed::<64>(signature_hex, "ed25519 signature")?;

    let key = VerifyingKey::from_bytes(&key_bytes).context("invalid ed25519 public key")?;
    let signature = Signature::from_bytes(&signature_bytes);
    key.verify(payload, &signature)
        .map_err(|_| anyhow!("payload signature does not match the trusted key"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 8032, test 1.
    const KEY: &str = "d75a980182b10ab7d54bfed3c964073a0ee172f3daa62325af021a68f707511a";
    const SIGNATURE: &str = concat!(
        "e5564300c360ac729086e2cc806e828a84877f1eb8e5d974d873e06522490155",
        "5fb8821590a33bacc61e39701cf9b46bd25bf5f0595bbe24655141438e7a100b"
    );

    #[test]
    fn accepts_matching_signature() {
        verify_payload_signature(b"", KEY, SIGNATURE).expect("signature must verify");
    }

    #[test]
    fn rejects_tampered_payload() {
        let err = verify_payload_signature(b"tampered", KEY, SIGNATURE).expect_err("must fail");
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn rejects_malformed_inputs() {
        assert!(verify_payload_signature(b"", KEY, "zz").is_err());
        assert!(verify_payload_signature(b"", KEY, "00").is_err());
        assert!(verify_payload_signature(b"", "abcd", SIGNATURE).is_err());
    }
}
