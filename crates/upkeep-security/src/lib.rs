mod checksum;
mod ed25519;

pub use checksum::{sha256_file, sha256_hex, sha256_matches, verify_sha256_file};
pub use ed25519::verify_payload_signature;
