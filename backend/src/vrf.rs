//! Oracle randomness: the HMAC output the authority signs, and the word
//! expansion the coordinator applies to it before calling the raffle.
//!
//! The output is deterministic for a request (a restart re-derives the same
//! value) but unpredictable without the secret key.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;

type HmacSha256 = Hmac<Sha256>;

/// Compute the 32-byte VRF output for a given randomness request.
///
/// ```text
/// output = HMAC-SHA256(secret, seed || request_slot_le || request_id_le)
/// ```
///
/// The caller-provided `seed` prevents the oracle from pre-computing outputs.
/// The `request_slot` binds the output to the specific on-chain state at
/// request time, and `request_id` ensures uniqueness across requests.
pub fn compute_randomness(
    hmac_secret: &[u8],
    seed: &[u8; 32],
    request_slot: u64,
    request_id: u64,
) -> [u8; 32] {
    let mut mac =
        HmacSha256::new_from_slice(hmac_secret).expect("HMAC accepts keys of any size");

    mac.update(seed);
    mac.update(&request_slot.to_le_bytes());
    mac.update(&request_id.to_le_bytes());

    let result = mac.finalize();
    let bytes = result.into_bytes();

    let mut output = [0u8; 32];
    output.copy_from_slice(&bytes);
    output
}

/// `sha256(authority)`: the key hash requests quote to name their oracle.
pub fn key_hash(authority: &Pubkey) -> [u8; 32] {
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&Sha256::digest(authority.as_ref()));
    hash
}

/// The 40-byte message covered by the Ed25519 proof:
/// `request_id_le || randomness`.
pub fn fulfillment_message(request_id: u64, randomness: &[u8; 32]) -> [u8; 40] {
    let mut message = [0u8; 40];
    message[..8].copy_from_slice(&request_id.to_le_bytes());
    message[8..].copy_from_slice(randomness);
    message
}

/// Same expansion as the coordinator: `word[i] = SHA256(randomness || i_le)`.
pub fn expand_randomness(randomness: &[u8; 32], num_words: u32) -> Vec<[u8; 32]> {
    (0..num_words)
        .map(|i| {
            let mut hasher = Sha256::new();
            hasher.update(randomness);
            hasher.update(i.to_le_bytes());
            let mut word = [0u8; 32];
            word.copy_from_slice(&hasher.finalize());
            word
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_inputs() {
        let secret = b"test-secret";
        let seed = [1u8; 32];

        let r1 = compute_randomness(secret, &seed, 100, 0);
        let r2 = compute_randomness(secret, &seed, 100, 0);
        assert_eq!(r1, r2);
    }

    #[test]
    fn different_for_different_slots() {
        let secret = b"test-secret";
        let seed = [1u8; 32];

        let r1 = compute_randomness(secret, &seed, 100, 0);
        let r2 = compute_randomness(secret, &seed, 101, 0);
        assert_ne!(r1, r2);
    }

    #[test]
    fn different_for_different_ids() {
        let secret = b"test-secret";
        let seed = [1u8; 32];

        let r1 = compute_randomness(secret, &seed, 100, 0);
        let r2 = compute_randomness(secret, &seed, 100, 1);
        assert_ne!(r1, r2);
    }

    #[test]
    fn key_hash_depends_on_authority() {
        let a = Pubkey::new_unique();
        let b = Pubkey::new_unique();
        assert_eq!(key_hash(&a), key_hash(&a));
        assert_ne!(key_hash(&a), key_hash(&b));
    }

    #[test]
    fn message_is_id_then_randomness() {
        let randomness = [9u8; 32];
        let message = fulfillment_message(0x0102, &randomness);
        assert_eq!(&message[..8], &0x0102u64.to_le_bytes());
        assert_eq!(&message[8..], &randomness);
    }

    #[test]
    fn expansion_is_prefix_stable() {
        let randomness = compute_randomness(b"test-secret", &[3u8; 32], 10, 4);
        let one = expand_randomness(&randomness, 1);
        let three = expand_randomness(&randomness, 3);
        assert_eq!(one[0], three[0]);
        assert_ne!(three[0], three[1]);
        assert_ne!(three[0], randomness);
        assert!(expand_randomness(&randomness, 0).is_empty());
    }
}
