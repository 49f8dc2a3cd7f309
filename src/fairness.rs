//! Provably-fair dice outcome generation.
//!
//! Each round hashes `server_seed || client_seed || nonce` with SHA-256 and
//! maps successive byte-pairs of the digest onto die faces. The server seed
//! is drawn fresh from the OS CSPRNG for every round and stored on the Round
//! record, so a player can recompute the faces once the seed is revealed.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Number of dice thrown per round.
pub const DICE_PER_ROUND: usize = 3;

/// Generate a fresh 32-byte server seed, hex encoded. Never reused across
/// rounds.
pub fn generate_server_seed() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Derive the three die faces for a round. Deterministic in its inputs;
/// every face is in 1..=6.
pub fn roll(server_seed: &str, client_seed: &str, nonce: u32) -> [u8; 3] {
    let digest = roll_digest(server_seed, client_seed, nonce);

    let mut dice = [0u8; DICE_PER_ROUND];
    for (i, die) in dice.iter_mut().enumerate() {
        let pair = u16::from_be_bytes([digest[2 * i], digest[2 * i + 1]]);
        *die = (pair % 6) as u8 + 1;
    }
    dice
}

/// Recompute and check a revealed round. This is the public verification
/// path: given the disclosed seed material, anyone can confirm the faces.
pub fn verify(server_seed: &str, client_seed: &str, nonce: u32, dice: [u8; 3]) -> bool {
    roll(server_seed, client_seed, nonce) == dice
}

fn roll_digest(server_seed: &str, client_seed: &str, nonce: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(server_seed.as_bytes());
    hasher.update(client_seed.as_bytes());
    hasher.update(nonce.to_string().as_bytes());
    hasher.finalize().into()
}
