//! Salted per-device remote-id derivation (`CQ`), a bit-for-bit port of the
//! vendor mobile app's algorithm. See `resolver::derive_remote_id` for how
//! this fits into the three-tier derivation priority.

use sha2::{Digest, Sha256};

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// RC4-style KSA: builds the permutation `p` of `0..n` driven by `key`,
/// cycling the key when it's shorter than `n`.
fn ksa_permutation(n: usize, key: &[u8]) -> Vec<usize> {
    let mut p: Vec<usize> = (0..n).collect();
    if n == 0 {
        return p;
    }
    let mut j = 0usize;
    for i in 0..n {
        let key_byte = if key.is_empty() {
            0
        } else {
            key[i % key.len()] as usize
        };
        j = (j + p[i] + key_byte) % n;
        p.swap(i, j);
    }
    p
}

fn scramble(data: &[u8], p: &[usize]) -> Vec<u8> {
    (0..data.len()).map(|i| data[p[i]]).collect()
}

fn unscramble(data: &[u8], p: &[usize]) -> Vec<u8> {
    let mut result = vec![0u8; data.len()];
    for i in 0..data.len() {
        result[p[i]] = data[i];
    }
    result
}

/// `TextForRand(salt, var1)`.
fn text_for_rand(salt: &str, var1: &str) -> String {
    let hex_content = hex::encode(salt.as_bytes());
    let n: usize = if hex_content.len() >= 2 {
        let tail = &hex_content[hex_content.len() - 2..];
        let val = i64::from_str_radix(tail, 16).unwrap_or(0);
        (((val % 5) + 5) % 5) as usize
    } else {
        0
    };

    let data: Vec<u8> = hex_content.into_bytes();
    let p = ksa_permutation(data.len(), var1.as_bytes());

    let mut current = data;
    for _ in 0..(2 * n) {
        current = scramble(&current, &p);
    }
    for _ in 0..n.max(1) {
        current = unscramble(&current, &p);
    }
    hex::encode(current)
}

/// `StreamCipher(vidMac, var2)`. `vid_mac` and `var2` must be ASCII for the
/// byte-count/char-count identity the original algorithm relies on.
fn stream_cipher(vid_mac: &str, var2: &str) -> String {
    const MODULUS: i64 = 2_147_483_647;
    let mut seed: i64 = 0;
    for &b in var2.as_bytes() {
        seed = (seed * 31 + b as i64) % MODULUS;
    }

    let mut state = seed as u32;
    let input = vid_mac.as_bytes();
    let mut out = Vec::with_capacity(input.len());
    for &b in input {
        state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let keystream_byte = ((state ^ (state >> 16)) & 0xFF) as u8;
        out.push(b ^ keystream_byte);
    }
    hex::encode(out)
}

/// `CQ(salt, mac, vid)` — the salted remote-id derivation. Returns the empty
/// string (and logs) when `mac` is too short to slice, matching the
/// reference behavior rather than panicking or erroring.
pub fn cq(salt: &str, mac: &str, vid: &str) -> String {
    if mac.len() < 4 {
        tracing::warn!(mac_len = mac.len(), "CQ: mac too short, returning empty remote id");
        return String::new();
    }

    let var1 = format!("{vid}_{}", &mac[..mac.len() - 4]);
    let var2 = format!("{}_{vid}", &mac[1..mac.len() - 2]);

    let h1 = text_for_rand(salt, &var1);
    let vid_mac = format!("{vid}{mac}");
    let h2 = stream_cipher(&vid_mac, &var2);

    let mut hasher = Sha256::new();
    hasher.update(h1.as_bytes());
    hasher.update(h2.as_bytes());
    let digest = hasher.finalize();

    let words: Vec<u32> = digest
        .chunks_exact(4)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut bytes = [0u8; 24];
    for (i, slot) in bytes.iter_mut().enumerate() {
        let word = words[i % 8];
        let shift = (i / 8) * 8;
        *slot = ((word >> shift) & 0xFF) as u8;
    }

    let mut out = String::with_capacity(48);
    for b in bytes {
        out.push(ALPHABET[(b as usize) % 62] as char);
        out.push(ALPHABET[((b as usize) * 31) % 62] as char);
    }
    out.truncate(24);
    out
}
