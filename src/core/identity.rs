// Copyright (c) 2026 bepd
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Device identity: SHA-256 of a peer's DER certificate, and the canonical
//! human-readable form with Luhn-mod-32 check characters per septet.
//!
//! The check-digit algorithm is *not* standards-compliant Luhn mod N. It
//! reproduces a historical off-by-one variant bit-for-bit so that device IDs
//! printed by this crate interoperate with the fleet's existing tooling:
//! `sum(d[-2::-2]) + sum(sum(divmod(2*d, base)) for d in d[::-2])`.

use base32::Alphabet;
use ring::digest;
use thiserror::Error;

const ALPHABET: Alphabet = Alphabet::RFC4648 { padding: false };

/// 32-byte device identifier (SHA-256 of a peer certificate, DER-encoded).
pub type DeviceId = [u8; 32];

/// Errors parsing a device ID's canonical string form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// The string is not 7 hyphen-separated 8-char groups of base32 data.
    #[error("malformed device id string")]
    Malformed,
    /// A group's trailing Luhn-mod-32 check character does not match.
    #[error("device id check character mismatch")]
    InvalidDeviceId,
    /// The decoded payload is not exactly 32 bytes.
    #[error("device id did not decode to 32 bytes")]
    WrongLength,
}

/// Derive a device ID from a DER-encoded X.509 certificate.
///
/// SHA-256 already produces exactly 32 bytes, so the historical `[:32]`
/// slice in the source protocol is the entire digest.
pub fn device_id_from_cert(cert_der: &[u8]) -> DeviceId {
    let digest = digest::digest(&digest::SHA256, cert_der);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}

/// The base32 alphabet, as an ordered array of check-digit symbols.
fn b32_alphabet_chars() -> &'static [u8; 32] {
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567"
}

/// The historical Luhn-mod-N variant used by this wire format: not the
/// textbook Luhn algorithm. `decoder` maps a base32 symbol to its 0..32
/// value.
fn luhnish_sum_mod_32(symbols: &[u8]) -> u8 {
    let chars = b32_alphabet_chars();
    let decode = |c: u8| -> u32 {
        chars
            .iter()
            .position(|&x| x == c)
            .expect("symbol already validated as base32") as u32
    };

    let digits: Vec<u32> = symbols.iter().map(|&c| decode(c)).collect();
    let base = 32u32;

    // sum(d[-2::-2]): every second digit, starting one before the last.
    let odd_sum: u32 = digits.iter().rev().skip(1).step_by(2).sum();

    // sum(sum(divmod(2*d, base)) for d in d[::-2]): every second digit
    // starting from the last, doubled and split into (quotient, remainder).
    let even_sum: u32 = digits
        .iter()
        .rev()
        .step_by(2)
        .map(|&d| {
            let doubled = 2 * d;
            doubled / base + doubled % base
        })
        .sum();

    ((odd_sum + even_sum) % base) as u8
}

fn check_char(group: &[u8]) -> u8 {
    let chars = b32_alphabet_chars();
    chars[luhnish_sum_mod_32(group) as usize]
}

/// Format a 32-byte device ID as its canonical, hyphenated, check-digit form.
pub fn format_device_id(id: &DeviceId) -> String {
    let encoded = base32::encode(ALPHABET, id);
    debug_assert_eq!(encoded.len(), 52);

    let mut with_checks = String::with_capacity(56);
    for chunk in encoded.as_bytes().chunks(13) {
        with_checks.push_str(std::str::from_utf8(chunk).expect("base32 output is ascii"));
        with_checks.push(check_char(chunk) as char);
    }

    let bytes = with_checks.as_bytes();
    let groups: Vec<&str> = bytes
        .chunks(7)
        .map(|c| std::str::from_utf8(c).expect("ascii"))
        .collect();
    groups.join("-")
}

/// Parse a canonical device ID string, verifying every group's check digit.
pub fn parse_device_id(s: &str) -> Result<DeviceId, IdentityError> {
    let stripped: String = s.chars().filter(|&c| c != '-').collect();
    if stripped.len() != 56 {
        return Err(IdentityError::Malformed);
    }

    let upper = stripped.to_ascii_uppercase();
    let bytes = upper.as_bytes();
    let chars = b32_alphabet_chars();

    let mut payload = String::with_capacity(52);
    for group in bytes.chunks(14) {
        if group.len() != 14 {
            return Err(IdentityError::Malformed);
        }
        let (data, check) = group.split_at(13);
        for &c in data {
            if !chars.contains(&c) {
                return Err(IdentityError::Malformed);
            }
        }
        if check[0] != check_char(data) {
            return Err(IdentityError::InvalidDeviceId);
        }
        payload.push_str(std::str::from_utf8(data).expect("ascii"));
    }

    let padded = format!("{payload}======");
    let decoded =
        base32::decode(Alphabet::RFC4648 { padding: true }, &padded).ok_or(IdentityError::Malformed)?;

    if decoded.len() != 32 {
        return Err(IdentityError::WrongLength);
    }

    let mut out = [0u8; 32];
    out.copy_from_slice(&decoded);
    Ok(out)
}
