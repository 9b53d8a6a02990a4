// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2026 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Live-session-token handshake primitives.
//!
//! The live session token (LST) is a short-lived symmetric key derived from a
//! Diffie-Hellman exchange combined with the RSA-decrypted access token secret.
//! Once obtained it becomes the HMAC-SHA256 key for signing every protected
//! request until it expires.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use rand::RngCore;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey};
use sha1::Sha1;

use crate::http::error::{IbkrHttpError, IbkrHttpResult};

type HmacSha1 = Hmac<Sha1>;

/// Reads an RSA private key from a PEM file (PKCS#8 or PKCS#1).
///
/// # Errors
///
/// Returns a config error if the file cannot be read or parsed.
pub fn read_private_key(path: &std::path::Path) -> IbkrHttpResult<RsaPrivateKey> {
    let pem = std::fs::read_to_string(path).map_err(|e| {
        IbkrHttpError::Config(format!("cannot read private key {}: {e}", path.display()))
    })?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| {
            IbkrHttpError::Config(format!("cannot parse private key {}: {e}", path.display()))
        })
}

/// Generates a random 256-bit value as lowercase hex, used as the DH exponent.
#[must_use]
pub fn generate_dh_random() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    BigUint::from_bytes_be(&bytes).to_str_radix(16)
}

/// Computes the DH challenge `generator^random mod prime` as lowercase hex.
///
/// # Errors
///
/// Returns an auth error if a hex value fails to parse.
pub fn generate_dh_challenge(
    dh_prime: &str,
    dh_random: &str,
    dh_generator: u32,
) -> IbkrHttpResult<String> {
    let prime = parse_hex(dh_prime, "dh_prime")?;
    let random = parse_hex(dh_random, "dh_random")?;
    let challenge = BigUint::from(dh_generator).modpow(&random, &prime);
    Ok(challenge.to_str_radix(16))
}

/// Decrypts the base64 access token secret with PKCS#1 v1.5, returning the
/// plaintext as lowercase hex. This value is the `prepend` of the handshake
/// base string.
///
/// # Errors
///
/// Returns an auth error if decoding or decryption fails.
pub fn calculate_prepend(
    access_token_secret: &str,
    encryption_key: &RsaPrivateKey,
) -> IbkrHttpResult<String> {
    let ciphertext = BASE64.decode(access_token_secret).map_err(|e| {
        IbkrHttpError::Authentication(format!("access token secret is not valid base64: {e}"))
    })?;
    let plaintext = encryption_key
        .decrypt(Pkcs1v15Encrypt, &ciphertext)
        .map_err(|e| {
            IbkrHttpError::Authentication(format!("access token secret decryption failed: {e}"))
        })?;
    Ok(hex::encode(plaintext))
}

/// Serializes a big integer as big-endian bytes with Java's sign-bit
/// convention: a leading zero byte is prepended whenever the bit length is
/// divisible by eight.
#[must_use]
pub fn to_byte_array(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    if value.bits() % 8 == 0 {
        let mut out = Vec::with_capacity(bytes.len() + 1);
        out.push(0u8);
        out.extend_from_slice(&bytes);
        out
    } else {
        bytes
    }
}

/// Derives the live session token from the DH exchange.
///
/// The shared secret `K = dh_response^dh_random mod dh_prime` keys an
/// HMAC-SHA1 over the raw access-token-secret bytes (the hex decoding of the
/// prepend); the LST is the base64 digest.
///
/// # Errors
///
/// Returns an auth error if a hex value fails to parse.
pub fn calculate_live_session_token(
    dh_prime: &str,
    dh_random: &str,
    dh_response: &str,
    prepend: &str,
) -> IbkrHttpResult<String> {
    let prime = parse_hex(dh_prime, "dh_prime")?;
    let random = parse_hex(dh_random, "dh_random")?;
    let response = parse_hex(dh_response, "diffie_hellman_response")?;

    let shared_secret = response.modpow(&random, &prime);

    let secret_bytes = hex::decode(prepend)
        .map_err(|e| IbkrHttpError::Authentication(format!("prepend is not valid hex: {e}")))?;

    let mut mac = HmacSha1::new_from_slice(&to_byte_array(&shared_secret))
        .map_err(|e| IbkrHttpError::Authentication(format!("HMAC key error: {e}")))?;
    mac.update(&secret_bytes);

    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Validates the computed LST against the server-returned signature:
/// `hex(HMAC-SHA1(LST, consumer_key)) == signature`.
///
/// # Errors
///
/// Returns an auth error if the LST is not valid base64.
pub fn validate_live_session_token(
    live_session_token: &str,
    live_session_token_signature: &str,
    consumer_key: &str,
) -> IbkrHttpResult<bool> {
    let key = BASE64.decode(live_session_token).map_err(|e| {
        IbkrHttpError::Authentication(format!("live session token is not valid base64: {e}"))
    })?;
    let mut mac = HmacSha1::new_from_slice(&key)
        .map_err(|e| IbkrHttpError::Authentication(format!("HMAC key error: {e}")))?;
    mac.update(consumer_key.as_bytes());

    Ok(hex::encode(mac.finalize().into_bytes()) == live_session_token_signature)
}

fn parse_hex(value: &str, field: &str) -> IbkrHttpResult<BigUint> {
    BigUint::parse_bytes(value.as_bytes(), 16)
        .ok_or_else(|| IbkrHttpError::Authentication(format!("{field} is not valid hex: '{value}'")))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("ff", vec![0x00, 0xff])]
    #[case("7f", vec![0x7f])]
    #[case("0100", vec![0x01, 0x00])]
    #[case("80", vec![0x00, 0x80])]
    fn test_to_byte_array_sign_bit(#[case] hex_value: &str, #[case] expected: Vec<u8>) {
        let value = BigUint::parse_bytes(hex_value.as_bytes(), 16).unwrap();

        assert_eq!(to_byte_array(&value), expected);
    }

    #[rstest]
    fn test_dh_random_is_lowercase_hex() {
        let random = generate_dh_random();

        assert!(!random.is_empty());
        assert!(random.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(random, random.to_lowercase());
    }

    #[rstest]
    fn test_dh_challenge_small_values() {
        // 2^5 mod 23 = 32 mod 23 = 9
        let challenge = generate_dh_challenge("17", "5", 2).unwrap();

        assert_eq!(challenge, "9");
    }

    #[rstest]
    fn test_dh_challenge_rejects_bad_hex() {
        assert!(generate_dh_challenge("zz", "5", 2).is_err());
    }

    #[rstest]
    fn test_live_session_token_round_trip_validates() {
        // Small DH group: prime 23 (0x17), generator 5, exponent 6, response 8.
        let prepend = "a1b2c3d4";
        let lst = calculate_live_session_token("17", "6", "8", prepend).unwrap();

        let key = BASE64.decode(&lst).unwrap();
        let mut mac = HmacSha1::new_from_slice(&key).unwrap();
        mac.update(b"TESTCONS");
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(validate_live_session_token(&lst, &signature, "TESTCONS").unwrap());
        assert!(!validate_live_session_token(&lst, &signature, "OTHERCONS").unwrap());
    }

    #[rstest]
    fn test_live_session_token_pads_byte_aligned_secret() {
        // random = 1 makes the shared secret equal dh_response mod prime:
        // 0xff mod 0x101 = 0xff, whose bit length (8) is byte-aligned, so the
        // HMAC key must carry the leading zero byte.
        let prepend = "a1b2c3d4";
        let lst = calculate_live_session_token("101", "1", "ff", prepend).unwrap();

        let mut mac = HmacSha1::new_from_slice(&[0x00, 0xff]).unwrap();
        mac.update(&hex::decode(prepend).unwrap());
        let expected = BASE64.encode(mac.finalize().into_bytes());

        assert_eq!(lst, expected);
    }
}
