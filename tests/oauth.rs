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

//! Integration tests for the OAuth 1.0a signing and handshake primitives.

use std::collections::BTreeMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use nautilus_ibkr::oauth::{
    lst::{calculate_live_session_token, calculate_prepend, validate_live_session_token},
    signer::{
        generate_authorization_header, generate_base_string, generate_hmac_sha256_signature,
        generate_oauth_nonce, generate_rsa_sha256_signature,
    },
};
use percent_encoding::percent_decode_str;
use rsa::{
    Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey,
    pkcs1v15::{Signature, VerifyingKey},
    sha2::Sha256,
    signature::Verifier,
};

fn access_token_request_params() -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("oauth_consumer_key".to_string(), "TESTCONS".to_string());
    params.insert(
        "oauth_nonce".to_string(),
        "B65wGkbQspBFN0lQjFZyIlr6ZA4T7iuw".to_string(),
    );
    params.insert(
        "oauth_signature_method".to_string(),
        "RSA-SHA256".to_string(),
    );
    params.insert("oauth_timestamp".to_string(), "1605211316".to_string());
    params.insert(
        "oauth_token".to_string(),
        "98cb431e61ae03817f6a".to_string(),
    );
    params.insert(
        "oauth_verifier".to_string(),
        "4e253ee389df74010b6b".to_string(),
    );
    params
}

#[test]
fn test_access_token_base_string_exact() {
    let base = generate_base_string(
        "POST",
        "https://api.ibkr.com/v1/api/oauth/access_token",
        &access_token_request_params(),
        None,
    );

    let expected = concat!(
        "POST&https%3A%2F%2Fapi.ibkr.com%2Fv1%2Fapi%2Foauth%2Faccess_token&",
        "oauth_consumer_key%3DTESTCONS",
        "%26oauth_nonce%3DB65wGkbQspBFN0lQjFZyIlr6ZA4T7iuw",
        "%26oauth_signature_method%3DRSA-SHA256",
        "%26oauth_timestamp%3D1605211316",
        "%26oauth_token%3D98cb431e61ae03817f6a",
        "%26oauth_verifier%3D4e253ee389df74010b6b",
    );
    assert_eq!(base, expected);
}

#[test]
fn test_signing_deterministic_given_nonce_and_timestamp() {
    // Same inputs (nonce and timestamp substituted) must reproduce the
    // identical signature.
    let params = access_token_request_params();
    let base_a = generate_base_string("POST", "https://api.ibkr.com/v1/api/x", &params, None);
    let base_b = generate_base_string("POST", "https://api.ibkr.com/v1/api/x", &params, None);

    let lst = BASE64.encode(b"session-token-bytes");
    assert_eq!(
        generate_hmac_sha256_signature(&base_a, &lst).unwrap(),
        generate_hmac_sha256_signature(&base_b, &lst).unwrap(),
    );
}

#[test]
fn test_authorization_header_order_lexicographic() {
    let mut params = access_token_request_params();
    params.insert("oauth_signature".to_string(), "sig".to_string());

    let header = generate_authorization_header(&params, "test_realm");

    assert!(header.starts_with("OAuth realm=\"test_realm\", "));
    let positions: Vec<usize> = [
        "oauth_consumer_key",
        "oauth_nonce",
        "oauth_signature",
        "oauth_signature_method",
        "oauth_timestamp",
        "oauth_token",
        "oauth_verifier",
    ]
    .iter()
    .map(|key| header.find(key).expect("key missing from header"))
    .collect();
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn test_rsa_signature_verifies_with_public_key() {
    let mut rng = rand::rngs::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("keygen failed");
    let public_key = RsaPublicKey::from(&private_key);

    let base = generate_base_string(
        "POST",
        "https://api.ibkr.com/v1/api/oauth/live_session_token",
        &access_token_request_params(),
        Some("deadbeef"),
    );
    let encoded = generate_rsa_sha256_signature(&base, &private_key);

    // Base64 contains no spaces, so percent-decoding alone restores it.
    let decoded = percent_decode_str(&encoded)
        .decode_utf8()
        .expect("invalid percent encoding");
    let der = BASE64.decode(decoded.as_ref()).expect("invalid base64");
    let signature = Signature::try_from(der.as_slice()).expect("invalid signature bytes");

    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    verifying_key
        .verify(base.as_bytes(), &signature)
        .expect("signature did not verify");
}

#[test]
fn test_prepend_round_trips_through_rsa() {
    let mut rng = rand::rngs::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("keygen failed");
    let public_key = RsaPublicKey::from(&private_key);

    let secret = b"raw-access-token-secret";
    let ciphertext = public_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, secret)
        .expect("encryption failed");
    let access_token_secret = BASE64.encode(&ciphertext);

    let prepend = calculate_prepend(&access_token_secret, &private_key).unwrap();

    assert_eq!(prepend, hex::encode(secret));
}

#[test]
fn test_live_session_token_end_to_end_validates() {
    // Small DH group keeps the math checkable by hand: prime 0x101 (257),
    // response 0x10 (16), random 3 gives K = 16^3 mod 257 = 4096 mod 257 = 241.
    let prepend = hex::encode(b"secret-bytes");
    let lst = calculate_live_session_token("101", "3", "10", &prepend).unwrap();

    // The gateway's signature is hex(HMAC-SHA1(LST, consumer_key)).
    use hmac::{Hmac, Mac};
    let mut mac = Hmac::<sha1::Sha1>::new_from_slice(&BASE64.decode(&lst).unwrap()).unwrap();
    mac.update(b"TESTCONS");
    let signature = hex::encode(mac.finalize().into_bytes());

    assert!(validate_live_session_token(&lst, &signature, "TESTCONS").unwrap());
    assert!(!validate_live_session_token(&lst, "00ff", "TESTCONS").unwrap());
}

#[test]
fn test_nonce_charset_and_uniqueness() {
    let nonces: Vec<String> = (0..32).map(|_| generate_oauth_nonce()).collect();

    for nonce in &nonces {
        assert_eq!(nonce.len(), 16);
        assert!(nonce.chars().all(|c| c.is_ascii_alphanumeric()));
    }
    let unique: std::collections::HashSet<&String> = nonces.iter().collect();
    assert_eq!(unique.len(), nonces.len());
}
