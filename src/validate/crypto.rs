// Copyright 2023 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Per-algorithm RRSIG signature verification.
//!
//! Public keys arrive in their DNS wire encodings: RSA per [RFC 3110]
//! (which also covers the RSA/MD5 layout of RFC 2537) and DSA per
//! [RFC 2536]. Signatures are raw: an RSA signature is the bare
//! PKCS#1 v1.5 block, a DSA signature is `T || R || S` with 20-octet
//! `R` and `S`.
//!
//! [RFC 3110]: https://datatracker.ietf.org/doc/html/rfc3110
//! [RFC 2536]: https://datatracker.ietf.org/doc/html/rfc2536

use md5::Md5;
use num_bigint_dig::BigUint;
use rsa::RsaPublicKey;
use sha1::digest::const_oid::AssociatedOid;
use sha1::{Digest, Sha1};
use signature::{DigestVerifier, Verifier};

// DNS security algorithm numbers (RFC 4034 App. A.1). Algorithms 2
// (Diffie-Hellman) and 4 (reserved) do not sign data and are refused
// outright.
const ALGORITHM_RSA_MD5: u8 = 1;
const ALGORITHM_DH: u8 = 2;
const ALGORITHM_DSA_SHA1: u8 = 3;
const ALGORITHM_RESERVED_ECC: u8 = 4;
const ALGORITHM_RSA_SHA1: u8 = 5;

/// The outcome of a raw signature check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    /// The signature verifies.
    Good,
    /// The signature does not verify.
    Bad,
    /// The public key's wire encoding is unusable.
    BadKey,
    /// The algorithm is known but refused (it cannot sign data).
    AlgorithmRefused,
    /// The algorithm number is not one we implement.
    UnknownAlgorithm,
}

/// Verifies `signature` over `message` with a public key in DNS wire
/// encoding, dispatching on the security algorithm number.
pub fn verify(algorithm: u8, public_key: &[u8], message: &[u8], signature: &[u8]) -> Verdict {
    match algorithm {
        ALGORITHM_RSA_MD5 => verify_rsa::<Md5>(public_key, message, signature),
        ALGORITHM_RSA_SHA1 => verify_rsa::<Sha1>(public_key, message, signature),
        ALGORITHM_DSA_SHA1 => verify_dsa(public_key, message, signature),
        ALGORITHM_DH | ALGORITHM_RESERVED_ECC => Verdict::AlgorithmRefused,
        _ => Verdict::UnknownAlgorithm,
    }
}

////////////////////////////////////////////////////////////////////////
// RSA                                                                //
////////////////////////////////////////////////////////////////////////

fn verify_rsa<D>(public_key: &[u8], message: &[u8], signature: &[u8]) -> Verdict
where
    D: Digest + AssociatedOid,
{
    let key = match rsa_key_from_wire(public_key) {
        Some(key) => key,
        None => return Verdict::BadKey,
    };
    let signature = match rsa::pkcs1v15::Signature::try_from(signature) {
        Ok(signature) => signature,
        Err(_) => return Verdict::Bad,
    };
    let verifying_key = rsa::pkcs1v15::VerifyingKey::<D>::new(key);
    match verifying_key.verify(message, &signature) {
        Ok(()) => Verdict::Good,
        Err(_) => Verdict::Bad,
    }
}

/// Decodes an RSA public key from its RFC 3110 wire form: a one-octet
/// exponent length (or zero followed by a two-octet length), the
/// exponent, then the modulus.
fn rsa_key_from_wire(key: &[u8]) -> Option<RsaPublicKey> {
    let (exponent_len, offset) = match *key.first()? {
        0 => {
            if key.len() < 3 {
                return None;
            }
            (u16::from_be_bytes([key[1], key[2]]) as usize, 3)
        }
        len => (len as usize, 1),
    };
    if key.len() <= offset + exponent_len {
        return None;
    }
    let exponent = BigUint::from_bytes_be(&key[offset..offset + exponent_len]);
    let modulus = BigUint::from_bytes_be(&key[offset + exponent_len..]);
    RsaPublicKey::new(modulus, exponent).ok()
}

////////////////////////////////////////////////////////////////////////
// DSA                                                                //
////////////////////////////////////////////////////////////////////////

/// The size of the DSA subgroup order Q and of each signature half.
const DSA_SUBGROUP_SIZE: usize = 20;

fn verify_dsa(public_key: &[u8], message: &[u8], signature: &[u8]) -> Verdict {
    let key = match dsa_key_from_wire(public_key) {
        Some(key) => key,
        None => return Verdict::BadKey,
    };
    // RFC 2536 § 3: T, then two 20-octet halves.
    if signature.len() != 1 + 2 * DSA_SUBGROUP_SIZE {
        return Verdict::Bad;
    }
    let r = &signature[1..1 + DSA_SUBGROUP_SIZE];
    let s = &signature[1 + DSA_SUBGROUP_SIZE..];
    let signature = match dsa::Signature::try_from(der_signature(r, s).as_slice()) {
        Ok(signature) => signature,
        Err(_) => return Verdict::Bad,
    };
    match key.verify_digest(Sha1::new_with_prefix(message), &signature) {
        Ok(()) => Verdict::Good,
        Err(_) => Verdict::Bad,
    }
}

/// Decodes a DSA public key from its RFC 2536 wire form: T, the
/// 20-octet Q, then P, G, and Y, each of 64 + T*8 octets.
fn dsa_key_from_wire(key: &[u8]) -> Option<dsa::VerifyingKey> {
    let t = *key.first()? as usize;
    if t > 8 {
        return None;
    }
    let field_size = 64 + t * 8;
    if key.len() != 1 + DSA_SUBGROUP_SIZE + 3 * field_size {
        return None;
    }
    let q = BigUint::from_bytes_be(&key[1..1 + DSA_SUBGROUP_SIZE]);
    let mut offset = 1 + DSA_SUBGROUP_SIZE;
    let p = BigUint::from_bytes_be(&key[offset..offset + field_size]);
    offset += field_size;
    let g = BigUint::from_bytes_be(&key[offset..offset + field_size]);
    offset += field_size;
    let y = BigUint::from_bytes_be(&key[offset..offset + field_size]);
    let components = dsa::Components::from_components(p, q, g).ok()?;
    dsa::VerifyingKey::from_components(components, y).ok()
}

/// Encodes an (R, S) pair as the DER `Dss-Sig-Value` structure the
/// `dsa` crate parses.
fn der_signature(r: &[u8], s: &[u8]) -> Vec<u8> {
    let r = der_integer(r);
    let s = der_integer(s);
    let mut der = Vec::with_capacity(2 + r.len() + s.len());
    der.push(0x30);
    der.push((r.len() + s.len()) as u8);
    der.extend_from_slice(&r);
    der.extend_from_slice(&s);
    der
}

fn der_integer(value: &[u8]) -> Vec<u8> {
    let mut stripped = value;
    while stripped.len() > 1 && stripped[0] == 0 {
        stripped = &stripped[1..];
    }
    let pad = stripped.first().map_or(true, |&first| first & 0x80 != 0);
    let mut der = Vec::with_capacity(2 + stripped.len() + usize::from(pad));
    der.push(0x02);
    der.push((stripped.len() + usize::from(pad)) as u8);
    if pad {
        der.push(0);
    }
    der.extend_from_slice(stripped);
    der
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
