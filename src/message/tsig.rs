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

//! Client-side TSIG signing and verification ([RFC 8945]).
//!
//! Queries are signed with [`sign_query`], which appends the TSIG RR
//! and returns the request MAC. Responses are checked with
//! [`verify_response`], which locates the TSIG RR (it must be the last
//! record), recomputes the MAC over the request MAC, the message with
//! the TSIG removed, and the TSIG variables, and checks the time
//! window.
//!
//! [RFC 8945]: https://datatracker.ietf.org/doc/html/rfc8945

use std::fmt;

use hmac::digest::{MacError, OutputSizeUser};
use hmac::{Hmac, Mac};
use lazy_static::lazy_static;
use sha1::Sha1;
use sha2::Sha256;

use crate::class::Class;
use crate::message::{writer, Reader, HEADER_SIZE};
use crate::name::Name;
use crate::rr::Type;

/// The fudge value (in seconds) we put in signed queries
/// ([RFC 8945 § 10]).
///
/// [RFC 8945 § 10]: https://datatracker.ietf.org/doc/html/rfc8945#section-10
pub const DEFAULT_FUDGE: u16 = 300;

lazy_static! {
    static ref HMAC_SHA1_NAME: Name = "hmac-sha1.".parse().unwrap();
    static ref HMAC_SHA256_NAME: Name = "hmac-sha256.".parse().unwrap();
}

////////////////////////////////////////////////////////////////////////
// TSIG ALGORITHMS AND KEYS                                           //
////////////////////////////////////////////////////////////////////////

/// A supported TSIG algorithm.
///
/// We currently implement the two algorithms required by
/// [RFC 8945 § 6]: HMAC-SHA1 and HMAC-SHA256.
///
/// [RFC 8945 § 6]: https://datatracker.ietf.org/doc/html/rfc8945#section-6
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Algorithm {
    HmacSha1,
    HmacSha256,
}

impl Algorithm {
    /// Returns the name assigned (by [RFC 8945 § 6]) to identify this
    /// algorithm.
    ///
    /// [RFC 8945 § 6]: https://datatracker.ietf.org/doc/html/rfc8945#section-6
    pub fn name(&self) -> &'static Name {
        match self {
            Self::HmacSha1 => &HMAC_SHA1_NAME,
            Self::HmacSha256 => &HMAC_SHA256_NAME,
        }
    }

    /// Returns the size of the MAC produced by this algorithm.
    pub fn output_size(&self) -> usize {
        match self {
            Self::HmacSha1 => Hmac::<Sha1>::output_size(),
            Self::HmacSha256 => Hmac::<Sha256>::output_size(),
        }
    }

    /// Finds an algorithm by its assigned name. This returns `None`
    /// if the algorithm is not defined or not supported by this
    /// implementation.
    pub fn from_name(name: &Name) -> Option<Self> {
        if name == &*HMAC_SHA1_NAME {
            Some(Self::HmacSha1)
        } else if name == &*HMAC_SHA256_NAME {
            Some(Self::HmacSha256)
        } else {
            None
        }
    }

    /// Creates a MAC authenticator to compute a MAC with this
    /// algorithm and the given key.
    fn make_authenticator(&self, key: &[u8]) -> Box<dyn Authenticator> {
        // HMAC accepts keys of any length, so construction cannot
        // fail.
        match self {
            Self::HmacSha1 => Box::new(Hmac::<Sha1>::new_from_slice(key).unwrap()),
            Self::HmacSha256 => Box::new(Hmac::<Sha256>::new_from_slice(key).unwrap()),
        }
    }
}

/// A TSIG key shared with a nameserver.
#[derive(Clone, Debug)]
pub struct Key {
    pub name: Name,
    pub algorithm: Algorithm,
    pub secret: Vec<u8>,
}

////////////////////////////////////////////////////////////////////////
// MAC HELPERS                                                        //
////////////////////////////////////////////////////////////////////////

/// An abstraction over different MAC implementations. Basically, this
/// wraps the `digest` crate's [`Mac`] trait to give us an object-safe
/// trait (so that we can use `Box<dyn Authenticator>`).
trait Authenticator {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> Box<[u8]>;
    fn verify_truncated_left(self: Box<Self>, tag: &[u8]) -> Result<(), MacError>;
}

impl<M> Authenticator for M
where
    M: Mac,
{
    fn update(&mut self, data: &[u8]) {
        <Self as Mac>::update(self, data);
    }

    fn finalize(self: Box<Self>) -> Box<[u8]> {
        <Self as Mac>::finalize(*self)
            .into_bytes()
            .to_vec()
            .into_boxed_slice()
    }

    fn verify_truncated_left(self: Box<Self>, tag: &[u8]) -> Result<(), MacError> {
        <Self as Mac>::verify_truncated_left(*self, tag)
    }
}

/// The TSIG variables of [RFC 8945 § 4.3.3] that enter the MAC.
struct Variables<'a> {
    key_name: &'a Name,
    algorithm: &'a Name,
    time_signed: u64,
    fudge: u16,
    error: u16,
    other: &'a [u8],
}

fn add_tsig_variables(authenticator: &mut dyn Authenticator, vars: &Variables) {
    authenticator.update(&vars.key_name.canonical_wire());
    authenticator.update(b"\x00\xff\x00\x00\x00\x00");
    authenticator.update(&vars.algorithm.canonical_wire());
    authenticator.update(&time_signed_wire(vars.time_signed));
    authenticator.update(&vars.fudge.to_be_bytes());
    authenticator.update(&vars.error.to_be_bytes());
    authenticator.update(&(vars.other.len() as u16).to_be_bytes());
    authenticator.update(vars.other);
}

/// Encodes the 48-bit time-signed field.
fn time_signed_wire(time_signed: u64) -> [u8; 6] {
    let octets = time_signed.to_be_bytes();
    [
        octets[2], octets[3], octets[4], octets[5], octets[6], octets[7],
    ]
}

////////////////////////////////////////////////////////////////////////
// QUERY SIGNING                                                      //
////////////////////////////////////////////////////////////////////////

/// Signs a query message in place, appending the TSIG RR and
/// incrementing the ARCOUNT. On success, the request MAC is returned;
/// the caller keeps it to verify the response.
pub fn sign_query(message: &mut Vec<u8>, key: &Key, now: u64) -> Result<Vec<u8>, SignError> {
    if key.secret.is_empty() {
        return Err(SignError::UnusableKey);
    }
    let original_id = u16::from_be_bytes([message[0], message[1]]);

    let mut authenticator = key.algorithm.make_authenticator(&key.secret);
    authenticator.update(message);
    add_tsig_variables(
        authenticator.as_mut(),
        &Variables {
            key_name: &key.name,
            algorithm: key.algorithm.name(),
            time_signed: now,
            fudge: DEFAULT_FUDGE,
            error: 0,
            other: &[],
        },
    );
    let mac = authenticator.finalize().to_vec();

    let mut rdata =
        Vec::with_capacity(key.algorithm.name().wire_len() + 16 + mac.len());
    rdata.extend_from_slice(key.algorithm.name().wire_repr());
    rdata.extend_from_slice(&time_signed_wire(now));
    rdata.extend_from_slice(&DEFAULT_FUDGE.to_be_bytes());
    rdata.extend_from_slice(&(mac.len() as u16).to_be_bytes());
    rdata.extend_from_slice(&mac);
    rdata.extend_from_slice(&original_id.to_be_bytes());
    rdata.extend_from_slice(&0u16.to_be_bytes()); // error
    rdata.extend_from_slice(&0u16.to_be_bytes()); // other length

    writer::append_rr(message, &key.name, Type::TSIG, Class::ANY, 0, &rdata);
    let arcount = u16::from_be_bytes([message[10], message[11]]) + 1;
    message[10..12].copy_from_slice(&arcount.to_be_bytes());
    Ok(mac)
}

////////////////////////////////////////////////////////////////////////
// RESPONSE VERIFICATION                                              //
////////////////////////////////////////////////////////////////////////

/// Verifies the TSIG RR on a response, given the key and the request
/// MAC. The TSIG RR must be the last record of the message.
pub fn verify_response(
    response: &[u8],
    key: &Key,
    request_mac: &[u8],
    now: u64,
) -> Result<(), VerifyError> {
    let tsig = locate_tsig(response)?;
    if tsig.key_name != key.name {
        return Err(VerifyError::UnknownKey);
    }
    if Algorithm::from_name(&tsig.algorithm) != Some(key.algorithm) {
        return Err(VerifyError::UnknownAlgorithm);
    }
    check_mac_size(key.algorithm, tsig.mac.len())?;

    let mut authenticator = key.algorithm.make_authenticator(&key.secret);
    authenticator.update(&(request_mac.len() as u16).to_be_bytes());
    authenticator.update(request_mac);
    // The message enters the MAC with the original ID restored, the
    // ARCOUNT decremented, and the TSIG RR removed
    // (RFC 8945 § 4.3.2).
    authenticator.update(&tsig.original_id.to_be_bytes());
    authenticator.update(&response[2..10]);
    let arcount = u16::from_be_bytes([response[10], response[11]]);
    authenticator.update(&(arcount - 1).to_be_bytes());
    authenticator.update(&response[HEADER_SIZE..tsig.rr_start]);
    add_tsig_variables(
        authenticator.as_mut(),
        &Variables {
            key_name: &tsig.key_name,
            algorithm: &tsig.algorithm,
            time_signed: tsig.time_signed,
            fudge: tsig.fudge,
            error: tsig.error,
            other: &tsig.other,
        },
    );
    authenticator
        .verify_truncated_left(&tsig.mac)
        .or(Err(VerifyError::BadSig))?;

    // RFC 8945 § 5.2.3: the time signed must be close enough to our
    // clock.
    let window_start = tsig.time_signed.saturating_sub(tsig.fudge as u64);
    let window_end = tsig.time_signed.saturating_add(tsig.fudge as u64);
    if now < window_start || now > window_end {
        return Err(VerifyError::BadTime);
    }
    Ok(())
}

/// Ensures that any MAC truncation meets the minimum requirements of
/// [RFC 8945 § 5.2.2.1].
///
/// [RFC 8945 § 5.2.2.1]: https://datatracker.ietf.org/doc/html/rfc8945#section-5.2.2.1
fn check_mac_size(algorithm: Algorithm, mac_size: usize) -> Result<(), VerifyError> {
    let half_output_size = (algorithm.output_size() + 1) / 2;
    if mac_size > algorithm.output_size() || mac_size < 10.max(half_output_size) {
        Err(VerifyError::FormErr)
    } else {
        Ok(())
    }
}

/// The fields of a TSIG RR found on a response.
struct FoundTsig {
    rr_start: usize,
    key_name: Name,
    algorithm: Name,
    time_signed: u64,
    fudge: u16,
    mac: Vec<u8>,
    original_id: u16,
    error: u16,
    other: Vec<u8>,
}

/// Walks the response and extracts its TSIG RR, which must be the last
/// record in the additional section.
fn locate_tsig(response: &[u8]) -> Result<FoundTsig, VerifyError> {
    let (header, mut reader) = Reader::new(response).or(Err(VerifyError::FormErr))?;
    if header.arcount == 0 {
        return Err(VerifyError::MissingTsig);
    }
    for _ in 0..header.qdcount {
        reader.read_question().or(Err(VerifyError::FormErr))?;
    }
    let records = header.ancount as usize + header.nscount as usize + header.arcount as usize;
    let mut rr_start = reader.position();
    let mut last = None;
    for _ in 0..records {
        rr_start = reader.position();
        last = Some(reader.read_rr().or(Err(VerifyError::FormErr))?);
    }
    let last = last.ok_or(VerifyError::MissingTsig)?;
    if last.rr_type != Type::TSIG {
        return Err(VerifyError::MissingTsig);
    }
    if last.class != Class::ANY || u32::from(last.ttl) != 0 {
        return Err(VerifyError::FormErr);
    }

    let rdata = &last.rdata;
    let (algorithm, algo_len) =
        Name::try_from_uncompressed(rdata).or(Err(VerifyError::FormErr))?;
    if rdata.len() < algo_len + 10 {
        return Err(VerifyError::FormErr);
    }
    let mut time = [0; 8];
    time[2..8].copy_from_slice(&rdata[algo_len..algo_len + 6]);
    let time_signed = u64::from_be_bytes(time);
    let fudge = u16::from_be_bytes([rdata[algo_len + 6], rdata[algo_len + 7]]);
    let mac_size = u16::from_be_bytes([rdata[algo_len + 8], rdata[algo_len + 9]]) as usize;
    if rdata.len() < algo_len + 10 + mac_size + 6 {
        return Err(VerifyError::FormErr);
    }
    let mac = rdata[algo_len + 10..algo_len + 10 + mac_size].to_vec();
    let rest = &rdata[algo_len + 10 + mac_size..];
    let original_id = u16::from_be_bytes([rest[0], rest[1]]);
    let error = u16::from_be_bytes([rest[2], rest[3]]);
    let other_len = u16::from_be_bytes([rest[4], rest[5]]) as usize;
    if rest.len() != 6 + other_len {
        return Err(VerifyError::FormErr);
    }
    Ok(FoundTsig {
        rr_start,
        key_name: last.name,
        algorithm,
        time_signed,
        fudge,
        mac,
        original_id,
        error,
        other: rest[6..].to_vec(),
    })
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error signing a query. A nameserver whose key produces this is
/// skipped rather than failing the whole transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignError {
    UnusableKey,
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnusableKey => f.write_str("TSIG key is unusable"),
        }
    }
}

impl std::error::Error for SignError {}

/// An error verifying the TSIG RR on a response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerifyError {
    MissingTsig,
    UnknownKey,
    UnknownAlgorithm,
    BadSig,
    BadTime,
    FormErr,
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MissingTsig => f.write_str("response has no TSIG RR"),
            Self::UnknownKey => f.write_str("response TSIG names an unknown key"),
            Self::UnknownAlgorithm => f.write_str("response TSIG names an unknown algorithm"),
            Self::BadSig => f.write_str("response TSIG MAC is invalid"),
            Self::BadTime => f.write_str("response TSIG time is outside the allowed window"),
            Self::FormErr => f.write_str("response TSIG RR is malformed"),
        }
    }
}

impl std::error::Error for VerifyError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::writer::build_query;

    const NOW: u64 = 1_690_000_000;

    fn key() -> Key {
        Key {
            name: "test-key.".parse().unwrap(),
            algorithm: Algorithm::HmacSha256,
            secret: b"topsecret".to_vec(),
        }
    }

    /// Signs a response the way a server would, for the verification
    /// tests.
    fn sign_response(message: &mut Vec<u8>, key: &Key, request_mac: &[u8], now: u64) {
        let original_id = u16::from_be_bytes([message[0], message[1]]);
        let mut authenticator = key.algorithm.make_authenticator(&key.secret);
        authenticator.update(&(request_mac.len() as u16).to_be_bytes());
        authenticator.update(request_mac);
        authenticator.update(message);
        add_tsig_variables(
            authenticator.as_mut(),
            &Variables {
                key_name: &key.name,
                algorithm: key.algorithm.name(),
                time_signed: now,
                fudge: DEFAULT_FUDGE,
                error: 0,
                other: &[],
            },
        );
        let mac = authenticator.finalize().to_vec();
        let mut rdata = Vec::new();
        rdata.extend_from_slice(key.algorithm.name().wire_repr());
        rdata.extend_from_slice(&time_signed_wire(now));
        rdata.extend_from_slice(&DEFAULT_FUDGE.to_be_bytes());
        rdata.extend_from_slice(&(mac.len() as u16).to_be_bytes());
        rdata.extend_from_slice(&mac);
        rdata.extend_from_slice(&original_id.to_be_bytes());
        rdata.extend_from_slice(&0u16.to_be_bytes());
        rdata.extend_from_slice(&0u16.to_be_bytes());
        writer::append_rr(message, &key.name, Type::TSIG, Class::ANY, 0, &rdata);
        let arcount = u16::from_be_bytes([message[10], message[11]]) + 1;
        message[10..12].copy_from_slice(&arcount.to_be_bytes());
    }

    fn query_and_response() -> (Vec<u8>, Vec<u8>) {
        let name: Name = "example.com.".parse().unwrap();
        let query = build_query(0x1111, &name, Type::A, Class::IN, None);
        let mut response = query.clone();
        response[2] |= 0x80; // QR
        (query, response)
    }

    #[test]
    fn signed_query_carries_tsig() {
        let (mut query, _) = query_and_response();
        let mac = sign_query(&mut query, &key(), NOW).unwrap();
        assert_eq!(mac.len(), Algorithm::HmacSha256.output_size());
        let found = locate_tsig(&query).unwrap();
        assert_eq!(found.mac, mac);
        assert_eq!(found.original_id, 0x1111);
        assert_eq!(found.time_signed, NOW);
    }

    #[test]
    fn valid_response_verifies() {
        let (mut query, mut response) = query_and_response();
        let mac = sign_query(&mut query, &key(), NOW).unwrap();
        sign_response(&mut response, &key(), &mac, NOW);
        assert_eq!(verify_response(&response, &key(), &mac, NOW + 10), Ok(()));
    }

    #[test]
    fn tampered_response_fails() {
        let (mut query, mut response) = query_and_response();
        let mac = sign_query(&mut query, &key(), NOW).unwrap();
        sign_response(&mut response, &key(), &mac, NOW);
        response[4] ^= 1; // flip a bit in QDCOUNT
        response[5] ^= 1;
        assert!(matches!(
            verify_response(&response, &key(), &mac, NOW),
            Err(VerifyError::BadSig) | Err(VerifyError::FormErr)
        ));
    }

    #[test]
    fn stale_response_fails() {
        let (mut query, mut response) = query_and_response();
        let mac = sign_query(&mut query, &key(), NOW).unwrap();
        sign_response(&mut response, &key(), &mac, NOW);
        assert_eq!(
            verify_response(&response, &key(), &mac, NOW + DEFAULT_FUDGE as u64 + 1),
            Err(VerifyError::BadTime)
        );
    }

    #[test]
    fn unsigned_response_is_missing_tsig() {
        let (_, response) = query_and_response();
        assert_eq!(
            verify_response(&response, &key(), &[], NOW),
            Err(VerifyError::MissingTsig)
        );
    }

    #[test]
    fn wrong_key_name_is_rejected() {
        let (mut query, mut response) = query_and_response();
        let mac = sign_query(&mut query, &key(), NOW).unwrap();
        let other = Key {
            name: "other-key.".parse().unwrap(),
            ..key()
        };
        sign_response(&mut response, &other, &mac, NOW);
        assert_eq!(
            verify_response(&response, &key(), &mac, NOW),
            Err(VerifyError::UnknownKey)
        );
    }
}
