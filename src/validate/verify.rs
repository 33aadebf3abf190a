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

//! RRSIG checking over RRsets: precondition checks, canonical
//! signed-data reconstruction ([RFC 4035 § 5.3]), and per-set
//! aggregation of signature outcomes.
//!
//! [RFC 4035 § 5.3]: https://datatracker.ietf.org/doc/html/rfc4035#section-5.3

use log::trace;

use crate::rr::dnssec::{Dnskey, Rrsig, DNSKEY_PROTOCOL};
use crate::rr::Rrset;
use crate::validate::crypto::{self, Verdict};

/// The outcome of checking one signature (or, aggregated, an RRset's
/// signatures) against candidate keys.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigStatus {
    Verified,
    /// The signature's expiration time has passed.
    Expired,
    /// The signature's inception time has not arrived.
    NotYetActive,
    /// The key's algorithm cannot sign data.
    AlgorithmRefused,
    /// The algorithm number is not one we implement.
    UnknownAlgorithm,
    /// The key's wire encoding is unusable.
    BadKey,
    /// The cryptographic check failed.
    Invalid,
    /// The signature claims more labels than the owner name has.
    WrongLabelCount,
    /// The signer is not an ancestor of the owner name.
    WrongSigner,
    /// The key does not carry the zone-key flag.
    NotZoneKey,
    /// The key's protocol field is not 3.
    WrongProtocol,
    /// The key and signature algorithms differ.
    AlgorithmMismatch,
    /// The key's tag differs from the signature's.
    KeyTagMismatch,
    /// The RRset carries no signature at all.
    Unsigned,
}

/// Policy-driven knobs applied while checking signatures.
#[derive(Clone, Copy, Debug)]
pub struct Checks {
    /// Tolerated clock skew in seconds, widening the validity window
    /// on both sides; negative disables the time checks entirely.
    pub clock_skew: i64,
    /// Accept signatures whose expiration time has passed.
    pub accept_expired: bool,
    /// How many signatures must verify per RRset; zero means one.
    pub must_verify: u32,
}

impl Default for Checks {
    fn default() -> Self {
        Self {
            clock_skew: 0,
            accept_expired: false,
            must_verify: 0,
        }
    }
}

impl SigStatus {
    /// Ranks how much a failure tells the caller, so aggregation over
    /// several signatures and keys reports the most meaningful one.
    /// A failed cryptographic check outranks a key that was never a
    /// candidate in the first place.
    fn informativeness(self) -> u8 {
        match self {
            Self::Verified => 13,
            Self::Expired => 12,
            Self::NotYetActive => 11,
            Self::AlgorithmRefused => 10,
            Self::UnknownAlgorithm => 9,
            Self::BadKey => 8,
            Self::Invalid => 7,
            Self::WrongLabelCount => 6,
            Self::WrongSigner => 5,
            Self::NotZoneKey => 4,
            Self::WrongProtocol => 3,
            Self::AlgorithmMismatch => 2,
            Self::KeyTagMismatch => 1,
            Self::Unsigned => 0,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// CANONICAL SIGNED DATA                                              //
////////////////////////////////////////////////////////////////////////

/// Reconstructs the exact octets that `sig` signs over `rrset`: the
/// RRSIG RDATA through the signer name, then every record of the set
/// re-serialized with the lowercased owner (or the wildcard name the
/// signature's label count implies), the RRSIG's original TTL, and the
/// records sorted into canonical order.
pub fn signed_data(rrset: &Rrset, sig: &Rrsig) -> Result<Vec<u8>, SigStatus> {
    let owner_labels = rrset.name.len() - 1;
    let sig_labels = sig.labels as usize;
    if sig_labels > owner_labels {
        return Err(SigStatus::WrongLabelCount);
    }
    let owner_wire = if sig_labels < owner_labels {
        rrset.name.wildcard_of_suffix(sig_labels).canonical_wire()
    } else {
        rrset.name.canonical_wire()
    };

    let mut records: Vec<&Vec<u8>> = rrset.rdata.iter().collect();
    records.sort();

    let mut data = sig.rdata_through_signer();
    for rdata in records {
        data.extend_from_slice(&owner_wire);
        data.extend_from_slice(&u16::from(rrset.rr_type).to_be_bytes());
        data.extend_from_slice(&u16::from(rrset.class).to_be_bytes());
        data.extend_from_slice(&sig.original_ttl.to_be_bytes());
        data.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        data.extend_from_slice(rdata);
    }
    Ok(data)
}

////////////////////////////////////////////////////////////////////////
// SIGNATURE CHECKS                                                   //
////////////////////////////////////////////////////////////////////////

/// Checks one signature over `rrset` with one candidate key.
pub fn check_signature(
    rrset: &Rrset,
    sig: &Rrsig,
    key: &Dnskey,
    now: u64,
    checks: &Checks,
) -> SigStatus {
    if !key.is_zone_key() {
        return SigStatus::NotZoneKey;
    }
    if key.protocol != DNSKEY_PROTOCOL {
        return SigStatus::WrongProtocol;
    }
    if key.algorithm != sig.algorithm {
        return SigStatus::AlgorithmMismatch;
    }
    if key.key_tag() != sig.key_tag {
        return SigStatus::KeyTagMismatch;
    }

    // RFC 4034 § 3.1.5: validity times use serial number arithmetic.
    // The policy's clock skew widens the window on both sides, and a
    // negative skew skips the time checks entirely.
    if checks.clock_skew >= 0 {
        let skew = checks.clock_skew.min(i64::from(u32::MAX)) as u32;
        let now = now as u32;
        if serial_lt(now, sig.inception.wrapping_sub(skew)) {
            return SigStatus::NotYetActive;
        }
        if serial_lt(sig.expiration.wrapping_add(skew), now) && !checks.accept_expired {
            return SigStatus::Expired;
        }
    }

    let data = match signed_data(rrset, sig) {
        Ok(data) => data,
        Err(status) => return status,
    };
    match crypto::verify(sig.algorithm, &key.public_key, &data, &sig.signature) {
        Verdict::Good => SigStatus::Verified,
        Verdict::Bad => SigStatus::Invalid,
        Verdict::BadKey => SigStatus::BadKey,
        Verdict::AlgorithmRefused => SigStatus::AlgorithmRefused,
        Verdict::UnknownAlgorithm => SigStatus::UnknownAlgorithm,
    }
}

/// Checks every signature on `rrset` against every candidate key,
/// returning `Verified` once as many signatures verify as the policy
/// demands (one, unless `must_verify` says otherwise) and otherwise
/// the most informative failure seen.
pub fn verify_rrset(rrset: &Rrset, keys: &[Dnskey], now: u64, checks: &Checks) -> SigStatus {
    let required = checks.must_verify.max(1);
    let mut verified = 0;
    let mut aggregate = SigStatus::Unsigned;
    for sig in &rrset.sigs {
        if !rrset.name.eq_or_subdomain_of(&sig.signer) {
            aggregate = most_informative(aggregate, SigStatus::WrongSigner);
            continue;
        }
        for key in keys {
            let status = check_signature(rrset, sig, key, now, checks);
            if status == SigStatus::Verified {
                trace!(
                    "{}/{} verified with key tag {}",
                    rrset.name,
                    rrset.rr_type,
                    sig.key_tag,
                );
                verified += 1;
                break;
            }
            aggregate = most_informative(aggregate, status);
        }
        if verified >= required {
            return SigStatus::Verified;
        }
    }
    if verified > 0 {
        // Some signatures verified, but fewer than the policy
        // demands; the set does not count as verified.
        return most_informative(aggregate, SigStatus::Invalid);
    }
    aggregate
}

fn most_informative(a: SigStatus, b: SigStatus) -> SigStatus {
    if b.informativeness() > a.informativeness() {
        b
    } else {
        a
    }
}

/// RFC 1982 serial comparison on 32-bit timestamps.
fn serial_lt(a: u32, b: u32) -> bool {
    (a < b && b - a < 0x8000_0000) || (a > b && a - b > 0x8000_0000)
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Class;
    use crate::name::Name;
    use crate::rr::dnssec::DNSKEY_FLAG_ZONE_KEY;
    use crate::rr::{Ttl, Type};
    use rsa::traits::PublicKeyParts;
    use sha1::Sha1;
    use signature::{SignatureEncoding, Signer};

    const NOW: u64 = 1_690_000_000;

    fn rrset_with(rdata: &[&[u8]]) -> Rrset {
        let mut set = Rrset::new(
            "www.example.com.".parse().unwrap(),
            Type::A,
            Class::IN,
            Ttl::from(300),
        );
        for record in rdata {
            set.add_rdata(record, Ttl::from(300));
        }
        set
    }

    fn sig_for(set: &Rrset, labels: u8) -> Rrsig {
        Rrsig {
            type_covered: set.rr_type,
            algorithm: 5,
            labels,
            original_ttl: 3600,
            expiration: (NOW + 86400) as u32,
            inception: (NOW - 86400) as u32,
            key_tag: 12345,
            signer: "example.com.".parse().unwrap(),
            signature: Vec::new(),
        }
    }

    #[test]
    fn signed_data_is_order_invariant() {
        let forward = rrset_with(&[&[192, 0, 2, 1], &[10, 0, 0, 1], &[192, 0, 2, 200]]);
        let backward = rrset_with(&[&[192, 0, 2, 200], &[10, 0, 0, 1], &[192, 0, 2, 1]]);
        let sig = sig_for(&forward, 3);
        assert_eq!(
            signed_data(&forward, &sig).unwrap(),
            signed_data(&backward, &sig).unwrap()
        );
    }

    #[test]
    fn signed_data_uses_the_original_ttl_and_lowercased_owner() {
        let mut set = rrset_with(&[&[192, 0, 2, 1]]);
        set.name = "WWW.Example.COM.".parse().unwrap();
        let sig = sig_for(&set, 3);
        let data = signed_data(&set, &sig).unwrap();
        let owner: Name = "www.example.com.".parse().unwrap();
        let tail = &data[sig.rdata_through_signer().len()..];
        assert!(tail.starts_with(owner.wire_repr()));
        let ttl_offset = owner.wire_len() + 4;
        assert_eq!(&tail[ttl_offset..ttl_offset + 4], &3600u32.to_be_bytes());
    }

    #[test]
    fn reduced_label_count_substitutes_the_wildcard_owner() {
        let set = rrset_with(&[&[192, 0, 2, 1]]);
        let sig = sig_for(&set, 2);
        let data = signed_data(&set, &sig).unwrap();
        let wildcard: Name = "*.example.com.".parse().unwrap();
        assert!(data[sig.rdata_through_signer().len()..].starts_with(wildcard.wire_repr()));
    }

    #[test]
    fn excess_label_count_is_rejected() {
        let set = rrset_with(&[&[192, 0, 2, 1]]);
        let sig = sig_for(&set, 4);
        assert_eq!(signed_data(&set, &sig), Err(SigStatus::WrongLabelCount));
    }

    fn test_key() -> (rsa::pkcs1v15::SigningKey<Sha1>, Dnskey) {
        let mut rng = rand::thread_rng();
        let private = rsa::RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = private.to_public_key();
        let exponent = public.e().to_bytes_be();
        let mut wire = vec![exponent.len() as u8];
        wire.extend_from_slice(&exponent);
        wire.extend_from_slice(&public.n().to_bytes_be());
        let key = Dnskey {
            flags: DNSKEY_FLAG_ZONE_KEY,
            protocol: 3,
            algorithm: 5,
            public_key: wire,
        };
        (rsa::pkcs1v15::SigningKey::new(private), key)
    }

    fn signed_rrset() -> (Rrset, Dnskey) {
        let (signing_key, key) = test_key();
        let mut set = rrset_with(&[&[192, 0, 2, 1], &[192, 0, 2, 2]]);
        let mut sig = sig_for(&set, 3);
        sig.key_tag = key.key_tag();
        sig.signature = signing_key.sign(&signed_data(&set, &sig).unwrap()).to_vec();
        set.add_sig(sig);
        (set, key)
    }

    #[test]
    fn real_signature_verifies() {
        let (set, key) = signed_rrset();
        assert_eq!(verify_rrset(&set, &[key], NOW, &Checks::default()), SigStatus::Verified);
    }

    #[test]
    fn tampered_rdata_fails_to_verify() {
        let (mut set, key) = signed_rrset();
        set.rdata[0][3] ^= 1;
        assert_eq!(verify_rrset(&set, &[key], NOW, &Checks::default()), SigStatus::Invalid);
    }

    #[test]
    fn timing_failures_use_the_clock_at_verification() {
        let (set, key) = signed_rrset();
        assert_eq!(
            verify_rrset(&set, &[key.clone()], NOW + 200_000, &Checks::default()),
            SigStatus::Expired
        );
        assert_eq!(
            verify_rrset(&set, &[key], NOW - 200_000, &Checks::default()),
            SigStatus::NotYetActive
        );
    }

    #[test]
    fn clock_skew_widens_the_validity_window() {
        let (set, key) = signed_rrset();
        let tolerant = Checks {
            clock_skew: 300_000,
            ..Checks::default()
        };
        assert_eq!(
            verify_rrset(&set, &[key.clone()], NOW + 200_000, &tolerant),
            SigStatus::Verified
        );
        assert_eq!(
            verify_rrset(&set, &[key], NOW - 200_000, &tolerant),
            SigStatus::Verified
        );
    }

    #[test]
    fn negative_clock_skew_disables_time_checks() {
        let (set, key) = signed_rrset();
        let timeless = Checks {
            clock_skew: -1,
            ..Checks::default()
        };
        assert_eq!(
            verify_rrset(&set, &[key], NOW + 10_000_000, &timeless),
            SigStatus::Verified
        );
    }

    #[test]
    fn expired_signatures_can_be_tolerated() {
        let (set, key) = signed_rrset();
        let lenient = Checks {
            accept_expired: true,
            ..Checks::default()
        };
        assert_eq!(
            verify_rrset(&set, &[key.clone()], NOW + 200_000, &lenient),
            SigStatus::Verified
        );
        // Tolerating expiration does not excuse a future inception.
        assert_eq!(
            verify_rrset(&set, &[key], NOW - 200_000, &lenient),
            SigStatus::NotYetActive
        );
    }

    #[test]
    fn must_verify_count_demands_enough_signatures() {
        let (set, key) = signed_rrset();
        let demanding = Checks {
            must_verify: 2,
            ..Checks::default()
        };
        // A single verifying signature is not enough for a policy
        // that demands two.
        assert_eq!(
            verify_rrset(&set, &[key.clone()], NOW, &demanding),
            SigStatus::Invalid
        );
        assert_eq!(
            verify_rrset(&set, &[key], NOW, &Checks::default()),
            SigStatus::Verified
        );
    }

    #[test]
    fn non_zone_keys_are_rejected() {
        let (set, mut key) = signed_rrset();
        key.flags = 0;
        assert_eq!(verify_rrset(&set, &[key], NOW, &Checks::default()), SigStatus::NotZoneKey);
    }

    #[test]
    fn wrong_protocol_is_rejected() {
        let (set, mut key) = signed_rrset();
        key.protocol = 2;
        assert_eq!(verify_rrset(&set, &[key], NOW, &Checks::default()), SigStatus::WrongProtocol);
    }

    #[test]
    fn unsigned_rrsets_are_reported() {
        let set = rrset_with(&[&[192, 0, 2, 1]]);
        let (_, key) = test_key();
        assert_eq!(verify_rrset(&set, &[key], NOW, &Checks::default()), SigStatus::Unsigned);
    }

    #[test]
    fn foreign_signers_are_rejected() {
        let (mut set, key) = signed_rrset();
        set.sigs[0].signer = "example.org.".parse().unwrap();
        assert_eq!(verify_rrset(&set, &[key], NOW, &Checks::default()), SigStatus::WrongSigner);
    }

    #[test]
    fn serial_comparison_wraps() {
        assert!(serial_lt(0xffff_fff0, 0x0000_0010));
        assert!(!serial_lt(0x0000_0010, 0xffff_fff0));
        assert!(serial_lt(1, 2));
    }
}
