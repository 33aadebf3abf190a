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

//! Parsed views of the DNSSEC record types ([RFC 4034]): DNSKEY,
//! RRSIG, DS, and NSEC.
//!
//! [RFC 4034]: https://datatracker.ietf.org/doc/html/rfc4034

use std::fmt;

use base64::Engine;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::name::{self, Name};
use crate::rr::Type;

/// The DNSKEY flag bit indicating a zone key ([RFC 4034 § 2.1.1]).
///
/// [RFC 4034 § 2.1.1]: https://datatracker.ietf.org/doc/html/rfc4034#section-2.1.1
pub const DNSKEY_FLAG_ZONE_KEY: u16 = 0x0100;

/// The DNSKEY flag bit indicating a secure entry point.
pub const DNSKEY_FLAG_SEP: u16 = 0x0001;

/// The only DNSKEY protocol value that is valid for DNSSEC.
pub const DNSKEY_PROTOCOL: u8 = 3;

////////////////////////////////////////////////////////////////////////
// DNSKEY                                                             //
////////////////////////////////////////////////////////////////////////

/// The RDATA of a DNSKEY record ([RFC 4034 § 2]).
///
/// [RFC 4034 § 2]: https://datatracker.ietf.org/doc/html/rfc4034#section-2
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dnskey {
    pub flags: u16,
    pub protocol: u8,
    pub algorithm: u8,
    pub public_key: Vec<u8>,
}

impl Dnskey {
    /// Parses DNSKEY RDATA from its wire form.
    pub fn try_from_rdata(rdata: &[u8]) -> Result<Self, Error> {
        if rdata.len() < 4 {
            return Err(Error::TooShort);
        }
        Ok(Self {
            flags: u16::from_be_bytes([rdata[0], rdata[1]]),
            protocol: rdata[2],
            algorithm: rdata[3],
            public_key: rdata[4..].to_vec(),
        })
    }

    /// Parses a DNSKEY from its presentation form, `flags protocol
    /// algorithm base64-key`, as it appears in trust anchor
    /// configuration.
    pub fn from_presentation(text: &str) -> Result<Self, Error> {
        let mut fields = text.split_ascii_whitespace();
        let flags = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or(Error::BadPresentation)?;
        let protocol = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or(Error::BadPresentation)?;
        let algorithm = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or(Error::BadPresentation)?;
        let key_b64: String = fields.collect();
        let public_key = base64::engine::general_purpose::STANDARD
            .decode(key_b64)
            .or(Err(Error::BadPresentation))?;
        Ok(Self {
            flags,
            protocol,
            algorithm,
            public_key,
        })
    }

    /// Returns the wire form of this DNSKEY's RDATA.
    pub fn to_rdata(&self) -> Vec<u8> {
        let mut rdata = Vec::with_capacity(4 + self.public_key.len());
        rdata.extend_from_slice(&self.flags.to_be_bytes());
        rdata.push(self.protocol);
        rdata.push(self.algorithm);
        rdata.extend_from_slice(&self.public_key);
        rdata
    }

    /// Returns whether the zone key flag is set.
    pub fn is_zone_key(&self) -> bool {
        self.flags & DNSKEY_FLAG_ZONE_KEY != 0
    }

    /// Returns whether the secure entry point flag is set.
    pub fn is_sep(&self) -> bool {
        self.flags & DNSKEY_FLAG_SEP != 0
    }

    /// Computes the key tag of this DNSKEY ([RFC 4034 App. B]).
    ///
    /// Algorithm 1 (RSA/MD5) uses the older computation of
    /// [RFC 4034 App. B.1]: the key tag is the third- and second-to-
    /// last octets of the public key (part of the modulus).
    ///
    /// [RFC 4034 App. B]: https://datatracker.ietf.org/doc/html/rfc4034#appendix-B
    pub fn key_tag(&self) -> u16 {
        if self.algorithm == 1 {
            let key = &self.public_key;
            if key.len() < 3 {
                return 0;
            }
            return u16::from_be_bytes([key[key.len() - 3], key[key.len() - 2]]);
        }
        let rdata = self.to_rdata();
        let mut accumulator: u32 = 0;
        for (i, &octet) in rdata.iter().enumerate() {
            if i & 1 == 0 {
                accumulator += (octet as u32) << 8;
            } else {
                accumulator += octet as u32;
            }
        }
        accumulator += (accumulator >> 16) & 0xffff;
        (accumulator & 0xffff) as u16
    }

    /// Computes the digest that a DS record with the given digest type
    /// would carry for this key at `owner` ([RFC 4034 § 5.1.4]).
    /// Returns [`None`] for unknown digest types.
    ///
    /// [RFC 4034 § 5.1.4]: https://datatracker.ietf.org/doc/html/rfc4034#section-5.1.4
    pub fn ds_digest(&self, owner: &Name, digest_type: u8) -> Option<Vec<u8>> {
        let mut data = owner.canonical_wire();
        data.extend_from_slice(&self.to_rdata());
        match digest_type {
            1 => Some(Sha1::digest(&data).to_vec()),
            2 => Some(Sha256::digest(&data).to_vec()),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// RRSIG                                                              //
////////////////////////////////////////////////////////////////////////

/// The RDATA of an RRSIG record ([RFC 4034 § 3]).
///
/// [RFC 4034 § 3]: https://datatracker.ietf.org/doc/html/rfc4034#section-3
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rrsig {
    pub type_covered: Type,
    pub algorithm: u8,
    pub labels: u8,
    pub original_ttl: u32,
    pub expiration: u32,
    pub inception: u32,
    pub key_tag: u16,
    pub signer: Name,
    pub signature: Vec<u8>,
}

impl Rrsig {
    /// Parses RRSIG RDATA from its wire form. The signer name must be
    /// uncompressed ([RFC 4034 § 3.1.7]).
    ///
    /// [RFC 4034 § 3.1.7]: https://datatracker.ietf.org/doc/html/rfc4034#section-3.1.7
    pub fn try_from_rdata(rdata: &[u8]) -> Result<Self, Error> {
        if rdata.len() < 18 {
            return Err(Error::TooShort);
        }
        let (signer, signer_len) = Name::try_from_uncompressed(&rdata[18..])?;
        Ok(Self {
            type_covered: Type::from(u16::from_be_bytes([rdata[0], rdata[1]])),
            algorithm: rdata[2],
            labels: rdata[3],
            original_ttl: u32::from_be_bytes([rdata[4], rdata[5], rdata[6], rdata[7]]),
            expiration: u32::from_be_bytes([rdata[8], rdata[9], rdata[10], rdata[11]]),
            inception: u32::from_be_bytes([rdata[12], rdata[13], rdata[14], rdata[15]]),
            key_tag: u16::from_be_bytes([rdata[16], rdata[17]]),
            signer,
            signature: rdata[18 + signer_len..].to_vec(),
        })
    }

    /// Returns the wire form of this RRSIG's RDATA.
    pub fn to_rdata(&self) -> Vec<u8> {
        let mut rdata = self.rdata_through_signer();
        rdata.extend_from_slice(&self.signature);
        rdata
    }

    /// Returns the RDATA fields from the type covered through the
    /// signer name, with the signer lowercased. This is the leading
    /// portion of the data over which the signature is computed
    /// ([RFC 4035 § 5.3.2]).
    ///
    /// [RFC 4035 § 5.3.2]: https://datatracker.ietf.org/doc/html/rfc4035#section-5.3.2
    pub fn rdata_through_signer(&self) -> Vec<u8> {
        let mut rdata = Vec::with_capacity(18 + self.signer.wire_len());
        rdata.extend_from_slice(&u16::from(self.type_covered).to_be_bytes());
        rdata.push(self.algorithm);
        rdata.push(self.labels);
        rdata.extend_from_slice(&self.original_ttl.to_be_bytes());
        rdata.extend_from_slice(&self.expiration.to_be_bytes());
        rdata.extend_from_slice(&self.inception.to_be_bytes());
        rdata.extend_from_slice(&self.key_tag.to_be_bytes());
        rdata.extend_from_slice(&self.signer.canonical_wire());
        rdata
    }
}

////////////////////////////////////////////////////////////////////////
// DS                                                                 //
////////////////////////////////////////////////////////////////////////

/// The RDATA of a DS record ([RFC 4034 § 5]).
///
/// [RFC 4034 § 5]: https://datatracker.ietf.org/doc/html/rfc4034#section-5
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ds {
    pub key_tag: u16,
    pub algorithm: u8,
    pub digest_type: u8,
    pub digest: Vec<u8>,
}

impl Ds {
    /// Parses DS RDATA from its wire form.
    pub fn try_from_rdata(rdata: &[u8]) -> Result<Self, Error> {
        if rdata.len() < 4 {
            return Err(Error::TooShort);
        }
        Ok(Self {
            key_tag: u16::from_be_bytes([rdata[0], rdata[1]]),
            algorithm: rdata[2],
            digest_type: rdata[3],
            digest: rdata[4..].to_vec(),
        })
    }

    /// Returns whether this DS matches `key` at `owner`: the key tag
    /// and algorithm agree and the digest of the key equals the
    /// digest carried here.
    pub fn matches_key(&self, owner: &Name, key: &Dnskey) -> bool {
        self.key_tag == key.key_tag()
            && self.algorithm == key.algorithm
            && key
                .ds_digest(owner, self.digest_type)
                .map_or(false, |digest| digest == self.digest)
    }
}

////////////////////////////////////////////////////////////////////////
// NSEC                                                               //
////////////////////////////////////////////////////////////////////////

/// The RDATA of an NSEC record ([RFC 4034 § 4]).
///
/// [RFC 4034 § 4]: https://datatracker.ietf.org/doc/html/rfc4034#section-4
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Nsec {
    pub next: Name,
    pub type_bitmap: Vec<u8>,
}

impl Nsec {
    /// Parses NSEC RDATA from its wire form.
    pub fn try_from_rdata(rdata: &[u8]) -> Result<Self, Error> {
        let (next, next_len) = Name::try_from_uncompressed(rdata)?;
        Ok(Self {
            next,
            type_bitmap: rdata[next_len..].to_vec(),
        })
    }

    /// Returns whether the type bitmap asserts the presence of
    /// `rr_type` at the NSEC's owner ([RFC 4034 § 4.1.2]).
    ///
    /// [RFC 4034 § 4.1.2]: https://datatracker.ietf.org/doc/html/rfc4034#section-4.1.2
    pub fn has_type(&self, rr_type: Type) -> bool {
        let value = u16::from(rr_type);
        let window = (value >> 8) as u8;
        let bit = (value & 0xff) as usize;
        let mut remaining = self.type_bitmap.as_slice();
        while remaining.len() >= 2 {
            let this_window = remaining[0];
            let len = remaining[1] as usize;
            if remaining.len() < 2 + len {
                return false;
            }
            if this_window == window {
                let octet = bit / 8;
                if octet >= len {
                    return false;
                }
                return remaining[2 + octet] & (0x80 >> (bit % 8)) != 0;
            }
            remaining = &remaining[2 + len..];
        }
        false
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error encountered while parsing DNSSEC RDATA.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    TooShort,
    BadName(name::Error),
    BadPresentation,
}

impl From<name::Error> for Error {
    fn from(error: name::Error) -> Self {
        Self::BadName(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TooShort => f.write_str("RDATA is too short"),
            Self::BadName(error) => write!(f, "invalid name in RDATA: {error}"),
            Self::BadPresentation => f.write_str("invalid presentation format"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    // The DNSKEY and DS records from RFC 4034 §§ 2.3 and 5.4
    // (dskey.example.com.).
    const EXAMPLE_KEY_B64: &str = "AQOeiiR0GOMYkDshWoSKz9Xz\
                                   fwJr1AYtsmx3TGkJaNXVbfi/\
                                   2pHm822aJ5iI9BMzNXxeYCmZ\
                                   DRD99WYwYqUSdjMmmAphXdvx\
                                   egXd/M5+X7OrzKBaMbCVdFLU\
                                   Uh6DhweJBjEVv5f2wwjM9Xzc\
                                   nOf+EPbtG9DMBmADjFDc2w/r\
                                   ljwvFw==";

    fn example_key() -> Dnskey {
        Dnskey::from_presentation(&format!("256 3 5 {EXAMPLE_KEY_B64}")).unwrap()
    }

    #[test]
    fn dnskey_presentation_parses() {
        let key = example_key();
        assert_eq!(key.flags, 256);
        assert_eq!(key.protocol, 3);
        assert_eq!(key.algorithm, 5);
        assert!(key.is_zone_key());
        assert!(!key.is_sep());
    }

    #[test]
    fn dnskey_key_tag_matches_rfc4034_example() {
        assert_eq!(example_key().key_tag(), 60485);
    }

    #[test]
    fn dnskey_rdata_round_trips() {
        let key = example_key();
        assert_eq!(Dnskey::try_from_rdata(&key.to_rdata()).unwrap(), key);
    }

    #[test]
    fn ds_matches_rfc4034_example() {
        let key = example_key();
        let owner: Name = "dskey.example.com.".parse().unwrap();
        let ds = Ds {
            key_tag: 60485,
            algorithm: 5,
            digest_type: 1,
            digest: vec![
                0x2b, 0xb1, 0x83, 0xaf, 0x5f, 0x22, 0x58, 0x81, 0x79, 0xa5, 0x3b, 0x0a, 0x98,
                0x63, 0x1f, 0xad, 0x1a, 0x29, 0x21, 0x18,
            ],
        };
        assert!(ds.matches_key(&owner, &key));
        let wrong_tag = Ds { key_tag: 1, ..ds };
        assert!(!wrong_tag.matches_key(&owner, &key));
    }

    #[test]
    fn rrsig_rdata_round_trips() {
        let rrsig = Rrsig {
            type_covered: Type::A,
            algorithm: 5,
            labels: 3,
            original_ttl: 86400,
            expiration: 1081528579,
            inception: 1084120579,
            key_tag: 2642,
            signer: "example.com.".parse().unwrap(),
            signature: vec![1, 2, 3, 4],
        };
        let parsed = Rrsig::try_from_rdata(&rrsig.to_rdata()).unwrap();
        assert_eq!(parsed, rrsig);
    }

    #[test]
    fn rrsig_rejects_short_rdata() {
        assert_eq!(Rrsig::try_from_rdata(&[0; 17]).unwrap_err(), Error::TooShort);
    }

    #[test]
    fn nsec_type_bitmap_lookup() {
        // Bitmap asserting A, MX, RRSIG, NSEC, and TYPE1234, from
        // RFC 4034 § 4.3.
        let mut bitmap = vec![0x00, 0x06, 0x40, 0x01, 0x00, 0x00, 0x00, 0x03, 0x04, 0x1b];
        bitmap.extend_from_slice(&[0; 26]);
        bitmap.push(0x20);
        let nsec = Nsec {
            next: "host.example.com.".parse().unwrap(),
            type_bitmap: bitmap,
        };
        assert!(nsec.has_type(Type::A));
        assert!(nsec.has_type(Type::MX));
        assert!(nsec.has_type(Type::RRSIG));
        assert!(nsec.has_type(Type::NSEC));
        assert!(nsec.has_type(Type::from(1234)));
        assert!(!nsec.has_type(Type::AAAA));
        assert!(!nsec.has_type(Type::SOA));
    }
}
