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

//! Reading and writing of DNS messages ([RFC 1035 § 4]).
//!
//! [RFC 1035 § 4]: https://datatracker.ietf.org/doc/html/rfc1035#section-4

use std::fmt;

mod opcode;
mod rcode;
pub mod reader;
pub mod tsig;
pub mod writer;

pub use opcode::Opcode;
pub use rcode::Rcode;
pub use reader::Reader;

/// The size of a DNS message header.
pub const HEADER_SIZE: usize = 12;

/// The EDNS0 UDP payload size we advertise ([RFC 6891]).
///
/// [RFC 6891]: https://datatracker.ietf.org/doc/html/rfc6891
pub const EDNS_UDP_PAYLOAD_SIZE: u16 = 4096;

// Flag masks for the third and fourth header octets.
const QR_MASK: u8 = 0x80;
const OPCODE_MASK: u8 = 0x78;
const AA_MASK: u8 = 0x04;
const TC_MASK: u8 = 0x02;
const RD_MASK: u8 = 0x01;
const RA_MASK: u8 = 0x80;
const AD_MASK: u8 = 0x20;
const CD_MASK: u8 = 0x10;
const RCODE_MASK: u8 = 0x0f;

////////////////////////////////////////////////////////////////////////
// HEADER                                                             //
////////////////////////////////////////////////////////////////////////

/// A parsed DNS message header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub opcode: Opcode,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub ad: bool,
    pub cd: bool,
    pub rcode: Rcode,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    /// Creates a header for a new query with all counts zero.
    pub fn for_query(id: u16) -> Self {
        Self {
            id,
            qr: false,
            opcode: Opcode::QUERY,
            aa: false,
            tc: false,
            rd: true,
            ra: false,
            ad: false,
            cd: true,
            rcode: Rcode::NOERROR,
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }

    /// Parses the header at the start of `octets`.
    pub fn try_from_message(octets: &[u8]) -> Result<Self, Error> {
        if octets.len() < HEADER_SIZE {
            return Err(Error::UnexpectedEom);
        }
        Ok(Self {
            id: u16::from_be_bytes([octets[0], octets[1]]),
            qr: octets[2] & QR_MASK != 0,
            opcode: Opcode::from((octets[2] & OPCODE_MASK) >> 3),
            aa: octets[2] & AA_MASK != 0,
            tc: octets[2] & TC_MASK != 0,
            rd: octets[2] & RD_MASK != 0,
            ra: octets[3] & RA_MASK != 0,
            ad: octets[3] & AD_MASK != 0,
            cd: octets[3] & CD_MASK != 0,
            rcode: Rcode::from(octets[3] & RCODE_MASK),
            qdcount: u16::from_be_bytes([octets[4], octets[5]]),
            ancount: u16::from_be_bytes([octets[6], octets[7]]),
            nscount: u16::from_be_bytes([octets[8], octets[9]]),
            arcount: u16::from_be_bytes([octets[10], octets[11]]),
        })
    }

    /// Serializes the header.
    pub fn to_wire(self) -> [u8; HEADER_SIZE] {
        let mut wire = [0; HEADER_SIZE];
        wire[0..2].copy_from_slice(&self.id.to_be_bytes());
        wire[2] = (u8::from(self.qr) * QR_MASK)
            | (u8::from(self.opcode) << 3)
            | (u8::from(self.aa) * AA_MASK)
            | (u8::from(self.tc) * TC_MASK)
            | (u8::from(self.rd) * RD_MASK);
        wire[3] = (u8::from(self.ra) * RA_MASK)
            | (u8::from(self.ad) * AD_MASK)
            | (u8::from(self.cd) * CD_MASK)
            | (u8::from(self.rcode) & RCODE_MASK);
        wire[4..6].copy_from_slice(&self.qdcount.to_be_bytes());
        wire[6..8].copy_from_slice(&self.ancount.to_be_bytes());
        wire[8..10].copy_from_slice(&self.nscount.to_be_bytes());
        wire[10..12].copy_from_slice(&self.arcount.to_be_bytes());
        wire
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error encountered while reading a DNS message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    UnexpectedEom,
    BadName(crate::name::Error),
    BadCompressionPointer,
    BadRdata,
}

impl From<crate::name::Error> for Error {
    fn from(error: crate::name::Error) -> Self {
        Self::BadName(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnexpectedEom => f.write_str("unexpected end of message"),
            Self::BadName(error) => write!(f, "invalid name: {error}"),
            Self::BadCompressionPointer => f.write_str("invalid compression pointer"),
            Self::BadRdata => f.write_str("invalid RDATA"),
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

    #[test]
    fn header_round_trips() {
        let header = Header {
            id: 0x1234,
            qr: true,
            opcode: Opcode::QUERY,
            aa: true,
            tc: false,
            rd: true,
            ra: true,
            ad: false,
            cd: true,
            rcode: Rcode::NXDOMAIN,
            qdcount: 1,
            ancount: 2,
            nscount: 3,
            arcount: 4,
        };
        let parsed = Header::try_from_message(&header.to_wire()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn query_headers_set_rd_and_cd() {
        let header = Header::for_query(7);
        assert!(header.rd);
        assert!(header.cd);
        assert!(!header.qr);
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert_eq!(
            Header::try_from_message(&[0; 11]).unwrap_err(),
            Error::UnexpectedEom
        );
    }
}
