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

//! The [`Reader`] structure for extracting questions and records from
//! received DNS messages.

use crate::class::Class;
use crate::message::{Error, Header, HEADER_SIZE};
use crate::name::Name;
use crate::rr::{Ttl, Type};

////////////////////////////////////////////////////////////////////////
// READ STRUCTURES                                                    //
////////////////////////////////////////////////////////////////////////

/// A question read from a message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Question {
    pub name: Name,
    pub qtype: Type,
    pub qclass: Class,
}

/// A resource record read from a message. The RDATA is re-serialized
/// so that any embedded names are uncompressed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadRr {
    pub name: Name,
    pub rr_type: Type,
    pub class: Class,
    pub ttl: Ttl,
    pub rdata: Vec<u8>,
}

////////////////////////////////////////////////////////////////////////
// READER                                                             //
////////////////////////////////////////////////////////////////////////

/// A cursor over a received DNS message.
///
/// The reader chases compression pointers when extracting names.
/// Pointers must point strictly backwards in the message, which makes
/// pointer loops impossible to construct and bounds the work done for
/// any name.
pub struct Reader<'a> {
    octets: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    /// Creates a reader over `octets` and parses the message header.
    pub fn new(octets: &'a [u8]) -> Result<(Header, Self), Error> {
        let header = Header::try_from_message(octets)?;
        Ok((
            header,
            Self {
                octets,
                cursor: HEADER_SIZE,
            },
        ))
    }

    /// Returns the current position in the message.
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Reads a question from the current position.
    pub fn read_question(&mut self) -> Result<Question, Error> {
        let name = self.read_name()?;
        let qtype = Type::from(self.read_u16()?);
        let qclass = Class::from(self.read_u16()?);
        Ok(Question {
            name,
            qtype,
            qclass,
        })
    }

    /// Reads a resource record from the current position.
    pub fn read_rr(&mut self) -> Result<ReadRr, Error> {
        let name = self.read_name()?;
        let rr_type = Type::from(self.read_u16()?);
        let class = Class::from(self.read_u16()?);
        let ttl = Ttl::from(self.read_u32()?);
        let rdlength = self.read_u16()? as usize;
        if self.octets.len() < self.cursor + rdlength {
            return Err(Error::UnexpectedEom);
        }
        let rdata_start = self.cursor;
        self.cursor += rdlength;
        let rdata = self.extract_rdata(rr_type, rdata_start, rdlength)?;
        Ok(ReadRr {
            name,
            rr_type,
            class,
            ttl,
            rdata,
        })
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        if self.octets.len() < self.cursor + 2 {
            return Err(Error::UnexpectedEom);
        }
        let value = u16::from_be_bytes([self.octets[self.cursor], self.octets[self.cursor + 1]]);
        self.cursor += 2;
        Ok(value)
    }

    fn read_u32(&mut self) -> Result<u32, Error> {
        if self.octets.len() < self.cursor + 4 {
            return Err(Error::UnexpectedEom);
        }
        let value = u32::from_be_bytes([
            self.octets[self.cursor],
            self.octets[self.cursor + 1],
            self.octets[self.cursor + 2],
            self.octets[self.cursor + 3],
        ]);
        self.cursor += 4;
        Ok(value)
    }

    fn read_name(&mut self) -> Result<Name, Error> {
        let (name, consumed) = self.name_at(self.cursor)?;
        self.cursor += consumed;
        Ok(name)
    }

    /// Extracts the (possibly compressed) name starting at `offset`,
    /// returning it along with the number of octets it occupies at
    /// `offset` (up to and including the terminating null label or the
    /// first compression pointer).
    fn name_at(&self, offset: usize) -> Result<(Name, usize), Error> {
        let mut uncompressed = Vec::with_capacity(64);
        let mut position = offset;
        let mut consumed = None;
        loop {
            let len = *self.octets.get(position).ok_or(Error::UnexpectedEom)? as usize;
            if len & 0xc0 == 0xc0 {
                let low = *self.octets.get(position + 1).ok_or(Error::UnexpectedEom)? as usize;
                let target = (len & 0x3f) << 8 | low;
                // Pointers must point strictly backwards.
                if target >= position {
                    return Err(Error::BadCompressionPointer);
                }
                if consumed.is_none() {
                    consumed = Some(position + 2 - offset);
                }
                position = target;
            } else if len & 0xc0 != 0 {
                return Err(Error::BadName(crate::name::Error::InvalidLabelType));
            } else {
                if self.octets.len() < position + 1 + len {
                    return Err(Error::UnexpectedEom);
                }
                uncompressed.extend_from_slice(&self.octets[position..position + 1 + len]);
                position += 1 + len;
                if len == 0 {
                    let name = Name::try_from_uncompressed_all(&uncompressed)?;
                    return Ok((name, consumed.unwrap_or_else(|| position - offset)));
                }
            }
        }
    }

    /// Re-serializes the RDATA in `[start, start + rdlength)` with any
    /// embedded names decompressed. Types without embedded names (and
    /// the DNSSEC types, whose names may not be compressed) are copied
    /// verbatim.
    fn extract_rdata(&self, rr_type: Type, start: usize, rdlength: usize) -> Result<Vec<u8>, Error> {
        let end = start + rdlength;
        match rr_type {
            Type::NS | Type::CNAME | Type::PTR => {
                let (name, consumed) = self.name_at(start)?;
                if consumed != rdlength {
                    return Err(Error::BadRdata);
                }
                Ok(name.wire_repr().to_vec())
            }
            Type::MX => {
                if rdlength < 2 {
                    return Err(Error::BadRdata);
                }
                let (name, consumed) = self.name_at(start + 2)?;
                if 2 + consumed != rdlength {
                    return Err(Error::BadRdata);
                }
                let mut rdata = self.octets[start..start + 2].to_vec();
                rdata.extend_from_slice(name.wire_repr());
                Ok(rdata)
            }
            Type::SRV => {
                if rdlength < 6 {
                    return Err(Error::BadRdata);
                }
                let (name, consumed) = self.name_at(start + 6)?;
                if 6 + consumed != rdlength {
                    return Err(Error::BadRdata);
                }
                let mut rdata = self.octets[start..start + 6].to_vec();
                rdata.extend_from_slice(name.wire_repr());
                Ok(rdata)
            }
            Type::SOA => {
                let (mname, mname_len) = self.name_at(start)?;
                let (rname, rname_len) = self.name_at(start + mname_len)?;
                let fixed_start = start + mname_len + rname_len;
                if fixed_start + 20 != end {
                    return Err(Error::BadRdata);
                }
                let mut rdata =
                    Vec::with_capacity(mname.wire_len() + rname.wire_len() + 20);
                rdata.extend_from_slice(mname.wire_repr());
                rdata.extend_from_slice(rname.wire_repr());
                rdata.extend_from_slice(&self.octets[fixed_start..end]);
                Ok(rdata)
            }
            _ => Ok(self.octets[start..end].to_vec()),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    // A response to "www.example.com. IN A" with one answer whose
    // owner is a compression pointer to the question name, plus an NS
    // record in the authority section whose RDATA name is compressed.
    const RESPONSE: &[u8] = &[
        0x12, 0x34, // ID
        0x85, 0x00, // QR, AA, RD
        0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, // counts
        3, b'w', b'w', b'w', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm',
        0, // QNAME (offset 12)
        0x00, 0x01, 0x00, 0x01, // QTYPE A, QCLASS IN
        0xc0, 0x0c, // answer owner -> offset 12
        0x00, 0x01, 0x00, 0x01, // A IN
        0x00, 0x00, 0x01, 0x2c, // TTL 300
        0x00, 0x04, 192, 0, 2, 1, // RDATA
        0xc0, 0x10, // authority owner -> example.com. (offset 16)
        0x00, 0x02, 0x00, 0x01, // NS IN
        0x00, 0x00, 0x0e, 0x10, // TTL 3600
        0x00, 0x05, 2, b'n', b's', 0xc0, 0x10, // ns.example.com., compressed
    ];

    #[test]
    fn reads_a_full_message() {
        let (header, mut reader) = Reader::new(RESPONSE).unwrap();
        assert_eq!(header.id, 0x1234);
        assert!(header.qr);
        assert!(header.aa);
        assert_eq!(header.ancount, 1);

        let question = reader.read_question().unwrap();
        assert_eq!(question.name, "www.example.com.".parse().unwrap());
        assert_eq!(question.qtype, Type::A);
        assert_eq!(question.qclass, Class::IN);

        let answer = reader.read_rr().unwrap();
        assert_eq!(answer.name, "www.example.com.".parse().unwrap());
        assert_eq!(answer.rr_type, Type::A);
        assert_eq!(answer.ttl, Ttl::from(300));
        assert_eq!(answer.rdata, vec![192, 0, 2, 1]);

        let authority = reader.read_rr().unwrap();
        assert_eq!(authority.name, "example.com.".parse().unwrap());
        assert_eq!(authority.rr_type, Type::NS);
        // The compressed NS RDATA is re-serialized uncompressed.
        assert_eq!(authority.rdata, b"\x02ns\x07example\x03com\x00".to_vec());
    }

    #[test]
    fn rejects_forward_pointers() {
        let mut message = RESPONSE.to_vec();
        // Redirect the answer owner pointer at itself.
        message[34] = 0x21;
        let (_, mut reader) = Reader::new(&message).unwrap();
        reader.read_question().unwrap();
        assert_eq!(reader.read_rr().unwrap_err(), Error::BadCompressionPointer);
    }

    #[test]
    fn rejects_truncated_rdata() {
        let mut message = RESPONSE[..49].to_vec();
        message[44] = 0x05; // RDLENGTH 5, but only 4 octets remain
        let (_, mut reader) = Reader::new(&message).unwrap();
        reader.read_question().unwrap();
        assert!(reader.read_rr().is_err());
    }
}
