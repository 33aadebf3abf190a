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

//! Construction of outgoing query messages.

use crate::class::Class;
use crate::message::{Header, EDNS_UDP_PAYLOAD_SIZE};
use crate::name::Name;
use crate::rr::Type;

/// EDNS0 parameters for an outgoing query ([RFC 6891]).
///
/// [RFC 6891]: https://datatracker.ietf.org/doc/html/rfc6891
#[derive(Clone, Copy, Debug)]
pub struct EdnsOptions {
    pub payload_size: u16,
    pub dnssec_ok: bool,
}

impl Default for EdnsOptions {
    fn default() -> Self {
        Self {
            payload_size: EDNS_UDP_PAYLOAD_SIZE,
            dnssec_ok: true,
        }
    }
}

/// Builds a query message: header (RD and CD set), one question, and
/// an OPT pseudo-RR when `edns` is given.
pub fn build_query(
    id: u16,
    name: &Name,
    qtype: Type,
    qclass: Class,
    edns: Option<EdnsOptions>,
) -> Vec<u8> {
    let mut header = Header::for_query(id);
    header.qdcount = 1;
    header.arcount = u16::from(edns.is_some());

    let mut message = Vec::with_capacity(
        crate::message::HEADER_SIZE + name.wire_len() + 4 + if edns.is_some() { 11 } else { 0 },
    );
    message.extend_from_slice(&header.to_wire());
    message.extend_from_slice(name.wire_repr());
    message.extend_from_slice(&u16::from(qtype).to_be_bytes());
    message.extend_from_slice(&u16::from(qclass).to_be_bytes());

    if let Some(edns) = edns {
        // OPT: root owner, TYPE 41, CLASS = payload size, TTL carries
        // the extended RCODE, version, and DO bit, empty RDATA.
        message.push(0);
        message.extend_from_slice(&u16::from(Type::OPT).to_be_bytes());
        message.extend_from_slice(&edns.payload_size.to_be_bytes());
        let flags: u32 = if edns.dnssec_ok { 0x8000 } else { 0 };
        message.extend_from_slice(&flags.to_be_bytes());
        message.extend_from_slice(&0u16.to_be_bytes());
    }
    message
}

/// Appends an OPT pseudo-RR to a query that was built without one and
/// increments the ARCOUNT. This must happen before any TSIG signing.
pub fn add_opt(message: &mut Vec<u8>, edns: EdnsOptions) {
    message.push(0);
    message.extend_from_slice(&u16::from(Type::OPT).to_be_bytes());
    message.extend_from_slice(&edns.payload_size.to_be_bytes());
    let flags: u32 = if edns.dnssec_ok { 0x8000 } else { 0 };
    message.extend_from_slice(&flags.to_be_bytes());
    message.extend_from_slice(&0u16.to_be_bytes());
    let arcount = u16::from_be_bytes([message[10], message[11]]) + 1;
    message[10..12].copy_from_slice(&arcount.to_be_bytes());
}

/// Appends a resource record to `message`. The caller is responsible
/// for updating the relevant header count.
pub fn append_rr(
    message: &mut Vec<u8>,
    name: &Name,
    rr_type: Type,
    class: Class,
    raw_ttl: u32,
    rdata: &[u8],
) {
    message.extend_from_slice(name.wire_repr());
    message.extend_from_slice(&u16::from(rr_type).to_be_bytes());
    message.extend_from_slice(&u16::from(class).to_be_bytes());
    message.extend_from_slice(&raw_ttl.to_be_bytes());
    message.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    message.extend_from_slice(rdata);
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Reader;

    #[test]
    fn builds_a_plain_query() {
        let name: Name = "example.com.".parse().unwrap();
        let query = build_query(0xabcd, &name, Type::A, Class::IN, None);
        let (header, mut reader) = Reader::new(&query).unwrap();
        assert_eq!(header.id, 0xabcd);
        assert!(header.rd);
        assert!(header.cd);
        assert_eq!(header.qdcount, 1);
        assert_eq!(header.arcount, 0);
        let question = reader.read_question().unwrap();
        assert_eq!(question.name, name);
        assert_eq!(question.qtype, Type::A);
        assert_eq!(query.len(), reader.position());
    }

    #[test]
    fn builds_an_edns_query_with_do_bit() {
        let name: Name = "example.com.".parse().unwrap();
        let query = build_query(1, &name, Type::A, Class::IN, Some(EdnsOptions::default()));
        let (header, mut reader) = Reader::new(&query).unwrap();
        assert_eq!(header.arcount, 1);
        reader.read_question().unwrap();
        let opt = reader.read_rr().unwrap();
        assert_eq!(opt.rr_type, Type::OPT);
        assert_eq!(u16::from(opt.class), EDNS_UDP_PAYLOAD_SIZE);
        assert!(opt.rdata.is_empty());
    }
}
