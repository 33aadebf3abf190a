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

//! The transport half of the resolver: nameserver descriptions, the
//! transaction I/O manager, the exchange orchestrator, and the
//! response sanity checks applied before a message is handed to the
//! digester.

use std::fmt;
use std::net::SocketAddr;

use rand::Rng;

use crate::class::Class;
use crate::message::reader::Question;
use crate::message::{tsig, writer, Rcode, Reader};
use crate::name::Name;
use crate::rr::Type;

pub mod exchange;
pub mod io;

pub use exchange::{exchange, ExchangeOutcome};
pub use io::{AcceptOutcome, IoManager, TransactionId};

/// The default initial retransmission interval, in seconds.
pub const DEFAULT_RETRANS: u64 = 5;

/// The default number of retries per nameserver address.
pub const DEFAULT_RETRIES: u32 = 3;

////////////////////////////////////////////////////////////////////////
// NAMESERVERS                                                        //
////////////////////////////////////////////////////////////////////////

/// A nameserver that queries may be sent to.
#[derive(Clone, Debug)]
pub struct NameServer {
    pub name: Name,
    pub addresses: Vec<SocketAddr>,
    pub retrans: u64,
    pub retries: u32,
    pub edns: bool,
    /// Query over TCP from the start instead of falling back from UDP
    /// on truncation.
    pub use_tcp: bool,
    pub tsig_key: Option<tsig::Key>,
}

impl NameServer {
    /// Creates a nameserver description with the default timing
    /// parameters, EDNS0 enabled, UDP transport, and no TSIG key.
    pub fn new(name: Name, addresses: Vec<SocketAddr>) -> Self {
        Self {
            name,
            addresses,
            retrans: DEFAULT_RETRANS,
            retries: DEFAULT_RETRIES,
            edns: true,
            use_tcp: false,
            tsig_key: None,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// QUERY CONSTRUCTION AND THE ONE-SHOT API                            //
////////////////////////////////////////////////////////////////////////

/// Builds the base query for a question: random ID, RD and CD set, no
/// EDNS (the exchange adds OPT per nameserver).
pub fn make_query(name: &Name, rr_type: Type, class: Class) -> Vec<u8> {
    let id = rand::thread_rng().gen();
    writer::build_query(id, name, rr_type, class, None)
}

/// Sends a question to a list of nameservers and blocks until an
/// answer passing the TSIG and header sanity checks arrives (or all
/// sources are exhausted).
///
/// This is the one-shot convenience wrapper over [`exchange`].
pub fn get(
    manager: &mut IoManager,
    name: &Name,
    rr_type: Type,
    class: Class,
    destinations: &[NameServer],
) -> Result<(Vec<u8>, NameServer), Error> {
    let query = make_query(name, rr_type, class);
    match exchange(manager, &query, destinations)? {
        ExchangeOutcome::Response { answer, respondent } => {
            check_response_header(&answer)?;
            Ok((answer, respondent))
        }
        ExchangeOutcome::TsigFailure => Err(Error::TsigFailure),
        ExchangeOutcome::NoAnswer => Err(Error::NoAnswer),
    }
}

////////////////////////////////////////////////////////////////////////
// RESPONSE SANITY CHECKS                                             //
////////////////////////////////////////////////////////////////////////

/// Checks a response's header before it is digested: the message must
/// be a well-sized query response, and the RCODE must be one we can
/// make sense of. NXDOMAIN is acceptable bare or accompanied by an
/// SOA or NSEC in the authority section; anything else maps to a
/// distinct error.
pub fn check_response_header(response: &[u8]) -> Result<(), Error> {
    let (header, mut reader) = Reader::new(response).map_err(|_| Error::BadHeader)?;
    if !header.qr || header.opcode != crate::message::Opcode::QUERY {
        return Err(Error::WrongAnswer);
    }

    // Walk the entire message to ensure the counts match its size.
    let mut questions = Vec::new();
    for _ in 0..header.qdcount {
        questions.push(reader.read_question().map_err(|_| Error::BadSize)?);
    }
    let mut authority_types = Vec::new();
    let records = header.ancount as usize + header.nscount as usize + header.arcount as usize;
    for i in 0..records {
        let rr = reader.read_rr().map_err(|_| Error::BadSize)?;
        let in_authority =
            i >= header.ancount as usize && i < header.ancount as usize + header.nscount as usize;
        if in_authority {
            authority_types.push(rr.rr_type);
        }
    }
    if reader.position() != response.len() {
        return Err(Error::BadSize);
    }

    match header.rcode {
        Rcode::NOERROR => Ok(()),
        Rcode::NXDOMAIN => {
            if header.ancount == 0 && header.nscount == 0 && header.arcount == 0 {
                return Ok(());
            }
            if authority_types
                .iter()
                .any(|&t| t == Type::SOA || t == Type::NSEC)
            {
                return Ok(());
            }
            Err(Error::NxDomain)
        }
        Rcode::FORMERR => Err(Error::FormErr),
        Rcode::SERVFAIL => Err(Error::ServFail),
        Rcode::NOTIMP => Err(Error::NotImpl),
        Rcode::REFUSED => Err(Error::Refused),
        _ => Err(Error::GenericFailure),
    }
}

/// Returns whether `response` plausibly answers `query`: the response
/// bit is set, the IDs match, and the question sections agree. A
/// message without QR set is someone else's query (or a reflection of
/// our own), never an answer.
pub fn response_matches_query(query: &[u8], response: &[u8]) -> bool {
    if query.len() < 12 || response.len() < 12 || query[0..2] != response[0..2] {
        return false;
    }
    if response[2] & 0x80 == 0 {
        return false;
    }
    let query_question = read_question(query);
    let response_question = read_question(response);
    match (query_question, response_question) {
        (Some(q), Some(r)) => q == r,
        _ => false,
    }
}

fn read_question(message: &[u8]) -> Option<Question> {
    let (header, mut reader) = Reader::new(message).ok()?;
    if header.qdcount != 1 {
        return None;
    }
    reader.read_question().ok()
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error raised by the transport half of the resolver.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// The transaction table is full.
    TooBusy,
    /// A socket-level failure ended the transaction.
    Io,
    /// An internal invariant was violated.
    Internal,
    /// Every source was exhausted without an answer.
    NoAnswer,
    /// The winning response failed TSIG verification.
    TsigFailure,
    /// The response header could not be parsed.
    BadHeader,
    /// The section counts do not match the message size.
    BadSize,
    /// The response is not a response to a query.
    WrongAnswer,
    /// The name does not exist (and the denial carried no proof
    /// records).
    NxDomain,
    FormErr,
    ServFail,
    NotImpl,
    Refused,
    GenericFailure,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TooBusy => f.write_str("too many outstanding transactions"),
            Self::Io => f.write_str("socket error"),
            Self::Internal => f.write_str("internal resolver error"),
            Self::NoAnswer => f.write_str("no answer from any nameserver"),
            Self::TsigFailure => f.write_str("response failed TSIG verification"),
            Self::BadHeader => f.write_str("malformed response header"),
            Self::BadSize => f.write_str("response counts do not match its size"),
            Self::WrongAnswer => f.write_str("response is not a query response"),
            Self::NxDomain => f.write_str("no such name"),
            Self::FormErr => f.write_str("nameserver reported a format error"),
            Self::ServFail => f.write_str("nameserver reported a server failure"),
            Self::NotImpl => f.write_str("nameserver does not implement the query"),
            Self::Refused => f.write_str("nameserver refused the query"),
            Self::GenericFailure => f.write_str("nameserver returned an unexpected RCODE"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
