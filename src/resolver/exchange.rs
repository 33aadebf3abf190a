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

//! The exchange orchestrator: fans a query out to a list of
//! nameservers through the I/O manager, waits for the first answer,
//! and settles the transaction (cancel the rest, verify TSIG).

use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::message::{tsig, writer};
use crate::name::Name;
use crate::resolver::{io, Error, IoManager, NameServer};

/// The outcome of an [`exchange`].
#[derive(Debug)]
pub enum ExchangeOutcome {
    /// A nameserver answered (and, if it was queried with TSIG, the
    /// response verified).
    Response {
        answer: Vec<u8>,
        respondent: NameServer,
    },
    /// A nameserver queried with TSIG answered, but its response did
    /// not verify.
    TsigFailure,
    /// Every source was exhausted without an answer.
    NoAnswer,
}

/// Sends `query` to `destinations` one nameserver at a time and
/// blocks until one answers or all are exhausted.
///
/// Nameservers are tried in order: the next one is contacted only
/// after the previous one has run out its full retransmission
/// schedule without answering. The query is customized per nameserver:
/// an OPT pseudo-RR is added when the nameserver does EDNS0, and the
/// message is TSIG-signed when the nameserver has a key. A nameserver
/// whose key cannot sign is skipped. The request MAC is remembered per
/// nameserver so that the winning response is verified against the MAC
/// it was actually queried with.
pub fn exchange(
    manager: &mut IoManager,
    query: &[u8],
    destinations: &[NameServer],
) -> Result<ExchangeOutcome, Error> {
    let mut id = None;
    let mut request_macs: Vec<(Name, Vec<u8>)> = Vec::new();

    for ns in destinations {
        let mut message = query.to_vec();
        if ns.edns {
            writer::add_opt(&mut message, writer::EdnsOptions::default());
        }
        if let Some(key) = &ns.tsig_key {
            match tsig::sign_query(&mut message, key, unix_now()) {
                Ok(mac) => request_macs.push((ns.name.clone(), mac)),
                Err(error) => {
                    warn!("cannot sign query for {}: {error}; skipping it", ns.name);
                    continue;
                }
            }
        }
        match manager.deliver(&mut id, &message, ns) {
            Ok(0) => {
                debug!("delivery to {} made no progress", ns.name);
                continue;
            }
            Ok(_) => (),
            Err(io::Error::TooManyTransactions) => {
                manager.cancel(&mut id);
                return Err(Error::TooBusy);
            }
            Err(io::Error::Poll) => {
                manager.cancel(&mut id);
                return Err(Error::Io);
            }
            Err(io::Error::UnknownTransaction) => {
                manager.cancel(&mut id);
                return Err(Error::Internal);
            }
        }
        let Some(transaction) = id else {
            continue;
        };

        // Drive this nameserver until it answers or its sources are
        // exhausted; only then fall through to the next one.
        loop {
            match manager.accept(transaction).map_err(accept_error)? {
                io::AcceptOutcome::Answer {
                    response,
                    respondent,
                } => {
                    manager.cancel(&mut id);
                    if let Some(key) = &respondent.tsig_key {
                        let mac = request_macs
                            .iter()
                            .find(|(name, _)| *name == respondent.name)
                            .map(|(_, mac)| mac.as_slice());
                        let verified = match mac {
                            Some(mac) => tsig::verify_response(&response, key, mac, unix_now()),
                            None => Err(tsig::VerifyError::UnknownKey),
                        };
                        if let Err(error) = verified {
                            warn!("response from {} failed TSIG: {error}", respondent.name);
                            return Ok(ExchangeOutcome::TsigFailure);
                        }
                    }
                    return Ok(ExchangeOutcome::Response {
                        answer: response,
                        respondent,
                    });
                }
                io::AcceptOutcome::NoAnswerYet => {
                    manager.wait(transaction).map_err(accept_error)?;
                }
                io::AcceptOutcome::NoAnswer => break,
            }
        }
    }

    manager.cancel(&mut id);
    Ok(ExchangeOutcome::NoAnswer)
}

fn accept_error(error: io::Error) -> Error {
    match error {
        io::Error::Poll => Error::Io,
        _ => Error::Internal,
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
