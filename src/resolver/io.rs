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

//! The transaction I/O manager: a synchronous multiplexer for
//! query/response exchanges over UDP (with TCP fallback on
//! truncation).
//!
//! A transaction groups the sources (nameserver addresses) a query has
//! been delivered to. Each source tracks its own socket,
//! retransmission schedule, and cancel deadline. [`IoManager::accept`]
//! is non-blocking; callers interleave it with [`IoManager::wait`] to
//! block until the next retransmission or cancellation is due.

use std::io::{Read, Write};
use std::net::{TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use nix::poll::{poll, PollFd, PollFlags};
use rand::Rng;
use slab::Slab;

use crate::resolver::{response_matches_query, NameServer};

/// The maximum number of concurrently open transactions.
const MAX_TRANSACTIONS: usize = 128;

/// The size of the receive buffer for UDP responses.
const UDP_BUFFER_SIZE: usize = 65535;

/// The TC bit in the third octet of a message header.
const TC_MASK: u8 = 0x02;

////////////////////////////////////////////////////////////////////////
// PUBLIC TYPES                                                       //
////////////////////////////////////////////////////////////////////////

/// An identifier for an open transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TransactionId(usize);

/// The outcome of a call to [`IoManager::accept`].
#[derive(Debug)]
pub enum AcceptOutcome {
    /// A response arrived. The respondent is returned with its address
    /// list narrowed to the address that actually answered.
    Answer {
        response: Vec<u8>,
        respondent: NameServer,
    },
    /// Sources remain, but none has answered yet.
    NoAnswerYet,
    /// Every source has been exhausted.
    NoAnswer,
}

/// An error from the I/O manager.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    TooManyTransactions,
    UnknownTransaction,
    Poll,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::TooManyTransactions => f.write_str("transaction table is full"),
            Self::UnknownTransaction => f.write_str("unknown transaction"),
            Self::Poll => f.write_str("polling for socket readiness failed"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// SOURCES                                                            //
////////////////////////////////////////////////////////////////////////

enum Transport {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

impl Transport {
    fn raw_fd(&self) -> RawFd {
        match self {
            Self::Udp(socket) => socket.as_raw_fd(),
            Self::Tcp(stream) => stream.as_raw_fd(),
        }
    }
}

/// One expected arrival: a nameserver we have sent (or will send) the
/// query to, and the bookkeeping to retransmit and eventually give up.
struct Source {
    transport: Option<Transport>,
    ns: NameServer,
    which_address: usize,
    using_stream: bool,
    query: Vec<u8>,
    response: Option<Vec<u8>>,
    remaining_attempts: u32,
    next_try: Instant,
    cancel_at: Instant,
}

/// The total time a source is given on one address: the sum of the
/// exponentially backed-off retransmission intervals.
fn source_timeout(ns: &NameServer) -> Duration {
    let mut total = 0;
    for attempt in 0..=ns.retries {
        total += ns.retrans << attempt;
    }
    Duration::from_secs(total)
}

impl Source {
    fn new(query: Vec<u8>, ns: NameServer) -> Self {
        let now = Instant::now();
        let timeout = source_timeout(&ns);
        let remaining_attempts = ns.retries + 1;
        let using_stream = ns.use_tcp;
        Self {
            transport: None,
            ns,
            which_address: 0,
            using_stream,
            query,
            response: None,
            remaining_attempts,
            next_try: now,
            cancel_at: now + timeout,
        }
    }

    fn has_more_addresses(&self) -> bool {
        self.which_address + 1 < self.ns.addresses.len()
    }

    /// Starts over with the source's next address.
    fn move_to_next_address(&mut self) {
        self.transport = None;
        self.which_address += 1;
        self.remaining_attempts = self.ns.retries + 1;
        let now = Instant::now();
        self.next_try = now;
        self.cancel_at = now + source_timeout(&self.ns);
    }

    /// Retires the source; it will be removed on the next check pass.
    fn retire(&mut self) {
        self.transport = None;
        self.remaining_attempts = 0;
        self.cancel_at = Instant::now();
    }

    /// Abandons the UDP conversation and starts over via TCP, keeping
    /// the same address (it already got a rise out of the server).
    fn switch_to_tcp(&mut self) {
        debug!("switching to TCP for {}", self.ns.name);
        self.transport = None;
        self.response = None;
        self.using_stream = true;
        self.remaining_attempts = self.ns.retries + 1;
        let now = Instant::now();
        self.next_try = now;
        self.cancel_at = now + source_timeout(&self.ns);
    }

    /// Sends (or resends) the query, creating and connecting the
    /// socket first if necessary.
    fn send(&mut self) -> std::io::Result<()> {
        let address = *self
            .ns
            .addresses
            .get(self.which_address)
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrNotAvailable))?;
        let transport = match self.transport.as_mut() {
            Some(transport) => transport,
            None => {
                let new = if self.using_stream {
                    Transport::Tcp(TcpStream::connect(address)?)
                } else {
                    let socket = bind_to_random_source()?;
                    socket.connect(address)?;
                    socket.set_nonblocking(true)?;
                    Transport::Udp(socket)
                };
                self.transport.insert(new)
            }
        };
        match transport {
            Transport::Udp(socket) => {
                socket.send(&self.query)?;
            }
            Transport::Tcp(stream) => {
                let length = (self.query.len() as u16).to_be_bytes();
                stream.write_all(&length)?;
                stream.write_all(&self.query)?;
            }
        }
        Ok(())
    }

    /// Reads whatever the socket has ready. A response that does not
    /// match the query is discarded; a truncated UDP response
    /// triggers the switch to TCP.
    fn read(&mut self) {
        match self.transport.as_mut() {
            Some(Transport::Udp(socket)) => {
                let mut buffer = vec![0; UDP_BUFFER_SIZE];
                match socket.recv(&mut buffer) {
                    Ok(received) => {
                        buffer.truncate(received);
                        if !response_matches_query(&self.query, &buffer) {
                            trace!("discarding mismatched response from {}", self.ns.name);
                            return;
                        }
                        if buffer.len() > 2 && buffer[2] & TC_MASK != 0 {
                            self.switch_to_tcp();
                        } else {
                            self.response = Some(buffer);
                        }
                    }
                    Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => (),
                    Err(error) => {
                        warn!("UDP read from {} failed: {error}", self.ns.name);
                        self.retire();
                    }
                }
            }
            Some(Transport::Tcp(stream)) => {
                let mut result = || -> std::io::Result<Vec<u8>> {
                    let mut length = [0; 2];
                    stream.read_exact(&mut length)?;
                    let mut buffer = vec![0; u16::from_be_bytes(length) as usize];
                    stream.read_exact(&mut buffer)?;
                    Ok(buffer)
                };
                match result() {
                    Ok(buffer) => {
                        if response_matches_query(&self.query, &buffer) {
                            self.response = Some(buffer);
                        } else {
                            trace!("discarding mismatched response from {}", self.ns.name);
                        }
                    }
                    Err(error) => {
                        warn!("TCP read from {} failed: {error}", self.ns.name);
                        self.retire();
                    }
                }
            }
            None => (),
        }
    }
}

/// Binds a UDP socket to a random ephemeral port.
fn bind_to_random_source() -> std::io::Result<UdpSocket> {
    let mut rng = rand::thread_rng();
    let start: u16 = rng.gen_range(1024..=65535);
    let mut port = start;
    loop {
        match UdpSocket::bind(("0.0.0.0", port)) {
            Ok(socket) => return Ok(socket),
            Err(error) => {
                port = if port == 65535 { 1024 } else { port + 1 };
                if port == start {
                    return Err(error);
                }
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////
// THE I/O MANAGER                                                    //
////////////////////////////////////////////////////////////////////////

/// The transaction I/O manager. See the module documentation.
#[derive(Default)]
pub struct IoManager {
    transactions: Slab<Vec<Source>>,
}

impl IoManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source to a transaction, allocating the transaction on
    /// first use, and runs the check pass. The number of live sources
    /// is returned; zero means this delivery made no progress (the
    /// caller moves on to its next nameserver).
    pub fn deliver(
        &mut self,
        id: &mut Option<TransactionId>,
        query: &[u8],
        ns: &NameServer,
    ) -> Result<usize, Error> {
        let index = match id {
            Some(id) => id.0,
            None => {
                if self.transactions.len() >= MAX_TRANSACTIONS {
                    return Err(Error::TooManyTransactions);
                }
                let index = self.transactions.insert(Vec::new());
                *id = Some(TransactionId(index));
                index
            }
        };
        let sources = self
            .transactions
            .get_mut(index)
            .ok_or(Error::UnknownTransaction)?;
        sources.push(Source::new(query.to_vec(), ns.clone()));
        let (active, _) = check_sources(sources);
        Ok(active)
    }

    /// Non-blocking check for an answer to the transaction.
    pub fn accept(&mut self, id: TransactionId) -> Result<AcceptOutcome, Error> {
        let sources = self
            .transactions
            .get_mut(id.0)
            .ok_or(Error::UnknownTransaction)?;
        let (active, _) = check_sources(sources);
        if active == 0 {
            return Ok(AcceptOutcome::NoAnswer);
        }
        if let Some(outcome) = harvest(sources) {
            return Ok(outcome);
        }

        // Zero-timeout poll: see whether any source is ready to read.
        let mut fds = Vec::with_capacity(sources.len());
        let mut fd_sources = Vec::with_capacity(sources.len());
        for (index, source) in sources.iter().enumerate() {
            if let Some(transport) = &source.transport {
                fds.push(PollFd::new(transport.raw_fd(), PollFlags::POLLIN));
                fd_sources.push(index);
            }
        }
        if fds.is_empty() {
            return Ok(AcceptOutcome::NoAnswerYet);
        }
        let ready = poll(&mut fds, 0).or(Err(Error::Poll))?;
        if ready == 0 {
            return Ok(AcceptOutcome::NoAnswerYet);
        }
        let readable: Vec<usize> = fds
            .iter()
            .zip(&fd_sources)
            .filter(|(fd, _)| {
                fd.revents()
                    .map_or(false, |revents| !revents.is_empty())
            })
            .map(|(_, &index)| index)
            .collect();
        for index in readable {
            sources[index].read();
        }
        Ok(harvest(sources).unwrap_or(AcceptOutcome::NoAnswerYet))
    }

    /// Blocks until a source is readable or the transaction's next
    /// retransmission or cancellation is due.
    pub fn wait(&mut self, id: TransactionId) -> Result<(), Error> {
        let sources = self
            .transactions
            .get(id.0)
            .ok_or(Error::UnknownTransaction)?;
        let now = Instant::now();
        let next_event = sources
            .iter()
            .flat_map(|source| [source.next_try, source.cancel_at])
            .min();
        let timeout = match next_event {
            Some(event) => event.saturating_duration_since(now),
            None => return Ok(()),
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let mut fds: Vec<PollFd> = sources
            .iter()
            .filter_map(|source| source.transport.as_ref())
            .map(|transport| PollFd::new(transport.raw_fd(), PollFlags::POLLIN))
            .collect();
        if fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(());
        }
        poll(&mut fds, timeout_ms).or(Err(Error::Poll))?;
        Ok(())
    }

    /// Cancels a transaction, closing its sockets and freeing its
    /// slot.
    pub fn cancel(&mut self, id: &mut Option<TransactionId>) {
        if let Some(id) = id.take() {
            if self.transactions.contains(id.0) {
                self.transactions.remove(id.0);
            }
        }
    }

    /// Cancels every open transaction.
    pub fn cancel_all(&mut self) {
        self.transactions.clear();
    }
}

/// The check pass: cancels sources whose deadline has passed (moving
/// to their next address first when one remains) and (re)sends to
/// sources whose retry time has arrived, with exponential backoff.
/// Returns the number of live sources and the time of the next
/// scheduled event.
fn check_sources(sources: &mut Vec<Source>) -> (usize, Option<Instant>) {
    let now = Instant::now();
    let mut next_event: Option<Instant> = None;
    let mut index = 0;
    while index < sources.len() {
        let source = &mut sources[index];
        if source.cancel_at <= now {
            if source.has_more_addresses() {
                debug!("source {} timed out; trying its next address", source.ns.name);
                source.move_to_next_address();
            } else {
                debug!("source {} timed out; canceling", source.ns.name);
                sources.remove(index);
                continue;
            }
        }
        let source = &mut sources[index];
        if source.next_try <= now && source.remaining_attempts > 0 {
            match source.send() {
                Ok(()) => {
                    let shift = source.ns.retries + 1 - source.remaining_attempts;
                    source.next_try = now + Duration::from_secs(source.ns.retrans << shift);
                    source.remaining_attempts -= 1;
                }
                Err(error) => {
                    if source.has_more_addresses() {
                        debug!(
                            "send to {} failed ({error}); trying its next address",
                            source.ns.name
                        );
                        source.move_to_next_address();
                    } else {
                        debug!("send to {} failed ({error}); canceling", source.ns.name);
                        source.retire();
                        sources.remove(index);
                        continue;
                    }
                }
            }
        }
        let source = &sources[index];
        match next_event {
            Some(event) => {
                next_event = Some(event.min(source.next_try).min(source.cancel_at));
            }
            None => next_event = Some(source.next_try.min(source.cancel_at)),
        }
        index += 1;
    }
    (sources.len(), next_event)
}

/// Plucks a stored response, if any source has one.
fn harvest(sources: &mut [Source]) -> Option<AcceptOutcome> {
    for source in sources {
        if let Some(response) = source.response.take() {
            let mut respondent = source.ns.clone();
            if let Some(&address) = source.ns.addresses.get(source.which_address) {
                respondent.addresses = vec![address];
            }
            return Some(AcceptOutcome::Answer {
                response,
                respondent,
            });
        }
    }
    None
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::Class;
    use crate::message::writer::build_query;
    use crate::rr::Type;

    fn test_ns(address: std::net::SocketAddr) -> NameServer {
        NameServer::new("ns.test.".parse().unwrap(), vec![address])
    }

    fn spawn_echo_server() -> std::net::SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let address = socket.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut buffer = [0; UDP_BUFFER_SIZE];
            let (received, peer) = socket.recv_from(&mut buffer).unwrap();
            let mut response = buffer[..received].to_vec();
            response[2] |= 0x80; // QR
            socket.send_to(&response, peer).unwrap();
        });
        address
    }

    fn query() -> Vec<u8> {
        build_query(
            0x2222,
            &"example.com.".parse().unwrap(),
            Type::A,
            Class::IN,
            None,
        )
    }

    #[test]
    fn delivers_and_accepts_a_response() {
        let address = spawn_echo_server();
        let mut manager = IoManager::new();
        let mut id = None;
        let query = query();
        let active = manager.deliver(&mut id, &query, &test_ns(address)).unwrap();
        assert_eq!(active, 1);
        let id = id.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match manager.accept(id).unwrap() {
                AcceptOutcome::Answer {
                    response,
                    respondent,
                } => {
                    assert!(response_matches_query(&query, &response));
                    assert_eq!(respondent.addresses, vec![address]);
                    break;
                }
                AcceptOutcome::NoAnswerYet => {
                    assert!(Instant::now() < deadline, "no answer within the deadline");
                    std::thread::sleep(Duration::from_millis(5));
                }
                AcceptOutcome::NoAnswer => panic!("sources exhausted unexpectedly"),
            }
        }
    }

    #[test]
    fn tcp_preference_queries_over_tcp_from_the_start() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut length = [0; 2];
            stream.read_exact(&mut length).unwrap();
            let mut message = vec![0; u16::from_be_bytes(length) as usize];
            stream.read_exact(&mut message).unwrap();
            message[2] |= 0x80; // QR
            stream.write_all(&length).unwrap();
            stream.write_all(&message).unwrap();
        });

        let mut manager = IoManager::new();
        let mut id = None;
        let mut ns = test_ns(address);
        ns.use_tcp = true;
        let query = query();
        manager.deliver(&mut id, &query, &ns).unwrap();
        let id = id.unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match manager.accept(id).unwrap() {
                AcceptOutcome::Answer { response, .. } => {
                    assert!(response_matches_query(&query, &response));
                    break;
                }
                AcceptOutcome::NoAnswerYet => {
                    assert!(Instant::now() < deadline, "no answer within the deadline");
                    std::thread::sleep(Duration::from_millis(5));
                }
                AcceptOutcome::NoAnswer => panic!("sources exhausted unexpectedly"),
            }
        }
    }

    #[test]
    fn unknown_transactions_are_rejected() {
        let mut manager = IoManager::new();
        assert_eq!(
            manager.accept(TransactionId(42)).unwrap_err(),
            Error::UnknownTransaction
        );
    }

    #[test]
    fn sources_without_addresses_make_no_progress() {
        let mut manager = IoManager::new();
        let mut id = None;
        let ns = NameServer::new("ns.test.".parse().unwrap(), Vec::new());
        let active = manager.deliver(&mut id, &query(), &ns).unwrap();
        assert_eq!(active, 0);
    }

    #[test]
    fn cancel_frees_the_slot() {
        let address = spawn_echo_server();
        let mut manager = IoManager::new();
        let mut id = None;
        manager.deliver(&mut id, &query(), &test_ns(address)).unwrap();
        let raw = id.unwrap();
        manager.cancel(&mut id);
        assert_eq!(id, None);
        assert_eq!(manager.accept(raw).unwrap_err(), Error::UnknownTransaction);
    }
}
