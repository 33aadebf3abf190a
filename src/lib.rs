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

//! Verity is a DNSSEC-validating stub resolver library.
//!
//! It sends questions to recursive nameservers, digests the responses,
//! and checks the answers against the DNSSEC authentication chain
//! ([RFC 4033], [RFC 4034], [RFC 4035]) up to locally configured trust
//! anchors. Everything is synchronous; a query blocks the calling
//! thread until it completes or every source is exhausted.
//!
//! The usual entry point is a [`context::Context`], which holds the
//! validation policy, the shared RRset cache, and the upstream
//! nameservers:
//!
//! - [`context::Context::query`] resolves and validates an arbitrary
//!   question, returning the answer RRsets, a
//!   [`validate::ValStatus`], and the authentication chain built
//!   along the way;
//! - [`context::Context::lookup_host`] is the validated analogue of a
//!   host address lookup.
//!
//! The lower layers are usable on their own: [`resolver`] speaks the
//! DNS transport (UDP with TCP fallback, EDNS0, and TSIG), and
//! [`validate`] digests responses and verifies signatures.
//!
//! [RFC 4033]: https://datatracker.ietf.org/doc/html/rfc4033
//! [RFC 4034]: https://datatracker.ietf.org/doc/html/rfc4034
//! [RFC 4035]: https://datatracker.ietf.org/doc/html/rfc4035

#![warn(unsafe_code)]

pub mod cache;
pub mod class;
pub mod context;
pub mod message;
pub mod name;
pub mod policy;
pub mod resolver;
pub mod rr;
pub mod util;
pub mod validate;

pub use context::Context;
pub use validate::{StatusKind, ValStatus};
