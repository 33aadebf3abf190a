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

//! Validation statuses returned to callers.

use std::fmt;

/// What the validation engine concluded about an answer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StatusKind {
    /// The answer validated up to a trust anchor.
    Success,
    /// The queried name provably does not exist.
    NonexistentName,
    /// The queried name exists, but provably has no data of the
    /// queried type.
    NonexistentType,
    /// The chain reached a zone with a proven absence of DS: the data
    /// is unsigned, and provably so.
    ProvablyInsecure,
    /// Policy directed the engine not to validate this name.
    Ignored,
    /// A DNSKEY set verified with its own signatures but is not
    /// endorsed by any matching DS at the parent.
    SecurityLame,
    /// The data verified, but no configured trust anchor covers it.
    Indeterminate,
    /// A signature check failed, or a denial's proof does not hold.
    Bogus,
    /// The response carried an RRSIG covering no data.
    BareRrsig,
    /// The authentication chain exceeded the configured depth bound.
    TooManyLinks,
    /// The answer could not be resolved or digested.
    Error,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            Self::Success => "validated",
            Self::NonexistentName => "provably nonexistent name",
            Self::NonexistentType => "provably nonexistent type",
            Self::ProvablyInsecure => "provably insecure",
            Self::Ignored => "validation not requested by policy",
            Self::SecurityLame => "security lame",
            Self::Indeterminate => "indeterminate",
            Self::Bogus => "bogus",
            Self::BareRrsig => "signature without data",
            Self::TooManyLinks => "authentication chain too long",
            Self::Error => "validation error",
        };
        f.write_str(text)
    }
}

/// A validation status: the conclusion kind, plus whether the full
/// proof path to a trust anchor was traced. The two are separate
/// fields; a kind never implies chain completeness by itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ValStatus {
    pub kind: StatusKind,
    pub chain_complete: bool,
}

impl ValStatus {
    /// A status with an untraced (or inapplicable) proof path.
    pub fn new(kind: StatusKind) -> Self {
        Self {
            kind,
            chain_complete: false,
        }
    }

    /// A status whose proof path was traced to a trust anchor.
    pub fn complete(kind: StatusKind) -> Self {
        Self {
            kind,
            chain_complete: true,
        }
    }

    /// Returns whether a caller may treat the answer as trustworthy
    /// under the policy in effect.
    pub fn trusted(&self) -> bool {
        match self.kind {
            StatusKind::Success
            | StatusKind::NonexistentName
            | StatusKind::NonexistentType
            | StatusKind::ProvablyInsecure => self.chain_complete,
            StatusKind::Ignored => true,
            _ => false,
        }
    }
}

impl fmt::Display for ValStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.chain_complete {
            write!(f, "{} (chain complete)", self.kind)
        } else {
            self.kind.fmt(f)
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
