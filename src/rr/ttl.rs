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

//! The [`Ttl`] wrapper for record time-to-live values.

use std::fmt;

////////////////////////////////////////////////////////////////////////
// TTLS                                                               //
////////////////////////////////////////////////////////////////////////

/// A record's time to live.
///
/// [RFC 2181 § 8] restricts TTLs to the range 0 through 2³¹ - 1, and
/// directs receivers to treat a value with the most significant bit
/// set as zero. This wrapper enforces that on construction:
/// `Ttl::from(u32)` clamps values above `i32::MAX` to zero, so every
/// `Ttl` in circulation is already in range. The ordering is the plain
/// numeric one, which the RRset code relies on when it keeps the
/// smallest TTL seen across a set's records.
///
/// [RFC 2181 § 8]: https://datatracker.ietf.org/doc/html/rfc2181#section-8
#[derive(Clone, Copy, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Ttl(u32);

impl From<u32> for Ttl {
    fn from(raw: u32) -> Self {
        if raw > i32::MAX as u32 {
            Self(0)
        } else {
            Self(raw)
        }
    }
}

impl From<Ttl> for u32 {
    fn from(ttl: Ttl) -> Self {
        ttl.0
    }
}

impl fmt::Debug for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_range_values_pass_through() {
        for value in [0, 300, 86400, i32::MAX as u32] {
            assert_eq!(u32::from(Ttl::from(value)), value);
        }
    }

    #[test]
    fn high_bit_values_clamp_to_zero() {
        assert_eq!(u32::from(Ttl::from(i32::MAX as u32 + 1)), 0);
        assert_eq!(u32::from(Ttl::from(u32::MAX)), 0);
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(Ttl::from(120) < Ttl::from(300));
    }
}
