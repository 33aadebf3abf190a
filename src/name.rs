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

//! Implementation of data structures related to domain names.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::iter::FusedIterator;
use std::str::FromStr;

use arrayvec::ArrayVec;

/// The maximum number of labels in a domain name.
const MAX_N_LABELS: usize = 128;

/// The maximum length of the uncompressed on-the-wire representation of
/// a domain name.
const MAX_WIRE_LEN: usize = 255;

/// The maximum length of a label in a domain name (not including the
/// octet that provides the length).
const MAX_LABEL_LEN: usize = 63;

////////////////////////////////////////////////////////////////////////
// NAME STRUCTURE                                                     //
////////////////////////////////////////////////////////////////////////

/// A structure to represent a domain name.
///
/// A `Name` owns the uncompressed on-the-wire representation of a
/// domain name ([RFC 1035 § 3.1]) together with the offset of each
/// label in that representation. The name is always absolute: the wire
/// representation always ends with the null (root) label.
///
/// `Name`s can be constructed through the [`FromStr`] implementation
/// and from uncompressed on-the-wire names through
/// [`Name::try_from_uncompressed`] and
/// [`Name::try_from_uncompressed_all`]. Compressed names are handled by
/// the message reader, which chases the pointers and hands the
/// decompressed octets to this module.
///
/// Equality and hashing are ASCII-case-insensitive. The [`Ord`]
/// implementation provides the DNSSEC canonical ordering of
/// [RFC 4034 § 6.1].
///
/// [RFC 1035 § 3.1]: https://datatracker.ietf.org/doc/html/rfc1035#section-3.1
/// [RFC 4034 § 6.1]: https://datatracker.ietf.org/doc/html/rfc4034#section-6.1
#[derive(Clone)]
pub struct Name {
    wire: Box<[u8]>,
    label_offsets: Box<[u8]>,
}

#[allow(clippy::len_without_is_empty)] // A domain name is never empty!
impl Name {
    /// Returns the number of labels in this `Name`, including the null
    /// (root) label.
    pub fn len(&self) -> usize {
        self.label_offsets.len()
    }

    /// Returns the uncompressed on-the-wire representation of this
    /// `Name`.
    pub fn wire_repr(&self) -> &[u8] {
        &self.wire
    }

    /// Returns the length of the uncompressed on-the-wire
    /// representation of this `Name`.
    pub fn wire_len(&self) -> usize {
        self.wire.len()
    }

    /// Returns the content of label `n` (not including the length
    /// octet). Label 0 is the first (leftmost) label.
    ///
    /// # Panics
    ///
    /// Panics if `n` is out of range.
    pub fn label(&self, n: usize) -> &[u8] {
        let offset = self.label_offsets[n] as usize;
        let len = self.wire[offset] as usize;
        &self.wire[offset + 1..offset + 1 + len]
    }

    /// Returns an iterator over the labels in this `Name`.
    pub fn labels(&self) -> Labels {
        Labels {
            name: self,
            front: 0,
            back: self.len(),
        }
    }

    /// Returns whether the `Name` is the DNS root `.`.
    pub fn is_root(&self) -> bool {
        self.len() == 1
    }

    /// Returns whether the `Name` is a wildcard domain name (i.e.,
    /// whether its first label is `*`).
    pub fn is_wildcard(&self) -> bool {
        !self.is_root() && self.label(0) == b"*"
    }

    /// Returns whether this `Name` is equal to or a subdomain of
    /// `other`.
    pub fn eq_or_subdomain_of(&self, other: &Name) -> bool {
        self.len() >= other.len()
            && self
                .labels()
                .rev()
                .zip(other.labels().rev())
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }

    /// Returns the `Name` produced by removing the first label. This
    /// returns [`None`] for the root.
    pub fn parent(&self) -> Option<Name> {
        if self.is_root() {
            None
        } else {
            Some(self.suffix(self.len() - 1))
        }
    }

    /// Returns the `Name` comprising the last `n_labels` labels of this
    /// `Name` (counting the null label).
    ///
    /// # Panics
    ///
    /// Panics if `n_labels` is zero or greater than `self.len()`.
    pub fn suffix(&self, n_labels: usize) -> Name {
        assert!(n_labels >= 1 && n_labels <= self.len());
        let skip = self.len() - n_labels;
        let start = self.label_offsets[skip] as usize;
        let wire = self.wire[start..].to_vec().into_boxed_slice();
        let label_offsets = self.label_offsets[skip..]
            .iter()
            .map(|offset| offset - start as u8)
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Name {
            wire,
            label_offsets,
        }
    }

    /// Returns the wildcard name `*.` + the last `n_labels` labels of
    /// this `Name`. This is the name an RRSIG with a reduced label
    /// count asserts was the signed owner ([RFC 4035 § 5.3.2]).
    ///
    /// [RFC 4035 § 5.3.2]: https://datatracker.ietf.org/doc/html/rfc4035#section-5.3.2
    pub fn wildcard_of_suffix(&self, n_labels: usize) -> Name {
        let suffix = self.suffix(n_labels + 1);
        let mut wire = Vec::with_capacity(suffix.wire_len() + 2);
        wire.extend_from_slice(&[1, b'*']);
        wire.extend_from_slice(suffix.wire_repr());
        let mut label_offsets = Vec::with_capacity(suffix.len() + 1);
        label_offsets.push(0);
        label_offsets.extend(suffix.label_offsets.iter().map(|offset| offset + 2));
        Name {
            wire: wire.into_boxed_slice(),
            label_offsets: label_offsets.into_boxed_slice(),
        }
    }

    /// Converts all uppercase ASCII letters in the `Name` to lowercase
    /// in place.
    pub fn make_ascii_lowercase(&mut self) {
        self.wire.make_ascii_lowercase();
    }

    /// Returns the uncompressed on-the-wire representation of this
    /// `Name` with all ASCII letters lowercased, as required for the
    /// DNSSEC canonical form ([RFC 4034 § 6.2]).
    ///
    /// [RFC 4034 § 6.2]: https://datatracker.ietf.org/doc/html/rfc4034#section-6.2
    pub fn canonical_wire(&self) -> Vec<u8> {
        let mut wire = self.wire.to_vec();
        wire.make_ascii_lowercase();
        wire
    }
}

////////////////////////////////////////////////////////////////////////
// NAME CONSTRUCTION FROM WIRE DATA                                   //
////////////////////////////////////////////////////////////////////////

impl Name {
    /// Parses an uncompressed on-the-wire domain name starting at the
    /// beginning of `octets`. On success, the parsed `Name` and the
    /// number of octets it occupied are returned. Trailing data after
    /// the null label is permitted (and ignored).
    pub fn try_from_uncompressed(octets: &[u8]) -> Result<(Self, usize), Error> {
        let mut label_offsets = ArrayVec::<u8, MAX_N_LABELS>::new();
        let mut offset = 0;
        loop {
            let len = *octets.get(offset).ok_or(Error::UnexpectedEnd)? as usize;
            if len > MAX_LABEL_LEN {
                // High bits set: either a compression pointer (invalid
                // here) or a label type we do not know.
                return Err(Error::InvalidLabelType);
            }
            if offset + 1 + len > MAX_WIRE_LEN {
                return Err(Error::NameTooLong);
            }
            if octets.len() < offset + 1 + len {
                return Err(Error::UnexpectedEnd);
            }
            label_offsets
                .try_push(offset as u8)
                .map_err(|_| Error::NameTooLong)?;
            offset += 1 + len;
            if len == 0 {
                let wire = octets[0..offset].to_vec().into_boxed_slice();
                return Ok((
                    Self {
                        wire,
                        label_offsets: label_offsets.as_slice().into(),
                    },
                    offset,
                ));
            }
        }
    }

    /// Like [`Name::try_from_uncompressed`], but requires the name to
    /// occupy the entirety of `octets`.
    pub fn try_from_uncompressed_all(octets: &[u8]) -> Result<Self, Error> {
        let (name, len) = Self::try_from_uncompressed(octets)?;
        if len == octets.len() {
            Ok(name)
        } else {
            Err(Error::TrailingData)
        }
    }

    /// Returns the root name `.`.
    pub fn root() -> Self {
        Self {
            wire: Box::new([0]),
            label_offsets: Box::new([0]),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// NAME TEXTUAL REPRESENTATION                                        //
////////////////////////////////////////////////////////////////////////

impl FromStr for Name {
    type Err = Error;

    /// Parses a `Name` from the textual format of RFC 1035, including
    /// `\X` and `\DDD` escapes. Both absolute (trailing dot) and
    /// relative forms are accepted; relative names are treated as
    /// absolute.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        fn flush(
            label: &mut Vec<u8>,
            wire: &mut Vec<u8>,
            label_offsets: &mut ArrayVec<u8, MAX_N_LABELS>,
        ) -> Result<(), Error> {
            if label.is_empty() {
                return Err(Error::EmptyLabel);
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(Error::LabelTooLong);
            }
            if wire.len() + 1 + label.len() + 1 > MAX_WIRE_LEN {
                return Err(Error::NameTooLong);
            }
            label_offsets
                .try_push(wire.len() as u8)
                .map_err(|_| Error::NameTooLong)?;
            wire.push(label.len() as u8);
            wire.extend_from_slice(label);
            label.clear();
            Ok(())
        }

        if text == "." {
            return Ok(Self::root());
        }
        let mut wire = Vec::with_capacity(text.len() + 2);
        let mut label_offsets = ArrayVec::<u8, MAX_N_LABELS>::new();
        let mut label = Vec::with_capacity(MAX_LABEL_LEN);
        let mut chars = text.bytes();

        while let Some(octet) = chars.next() {
            match octet {
                b'.' => flush(&mut label, &mut wire, &mut label_offsets)?,
                b'\\' => match chars.next().ok_or(Error::InvalidEscape)? {
                    digit @ b'0'..=b'9' => {
                        let mut value = (digit - b'0') as u32;
                        for _ in 0..2 {
                            match chars.next() {
                                Some(digit @ b'0'..=b'9') => {
                                    value = value * 10 + (digit - b'0') as u32;
                                }
                                _ => return Err(Error::InvalidEscape),
                            }
                        }
                        let value = u8::try_from(value).or(Err(Error::InvalidEscape))?;
                        label.push(value);
                    }
                    other => label.push(other),
                },
                other => label.push(other),
            }
        }
        if !label.is_empty() {
            flush(&mut label, &mut wire, &mut label_offsets)?;
        } else if label_offsets.is_empty() {
            return Err(Error::EmptyLabel);
        }
        label_offsets
            .try_push(wire.len() as u8)
            .map_err(|_| Error::NameTooLong)?;
        if wire.len() + 1 > MAX_WIRE_LEN {
            return Err(Error::NameTooLong);
        }
        wire.push(0);
        Ok(Self {
            wire: wire.into_boxed_slice(),
            label_offsets: label_offsets.as_slice().into(),
        })
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        for n in 0..self.len() - 1 {
            for &octet in self.label(n) {
                match octet {
                    b'.' | b'\\' => write!(f, "\\{}", octet as char)?,
                    0x21..=0x7e => write!(f, "{}", octet as char)?,
                    _ => write!(f, "\\{octet:03}")?,
                }
            }
            f.write_str(".")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

////////////////////////////////////////////////////////////////////////
// NAME COMPARISON AND HASHING                                        //
////////////////////////////////////////////////////////////////////////

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.wire.eq_ignore_ascii_case(&other.wire)
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for &octet in self.wire.iter() {
            state.write_u8(octet.to_ascii_lowercase());
        }
    }
}

impl Ord for Name {
    /// Compares domain names using the canonical ordering of
    /// [RFC 4034 § 6.1]: right to left by label, each label compared as
    /// a lowercased octet string.
    ///
    /// [RFC 4034 § 6.1]: https://datatracker.ietf.org/doc/html/rfc4034#section-6.1
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.labels().rev().zip(other.labels().rev()) {
            let ordering = a
                .iter()
                .map(u8::to_ascii_lowercase)
                .cmp(b.iter().map(u8::to_ascii_lowercase));
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        self.len().cmp(&other.len())
    }
}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

////////////////////////////////////////////////////////////////////////
// LABEL ITERATOR                                                     //
////////////////////////////////////////////////////////////////////////

/// An iterator over the labels of a [`Name`], yielding each label's
/// content without its length octet. The final item is the empty root
/// label.
pub struct Labels<'a> {
    name: &'a Name,
    front: usize,
    back: usize,
}

impl<'a> Iterator for Labels<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.front < self.back {
            let label = self.name.label(self.front);
            self.front += 1;
            Some(label)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl DoubleEndedIterator for Labels<'_> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front < self.back {
            self.back -= 1;
            Some(self.name.label(self.back))
        } else {
            None
        }
    }
}

impl ExactSizeIterator for Labels<'_> {}
impl FusedIterator for Labels<'_> {}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error encountered while constructing a [`Name`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    EmptyLabel,
    InvalidEscape,
    InvalidLabelType,
    LabelTooLong,
    NameTooLong,
    TrailingData,
    UnexpectedEnd,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::EmptyLabel => f.write_str("empty label"),
            Self::InvalidEscape => f.write_str("invalid escape sequence"),
            Self::InvalidLabelType => f.write_str("invalid label type"),
            Self::LabelTooLong => f.write_str("label exceeds 63 octets"),
            Self::NameTooLong => f.write_str("name exceeds 255 octets"),
            Self::TrailingData => f.write_str("trailing data after name"),
            Self::UnexpectedEnd => f.write_str("unexpected end of input"),
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

    fn name(text: &str) -> Name {
        text.parse().unwrap()
    }

    #[test]
    fn parses_textual_names() {
        let n = name("www.example.com.");
        assert_eq!(n.len(), 4);
        assert_eq!(n.wire_repr(), b"\x03www\x07example\x03com\x00");
    }

    #[test]
    fn relative_names_are_made_absolute() {
        assert_eq!(name("example.com"), name("example.com."));
    }

    #[test]
    fn parses_escapes() {
        let n = name("a\\.b.c\\065.");
        assert_eq!(n.label(0), b"a.b");
        assert_eq!(n.label(1), b"cA");
    }

    #[test]
    fn rejects_empty_labels() {
        assert_eq!("a..b.".parse::<Name>().unwrap_err(), Error::EmptyLabel);
        assert_eq!("".parse::<Name>().unwrap_err(), Error::EmptyLabel);
    }

    #[test]
    fn rejects_oversized_labels() {
        let text = format!("{}.", "a".repeat(64));
        assert_eq!(text.parse::<Name>().unwrap_err(), Error::LabelTooLong);
    }

    #[test]
    fn displays_round_trip() {
        for text in ["www.example.com.", ".", "a\\.b.c."] {
            assert_eq!(name(text).to_string(), text);
        }
    }

    #[test]
    fn parses_wire_names() {
        let (n, len) = Name::try_from_uncompressed(b"\x03www\x07example\x03com\x00extra").unwrap();
        assert_eq!(len, 17);
        assert_eq!(n, name("www.example.com."));
        assert!(Name::try_from_uncompressed_all(b"\x03www\x00extra").is_err());
    }

    #[test]
    fn rejects_compression_pointers() {
        assert_eq!(
            Name::try_from_uncompressed(b"\xc0\x0c").unwrap_err(),
            Error::InvalidLabelType
        );
    }

    #[test]
    fn equality_ignores_case() {
        assert_eq!(name("EXAMPLE.com."), name("example.COM."));
    }

    #[test]
    fn superdomain_checks_work() {
        assert!(name("www.example.com.").eq_or_subdomain_of(&name("example.com.")));
        assert!(name("example.com.").eq_or_subdomain_of(&name("example.com.")));
        assert!(!name("example.com.").eq_or_subdomain_of(&name("www.example.com.")));
        assert!(name("example.com.").eq_or_subdomain_of(&Name::root()));
    }

    #[test]
    fn parent_strips_first_label() {
        assert_eq!(name("www.example.com.").parent().unwrap(), name("example.com."));
        assert_eq!(Name::root().parent(), None);
    }

    #[test]
    fn wildcard_expansion() {
        let n = name("a.b.example.com.");
        assert_eq!(n.wildcard_of_suffix(2), name("*.example.com."));
        assert!(n.wildcard_of_suffix(2).is_wildcard());
    }

    #[test]
    fn canonical_ordering_follows_rfc4034() {
        // The example ordering from RFC 4034 § 6.1.
        let ordered = [
            "example.",
            "a.example.",
            "yljkjljk.a.example.",
            "Z.a.example.",
            "zABC.a.EXAMPLE.",
            "z.example.",
            "\\001.z.example.",
            "*.z.example.",
            "\\200.z.example.",
        ];
        for window in ordered.windows(2) {
            assert!(
                name(window[0]) < name(window[1]),
                "{} should sort before {}",
                window[0],
                window[1]
            );
        }
    }
}
