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

//! The [`Rrset`] structure and its provenance metadata.

use crate::class::Class;
use crate::name::Name;
use crate::rr::dnssec::Rrsig;
use crate::rr::{Ttl, Type};

////////////////////////////////////////////////////////////////////////
// PROVENANCE                                                         //
////////////////////////////////////////////////////////////////////////

/// The message section an RRset was extracted from. The derived
/// ordering ranks sections by how authoritative their contents are:
/// answer over authority over additional.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Section {
    Additional,
    Authority,
    Answer,
}

/// How believable an RRset is, based on where it came from. The
/// derived ordering ranks low to high, so `a > b` means `a` is more
/// credible than `b`.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Credibility {
    Unset,
    Additional,
    NonauthAuthority,
    NonauthAnswer,
    AuthAuthority,
    AuthAnswer,
}

impl Credibility {
    /// Ranks an RRset from `section` of a message whose authoritative
    /// answer bit was `authoritative`.
    pub fn rank(section: Section, authoritative: bool) -> Self {
        match (section, authoritative) {
            (Section::Answer, true) => Self::AuthAnswer,
            (Section::Authority, true) => Self::AuthAuthority,
            (Section::Answer, false) => Self::NonauthAnswer,
            (Section::Authority, false) => Self::NonauthAuthority,
            (Section::Additional, _) => Self::Additional,
        }
    }
}

/// The shape of the answer an RRset contributes to, as determined by
/// the response digester.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AnswerKind {
    Unset,
    /// A direct answer to the question.
    Straight,
    /// A link in a CNAME chain.
    Cname,
    /// An NSEC that is part of a denial of existence.
    NackNsec,
    /// An SOA in the authority section of a denial.
    NackSoa,
    /// An RRSIG with no records that it covers.
    BareRrsig,
}

////////////////////////////////////////////////////////////////////////
// RRSETS                                                             //
////////////////////////////////////////////////////////////////////////

/// A set of resource records sharing an owner name, type, and class,
/// together with the RRSIGs covering the set and the provenance used
/// when competing RRsets are reconciled.
#[derive(Clone, Debug)]
pub struct Rrset {
    pub name: Name,
    pub rr_type: Type,
    pub class: Class,
    pub ttl: Ttl,
    pub rdata: Vec<Vec<u8>>,
    pub sigs: Vec<Rrsig>,
    pub credibility: Credibility,
    pub section: Section,
    pub answer_kind: AnswerKind,
}

impl Rrset {
    pub fn new(name: Name, rr_type: Type, class: Class, ttl: Ttl) -> Self {
        Self {
            name,
            rr_type,
            class,
            ttl,
            rdata: Vec::new(),
            sigs: Vec::new(),
            credibility: Credibility::Unset,
            section: Section::Additional,
            answer_kind: AnswerKind::Unset,
        }
    }

    /// Returns whether this RRset has the given owner, type, and
    /// class. Owner comparison ignores ASCII case.
    pub fn matches(&self, name: &Name, rr_type: Type, class: Class) -> bool {
        self.rr_type == rr_type && self.class == class && &self.name == name
    }

    /// Adds a record's RDATA to the set. Duplicate RDATA is not stored
    /// twice; the set's TTL becomes the minimum of the TTLs seen.
    pub fn add_rdata(&mut self, rdata: &[u8], ttl: Ttl) {
        if ttl < self.ttl {
            self.ttl = ttl;
        }
        if !self.rdata.iter().any(|existing| existing == rdata) {
            self.rdata.push(rdata.to_vec());
        }
    }

    /// Attaches an RRSIG covering this set.
    pub fn add_sig(&mut self, sig: Rrsig) {
        if !self.sigs.contains(&sig) {
            self.sigs.push(sig);
        }
    }

    /// Replaces this RRset's payload and provenance with `newcomer`'s.
    /// The cache uses this for in-place upgrades when a more credible
    /// copy of an RRset arrives.
    pub fn replace_with(&mut self, newcomer: Rrset) {
        *self = newcomer;
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    fn rrset() -> Rrset {
        Rrset::new(
            "example.com.".parse().unwrap(),
            Type::A,
            Class::IN,
            Ttl::from(300),
        )
    }

    #[test]
    fn credibility_ranks_sections() {
        assert!(Credibility::AuthAnswer > Credibility::AuthAuthority);
        assert!(Credibility::AuthAuthority > Credibility::NonauthAnswer);
        assert!(Credibility::NonauthAnswer > Credibility::NonauthAuthority);
        assert!(Credibility::NonauthAuthority > Credibility::Additional);
        assert_eq!(
            Credibility::rank(Section::Answer, true),
            Credibility::AuthAnswer
        );
        assert_eq!(
            Credibility::rank(Section::Additional, true),
            Credibility::Additional
        );
    }

    #[test]
    fn duplicate_rdata_is_not_stored() {
        let mut set = rrset();
        set.add_rdata(&[192, 0, 2, 1], Ttl::from(300));
        set.add_rdata(&[192, 0, 2, 1], Ttl::from(300));
        set.add_rdata(&[192, 0, 2, 2], Ttl::from(300));
        assert_eq!(set.rdata.len(), 2);
    }

    #[test]
    fn ttl_takes_the_minimum() {
        let mut set = rrset();
        set.add_rdata(&[192, 0, 2, 1], Ttl::from(120));
        assert_eq!(set.ttl, Ttl::from(120));
        set.add_rdata(&[192, 0, 2, 2], Ttl::from(600));
        assert_eq!(set.ttl, Ttl::from(120));
    }

    #[test]
    fn matching_ignores_owner_case() {
        let set = rrset();
        let upper: Name = "EXAMPLE.COM.".parse().unwrap();
        assert!(set.matches(&upper, Type::A, Class::IN));
        assert!(!set.matches(&upper, Type::AAAA, Class::IN));
    }
}
