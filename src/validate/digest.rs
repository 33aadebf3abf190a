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

//! The response digester: turns a wire-format response into
//! classified RRset buckets for the validation engine.
//!
//! Records are grouped into RRsets with their covering RRSIGs, CNAME
//! indirection is followed along a query-name chain, referrals are
//! detected and turned into replacement nameserver lists (with
//! glueless targets pruned), and DNSKEY/DS/zone material learned
//! anywhere in the response is set aside for the cache.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use log::{debug, trace};

use crate::class::Class;
use crate::message::{self, Rcode, Reader};
use crate::name::Name;
use crate::resolver::NameServer;
use crate::rr::dnssec::Rrsig;
use crate::rr::{AnswerKind, Credibility, Rrset, Section, Type};

/// The port queries are sent to.
const DNS_PORT: u16 = 53;

/// The overall shape of a digested response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseKind {
    /// The response answers the question (possibly through a CNAME
    /// chain).
    Answer,
    /// The name exists but has no data of the queried type.
    NoData,
    /// The name does not exist.
    NameError,
    /// The response delegates the question to another zone.
    Referral,
}

/// A referral to another zone's nameservers.
#[derive(Clone, Debug)]
pub struct Referral {
    pub zone: Name,
    pub nameservers: Vec<NameServer>,
}

/// A response broken down into classified buckets.
#[derive(Debug)]
pub struct Digested {
    pub kind: ResponseKind,
    /// Direct answers (straight or CNAME links), RRSIGs attached.
    pub answers: Vec<Rrset>,
    /// Denial material from the authority section (SOA and NSEC).
    pub proofs: Vec<Rrset>,
    /// The names visited while following CNAME indirection, starting
    /// with the query name.
    pub qname_chain: Vec<Name>,
    pub referral: Option<Referral>,
    /// NS sets and glue addresses learned from the response.
    pub learned_zones: Vec<Rrset>,
    pub learned_keys: Vec<Rrset>,
    pub learned_ds: Vec<Rrset>,
    /// Whether the response carried the authoritative-answer bit.
    pub authoritative: bool,
}

/// Digests a response to the question `(name, qtype, qclass)`.
pub fn digest(
    name: &Name,
    qtype: Type,
    qclass: Class,
    response: &[u8],
) -> Result<Digested, Error> {
    let (header, mut reader) = Reader::new(response)?;
    for _ in 0..header.qdcount {
        reader.read_question()?;
    }

    // Group the records of each section into RRsets, putting RRSIGs
    // aside until their sets are known.
    let mut rrsets: Vec<Rrset> = Vec::new();
    let mut pending_sigs: Vec<(Name, Section, Rrsig)> = Vec::new();
    let section_counts = [
        (Section::Answer, header.ancount),
        (Section::Authority, header.nscount),
        (Section::Additional, header.arcount),
    ];
    for (section, count) in section_counts {
        for _ in 0..count {
            let rr = reader.read_rr()?;
            if rr.rr_type == Type::OPT || rr.rr_type == Type::TSIG {
                continue;
            }
            if rr.rr_type == Type::RRSIG {
                let sig = Rrsig::try_from_rdata(&rr.rdata).map_err(|_| Error::BadRrsig)?;
                pending_sigs.push((rr.name, section, sig));
                continue;
            }
            match rrsets
                .iter_mut()
                .find(|set| set.matches(&rr.name, rr.rr_type, rr.class) && set.section == section)
            {
                Some(set) => set.add_rdata(&rr.rdata, rr.ttl),
                None => {
                    let mut set = Rrset::new(rr.name, rr.rr_type, rr.class, rr.ttl);
                    set.add_rdata(&rr.rdata, rr.ttl);
                    set.section = section;
                    set.credibility = Credibility::rank(section, header.aa);
                    rrsets.push(set);
                }
            }
        }
    }
    for (owner, section, sig) in pending_sigs {
        let covered = sig.type_covered;
        // Prefer a set in the signature's own section; a signature may
        // land in a different section than its set, so fall back to
        // any matching set.
        let position = rrsets
            .iter()
            .position(|set| set.matches(&owner, covered, qclass) && set.section == section)
            .or_else(|| {
                rrsets
                    .iter()
                    .position(|set| set.matches(&owner, covered, qclass))
            });
        match position {
            Some(position) => rrsets[position].add_sig(sig),
            None if section == Section::Answer => {
                // A signature covering no records: keep it as an empty
                // set so the engine can flag it.
                let mut set = Rrset::new(owner, covered, qclass, crate::rr::Ttl::from(0));
                set.section = section;
                set.credibility = Credibility::rank(section, header.aa);
                set.answer_kind = AnswerKind::BareRrsig;
                set.add_sig(sig);
                rrsets.push(set);
            }
            None => trace!("dropping stray RRSIG over {owner}/{covered}"),
        }
    }

    // Follow CNAME indirection through the answer section. A CNAME is
    // followed only when its owner is the current tail of the chain.
    let mut qname_chain = vec![name.clone()];
    loop {
        let tail = qname_chain[qname_chain.len() - 1].clone();
        let mut extended = false;
        for set in &mut rrsets {
            if set.section != Section::Answer || set.answer_kind != AnswerKind::Unset {
                continue;
            }
            if set.name != tail {
                continue;
            }
            if set.rr_type == qtype || qtype == Type::ANY {
                set.answer_kind = AnswerKind::Straight;
            } else if set.rr_type == Type::CNAME {
                let target = Name::try_from_uncompressed_all(&set.rdata[0])
                    .map_err(|_| Error::BadCname)?;
                set.answer_kind = AnswerKind::Cname;
                qname_chain.push(target);
                extended = true;
                break;
            }
        }
        if !extended {
            break;
        }
    }
    let answered = rrsets
        .iter()
        .any(|set| set.answer_kind == AnswerKind::Straight);

    // Classify the remaining sets.
    let mut digested = Digested {
        kind: ResponseKind::NoData,
        answers: Vec::new(),
        proofs: Vec::new(),
        qname_chain,
        referral: None,
        learned_zones: Vec::new(),
        learned_keys: Vec::new(),
        learned_ds: Vec::new(),
        authoritative: header.aa,
    };
    let mut referral_zone: Option<Name> = None;
    for mut set in rrsets {
        match set.rr_type {
            Type::DNSKEY => digested.learned_keys.push(set.clone()),
            Type::DS => digested.learned_ds.push(set.clone()),
            _ => (),
        }
        match set.section {
            Section::Answer => digested.answers.push(set),
            Section::Authority => match set.rr_type {
                Type::NS => {
                    if let Some(zone) = &referral_zone {
                        if *zone != set.name {
                            return Err(Error::MalformedReferral);
                        }
                    }
                    referral_zone = Some(set.name.clone());
                    digested.learned_zones.push(set);
                }
                Type::SOA => {
                    set.answer_kind = AnswerKind::NackSoa;
                    digested.proofs.push(set);
                }
                Type::NSEC => {
                    set.answer_kind = AnswerKind::NackNsec;
                    digested.proofs.push(set);
                }
                Type::DS => (),
                _ => trace!("ignoring authority-section {}/{}", set.name, set.rr_type),
            },
            Section::Additional => {
                if set.rr_type == Type::A {
                    digested.learned_zones.push(set);
                }
            }
        }
    }

    // An NS set in the authority of an unanswered response is a
    // referral; build the replacement nameserver list from the glue.
    if let Some(zone) = referral_zone {
        if !answered {
            let nameservers = referral_nameservers(&zone, &digested.learned_zones)?;
            debug!(
                "referred to zone {zone} with {} usable nameservers",
                nameservers.len()
            );
            digested.referral = Some(Referral { zone, nameservers });
            digested.kind = ResponseKind::Referral;
            return Ok(digested);
        }
    }
    digested.kind = if answered {
        ResponseKind::Answer
    } else if header.rcode == Rcode::NXDOMAIN {
        ResponseKind::NameError
    } else {
        ResponseKind::NoData
    };
    Ok(digested)
}

/// Builds the nameserver list for a referral to `zone`. Targets with
/// no glue address are dropped rather than looked up; if nothing
/// usable remains the referral fails.
fn referral_nameservers(zone: &Name, learned: &[Rrset]) -> Result<Vec<NameServer>, Error> {
    let ns_set = learned
        .iter()
        .find(|set| set.rr_type == Type::NS && set.name == *zone)
        .ok_or(Error::MissingGlue)?;
    let mut nameservers = Vec::new();
    for target_wire in &ns_set.rdata {
        let target =
            Name::try_from_uncompressed_all(target_wire).map_err(|_| Error::BadNsTarget)?;
        let addresses: Vec<SocketAddr> = learned
            .iter()
            .filter(|set| set.rr_type == Type::A && set.name == target)
            .flat_map(|set| set.rdata.iter())
            .filter(|rdata| rdata.len() == 4)
            .map(|rdata| {
                SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
                    DNS_PORT,
                )
            })
            .collect();
        if addresses.is_empty() {
            trace!("pruning glueless nameserver {target} for {zone}");
            continue;
        }
        nameservers.push(NameServer::new(target, addresses));
    }
    if nameservers.is_empty() {
        return Err(Error::MissingGlue);
    }
    Ok(nameservers)
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error digesting a response.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    Message(message::Error),
    BadRrsig,
    BadCname,
    BadNsTarget,
    /// Authority-section NS records name more than one zone.
    MalformedReferral,
    /// No referred nameserver has a usable address.
    MissingGlue,
    /// The same zone was referred to twice for one query.
    ReferralLoop,
}

impl From<message::Error> for Error {
    fn from(error: message::Error) -> Self {
        Self::Message(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Message(error) => write!(f, "malformed response: {error}"),
            Self::BadRrsig => f.write_str("malformed RRSIG record"),
            Self::BadCname => f.write_str("malformed CNAME record"),
            Self::BadNsTarget => f.write_str("malformed NS record"),
            Self::MalformedReferral => f.write_str("referral names more than one zone"),
            Self::MissingGlue => f.write_str("no referred nameserver has an address"),
            Self::ReferralLoop => f.write_str("referred to the same zone twice"),
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
    use crate::message::writer::{append_rr, build_query};

    struct ResponseBuilder {
        message: Vec<u8>,
        qtype: Type,
        qname: Name,
    }

    impl ResponseBuilder {
        fn new(qname: &str, qtype: Type) -> Self {
            let qname: Name = qname.parse().unwrap();
            let mut message = build_query(0x7777, &qname, qtype, Class::IN, None);
            message[2] |= 0x80; // QR
            Self {
                message,
                qtype,
                qname,
            }
        }

        fn authoritative(mut self) -> Self {
            self.message[2] |= 0x04;
            self
        }

        fn rcode(mut self, rcode: Rcode) -> Self {
            self.message[3] |= u8::from(rcode);
            self
        }

        fn rr(mut self, section: Section, name: &str, rr_type: Type, rdata: &[u8]) -> Self {
            let name: Name = name.parse().unwrap();
            append_rr(&mut self.message, &name, rr_type, Class::IN, 300, rdata);
            let offset = match section {
                Section::Answer => 6,
                Section::Authority => 8,
                Section::Additional => 10,
            };
            let count = u16::from_be_bytes([self.message[offset], self.message[offset + 1]]) + 1;
            self.message[offset..offset + 2].copy_from_slice(&count.to_be_bytes());
            self
        }

        fn digest(self) -> Result<Digested, Error> {
            digest(&self.qname, self.qtype, Class::IN, &self.message)
        }
    }

    fn name_rdata(name: &str) -> Vec<u8> {
        name.parse::<Name>().unwrap().wire_repr().to_vec()
    }

    #[test]
    fn straight_answer() {
        let digested = ResponseBuilder::new("www.example.com.", Type::A)
            .authoritative()
            .rr(Section::Answer, "www.example.com.", Type::A, &[192, 0, 2, 1])
            .digest()
            .unwrap();
        assert_eq!(digested.kind, ResponseKind::Answer);
        assert_eq!(digested.answers.len(), 1);
        assert_eq!(digested.answers[0].answer_kind, AnswerKind::Straight);
        assert_eq!(digested.answers[0].credibility, Credibility::AuthAnswer);
        assert_eq!(digested.qname_chain.len(), 1);
    }

    #[test]
    fn cname_chain_extends_the_qname_chain() {
        let digested = ResponseBuilder::new("www.example.com.", Type::A)
            .rr(
                Section::Answer,
                "www.example.com.",
                Type::CNAME,
                &name_rdata("host.example.net."),
            )
            .rr(
                Section::Answer,
                "host.example.net.",
                Type::A,
                &[192, 0, 2, 7],
            )
            .digest()
            .unwrap();
        assert_eq!(digested.kind, ResponseKind::Answer);
        assert_eq!(digested.qname_chain.len(), 2);
        assert_eq!(
            digested.qname_chain[1],
            "host.example.net.".parse().unwrap()
        );
        let kinds: Vec<_> = digested.answers.iter().map(|set| set.answer_kind).collect();
        assert!(kinds.contains(&AnswerKind::Cname));
        assert!(kinds.contains(&AnswerKind::Straight));
    }

    #[test]
    fn unrelated_cname_is_not_followed() {
        let digested = ResponseBuilder::new("www.example.com.", Type::A)
            .rr(
                Section::Answer,
                "other.example.com.",
                Type::CNAME,
                &name_rdata("host.example.net."),
            )
            .digest()
            .unwrap();
        assert_eq!(digested.qname_chain.len(), 1);
        assert_ne!(digested.kind, ResponseKind::Answer);
    }

    #[test]
    fn referral_with_glue() {
        let digested = ResponseBuilder::new("www.example.com.", Type::A)
            .rr(
                Section::Authority,
                "example.com.",
                Type::NS,
                &name_rdata("ns1.example.com."),
            )
            .rr(
                Section::Authority,
                "example.com.",
                Type::NS,
                &name_rdata("ns2.example.com."),
            )
            .rr(
                Section::Additional,
                "ns1.example.com.",
                Type::A,
                &[192, 0, 2, 53],
            )
            .digest()
            .unwrap();
        assert_eq!(digested.kind, ResponseKind::Referral);
        let referral = digested.referral.unwrap();
        assert_eq!(referral.zone, "example.com.".parse().unwrap());
        // ns2 has no glue and is pruned.
        assert_eq!(referral.nameservers.len(), 1);
        assert_eq!(
            referral.nameservers[0].addresses,
            vec!["192.0.2.53:53".parse().unwrap()]
        );
    }

    #[test]
    fn referral_without_any_glue_fails() {
        let result = ResponseBuilder::new("www.example.com.", Type::A)
            .rr(
                Section::Authority,
                "example.com.",
                Type::NS,
                &name_rdata("ns1.example.com."),
            )
            .digest();
        assert_eq!(result.unwrap_err(), Error::MissingGlue);
    }

    #[test]
    fn referral_naming_two_zones_is_malformed() {
        let result = ResponseBuilder::new("www.example.com.", Type::A)
            .rr(
                Section::Authority,
                "example.com.",
                Type::NS,
                &name_rdata("ns1.example.com."),
            )
            .rr(
                Section::Authority,
                "example.org.",
                Type::NS,
                &name_rdata("ns1.example.org."),
            )
            .digest();
        assert_eq!(result.unwrap_err(), Error::MalformedReferral);
    }

    #[test]
    fn bare_nxdomain_is_a_name_error() {
        let digested = ResponseBuilder::new("nope.example.com.", Type::A)
            .rcode(Rcode::NXDOMAIN)
            .digest()
            .unwrap();
        assert_eq!(digested.kind, ResponseKind::NameError);
        assert!(digested.answers.is_empty());
    }

    #[test]
    fn nodata_with_soa_keeps_the_proof() {
        let mut soa_rdata = name_rdata("ns1.example.com.");
        soa_rdata.extend_from_slice(&name_rdata("admin.example.com."));
        soa_rdata.extend_from_slice(&[0; 20]);
        let digested = ResponseBuilder::new("www.example.com.", Type::AAAA)
            .authoritative()
            .rr(Section::Authority, "example.com.", Type::SOA, &soa_rdata)
            .digest()
            .unwrap();
        assert_eq!(digested.kind, ResponseKind::NoData);
        assert_eq!(digested.proofs.len(), 1);
        assert_eq!(digested.proofs[0].answer_kind, AnswerKind::NackSoa);
    }

    #[test]
    fn learned_keys_are_set_aside() {
        let digested = ResponseBuilder::new("example.com.", Type::DNSKEY)
            .authoritative()
            .rr(
                Section::Answer,
                "example.com.",
                Type::DNSKEY,
                &[0x01, 0x00, 3, 5, 0xab, 0xcd],
            )
            .digest()
            .unwrap();
        assert_eq!(digested.kind, ResponseKind::Answer);
        assert_eq!(digested.learned_keys.len(), 1);
    }

    #[test]
    fn rrsigs_attach_to_their_sets() {
        let mut sig_rdata = Vec::new();
        sig_rdata.extend_from_slice(&u16::from(Type::A).to_be_bytes());
        sig_rdata.extend_from_slice(&[5, 3]);
        sig_rdata.extend_from_slice(&300u32.to_be_bytes());
        sig_rdata.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        sig_rdata.extend_from_slice(&1_690_000_000u32.to_be_bytes());
        sig_rdata.extend_from_slice(&12345u16.to_be_bytes());
        sig_rdata.extend_from_slice(&name_rdata("example.com."));
        sig_rdata.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let digested = ResponseBuilder::new("www.example.com.", Type::A)
            .rr(Section::Answer, "www.example.com.", Type::A, &[192, 0, 2, 1])
            .rr(Section::Answer, "www.example.com.", Type::RRSIG, &sig_rdata)
            .digest()
            .unwrap();
        assert_eq!(digested.answers.len(), 1);
        assert_eq!(digested.answers[0].sigs.len(), 1);
        assert_eq!(digested.answers[0].sigs[0].key_tag, 12345);
    }

    #[test]
    fn bare_rrsig_is_kept_and_flagged() {
        let mut sig_rdata = Vec::new();
        sig_rdata.extend_from_slice(&u16::from(Type::A).to_be_bytes());
        sig_rdata.extend_from_slice(&[5, 3]);
        sig_rdata.extend_from_slice(&300u32.to_be_bytes());
        sig_rdata.extend_from_slice(&1_700_000_000u32.to_be_bytes());
        sig_rdata.extend_from_slice(&1_690_000_000u32.to_be_bytes());
        sig_rdata.extend_from_slice(&12345u16.to_be_bytes());
        sig_rdata.extend_from_slice(&name_rdata("example.com."));
        sig_rdata.extend_from_slice(&[0xde, 0xad]);
        let digested = ResponseBuilder::new("www.example.com.", Type::A)
            .rr(Section::Answer, "www.example.com.", Type::RRSIG, &sig_rdata)
            .digest()
            .unwrap();
        assert_eq!(digested.answers.len(), 1);
        assert_eq!(digested.answers[0].answer_kind, AnswerKind::BareRrsig);
        assert!(digested.answers[0].rdata.is_empty());
    }
}
