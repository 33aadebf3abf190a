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

//! The shared RRset cache.
//!
//! The cache holds data as received off the wire, before any
//! verification; trust is established later by the validation engine.
//! It is owned by the [`Context`](crate::context::Context) rather than
//! being process-global, so independent contexts never share state.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, trace};

use crate::class::Class;
use crate::name::Name;
use crate::resolver::NameServer;
use crate::rr::{Rrset, Type};

/// The port root nameserver addresses are derived with.
const DNS_PORT: u16 = 53;

/// The bucket an RRset is cached in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Bucket {
    /// General answer data.
    Answers,
    /// Learned zone information (NS sets and glue).
    ZoneInfo,
    /// DNSKEY sets.
    Keys,
    /// DS sets.
    Dss,
}

/// The RRset cache: four buckets of unverified RRsets, each behind its
/// own reader/writer lock. Guards are scoped to the individual
/// operation and never held across resolver calls.
#[derive(Debug, Default)]
pub struct Cache {
    answers: RwLock<Vec<Rrset>>,
    zone_info: RwLock<Vec<Rrset>>,
    keys: RwLock<Vec<Rrset>>,
    dss: RwLock<Vec<Rrset>>,
    /// The root nameserver list, derived once from root hints and
    /// kept apart from the regular buckets.
    root_ns: RwLock<Option<Vec<NameServer>>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, bucket: Bucket) -> &RwLock<Vec<Rrset>> {
        match bucket {
            Bucket::Answers => &self.answers,
            Bucket::ZoneInfo => &self.zone_info,
            Bucket::Keys => &self.keys,
            Bucket::Dss => &self.dss,
        }
    }

    /// Looks up an RRset by owner, type, and class. A clone is
    /// returned, so callers cannot mutate cache state through it.
    pub fn get(&self, bucket: Bucket, name: &Name, rr_type: Type, class: Class) -> Option<Rrset> {
        let entries = read(self.bucket(bucket));
        entries
            .iter()
            .find(|entry| entry.matches(name, rr_type, class))
            .cloned()
    }

    /// Merges a batch of RRsets into a bucket. When a newcomer
    /// collides with a cached RRset, the incumbent is replaced only if
    /// the newcomer's credibility is strictly higher, or equal with a
    /// strictly better section rank; ties keep the incumbent and the
    /// newcomer is discarded. This keeps the cache monotone: less
    /// authoritative data never displaces more authoritative data.
    pub fn stow(&self, bucket: Bucket, newcomers: Vec<Rrset>) {
        if newcomers.is_empty() {
            return;
        }
        let mut entries = write(self.bucket(bucket));
        for newcomer in newcomers {
            match entries
                .iter_mut()
                .find(|entry| entry.matches(&newcomer.name, newcomer.rr_type, newcomer.class))
            {
                Some(incumbent) => {
                    let upgrade = newcomer.credibility > incumbent.credibility
                        || (newcomer.credibility == incumbent.credibility
                            && newcomer.section > incumbent.section);
                    if upgrade {
                        trace!(
                            "cache: replacing {}/{} with a more credible copy",
                            newcomer.name,
                            newcomer.rr_type,
                        );
                        incumbent.replace_with(newcomer);
                    }
                }
                None => entries.push(newcomer),
            }
        }
    }

    /// Derives the root nameserver list from root-hint RRsets (the NS
    /// set at the root plus A glue for its targets) and stores it. A
    /// target with no glue address is dropped rather than looked up.
    /// The first successful stow wins; later hints are ignored.
    pub fn stow_root_info(&self, hints: &[Rrset]) {
        let mut slot = self
            .root_ns
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let Some(ns_set) = hints
            .iter()
            .find(|set| set.rr_type == Type::NS && set.name.is_root())
        else {
            debug!("root hints carry no NS set for the root");
            return;
        };
        let mut nameservers = Vec::new();
        for target_wire in &ns_set.rdata {
            let Ok(target) = Name::try_from_uncompressed_all(target_wire) else {
                continue;
            };
            let addresses: Vec<SocketAddr> = hints
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
                trace!("dropping glueless root nameserver {target}");
                continue;
            }
            nameservers.push(NameServer::new(target, addresses));
        }
        if nameservers.is_empty() {
            debug!("root hints yielded no usable nameservers");
            return;
        }
        debug!("stowing {} root nameservers", nameservers.len());
        *slot = Some(nameservers);
    }

    /// Returns a clone of the root nameserver list, if hints have
    /// been stowed.
    pub fn get_root_ns(&self) -> Option<Vec<NameServer>> {
        self.root_ns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Empties every bucket. The root nameserver list comes from
    /// configuration, not from responses, and is left in place.
    pub fn flush(&self) {
        for bucket in [Bucket::Answers, Bucket::ZoneInfo, Bucket::Keys, Bucket::Dss] {
            write(self.bucket(bucket)).clear();
        }
    }
}

// The cached data is plain and every critical section is short, so a
// panic mid-mutation cannot leave a bucket in an unusable state; a
// poisoned lock is therefore safe to enter.
fn read(lock: &RwLock<Vec<Rrset>>) -> RwLockReadGuard<Vec<Rrset>> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(lock: &RwLock<Vec<Rrset>>) -> RwLockWriteGuard<Vec<Rrset>> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rr::{Credibility, Section, Ttl};

    fn rrset(rdata: &[u8], credibility: Credibility, section: Section) -> Rrset {
        let mut set = Rrset::new(
            "example.com.".parse().unwrap(),
            Type::A,
            Class::IN,
            Ttl::from(300),
        );
        set.add_rdata(rdata, Ttl::from(300));
        set.credibility = credibility;
        set.section = section;
        set
    }

    fn name() -> Name {
        "example.com.".parse().unwrap()
    }

    #[test]
    fn stow_and_get_round_trip() {
        let cache = Cache::new();
        let set = rrset(&[192, 0, 2, 1], Credibility::NonauthAnswer, Section::Answer);
        cache.stow(Bucket::Answers, vec![set]);
        let found = cache.get(Bucket::Answers, &name(), Type::A, Class::IN).unwrap();
        assert_eq!(found.rdata, vec![vec![192, 0, 2, 1]]);
        assert!(cache.get(Bucket::Keys, &name(), Type::A, Class::IN).is_none());
    }

    #[test]
    fn merge_is_monotone() {
        let cache = Cache::new();
        cache.stow(
            Bucket::Answers,
            vec![rrset(&[192, 0, 2, 1], Credibility::AuthAnswer, Section::Answer)],
        );
        // A less credible copy never displaces the incumbent.
        cache.stow(
            Bucket::Answers,
            vec![rrset(&[192, 0, 2, 2], Credibility::Additional, Section::Additional)],
        );
        let found = cache.get(Bucket::Answers, &name(), Type::A, Class::IN).unwrap();
        assert_eq!(found.rdata, vec![vec![192, 0, 2, 1]]);
    }

    #[test]
    fn more_credible_data_replaces_the_incumbent() {
        let cache = Cache::new();
        cache.stow(
            Bucket::Answers,
            vec![rrset(
                &[192, 0, 2, 1],
                Credibility::NonauthAuthority,
                Section::Authority,
            )],
        );
        cache.stow(
            Bucket::Answers,
            vec![rrset(&[192, 0, 2, 2], Credibility::AuthAnswer, Section::Answer)],
        );
        let found = cache.get(Bucket::Answers, &name(), Type::A, Class::IN).unwrap();
        assert_eq!(found.rdata, vec![vec![192, 0, 2, 2]]);
    }

    #[test]
    fn equal_credibility_ties_respect_section_rank() {
        let cache = Cache::new();
        cache.stow(
            Bucket::Answers,
            vec![rrset(&[192, 0, 2, 1], Credibility::NonauthAnswer, Section::Answer)],
        );
        cache.stow(
            Bucket::Answers,
            vec![rrset(
                &[192, 0, 2, 2],
                Credibility::NonauthAnswer,
                Section::Additional,
            )],
        );
        let found = cache.get(Bucket::Answers, &name(), Type::A, Class::IN).unwrap();
        assert_eq!(found.rdata, vec![vec![192, 0, 2, 1]]);
    }

    #[test]
    fn full_ties_keep_the_incumbent() {
        let cache = Cache::new();
        cache.stow(
            Bucket::Answers,
            vec![rrset(&[192, 0, 2, 1], Credibility::AuthAnswer, Section::Answer)],
        );
        // Identical credibility and section: the existing entry stays.
        cache.stow(
            Bucket::Answers,
            vec![rrset(&[192, 0, 2, 2], Credibility::AuthAnswer, Section::Answer)],
        );
        let found = cache.get(Bucket::Answers, &name(), Type::A, Class::IN).unwrap();
        assert_eq!(found.rdata, vec![vec![192, 0, 2, 1]]);
    }

    #[test]
    fn get_returns_an_independent_copy() {
        let cache = Cache::new();
        cache.stow(
            Bucket::Answers,
            vec![rrset(&[192, 0, 2, 1], Credibility::AuthAnswer, Section::Answer)],
        );
        let mut first = cache.get(Bucket::Answers, &name(), Type::A, Class::IN).unwrap();
        first.rdata.clear();
        let second = cache.get(Bucket::Answers, &name(), Type::A, Class::IN).unwrap();
        assert_eq!(second.rdata, vec![vec![192, 0, 2, 1]]);
    }

    fn root_hints(glued: &str, glueless: &str, address: [u8; 4]) -> Vec<Rrset> {
        let mut ns_set = Rrset::new(Name::root(), Type::NS, Class::IN, Ttl::from(518400));
        for target in [glued, glueless] {
            let target: Name = target.parse().unwrap();
            ns_set.add_rdata(target.wire_repr(), Ttl::from(518400));
        }
        let mut glue = Rrset::new(
            glued.parse().unwrap(),
            Type::A,
            Class::IN,
            Ttl::from(518400),
        );
        glue.add_rdata(&address, Ttl::from(518400));
        vec![ns_set, glue]
    }

    #[test]
    fn root_hints_derive_the_root_nameserver_list() {
        let cache = Cache::new();
        assert!(cache.get_root_ns().is_none());
        cache.stow_root_info(&root_hints(
            "a.root-servers.net.",
            "b.root-servers.net.",
            [198, 41, 0, 4],
        ));
        let root = cache.get_root_ns().unwrap();
        // The glueless target is dropped, not looked up.
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "a.root-servers.net.".parse().unwrap());
        assert_eq!(root[0].addresses, vec!["198.41.0.4:53".parse().unwrap()]);
    }

    #[test]
    fn root_hints_are_stowed_only_once() {
        let cache = Cache::new();
        cache.stow_root_info(&root_hints(
            "a.root-servers.net.",
            "b.root-servers.net.",
            [198, 41, 0, 4],
        ));
        cache.stow_root_info(&root_hints(
            "x.root-servers.net.",
            "y.root-servers.net.",
            [192, 0, 2, 1],
        ));
        let root = cache.get_root_ns().unwrap();
        assert_eq!(root[0].name, "a.root-servers.net.".parse().unwrap());
    }

    #[test]
    fn hints_without_usable_glue_are_not_stowed() {
        let cache = Cache::new();
        let mut hints = root_hints("a.root-servers.net.", "b.root-servers.net.", [198, 41, 0, 4]);
        hints.retain(|set| set.rr_type == Type::NS);
        cache.stow_root_info(&hints);
        assert!(cache.get_root_ns().is_none());
    }

    #[test]
    fn flush_leaves_the_root_nameserver_list_in_place() {
        let cache = Cache::new();
        cache.stow_root_info(&root_hints(
            "a.root-servers.net.",
            "b.root-servers.net.",
            [198, 41, 0, 4],
        ));
        cache.flush();
        assert!(cache.get_root_ns().is_some());
    }

    #[test]
    fn flush_empties_all_buckets() {
        let cache = Cache::new();
        cache.stow(
            Bucket::Keys,
            vec![rrset(&[0, 1], Credibility::AuthAnswer, Section::Answer)],
        );
        cache.flush();
        assert!(cache.get(Bucket::Keys, &name(), Type::A, Class::IN).is_none());
    }
}
