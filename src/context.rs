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

//! The validation context, the top-level handle of the crate.
//!
//! A [`Context`] bundles the policy in effect, the shared cache, and
//! the upstream nameservers to query. It is the entry point for the
//! high-level operations: [`Context::query`] for arbitrary questions
//! and [`Context::lookup_host`] for validated address lookups.

use std::net::Ipv4Addr;

use log::debug;

use crate::cache::Cache;
use crate::class::Class;
use crate::name::Name;
use crate::policy::{self, Expectation, Policy, TrustAnchor};
use crate::resolver::{IoManager, NameServer};
use crate::rr::Type;
use crate::validate::{self, Answered, StatusKind, ValStatus};

/// The policy, cache, and upstream configuration for a sequence of
/// validated queries.
#[derive(Debug, Default)]
pub struct Context {
    pub policy: Policy,
    pub cache: Cache,
    pub nameservers: Vec<NameServer>,
}

/// The result of a host lookup: the addresses found and the
/// validation status of the answer they came from.
#[derive(Debug)]
pub struct HostEntry {
    pub addresses: Vec<Ipv4Addr>,
    pub status: ValStatus,
}

impl Context {
    /// Creates a context with the given policy and upstream
    /// nameservers and an empty cache.
    pub fn new(policy: Policy, nameservers: Vec<NameServer>) -> Self {
        Self {
            policy,
            cache: Cache::new(),
            nameservers,
        }
    }

    /// Creates a context whose policy is loaded for `scope` from the
    /// file named by the `VERITY_CONF` environment variable.
    pub fn from_environment(
        scope: &str,
        nameservers: Vec<NameServer>,
    ) -> Result<Self, policy::Error> {
        Ok(Self::new(Policy::from_environment(scope)?, nameservers))
    }

    /// Adds a trust anchor to the context's policy.
    pub fn add_trust_anchor(&mut self, anchor: TrustAnchor) {
        self.policy.add_anchor(anchor);
    }

    /// Sets the validation expectation for a zone.
    pub fn set_expectation(&mut self, zone: Name, expectation: Expectation) {
        self.policy.set_expectation(zone, expectation);
    }

    /// Seeds the cache's root nameserver list from already-parsed
    /// root-hint RRsets (the root NS set and A glue). Queries fall
    /// back to this list when no upstream nameservers are configured.
    pub fn ingest_root_hints(&self, hints: &[crate::rr::Rrset]) {
        self.cache.stow_root_info(hints);
    }

    /// Resolves and validates one question. The answer RRsets are
    /// returned together with the validation status and the
    /// authentication chain that produced it.
    pub fn query(
        &self,
        name: &Name,
        class: Class,
        rr_type: Type,
    ) -> Result<Answered, validate::Error> {
        debug!("querying {name} {class:?} {rr_type}");
        let mut manager = IoManager::new();
        validate::resolve_and_check(self, &mut manager, name, class, rr_type)
    }

    /// Looks up the IPv4 addresses of a host and validates the
    /// answer. Addresses are returned even when validation fails;
    /// callers decide what statuses to accept via
    /// [`ValStatus::trusted`].
    pub fn lookup_host(&self, name: &Name) -> Result<HostEntry, validate::Error> {
        let answered = self.query(name, Class::IN, Type::A)?;
        let mut addresses = Vec::new();
        for rrset in &answered.answers {
            if rrset.rr_type != Type::A {
                continue;
            }
            for rdata in &rrset.rdata {
                if let [a, b, c, d] = rdata[..] {
                    addresses.push(Ipv4Addr::new(a, b, c, d));
                }
            }
        }
        if addresses.is_empty()
            && !matches!(
                answered.status.kind,
                StatusKind::NonexistentName | StatusKind::NonexistentType
            )
        {
            debug!("lookup for {name} produced no addresses");
        }
        Ok(HostEntry {
            addresses,
            status: answered.status,
        })
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Bucket;
    use crate::resolver;
    use crate::rr::{Rrset, Ttl};

    #[test]
    fn query_with_no_nameservers_fails_cleanly() {
        let context = Context::default();
        let name: Name = "example.com.".parse().unwrap();
        let error = context.query(&name, Class::IN, Type::A).unwrap_err();
        assert_eq!(
            error,
            validate::Error::Resolver(resolver::Error::NoAnswer)
        );
    }

    #[test]
    fn ignored_names_are_answered_from_the_cache_without_validation() {
        let mut context = Context::default();
        let name: Name = "www.example.com.".parse().unwrap();
        context.set_expectation("example.com.".parse().unwrap(), Expectation::Ignore);

        let mut rrset = Rrset::new(name.clone(), Type::A, Class::IN, Ttl::from(300));
        rrset.add_rdata(&[192, 0, 2, 1], Ttl::from(300));
        context.cache.stow(Bucket::Answers, vec![rrset]);

        let answered = context.query(&name, Class::IN, Type::A).unwrap();
        assert_eq!(answered.status.kind, StatusKind::Ignored);
        assert!(answered.status.trusted());
        assert_eq!(answered.answers.len(), 1);
    }

    #[test]
    fn root_hints_reach_the_cache() {
        let context = Context::default();
        let target: Name = "a.root-servers.net.".parse().unwrap();
        let mut ns_set = Rrset::new(Name::root(), Type::NS, Class::IN, Ttl::from(518400));
        ns_set.add_rdata(target.wire_repr(), Ttl::from(518400));
        let mut glue = Rrset::new(target.clone(), Type::A, Class::IN, Ttl::from(518400));
        glue.add_rdata(&[198, 41, 0, 4], Ttl::from(518400));
        context.ingest_root_hints(&[ns_set, glue]);
        let root = context.cache.get_root_ns().unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, target);
    }

    #[test]
    fn lookup_host_extracts_addresses() {
        let mut context = Context::default();
        let name: Name = "www.example.com.".parse().unwrap();
        context.set_expectation(name.clone(), Expectation::Ignore);

        let mut rrset = Rrset::new(name.clone(), Type::A, Class::IN, Ttl::from(300));
        rrset.add_rdata(&[192, 0, 2, 1], Ttl::from(300));
        rrset.add_rdata(&[192, 0, 2, 2], Ttl::from(300));
        context.cache.stow(Bucket::Answers, vec![rrset]);

        let entry = context.lookup_host(&name).unwrap();
        assert_eq!(
            entry.addresses,
            vec![Ipv4Addr::new(192, 0, 2, 1), Ipv4Addr::new(192, 0, 2, 2)]
        );
        assert_eq!(entry.status.kind, StatusKind::Ignored);
    }
}
