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

//! The validation engine: resolves a question and builds an
//! authentication chain from the answer up to a configured trust
//! anchor, verifying every link.
//!
//! The chain is held in an owned arena of [`ChainLink`]s referenced by
//! index. Each link carries the RRset it asserts, the outcome of its
//! signature check, and the index of the link it derives trust from.
//! The arena is returned to the caller for diagnostics even when
//! validation fails partway.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};

use crate::cache::Bucket;
use crate::class::Class;
use crate::context::Context;
use crate::name::Name;
use crate::policy::{AlgorithmTarget, Policy};
use crate::resolver::{self, IoManager, NameServer};
use crate::rr::dnssec::{Dnskey, Ds, Nsec, Rrsig};
use crate::rr::{AnswerKind, Rrset, Type};
use crate::util::Hex;

pub mod crypto;
pub mod digest;
pub mod status;
pub mod verify;

pub use status::{StatusKind, ValStatus};

use digest::ResponseKind;
use verify::SigStatus;

/// How many fetches one chain link is allowed to cost, counting its
/// DNSKEY, DS, and denial-proof lookups. Together with the policy's
/// chain length bound this caps the queries one validation may issue.
const FETCHES_PER_LINK: u32 = 8;

/// One link of an authentication chain.
#[derive(Clone, Debug)]
pub struct ChainLink {
    pub rrset: Rrset,
    pub status: SigStatus,
    /// The arena index of the link this one derives trust from, if
    /// the chain continues upward.
    pub trust: Option<usize>,
}

/// A resolved and checked answer.
#[derive(Debug)]
pub struct Answered {
    pub answers: Vec<Rrset>,
    pub status: ValStatus,
    /// The authentication chain arena, up to the point where
    /// validation succeeded or failed.
    pub chain: Vec<ChainLink>,
}

////////////////////////////////////////////////////////////////////////
// THE ENGINE                                                         //
////////////////////////////////////////////////////////////////////////

/// Resolves `(name, class, rr_type)` and validates the result.
pub fn resolve_and_check(
    context: &Context,
    manager: &mut IoManager,
    name: &Name,
    class: Class,
    rr_type: Type,
) -> Result<Answered, Error> {
    if context.policy.expectation_for(name) == Some(crate::policy::Expectation::Ignore) {
        debug!("policy ignores validation for {name}; resolving only");
        let fetched = fetch(context, manager, name, rr_type, class)?;
        let answers = match fetched {
            Fetched::Data(answers) => answers,
            Fetched::Denial { .. } => Vec::new(),
        };
        return Ok(Answered {
            answers,
            status: ValStatus::new(StatusKind::Ignored),
            chain: Vec::new(),
        });
    }

    let policy = &context.policy;
    let mut engine = Engine {
        context,
        manager,
        now: unix_now(),
        chain: Vec::new(),
        checks: verify::Checks {
            clock_skew: policy.clock_skew(),
            accept_expired: policy.accepts_expired_sigs(),
            must_verify: policy.must_verify_count(),
        },
        budget: policy.max_chain_links() as u32 * FETCHES_PER_LINK,
    };
    match engine.run(name, rr_type, class) {
        Err(Error::BudgetExhausted) => {
            debug!("query budget exhausted while validating {name}/{rr_type}");
            Ok(Answered {
                answers: Vec::new(),
                status: ValStatus::new(StatusKind::TooManyLinks),
                chain: std::mem::take(&mut engine.chain),
            })
        }
        other => other,
    }
}

/// What a fetch produced: data RRsets, or a denial with its proof
/// material.
enum Fetched {
    Data(Vec<Rrset>),
    Denial {
        kind: ResponseKind,
        proofs: Vec<Rrset>,
    },
}

struct Engine<'a> {
    context: &'a Context,
    manager: &'a mut IoManager,
    now: u64,
    chain: Vec<ChainLink>,
    checks: verify::Checks,
    /// Fetches remaining before the engine gives up on this query.
    budget: u32,
}

impl Engine<'_> {
    /// Resolves the target question and checks what comes back.
    fn run(&mut self, name: &Name, rr_type: Type, class: Class) -> Result<Answered, Error> {
        match self.fetch_target(name, rr_type, class)? {
            Fetched::Data(answers) => {
                let mut status: Option<ValStatus> = None;
                for answer in &answers {
                    let link_status = if answer.answer_kind == AnswerKind::BareRrsig {
                        ValStatus::new(StatusKind::BareRrsig)
                    } else {
                        self.verify_chain(answer)?
                    };
                    status = Some(match status {
                        Some(so_far) => worse(so_far, link_status),
                        None => link_status,
                    });
                }
                let status = status.unwrap_or(ValStatus::new(StatusKind::Error));
                Ok(Answered {
                    answers,
                    status,
                    chain: std::mem::take(&mut self.chain),
                })
            }
            Fetched::Denial { kind, proofs } => {
                let status = self.check_denial(name, rr_type, kind, &proofs)?;
                Ok(Answered {
                    answers: proofs,
                    status,
                    chain: std::mem::take(&mut self.chain),
                })
            }
        }
    }

    fn fetch_target(
        &mut self,
        name: &Name,
        rr_type: Type,
        class: Class,
    ) -> Result<Fetched, Error> {
        // The denial and DS checks can recurse into each other on
        // adversarial responses; the budget bounds their total cost.
        if self.budget == 0 {
            return Err(Error::BudgetExhausted);
        }
        self.budget -= 1;
        fetch(self.context, self.manager, name, rr_type, class)
    }

    /// Builds and verifies the authentication chain for one RRset.
    fn verify_chain(&mut self, rrset: &Rrset) -> Result<ValStatus, Error> {
        let mut current = rrset.clone();
        let mut previous_link: Option<usize> = None;
        for _ in 0..self.context.policy.max_chain_links() {
            let Some(signer) = current.sigs.first().map(|sig| sig.signer.clone()) else {
                // Unsigned data validates only if the zone is provably
                // insecure (the chain of DS records demonstrably ends
                // above it).
                let owner = current.name.clone();
                self.push_link(current, SigStatus::Unsigned, previous_link);
                return self.check_provably_insecure(&owner);
            };

            let Some(key_set) = self.fetch_dnskey(&signer)? else {
                warn!("no DNSKEY set found for zone {signer}");
                self.push_link(current, SigStatus::Unsigned, previous_link);
                return Ok(ValStatus::new(StatusKind::Indeterminate));
            };
            let mut keys = parse_keys(&key_set);
            order_keys(&mut keys, &self.context.policy);

            order_sigs(
                &mut current.sigs,
                self.context.policy.preferred_algorithms(AlgorithmTarget::Data),
            );
            let data_status = verify::verify_rrset(&current, &keys, self.now, &self.checks);
            let link = self.push_link(current, data_status, previous_link);
            if data_status != SigStatus::Verified {
                debug!("chain link failed to verify: {data_status:?}");
                return Ok(ValStatus::new(StatusKind::Bogus));
            }

            // The key set must verify with one of its own keys before
            // anything it endorses is trusted.
            let key_status = verify::verify_rrset(&key_set, &keys, self.now, &self.checks);
            let key_link = self.push_link(key_set.clone(), key_status, Some(link));
            previous_link = Some(key_link);
            if key_status != SigStatus::Verified {
                debug!("DNSKEY set for {signer} failed to verify: {key_status:?}");
                return Ok(ValStatus::new(StatusKind::Bogus));
            }

            // A configured trust anchor at this zone ends the chain.
            if self
                .context
                .policy
                .trust_anchors_at(&signer)
                .any(|anchor| keys.contains(&anchor.key))
            {
                trace!("chain reached trust anchor at {signer}");
                return Ok(ValStatus::complete(StatusKind::Success));
            }

            if signer.is_root() {
                return Ok(ValStatus::new(StatusKind::Indeterminate));
            }

            // Otherwise the zone's keys must be endorsed by a DS set
            // at the parent; the DS set becomes the next link up.
            match self.fetch_target(&signer, Type::DS, key_set.class)? {
                Fetched::Data(sets) => {
                    let Some(ds_set) = sets
                        .into_iter()
                        .find(|set| set.rr_type == Type::DS && set.name == signer)
                    else {
                        return Ok(ValStatus::new(StatusKind::Indeterminate));
                    };
                    let preferred_ds = self
                        .context
                        .policy
                        .preferred_algorithms(AlgorithmTarget::Ds);
                    if !ds_endorses_any_key(&ds_set, &keys, preferred_ds) {
                        // The signatures check out, but no DS at the
                        // parent vouches for any of these keys.
                        debug!("DNSKEY set for {signer} is security lame");
                        return Ok(ValStatus::new(StatusKind::SecurityLame));
                    }
                    current = ds_set;
                }
                Fetched::Denial { kind, proofs } => {
                    // Provable absence of DS: the zone is unsigned
                    // from here up, and provably so if the denial
                    // itself validates.
                    let denial = self.check_denial(&signer, Type::DS, kind, &proofs)?;
                    return Ok(match denial.kind {
                        StatusKind::NonexistentName | StatusKind::NonexistentType => ValStatus {
                            kind: StatusKind::ProvablyInsecure,
                            chain_complete: denial.chain_complete,
                        },
                        _ => ValStatus::new(StatusKind::Indeterminate),
                    });
                }
            }
        }
        Ok(ValStatus::new(StatusKind::TooManyLinks))
    }

    /// Checks a denial response: its NSEC/SOA proofs must themselves
    /// validate, and the NSECs must actually prove the nonexistence
    /// claimed.
    fn check_denial(
        &mut self,
        name: &Name,
        rr_type: Type,
        kind: ResponseKind,
        proofs: &[Rrset],
    ) -> Result<ValStatus, Error> {
        let claimed = match kind {
            ResponseKind::NameError => StatusKind::NonexistentName,
            _ => StatusKind::NonexistentType,
        };
        let nsecs: Vec<&Rrset> = proofs
            .iter()
            .filter(|set| set.rr_type == Type::NSEC)
            .collect();
        if nsecs.is_empty() {
            // Nothing to prove with; the denial stands but unproven.
            return Ok(ValStatus::new(claimed));
        }

        let mut chain_complete = true;
        for proof in proofs {
            let status = self.verify_chain(proof)?;
            match status.kind {
                StatusKind::Success => chain_complete &= status.chain_complete,
                StatusKind::ProvablyInsecure | StatusKind::Indeterminate => {
                    // The proofs come from territory we cannot trace
                    // to an anchor; the denial stands but unproven.
                    chain_complete = false;
                }
                _ => return Ok(ValStatus::new(StatusKind::Bogus)),
            }
        }

        let proven = match kind {
            ResponseKind::NameError => proves_name_error(name, &nsecs),
            _ => proves_no_data(name, rr_type, &nsecs),
        };
        if !proven {
            debug!("denial for {name}/{rr_type} is not proven by its NSEC records");
            return Ok(ValStatus::new(StatusKind::Bogus));
        }
        Ok(ValStatus {
            kind: claimed,
            chain_complete,
        })
    }

    /// Determines whether `name` sits under a provably insecure zone:
    /// walking up from the name, some ancestor zone must yield a
    /// validated denial for its DS record.
    fn check_provably_insecure(&mut self, name: &Name) -> Result<ValStatus, Error> {
        let mut zone = name.clone();
        let mut unproven_denial = false;
        while !zone.is_root() {
            match self.fetch_target(&zone, Type::DS, Class::IN)? {
                Fetched::Data(sets) => {
                    if sets
                        .iter()
                        .any(|set| set.rr_type == Type::DS && set.name == zone)
                    {
                        // A DS exists, so the zone should be signed;
                        // unsigned data below it is bogus.
                        return Ok(ValStatus::new(StatusKind::Bogus));
                    }
                }
                Fetched::Denial { kind, proofs } => {
                    let denial = self.check_denial(&zone, Type::DS, kind, &proofs)?;
                    match denial.kind {
                        StatusKind::NonexistentName | StatusKind::NonexistentType
                            if denial.chain_complete =>
                        {
                            return Ok(ValStatus::complete(StatusKind::ProvablyInsecure));
                        }
                        StatusKind::NonexistentName | StatusKind::NonexistentType => {
                            // An unproven denial; a proven one may
                            // still exist at an ancestor cut.
                            unproven_denial = true;
                        }
                        StatusKind::Bogus => return Ok(ValStatus::new(StatusKind::Bogus)),
                        _ => (),
                    }
                }
            }
            match zone.parent() {
                Some(parent) => zone = parent,
                None => break,
            }
        }
        if unproven_denial {
            Ok(ValStatus::new(StatusKind::ProvablyInsecure))
        } else {
            Ok(ValStatus::new(StatusKind::Indeterminate))
        }
    }

    fn fetch_dnskey(&mut self, zone: &Name) -> Result<Option<Rrset>, Error> {
        match self.fetch_target(zone, Type::DNSKEY, Class::IN)? {
            Fetched::Data(sets) => Ok(sets
                .into_iter()
                .find(|set| set.rr_type == Type::DNSKEY && set.name == *zone)),
            Fetched::Denial { .. } => Ok(None),
        }
    }

    fn push_link(&mut self, rrset: Rrset, status: SigStatus, trust: Option<usize>) -> usize {
        self.chain.push(ChainLink {
            rrset,
            status,
            trust,
        });
        self.chain.len() - 1
    }
}

/// Answers one question from the cache or the network, following
/// referrals (with loop protection) and stowing learned material.
fn fetch(
    context: &Context,
    manager: &mut IoManager,
    name: &Name,
    rr_type: Type,
    class: Class,
) -> Result<Fetched, Error> {
    let bucket = bucket_for(rr_type);
    if let Some(cached) = context.cache.get(bucket, name, rr_type, class) {
        trace!("answering {name}/{rr_type} from the cache");
        return Ok(Fetched::Data(vec![cached]));
    }

    let mut nameservers = upstreams(context);
    let mut qname = name.clone();
    let mut collected: Vec<Rrset> = Vec::new();
    let mut seen: Vec<Name> = Vec::new();
    loop {
        let (response, respondent) = resolver::get(manager, &qname, rr_type, class, &nameservers)?;
        trace!("digesting response for {qname}/{rr_type} from {}", respondent.name);
        let digested = digest::digest(&qname, rr_type, class, &response)?;
        context
            .cache
            .stow(Bucket::ZoneInfo, digested.learned_zones.clone());
        context
            .cache
            .stow(Bucket::Keys, digested.learned_keys.clone());
        context.cache.stow(Bucket::Dss, digested.learned_ds.clone());

        match digested.kind {
            ResponseKind::Referral => {
                // Answers digested ahead of the referral (CNAME hops)
                // are kept, and the follow-up query is made under the
                // rewritten name at the end of the qname chain.
                collected.extend(digested.answers);
                if let Some(rewritten) = digested.qname_chain.last() {
                    qname = rewritten.clone();
                }
                let referral = digested
                    .referral
                    .ok_or(Error::Digest(digest::Error::MissingGlue))?;
                if seen.contains(&referral.zone) {
                    return Err(Error::Digest(digest::Error::ReferralLoop));
                }
                seen.push(referral.zone.clone());
                nameservers = referral.nameservers;
                apply_transport(&mut nameservers, &context.policy);
            }
            ResponseKind::Answer => {
                collected.extend(digested.answers);
                for answer in &collected {
                    context
                        .cache
                        .stow(bucket_for(answer.rr_type), vec![answer.clone()]);
                }
                return Ok(Fetched::Data(collected));
            }
            kind => {
                return Ok(Fetched::Denial {
                    kind,
                    proofs: digested.proofs,
                });
            }
        }
    }
}

/// The nameservers a query starts with: the configured list, or the
/// cached root nameserver list when none are configured, with the
/// policy's transport preference applied.
fn upstreams(context: &Context) -> Vec<NameServer> {
    let mut nameservers = context.nameservers.clone();
    if nameservers.is_empty() {
        if let Some(root) = context.cache.get_root_ns() {
            trace!("no configured nameservers; starting from the root");
            nameservers = root;
        }
    }
    apply_transport(&mut nameservers, &context.policy);
    nameservers
}

fn apply_transport(nameservers: &mut [NameServer], policy: &Policy) {
    if policy.uses_tcp() {
        for ns in nameservers {
            ns.use_tcp = true;
        }
    }
}

fn bucket_for(rr_type: Type) -> Bucket {
    match rr_type {
        Type::DNSKEY => Bucket::Keys,
        Type::DS => Bucket::Dss,
        _ => Bucket::Answers,
    }
}

fn parse_keys(key_set: &Rrset) -> Vec<Dnskey> {
    key_set
        .rdata
        .iter()
        .filter_map(|rdata| Dnskey::try_from_rdata(rdata).ok())
        .collect()
}

/// Sorts candidate keys by the policy's preferences: keys carrying
/// the SEP flag first when the policy prefers them, then by the
/// preferred key algorithm order. Without preferences the order is
/// left as received.
fn order_keys(keys: &mut [Dnskey], policy: &Policy) {
    let preferred = policy.preferred_algorithms(AlgorithmTarget::Keys);
    keys.sort_by_key(|key| {
        let sep = usize::from(!(policy.prefers_sep() && key.is_sep()));
        (sep, algorithm_rank(preferred, key.algorithm))
    });
}

fn order_sigs(sigs: &mut [Rrsig], preferred: &[u8]) {
    sigs.sort_by_key(|sig| algorithm_rank(preferred, sig.algorithm));
}

/// The position of an algorithm in a preference list; algorithms not
/// listed sort after every listed one.
fn algorithm_rank(preferred: &[u8], algorithm: u8) -> usize {
    preferred
        .iter()
        .position(|&p| p == algorithm)
        .unwrap_or(preferred.len())
}

/// Returns whether any DS record endorses one of `keys`, trying DS
/// records in the policy's preferred algorithm order.
fn ds_endorses_any_key(ds_set: &Rrset, keys: &[Dnskey], preferred: &[u8]) -> bool {
    let mut records: Vec<Ds> = ds_set
        .rdata
        .iter()
        .filter_map(|rdata| Ds::try_from_rdata(rdata).ok())
        .collect();
    records.sort_by_key(|ds| algorithm_rank(preferred, ds.algorithm));
    for ds in records {
        if keys.iter().any(|key| ds.matches_key(&ds_set.name, key)) {
            trace!(
                "DS digest {} endorses a key of {}",
                Hex(&ds.digest),
                ds_set.name,
            );
            return true;
        }
    }
    false
}

/// The worse of two statuses, for aggregating across the RRsets of
/// one answer. Trust only degrades: any untrusted member makes the
/// whole answer untrusted.
fn worse(a: ValStatus, b: ValStatus) -> ValStatus {
    fn badness(status: &ValStatus) -> u8 {
        match status.kind {
            StatusKind::Success => 0,
            StatusKind::NonexistentName | StatusKind::NonexistentType => 1,
            StatusKind::ProvablyInsecure => 2,
            StatusKind::Ignored => 3,
            StatusKind::Indeterminate => 4,
            StatusKind::SecurityLame => 5,
            StatusKind::TooManyLinks => 6,
            StatusKind::BareRrsig => 7,
            StatusKind::Bogus => 8,
            StatusKind::Error => 9,
        }
    }
    let mut worse = if badness(&b) > badness(&a) { b } else { a };
    worse.chain_complete = a.chain_complete && b.chain_complete;
    worse
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

////////////////////////////////////////////////////////////////////////
// NONEXISTENCE PROOFS                                                //
////////////////////////////////////////////////////////////////////////

/// Returns whether `nsecs` prove that `name` exists with no data of
/// type `rr_type`: an NSEC at `name` whose bitmap asserts neither the
/// type nor CNAME.
fn proves_no_data(name: &Name, rr_type: Type, nsecs: &[&Rrset]) -> bool {
    nsecs.iter().any(|set| {
        set.name == *name
            && parsed_nsec(set)
                .map_or(false, |nsec| !nsec.has_type(rr_type) && !nsec.has_type(Type::CNAME))
    })
}

/// Returns whether `nsecs` prove that `name` does not exist: one NSEC
/// must span the name itself, and another must deny the wildcard at
/// the closest encloser.
fn proves_name_error(name: &Name, nsecs: &[&Rrset]) -> bool {
    let mut closest_encloser: Option<Name> = None;
    let mut name_covered = false;
    for set in nsecs {
        let Some(nsec) = parsed_nsec(set) else {
            continue;
        };
        if nsec_covers(&set.name, &nsec.next, name) {
            name_covered = true;
            // The covering NSEC's owner shares the closest encloser
            // with the nonexistent name.
            let ancestor = common_ancestor(&set.name, name);
            closest_encloser = Some(match closest_encloser {
                Some(existing) if existing.len() >= ancestor.len() => existing,
                _ => ancestor,
            });
        }
    }
    let Some(closest_encloser) = closest_encloser else {
        return false;
    };
    if !name_covered {
        return false;
    }
    // The wildcard at the closest encloser must also be denied.
    let wildcard = closest_encloser.wildcard_of_suffix(closest_encloser.len() - 1);
    nsecs.iter().any(|set| {
        parsed_nsec(set).map_or(false, |nsec| {
            nsec_covers(&set.name, &nsec.next, &wildcard) || set.name == wildcard
        })
    })
}

/// Returns whether the NSEC `(owner, next)` interval covers `target`
/// in canonical order, accounting for the wrap at the zone apex.
fn nsec_covers(owner: &Name, next: &Name, target: &Name) -> bool {
    if owner < next {
        owner < target && target < next
    } else {
        // The last NSEC of a zone wraps back to the apex.
        target > owner || target < next
    }
}

fn parsed_nsec(set: &Rrset) -> Option<Nsec> {
    set.rdata.first().and_then(|rdata| Nsec::try_from_rdata(rdata).ok())
}

/// Returns the longest common ancestor (suffix) of two names.
fn common_ancestor(a: &Name, b: &Name) -> Name {
    let shared = a
        .labels()
        .rev()
        .zip(b.labels().rev())
        .take_while(|(x, y)| x.eq_ignore_ascii_case(y))
        .count();
    a.suffix(shared.max(1))
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error that prevented resolution or digestion; validation
/// failures are statuses, not errors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    Resolver(resolver::Error),
    Digest(digest::Error),
    /// The engine ran out of its query budget; reported to callers as
    /// a [`StatusKind::TooManyLinks`] status, not an error.
    BudgetExhausted,
}

impl From<resolver::Error> for Error {
    fn from(error: resolver::Error) -> Self {
        Self::Resolver(error)
    }
}

impl From<digest::Error> for Error {
    fn from(error: digest::Error) -> Self {
        Self::Digest(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Resolver(error) => write!(f, "resolution failed: {error}"),
            Self::Digest(error) => write!(f, "cannot digest response: {error}"),
            Self::BudgetExhausted => f.write_str("query budget exhausted"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
