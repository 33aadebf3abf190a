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

//! Validation policy: trust anchors and per-zone security
//! expectations, loaded from a token-based configuration file.
//!
//! A policy file is a sequence of statements, each terminated by `;`:
//!
//! ```text
//! # Trust the root and example.com.
//! : trust-anchor
//!       example.com. "257 3 5 AQO8f8iY..."
//!       ;
//! : clock-skew 300 ;
//! browser zone-security-expectation
//!       internal.test. no
//!       ;
//! ```
//!
//! The first token of a statement is a label; building a [`Policy`]
//! for a scope layers the default label's statements first, then every
//! label that is a prefix of the scope, general to specific, so
//! specific settings override general ones.

use std::fmt;
use std::path::Path;

use log::info;

use crate::name::Name;
use crate::rr::dnssec::Dnskey;

/// The environment variable naming the policy file.
pub const CONF_ENV: &str = "VERITY_CONF";

/// The policy file path used when [`CONF_ENV`] is not set.
pub const DEFAULT_CONF_PATH: &str = "/etc/verity.conf";

/// The label whose statements apply to every scope.
pub const DEFAULT_LABEL: &str = ":";

/// The default bound on authentication chain length.
pub const DEFAULT_MAX_CHAIN_LINKS: usize = 16;

////////////////////////////////////////////////////////////////////////
// POLICY DATA                                                        //
////////////////////////////////////////////////////////////////////////

/// A configured trust anchor: a DNSKEY trusted axiomatically at a
/// zone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrustAnchor {
    pub zone: Name,
    pub key: Dnskey,
}

/// What the policy expects of a zone's data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Expectation {
    /// Data under the zone must validate.
    Validate,
    /// Data under the zone is accepted without validation.
    Ignore,
}

/// Which lookups an algorithm preference list applies to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlgorithmTarget {
    /// Signatures over answer data.
    Data,
    /// DNSKEY selection.
    Keys,
    /// DS selection.
    Ds,
}

/// A built policy table for one scope.
#[derive(Clone, Debug)]
pub struct Policy {
    /// Trust anchors, sorted by decreasing zone-name length so the
    /// closest enclosing anchor for a name is found first.
    trust_anchors: Vec<TrustAnchor>,
    expectations: Vec<(Name, Expectation)>,
    /// Tolerated clock skew in seconds when checking signature
    /// validity times; negative disables the time checks.
    clock_skew: i64,
    /// Whether expired signatures are tolerated.
    expired_sigs: bool,
    /// How many signatures must verify per RRset; zero means one.
    must_verify_count: u32,
    /// Whether keys with the SEP flag are tried first.
    preferred_sep: bool,
    preferred_algo_data: Vec<u8>,
    preferred_algo_keys: Vec<u8>,
    preferred_algo_ds: Vec<u8>,
    /// Whether queries go out over TCP from the start.
    use_tcp: bool,
    max_chain_links: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            trust_anchors: Vec::new(),
            expectations: Vec::new(),
            clock_skew: 0,
            expired_sigs: false,
            must_verify_count: 0,
            preferred_sep: false,
            preferred_algo_data: Vec::new(),
            preferred_algo_keys: Vec::new(),
            preferred_algo_ds: Vec::new(),
            use_tcp: false,
            max_chain_links: DEFAULT_MAX_CHAIN_LINKS,
        }
    }
}

impl Policy {
    /// Parses `path` and builds the policy for `scope`.
    pub fn from_file(path: impl AsRef<Path>, scope: &str) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(Error::Io)?;
        info!("loading policy for scope {scope} from {}", path.display());
        Ok(PolicyFile::parse(&text)?.build(scope))
    }

    /// Builds the policy for `scope` from the file named by the
    /// `VERITY_CONF` environment variable, falling back to
    /// [`DEFAULT_CONF_PATH`].
    pub fn from_environment(scope: &str) -> Result<Self, Error> {
        let path = std::env::var(CONF_ENV).unwrap_or_else(|_| DEFAULT_CONF_PATH.to_owned());
        Self::from_file(path, scope)
    }

    /// Returns the trust anchors at or above `name`, closest first.
    pub fn trust_anchors_for<'a>(
        &'a self,
        name: &Name,
    ) -> impl Iterator<Item = &'a TrustAnchor> + 'a {
        let name = name.clone();
        self.trust_anchors
            .iter()
            .filter(move |anchor| name.eq_or_subdomain_of(&anchor.zone))
    }

    /// Returns the anchors configured for exactly `zone`.
    pub fn trust_anchors_at<'a>(
        &'a self,
        zone: &Name,
    ) -> impl Iterator<Item = &'a TrustAnchor> + 'a {
        let zone = zone.clone();
        self.trust_anchors
            .iter()
            .filter(move |anchor| anchor.zone == zone)
    }

    /// Returns the expectation for the closest enclosing zone
    /// configured for `name`, if any.
    pub fn expectation_for(&self, name: &Name) -> Option<Expectation> {
        self.expectations
            .iter()
            .filter(|(zone, _)| name.eq_or_subdomain_of(zone))
            .max_by_key(|(zone, _)| zone.wire_len())
            .map(|&(_, expectation)| expectation)
    }

    /// Adds a trust anchor, replacing any identical existing one.
    pub fn add_anchor(&mut self, anchor: TrustAnchor) {
        self.trust_anchors
            .retain(|existing| !(existing.zone == anchor.zone && existing.key == anchor.key));
        self.trust_anchors.push(anchor);
        self.trust_anchors
            .sort_by(|a, b| b.zone.wire_len().cmp(&a.zone.wire_len()));
    }

    /// Sets the expectation for a zone, replacing any existing one.
    pub fn set_expectation(&mut self, zone: Name, expectation: Expectation) {
        self.expectations.retain(|(existing, _)| *existing != zone);
        self.expectations.push((zone, expectation));
    }

    /// The tolerated clock skew, in seconds, applied on both sides of
    /// a signature's validity window. Negative disables time checks.
    pub fn clock_skew(&self) -> i64 {
        self.clock_skew
    }

    pub fn set_clock_skew(&mut self, seconds: i64) {
        self.clock_skew = seconds;
    }

    /// Whether expired signatures are accepted anyway.
    pub fn accepts_expired_sigs(&self) -> bool {
        self.expired_sigs
    }

    /// The number of signatures that must verify per RRset; zero
    /// means any one suffices.
    pub fn must_verify_count(&self) -> u32 {
        self.must_verify_count
    }

    /// Whether DNSKEYs carrying the SEP flag are tried first.
    pub fn prefers_sep(&self) -> bool {
        self.preferred_sep
    }

    /// The preferred algorithm numbers for one kind of lookup, best
    /// first. An empty list means no preference.
    pub fn preferred_algorithms(&self, target: AlgorithmTarget) -> &[u8] {
        match target {
            AlgorithmTarget::Data => &self.preferred_algo_data,
            AlgorithmTarget::Keys => &self.preferred_algo_keys,
            AlgorithmTarget::Ds => &self.preferred_algo_ds,
        }
    }

    /// Whether queries are sent over TCP from the start instead of
    /// falling back from UDP on truncation.
    pub fn uses_tcp(&self) -> bool {
        self.use_tcp
    }

    /// The bound on authentication chain length and, derived from it,
    /// on the follow-up queries one validation may issue.
    pub fn max_chain_links(&self) -> usize {
        self.max_chain_links
    }

    pub fn set_max_chain_links(&mut self, links: usize) {
        self.max_chain_links = links.max(1);
    }
}

////////////////////////////////////////////////////////////////////////
// THE POLICY FILE                                                    //
////////////////////////////////////////////////////////////////////////

/// One parsed statement of a policy file.
#[derive(Clone, Debug)]
struct Statement {
    label: String,
    body: Body,
}

#[derive(Clone, Debug)]
enum Body {
    TrustAnchors(Vec<TrustAnchor>),
    Expectations(Vec<(Name, Expectation)>),
    ClockSkew(i64),
    ExpiredSigs(bool),
    MustVerifyCount(u32),
    PreferredSep(bool),
    PreferredAlgorithms(AlgorithmTarget, Vec<u8>),
    UseTcp(bool),
}

/// A parsed policy file, not yet scoped to a label.
#[derive(Clone, Debug)]
pub struct PolicyFile {
    statements: Vec<Statement>,
}

impl PolicyFile {
    /// Parses the text of a policy file.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let tokens = tokenize(text)?;
        let mut statements = Vec::new();
        for raw in tokens.split(|token| token == ";") {
            if raw.is_empty() {
                continue;
            }
            if raw.len() < 2 {
                return Err(Error::MissingArgument);
            }
            let label = raw[0].clone();
            let body = match raw[1].as_str() {
                "trust-anchor" => Body::TrustAnchors(parse_anchor_args(&raw[2..])?),
                "zone-security-expectation" => {
                    Body::Expectations(parse_expectation_args(&raw[2..])?)
                }
                "clock-skew" => Body::ClockSkew(parse_number(&raw[2..])?),
                "expired-sigs" => Body::ExpiredSigs(parse_yes_no(&raw[2..])?),
                "must-verify-count" => Body::MustVerifyCount(parse_number(&raw[2..])?),
                "preferred-sep" => Body::PreferredSep(parse_yes_no(&raw[2..])?),
                "preferred-algo-data" => Body::PreferredAlgorithms(
                    AlgorithmTarget::Data,
                    parse_algorithm_args(&raw[2..])?,
                ),
                "preferred-algo-keys" => Body::PreferredAlgorithms(
                    AlgorithmTarget::Keys,
                    parse_algorithm_args(&raw[2..])?,
                ),
                "preferred-algo-ds" => Body::PreferredAlgorithms(
                    AlgorithmTarget::Ds,
                    parse_algorithm_args(&raw[2..])?,
                ),
                "use-tcp" => Body::UseTcp(parse_yes_no(&raw[2..])?),
                other => return Err(Error::UnknownKeyword(other.to_owned())),
            };
            statements.push(Statement { label, body });
        }
        Ok(Self { statements })
    }

    /// Builds the policy for `scope`: the default label's statements
    /// first, then every relevant label in order of increasing
    /// specificity.
    pub fn build(&self, scope: &str) -> Policy {
        let mut labels: Vec<&str> = self
            .statements
            .iter()
            .map(|statement| statement.label.as_str())
            .filter(|label| label_applies(label, scope))
            .collect();
        labels.sort_by_key(|label| if *label == DEFAULT_LABEL { 0 } else { label.len() });
        labels.dedup();

        let mut policy = Policy::default();
        for label in labels {
            for statement in self.statements.iter().filter(|s| s.label == label) {
                match &statement.body {
                    Body::TrustAnchors(anchors) => {
                        for anchor in anchors {
                            policy.add_anchor(anchor.clone());
                        }
                    }
                    Body::Expectations(expectations) => {
                        for (zone, expectation) in expectations {
                            policy.set_expectation(zone.clone(), *expectation);
                        }
                    }
                    Body::ClockSkew(seconds) => policy.clock_skew = *seconds,
                    Body::ExpiredSigs(tolerated) => policy.expired_sigs = *tolerated,
                    Body::MustVerifyCount(count) => policy.must_verify_count = *count,
                    Body::PreferredSep(preferred) => policy.preferred_sep = *preferred,
                    Body::PreferredAlgorithms(target, algorithms) => {
                        let slot = match target {
                            AlgorithmTarget::Data => &mut policy.preferred_algo_data,
                            AlgorithmTarget::Keys => &mut policy.preferred_algo_keys,
                            AlgorithmTarget::Ds => &mut policy.preferred_algo_ds,
                        };
                        *slot = algorithms.clone();
                    }
                    Body::UseTcp(use_tcp) => policy.use_tcp = *use_tcp,
                }
            }
        }
        policy
            .trust_anchors
            .sort_by(|a, b| b.zone.wire_len().cmp(&a.zone.wire_len()));
        policy
    }
}

/// Returns whether a statement labeled `label` applies to `scope`:
/// the default label always does, and otherwise `label` must be
/// `scope` itself or a `:`-delimited prefix of it.
fn label_applies(label: &str, scope: &str) -> bool {
    label == DEFAULT_LABEL
        || label == scope
        || scope
            .strip_prefix(label)
            .map_or(false, |rest| rest.starts_with(':'))
}

fn parse_anchor_args(args: &[String]) -> Result<Vec<TrustAnchor>, Error> {
    let mut anchors = Vec::new();
    for pair in args.chunks(2) {
        let [zone, key] = pair else {
            return Err(Error::MissingArgument);
        };
        let zone: Name = zone.parse().or(Err(Error::BadZoneName))?;
        let key = Dnskey::from_presentation(key).or(Err(Error::BadKey))?;
        anchors.push(TrustAnchor { zone, key });
    }
    Ok(anchors)
}

fn parse_expectation_args(args: &[String]) -> Result<Vec<(Name, Expectation)>, Error> {
    let mut expectations = Vec::new();
    for pair in args.chunks(2) {
        let [zone, value] = pair else {
            return Err(Error::MissingArgument);
        };
        let zone: Name = zone.parse().or(Err(Error::BadZoneName))?;
        let expectation = match value.as_str() {
            "yes" => Expectation::Validate,
            "no" => Expectation::Ignore,
            other => return Err(Error::BadExpectation(other.to_owned())),
        };
        expectations.push((zone, expectation));
    }
    Ok(expectations)
}

/// Parses a single numeric argument.
fn parse_number<T: std::str::FromStr>(args: &[String]) -> Result<T, Error> {
    let [value] = args else {
        return Err(Error::MissingArgument);
    };
    value
        .parse()
        .map_err(|_| Error::BadNumber(value.to_owned()))
}

/// Parses a single `yes`/`no` argument.
fn parse_yes_no(args: &[String]) -> Result<bool, Error> {
    let [value] = args else {
        return Err(Error::MissingArgument);
    };
    match value.as_str() {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(Error::BadFlag(other.to_owned())),
    }
}

/// Parses a list of algorithm numbers, best first.
fn parse_algorithm_args(args: &[String]) -> Result<Vec<u8>, Error> {
    if args.is_empty() {
        return Err(Error::MissingArgument);
    }
    args.iter()
        .map(|value| {
            value
                .parse()
                .map_err(|_| Error::BadNumber(value.to_owned()))
        })
        .collect()
}

/// Splits policy-file text into tokens: whitespace-delimited words,
/// `"`-quoted strings (one token, quotes stripped), `;` as its own
/// token, and `#` comments running to the end of the line.
fn tokenize(text: &str) -> Result<Vec<String>, Error> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '#' => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
            }
            '"' => {
                let mut token = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => token.push(c),
                        None => return Err(Error::UnterminatedQuote),
                    }
                }
                tokens.push(token);
            }
            ';' => tokens.push(";".to_owned()),
            c if c.is_whitespace() => (),
            c => {
                let mut token = String::new();
                token.push(c);
                while let Some(&next) = chars.peek() {
                    if next.is_whitespace() || next == ';' || next == '#' || next == '"' {
                        break;
                    }
                    token.push(next);
                    chars.next();
                }
                tokens.push(token);
            }
        }
    }
    Ok(tokens)
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error loading or parsing a policy file.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    UnterminatedQuote,
    UnknownKeyword(String),
    MissingArgument,
    BadZoneName,
    BadKey,
    BadExpectation(String),
    BadNumber(String),
    BadFlag(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(error) => write!(f, "cannot read policy file: {error}"),
            Self::UnterminatedQuote => f.write_str("unterminated quoted string"),
            Self::UnknownKeyword(keyword) => write!(f, "unknown policy keyword: {keyword}"),
            Self::MissingArgument => f.write_str("policy statement is missing an argument"),
            Self::BadZoneName => f.write_str("invalid zone name in policy statement"),
            Self::BadKey => f.write_str("invalid DNSKEY data in trust anchor"),
            Self::BadExpectation(value) => {
                write!(f, "invalid zone security expectation: {value}")
            }
            Self::BadNumber(value) => write!(f, "invalid number in policy statement: {value}"),
            Self::BadFlag(value) => write!(f, "expected yes or no, found: {value}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(error) => Some(error),
            _ => None,
        }
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
