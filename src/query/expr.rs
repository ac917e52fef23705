//! Query expressions, DNF conversion and runtime predicate evaluation.

use crate::extract::{each_token, extract_pairs, index_key, is_token_byte, KvExtractor};
use crate::store::Attrs;

/// The atomic predicate kinds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// Payload contains the token (or phrase, for quoted strings).
    Token(String),
    /// An attribute or extracted pair equals (key, value).
    Kv(String, String),
    /// Some attribute or extracted pair has this key (`key=*`).
    KeyExists(String),
    /// Some attribute or extracted pair has this value (`*=value`).
    ValueExists(String),
}

impl std::fmt::Display for Predicate {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Predicate::Token(t) => write!(f, "{:?}", t),
            Predicate::Kv(k, v) => write!(f, "{}={}", k, v),
            Predicate::KeyExists(k) => write!(f, "{}=*", k),
            Predicate::ValueExists(v) => write!(f, "*={}", v),
        }
    }
}

/// A boolean expression over predicates.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    Pred(Predicate),
}

/// One conjunction of the disjunctive normal form. Negative predicates
/// cannot prune via posting lists and only apply at runtime.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Branch {
    pub positive: Vec<Predicate>,
    pub negative: Vec<Predicate>,
}

impl Branch {
    fn merge(mut self, other: &Branch) -> Branch {
        self.positive.extend(other.positive.iter().cloned());
        self.negative.extend(other.negative.iter().cloned());
        self
    }
}

/// Convert an expression to DNF: negations pushed inward via De Morgan,
/// AND distributed over OR.
pub fn to_dnf(expr: &Expr) -> Vec<Branch> {
    dnf(expr, false)
}

fn dnf(expr: &Expr, negate: bool) -> Vec<Branch> {
    match expr {
        Expr::Pred(pred) => {
            let mut branch = Branch::default();
            if negate {
                branch.negative.push(pred.clone());
            } else {
                branch.positive.push(pred.clone());
            }
            vec![branch]
        }
        Expr::Not(inner) => dnf(inner, !negate),
        Expr::And(items) => {
            if negate {
                // NOT (a AND b) == NOT a OR NOT b
                items.iter().flat_map(|item| dnf(item, true)).collect()
            } else {
                cross_product(items.iter().map(|item| dnf(item, false)))
            }
        }
        Expr::Or(items) => {
            if negate {
                // NOT (a OR b) == NOT a AND NOT b
                cross_product(items.iter().map(|item| dnf(item, true)))
            } else {
                items.iter().flat_map(|item| dnf(item, false)).collect()
            }
        }
    }
}

fn cross_product<I: Iterator<Item = Vec<Branch>>>(parts: I) -> Vec<Branch> {
    let mut acc = vec![Branch::default()];
    for part in parts {
        let mut next = Vec::with_capacity(acc.len() * part.len());
        for left in &acc {
            for right in &part {
                next.push(left.clone().merge(right));
            }
        }
        acc = next;
    }
    acc
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Lazily computed per-record state for runtime predicate evaluation.
///
/// Tokenization and pair extraction only happen when a predicate
/// actually needs them, and at most once per record.
pub struct RecordEval<'a> {
    extractors: &'a [Box<dyn KvExtractor>],
    attrs: &'a Attrs,
    raw: &'a [u8],
    lowered_raw: Option<Vec<u8>>,
    tokens: Option<Vec<Vec<u8>>>,
    pairs: Option<Vec<(String, String)>>,
}

impl<'a> RecordEval<'a> {
    pub fn new(extractors: &'a [Box<dyn KvExtractor>], attrs: &'a Attrs, raw: &'a [u8]) -> Self {
        Self {
            extractors,
            attrs,
            raw,
            lowered_raw: None,
            tokens: None,
            pairs: None,
        }
    }

    fn lowered_raw(&mut self) -> &[u8] {
        if self.lowered_raw.is_none() {
            self.lowered_raw = Some(self.raw.to_ascii_lowercase());
        }
        self.lowered_raw.as_ref().unwrap()
    }

    fn tokens(&mut self) -> &[Vec<u8>] {
        if self.tokens.is_none() {
            let mut tokens = Vec::new();
            let mut buf = Vec::with_capacity(64);
            each_token(self.raw, &mut buf, |run| {
                tokens.push(index_key(run).to_vec());
            });
            self.tokens = Some(tokens);
        }
        self.tokens.as_ref().unwrap()
    }

    fn pairs(&mut self) -> &[(String, String)] {
        if self.pairs.is_none() {
            self.pairs = Some(extract_pairs(self.extractors, self.raw));
        }
        self.pairs.as_ref().unwrap()
    }

    fn matches_token(&mut self, token: &str) -> bool {
        let needle = token.to_ascii_lowercase();
        // a single clean token run compares against the tokenized
        // payload (the same set the token index sees); anything else,
        // like a quoted phrase, falls back to substring search
        if !needle.is_empty() && needle.bytes().all(is_token_byte) {
            let key = index_key(needle.as_bytes()).to_vec();
            self.tokens().iter().any(|t| t.as_slice() == key.as_slice())
        } else {
            contains_subslice(self.lowered_raw(), needle.as_bytes())
        }
    }

    pub fn matches(&mut self, pred: &Predicate) -> bool {
        match pred {
            Predicate::Token(token) => self.matches_token(token),
            Predicate::Kv(key, value) => {
                self.attrs.iter().any(|(ak, av)| {
                    ak.eq_ignore_ascii_case(key) && av.eq_ignore_ascii_case(value)
                }) || {
                    let key = key.to_ascii_lowercase();
                    let value = value.to_ascii_lowercase();
                    self.pairs().iter().any(|(pk, pv)| *pk == key && *pv == value)
                }
            }
            Predicate::KeyExists(key) => {
                self.attrs.keys().any(|ak| ak.eq_ignore_ascii_case(key)) || {
                    let key = key.to_ascii_lowercase();
                    self.pairs().iter().any(|(pk, _)| *pk == key)
                }
            }
            Predicate::ValueExists(value) => {
                self.attrs.values().any(|av| av.eq_ignore_ascii_case(value)) || {
                    let value = value.to_ascii_lowercase();
                    self.pairs().iter().any(|(_, pv)| *pv == value)
                }
            }
        }
    }
}

/// A record matches iff at least one branch has all positive predicates
/// matching and no negative predicate matching. An empty branch list
/// (no expression) matches everything.
pub fn matches_branches(branches: &[Branch], eval: &mut RecordEval) -> bool {
    if branches.is_empty() {
        return true;
    }
    branches.iter().any(|branch| {
        branch.positive.iter().all(|pred| eval.matches(pred))
            && !branch.negative.iter().any(|pred| eval.matches(pred))
    })
}
