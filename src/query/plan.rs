//! The query planner.
//!
//! Planning selects chunks by time, converts the expression to DNF and
//! builds one pipeline per branch and chunk: a time-index seek, then
//! token-index intersections, then attribute/kv-index intersections.
//! Every step records its candidate counts and why it was indexed,
//! pushed to runtime, or skipped — callers can render the plan to
//! explain a query.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::Error;
use log::debug;

use crate::error::StoreError;
use crate::extract::{index_key, is_indexable, is_token_byte};
use crate::index::ChunkIndexes;
use crate::store::{ChunkId, ChunkMeta, ChunkStore};

use super::exec::{Direction, Query};
use super::expr::{to_dnf, Branch, Predicate};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepAction {
    /// Positioned the scan with a timestamp seek.
    Seek,
    /// Answered from a posting list.
    Indexed,
    /// Left for the runtime filter.
    Runtime,
    /// Intersection came up empty; the branch is dead.
    Skipped,
}

#[derive(Clone, Debug)]
pub struct PlanStep {
    pub desc: String,
    /// Candidate count entering the step; `None` is "all records".
    pub before: Option<usize>,
    /// Candidate count after the step.
    pub after: Option<usize>,
    pub action: StepAction,
    pub reason: String,
}

/// One DNF branch, planned against one chunk.
pub struct BranchPlan {
    pub branch: Branch,
    pub steps: Vec<PlanStep>,
    /// Intersection of the indexed positive postings; `None` when no
    /// positive predicate could use an index.
    pub candidates: Option<Vec<u64>>,
    /// An indexed intersection came up empty.
    pub skipped: bool,
    /// Positive predicates that must be evaluated while scanning.
    pub runtime: Vec<Predicate>,
}

pub struct ChunkPlan {
    pub meta: ChunkMeta,
    /// Lower-bound scan position from the timestamp seek.
    pub start_position: Option<u64>,
    /// The chunk cannot contribute records at all.
    pub empty: bool,
    /// Union of branch candidates; `None` forces a sequential scan.
    pub candidates: Option<Vec<u64>>,
    pub branches: Vec<BranchPlan>,
}

pub struct QueryPlan {
    /// The DNF of the query expression (empty without an expression).
    pub branches: Vec<Branch>,
    /// Selected chunks, already in scan direction order.
    pub chunks: Vec<ChunkPlan>,
}

enum Postings {
    Indexed(Vec<u64>),
    Runtime(String),
}

fn intersect(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] < b[j] {
            i += 1;
        } else if a[i] > b[j] {
            j += 1;
        } else {
            out.push(a[i]);
            i += 1;
            j += 1;
        }
    }
    out
}

fn union(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        let next = match (a.get(i), b.get(j)) {
            (Some(&x), Some(&y)) if x == y => {
                i += 1;
                j += 1;
                x
            }
            (Some(&x), Some(&y)) if x < y => {
                i += 1;
                x
            }
            (Some(_), Some(&y)) => {
                j += 1;
                y
            }
            (Some(&x), None) => {
                i += 1;
                x
            }
            (None, Some(&y)) => {
                j += 1;
                y
            }
            (None, None) => break,
        };
        out.push(next);
    }
    out
}

/// Posting lookup that treats a capped index as unknown: both for
/// missing and for present keys, since postings past the budget point
/// are simply absent.
fn side_lookup(
    reader: &Option<crate::index::PostingReader>,
    key: &[u8],
    what: &str,
) -> Result<Vec<u64>, String> {
    match reader {
        None => Err(format!("{} index missing", what)),
        Some(reader) if reader.is_capped() => Err(format!("{} index capped", what)),
        Some(reader) => Ok(reader.lookup(key).map(|p| p.to_vec()).unwrap_or_default()),
    }
}

/// Resolve one positive predicate against the chunk indexes.
fn predicate_postings(pred: &Predicate, indexes: &ChunkIndexes) -> Postings {
    match pred {
        Predicate::Token(token) => {
            let norm = token.to_ascii_lowercase();
            if norm.is_empty() || !norm.bytes().all(is_token_byte) {
                return Postings::Runtime("phrase requires scan".to_string());
            }
            if !is_indexable(norm.as_bytes()) {
                return Postings::Runtime("token not indexable".to_string());
            }
            match &indexes.token {
                Some(reader) => Postings::Indexed(
                    reader
                        .lookup(index_key(norm.as_bytes()))
                        .map(|p| p.to_vec())
                        .unwrap_or_default(),
                ),
                None => Postings::Runtime("token index missing".to_string()),
            }
        }
        Predicate::Kv(key, value) => {
            let key_l = key.to_ascii_lowercase();
            let value_l = value.to_ascii_lowercase();

            // attribute side: the attr-kv index, with the source index
            // standing in for `source=<uuid>` lookups
            let attr_side = match side_lookup_kv(&indexes.attr_kv, key_l.as_bytes(), value_l.as_bytes(), "attr kv") {
                Ok(p) => Ok(p),
                Err(reason) => source_fallback(indexes, &key_l, value).ok_or(reason),
            };
            let attr = match attr_side {
                Ok(p) => p,
                Err(reason) => return Postings::Runtime(reason),
            };
            match side_lookup_kv(&indexes.kv_kv, key_l.as_bytes(), value_l.as_bytes(), "kv kv") {
                Ok(kv) => Postings::Indexed(union(&attr, &kv)),
                Err(reason) => Postings::Runtime(reason),
            }
        }
        Predicate::KeyExists(key) => {
            let key_l = key.to_ascii_lowercase();
            let attr = match side_lookup(&indexes.attr_key, key_l.as_bytes(), "attr key") {
                Ok(p) => p,
                Err(reason) => return Postings::Runtime(reason),
            };
            match side_lookup(&indexes.kv_key, key_l.as_bytes(), "kv key") {
                Ok(kv) => Postings::Indexed(union(&attr, &kv)),
                Err(reason) => Postings::Runtime(reason),
            }
        }
        Predicate::ValueExists(value) => {
            let value_l = value.to_ascii_lowercase();
            let attr = match side_lookup(&indexes.attr_value, value_l.as_bytes(), "attr value") {
                Ok(p) => p,
                Err(reason) => return Postings::Runtime(reason),
            };
            match side_lookup(&indexes.kv_value, value_l.as_bytes(), "kv value") {
                Ok(kv) => Postings::Indexed(union(&attr, &kv)),
                Err(reason) => Postings::Runtime(reason),
            }
        }
    }
}

fn side_lookup_kv(
    reader: &Option<crate::index::PostingReader>,
    key: &[u8],
    value: &[u8],
    what: &str,
) -> Result<Vec<u64>, String> {
    match reader {
        None => Err(format!("{} index missing", what)),
        Some(reader) if reader.is_capped() => Err(format!("{} index capped", what)),
        Some(reader) => Ok(reader
            .lookup_kv(key, value)
            .map(|p| p.to_vec())
            .unwrap_or_default()),
    }
}

fn source_fallback(indexes: &ChunkIndexes, key: &str, value: &str) -> Option<Vec<u64>> {
    if key != "source" || value.len() != 36 {
        return None;
    }
    let id = ChunkId::parse_str(value).ok()?;
    let reader = indexes.source.as_ref()?;
    Some(reader.lookup(&id).map(|p| p.to_vec()).unwrap_or_default())
}

fn plan_branch(branch: &Branch, indexes: &ChunkIndexes) -> BranchPlan {
    let mut steps = Vec::new();
    let mut candidates: Option<Vec<u64>> = None;
    let mut skipped = false;
    let mut runtime = Vec::new();

    // pipeline order: token lookups first, then attribute/kv lookups
    let mut ordered: Vec<&Predicate> = Vec::with_capacity(branch.positive.len());
    ordered.extend(
        branch
            .positive
            .iter()
            .filter(|p| matches!(p, Predicate::Token(_))),
    );
    ordered.extend(
        branch
            .positive
            .iter()
            .filter(|p| !matches!(p, Predicate::Token(_))),
    );

    for pred in ordered {
        let before = candidates.as_ref().map(|c| c.len());
        match predicate_postings(pred, indexes) {
            Postings::Indexed(postings) => {
                let next = match &candidates {
                    None => postings,
                    Some(current) => intersect(current, &postings),
                };
                let after = next.len();
                let action = if after == 0 {
                    StepAction::Skipped
                } else {
                    StepAction::Indexed
                };
                steps.push(PlanStep {
                    desc: pred.to_string(),
                    before,
                    after: Some(after),
                    action,
                    reason: if after == 0 {
                        "empty intersection".to_string()
                    } else {
                        "posting list".to_string()
                    },
                });
                candidates = Some(next);
                if after == 0 {
                    skipped = true;
                    break;
                }
            }
            Postings::Runtime(reason) => {
                steps.push(PlanStep {
                    desc: pred.to_string(),
                    before,
                    after: before,
                    action: StepAction::Runtime,
                    reason,
                });
                runtime.push(pred.clone());
            }
        }
    }

    BranchPlan {
        branch: branch.clone(),
        steps,
        candidates,
        skipped,
        runtime,
    }
}

fn ranges_intersect(meta: &ChunkMeta, lower: Option<i64>, upper: Option<i64>) -> bool {
    lower.map_or(true, |lb| meta.end_ts >= lb) && upper.map_or(true, |ub| meta.start_ts <= ub)
}

fn plan_chunk(store: &ChunkStore, meta: ChunkMeta, query: &Query, branches: &[Branch]) -> Result<ChunkPlan, Error> {
    let mut seek_step = None;
    let mut start_position = None;
    let mut empty = false;

    // timestamp seek (forward scans only; reverse scans filter inline)
    if query.direction == Direction::Forward {
        if let Some(lower) = query.write_bounds.start {
            let indexes = if meta.sealed {
                Some(ChunkIndexes::open(&store.chunk_dir(meta.id)))
            } else {
                None
            };
            let sparse = indexes.as_ref().and_then(|ix| ix.time.as_ref());
            match sparse.and_then(|time| time.find_start(lower)) {
                Some(position) => {
                    start_position = Some(position);
                    seek_step = Some(PlanStep {
                        desc: format!("write_ts >= {}", lower),
                        before: None,
                        after: None,
                        action: StepAction::Seek,
                        reason: "time index".to_string(),
                    });
                }
                None => match store.find_start_position(meta.id, lower)? {
                    Some(position) => {
                        start_position = Some(position);
                        seek_step = Some(PlanStep {
                            desc: format!("write_ts >= {}", lower),
                            before: None,
                            after: None,
                            action: StepAction::Seek,
                            reason: "record index search".to_string(),
                        });
                    }
                    None => {
                        empty = true;
                    }
                },
            }
        }
    }

    if empty || branches.is_empty() {
        return Ok(ChunkPlan {
            meta,
            start_position,
            empty,
            candidates: None,
            branches: Vec::new(),
        });
    }

    // unsealed chunks have no indexes: everything is runtime
    if !meta.sealed {
        let branch_plans = branches
            .iter()
            .map(|branch| BranchPlan {
                branch: branch.clone(),
                steps: vec![PlanStep {
                    desc: "all predicates".to_string(),
                    before: None,
                    after: None,
                    action: StepAction::Runtime,
                    reason: "chunk not sealed".to_string(),
                }],
                candidates: None,
                skipped: false,
                runtime: branch.positive.clone(),
            })
            .collect();
        return Ok(ChunkPlan {
            meta,
            start_position,
            empty: false,
            candidates: None,
            branches: branch_plans,
        });
    }

    let indexes = ChunkIndexes::open(&store.chunk_dir(meta.id));
    let mut branch_plans: Vec<BranchPlan> = branches
        .iter()
        .map(|branch| plan_branch(branch, &indexes))
        .collect();

    if let Some(step) = seek_step {
        for plan in branch_plans.iter_mut() {
            plan.steps.insert(0, step.clone());
        }
    }

    // chunk scan set: union of live branch candidate sets; a branch
    // without any indexed predicate forces a full sequential scan
    let mut all_skipped = true;
    let mut sequential = false;
    let mut combined: BTreeSet<u64> = BTreeSet::new();
    for plan in &branch_plans {
        if plan.skipped {
            continue;
        }
        all_skipped = false;
        match &plan.candidates {
            None => sequential = true,
            Some(candidates) => combined.extend(candidates.iter().copied()),
        }
    }

    let (empty, candidates) = if all_skipped {
        (true, None)
    } else if sequential {
        (false, None)
    } else {
        (false, Some(combined.into_iter().collect()))
    };

    Ok(ChunkPlan {
        meta,
        start_position,
        empty,
        candidates,
        branches: branch_plans,
    })
}

/// Build the full plan for a query against a store.
pub fn plan_query(store: &ChunkStore, query: &Query) -> Result<QueryPlan, Error> {
    let branches = match &query.expr {
        Some(expr) => to_dnf(expr),
        None => Vec::new(),
    };

    let lower = query.write_bounds.start;
    let upper = query.write_bounds.end;

    // the active chunk is always considered; sealed chunks must
    // intersect the write-time bounds
    let mut metas: Vec<ChunkMeta> = store
        .list()
        .into_iter()
        .filter(|meta| !meta.sealed || ranges_intersect(meta, lower, upper))
        .collect();

    if query.direction == Direction::Reverse {
        metas.reverse();
    }

    if let Some(token) = &query.resume {
        // the referenced chunk must still exist
        if store.meta(token.chunk_id).is_err() {
            return Err(StoreError::InvalidResumeToken.into());
        }
        // skip chunks ordered before the token's chunk (v7 ids order by
        // creation time)
        metas.retain(|meta| match query.direction {
            Direction::Forward => meta.id >= token.chunk_id,
            Direction::Reverse => meta.id <= token.chunk_id,
        });
    }

    let mut chunks = Vec::with_capacity(metas.len());
    for meta in metas {
        chunks.push(plan_chunk(store, meta, query, &branches)?);
    }

    debug!(
        "planned query over {} chunks ({} branches)",
        chunks.len(),
        branches.len()
    );

    Ok(QueryPlan { branches, chunks })
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "query plan: {} branches", self.branches.len())?;
        for chunk in &self.chunks {
            let scan = if chunk.empty {
                "skip".to_string()
            } else {
                match &chunk.candidates {
                    None => "sequential".to_string(),
                    Some(c) => format!("{} candidates", c.len()),
                }
            };
            writeln!(f, "  chunk {} [{}]", chunk.meta.id, scan)?;
            for (i, branch) in chunk.branches.iter().enumerate() {
                writeln!(f, "    branch {}{}", i, if branch.skipped { " (skipped)" } else { "" })?;
                for step in &branch.steps {
                    writeln!(
                        f,
                        "      {:?} {} - {} ({:?} -> {:?})",
                        step.action, step.desc, step.reason, step.before, step.after
                    )?;
                }
            }
        }
        Ok(())
    }
}
