//! Boolean query language, planner and executor.
//!
//! Query text parses into an expression tree, which the planner converts
//! to disjunctive normal form. Each DNF branch becomes an independent
//! per-chunk pipeline of posting-list lookups; whatever the indexes
//! cannot answer (missing or capped files, non-indexable tokens, NOT
//! predicates) is re-checked at runtime while scanning. Matching records
//! stream through a bounded channel, so a slow consumer back-pressures
//! the producer and dropping the stream collapses it.

mod expr;
pub use expr::*;

mod parse;
pub use parse::*;

mod plan;
pub use plan::*;

mod exec;
pub use exec::*;

mod follow;
pub use follow::*;

mod engine;
pub use engine::*;
