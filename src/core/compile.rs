//! Compilation of the stream-query algebra into backend-native predicates.
//!
//! Every dialect shares the block semantics of [`QueryBlock::matches`]; only
//! the output representation differs. `compile` returns `None` when nothing
//! can match, and [`Compiled::Unrestricted`] when no stream filter applies.

use crate::core::query::{QueryBlock, StreamQuery};
use tracing::warn;

/// Token indexed on every row of the SQLite full-text table so that a
/// negation without a positive clause still has a left operand. Stream tokens
/// always start with `s`, so this one cannot collide with them.
pub const ALL_ROWS_TOKEN: &str = "all";

#[derive(Debug, Clone, PartialEq)]
pub enum Compiled<P> {
    /// No stream restriction: every row matches.
    Unrestricted,
    Predicate(P),
}

impl<P> Compiled<P> {
    pub fn predicate(&self) -> Option<&P> {
        match self {
            Compiled::Unrestricted => None,
            Compiled::Predicate(p) => Some(p),
        }
    }
}

pub trait Dialect {
    type Predicate;

    /// Compile one block; `None` when the block cannot match anything.
    fn block(&self, block: &QueryBlock) -> Option<Compiled<Self::Predicate>>;

    /// Combine top-level block predicates with OR. Called with two or more parts.
    fn union(&self, parts: Vec<Self::Predicate>) -> Self::Predicate;
}

pub fn compile<D: Dialect>(query: &StreamQuery, dialect: &D) -> Option<Compiled<D::Predicate>> {
    if query.blocks.is_empty() {
        return Some(Compiled::Unrestricted);
    }
    let mut parts = Vec::with_capacity(query.blocks.len());
    for block in &query.blocks {
        match dialect.block(block) {
            Some(Compiled::Unrestricted) => return Some(Compiled::Unrestricted),
            Some(Compiled::Predicate(p)) => parts.push(p),
            None => {}
        }
    }
    match parts.len() {
        0 => None,
        1 => parts.pop().map(Compiled::Predicate),
        _ => Some(Compiled::Predicate(dialect.union(parts))),
    }
}

/// How a `not` clause is introduced when the block has no positive clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotPlaceholder {
    /// Quoted all-rows token, which the SQLite backend indexes on every row.
    #[default]
    AllRows,
    /// Bare `..` marker, byte-compatible with query strings stored by older
    /// deployments. FTS5 rejects it as a syntax error.
    Legacy,
}

/// SQLite FTS5 `MATCH` expression over the `stream_ids` column.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlDialect {
    pub placeholder: NotPlaceholder,
}

impl SqlDialect {
    pub fn legacy() -> Self {
        SqlDialect {
            placeholder: NotPlaceholder::Legacy,
        }
    }

    /// FTS5 token for a stream id: `s` followed by the lowercase hex of its
    /// UTF-8 bytes. The tokenizer keeps it whole and cannot fold its case.
    pub fn token(id: &str) -> String {
        let mut token = String::with_capacity(1 + id.len() * 2);
        token.push('s');
        for byte in id.bytes() {
            token.push_str(&format!("{byte:02x}"));
        }
        token
    }

    /// Quoted FTS5 string literal matching exactly the stream `id`.
    pub fn literal(id: &str) -> String {
        format!("\"{}\"", Self::token(id))
    }

    fn expression(&self, block: &QueryBlock) -> Option<Compiled<String>> {
        if block.is_empty() {
            return None;
        }
        let any_unrestricted = block.any_is_unrestricted();
        let mut res = String::new();
        if !any_unrestricted {
            if block.any.len() == 1 {
                res.push_str(&Self::literal(&block.any[0]));
            } else {
                let items: Vec<String> = block.any.iter().map(|id| Self::literal(id)).collect();
                res.push_str(&format!("({})", items.join(" OR ")));
            }
        }

        let mut conjuncts = Vec::new();
        for sub in &block.and {
            match self.expression(sub)? {
                Compiled::Unrestricted => {}
                Compiled::Predicate(expr) => conjuncts.push(expr),
            }
        }
        if !conjuncts.is_empty() {
            if !res.is_empty() {
                res.push_str(" AND ");
            }
            res.push_str(&conjuncts.join(" AND "));
        }

        if !block.not.is_empty() {
            if res.is_empty() {
                match self.placeholder {
                    NotPlaceholder::AllRows => {
                        res.push_str(&format!("\"{ALL_ROWS_TOKEN}\""));
                    }
                    NotPlaceholder::Legacy => {
                        warn!("legacy '..' placeholder emitted for a negation-only block");
                        res.push_str("..");
                    }
                }
            }
            for id in &block.not {
                res.push_str(" NOT ");
                res.push_str(&Self::literal(id));
            }
        }

        if res.is_empty() {
            Some(Compiled::Unrestricted)
        } else {
            Some(Compiled::Predicate(res))
        }
    }
}

impl Dialect for SqlDialect {
    type Predicate = String;

    fn block(&self, block: &QueryBlock) -> Option<Compiled<String>> {
        self.expression(block)
    }

    fn union(&self, parts: Vec<String>) -> String {
        format!("({})", parts.join(") OR ("))
    }
}

/// Predicate tree evaluated in process, used by backends without a query engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    All,
    Stream(String),
    Or(Vec<Predicate>),
    And(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn matches(&self, stream_ids: &[String]) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Stream(id) => stream_ids.iter().any(|s| s == id),
            Predicate::Or(parts) => parts.iter().any(|p| p.matches(stream_ids)),
            Predicate::And(parts) => parts.iter().all(|p| p.matches(stream_ids)),
            Predicate::Not(inner) => !inner.matches(stream_ids),
        }
    }
}

impl Compiled<Predicate> {
    pub fn matches(&self, stream_ids: &[String]) -> bool {
        match self {
            Compiled::Unrestricted => true,
            Compiled::Predicate(p) => p.matches(stream_ids),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryDialect;

impl Dialect for MemoryDialect {
    type Predicate = Predicate;

    fn block(&self, block: &QueryBlock) -> Option<Compiled<Predicate>> {
        if block.is_empty() {
            return None;
        }
        let mut terms = Vec::new();
        if !block.any_is_unrestricted() {
            let mut any: Vec<Predicate> =
                block.any.iter().cloned().map(Predicate::Stream).collect();
            terms.push(if any.len() == 1 {
                any.remove(0)
            } else {
                Predicate::Or(any)
            });
        }
        for sub in &block.and {
            match self.block(sub)? {
                Compiled::Unrestricted => {}
                Compiled::Predicate(p) => terms.push(p),
            }
        }
        for id in &block.not {
            terms.push(Predicate::Not(Box::new(Predicate::Stream(id.clone()))));
        }
        match terms.len() {
            0 => Some(Compiled::Unrestricted),
            1 => terms.pop().map(Compiled::Predicate),
            _ => Some(Compiled::Predicate(Predicate::And(terms))),
        }
    }

    fn union(&self, parts: Vec<Predicate>) -> Predicate {
        Predicate::Or(parts)
    }
}
