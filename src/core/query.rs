//! Stream-query algebra.
//!
//! A query is a list of blocks OR'd together. Each block combines:
//! - `any`: stream ids OR'd together (`*` lifts the restriction),
//! - `and` (alias `all`): nested blocks AND'd with the `any` result,
//! - `not`: stream ids subtracted from the result.
//!
//! An empty query matches every event; a block with no clause matches none.

use crate::core::error::{FederationError, Result};
use serde_json::Value as JsonValue;
use std::str::FromStr;

/// Matches every stream when present in `any`.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryBlock {
    pub any: Vec<String>,
    pub and: Vec<QueryBlock>,
    pub not: Vec<String>,
}

impl QueryBlock {
    pub fn streams(ids: &[&str]) -> Self {
        QueryBlock {
            any: ids.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn and(mut self, block: QueryBlock) -> Self {
        self.and.push(block);
        self
    }

    pub fn not(mut self, ids: &[&str]) -> Self {
        self.not.extend(ids.iter().map(|s| s.to_string()));
        self
    }

    /// No clause at all: the block selects nothing.
    pub fn is_empty(&self) -> bool {
        self.any.is_empty() && self.and.is_empty() && self.not.is_empty()
    }

    /// The `any` part selects every row: either `*` is listed, or `any` is
    /// absent while `and`/`not` still constrain the block.
    pub fn any_is_unrestricted(&self) -> bool {
        if self.any.iter().any(|id| id == WILDCARD) {
            return true;
        }
        self.any.is_empty() && (!self.and.is_empty() || !self.not.is_empty())
    }

    /// Reference evaluation against an event's stream ids.
    pub fn matches(&self, stream_ids: &[String]) -> bool {
        if self.is_empty() {
            return false;
        }
        let base = self.any_is_unrestricted() || self.any.iter().any(|id| stream_ids.contains(id));
        base && self.and.iter().all(|sub| sub.matches(stream_ids))
            && !self.not.iter().any(|id| stream_ids.contains(id))
    }

    fn parse(value: &JsonValue, path: &str) -> Result<Self> {
        match value {
            JsonValue::String(id) => Ok(QueryBlock {
                any: vec![id.clone()],
                ..Default::default()
            }),
            JsonValue::Object(map) => {
                let mut block = QueryBlock::default();
                for (key, field) in map {
                    let field_path = format!("{path}.{key}");
                    match key.as_str() {
                        "any" => block.any = parse_ids(field, &field_path)?,
                        "not" => block.not = parse_ids(field, &field_path)?,
                        "and" | "all" => {
                            let items = field.as_array().ok_or_else(|| {
                                malformed(&field_path, "expected an array of blocks")
                            })?;
                            for (i, item) in items.iter().enumerate() {
                                block
                                    .and
                                    .push(QueryBlock::parse(item, &format!("{field_path}[{i}]"))?);
                            }
                        }
                        other => {
                            return Err(malformed(path, &format!("unknown property '{other}'")));
                        }
                    }
                }
                Ok(block)
            }
            _ => Err(malformed(path, "a block must be a stream id or an object")),
        }
    }

    fn to_json(&self) -> JsonValue {
        let mut map = serde_json::Map::new();
        if !self.any.is_empty() {
            map.insert("any".to_string(), self.any.clone().into());
        }
        if !self.and.is_empty() {
            let and: Vec<JsonValue> = self.and.iter().map(QueryBlock::to_json).collect();
            map.insert("and".to_string(), JsonValue::Array(and));
        }
        if !self.not.is_empty() {
            map.insert("not".to_string(), self.not.clone().into());
        }
        JsonValue::Object(map)
    }

    fn map_ids(&self, f: &mut impl FnMut(&str) -> Result<String>) -> Result<QueryBlock> {
        Ok(QueryBlock {
            any: self
                .any
                .iter()
                .map(|id| if id == WILDCARD { Ok(id.clone()) } else { f(id) })
                .collect::<Result<_>>()?,
            and: self
                .and
                .iter()
                .map(|sub| sub.map_ids(f))
                .collect::<Result<_>>()?,
            not: self.not.iter().map(|id| f(id)).collect::<Result<_>>()?,
        })
    }

    fn collect_ids<'a>(&'a self, out: &mut Vec<&'a str>) {
        out.extend(
            self.any
                .iter()
                .map(String::as_str)
                .filter(|id| *id != WILDCARD),
        );
        for sub in &self.and {
            sub.collect_ids(out);
        }
        out.extend(self.not.iter().map(String::as_str));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamQuery {
    pub blocks: Vec<QueryBlock>,
    /// Restricts dispatch to one backend; fans out when unset.
    pub store_id: Option<String>,
}

impl StreamQuery {
    pub fn new(blocks: Vec<QueryBlock>) -> Self {
        StreamQuery {
            blocks,
            store_id: None,
        }
    }

    /// Everything, everywhere.
    pub fn unrestricted() -> Self {
        StreamQuery::default()
    }

    pub fn scoped_to(mut self, store_id: &str) -> Self {
        self.store_id = Some(store_id.to_string());
        self
    }

    /// Parse the wire form: an array of blocks, a single block object, a bare
    /// stream id, or an envelope `{"streams": [...], "storeId": "..."}`.
    pub fn from_json(value: &JsonValue) -> Result<Self> {
        match value {
            JsonValue::Array(items) => {
                let blocks = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| QueryBlock::parse(item, &format!("[{i}]")))
                    .collect::<Result<Vec<_>>>()?;
                Ok(StreamQuery::new(blocks))
            }
            JsonValue::Object(map)
                if map.contains_key("streams") || map.contains_key("storeId") =>
            {
                let mut query = match map.get("streams") {
                    Some(streams) => StreamQuery::from_json(streams)?,
                    None => StreamQuery::unrestricted(),
                };
                if let Some(store) = map.get("storeId") {
                    let store = store
                        .as_str()
                        .ok_or_else(|| malformed("storeId", "expected a string"))?;
                    query.store_id = Some(store.to_string());
                }
                Ok(query)
            }
            JsonValue::Null => Ok(StreamQuery::unrestricted()),
            other => Ok(StreamQuery::new(vec![QueryBlock::parse(other, "[0]")?])),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        let blocks = JsonValue::Array(self.blocks.iter().map(QueryBlock::to_json).collect());
        match &self.store_id {
            Some(store) => serde_json::json!({ "streams": blocks, "storeId": store }),
            None => blocks,
        }
    }

    /// Reference evaluation of the whole query.
    pub fn matches(&self, stream_ids: &[String]) -> bool {
        self.blocks.is_empty() || self.blocks.iter().any(|b| b.matches(stream_ids))
    }

    /// Every concrete stream id mentioned, wildcard excluded.
    pub fn stream_ids(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for block in &self.blocks {
            block.collect_ids(&mut out);
        }
        out
    }

    /// Rewrite every concrete stream id; the wildcard is left untouched.
    pub fn map_ids(&self, mut f: impl FnMut(&str) -> Result<String>) -> Result<StreamQuery> {
        Ok(StreamQuery {
            blocks: self
                .blocks
                .iter()
                .map(|b| b.map_ids(&mut f))
                .collect::<Result<_>>()?,
            store_id: self.store_id.clone(),
        })
    }
}

impl FromStr for StreamQuery {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self> {
        let value: JsonValue = serde_json::from_str(s)
            .map_err(|e| FederationError::QueryMalformed(format!("invalid JSON: {e}")))?;
        StreamQuery::from_json(&value)
    }
}

fn parse_ids(value: &JsonValue, path: &str) -> Result<Vec<String>> {
    let items = value
        .as_array()
        .ok_or_else(|| malformed(path, "expected an array of stream ids"))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| malformed(path, "stream ids must be strings"))
        })
        .collect()
}

fn malformed(path: &str, reason: &str) -> FederationError {
    FederationError::QueryMalformed(format!("{path}: {reason}"))
}
