//! The query engine facade: a store handle plus execution defaults.

use std::sync::Arc;

use anyhow::Error;

use crate::extract::{standard_extractors, KvExtractor};
use crate::store::ChunkStore;

use super::exec::{execute_query, Query, RecordStream};
use super::follow::follow_query;
use super::plan::{plan_query, QueryPlan};

/// Default bound of the record channel between producer and consumer.
const DEFAULT_CHANNEL_CAPACITY: usize = 128;

pub struct QueryEngine {
    store: Arc<ChunkStore>,
    store_name: String,
    capacity: usize,
    extractors: Arc<Vec<Box<dyn KvExtractor>>>,
}

impl QueryEngine {
    pub fn new<S: Into<String>>(store: Arc<ChunkStore>, store_name: S) -> Self {
        Self {
            store,
            store_name: store_name.into(),
            capacity: DEFAULT_CHANNEL_CAPACITY,
            extractors: Arc::new(standard_extractors()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_extractors(mut self, extractors: Vec<Box<dyn KvExtractor>>) -> Self {
        self.extractors = Arc::new(extractors);
        self
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn store_name(&self) -> &str {
        &self.store_name
    }

    fn store_matches(&self, query: &Query) -> bool {
        query
            .store
            .as_ref()
            .map_or(true, |name| name == &self.store_name)
    }

    /// Explain a query without running it.
    pub fn plan(&self, query: &Query) -> Result<QueryPlan, Error> {
        plan_query(&self.store, query)
    }

    /// Run a query; the stream ends after the limit, the last matching
    /// record, or cancellation.
    pub fn query(&self, query: Query) -> Result<RecordStream, Error> {
        if !self.store_matches(&query) {
            return Ok(RecordStream::empty());
        }
        execute_query(
            self.store.clone(),
            self.extractors.clone(),
            query,
            self.capacity,
        )
    }

    /// Run a query in follow mode; the stream only ends on cancellation
    /// (or an explicit limit).
    pub fn follow(&self, query: Query) -> RecordStream {
        if !self.store_matches(&query) {
            return RecordStream::empty();
        }
        follow_query(
            self.store.clone(),
            self.extractors.clone(),
            query,
            self.capacity,
        )
    }
}
