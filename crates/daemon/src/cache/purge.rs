// Cascading purge: walk the relationship graph depth-first from a changed
// entity and drop every dependent cache entry in the same partition.
//
// Children are discovered two ways: the entity store's secondary index
// (records that exist but may not be cached) and the tags of cached entries
// (entries that may outlive their records). A failed store lookup is retried
// with backoff, then degrades to a wildcard purge of the child namespace and
// is reported on the alert channel. The originating mutation is never undone.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use mcpd_common::types::Partition;
use tokio::sync::broadcast;
use tracing::{debug, error, info_span, warn, Instrument};

use super::relations::{Link, Relationship, RelationshipGraph};
use super::{EntityKeys, Tags, TtlCache};
use crate::store::{field_values, EntityKind, EntityStore, StoreError};

const ALERT_CAPACITY: usize = 64;
const MAX_DELAY_MS: u64 = 30_000;

/// Retry schedule for child lookups against the entity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 3, base_delay: Duration::from_millis(50) }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry `attempt` (0-based), capped at 30s.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(7);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(1u64 << exp).min(MAX_DELAY_MS))
    }
}

/// Operator-facing record of a dependency lookup that could not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationFailure {
    pub partition: Partition,
    pub parent: EntityKind,
    pub child: EntityKind,
    pub parent_value: String,
    pub attempts: u32,
    pub message: String,
}

/// What a cascading purge touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub purged: BTreeMap<EntityKind, usize>,
    pub visited: usize,
    pub failures: Vec<InvalidationFailure>,
}

impl PurgeReport {
    fn record(&mut self, kind: EntityKind, count: usize) {
        if count > 0 {
            *self.purged.entry(kind).or_default() += count;
        }
    }

    pub fn purged_for(&self, kind: EntityKind) -> usize {
        self.purged.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.purged.values().sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn merge(&mut self, other: PurgeReport) {
        for (kind, count) in other.purged {
            self.record(kind, count);
        }
        self.visited += other.visited;
        self.failures.extend(other.failures);
    }
}

struct Frame {
    kind: EntityKind,
    keys: EntityKeys,
    depth: usize,
}

pub struct CascadingPurger {
    cache: Arc<TtlCache>,
    store: Arc<dyn EntityStore>,
    graph: RelationshipGraph,
    max_depth: usize,
    retry: RetryPolicy,
    alerts: broadcast::Sender<InvalidationFailure>,
}

impl CascadingPurger {
    pub fn new(cache: Arc<TtlCache>, store: Arc<dyn EntityStore>, graph: RelationshipGraph) -> Self {
        let (alerts, _) = broadcast::channel(ALERT_CAPACITY);
        Self { cache, store, graph, max_depth: 3, retry: RetryPolicy::default(), alerts }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    pub fn graph(&self) -> &RelationshipGraph {
        &self.graph
    }

    /// Invalidation failures, for operators.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<InvalidationFailure> {
        self.alerts.subscribe()
    }

    /// Purge the entries of `kind` selected by `keys`, then every dependent
    /// entry reachable through the relationship graph.
    pub async fn purge_cascading(&self, kind: EntityKind, partition: &Partition, keys: EntityKeys) -> PurgeReport {
        let span = info_span!("cache.purge_cascading", partition = %partition, kind = %kind);
        self.run(partition, vec![(kind, keys)]).instrument(span).await
    }

    /// Wildcard purge of one entity type and its dependents.
    pub async fn purge_entity_type(&self, partition: &Partition, kind: EntityKind) -> PurgeReport {
        self.purge_cascading(kind, partition, EntityKeys::new()).await
    }

    /// Wildcard purge of every namespace in a partition.
    pub async fn purge_partition(&self, partition: &Partition) -> PurgeReport {
        let roots = EntityKind::ALL.into_iter().map(|kind| (kind, EntityKeys::new())).collect();
        let span = info_span!("cache.purge_partition", partition = %partition);
        self.run(partition, roots).instrument(span).await
    }

    async fn run(&self, partition: &Partition, roots: Vec<(EntityKind, EntityKeys)>) -> PurgeReport {
        let mut report = PurgeReport::default();
        let mut visited: HashSet<(EntityKind, EntityKeys)> = HashSet::new();
        let mut stack: Vec<Frame> =
            roots.into_iter().rev().map(|(kind, keys)| Frame { kind, keys, depth: 0 }).collect();

        while let Some(frame) = stack.pop() {
            if !visited.insert((frame.kind, frame.keys.clone())) {
                continue;
            }
            report.visited += 1;

            let removed = self.cache.purge_matching(frame.kind, partition, &frame.keys);
            report.record(frame.kind, removed.len());
            debug!(kind = %frame.kind, depth = frame.depth, removed = removed.len(), "purged cache entries");

            if frame.depth == 0 {
                self.purge_upward(partition, &frame, &removed, &mut report);
            }
            if frame.depth >= self.max_depth {
                debug!(kind = %frame.kind, "cascade depth limit reached");
                continue;
            }

            let mut next = Vec::new();
            for rel in self.graph.children_of(frame.kind) {
                self.expand(partition, rel, &frame, &removed, &mut next, &mut report).await;
            }
            // Reverse so the first relationship is explored first.
            stack.extend(next.into_iter().rev());
        }
        report
    }

    fn purge_upward(&self, partition: &Partition, frame: &Frame, removed: &[Tags], report: &mut PurgeReport) {
        for rel in self.graph.parents_of(frame.kind).filter(|r| r.upward) {
            let Link::Field { parent_field, child_field } = rel.link else {
                continue;
            };
            for value in linked_values(&frame.keys, removed, child_field) {
                let keys = crate::entity_keys! { parent_field => value };
                let parents = self.cache.purge_matching(rel.parent, partition, &keys);
                report.record(rel.parent, parents.len());
            }
        }
    }

    async fn expand(
        &self,
        partition: &Partition,
        rel: &Relationship,
        frame: &Frame,
        removed: &[Tags],
        next: &mut Vec<Frame>,
        report: &mut PurgeReport,
    ) {
        let depth = frame.depth + 1;
        let Link::Field { parent_field, child_field } = rel.link else {
            next.push(Frame { kind: rel.child, keys: EntityKeys::new(), depth });
            return;
        };
        if frame.keys.is_empty() {
            next.push(Frame { kind: rel.child, keys: EntityKeys::new(), depth });
            return;
        }

        let key_field = rel.child.key_field();
        for value in linked_values(&frame.keys, removed, parent_field) {
            next.push(Frame { kind: rel.child, keys: crate::entity_keys! { child_field => &value }, depth });

            let mut child_keys: BTreeSet<String> = self
                .cache
                .tags_matching(rel.child, partition, child_field, &value)
                .iter()
                .filter_map(|tags| tags.first(key_field).map(str::to_string))
                .collect();

            match self.query_children(partition, rel, child_field, &value).await {
                Ok(records) => {
                    child_keys.extend(records.iter().flat_map(|record| field_values(record, key_field)));
                }
                Err((attempts, store_error)) => {
                    let failure = InvalidationFailure {
                        partition: partition.clone(),
                        parent: rel.parent,
                        child: rel.child,
                        parent_value: value.clone(),
                        attempts,
                        message: store_error.to_string(),
                    };
                    error!(
                        partition = %partition,
                        parent = %rel.parent,
                        child = %rel.child,
                        value = %value,
                        error = %store_error,
                        "invalidation lookup failed; purging child namespace"
                    );
                    let _ = self.alerts.send(failure.clone());
                    report.failures.push(failure);
                    next.push(Frame { kind: rel.child, keys: EntityKeys::new(), depth });
                }
            }

            for key in child_keys {
                next.push(Frame { kind: rel.child, keys: crate::entity_keys! { key_field => key }, depth });
            }
        }
    }

    async fn query_children(
        &self,
        partition: &Partition,
        rel: &Relationship,
        child_field: &str,
        value: &str,
    ) -> Result<Vec<serde_json::Value>, (u32, StoreError)> {
        let mut attempt = 0;
        loop {
            match self.store.query_by_index(partition, rel.child, child_field, value).await {
                Ok(records) => return Ok(records),
                Err(store_error) => {
                    attempt += 1;
                    if attempt >= self.retry.attempts.max(1) {
                        return Err((attempt, store_error));
                    }
                    let delay = self.retry.backoff_delay(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %store_error, "retrying dependency lookup");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Values of `field` named by the purge keys or carried by removed entries.
fn linked_values(keys: &EntityKeys, removed: &[Tags], field: &str) -> BTreeSet<String> {
    let mut values: BTreeSet<String> = keys.get(field).cloned().into_iter().collect();
    for tags in removed {
        values.extend(tags.values(field).map(str::to_string));
    }
    values
}
