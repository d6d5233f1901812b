//! Per-client session token store.
//!
//! Tokens are kept per `(collection resource id, partition range id)` and are
//! only ever merged, never overwritten. The outer map holds one inner map per
//! collection so that writes to different collections and partitions do not
//! contend; a write to a single key is a read-modify-write under that key's
//! shard lock.

use crate::error::SessionTokenError;
use crate::metrics::CoordinationMetrics;
use crate::session::request::{CollectionRef, SessionRequest, SessionResponse};
use crate::session::resource_id::ResourceId;
use crate::session::token::SessionToken;
use crate::types::{headers, PartitionRangeId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ENTRY_SEPARATOR: char = ',';
const RANGE_SEPARATOR: char = ':';

type PartitionTokens = Arc<DashMap<PartitionRangeId, SessionToken>>;

/// Tracks the session tokens observed by one client instance.
#[derive(Debug, Default)]
pub struct SessionContainer {
    /// Collection full name to resource id.
    name_to_rid: DashMap<String, ResourceId>,

    /// Collection resource id to per-partition tokens.
    rid_to_tokens: DashMap<ResourceId, PartitionTokens>,

    /// Optional metrics sink.
    metrics: Option<Arc<CoordinationMetrics>>,
}

impl SessionContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty container reporting into `metrics`.
    pub fn with_metrics(metrics: Arc<CoordinationMetrics>) -> Self {
        Self {
            metrics: Some(metrics),
            ..Self::default()
        }
    }

    /// Resolve the token for a partition of a collection.
    ///
    /// Falls back to the first entry of `lineage` (most specific ancestor
    /// first) that has a token when `range_id` has none. `None` means no
    /// session constraint applies.
    pub fn resolve_token(
        &self,
        collection: CollectionRef<'_>,
        range_id: &str,
        lineage: &[String],
    ) -> Option<SessionToken> {
        let tokens = self.partition_tokens(collection)?;

        if let Some(token) = tokens.get(range_id) {
            return Some(token.value().clone());
        }

        lineage
            .iter()
            .filter(|ancestor| ancestor.as_str() != range_id)
            .find_map(|ancestor| tokens.get(ancestor.as_str()).map(|t| t.value().clone()))
    }

    /// Resolve the token for the partition a request was routed to.
    pub fn resolve_for_request<R: SessionRequest + ?Sized>(&self, request: &R) -> Option<SessionToken> {
        let range_id = request.resolved_partition_range()?;
        self.resolve_token(request.collection(), range_id, request.partition_lineage())
    }

    /// Attach the session token header to an outgoing request.
    ///
    /// With a resolved partition range the header carries that range's token;
    /// otherwise it carries every known range of the collection. When nothing
    /// is known the header is removed.
    pub fn apply_session_token<R: SessionRequest + ?Sized>(&self, request: &mut R) {
        let value = match request.resolved_partition_range() {
            Some(range_id) => self
                .resolve_for_request(request)
                .map(|token| format!("{}{}{}", range_id, RANGE_SEPARATOR, token)),
            None => self.collection_session_token(request.collection()),
        };

        match value {
            Some(value) => request.set_header(headers::SESSION_TOKEN, value),
            None => request.remove_header(headers::SESSION_TOKEN),
        }
    }

    /// Every known token of a collection, as a session token header value.
    pub fn collection_session_token(&self, collection: CollectionRef<'_>) -> Option<String> {
        let tokens = self.partition_tokens(collection)?;

        let mut entries: Vec<(PartitionRangeId, String)> = tokens
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().to_string()))
            .collect();
        if entries.is_empty() {
            return None;
        }
        entries.sort();

        let joined = entries
            .into_iter()
            .map(|(range, token)| format!("{}{}{}", range, RANGE_SEPARATOR, token))
            .collect::<Vec<_>>()
            .join(&ENTRY_SEPARATOR.to_string());
        Some(joined)
    }

    /// Merge the session token carried by a response.
    ///
    /// Malformed entries are logged and skipped; they never fail the request.
    pub fn set_token<Q, S>(&self, request: &Q, response: &S)
    where
        Q: SessionRequest + ?Sized,
        S: SessionResponse + ?Sized,
    {
        let Some(header) = response.header(headers::SESSION_TOKEN) else {
            return;
        };

        let rid_text = response.header(headers::OWNER_ID).or(match request.collection() {
            CollectionRef::ResourceId(rid) => Some(rid),
            CollectionRef::Name(_) => None,
        });
        let Some(rid_text) = rid_text else {
            debug!("Response carries a session token but no owner id, skipping");
            return;
        };

        let rid = match ResourceId::parse(rid_text) {
            Ok(rid) => rid,
            Err(e) => {
                warn!(owner_id = rid_text, error = %e, "Ignoring session token with undecodable owner id");
                self.record_rejected();
                return;
            }
        };

        let full_name = response.header(headers::OWNER_FULL_NAME).or(match request.collection() {
            CollectionRef::Name(name) => Some(name),
            CollectionRef::ResourceId(_) => None,
        });
        if let Some(name) = full_name {
            self.register_collection(name, rid);
        }

        for entry in header.split(ENTRY_SEPARATOR).filter(|e| !e.trim().is_empty()) {
            match parse_entry(entry.trim()) {
                Ok((range_id, token)) => self.merge_token(rid, range_id, token),
                Err(e) => {
                    warn!(value = entry, error = %e, "Ignoring malformed session token");
                    self.record_rejected();
                }
            }
        }
    }

    /// Merge a token into the stored value for one partition.
    pub fn merge_token(&self, rid: ResourceId, range_id: impl Into<PartitionRangeId>, token: SessionToken) {
        let tokens = Arc::clone(&*self.rid_to_tokens.entry(rid).or_default());

        tokens
            .entry(range_id.into())
            .and_modify(|current| *current = current.merge(&token))
            .or_insert(token);

        if let Some(metrics) = &self.metrics {
            metrics.session_tokens_merged.inc();
        }
    }

    /// Record that `full_name` refers to the collection `rid`.
    ///
    /// Re-registering the same id is a no-op. A different id means the
    /// collection was recreated: the mapping is replaced and the tokens of
    /// the old id are dropped.
    pub fn register_collection(&self, full_name: &str, rid: ResourceId) {
        let name = normalize_collection_name(full_name);

        let stale = match self.name_to_rid.entry(name.clone()) {
            Entry::Occupied(entry) if *entry.get() == rid => None,
            Entry::Occupied(mut entry) => Some(entry.insert(rid)),
            Entry::Vacant(entry) => {
                entry.insert(rid);
                None
            }
        };

        if let Some(stale) = stale {
            info!(collection = %name, old_rid = %stale, new_rid = %rid, "Collection was recreated, dropping stale session tokens");
            self.rid_to_tokens.remove(&stale);
        }
    }

    /// Drop all tokens of a collection addressed by name.
    pub fn clear_tokens_by_name(&self, full_name: &str) {
        let name = normalize_collection_name(full_name);
        if let Some((_, rid)) = self.name_to_rid.remove(&name) {
            self.rid_to_tokens.remove(&rid);
        }
    }

    /// Drop all tokens of a collection addressed by resource id.
    pub fn clear_tokens_by_resource_id(&self, rid: ResourceId) {
        self.rid_to_tokens.remove(&rid);
        self.name_to_rid.retain(|_, mapped| *mapped != rid);
    }

    /// Resource id a collection name is currently mapped to.
    pub fn resource_id_of(&self, full_name: &str) -> Option<ResourceId> {
        self.name_to_rid
            .get(&normalize_collection_name(full_name))
            .map(|rid| *rid)
    }

    /// Partition ranges with a token for a collection, sorted.
    pub fn known_ranges(&self, rid: ResourceId) -> Vec<PartitionRangeId> {
        let mut ranges: Vec<_> = self
            .rid_to_tokens
            .get(&rid)
            .map(|tokens| tokens.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default();
        ranges.sort();
        ranges
    }

    fn partition_tokens(&self, collection: CollectionRef<'_>) -> Option<PartitionTokens> {
        let rid = match collection {
            CollectionRef::Name(name) => self.resource_id_of(name)?,
            CollectionRef::ResourceId(text) => ResourceId::parse(text).ok()?,
        };
        self.rid_to_tokens.get(&rid).map(|tokens| Arc::clone(&tokens))
    }

    fn record_rejected(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.session_tokens_rejected.inc();
        }
    }
}

/// Split one `<rangeId>:<token>` header entry.
fn parse_entry(entry: &str) -> Result<(&str, SessionToken), SessionTokenError> {
    let (range_id, token) = entry
        .split_once(RANGE_SEPARATOR)
        .filter(|(range_id, _)| !range_id.is_empty())
        .ok_or_else(|| SessionTokenError::MissingPartition {
            value: entry.to_string(),
        })?;
    Ok((range_id, SessionToken::parse(token)?))
}

/// Reduce a resource path to `dbs/<db>/colls/<coll>`.
fn normalize_collection_name(path: &str) -> String {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    if segments.len() >= 4 {
        segments[..4].join("/")
    } else {
        segments.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::request::{DocumentRequest, DocumentResponse};
    use crate::session::token::token_strategy;
    use proptest::prelude::*;

    const COLLECTION: &str = "dbs/db1/colls/orders";

    fn rid() -> ResourceId {
        ResourceId::from_parts(1, 2)
    }

    fn token(text: &str) -> SessionToken {
        SessionToken::parse(text).unwrap()
    }

    fn response(session: &str) -> DocumentResponse {
        DocumentResponse::new()
            .with_header(headers::SESSION_TOKEN, session)
            .with_header(headers::OWNER_ID, rid().to_string())
            .with_header(headers::OWNER_FULL_NAME, COLLECTION)
    }

    #[test]
    fn test_empty_container_resolves_nothing() {
        let container = SessionContainer::new();

        assert_eq!(container.resolve_token(CollectionRef::ResourceId("rid"), "range_1", &[]), None);
        assert_eq!(
            container.resolve_token(CollectionRef::ResourceId(&rid().to_string()), "range_1", &[]),
            None
        );
        assert_eq!(container.resolve_token(CollectionRef::Name(COLLECTION), "range_1", &[]), None);
    }

    #[test]
    fn test_set_token_merges_instead_of_overwriting() {
        let container = SessionContainer::new();
        let request = DocumentRequest::by_name(COLLECTION);

        container.set_token(&request, &response("0:1#100#4=90#5=20"));
        container.set_token(&request, &response("0:1#100#4=80#5=30#6=5"));

        let resolved = container
            .resolve_token(CollectionRef::Name(COLLECTION), "0", &[])
            .unwrap();
        assert_eq!(resolved.to_string(), "1#100#4=90#5=30#6=5");
    }

    #[test]
    fn test_lookup_by_name_and_resource_id_agree() {
        let container = SessionContainer::new();
        container.set_token(&DocumentRequest::by_name(COLLECTION), &response("3:2#10"));

        let by_name = container.resolve_token(CollectionRef::Name("/dbs/db1/colls/orders/docs/a"), "3", &[]);
        let by_rid = container.resolve_token(CollectionRef::ResourceId(&rid().to_string()), "3", &[]);

        assert_eq!(by_name, Some(token("2#10")));
        assert_eq!(by_name, by_rid);
    }

    #[test]
    fn test_fallback_to_parent_range() {
        let container = SessionContainer::new();
        container.merge_token(rid(), "P", token("1#50#1=40"));

        let lineage = vec!["C".to_string(), "P".to_string()];
        let resolved = container.resolve_token(CollectionRef::ResourceId(&rid().to_string()), "C", &lineage);
        assert_eq!(resolved, Some(token("1#50#1=40")));

        // The child's own entry wins once it exists.
        container.merge_token(rid(), "C", token("1#60#1=55"));
        let resolved = container.resolve_token(CollectionRef::ResourceId(&rid().to_string()), "C", &lineage);
        assert_eq!(resolved, Some(token("1#60#1=55")));
    }

    #[test]
    fn test_fallback_uses_first_matching_ancestor() {
        let container = SessionContainer::new();
        container.merge_token(rid(), "root", token("1#10"));
        container.merge_token(rid(), "parent", token("1#20"));

        let lineage = vec!["child".to_string(), "parent".to_string(), "root".to_string()];
        let resolved = container.resolve_token(CollectionRef::ResourceId(&rid().to_string()), "child", &lineage);
        assert_eq!(resolved, Some(token("1#20")));

        let unrelated = vec!["other".to_string()];
        assert_eq!(
            container.resolve_token(CollectionRef::ResourceId(&rid().to_string()), "child", &unrelated),
            None
        );
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let metrics = Arc::new(CoordinationMetrics::new());
        let container = SessionContainer::with_metrics(metrics.clone());
        let request = DocumentRequest::by_name(COLLECTION);

        container.set_token(&request, &response("0:not-a-token,1:1#5,garbage"));

        assert_eq!(container.known_ranges(rid()), vec!["1".to_string()]);
        assert_eq!(metrics.session_tokens_rejected.get(), 2);
        assert_eq!(metrics.session_tokens_merged.get(), 1);
    }

    #[test]
    fn test_response_without_owner_id_uses_rid_request() {
        let container = SessionContainer::new();
        let request = DocumentRequest::by_resource_id(rid().to_string());
        let response = DocumentResponse::new().with_header(headers::SESSION_TOKEN, "4:1#9");

        container.set_token(&request, &response);
        assert_eq!(container.known_ranges(rid()), vec!["4".to_string()]);
    }

    #[test]
    fn test_recreated_collection_drops_stale_tokens() {
        let container = SessionContainer::new();
        container.register_collection(COLLECTION, rid());
        container.merge_token(rid(), "0", token("1#100"));

        // Same id again is a no-op.
        container.register_collection(COLLECTION, rid());
        assert_eq!(container.known_ranges(rid()).len(), 1);

        let recreated = ResourceId::from_parts(1, 3);
        container.register_collection(COLLECTION, recreated);

        assert_eq!(container.resource_id_of(COLLECTION), Some(recreated));
        assert!(container.known_ranges(rid()).is_empty());
        assert_eq!(container.resolve_token(CollectionRef::Name(COLLECTION), "0", &[]), None);
    }

    #[test]
    fn test_clear_tokens() {
        let container = SessionContainer::new();
        container.register_collection(COLLECTION, rid());
        container.merge_token(rid(), "0", token("1#1"));

        container.clear_tokens_by_name(COLLECTION);
        assert!(container.known_ranges(rid()).is_empty());
        assert_eq!(container.resource_id_of(COLLECTION), None);

        container.register_collection(COLLECTION, rid());
        container.merge_token(rid(), "0", token("1#1"));
        container.clear_tokens_by_resource_id(rid());
        assert!(container.known_ranges(rid()).is_empty());
        assert_eq!(container.resource_id_of(COLLECTION), None);
    }

    #[test]
    fn test_apply_session_token_to_request() {
        let container = SessionContainer::new();
        container.register_collection(COLLECTION, rid());
        container.merge_token(rid(), "0", token("1#100"));
        container.merge_token(rid(), "1", token("1#200#2=7"));

        let mut routed = DocumentRequest::by_name(COLLECTION).with_partition_range("1");
        container.apply_session_token(&mut routed);
        assert_eq!(routed.header(headers::SESSION_TOKEN), Some("1:1#200#2=7"));

        let mut unrouted = DocumentRequest::by_name(COLLECTION);
        container.apply_session_token(&mut unrouted);
        assert_eq!(unrouted.header(headers::SESSION_TOKEN), Some("0:1#100,1:1#200#2=7"));

        let mut unknown = DocumentRequest::by_name("dbs/db1/colls/other").with_partition_range("0");
        unknown.set_header(headers::SESSION_TOKEN, "stale".to_string());
        container.apply_session_token(&mut unknown);
        assert_eq!(unknown.header(headers::SESSION_TOKEN), None);
    }

    #[test]
    fn test_concurrent_merges_never_lose_progress() {
        let container = SessionContainer::new();
        let threads = 8u32;
        let per_thread = 200u64;

        std::thread::scope(|scope| {
            for region in 0..threads {
                let container = &container;
                scope.spawn(move || {
                    for lsn in 1..=per_thread {
                        let t = SessionToken::new(1, lsn, [(region, lsn), (100, lsn * region as u64)]);
                        container.merge_token(rid(), "0", t);
                        // Interleave writes to a neighbouring partition.
                        container.merge_token(rid(), "1", SessionToken::new(1, lsn, []));
                    }
                });
            }
        });

        let resolved = container
            .resolve_token(CollectionRef::ResourceId(&rid().to_string()), "0", &[])
            .unwrap();

        assert_eq!(resolved.global_lsn(), per_thread);
        for region in 0..threads {
            assert_eq!(resolved.region_lsn(region), Some(per_thread));
        }
        assert_eq!(resolved.region_lsn(100), Some(per_thread * (threads as u64 - 1)));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn set_token_in_any_order_holds_the_merge_of_all(
            (tokens, shuffled) in proptest::collection::vec(token_strategy(), 1..8)
                .prop_flat_map(|tokens| (Just(tokens.clone()), Just(tokens).prop_shuffle()))
        ) {
            let container = SessionContainer::new();
            let request = DocumentRequest::by_name(COLLECTION);

            std::thread::scope(|scope| {
                for t in &shuffled {
                    let container = &container;
                    let request = &request;
                    scope.spawn(move || container.set_token(request, &response(&format!("0:{}", t))));
                }
            });

            let expected = tokens[1..].iter().fold(tokens[0].clone(), |acc, t| acc.merge(t));
            prop_assert_eq!(
                container.resolve_token(CollectionRef::Name(COLLECTION), "0", &[]),
                Some(expected)
            );
        }
    }
}
