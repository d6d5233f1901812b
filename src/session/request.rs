//! Request/response abstraction consumed by the session container.
//!
//! The transport pipeline is outside this crate; it only has to expose
//! headers and the partition routing decided for a request.

use std::collections::HashMap;

/// How a request addresses its collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionRef<'a> {
    /// Name-based addressing, e.g. `dbs/db1/colls/orders`.
    Name(&'a str),
    /// Resource-id addressing with the service's base64 collection id.
    ResourceId(&'a str),
}

/// Outgoing request as seen by the session container.
pub trait SessionRequest {
    /// Read a request header.
    fn header(&self, name: &str) -> Option<&str>;

    /// Set a request header, replacing any previous value.
    fn set_header(&mut self, name: &str, value: String);

    /// Remove a request header.
    fn remove_header(&mut self, name: &str);

    /// The collection this request targets.
    fn collection(&self) -> CollectionRef<'_>;

    /// Partition key range the request was routed to, if resolved.
    fn resolved_partition_range(&self) -> Option<&str>;

    /// Ancestor lineage of the resolved range, most specific first.
    ///
    /// May start with the resolved range itself.
    fn partition_lineage(&self) -> &[String];
}

/// Response as seen by the session container.
pub trait SessionResponse {
    /// Read a response header.
    fn header(&self, name: &str) -> Option<&str>;
}

/// Case-insensitive header map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: HashMap<String, String>,
}

impl HeaderMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a header value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Insert or replace a header value.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Remove a header, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(&name.to_ascii_lowercase())
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Minimal request carrying routing context and headers.
#[derive(Debug, Clone)]
pub struct DocumentRequest {
    collection: String,
    is_name_based: bool,
    resolved_range: Option<String>,
    lineage: Vec<String>,
    headers: HeaderMap,
}

impl DocumentRequest {
    /// Request addressing the collection by full name.
    pub fn by_name(full_name: impl Into<String>) -> Self {
        Self::new(full_name.into(), true)
    }

    /// Request addressing the collection by resource id.
    pub fn by_resource_id(rid: impl Into<String>) -> Self {
        Self::new(rid.into(), false)
    }

    fn new(collection: String, is_name_based: bool) -> Self {
        Self {
            collection,
            is_name_based,
            resolved_range: None,
            lineage: Vec::new(),
            headers: HeaderMap::new(),
        }
    }

    /// Set the resolved partition key range.
    pub fn with_partition_range(mut self, range_id: impl Into<String>) -> Self {
        self.resolved_range = Some(range_id.into());
        self
    }

    /// Set the ancestor lineage of the resolved range.
    pub fn with_lineage(mut self, lineage: Vec<String>) -> Self {
        self.lineage = lineage;
        self
    }

    /// Headers of this request.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl SessionRequest for DocumentRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    fn set_header(&mut self, name: &str, value: String) {
        self.headers.insert(name, value);
    }

    fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
    }

    fn collection(&self) -> CollectionRef<'_> {
        if self.is_name_based {
            CollectionRef::Name(&self.collection)
        } else {
            CollectionRef::ResourceId(&self.collection)
        }
    }

    fn resolved_partition_range(&self) -> Option<&str> {
        self.resolved_range.as_deref()
    }

    fn partition_lineage(&self) -> &[String] {
        &self.lineage
    }
}

/// Minimal response wrapper over a header map.
#[derive(Debug, Clone, Default)]
pub struct DocumentResponse {
    headers: HeaderMap,
}

impl DocumentResponse {
    /// Create a response with no headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }
}

impl SessionResponse for DocumentResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}
