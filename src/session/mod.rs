//! Session consistency tracking.
//!
//! Every response may carry a session token header describing how far the
//! partition it touched has progressed. The [`SessionContainer`] merges those
//! tokens per partition and hands the latest one back to outgoing requests so
//! that reads observe the client's own writes.
//!
//! ```text
//!   response ── x-ms-session-token ──► SessionContainer::set_token
//!                                          │ merge per (rid, range)
//!                                          ▼
//!   request  ◄─ x-ms-session-token ─── SessionContainer::apply_session_token
//!                                          (falls back along range lineage)
//! ```

mod container;
mod request;
mod resource_id;
mod token;

pub use container::SessionContainer;
pub use request::{
    CollectionRef, DocumentRequest, DocumentResponse, HeaderMap, SessionRequest, SessionResponse,
};
pub use resource_id::ResourceId;
pub use token::{RegionId, SessionToken};
