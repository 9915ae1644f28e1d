//! # Domain Types for Chronicles
//!
//! This module defines the entry model and the request/response shapes the
//! HTTP boundary binds to. Field names on the serde types are the external
//! contract and must not change.
//!
//! ## Entry Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ Entry                                                           │
//! │                                                                 │
//! │  id ─────────────── generated, sortable, unique forever         │
//! │  created_at ─────── gateway clock (+ batch offset)               │
//! │  ip_addr, user_agent ── transport layer, opaque                 │
//! │  namespace, client_event_type ── caller, non-empty              │
//! │  user_id ────────── derived from keycloak_id or client_id       │
//! │  client_event_id, client_flow_id, client_flow_type,             │
//! │  client_session_id ── caller, optional, verbatim                │
//! │  data ───────────── caller, optional, valid JSON                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Invariants
//!
//! - [`EntryId`]: assigned once, never reassigned, string order ≈ creation order
//! - `user_id` starts with [`CLIENT_USER_ID_PREFIX`] iff it came from `client_id`
//! - `namespace` and `client_event_type` are never empty once committed

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Prefix marking a `user_id` derived from a self-declared client identity.
///
/// Verified identities are assumed never to start with this prefix; that is a
/// contract with the identity provider, not something enforced here.
pub const CLIENT_USER_ID_PREFIX: &str = "client:";

/// Number of entries a scan returns when the request does not set a limit.
pub const DEFAULT_SCAN_LIMIT: usize = 500;

// =============================================================================
// Entry Identification
// =============================================================================

/// The identifier of an entry in the log.
///
/// Ids are 26-character Crockford base32 strings produced by
/// [`IdGenerator`](crate::id::IdGenerator). Comparing two ids as strings
/// reproduces their creation order (see the `id` module for the exact
/// guarantee under concurrency).
///
/// # Example
///
/// ```rust
/// use chronicles::EntryId;
///
/// let a = EntryId::new("01ARZ3NDEKTSV4RRFFQ69G5FAV");
/// let b = EntryId::new("01ARZ3NDEKTSV4RRFFQ69G5FAW");
/// assert!(a < b);
/// assert_eq!(a.timestamp_ms(), Some(1_469_922_850_259));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(String);

impl EntryId {
    /// Wraps an existing id string (e.g. one read back from the store).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the id and returns the inner string.
    pub fn into_string(self) -> String {
        self.0
    }

    /// Decodes the creation timestamp (Unix milliseconds) embedded in the id.
    ///
    /// Returns `None` if the string is not a well-formed id.
    pub fn timestamp_ms(&self) -> Option<u64> {
        crate::id::decode_timestamp_ms(&self.0)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Entry
// =============================================================================

/// One immutable, persisted event record.
///
/// `data` holds the raw JSON text exactly as it was accepted; it is embedded
/// back into responses as JSON, not as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub created_at: DateTime<Utc>,
    pub ip_addr: String,
    pub user_agent: String,
    pub namespace: String,
    pub client_event_id: Option<String>,
    pub client_event_type: String,
    pub client_flow_id: Option<String>,
    pub client_flow_type: Option<String>,
    pub client_session_id: Option<String>,
    pub user_id: String,
    #[serde(default, with = "raw_json")]
    pub data: Option<String>,
}

impl Entry {
    /// Returns true if this entry's `user_id` came from a self-declared client id.
    pub fn is_client_identity(&self) -> bool {
        self.user_id.starts_with(CLIENT_USER_ID_PREFIX)
    }
}

// =============================================================================
// Append Requests
// =============================================================================

/// A single event submitted by a caller.
///
/// Exactly one of `keycloak_id` (verified identity) and `client_id`
/// (self-declared identity) must be non-empty. See
/// [`identity::normalize`](crate::identity::normalize) for the full rules.
///
/// # Example
///
/// ```rust
/// use chronicles::AppendRequest;
///
/// let request = AppendRequest::new("ns1", "click")
///     .with_client_id("abc")
///     .with_data(r#"{"x": 1}"#);
/// assert_eq!(request.client_id.as_deref(), Some("abc"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    #[serde(default)]
    pub keycloak_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub client_event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_event_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_flow_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "raw_json")]
    pub data: Option<String>,
}

impl AppendRequest {
    /// Creates a request with the two mandatory fields and no identity.
    pub fn new(namespace: impl Into<String>, client_event_type: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            client_event_type: client_event_type.into(),
            ..Self::default()
        }
    }

    /// Sets the verified identity.
    pub fn with_keycloak_id(mut self, id: impl Into<String>) -> Self {
        self.keycloak_id = Some(id.into());
        self
    }

    /// Sets the self-declared client identity.
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Sets the raw JSON payload. It is validated on append, not here.
    pub fn with_data(mut self, json: impl Into<String>) -> Self {
        self.data = Some(json.into());
        self
    }

    pub fn with_client_event_id(mut self, id: impl Into<String>) -> Self {
        self.client_event_id = Some(id.into());
        self
    }

    pub fn with_flow(mut self, flow_id: impl Into<String>, flow_type: impl Into<String>) -> Self {
        self.client_flow_id = Some(flow_id.into());
        self.client_flow_type = Some(flow_type.into());
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.client_session_id = Some(id.into());
        self
    }
}

/// Response to a single append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub id: EntryId,
}

/// One item of a batch: an append plus its offset from the batch anchor time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendOffsetRequest {
    pub append: AppendRequest,
    /// Milliseconds relative to "now"; negative values backdate the event.
    #[serde(default)]
    pub offset: i64,
}

impl AppendOffsetRequest {
    pub fn new(offset: i64, append: AppendRequest) -> Self {
        Self { append, offset }
    }
}

/// A batch of appends sharing one anchor time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendsRequest {
    #[serde(default)]
    pub append_requests: Vec<AppendOffsetRequest>,
}

impl AppendsRequest {
    pub fn new(append_requests: Vec<AppendOffsetRequest>) -> Self {
        Self { append_requests }
    }
}

/// Response to a batch append; ids are in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendsResponse {
    pub ids: Vec<EntryId>,
}

// =============================================================================
// Scan Requests
// =============================================================================

/// Which kind of identity a scan should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityFilter {
    /// No filtering.
    #[default]
    Any,
    /// Only entries whose `user_id` came from `keycloak_id`.
    Verified,
    /// Only entries whose `user_id` came from `client_id`.
    Client,
}

impl From<Option<bool>> for IdentityFilter {
    fn from(keycloak: Option<bool>) -> Self {
        match keycloak {
            None => IdentityFilter::Any,
            Some(true) => IdentityFilter::Verified,
            Some(false) => IdentityFilter::Client,
        }
    }
}

/// A filtered, cursor-paginated forward scan.
///
/// Empty filter lists mean "no filter". All present filters are AND-combined.
///
/// # Example
///
/// ```rust
/// use chronicles::{IdentityFilter, ScanRequest};
///
/// let request = ScanRequest::default()
///     .after("01ARZ3NDEKTSV4RRFFQ69G5FAV")
///     .with_limit(100)
///     .with_namespaces(["web", "mobile"])
///     .with_identity(IdentityFilter::Client);
/// assert_eq!(request.keycloak, Some(false));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Cursor: only entries with an id strictly greater than this are returned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Maximum entries to return; `None` or `0` selects the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub event_types: Vec<String>,
    /// `true` selects verified identities, `false` client identities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keycloak: Option<bool>,
}

impl ScanRequest {
    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.id = Some(cursor.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_user_ids<I, S>(mut self, user_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.user_ids = user_ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = event_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_identity(mut self, filter: IdentityFilter) -> Self {
        self.keycloak = match filter {
            IdentityFilter::Any => None,
            IdentityFilter::Verified => Some(true),
            IdentityFilter::Client => Some(false),
        };
        self
    }

    /// The cursor, treating an empty string as "from the beginning".
    pub fn cursor(&self) -> Option<&str> {
        self.id.as_deref().filter(|c| !c.is_empty())
    }

    /// The typed identity filter for this request.
    pub fn identity_filter(&self) -> IdentityFilter {
        IdentityFilter::from(self.keycloak)
    }

    /// The effective limit, falling back to `default_limit` when unset or zero.
    pub fn effective_limit(&self, default_limit: usize) -> usize {
        match self.limit {
            Some(limit) if limit > 0 => limit,
            _ => default_limit,
        }
    }
}

/// Response to a scan. `entries` is empty, never absent, when nothing matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResponse {
    pub entries: Vec<Entry>,
}

// =============================================================================
// Request Context
// =============================================================================

/// Transport-level facts about the caller of an append.
///
/// The core treats `ip_addr` and `user_agent` as opaque strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub ip_addr: String,
    pub user_agent: String,
    /// Deadline for the store round trip; `None` uses the configured default.
    pub timeout: Option<Duration>,
}

impl RequestContext {
    pub fn new(ip_addr: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_addr: ip_addr.into(),
            user_agent: user_agent.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// =============================================================================
// Raw JSON (de)serialization
// =============================================================================

/// Keeps `data` as raw JSON text in memory while embedding it as a JSON value
/// on the wire.
mod raw_json {
    use serde::de::Deserializer;
    use serde::ser::{Error as _, Serializer};
    use serde::{Deserialize, Serialize};
    use serde_json::value::RawValue;

    pub fn serialize<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(text) => {
                let raw: &RawValue = serde_json::from_str(text).map_err(S::Error::custom)?;
                raw.serialize(serializer)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        let raw: Option<Box<RawValue>> = Option::deserialize(deserializer)?;
        Ok(raw.map(|r| r.get().to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
