//! Canonical notification records and the two-channel payload normalizer.
//!
//! ## Contract summary
//! - The REST history endpoint and the live push channel deliver the same
//!   logical events in different payload shapes (field names differ, the push
//!   shape may omit the server timestamp).
//! - [`normalize`] folds both into one record shape with one identity rule,
//!   so the merge store can deduplicate across channels.
//! - Identity: `id` (fetch) or `notification_id` (push), taken verbatim.
//!   When neither is present, a content address is derived from the payload
//!   so byte-equivalent deliveries still share an id.
//! - Normalization is pure; a payload that cannot be normalized yields a
//!   [`NormalizeError`] for the caller to drop and log. Nothing here crashes
//!   the ingestion pipeline.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as seconds since UNIX epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Enumerated categories of feed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    FriendRequest,
    Like,
    Comment,
    System,
    CoinTransferIn,
    CoinTransferOut,
}

impl NotificationKind {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "message" => Some(NotificationKind::Message),
            "friend_request" => Some(NotificationKind::FriendRequest),
            "like" => Some(NotificationKind::Like),
            "comment" => Some(NotificationKind::Comment),
            "system" => Some(NotificationKind::System),
            "coin_transfer_in" => Some(NotificationKind::CoinTransferIn),
            "coin_transfer_out" => Some(NotificationKind::CoinTransferOut),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Message => "message",
            NotificationKind::FriendRequest => "friend_request",
            NotificationKind::Like => "like",
            NotificationKind::Comment => "comment",
            NotificationKind::System => "system",
            NotificationKind::CoinTransferIn => "coin_transfer_in",
            NotificationKind::CoinTransferOut => "coin_transfer_out",
        }
    }

    /// Kinds whose notifications carry a resolvable subject.
    pub fn is_actionable(self) -> bool {
        matches!(self, NotificationKind::FriendRequest)
    }
}

/// Terminal outcome of a friend-request notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Unresolved,
    Accepted,
    Declined,
    Deleted,
}

impl Resolution {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "unresolved" => Some(Resolution::Unresolved),
            "accepted" => Some(Resolution::Accepted),
            "declined" => Some(Resolution::Declined),
            "deleted" => Some(Resolution::Deleted),
            _ => None,
        }
    }

    pub fn is_resolved(self) -> bool {
        !matches!(self, Resolution::Unresolved)
    }

    /// Forward-only merge: a terminal state is absorbing. The only legal
    /// transition is `unresolved` to one of the terminal states.
    pub fn advance(self, incoming: Resolution) -> Resolution {
        if self.is_resolved() {
            self
        } else {
            incoming
        }
    }
}

/// Which channel delivered a record. Diagnostic only, not part of identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Fetched,
    Pushed,
}

/// Status of a pending friendship, owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStatus {
    Pending,
    Accepted,
    Declined,
}

impl RelationshipStatus {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RelationshipStatus::Pending),
            "accepted" => Some(RelationshipStatus::Accepted),
            "declined" => Some(RelationshipStatus::Declined),
            _ => None,
        }
    }

    /// Forward-only merge, mirroring [`Resolution::advance`].
    pub fn advance(self, incoming: RelationshipStatus) -> RelationshipStatus {
        if matches!(self, RelationshipStatus::Pending) {
            incoming
        } else {
            self
        }
    }
}

/// The relationship record a friend-request notification points at.
///
/// Created only by the backend; the client mutates its status through the
/// resolver's accept/decline calls, never creates or deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RelationshipRequest {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub status: RelationshipStatus,
}

/// The canonical, deduplicated representation of one social event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NotificationRecord {
    /// Opaque identifier, stable across re-fetch and re-push of the same
    /// logical event.
    pub id: String,
    pub kind: NotificationKind,
    /// The entity the event refers to (e.g. the pending friendship id).
    /// Present only for kinds requiring resolution actions.
    pub subject_id: Option<String>,
    pub sender_id: Option<String>,
    pub text: String,
    /// Server-assigned timestamp in epoch seconds; the display ordering key.
    pub created_at: u64,
    pub read: bool,
    /// Only meaningful for `friend_request`; forward-only.
    pub resolution: Resolution,
    pub origin: Origin,
}

impl NotificationRecord {
    /// Whether accept/decline actions are still offered for this record.
    pub fn is_actionable(&self) -> bool {
        self.kind.is_actionable() && self.subject_id.is_some() && !self.resolution.is_resolved()
    }
}

/// A normalized delivery: the notification record plus the relationship row
/// a friend-request payload may embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEvent {
    pub record: NotificationRecord,
    pub request: Option<RelationshipRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeError {
    NotAnObject,
    MissingKind,
    UnknownKind(String),
    MissingContent,
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalizeError::NotAnObject => write!(f, "payload is not a JSON object"),
            NormalizeError::MissingKind => write!(f, "payload has no kind"),
            NormalizeError::UnknownKind(kind) => write!(f, "unknown event kind: {kind}"),
            NormalizeError::MissingContent => write!(f, "payload has no text content"),
        }
    }
}

impl std::error::Error for NormalizeError {}

/// A string-or-number field rendered as a string id.
fn opt_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Content-address fallback id for payloads that carry no identifier on
/// either channel: SHA-256 over the identifying fields, URL-safe base64.
fn derive_content_id(
    kind: NotificationKind,
    sender_id: Option<&str>,
    subject_id: Option<&str>,
    created_at: u64,
    text: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(sender_id.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(subject_id.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(created_at.to_be_bytes());
    hasher.update(text.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn parse_request(value: Option<&Value>) -> Option<RelationshipRequest> {
    let obj = value?.as_object()?;
    let id = opt_string(obj.get("id"))?;
    let sender_id = opt_string(obj.get("sender_id"))?;
    let receiver_id = opt_string(obj.get("receiver_id"))?;
    let status = obj
        .get("status")
        .and_then(Value::as_str)
        .and_then(RelationshipStatus::from_wire)
        .unwrap_or(RelationshipStatus::Pending);
    Some(RelationshipRequest {
        id,
        sender_id,
        receiver_id,
        status,
    })
}

/// Convert one raw payload from either channel into a [`NormalizedEvent`].
///
/// `received_at` substitutes for the server timestamp when the payload omits
/// one (the push shape may). Pure function; callers drop and log on error.
pub fn normalize(
    raw: &Value,
    origin: Origin,
    received_at: u64,
) -> Result<NormalizedEvent, NormalizeError> {
    let obj = raw.as_object().ok_or(NormalizeError::NotAnObject)?;

    let kind_str = obj
        .get("kind")
        .or_else(|| obj.get("type"))
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingKind)?;
    let kind = NotificationKind::from_wire(kind_str)
        .ok_or_else(|| NormalizeError::UnknownKind(kind_str.to_string()))?;

    let text = obj
        .get("text")
        .or_else(|| obj.get("body"))
        .and_then(Value::as_str)
        .ok_or(NormalizeError::MissingContent)?
        .to_string();

    let sender_id = opt_string(obj.get("sender_id"));
    let subject_id = opt_string(obj.get("subject_id").or_else(|| obj.get("request_id")));
    let created_at = obj
        .get("created_at")
        .or_else(|| obj.get("timestamp"))
        .and_then(Value::as_u64)
        .unwrap_or(received_at);
    let read = obj.get("read").and_then(Value::as_bool).unwrap_or(false);

    let request = parse_request(obj.get("request"));

    // A resolved request delivered by either channel marks the notification
    // itself resolved, whether stated directly or via the embedded row.
    let mut resolution = obj
        .get("resolution")
        .and_then(Value::as_str)
        .and_then(Resolution::from_wire)
        .unwrap_or(Resolution::Unresolved);
    if let Some(ref req) = request {
        resolution = resolution.advance(match req.status {
            RelationshipStatus::Pending => Resolution::Unresolved,
            RelationshipStatus::Accepted => Resolution::Accepted,
            RelationshipStatus::Declined => Resolution::Declined,
        });
    }

    let id = opt_string(obj.get("id").or_else(|| obj.get("notification_id")))
        .unwrap_or_else(|| {
            derive_content_id(
                kind,
                sender_id.as_deref(),
                subject_id.as_deref(),
                created_at,
                &text,
            )
        });

    Ok(NormalizedEvent {
        record: NotificationRecord {
            id,
            kind,
            subject_id,
            sender_id,
            text,
            created_at,
            read,
            resolution,
            origin,
        },
        request,
    })
}
