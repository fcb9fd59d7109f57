//! Wire types for the inbound endpoint and the finalization callback.
//!
//! The inbound response and the callback payload are consumed by external
//! scoring systems that validate shapes strictly, so these structs are the
//! single source of truth for field names and nesting. In particular,
//! `totalMessagesExchanged` lives only inside `engagementMetrics`.

use serde::{Deserialize, Serialize};

/// Who authored a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Scammer,
    /// Some upstream platforms label our side "user"; accept both.
    #[serde(alias = "user")]
    Honeypot,
}

/// One conversation message as it appears on the wire and in session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub sender: Sender,
    pub text: String,
    /// Milliseconds since epoch, as sent by the platform.
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    pub fn scammer(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            sender: Sender::Scammer,
            text: text.into(),
            timestamp,
        }
    }

    pub fn honeypot(text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            sender: Sender::Honeypot,
            text: text.into(),
            timestamp,
        }
    }
}

/// Optional channel metadata attached to a request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelMetadata {
    pub channel: Option<String>,
    pub language: Option<String>,
    pub locale: Option<String>,
}

/// Body of `POST /api/honeypot/message`.
///
/// `conversation_history` is advisory only: the server's own history is
/// authoritative and the field is ignored beyond request validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoneypotRequest {
    pub session_id: String,
    pub message: Message,
    #[serde(default)]
    pub conversation_history: Vec<Message>,
    #[serde(default)]
    pub metadata: Option<ChannelMetadata>,
}

/// Success body of the inbound endpoint. Exactly these two fields; downstream
/// consumers reject extra keys.
#[derive(Debug, Clone, Serialize)]
pub struct HoneypotReply {
    pub status: &'static str,
    pub reply: String,
}

impl HoneypotReply {
    pub fn success(reply: String) -> Self {
        Self {
            status: "success",
            reply,
        }
    }
}

/// The six reportable artifact arrays of the finalization callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedIntelligence {
    pub phone_numbers: Vec<String>,
    pub bank_accounts: Vec<String>,
    pub upi_ids: Vec<String>,
    pub ifsc_codes: Vec<String>,
    pub phishing_links: Vec<String>,
    pub email_addresses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngagementMetrics {
    pub total_messages_exchanged: u32,
    pub engagement_duration_seconds: u64,
}

/// Finalization report POSTed to the configured callback URL and persisted
/// in the retry queue on delivery failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub session_id: String,
    /// "completed" for in-turn termination, "final" for the idle reaper.
    pub status: String,
    pub scam_detected: bool,
    pub extracted_intelligence: ExtractedIntelligence,
    pub engagement_metrics: EngagementMetrics,
    pub agent_notes: String,
}
