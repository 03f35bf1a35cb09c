use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONTRACT_VERSION: u64 = 1;

/// Actor as resolved by the gateway adapter. The core never fetches or
/// re-resolves platform members; `role_ids` are the actor's roles in the
/// server the surrounding operation is scoped to (the origin server for
/// external filings, the organization server for everything else).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorDescriptor {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_owner: bool,
    #[serde(default)]
    pub role_ids: Vec<String>,
}

impl ActorDescriptor {
    pub fn holds_role(&self, role_id: &str) -> bool {
        self.role_ids.iter().any(|r| r == role_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Responding,
    Concluded,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Responding => "responding",
            RequestStatus::Concluded => "concluded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RequestStatus::Pending),
            "responding" => Some(RequestStatus::Responding),
            "concluded" => Some(RequestStatus::Concluded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MessageRef {
    pub channel_id: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Responder {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Conclusion {
    pub reason: String,
    pub concluded_by_id: String,
    pub concluded_by_name: String,
    pub concluded_at: String,
}

/// The central ledger entity. `status` only ever moves forward; the
/// conclusion fields are populated in one step on the transition into
/// `concluded` and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecurityRequest {
    pub request_id: String,
    pub external: bool,
    pub requester_id: String,
    pub requester_name: String,
    pub location: String,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub external_guild_id: Option<String>,
    #[serde(default)]
    pub origin_message: Option<MessageRef>,
    #[serde(default)]
    pub organization_message: Option<MessageRef>,
    pub status: RequestStatus,
    #[serde(default)]
    pub responders: Vec<Responder>,
    #[serde(default)]
    pub conclusion: Option<Conclusion>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrgSettings {
    pub guild_id: String,
    #[serde(default)]
    pub manager_role_id: Option<String>,
    #[serde(default)]
    pub customer_role_id: Option<String>,
    #[serde(default)]
    pub security_role_id: Option<String>,
    #[serde(default)]
    pub alert_channel_id: Option<String>,
    #[serde(default)]
    pub blacklist_role_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Registration {
    pub guild_id: String,
    pub guild_name: String,
    pub channel_id: String,
    pub active: bool,
    pub blacklisted: bool,
    #[serde(default)]
    pub blacklist_reason: Option<String>,
    pub last_accessed_at: String,
    #[serde(default)]
    pub allowed_role_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InternalRequestInput {
    pub v: u64,
    pub request_id: String,
    pub actor: ActorDescriptor,
    pub location: String,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalRequestInput {
    pub v: u64,
    pub request_id: String,
    pub actor: ActorDescriptor,
    pub origin_guild_id: String,
    pub origin_channel_id: String,
    pub location: String,
    pub details: String,
    pub contact: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InteractionInput {
    pub v: u64,
    pub control_id: String,
    pub actor: ActorDescriptor,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptSubmissionInput {
    pub v: u64,
    pub control_id: String,
    pub actor: ActorDescriptor,
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterServerInput {
    pub v: u64,
    pub actor: ActorDescriptor,
    pub guild_id: String,
    pub guild_name: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlacklistInput {
    pub v: u64,
    pub actor: ActorDescriptor,
    pub guild_id: String,
    pub blacklisted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllowedRolesOp {
    Set,
    Add,
    Remove,
    Clear,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllowedRolesInput {
    pub v: u64,
    pub actor: ActorDescriptor,
    pub guild_id: String,
    pub op: AllowedRolesOp,
    #[serde(default)]
    pub role_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsInput {
    pub v: u64,
    pub actor: ActorDescriptor,
    pub guild_id: String,
    #[serde(default)]
    pub manager_role_id: Option<String>,
    #[serde(default)]
    pub customer_role_id: Option<String>,
    #[serde(default)]
    pub security_role_id: Option<String>,
    #[serde(default)]
    pub alert_channel_id: Option<String>,
    #[serde(default)]
    pub blacklist_role_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Rejected,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PromptSpec {
    pub control_id: String,
    pub title: String,
    pub field_label: String,
}

/// Typed result of every command-surface operation. The adapter translates
/// `reason_code` into user-facing text. Rejections carry no partial state;
/// degraded outcomes mean the ledger committed but a view write failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub v: u64,
    pub status: OutcomeStatus,
    pub reason_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ActionOutcome {
    fn new(status: OutcomeStatus, reason_code: &str) -> Self {
        Self {
            v: CONTRACT_VERSION,
            status,
            reason_code: reason_code.to_string(),
            request_id: None,
            prompt: None,
            detail: None,
        }
    }

    pub fn completed(reason_code: &str) -> Self {
        Self::new(OutcomeStatus::Completed, reason_code)
    }

    pub fn rejected(reason_code: &str) -> Self {
        Self::new(OutcomeStatus::Rejected, reason_code)
    }

    pub fn degraded(reason_code: &str) -> Self {
        Self::new(OutcomeStatus::Degraded, reason_code)
    }

    pub fn with_request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn with_prompt(mut self, prompt: PromptSpec) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Responding,
            RequestStatus::Concluded,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::parse("open"), None);
    }

    #[test]
    fn inbound_payloads_reject_unknown_fields() {
        let raw = r#"{
            "v": 1,
            "control_id": "respond_r1",
            "actor": {"id": "u1", "display_name": "U"},
            "extra": true
        }"#;
        assert!(serde_json::from_str::<InteractionInput>(raw).is_err());
    }

    #[test]
    fn outcome_omits_empty_optionals() {
        let outcome = ActionOutcome::rejected("registry_missing");
        let value = serde_json::to_value(&outcome).expect("serialize outcome");
        assert!(value.get("request_id").is_none());
        assert!(value.get("prompt").is_none());
        assert_eq!(value["status"], "rejected");
    }
}
