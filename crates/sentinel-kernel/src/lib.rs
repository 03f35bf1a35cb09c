use chrono::{DateTime, Duration, SecondsFormat, Utc};
use sentinel_contracts::{ActorDescriptor, OrgSettings, Registration, RequestStatus, SecurityRequest};
use serde_json::{json, Value};

pub const COLOR_PENDING: u32 = 0x00E6_7E22;
pub const COLOR_RESPONDING: u32 = 0x0034_98DB;
pub const COLOR_CONCLUDED: u32 = 0x002E_CC71;

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

/// Fixed-width timestamp form; lexicographic order equals chronological
/// order, which the sqlite store relies on for the idle sweep.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn idle_cutoff(now: DateTime<Utc>, threshold_days: u32) -> DateTime<Utc> {
    now - Duration::days(i64::from(threshold_days))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Respond,
    Conclude,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlAction::Respond => "respond",
            ControlAction::Conclude => "conclude",
        }
    }
}

/// Parsed form of an action-control identifier. The wire encoding stays
/// positional (`respond_{requestId}` or `respond_{requestId}_{guildId}`)
/// for compatibility with already-rendered controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRef {
    pub action: ControlAction,
    pub request_id: String,
    pub external_guild_id: Option<String>,
}

pub fn encode_control(
    action: ControlAction,
    request_id: &str,
    external_guild_id: Option<&str>,
) -> String {
    match external_guild_id {
        Some(guild) => format!("{}_{request_id}_{guild}", action.as_str()),
        None => format!("{}_{request_id}", action.as_str()),
    }
}

/// A wrong field count, an unknown action kind, or an empty positional
/// field is malformed; the caller rejects rather than guesses.
pub fn parse_control(raw: &str) -> Option<ControlRef> {
    let fields: Vec<&str> = raw.split('_').collect();
    if fields.len() != 2 && fields.len() != 3 {
        return None;
    }
    let action = match fields[0] {
        "respond" => ControlAction::Respond,
        "conclude" => ControlAction::Conclude,
        _ => return None,
    };
    if fields[1].is_empty() {
        return None;
    }
    let external_guild_id = match fields.get(2) {
        Some(guild) if guild.is_empty() => return None,
        Some(guild) => Some((*guild).to_string()),
        None => None,
    };
    Some(ControlRef {
        action,
        request_id: fields[1].to_string(),
        external_guild_id,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Deny { reason_code: &'static str },
}

/// External-filing gate, checked in order; each failure is a distinct
/// rejection reason and nothing is mutated before all checks pass.
pub fn evaluate_external_gate(
    registration: Option<&Registration>,
    origin_channel_id: &str,
    actor: &ActorDescriptor,
) -> GateDecision {
    let registration = match registration {
        Some(v) => v,
        None => {
            return GateDecision::Deny {
                reason_code: "registry_missing",
            }
        }
    };
    if registration.blacklisted {
        return GateDecision::Deny {
            reason_code: "registry_blacklisted",
        };
    }
    if registration.channel_id != origin_channel_id {
        return GateDecision::Deny {
            reason_code: "channel_mismatch",
        };
    }
    if !registration.allowed_role_ids.is_empty()
        && !registration
            .allowed_role_ids
            .iter()
            .any(|role| actor.holds_role(role))
    {
        return GateDecision::Deny {
            reason_code: "role_not_allowed",
        };
    }
    GateDecision::Allow
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertRoute {
    pub alert_channel_id: String,
    pub security_role_id: String,
}

/// The organization-side route every filing needs. Absence of either field
/// is a configuration precondition failure, never a default.
pub fn resolve_alert_route(settings: Option<&OrgSettings>) -> Result<AlertRoute, &'static str> {
    let settings = settings.ok_or("settings_missing")?;
    let alert_channel_id = settings
        .alert_channel_id
        .clone()
        .ok_or("settings_alert_channel_unset")?;
    let security_role_id = settings
        .security_role_id
        .clone()
        .ok_or("settings_security_role_unset")?;
    Ok(AlertRoute {
        alert_channel_id,
        security_role_id,
    })
}

pub fn evaluate_internal_gate(
    settings: Option<&OrgSettings>,
    actor: &ActorDescriptor,
) -> Result<AlertRoute, &'static str> {
    let customer_role = settings
        .ok_or("settings_missing")?
        .customer_role_id
        .clone()
        .ok_or("settings_customer_role_unset")?;
    let route = resolve_alert_route(settings)?;
    if !actor.holds_role(&customer_role) {
        return Err("role_customer_required");
    }
    Ok(route)
}

/// Respond/conclude authorization: always resolved against the organization
/// server's security role, regardless of where the request originated.
pub fn evaluate_security_actor(
    settings: Option<&OrgSettings>,
    actor: &ActorDescriptor,
) -> Result<(), &'static str> {
    let security_role = settings
        .ok_or("settings_missing")?
        .security_role_id
        .clone()
        .ok_or("settings_security_role_unset")?;
    if !actor.holds_role(&security_role) {
        return Err("role_security_required");
    }
    Ok(())
}

pub fn is_manager(
    actor: &ActorDescriptor,
    settings: Option<&OrgSettings>,
    override_user_id: Option<&str>,
) -> bool {
    if actor.is_admin || override_user_id == Some(actor.id.as_str()) {
        return true;
    }
    settings
        .and_then(|s| s.manager_role_id.as_deref())
        .map(|role| actor.holds_role(role))
        .unwrap_or(false)
}

pub fn can_blacklist(
    actor: &ActorDescriptor,
    settings: Option<&OrgSettings>,
    override_user_id: Option<&str>,
) -> bool {
    if actor.is_owner || override_user_id == Some(actor.id.as_str()) {
        return true;
    }
    settings
        .and_then(|s| s.blacklist_role_id.as_deref())
        .map(|role| actor.holds_role(role))
        .unwrap_or(false)
}

fn status_color(status: RequestStatus) -> u32 {
    match status {
        RequestStatus::Pending => COLOR_PENDING,
        RequestStatus::Responding => COLOR_RESPONDING,
        RequestStatus::Concluded => COLOR_CONCLUDED,
    }
}

fn responder_names(request: &SecurityRequest) -> String {
    request
        .responders
        .iter()
        .map(|r| r.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Organization alert view. Doubles as the single rendered view for
/// internal requests; carries the Respond/Conclude controls until the
/// request is concluded, after which no further actions are possible.
pub fn alert_view(request: &SecurityRequest) -> Value {
    let title = if request.external {
        match request.status {
            RequestStatus::Concluded => "External security request (concluded)",
            _ => "External security request",
        }
    } else {
        match request.status {
            RequestStatus::Concluded => "Security request (concluded)",
            _ => "Security request",
        }
    };

    let mut fields = vec![
        json!({"name": "Requester", "value": request.requester_name}),
        json!({"name": "Location", "value": request.location}),
    ];
    if let Some(details) = &request.details {
        fields.push(json!({"name": "Details", "value": details}));
    }
    if let Some(contact) = &request.contact {
        fields.push(json!({"name": "Contact", "value": contact}));
    }
    if let Some(guild) = &request.external_guild_id {
        fields.push(json!({"name": "Origin server", "value": guild}));
    }
    fields.push(json!({
        "name": "Responders",
        "value": if request.responders.is_empty() {
            "None yet".to_string()
        } else {
            responder_names(request)
        },
    }));
    if let Some(conclusion) = &request.conclusion {
        fields.push(json!({"name": "Concluded by", "value": conclusion.concluded_by_name}));
        fields.push(json!({"name": "Reason", "value": conclusion.reason}));
        fields.push(json!({"name": "Concluded at", "value": conclusion.concluded_at}));
    }

    let controls = if request.status == RequestStatus::Concluded {
        vec![]
    } else {
        let guild = request.external_guild_id.as_deref();
        vec![
            json!({
                "id": encode_control(ControlAction::Respond, &request.request_id, guild),
                "label": "Respond",
            }),
            json!({
                "id": encode_control(ControlAction::Conclude, &request.request_id, guild),
                "label": "Conclude",
            }),
        ]
    };

    json!({
        "title": title,
        "color": status_color(request.status),
        "fields": fields,
        "controls": controls,
    })
}

/// Origin-server confirmation view for external requests. The status line
/// is the only part that changes as personnel respond and conclude.
pub fn origin_view(request: &SecurityRequest) -> Value {
    let status_line = match (&request.conclusion, request.responders.is_empty()) {
        (Some(conclusion), _) => format!(
            "Concluded by {}: {}",
            conclusion.concluded_by_name, conclusion.reason
        ),
        (None, true) => "Awaiting response".to_string(),
        (None, false) => format!("Responded by: {}", responder_names(request)),
    };

    let mut fields = vec![json!({"name": "Location", "value": request.location})];
    if let Some(details) = &request.details {
        fields.push(json!({"name": "Details", "value": details}));
    }

    json!({
        "title": "Security request received",
        "color": status_color(request.status),
        "status_line": status_line,
        "fields": fields,
        "controls": [],
    })
}

pub fn update_notice_view(running: &str, latest: &str) -> Value {
    json!({
        "title": "Update available",
        "color": COLOR_PENDING,
        "status_line": format!("Version {latest} is available (running {running})"),
        "fields": [],
        "controls": [],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_contracts::{Conclusion, Responder};

    fn actor(roles: &[&str]) -> ActorDescriptor {
        ActorDescriptor {
            id: "u1".to_string(),
            display_name: "User One".to_string(),
            is_admin: false,
            is_owner: false,
            role_ids: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    fn registration() -> Registration {
        Registration {
            guild_id: "g1".to_string(),
            guild_name: "Guild One".to_string(),
            channel_id: "c1".to_string(),
            active: true,
            blacklisted: false,
            blacklist_reason: None,
            last_accessed_at: "2026-01-01T00:00:00.000Z".to_string(),
            allowed_role_ids: vec![],
        }
    }

    fn settings() -> OrgSettings {
        OrgSettings {
            guild_id: "org".to_string(),
            manager_role_id: Some("mgr".to_string()),
            customer_role_id: Some("cust".to_string()),
            security_role_id: Some("sec".to_string()),
            alert_channel_id: Some("alerts".to_string()),
            blacklist_role_id: Some("bl".to_string()),
        }
    }

    fn request(status: RequestStatus) -> SecurityRequest {
        SecurityRequest {
            request_id: "r1".to_string(),
            external: true,
            requester_id: "u1".to_string(),
            requester_name: "User One".to_string(),
            location: "Lobby".to_string(),
            details: Some("door alarm".to_string()),
            contact: Some("radio 3".to_string()),
            external_guild_id: Some("g1".to_string()),
            origin_message: None,
            organization_message: None,
            status,
            responders: vec![],
            conclusion: None,
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn control_round_trip_internal_and_external() {
        let internal = encode_control(ControlAction::Respond, "r1", None);
        assert_eq!(internal, "respond_r1");
        assert_eq!(
            parse_control(&internal),
            Some(ControlRef {
                action: ControlAction::Respond,
                request_id: "r1".to_string(),
                external_guild_id: None,
            })
        );

        let external = encode_control(ControlAction::Conclude, "r1", Some("g1"));
        assert_eq!(external, "conclude_r1_g1");
        assert_eq!(
            parse_control(&external),
            Some(ControlRef {
                action: ControlAction::Conclude,
                request_id: "r1".to_string(),
                external_guild_id: Some("g1".to_string()),
            })
        );
    }

    #[test]
    fn control_parse_rejects_malformed_identifiers() {
        for raw in [
            "respond",
            "respond_",
            "respond_r1_",
            "respond_r1_g1_extra",
            "escalate_r1",
            "_r1",
        ] {
            assert_eq!(parse_control(raw), None, "{raw} should be malformed");
        }
    }

    #[test]
    fn external_gate_checks_in_order() {
        let filer = actor(&[]);
        assert_eq!(
            evaluate_external_gate(None, "c1", &filer),
            GateDecision::Deny {
                reason_code: "registry_missing"
            }
        );

        let mut reg = registration();
        reg.blacklisted = true;
        // Blacklist outranks the channel check even when both would fail.
        assert_eq!(
            evaluate_external_gate(Some(&reg), "other", &filer),
            GateDecision::Deny {
                reason_code: "registry_blacklisted"
            }
        );

        let reg = registration();
        assert_eq!(
            evaluate_external_gate(Some(&reg), "other", &filer),
            GateDecision::Deny {
                reason_code: "channel_mismatch"
            }
        );

        let mut reg = registration();
        reg.allowed_role_ids = vec!["trusted".to_string()];
        assert_eq!(
            evaluate_external_gate(Some(&reg), "c1", &filer),
            GateDecision::Deny {
                reason_code: "role_not_allowed"
            }
        );
        assert_eq!(
            evaluate_external_gate(Some(&reg), "c1", &actor(&["trusted"])),
            GateDecision::Allow
        );
    }

    #[test]
    fn empty_allow_list_is_unrestricted() {
        let reg = registration();
        assert_eq!(
            evaluate_external_gate(Some(&reg), "c1", &actor(&[])),
            GateDecision::Allow
        );
    }

    #[test]
    fn internal_gate_requires_configuration_then_role() {
        assert_eq!(evaluate_internal_gate(None, &actor(&[])), Err("settings_missing"));

        let mut s = settings();
        s.customer_role_id = None;
        assert_eq!(
            evaluate_internal_gate(Some(&s), &actor(&[])),
            Err("settings_customer_role_unset")
        );

        let mut s = settings();
        s.alert_channel_id = None;
        assert_eq!(
            evaluate_internal_gate(Some(&s), &actor(&["cust"])),
            Err("settings_alert_channel_unset")
        );

        let s = settings();
        assert_eq!(
            evaluate_internal_gate(Some(&s), &actor(&[])),
            Err("role_customer_required")
        );
        let route = evaluate_internal_gate(Some(&s), &actor(&["cust"])).expect("route");
        assert_eq!(route.alert_channel_id, "alerts");
        assert_eq!(route.security_role_id, "sec");
    }

    #[test]
    fn security_actor_check_is_org_scoped() {
        let s = settings();
        assert_eq!(evaluate_security_actor(Some(&s), &actor(&["sec"])), Ok(()));
        assert_eq!(
            evaluate_security_actor(Some(&s), &actor(&["cust"])),
            Err("role_security_required")
        );
        let mut s = settings();
        s.security_role_id = None;
        assert_eq!(
            evaluate_security_actor(Some(&s), &actor(&["sec"])),
            Err("settings_security_role_unset")
        );
    }

    #[test]
    fn manager_check_falls_back_to_admin_and_override() {
        let s = settings();
        assert!(is_manager(&actor(&["mgr"]), Some(&s), None));
        assert!(!is_manager(&actor(&[]), Some(&s), None));

        let mut admin = actor(&[]);
        admin.is_admin = true;
        assert!(is_manager(&admin, None, None));
        assert!(is_manager(&actor(&[]), None, Some("u1")));
        assert!(!is_manager(&actor(&[]), None, Some("someone-else")));
    }

    #[test]
    fn blacklist_check_honors_owner_and_role() {
        let s = settings();
        let mut owner = actor(&[]);
        owner.is_owner = true;
        assert!(can_blacklist(&owner, None, None));
        assert!(can_blacklist(&actor(&["bl"]), Some(&s), None));
        assert!(!can_blacklist(&actor(&["mgr"]), Some(&s), None));
    }

    #[test]
    fn idle_cutoff_is_strictly_days_back() {
        let now = parse_rfc3339("2026-01-31T12:00:00Z").expect("parse now");
        let cutoff = idle_cutoff(now, 30);
        assert_eq!(format_ts(cutoff), "2026-01-01T12:00:00.000Z");
    }

    #[test]
    fn alert_view_carries_controls_until_concluded() {
        let req = request(RequestStatus::Pending);
        let view = alert_view(&req);
        let controls = view["controls"].as_array().expect("controls");
        assert_eq!(controls.len(), 2);
        assert_eq!(controls[0]["id"], "respond_r1_g1");
        assert_eq!(controls[1]["id"], "conclude_r1_g1");
        assert_eq!(view["color"], COLOR_PENDING);

        let mut req = request(RequestStatus::Concluded);
        req.conclusion = Some(Conclusion {
            reason: "resolved".to_string(),
            concluded_by_id: "s1".to_string(),
            concluded_by_name: "Sec One".to_string(),
            concluded_at: "2026-01-02T00:00:00.000Z".to_string(),
        });
        let view = alert_view(&req);
        assert!(view["controls"].as_array().expect("controls").is_empty());
        assert_eq!(view["color"], COLOR_CONCLUDED);
    }

    #[test]
    fn origin_view_status_line_tracks_lifecycle() {
        let req = request(RequestStatus::Pending);
        assert_eq!(origin_view(&req)["status_line"], "Awaiting response");

        let mut req = request(RequestStatus::Responding);
        req.responders = vec![
            Responder {
                id: "s1".to_string(),
                name: "Sec One".to_string(),
            },
            Responder {
                id: "s2".to_string(),
                name: "Sec Two".to_string(),
            },
        ];
        assert_eq!(
            origin_view(&req)["status_line"],
            "Responded by: Sec One, Sec Two"
        );

        let mut req = request(RequestStatus::Concluded);
        req.conclusion = Some(Conclusion {
            reason: "false alarm".to_string(),
            concluded_by_id: "s1".to_string(),
            concluded_by_name: "Sec One".to_string(),
            concluded_at: "2026-01-02T00:00:00.000Z".to_string(),
        });
        assert_eq!(
            origin_view(&req)["status_line"],
            "Concluded by Sec One: false alarm"
        );
    }
}
