use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use reqwest::Client;
use rusqlite::{params, Connection, OptionalExtension};
use sentinel_config::Config;
use sentinel_contracts::{
    ActionOutcome, ActorDescriptor, AllowedRolesInput, AllowedRolesOp, BlacklistInput, Conclusion,
    ExternalRequestInput, InteractionInput, InternalRequestInput, MessageRef, OrgSettings,
    OutcomeStatus, PromptSpec, PromptSubmissionInput, RegisterServerInput, Registration,
    RequestStatus, Responder, SecurityRequest, SettingsInput, CONTRACT_VERSION,
};
use sentinel_kernel::{
    alert_view, can_blacklist, evaluate_external_gate, evaluate_internal_gate,
    evaluate_security_actor, format_ts, idle_cutoff, is_manager, origin_view, parse_control,
    resolve_alert_route, update_notice_view, ControlAction, ControlRef, GateDecision,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::sleep;

const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let state = AppState::new(cfg).await?;
    spawn_housekeeping(&state);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

/// Router without the housekeeping tasks; integration tests drive this.
pub async fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg).await?;
    Ok(router(state))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/contracts", get(contracts))
        .route("/v1/requests/internal", post(requests_internal))
        .route("/v1/requests/external", post(requests_external))
        .route("/v1/requests/{request_id}", get(request_snapshot))
        .route("/v1/interactions", post(interactions))
        .route("/v1/interactions/submit", post(interactions_submit))
        .route("/v1/servers/register", post(servers_register))
        .route("/v1/servers/blacklist", post(servers_blacklist))
        .route("/v1/servers/allowed-roles", post(servers_allowed_roles))
        .route("/v1/servers/{guild_id}", get(server_summary))
        .route("/v1/settings", post(settings_upsert))
        .with_state(state)
}

fn spawn_housekeeping(state: &AppState) {
    let sweeper = state.clone();
    tokio::spawn(async move {
        sleep(Duration::from_secs(sweeper.cfg.sweeper.initial_delay_secs)).await;
        loop {
            if let Err(e) = sweeper.run_sweep().await {
                sweeper
                    .audit
                    .append(
                        AuditRecord::new(
                            &sweeper.cfg.organization.guild_id,
                            "sweep",
                            "activity_sweep",
                            "anomaly",
                            "sweep_failed",
                        )
                        .with_detail(json!({"error": e})),
                    )
                    .await;
            }
            sleep(Duration::from_secs(sweeper.cfg.sweeper.interval_secs)).await;
        }
    });

    if state.cfg.updates.enabled {
        let poller = state.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(poller.cfg.updates.poll_interval_secs)).await;
                if let Err(e) = poller.poll_updates().await {
                    poller
                        .audit
                        .append(
                            AuditRecord::new(
                                &poller.cfg.organization.guild_id,
                                "updates",
                                "update_poll",
                                "anomaly",
                                "update_poll_failed",
                            )
                            .with_detail(json!({"error": e})),
                        )
                        .await;
                }
            }
        });
    }
}

#[derive(Clone)]
struct AppState {
    cfg: Config,
    store: Arc<Mutex<StoreBackend>>,
    audit: Arc<AuditJsonl>,
    platform: Arc<RenderClient>,
}

impl AppState {
    async fn new(cfg: Config) -> Result<Self, String> {
        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            StoreBackend::Sqlite(SqliteStore::new(&sqlite_path)?)
        } else {
            StoreBackend::Memory(MemoryStore::default())
        };
        Ok(Self {
            platform: Arc::new(RenderClient::new(&cfg)?),
            audit: Arc::new(
                AuditJsonl::new(&cfg.audit.jsonl_path, cfg.store.sqlite_path.as_deref()).await?,
            ),
            store: Arc::new(Mutex::new(store)),
            cfg,
        })
    }

    fn override_user(&self) -> Option<&str> {
        self.cfg.organization.override_user_id.as_deref()
    }

    /// Configuration lookup failures degrade to "absent" so callers apply
    /// their own deny policy; the anomaly still lands in the audit stream.
    async fn settings_for(&self, guild_id: &str) -> Option<OrgSettings> {
        let lookup = { self.store.lock().await.get_settings(guild_id) };
        match lookup {
            Ok(v) => v,
            Err(e) => {
                self.audit
                    .append(
                        AuditRecord::new(
                            guild_id,
                            guild_id,
                            "settings_lookup",
                            "anomaly",
                            "settings_lookup_failed",
                        )
                        .with_detail(json!({"error": e})),
                    )
                    .await;
                None
            }
        }
    }

    async fn org_settings(&self) -> Option<OrgSettings> {
        self.settings_for(&self.cfg.organization.guild_id).await
    }

    async fn audit_outcome(
        &self,
        guild_id: &str,
        correlation_id: &str,
        action: &str,
        outcome: &ActionOutcome,
    ) {
        let result = match outcome.status {
            OutcomeStatus::Completed => "completed",
            OutcomeStatus::Rejected => "rejected",
            OutcomeStatus::Degraded => "degraded",
        };
        self.audit
            .append(AuditRecord::new(
                guild_id,
                correlation_id,
                action,
                result,
                &outcome.reason_code,
            ))
            .await;
    }

    async fn audit_infra(&self, correlation_id: &str, action: &str, error: &str) {
        self.audit
            .append(
                AuditRecord::new(
                    &self.cfg.organization.guild_id,
                    correlation_id,
                    action,
                    "error",
                    "infra_failure",
                )
                .with_detail(json!({"error": error})),
            )
            .await;
    }

    async fn request_exists(&self, request_id: &str) -> Result<bool, String> {
        let store = self.store.lock().await;
        Ok(store.get_request(request_id)?.is_some())
    }

    async fn file_internal(&self, input: InternalRequestInput) -> Result<ActionOutcome, String> {
        let org_guild = self.cfg.organization.guild_id.clone();
        let settings = self.org_settings().await;
        let route = match evaluate_internal_gate(settings.as_ref(), &input.actor) {
            Ok(route) => route,
            Err(code) => {
                let outcome = ActionOutcome::rejected(code).with_request(&input.request_id);
                self.audit_outcome(&org_guild, &input.request_id, "file_internal", &outcome)
                    .await;
                return Ok(outcome);
            }
        };

        if self.request_exists(&input.request_id).await? {
            let outcome =
                ActionOutcome::rejected("request_duplicate").with_request(&input.request_id);
            self.audit_outcome(&org_guild, &input.request_id, "file_internal", &outcome)
                .await;
            return Ok(outcome);
        }

        let mut request = SecurityRequest {
            request_id: input.request_id.clone(),
            external: false,
            requester_id: input.actor.id.clone(),
            requester_name: input.actor.display_name.clone(),
            location: input.location.clone(),
            details: input.details.clone(),
            contact: None,
            external_guild_id: None,
            origin_message: None,
            organization_message: None,
            status: RequestStatus::Pending,
            responders: vec![],
            conclusion: None,
            created_at: format_ts(Utc::now()),
        };

        // Internal requests render a single view: the alert doubles as the
        // actionable record, so there is no separate confirmation.
        let alert_failure = match self
            .platform
            .create(&route.alert_channel_id, &alert_view(&request))
            .await
        {
            Ok(message) => {
                request.organization_message = Some(message);
                None
            }
            Err(code) => Some(code),
        };

        let ledger_failure = {
            let mut store = self.store.lock().await;
            store.create_request(&request).err()
        };

        let outcome = match (&alert_failure, &ledger_failure) {
            (None, None) => ActionOutcome::completed("request_filed"),
            (Some(code), None) => {
                ActionOutcome::degraded("alert_delivery_failed").with_detail(json!({"alert": code}))
            }
            (None, Some(error)) => {
                ActionOutcome::degraded("ledger_write_failed").with_detail(json!({"store": error}))
            }
            (Some(code), Some(error)) => {
                self.audit
                    .append(
                        AuditRecord::new(
                            &org_guild,
                            &input.request_id,
                            "file_internal",
                            "error",
                            "request_lost",
                        )
                        .with_detail(json!({"alert": code, "store": error})),
                    )
                    .await;
                return Err(format!("alert and ledger both failed: {code}; {error}"));
            }
        }
        .with_request(&input.request_id);
        self.audit_outcome(&org_guild, &input.request_id, "file_internal", &outcome)
            .await;
        Ok(outcome)
    }

    async fn file_external(&self, input: ExternalRequestInput) -> Result<ActionOutcome, String> {
        let registration = {
            let store = self.store.lock().await;
            store.get_registration(&input.origin_guild_id)?
        };

        if let GateDecision::Deny { reason_code } =
            evaluate_external_gate(registration.as_ref(), &input.origin_channel_id, &input.actor)
        {
            let mut outcome = ActionOutcome::rejected(reason_code).with_request(&input.request_id);
            if reason_code == "registry_blacklisted" {
                if let Some(reason) = registration.and_then(|r| r.blacklist_reason) {
                    outcome = outcome.with_detail(json!({"blacklist_reason": reason}));
                }
            }
            self.audit_outcome(
                &input.origin_guild_id,
                &input.request_id,
                "file_external",
                &outcome,
            )
            .await;
            return Ok(outcome);
        }

        let settings = self.org_settings().await;
        let route = match resolve_alert_route(settings.as_ref()) {
            Ok(route) => route,
            Err(code) => {
                let outcome = ActionOutcome::rejected(code).with_request(&input.request_id);
                self.audit_outcome(
                    &input.origin_guild_id,
                    &input.request_id,
                    "file_external",
                    &outcome,
                )
                .await;
                return Ok(outcome);
            }
        };

        if self.request_exists(&input.request_id).await? {
            let outcome =
                ActionOutcome::rejected("request_duplicate").with_request(&input.request_id);
            self.audit_outcome(
                &input.origin_guild_id,
                &input.request_id,
                "file_external",
                &outcome,
            )
            .await;
            return Ok(outcome);
        }

        // All gates passed; from here on the filing proceeds best-effort and
        // failures surface as degraded outcomes, never as silent loss.
        {
            let mut store = self.store.lock().await;
            store.touch_activity(&input.origin_guild_id, &format_ts(Utc::now()))?;
        }

        let mut request = SecurityRequest {
            request_id: input.request_id.clone(),
            external: true,
            requester_id: input.actor.id.clone(),
            requester_name: input.actor.display_name.clone(),
            location: input.location.clone(),
            details: Some(input.details.clone()),
            contact: Some(input.contact.clone()),
            external_guild_id: Some(input.origin_guild_id.clone()),
            origin_message: None,
            organization_message: None,
            status: RequestStatus::Pending,
            responders: vec![],
            conclusion: None,
            created_at: format_ts(Utc::now()),
        };

        let confirmation_failure = match self
            .platform
            .create(&input.origin_channel_id, &origin_view(&request))
            .await
        {
            Ok(message) => {
                request.origin_message = Some(message);
                None
            }
            Err(code) => Some(code),
        };

        let alert_failure = match self
            .platform
            .create(&route.alert_channel_id, &alert_view(&request))
            .await
        {
            Ok(message) => {
                request.organization_message = Some(message);
                None
            }
            Err(code) => Some(code),
        };

        let ledger_failure = {
            let mut store = self.store.lock().await;
            store.create_request(&request).err()
        };

        let mut failed_legs = serde_json::Map::new();
        if let Some(code) = &confirmation_failure {
            failed_legs.insert("confirmation".to_string(), json!(code));
        }
        if let Some(code) = &alert_failure {
            failed_legs.insert("alert".to_string(), json!(code));
        }
        if let Some(error) = &ledger_failure {
            failed_legs.insert("store".to_string(), json!(error));
        }

        let mut outcome = if ledger_failure.is_some() {
            ActionOutcome::degraded("ledger_write_failed")
        } else if alert_failure.is_some() {
            ActionOutcome::degraded("alert_delivery_failed")
        } else if confirmation_failure.is_some() {
            ActionOutcome::degraded("confirmation_delivery_failed")
        } else {
            ActionOutcome::completed("request_filed")
        };
        if !failed_legs.is_empty() {
            outcome = outcome.with_detail(Value::Object(failed_legs));
        }
        let outcome = outcome.with_request(&input.request_id);
        self.audit_outcome(
            &input.origin_guild_id,
            &input.request_id,
            "file_external",
            &outcome,
        )
        .await;
        Ok(outcome)
    }

    async fn respond(
        &self,
        actor: &ActorDescriptor,
        control: &ControlRef,
    ) -> Result<ActionOutcome, String> {
        let org_guild = self.cfg.organization.guild_id.clone();
        let settings = self.org_settings().await;
        if let Err(code) = evaluate_security_actor(settings.as_ref(), actor) {
            let outcome = ActionOutcome::rejected(code).with_request(&control.request_id);
            self.audit_outcome(&org_guild, &control.request_id, "respond", &outcome)
                .await;
            return Ok(outcome);
        }

        // Lookup and append happen under one store lock: two concurrent
        // responders on the same request cannot interleave here.
        let step = {
            let mut store = self.store.lock().await;
            match store.get_request(&control.request_id)? {
                None => Err("request_not_found"),
                Some(req) if req.external_guild_id != control.external_guild_id => {
                    Err("request_not_found")
                }
                Some(req) if req.status == RequestStatus::Concluded => {
                    Err("request_already_concluded")
                }
                Some(_) => Ok(store.add_responder(
                    &control.request_id,
                    &Responder {
                        id: actor.id.clone(),
                        name: actor.display_name.clone(),
                    },
                )?),
            }
        };

        let added = match step {
            Err(code) => {
                let outcome = ActionOutcome::rejected(code).with_request(&control.request_id);
                self.audit_outcome(&org_guild, &control.request_id, "respond", &outcome)
                    .await;
                return Ok(outcome);
            }
            Ok(v) => v,
        };

        if added.already_present {
            let outcome =
                ActionOutcome::completed("already_responding").with_request(&control.request_id);
            self.audit_outcome(&org_guild, &control.request_id, "respond", &outcome)
                .await;
            return Ok(outcome);
        }

        let outcome = self.refresh_views(&added.request, "responder_added").await;
        self.audit_outcome(&org_guild, &control.request_id, "respond", &outcome)
            .await;
        Ok(outcome)
    }

    async fn conclude_preflight(
        &self,
        actor: &ActorDescriptor,
        control: &ControlRef,
        raw_control_id: &str,
    ) -> Result<ActionOutcome, String> {
        let org_guild = self.cfg.organization.guild_id.clone();
        let settings = self.org_settings().await;
        if let Err(code) = evaluate_security_actor(settings.as_ref(), actor) {
            let outcome = ActionOutcome::rejected(code).with_request(&control.request_id);
            self.audit_outcome(&org_guild, &control.request_id, "conclude_prompt", &outcome)
                .await;
            return Ok(outcome);
        }

        let lookup = {
            let store = self.store.lock().await;
            store.get_request(&control.request_id)?
        };
        let rejection = match lookup {
            None => Some("request_not_found"),
            Some(req) if req.external_guild_id != control.external_guild_id => {
                Some("request_not_found")
            }
            Some(req) if req.status == RequestStatus::Concluded => {
                Some("request_already_concluded")
            }
            Some(_) => None,
        };
        let outcome = match rejection {
            Some(code) => ActionOutcome::rejected(code).with_request(&control.request_id),
            None => ActionOutcome::completed("conclude_prompt")
                .with_request(&control.request_id)
                .with_prompt(PromptSpec {
                    control_id: raw_control_id.to_string(),
                    title: "Conclude request".to_string(),
                    field_label: "Reason".to_string(),
                }),
        };
        self.audit_outcome(&org_guild, &control.request_id, "conclude_prompt", &outcome)
            .await;
        Ok(outcome)
    }

    async fn conclude(
        &self,
        actor: &ActorDescriptor,
        control: &ControlRef,
        reason: &str,
    ) -> Result<ActionOutcome, String> {
        let org_guild = self.cfg.organization.guild_id.clone();
        // Re-checked at submission time; the prompt may have been shown long
        // before this arrives and roles can change in between.
        let settings = self.org_settings().await;
        if let Err(code) = evaluate_security_actor(settings.as_ref(), actor) {
            let outcome = ActionOutcome::rejected(code).with_request(&control.request_id);
            self.audit_outcome(&org_guild, &control.request_id, "conclude", &outcome)
                .await;
            return Ok(outcome);
        }

        let step = {
            let mut store = self.store.lock().await;
            match store.get_request(&control.request_id)? {
                None => Err("request_not_found"),
                Some(req) if req.external_guild_id != control.external_guild_id => {
                    Err("request_not_found")
                }
                Some(req) if req.status == RequestStatus::Concluded => {
                    Err("request_already_concluded")
                }
                Some(_) => Ok(store.conclude_request(
                    &control.request_id,
                    &Conclusion {
                        reason: reason.to_string(),
                        concluded_by_id: actor.id.clone(),
                        concluded_by_name: actor.display_name.clone(),
                        concluded_at: format_ts(Utc::now()),
                    },
                )?),
            }
        };

        let outcome = match step {
            Err(code) => ActionOutcome::rejected(code).with_request(&control.request_id),
            Ok(request) => self.refresh_views(&request, "request_concluded").await,
        };
        self.audit_outcome(&org_guild, &control.request_id, "conclude", &outcome)
            .await;
        Ok(outcome)
    }

    /// Pushes the current ledger state back out to both views. The ledger
    /// has already committed; a failed edit leaves that view lagging and
    /// the outcome degraded, never rolled back.
    async fn refresh_views(&self, request: &SecurityRequest, success_reason: &str) -> ActionOutcome {
        let mut failed_legs = serde_json::Map::new();
        if let Some(target) = &request.organization_message {
            if let Err(code) = self.platform.edit(target, &alert_view(request)).await {
                failed_legs.insert("alert".to_string(), json!(code));
            }
        }
        if request.external {
            if let Some(target) = &request.origin_message {
                if let Err(code) = self.platform.edit(target, &origin_view(request)).await {
                    failed_legs.insert("origin".to_string(), json!(code));
                }
            }
        }

        let mut outcome = if failed_legs.contains_key("alert") {
            ActionOutcome::degraded("alert_view_lagging")
        } else if failed_legs.contains_key("origin") {
            ActionOutcome::degraded("origin_view_lagging")
        } else {
            ActionOutcome::completed(success_reason)
        };
        if !failed_legs.is_empty() {
            outcome = outcome.with_detail(Value::Object(failed_legs));
        }
        outcome.with_request(&request.request_id)
    }

    async fn register_server(&self, input: RegisterServerInput) -> Result<ActionOutcome, String> {
        if !(input.actor.is_admin || self.override_user() == Some(input.actor.id.as_str())) {
            let outcome = ActionOutcome::rejected("role_admin_required");
            self.audit_outcome(&input.guild_id, &input.guild_id, "register_server", &outcome)
                .await;
            return Ok(outcome);
        }

        let registration = {
            let mut store = self.store.lock().await;
            store.upsert_registration(
                &input.guild_id,
                &input.guild_name,
                &input.channel_id,
                &format_ts(Utc::now()),
            )?
        };
        let outcome = ActionOutcome::completed("server_registered")
            .with_detail(serde_json::to_value(&registration).map_err(|e| e.to_string())?);
        self.audit_outcome(&input.guild_id, &input.guild_id, "register_server", &outcome)
            .await;
        Ok(outcome)
    }

    async fn server_summary(&self, guild_id: &str) -> Result<Option<Value>, String> {
        let store = self.store.lock().await;
        let registration = match store.get_registration(guild_id)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let active_requests = store.count_active_by_guild(guild_id)?;
        Ok(Some(json!({
            "registration": registration,
            "active_requests": active_requests,
        })))
    }

    async fn set_blacklist(&self, input: BlacklistInput) -> Result<ActionOutcome, String> {
        let settings = self.org_settings().await;
        if !can_blacklist(&input.actor, settings.as_ref(), self.override_user()) {
            let outcome = ActionOutcome::rejected("role_blacklist_required");
            self.audit_outcome(&input.guild_id, &input.guild_id, "blacklist", &outcome)
                .await;
            return Ok(outcome);
        }

        let changed = {
            let mut store = self.store.lock().await;
            if input.blacklisted {
                store.set_blacklist(&input.guild_id, input.reason.as_deref())?
            } else {
                store.clear_blacklist(&input.guild_id)?
            }
        };
        let outcome = if !changed {
            ActionOutcome::rejected("registry_missing")
        } else if input.blacklisted {
            ActionOutcome::completed("server_blacklisted")
        } else {
            ActionOutcome::completed("server_unblacklisted")
        };
        self.audit_outcome(&input.guild_id, &input.guild_id, "blacklist", &outcome)
            .await;
        Ok(outcome)
    }

    async fn allowed_roles(&self, input: AllowedRolesInput) -> Result<ActionOutcome, String> {
        if !(input.actor.is_admin || self.override_user() == Some(input.actor.id.as_str())) {
            let outcome = ActionOutcome::rejected("role_admin_required");
            self.audit_outcome(&input.guild_id, &input.guild_id, "allowed_roles", &outcome)
                .await;
            return Ok(outcome);
        }

        let step = {
            let mut store = self.store.lock().await;
            match input.op {
                AllowedRolesOp::Set => store
                    .set_allowed_roles(&input.guild_id, &input.role_ids)?
                    .then_some("allow_list_updated")
                    .ok_or("registry_missing"),
                AllowedRolesOp::Clear => store
                    .clear_allowed_roles(&input.guild_id)?
                    .then_some("allow_list_updated")
                    .ok_or("registry_missing"),
                AllowedRolesOp::Add => {
                    match store.add_allowed_role(&input.guild_id, &input.role_ids[0])? {
                        None => Err("registry_missing"),
                        Some(true) => Ok("allow_list_updated"),
                        Some(false) => Ok("role_already_allowed"),
                    }
                }
                AllowedRolesOp::Remove => {
                    match store.remove_allowed_role(&input.guild_id, &input.role_ids[0])? {
                        None => Err("registry_missing"),
                        Some(true) => Ok("allow_list_updated"),
                        Some(false) => Ok("role_not_in_list"),
                    }
                }
            }
        };
        let outcome = match step {
            Ok(code) => ActionOutcome::completed(code),
            Err(code) => ActionOutcome::rejected(code),
        };
        self.audit_outcome(&input.guild_id, &input.guild_id, "allowed_roles", &outcome)
            .await;
        Ok(outcome)
    }

    async fn upsert_settings(&self, input: SettingsInput) -> Result<ActionOutcome, String> {
        let current = self.settings_for(&input.guild_id).await;
        if !is_manager(&input.actor, current.as_ref(), self.override_user()) {
            let outcome = ActionOutcome::rejected("role_manager_required");
            self.audit_outcome(&input.guild_id, &input.guild_id, "settings", &outcome)
                .await;
            return Ok(outcome);
        }

        let patch = SettingsPatch {
            guild_id: input.guild_id.clone(),
            manager_role_id: input.manager_role_id.clone(),
            customer_role_id: input.customer_role_id.clone(),
            security_role_id: input.security_role_id.clone(),
            alert_channel_id: input.alert_channel_id.clone(),
            blacklist_role_id: input.blacklist_role_id.clone(),
        };
        let settings = {
            let mut store = self.store.lock().await;
            store.upsert_settings(&patch)?
        };
        let outcome = ActionOutcome::completed("settings_updated")
            .with_detail(serde_json::to_value(&settings).map_err(|e| e.to_string())?);
        self.audit_outcome(&input.guild_id, &input.guild_id, "settings", &outcome)
            .await;
        Ok(outcome)
    }

    async fn run_sweep(&self) -> Result<SweepReport, String> {
        let cutoff = format_ts(idle_cutoff(
            Utc::now(),
            self.cfg.sweeper.idle_threshold_days,
        ));
        let report = {
            let mut store = self.store.lock().await;
            store.sweep_inactive(&cutoff)?
        };
        self.audit
            .append(
                AuditRecord::new(
                    &self.cfg.organization.guild_id,
                    "sweep",
                    "activity_sweep",
                    "completed",
                    "sweep_completed",
                )
                .with_detail(json!({
                    "demoted": report.demoted,
                    "active": report.active,
                    "inactive": report.inactive,
                })),
            )
            .await;
        Ok(report)
    }

    async fn poll_updates(&self) -> Result<(), String> {
        let feed_url = match &self.cfg.updates.feed_url {
            Some(v) => v.clone(),
            None => return Ok(()),
        };
        let response = self
            .platform
            .client
            .get(&feed_url)
            .send()
            .await
            .map_err(|e| format!("update feed unreachable: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("update feed returned {}", response.status()));
        }
        let payload: Value = response
            .json()
            .await
            .map_err(|e| format!("update feed parse failed: {e}"))?;
        let latest = payload
            .get("version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "update feed missing version".to_string())?;

        if latest == SERVICE_VERSION {
            return Ok(());
        }

        self.audit
            .append(
                AuditRecord::new(
                    &self.cfg.organization.guild_id,
                    "updates",
                    "update_poll",
                    "completed",
                    "update_available",
                )
                .with_detail(json!({"running": SERVICE_VERSION, "latest": latest})),
            )
            .await;

        // Best-effort operator notice; a missing alert channel or a failed
        // render never fails the poll.
        if let Some(channel) = self
            .org_settings()
            .await
            .and_then(|s| s.alert_channel_id)
        {
            let _ = self
                .platform
                .create(&channel, &update_notice_view(SERVICE_VERSION, latest))
                .await;
        }
        Ok(())
    }
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn contracts() -> Json<Value> {
    Json(json!({
        "version": CONTRACT_VERSION,
        "service_version": SERVICE_VERSION,
        "operations": [
            "file_internal",
            "file_external",
            "respond",
            "conclude",
            "register_server",
            "blacklist",
            "allowed_roles",
            "settings"
        ],
        "control_actions": ["respond", "conclude"],
        "outcome_statuses": ["completed", "rejected", "degraded"]
    }))
}

type ApiError = (StatusCode, Json<Value>);

fn validation_error(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": {"code": "validation_error", "message": message}})),
    )
}

fn malformed_control_error() -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": {"code": "control_malformed", "message": "unrecognized control identifier"}})),
    )
}

fn infra_error() -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": {"code": "internal_error", "message": "temporary failure, try again"}})),
    )
}

fn not_found_error(code: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": {"code": code, "message": "no such record"}})),
    )
}

async fn requests_internal(
    State(state): State<AppState>,
    Json(input): Json<InternalRequestInput>,
) -> Result<Json<ActionOutcome>, ApiError> {
    validate_internal(&input).map_err(|e| validation_error(&e))?;
    let request_id = input.request_id.clone();
    match state.file_internal(input).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            state.audit_infra(&request_id, "file_internal", &e).await;
            Err(infra_error())
        }
    }
}

async fn requests_external(
    State(state): State<AppState>,
    Json(input): Json<ExternalRequestInput>,
) -> Result<Json<ActionOutcome>, ApiError> {
    validate_external(&input).map_err(|e| validation_error(&e))?;
    let request_id = input.request_id.clone();
    match state.file_external(input).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            state.audit_infra(&request_id, "file_external", &e).await;
            Err(infra_error())
        }
    }
}

async fn interactions(
    State(state): State<AppState>,
    Json(input): Json<InteractionInput>,
) -> Result<Json<ActionOutcome>, ApiError> {
    validate_interaction(&input).map_err(|e| validation_error(&e))?;
    let control = parse_control(&input.control_id).ok_or_else(malformed_control_error)?;
    let result = match control.action {
        ControlAction::Respond => state.respond(&input.actor, &control).await,
        ControlAction::Conclude => {
            state
                .conclude_preflight(&input.actor, &control, &input.control_id)
                .await
        }
    };
    match result {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            state
                .audit_infra(&control.request_id, "interaction", &e)
                .await;
            Err(infra_error())
        }
    }
}

async fn interactions_submit(
    State(state): State<AppState>,
    Json(input): Json<PromptSubmissionInput>,
) -> Result<Json<ActionOutcome>, ApiError> {
    validate_submission(&input).map_err(|e| validation_error(&e))?;
    let control = parse_control(&input.control_id).ok_or_else(malformed_control_error)?;
    if control.action != ControlAction::Conclude {
        return Err(malformed_control_error());
    }
    match state.conclude(&input.actor, &control, input.reason.trim()).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            state.audit_infra(&control.request_id, "conclude", &e).await;
            Err(infra_error())
        }
    }
}

async fn servers_register(
    State(state): State<AppState>,
    Json(input): Json<RegisterServerInput>,
) -> Result<Json<ActionOutcome>, ApiError> {
    validate_register(&input).map_err(|e| validation_error(&e))?;
    let guild_id = input.guild_id.clone();
    match state.register_server(input).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            state.audit_infra(&guild_id, "register_server", &e).await;
            Err(infra_error())
        }
    }
}

async fn servers_blacklist(
    State(state): State<AppState>,
    Json(input): Json<BlacklistInput>,
) -> Result<Json<ActionOutcome>, ApiError> {
    validate_blacklist(&input).map_err(|e| validation_error(&e))?;
    let guild_id = input.guild_id.clone();
    match state.set_blacklist(input).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            state.audit_infra(&guild_id, "blacklist", &e).await;
            Err(infra_error())
        }
    }
}

async fn servers_allowed_roles(
    State(state): State<AppState>,
    Json(input): Json<AllowedRolesInput>,
) -> Result<Json<ActionOutcome>, ApiError> {
    validate_allowed_roles(&input).map_err(|e| validation_error(&e))?;
    let guild_id = input.guild_id.clone();
    match state.allowed_roles(input).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            state.audit_infra(&guild_id, "allowed_roles", &e).await;
            Err(infra_error())
        }
    }
}

async fn request_snapshot(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<SecurityRequest>, ApiError> {
    let lookup = { state.store.lock().await.get_request(&request_id) };
    match lookup {
        Ok(Some(request)) => Ok(Json(request)),
        Ok(None) => Err(not_found_error("request_not_found")),
        Err(e) => {
            state.audit_infra(&request_id, "request_snapshot", &e).await;
            Err(infra_error())
        }
    }
}

async fn server_summary(
    State(state): State<AppState>,
    Path(guild_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.server_summary(&guild_id).await {
        Ok(Some(summary)) => Ok(Json(summary)),
        Ok(None) => Err(not_found_error("registration_not_found")),
        Err(e) => {
            state.audit_infra(&guild_id, "server_summary", &e).await;
            Err(infra_error())
        }
    }
}

async fn settings_upsert(
    State(state): State<AppState>,
    Json(input): Json<SettingsInput>,
) -> Result<Json<ActionOutcome>, ApiError> {
    validate_settings(&input).map_err(|e| validation_error(&e))?;
    let guild_id = input.guild_id.clone();
    match state.upsert_settings(input).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            state.audit_infra(&guild_id, "settings", &e).await;
            Err(infra_error())
        }
    }
}

fn validate_version(v: u64) -> Result<(), String> {
    if v != CONTRACT_VERSION {
        return Err("v must be 1".to_string());
    }
    Ok(())
}

fn validate_actor(actor: &ActorDescriptor) -> Result<(), String> {
    if actor.id.is_empty() || actor.display_name.is_empty() {
        return Err("actor.id and actor.display_name are required".to_string());
    }
    Ok(())
}

/// Request identifiers travel inside underscore-delimited control ids, so
/// an embedded underscore would corrupt the positional encoding.
fn validate_request_id(request_id: &str) -> Result<(), String> {
    if request_id.is_empty() {
        return Err("request_id is required".to_string());
    }
    if request_id.contains('_') {
        return Err("request_id must not contain underscores".to_string());
    }
    Ok(())
}

fn validate_internal(input: &InternalRequestInput) -> Result<(), String> {
    validate_version(input.v)?;
    validate_actor(&input.actor)?;
    validate_request_id(&input.request_id)?;
    if input.location.trim().is_empty() {
        return Err("location is required".to_string());
    }
    Ok(())
}

fn validate_external(input: &ExternalRequestInput) -> Result<(), String> {
    validate_version(input.v)?;
    validate_actor(&input.actor)?;
    validate_request_id(&input.request_id)?;
    if input.origin_guild_id.is_empty() || input.origin_channel_id.is_empty() {
        return Err("origin_guild_id and origin_channel_id are required".to_string());
    }
    if input.location.trim().is_empty()
        || input.details.trim().is_empty()
        || input.contact.trim().is_empty()
    {
        return Err("location, details, contact are required for external requests".to_string());
    }
    Ok(())
}

fn validate_interaction(input: &InteractionInput) -> Result<(), String> {
    validate_version(input.v)?;
    validate_actor(&input.actor)
}

fn validate_submission(input: &PromptSubmissionInput) -> Result<(), String> {
    validate_version(input.v)?;
    validate_actor(&input.actor)?;
    if input.reason.trim().is_empty() {
        return Err("reason is required".to_string());
    }
    Ok(())
}

fn validate_register(input: &RegisterServerInput) -> Result<(), String> {
    validate_version(input.v)?;
    validate_actor(&input.actor)?;
    if input.guild_id.is_empty() || input.guild_name.is_empty() || input.channel_id.is_empty() {
        return Err("guild_id, guild_name, channel_id are required".to_string());
    }
    Ok(())
}

fn validate_blacklist(input: &BlacklistInput) -> Result<(), String> {
    validate_version(input.v)?;
    validate_actor(&input.actor)?;
    if input.guild_id.is_empty() {
        return Err("guild_id is required".to_string());
    }
    Ok(())
}

fn validate_allowed_roles(input: &AllowedRolesInput) -> Result<(), String> {
    validate_version(input.v)?;
    validate_actor(&input.actor)?;
    if input.guild_id.is_empty() {
        return Err("guild_id is required".to_string());
    }
    match input.op {
        AllowedRolesOp::Add | AllowedRolesOp::Remove => {
            if input.role_ids.len() != 1 {
                return Err("add/remove take exactly one role_id".to_string());
            }
        }
        AllowedRolesOp::Set => {
            if input.role_ids.iter().any(|r| r.is_empty()) {
                return Err("role_ids must not contain empty entries".to_string());
            }
        }
        AllowedRolesOp::Clear => {}
    }
    Ok(())
}

fn validate_settings(input: &SettingsInput) -> Result<(), String> {
    validate_version(input.v)?;
    validate_actor(&input.actor)?;
    if input.guild_id.is_empty() {
        return Err("guild_id is required".to_string());
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct SettingsPatch {
    guild_id: String,
    manager_role_id: Option<String>,
    customer_role_id: Option<String>,
    security_role_id: Option<String>,
    alert_channel_id: Option<String>,
    blacklist_role_id: Option<String>,
}

#[derive(Debug, Clone)]
struct ResponderAdd {
    already_present: bool,
    request: SecurityRequest,
}

#[derive(Debug, Clone, Copy)]
pub struct SweepReport {
    pub demoted: u64,
    pub active: u64,
    pub inactive: u64,
}

#[derive(Default)]
struct MemoryStore {
    settings: HashMap<String, OrgSettings>,
    registrations: HashMap<String, Registration>,
    requests: HashMap<String, SecurityRequest>,
}

enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    fn get_settings(&self, guild_id: &str) -> Result<Option<OrgSettings>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.settings.get(guild_id).cloned()),
            StoreBackend::Sqlite(store) => store.get_settings(guild_id),
        }
    }

    fn upsert_settings(&mut self, patch: &SettingsPatch) -> Result<OrgSettings, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.upsert_settings(patch)),
            StoreBackend::Sqlite(store) => store.upsert_settings(patch),
        }
    }

    fn get_registration(&self, guild_id: &str) -> Result<Option<Registration>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.registrations.get(guild_id).cloned()),
            StoreBackend::Sqlite(store) => store.get_registration(guild_id),
        }
    }

    fn upsert_registration(
        &mut self,
        guild_id: &str,
        guild_name: &str,
        channel_id: &str,
        now: &str,
    ) -> Result<Registration, String> {
        match self {
            StoreBackend::Memory(store) => {
                Ok(store.upsert_registration(guild_id, guild_name, channel_id, now))
            }
            StoreBackend::Sqlite(store) => {
                store.upsert_registration(guild_id, guild_name, channel_id, now)
            }
        }
    }

    fn touch_activity(&mut self, guild_id: &str, now: &str) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.touch_activity(guild_id, now)),
            StoreBackend::Sqlite(store) => store.touch_activity(guild_id, now),
        }
    }

    fn set_allowed_roles(&mut self, guild_id: &str, roles: &[String]) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.set_allowed_roles(guild_id, roles)),
            StoreBackend::Sqlite(store) => store.set_allowed_roles(guild_id, roles),
        }
    }

    fn add_allowed_role(&mut self, guild_id: &str, role_id: &str) -> Result<Option<bool>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.add_allowed_role(guild_id, role_id)),
            StoreBackend::Sqlite(store) => store.add_allowed_role(guild_id, role_id),
        }
    }

    fn remove_allowed_role(
        &mut self,
        guild_id: &str,
        role_id: &str,
    ) -> Result<Option<bool>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.remove_allowed_role(guild_id, role_id)),
            StoreBackend::Sqlite(store) => store.remove_allowed_role(guild_id, role_id),
        }
    }

    fn clear_allowed_roles(&mut self, guild_id: &str) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.set_allowed_roles(guild_id, &[])),
            StoreBackend::Sqlite(store) => store.set_allowed_roles(guild_id, &[]),
        }
    }

    fn set_blacklist(&mut self, guild_id: &str, reason: Option<&str>) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.set_blacklist(guild_id, reason)),
            StoreBackend::Sqlite(store) => store.set_blacklist(guild_id, reason),
        }
    }

    fn clear_blacklist(&mut self, guild_id: &str) -> Result<bool, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.clear_blacklist(guild_id)),
            StoreBackend::Sqlite(store) => store.clear_blacklist(guild_id),
        }
    }

    fn sweep_inactive(&mut self, cutoff: &str) -> Result<SweepReport, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.sweep_inactive(cutoff)),
            StoreBackend::Sqlite(store) => store.sweep_inactive(cutoff),
        }
    }

    fn create_request(&mut self, request: &SecurityRequest) -> Result<(), String> {
        match self {
            StoreBackend::Memory(store) => store.create_request(request),
            StoreBackend::Sqlite(store) => store.create_request(request),
        }
    }

    fn get_request(&self, request_id: &str) -> Result<Option<SecurityRequest>, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.requests.get(request_id).cloned()),
            StoreBackend::Sqlite(store) => store.get_request(request_id),
        }
    }

    fn add_responder(
        &mut self,
        request_id: &str,
        responder: &Responder,
    ) -> Result<ResponderAdd, String> {
        match self {
            StoreBackend::Memory(store) => store.add_responder(request_id, responder),
            StoreBackend::Sqlite(store) => store.add_responder(request_id, responder),
        }
    }

    fn conclude_request(
        &mut self,
        request_id: &str,
        conclusion: &Conclusion,
    ) -> Result<SecurityRequest, String> {
        match self {
            StoreBackend::Memory(store) => store.conclude_request(request_id, conclusion),
            StoreBackend::Sqlite(store) => store.conclude_request(request_id, conclusion),
        }
    }

    fn count_active_by_guild(&self, guild_id: &str) -> Result<u64, String> {
        match self {
            StoreBackend::Memory(store) => Ok(store.count_active_by_guild(guild_id)),
            StoreBackend::Sqlite(store) => store.count_active_by_guild(guild_id),
        }
    }
}

impl MemoryStore {
    fn upsert_settings(&mut self, patch: &SettingsPatch) -> OrgSettings {
        let entry = self
            .settings
            .entry(patch.guild_id.clone())
            .or_insert_with(|| OrgSettings {
                guild_id: patch.guild_id.clone(),
                manager_role_id: None,
                customer_role_id: None,
                security_role_id: None,
                alert_channel_id: None,
                blacklist_role_id: None,
            });
        if let Some(v) = &patch.manager_role_id {
            entry.manager_role_id = Some(v.clone());
        }
        if let Some(v) = &patch.customer_role_id {
            entry.customer_role_id = Some(v.clone());
        }
        if let Some(v) = &patch.security_role_id {
            entry.security_role_id = Some(v.clone());
        }
        if let Some(v) = &patch.alert_channel_id {
            entry.alert_channel_id = Some(v.clone());
        }
        if let Some(v) = &patch.blacklist_role_id {
            entry.blacklist_role_id = Some(v.clone());
        }
        entry.clone()
    }

    fn upsert_registration(
        &mut self,
        guild_id: &str,
        guild_name: &str,
        channel_id: &str,
        now: &str,
    ) -> Registration {
        let entry = self
            .registrations
            .entry(guild_id.to_string())
            .or_insert_with(|| Registration {
                guild_id: guild_id.to_string(),
                guild_name: guild_name.to_string(),
                channel_id: channel_id.to_string(),
                active: true,
                blacklisted: false,
                blacklist_reason: None,
                last_accessed_at: now.to_string(),
                allowed_role_ids: vec![],
            });
        entry.guild_name = guild_name.to_string();
        entry.channel_id = channel_id.to_string();
        entry.active = true;
        entry.last_accessed_at = now.to_string();
        entry.clone()
    }

    fn touch_activity(&mut self, guild_id: &str, now: &str) -> bool {
        match self.registrations.get_mut(guild_id) {
            Some(entry) => {
                entry.last_accessed_at = now.to_string();
                entry.active = true;
                true
            }
            None => false,
        }
    }

    fn set_allowed_roles(&mut self, guild_id: &str, roles: &[String]) -> bool {
        match self.registrations.get_mut(guild_id) {
            Some(entry) => {
                entry.allowed_role_ids = roles.to_vec();
                true
            }
            None => false,
        }
    }

    fn add_allowed_role(&mut self, guild_id: &str, role_id: &str) -> Option<bool> {
        let entry = self.registrations.get_mut(guild_id)?;
        if entry.allowed_role_ids.iter().any(|r| r == role_id) {
            return Some(false);
        }
        entry.allowed_role_ids.push(role_id.to_string());
        Some(true)
    }

    fn remove_allowed_role(&mut self, guild_id: &str, role_id: &str) -> Option<bool> {
        let entry = self.registrations.get_mut(guild_id)?;
        let before = entry.allowed_role_ids.len();
        entry.allowed_role_ids.retain(|r| r != role_id);
        Some(entry.allowed_role_ids.len() != before)
    }

    fn set_blacklist(&mut self, guild_id: &str, reason: Option<&str>) -> bool {
        match self.registrations.get_mut(guild_id) {
            Some(entry) => {
                entry.blacklisted = true;
                entry.blacklist_reason = reason.map(|v| v.to_string());
                true
            }
            None => false,
        }
    }

    fn clear_blacklist(&mut self, guild_id: &str) -> bool {
        match self.registrations.get_mut(guild_id) {
            Some(entry) => {
                entry.blacklisted = false;
                entry.blacklist_reason = None;
                true
            }
            None => false,
        }
    }

    fn sweep_inactive(&mut self, cutoff: &str) -> SweepReport {
        let mut demoted = 0;
        for entry in self.registrations.values_mut() {
            if entry.active && entry.last_accessed_at.as_str() < cutoff {
                entry.active = false;
                demoted += 1;
            }
        }
        let active = self.registrations.values().filter(|r| r.active).count() as u64;
        let inactive = self.registrations.len() as u64 - active;
        SweepReport {
            demoted,
            active,
            inactive,
        }
    }

    fn create_request(&mut self, request: &SecurityRequest) -> Result<(), String> {
        if self.requests.contains_key(&request.request_id) {
            return Err("request already exists".to_string());
        }
        self.requests
            .insert(request.request_id.clone(), request.clone());
        Ok(())
    }

    fn add_responder(
        &mut self,
        request_id: &str,
        responder: &Responder,
    ) -> Result<ResponderAdd, String> {
        let request = self
            .requests
            .get_mut(request_id)
            .ok_or_else(|| "request not found".to_string())?;
        if request.status == RequestStatus::Concluded {
            return Err("request already concluded".to_string());
        }
        if request.responders.iter().any(|r| r.id == responder.id) {
            return Ok(ResponderAdd {
                already_present: true,
                request: request.clone(),
            });
        }
        request.responders.push(responder.clone());
        if request.status == RequestStatus::Pending {
            request.status = RequestStatus::Responding;
        }
        Ok(ResponderAdd {
            already_present: false,
            request: request.clone(),
        })
    }

    fn conclude_request(
        &mut self,
        request_id: &str,
        conclusion: &Conclusion,
    ) -> Result<SecurityRequest, String> {
        let request = self
            .requests
            .get_mut(request_id)
            .ok_or_else(|| "request not found".to_string())?;
        if request.status == RequestStatus::Concluded {
            return Err("request already concluded".to_string());
        }
        request.status = RequestStatus::Concluded;
        request.conclusion = Some(conclusion.clone());
        Ok(request.clone())
    }

    fn count_active_by_guild(&self, guild_id: &str) -> u64 {
        self.requests
            .values()
            .filter(|r| {
                r.external_guild_id.as_deref() == Some(guild_id)
                    && r.status != RequestStatus::Concluded
            })
            .count() as u64
    }
}

struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    fn new(path: &str) -> Result<Self, String> {
        let conn = Connection::open(path).map_err(|e| e.to_string())?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS org_settings (
                guild_id TEXT PRIMARY KEY,
                manager_role_id TEXT,
                customer_role_id TEXT,
                security_role_id TEXT,
                alert_channel_id TEXT,
                blacklist_role_id TEXT
            );
            CREATE TABLE IF NOT EXISTS registrations (
                guild_id TEXT PRIMARY KEY,
                guild_name TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                active INTEGER NOT NULL,
                blacklisted INTEGER NOT NULL,
                blacklist_reason TEXT,
                last_accessed_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS registration_roles (
                guild_id TEXT NOT NULL,
                role_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (guild_id, role_id)
            );
            CREATE TABLE IF NOT EXISTS requests (
                request_id TEXT PRIMARY KEY,
                external INTEGER NOT NULL,
                requester_id TEXT NOT NULL,
                requester_name TEXT NOT NULL,
                location TEXT NOT NULL,
                details TEXT,
                contact TEXT,
                external_guild_id TEXT,
                origin_channel_id TEXT,
                origin_message_id TEXT,
                org_channel_id TEXT,
                org_message_id TEXT,
                status TEXT NOT NULL,
                conclusion_reason TEXT,
                concluded_by_id TEXT,
                concluded_by_name TEXT,
                concluded_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS request_responders (
                request_id TEXT NOT NULL,
                responder_id TEXT NOT NULL,
                responder_name TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (request_id, responder_id)
            );
            ",
        )
        .map_err(|e| e.to_string())?;
        Ok(Self { conn })
    }

    fn get_settings(&self, guild_id: &str) -> Result<Option<OrgSettings>, String> {
        self.conn
            .query_row(
                "
                SELECT guild_id, manager_role_id, customer_role_id, security_role_id,
                       alert_channel_id, blacklist_role_id
                FROM org_settings WHERE guild_id = ?1
                ",
                params![guild_id],
                |row| {
                    Ok(OrgSettings {
                        guild_id: row.get(0)?,
                        manager_role_id: row.get(1)?,
                        customer_role_id: row.get(2)?,
                        security_role_id: row.get(3)?,
                        alert_channel_id: row.get(4)?,
                        blacklist_role_id: row.get(5)?,
                    })
                },
            )
            .optional()
            .map_err(|e| e.to_string())
    }

    fn upsert_settings(&mut self, patch: &SettingsPatch) -> Result<OrgSettings, String> {
        // COALESCE keeps every field a caller omitted; an upsert can only
        // fill or overwrite, never clear.
        self.conn
            .execute(
                "
                INSERT INTO org_settings
                (guild_id, manager_role_id, customer_role_id, security_role_id,
                 alert_channel_id, blacklist_role_id)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(guild_id) DO UPDATE SET
                    manager_role_id = COALESCE(excluded.manager_role_id, org_settings.manager_role_id),
                    customer_role_id = COALESCE(excluded.customer_role_id, org_settings.customer_role_id),
                    security_role_id = COALESCE(excluded.security_role_id, org_settings.security_role_id),
                    alert_channel_id = COALESCE(excluded.alert_channel_id, org_settings.alert_channel_id),
                    blacklist_role_id = COALESCE(excluded.blacklist_role_id, org_settings.blacklist_role_id)
                ",
                params![
                    patch.guild_id,
                    patch.manager_role_id,
                    patch.customer_role_id,
                    patch.security_role_id,
                    patch.alert_channel_id,
                    patch.blacklist_role_id
                ],
            )
            .map_err(|e| e.to_string())?;
        self.get_settings(&patch.guild_id)?
            .ok_or_else(|| "settings row missing after upsert".to_string())
    }

    fn get_registration(&self, guild_id: &str) -> Result<Option<Registration>, String> {
        let row = self
            .conn
            .query_row(
                "
                SELECT guild_id, guild_name, channel_id, active, blacklisted,
                       blacklist_reason, last_accessed_at
                FROM registrations WHERE guild_id = ?1
                ",
                params![guild_id],
                |row| {
                    Ok(Registration {
                        guild_id: row.get(0)?,
                        guild_name: row.get(1)?,
                        channel_id: row.get(2)?,
                        active: row.get::<_, i64>(3)? != 0,
                        blacklisted: row.get::<_, i64>(4)? != 0,
                        blacklist_reason: row.get(5)?,
                        last_accessed_at: row.get(6)?,
                        allowed_role_ids: vec![],
                    })
                },
            )
            .optional()
            .map_err(|e| e.to_string())?;

        match row {
            Some(mut registration) => {
                registration.allowed_role_ids = self.allowed_roles(guild_id)?;
                Ok(Some(registration))
            }
            None => Ok(None),
        }
    }

    fn allowed_roles(&self, guild_id: &str) -> Result<Vec<String>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT role_id FROM registration_roles WHERE guild_id = ?1 ORDER BY position",
            )
            .map_err(|e| e.to_string())?;
        let roles = stmt
            .query_map(params![guild_id], |row| row.get::<_, String>(0))
            .map_err(|e| e.to_string())?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        Ok(roles)
    }

    fn upsert_registration(
        &mut self,
        guild_id: &str,
        guild_name: &str,
        channel_id: &str,
        now: &str,
    ) -> Result<Registration, String> {
        self.conn
            .execute(
                "
                INSERT INTO registrations
                (guild_id, guild_name, channel_id, active, blacklisted, blacklist_reason, last_accessed_at)
                VALUES (?1, ?2, ?3, 1, 0, NULL, ?4)
                ON CONFLICT(guild_id) DO UPDATE SET
                    guild_name = excluded.guild_name,
                    channel_id = excluded.channel_id,
                    active = 1,
                    last_accessed_at = excluded.last_accessed_at
                ",
                params![guild_id, guild_name, channel_id, now],
            )
            .map_err(|e| e.to_string())?;
        self.get_registration(guild_id)?
            .ok_or_else(|| "registration row missing after upsert".to_string())
    }

    fn touch_activity(&mut self, guild_id: &str, now: &str) -> Result<bool, String> {
        let changed = self
            .conn
            .execute(
                "UPDATE registrations SET last_accessed_at = ?2, active = 1 WHERE guild_id = ?1",
                params![guild_id, now],
            )
            .map_err(|e| e.to_string())?;
        Ok(changed > 0)
    }

    fn set_allowed_roles(&mut self, guild_id: &str, roles: &[String]) -> Result<bool, String> {
        if self.get_registration(guild_id)?.is_none() {
            return Ok(false);
        }
        self.conn
            .execute(
                "DELETE FROM registration_roles WHERE guild_id = ?1",
                params![guild_id],
            )
            .map_err(|e| e.to_string())?;
        for (position, role_id) in roles.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT OR IGNORE INTO registration_roles (guild_id, role_id, position) VALUES (?1, ?2, ?3)",
                    params![guild_id, role_id, position as i64],
                )
                .map_err(|e| e.to_string())?;
        }
        Ok(true)
    }

    fn add_allowed_role(&mut self, guild_id: &str, role_id: &str) -> Result<Option<bool>, String> {
        if self.get_registration(guild_id)?.is_none() {
            return Ok(None);
        }
        let present: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM registration_roles WHERE guild_id = ?1 AND role_id = ?2",
                params![guild_id, role_id],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        if present > 0 {
            return Ok(Some(false));
        }
        let position: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM registration_roles WHERE guild_id = ?1",
                params![guild_id],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        self.conn
            .execute(
                "INSERT INTO registration_roles (guild_id, role_id, position) VALUES (?1, ?2, ?3)",
                params![guild_id, role_id, position],
            )
            .map_err(|e| e.to_string())?;
        Ok(Some(true))
    }

    fn remove_allowed_role(
        &mut self,
        guild_id: &str,
        role_id: &str,
    ) -> Result<Option<bool>, String> {
        if self.get_registration(guild_id)?.is_none() {
            return Ok(None);
        }
        let removed = self
            .conn
            .execute(
                "DELETE FROM registration_roles WHERE guild_id = ?1 AND role_id = ?2",
                params![guild_id, role_id],
            )
            .map_err(|e| e.to_string())?;
        Ok(Some(removed > 0))
    }

    fn set_blacklist(&mut self, guild_id: &str, reason: Option<&str>) -> Result<bool, String> {
        let changed = self
            .conn
            .execute(
                "UPDATE registrations SET blacklisted = 1, blacklist_reason = ?2 WHERE guild_id = ?1",
                params![guild_id, reason],
            )
            .map_err(|e| e.to_string())?;
        Ok(changed > 0)
    }

    fn clear_blacklist(&mut self, guild_id: &str) -> Result<bool, String> {
        let changed = self
            .conn
            .execute(
                "UPDATE registrations SET blacklisted = 0, blacklist_reason = NULL WHERE guild_id = ?1",
                params![guild_id],
            )
            .map_err(|e| e.to_string())?;
        Ok(changed > 0)
    }

    fn sweep_inactive(&mut self, cutoff: &str) -> Result<SweepReport, String> {
        let demoted = self
            .conn
            .execute(
                "UPDATE registrations SET active = 0 WHERE active = 1 AND last_accessed_at < ?1",
                params![cutoff],
            )
            .map_err(|e| e.to_string())? as u64;
        let active: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM registrations WHERE active = 1",
                [],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        let inactive: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM registrations WHERE active = 0",
                [],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        Ok(SweepReport {
            demoted,
            active: active as u64,
            inactive: inactive as u64,
        })
    }

    fn create_request(&mut self, request: &SecurityRequest) -> Result<(), String> {
        self.conn
            .execute(
                "
                INSERT INTO requests
                (request_id, external, requester_id, requester_name, location, details, contact,
                 external_guild_id, origin_channel_id, origin_message_id,
                 org_channel_id, org_message_id, status,
                 conclusion_reason, concluded_by_id, concluded_by_name, concluded_at, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, NULL, NULL, NULL, NULL, ?14)
                ",
                params![
                    request.request_id,
                    if request.external { 1 } else { 0 },
                    request.requester_id,
                    request.requester_name,
                    request.location,
                    request.details,
                    request.contact,
                    request.external_guild_id,
                    request.origin_message.as_ref().map(|m| m.channel_id.clone()),
                    request.origin_message.as_ref().map(|m| m.message_id.clone()),
                    request
                        .organization_message
                        .as_ref()
                        .map(|m| m.channel_id.clone()),
                    request
                        .organization_message
                        .as_ref()
                        .map(|m| m.message_id.clone()),
                    request.status.as_str(),
                    request.created_at,
                ],
            )
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    fn get_request(&self, request_id: &str) -> Result<Option<SecurityRequest>, String> {
        let row = self
            .conn
            .query_row(
                "
                SELECT request_id, external, requester_id, requester_name, location, details,
                       contact, external_guild_id, origin_channel_id, origin_message_id,
                       org_channel_id, org_message_id, status,
                       conclusion_reason, concluded_by_id, concluded_by_name, concluded_at, created_at
                FROM requests WHERE request_id = ?1
                ",
                params![request_id],
                |row| {
                    let status_raw: String = row.get(12)?;
                    let origin_channel: Option<String> = row.get(8)?;
                    let origin_message: Option<String> = row.get(9)?;
                    let org_channel: Option<String> = row.get(10)?;
                    let org_message: Option<String> = row.get(11)?;
                    let conclusion_reason: Option<String> = row.get(13)?;
                    let concluded_by_id: Option<String> = row.get(14)?;
                    let concluded_by_name: Option<String> = row.get(15)?;
                    let concluded_at: Option<String> = row.get(16)?;
                    Ok(SecurityRequest {
                        request_id: row.get(0)?,
                        external: row.get::<_, i64>(1)? != 0,
                        requester_id: row.get(2)?,
                        requester_name: row.get(3)?,
                        location: row.get(4)?,
                        details: row.get(5)?,
                        contact: row.get(6)?,
                        external_guild_id: row.get(7)?,
                        origin_message: match (origin_channel, origin_message) {
                            (Some(channel_id), Some(message_id)) => Some(MessageRef {
                                channel_id,
                                message_id,
                            }),
                            _ => None,
                        },
                        organization_message: match (org_channel, org_message) {
                            (Some(channel_id), Some(message_id)) => Some(MessageRef {
                                channel_id,
                                message_id,
                            }),
                            _ => None,
                        },
                        status: RequestStatus::parse(&status_raw)
                            .unwrap_or(RequestStatus::Pending),
                        responders: vec![],
                        conclusion: match (
                            conclusion_reason,
                            concluded_by_id,
                            concluded_by_name,
                            concluded_at,
                        ) {
                            (Some(reason), Some(by_id), Some(by_name), Some(at)) => {
                                Some(Conclusion {
                                    reason,
                                    concluded_by_id: by_id,
                                    concluded_by_name: by_name,
                                    concluded_at: at,
                                })
                            }
                            _ => None,
                        },
                        created_at: row.get(17)?,
                    })
                },
            )
            .optional()
            .map_err(|e| e.to_string())?;

        match row {
            Some(mut request) => {
                request.responders = self.responders(request_id)?;
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    fn responders(&self, request_id: &str) -> Result<Vec<Responder>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "
                SELECT responder_id, responder_name FROM request_responders
                WHERE request_id = ?1 ORDER BY position
                ",
            )
            .map_err(|e| e.to_string())?;
        let responders = stmt
            .query_map(params![request_id], |row| {
                Ok(Responder {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .map_err(|e| e.to_string())?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        Ok(responders)
    }

    fn add_responder(
        &mut self,
        request_id: &str,
        responder: &Responder,
    ) -> Result<ResponderAdd, String> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM requests WHERE request_id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        let status = status.ok_or_else(|| "request not found".to_string())?;
        if status == RequestStatus::Concluded.as_str() {
            return Err("request already concluded".to_string());
        }

        let present: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM request_responders WHERE request_id = ?1 AND responder_id = ?2",
                params![request_id, responder.id],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        let already_present = present > 0;

        if !already_present {
            let position: i64 = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM request_responders WHERE request_id = ?1",
                    params![request_id],
                    |row| row.get(0),
                )
                .map_err(|e| e.to_string())?;
            self.conn
                .execute(
                    "
                    INSERT INTO request_responders (request_id, responder_id, responder_name, position)
                    VALUES (?1, ?2, ?3, ?4)
                    ",
                    params![request_id, responder.id, responder.name, position],
                )
                .map_err(|e| e.to_string())?;
            self.conn
                .execute(
                    "UPDATE requests SET status = 'responding' WHERE request_id = ?1 AND status = 'pending'",
                    params![request_id],
                )
                .map_err(|e| e.to_string())?;
        }

        let request = self
            .get_request(request_id)?
            .ok_or_else(|| "request row missing after responder insert".to_string())?;
        Ok(ResponderAdd {
            already_present,
            request,
        })
    }

    fn conclude_request(
        &mut self,
        request_id: &str,
        conclusion: &Conclusion,
    ) -> Result<SecurityRequest, String> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM requests WHERE request_id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| e.to_string())?;
        let status = status.ok_or_else(|| "request not found".to_string())?;
        if status == RequestStatus::Concluded.as_str() {
            return Err("request already concluded".to_string());
        }

        self.conn
            .execute(
                "
                UPDATE requests SET
                    status = 'concluded',
                    conclusion_reason = ?2,
                    concluded_by_id = ?3,
                    concluded_by_name = ?4,
                    concluded_at = ?5
                WHERE request_id = ?1
                ",
                params![
                    request_id,
                    conclusion.reason,
                    conclusion.concluded_by_id,
                    conclusion.concluded_by_name,
                    conclusion.concluded_at
                ],
            )
            .map_err(|e| e.to_string())?;
        self.get_request(request_id)?
            .ok_or_else(|| "request row missing after conclude".to_string())
    }

    fn count_active_by_guild(&self, guild_id: &str) -> Result<u64, String> {
        let count: i64 = self
            .conn
            .query_row(
                "
                SELECT COUNT(*) FROM requests
                WHERE external_guild_id = ?1 AND status != 'concluded'
                ",
                params![guild_id],
                |row| row.get(0),
            )
            .map_err(|e| e.to_string())?;
        Ok(count as u64)
    }
}

/// One-shot render client for the adapter's render endpoint. A failed
/// render is reported to the initiating actor exactly once; retrying the
/// user-facing action is the human's job, not this client's.
struct RenderClient {
    endpoint: String,
    client: Client,
}

impl RenderClient {
    fn new(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.platform.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            endpoint: cfg.platform.render_endpoint.clone(),
            client,
        })
    }

    async fn create(&self, channel_id: &str, content: &Value) -> Result<MessageRef, String> {
        self.send(channel_id, None, content).await
    }

    async fn edit(&self, target: &MessageRef, content: &Value) -> Result<(), String> {
        self.send(&target.channel_id, Some(&target.message_id), content)
            .await
            .map(|_| ())
    }

    async fn send(
        &self,
        channel_id: &str,
        message_id: Option<&str>,
        content: &Value,
    ) -> Result<MessageRef, String> {
        let body = json!({
            "v": CONTRACT_VERSION,
            "channel_id": channel_id,
            "message_id": message_id,
            "content": content,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|_| "platform_transport_error".to_string())?;
        if !response.status().is_success() {
            return Err("platform_http_error".to_string());
        }
        response
            .json::<MessageRef>()
            .await
            .map_err(|_| "platform_contract_error".to_string())
    }
}

struct AuditJsonl {
    file: Arc<Mutex<tokio::fs::File>>,
    sqlite: Option<Arc<Mutex<Connection>>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

#[derive(Serialize, Deserialize, Clone)]
struct AuditRecord {
    audit_id: String,
    guild_id: String,
    correlation_id: String,
    action: String,
    result: String,
    reason_code: String,
    ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prev_hash: Option<String>,
    record_hash: String,
}

impl AuditRecord {
    fn new(
        guild_id: &str,
        correlation_id: &str,
        action: &str,
        result: &str,
        reason_code: &str,
    ) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            guild_id: guild_id.to_string(),
            correlation_id: correlation_id.to_string(),
            action: action.to_string(),
            result: result.to_string(),
            reason_code: reason_code.to_string(),
            ts: Utc::now().to_rfc3339(),
            detail: None,
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl AuditJsonl {
    async fn new(path: &str, sqlite_path: Option<&str>) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| {
                        v.get("record_hash")
                            .and_then(|hash| hash.as_str())
                            .map(|s| s.to_string())
                    })
            })
        });

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| e.to_string())?;

        let sqlite = match sqlite_path {
            Some(path) => {
                let conn = Connection::open(path).map_err(|e| e.to_string())?;
                conn.execute_batch(
                    "
                    CREATE TABLE IF NOT EXISTS audit_records (
                        audit_id TEXT PRIMARY KEY,
                        guild_id TEXT NOT NULL,
                        correlation_id TEXT NOT NULL,
                        action TEXT NOT NULL,
                        result TEXT NOT NULL,
                        reason_code TEXT NOT NULL,
                        ts TEXT NOT NULL,
                        record_json TEXT NOT NULL
                    );
                    ",
                )
                .map_err(|e| e.to_string())?;
                Some(Arc::new(Mutex::new(conn)))
            }
            None => None,
        };

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            sqlite,
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    async fn append(&self, mut rec: AuditRecord) {
        let prev_hash = { self.last_hash.lock().await.clone() };
        rec.prev_hash = prev_hash;
        if let Ok(seed) = serde_json::to_string(&rec) {
            rec.record_hash = hash_hex(seed.as_bytes());
        }

        let mut file = self.file.lock().await;
        if let Ok(line) = serde_json::to_string(&rec) {
            use tokio::io::AsyncWriteExt;
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;

            {
                let mut last_hash = self.last_hash.lock().await;
                *last_hash = Some(rec.record_hash.clone());
            }

            if let Some(sqlite) = &self.sqlite {
                let conn = sqlite.lock().await;
                let _ = conn.execute(
                    "
                    INSERT OR REPLACE INTO audit_records
                    (audit_id, guild_id, correlation_id, action, result, reason_code, ts, record_json)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                    ",
                    params![
                        rec.audit_id,
                        rec.guild_id,
                        rec.correlation_id,
                        rec.action,
                        rec.result,
                        rec.reason_code,
                        rec.ts,
                        line
                    ],
                );
            }
        }
    }
}

fn hash_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if idx > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let mut seeded = rec.clone();
        seeded.record_hash.clear();
        let seed = serde_json::to_string(&seeded)
            .map_err(|e| format!("line {} hash seed serialize failed: {e}", idx + 1))?;
        let expected_hash = hash_hex(seed.as_bytes());
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn responder(id: &str) -> Responder {
        Responder {
            id: id.to_string(),
            name: format!("Responder {id}"),
        }
    }

    fn pending_request(request_id: &str) -> SecurityRequest {
        SecurityRequest {
            request_id: request_id.to_string(),
            external: false,
            requester_id: "u1".to_string(),
            requester_name: "User One".to_string(),
            location: "Lobby".to_string(),
            details: None,
            contact: None,
            external_guild_id: None,
            origin_message: None,
            organization_message: None,
            status: RequestStatus::Pending,
            responders: vec![],
            conclusion: None,
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    #[test]
    fn memory_add_responder_is_idempotent_and_moves_status_once() {
        let mut store = MemoryStore::default();
        store
            .create_request(&pending_request("r1"))
            .expect("create request");

        let first = store.add_responder("r1", &responder("s1")).expect("add");
        assert!(!first.already_present);
        assert_eq!(first.request.status, RequestStatus::Responding);

        let second = store.add_responder("r1", &responder("s1")).expect("re-add");
        assert!(second.already_present);
        assert_eq!(second.request.responders.len(), 1);
        assert_eq!(second.request.status, RequestStatus::Responding);
    }

    #[test]
    fn memory_conclude_is_terminal() {
        let mut store = MemoryStore::default();
        store
            .create_request(&pending_request("r1"))
            .expect("create request");
        let conclusion = Conclusion {
            reason: "resolved".to_string(),
            concluded_by_id: "s1".to_string(),
            concluded_by_name: "Sec One".to_string(),
            concluded_at: "2026-01-02T00:00:00.000Z".to_string(),
        };
        let concluded = store.conclude_request("r1", &conclusion).expect("conclude");
        assert_eq!(concluded.status, RequestStatus::Concluded);
        assert!(store.conclude_request("r1", &conclusion).is_err());
        assert!(store.add_responder("r1", &responder("s2")).is_err());
    }

    #[test]
    fn memory_settings_upsert_never_clears_omitted_fields() {
        let mut store = MemoryStore::default();
        let full = SettingsPatch {
            guild_id: "org".to_string(),
            manager_role_id: Some("mgr".to_string()),
            customer_role_id: Some("cust".to_string()),
            security_role_id: Some("sec".to_string()),
            alert_channel_id: Some("alerts".to_string()),
            blacklist_role_id: None,
        };
        store.upsert_settings(&full);

        let partial = SettingsPatch {
            guild_id: "org".to_string(),
            manager_role_id: None,
            customer_role_id: None,
            security_role_id: Some("sec2".to_string()),
            alert_channel_id: None,
            blacklist_role_id: None,
        };
        let merged = store.upsert_settings(&partial);
        assert_eq!(merged.security_role_id.as_deref(), Some("sec2"));
        assert_eq!(merged.manager_role_id.as_deref(), Some("mgr"));
        assert_eq!(merged.alert_channel_id.as_deref(), Some("alerts"));
    }

    #[test]
    fn memory_sweep_demotes_only_stale_actives() {
        let mut store = MemoryStore::default();
        store.upsert_registration("g-old", "Old", "c1", "2026-01-01T00:00:00.000Z");
        store.upsert_registration("g-new", "New", "c2", "2026-02-01T00:00:00.000Z");

        let report = store.sweep_inactive("2026-01-15T00:00:00.000Z");
        assert_eq!(report.demoted, 1);
        assert_eq!(report.active, 1);
        assert_eq!(report.inactive, 1);

        let again = store.sweep_inactive("2026-01-15T00:00:00.000Z");
        assert_eq!(again.demoted, 0);
    }

    #[test]
    fn validate_request_id_rejects_underscores() {
        assert!(validate_request_id("r1").is_ok());
        assert!(validate_request_id("").is_err());
        assert!(validate_request_id("r_1").is_err());
    }

    fn temp_db_path(tag: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("sentinel-{tag}-{nanos}.db"))
            .to_string_lossy()
            .to_string()
    }

    #[test]
    fn sqlite_request_lifecycle_round_trips() {
        let mut store = SqliteStore::new(&temp_db_path("lifecycle")).expect("open sqlite");
        let mut request = pending_request("r1");
        request.external = true;
        request.external_guild_id = Some("g1".to_string());
        request.origin_message = Some(MessageRef {
            channel_id: "c1".to_string(),
            message_id: "m1".to_string(),
        });
        store.create_request(&request).expect("create");
        assert!(store.create_request(&request).is_err());
        assert_eq!(store.count_active_by_guild("g1").expect("count"), 1);

        let add = store.add_responder("r1", &responder("s1")).expect("add");
        assert!(!add.already_present);
        assert_eq!(add.request.status, RequestStatus::Responding);
        let again = store.add_responder("r1", &responder("s1")).expect("re-add");
        assert!(again.already_present);
        assert_eq!(again.request.responders.len(), 1);

        let conclusion = Conclusion {
            reason: "resolved".to_string(),
            concluded_by_id: "s1".to_string(),
            concluded_by_name: "Sec One".to_string(),
            concluded_at: "2026-01-02T00:00:00.000Z".to_string(),
        };
        let concluded = store.conclude_request("r1", &conclusion).expect("conclude");
        assert_eq!(concluded.status, RequestStatus::Concluded);
        assert_eq!(concluded.responders.len(), 1);
        assert_eq!(
            concluded.origin_message.as_ref().map(|m| m.message_id.as_str()),
            Some("m1")
        );
        assert!(store.conclude_request("r1", &conclusion).is_err());
        assert!(store.add_responder("r1", &responder("s2")).is_err());
        assert_eq!(store.count_active_by_guild("g1").expect("count"), 0);
    }

    #[test]
    fn sqlite_sweep_and_allow_list_ordering() {
        let mut store = SqliteStore::new(&temp_db_path("sweep")).expect("open sqlite");
        store
            .upsert_registration("g-old", "Old", "c1", "2026-01-01T00:00:00.000Z")
            .expect("register old");
        store
            .upsert_registration("g-new", "New", "c2", "2026-02-01T00:00:00.000Z")
            .expect("register new");

        assert_eq!(store.add_allowed_role("g-old", "rb").expect("add"), Some(true));
        assert_eq!(store.add_allowed_role("g-old", "ra").expect("add"), Some(true));
        assert_eq!(store.add_allowed_role("g-old", "rb").expect("re-add"), Some(false));
        assert_eq!(store.add_allowed_role("g-none", "ra").expect("no registration"), None);
        let reg = store
            .get_registration("g-old")
            .expect("get")
            .expect("registration");
        assert_eq!(reg.allowed_role_ids, vec!["rb".to_string(), "ra".to_string()]);

        let report = store
            .sweep_inactive("2026-01-15T00:00:00.000Z")
            .expect("sweep");
        assert_eq!(report.demoted, 1);
        assert_eq!(report.active, 1);
        assert_eq!(report.inactive, 1);
        let again = store
            .sweep_inactive("2026-01-15T00:00:00.000Z")
            .expect("sweep again");
        assert_eq!(again.demoted, 0);

        assert!(store
            .touch_activity("g-old", "2026-02-02T00:00:00.000Z")
            .expect("touch"));
        assert!(store
            .get_registration("g-old")
            .expect("get")
            .expect("registration")
            .active);
        assert!(!store
            .touch_activity("g-unknown", "2026-02-02T00:00:00.000Z")
            .expect("touch unknown"));
    }
}
