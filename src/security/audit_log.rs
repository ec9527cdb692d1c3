use tracing::{error, info, warn};

/// Security-relevant events on the `audit` target. Never pass token values here.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn login_started(&self, principal: &str, flow: &str) {
        info!(target: "audit", event = "login_started", principal, flow);
    }

    pub fn login_completed(&self, principal: &str, flow: &str) {
        info!(target: "audit", event = "login_completed", principal, flow);
    }

    pub fn state_mismatch(&self, principal: &str) {
        warn!(target: "audit", event = "state_mismatch", principal);
    }

    pub fn token_refreshed(&self, principal: &str) {
        info!(target: "audit", event = "token_refreshed", principal);
    }

    pub fn refresh_failed(&self, principal: &str, reason: &str) {
        warn!(target: "audit", event = "refresh_failed", principal, reason);
    }

    pub fn logout(&self, principal: &str, removed: bool) {
        info!(target: "audit", event = "logout", principal, removed);
    }

    pub fn identity_rejected(&self, reason: &str) {
        warn!(target: "audit", event = "identity_rejected", reason);
    }

    pub fn credential_stored(&self, user_id: &str, org_name: &str) {
        info!(target: "audit", event = "credential_stored", user_id, org_name);
    }

    pub fn credential_deleted(&self, user_id: &str, org_name: &str) {
        info!(target: "audit", event = "credential_deleted", user_id, org_name);
    }

    pub fn confirmation_issued(&self, action: &str) {
        info!(target: "audit", event = "confirmation_issued", action);
    }

    pub fn confirmation_consumed(&self, action: &str) {
        info!(target: "audit", event = "confirmation_consumed", action);
    }

    pub fn confirmation_rejected(&self, reason: &str) {
        warn!(target: "audit", event = "confirmation_rejected", reason);
    }

    pub fn internal_error(&self, error_msg: &str) {
        error!(target: "audit", event = "internal_error", error = error_msg);
    }
}
