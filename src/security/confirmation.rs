use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::ConfirmationError;
use crate::security::audit_log::AuditLogger;
use crate::security::replay::{ConsumedTokens, Consumption};

type HmacSha256 = Hmac<Sha256>;

const SEPARATOR: char = '|';

/// Result of [`ConfirmationService::generate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in_seconds: i64,
}

/// The authenticated content of a validated token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedAction {
    pub action: String,
    pub data: Value,
}

#[derive(Debug, Deserialize)]
struct Payload {
    action: String,
    data: Value,
    expires_at: i64,
    #[allow(dead_code)]
    issued_at: i64,
    #[allow(dead_code)]
    nonce: String,
}

/// "Preview then confirm" body returned before a destructive operation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub action: String,
    pub operation: String,
    pub item_type: String,
    pub items: Vec<Value>,
    pub item_count: usize,
    pub warnings: Vec<String>,
    pub confirmation_required: bool,
    pub confirmation_token: String,
    pub token_expires_at: DateTime<Utc>,
    pub token_expires_in_seconds: i64,
    pub next_step: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationStats {
    pub consumed_tokens: usize,
    pub default_expiry_minutes: i64,
}

/// Issues and redeems single-use signed confirmation tokens.
#[derive(Clone)]
pub struct ConfirmationService {
    secret: Vec<u8>,
    default_expiry_minutes: i64,
    consumed: ConsumedTokens,
    audit: AuditLogger,
}

impl std::fmt::Debug for ConfirmationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfirmationService")
            .field("default_expiry_minutes", &self.default_expiry_minutes)
            .finish_non_exhaustive()
    }
}

impl ConfirmationService {
    /// Without a secret, 32 random bytes are used; tokens then die with the process.
    pub fn new(secret: Option<&str>, default_expiry_minutes: i64) -> Self {
        let secret = match secret {
            Some(s) => s.as_bytes().to_vec(),
            None => {
                let mut bytes = vec![0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                bytes
            }
        };
        Self {
            secret,
            default_expiry_minutes,
            consumed: ConsumedTokens::default(),
            audit: AuditLogger::new(),
        }
    }

    pub fn with_consumed_set(mut self, consumed: ConsumedTokens) -> Self {
        self.consumed = consumed;
        self
    }

    pub fn generate(&self, action: &str, data: Value, expiry_minutes: Option<i64>) -> TokenInfo {
        let minutes = expiry_minutes.unwrap_or(self.default_expiry_minutes);
        let issued_at = Utc::now().timestamp_millis();
        let expires_at = issued_at.saturating_add(minutes.saturating_mul(60_000));

        let mut nonce = [0u8; 8];
        OsRng.fill_bytes(&mut nonce);
        let nonce: String = nonce.iter().map(|b| format!("{:02x}", b)).collect();

        // serde_json maps are sorted, so this serialization is canonical
        let payload = json!({
            "action": action,
            "data": data,
            "expires_at": expires_at,
            "issued_at": issued_at,
            "nonce": nonce,
        })
        .to_string();
        let token = format!("{}{}{}", payload, SEPARATOR, self.sign(&payload));

        self.audit.confirmation_issued(action);
        TokenInfo {
            token,
            expires_at: millis_to_datetime(expires_at),
            expires_in_seconds: minutes.saturating_mul(60).max(0),
        }
    }

    pub async fn validate(&self, token: &str) -> Result<ConfirmedAction, ConfirmationError> {
        let result = self.validate_inner(token).await;
        match &result {
            Ok(confirmed) => self.audit.confirmation_consumed(&confirmed.action),
            Err(err) => self.audit.confirmation_rejected(&err.to_string()),
        }
        result
    }

    async fn validate_inner(&self, token: &str) -> Result<ConfirmedAction, ConfirmationError> {
        let (payload_json, provided) = token
            .rsplit_once(SEPARATOR)
            .ok_or(ConfirmationError::Malformed)?;
        if payload_json.is_empty() || provided.is_empty() {
            return Err(ConfirmationError::Malformed);
        }

        let expected = self.sign(payload_json);
        if expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() != 1 {
            return Err(ConfirmationError::BadSignature);
        }

        let payload: Payload =
            serde_json::from_str(payload_json).map_err(|_| ConfirmationError::Malformed)?;

        if Utc::now().timestamp_millis() >= payload.expires_at {
            return Err(ConfirmationError::Expired);
        }

        match self
            .consumed
            .check_and_store(token, millis_to_datetime(payload.expires_at))
            .await
        {
            Consumption::Recorded => {}
            Consumption::AlreadyConsumed => return Err(ConfirmationError::AlreadyUsed),
            Consumption::Full => return Err(ConfirmationError::CapacityExceeded),
        }

        debug!(action = %payload.action, "confirmation token accepted");
        Ok(ConfirmedAction {
            action: payload.action,
            data: payload.data,
        })
    }

    pub fn create_preview_response(
        &self,
        action: &str,
        items: Vec<Value>,
        item_type: &str,
        warnings: Vec<String>,
        token_info: &TokenInfo,
    ) -> PreviewResponse {
        PreviewResponse {
            action: "preview".to_string(),
            operation: action.to_string(),
            item_type: item_type.to_string(),
            item_count: items.len(),
            items,
            warnings,
            confirmation_required: true,
            confirmation_token: token_info.token.clone(),
            token_expires_at: token_info.expires_at,
            token_expires_in_seconds: token_info.expires_in_seconds,
            next_step: format!(
                "To proceed, call confirm_{}_{} with the confirmation_token",
                action, item_type
            ),
        }
    }

    pub async fn stats(&self) -> ConfirmationStats {
        ConfirmationStats {
            consumed_tokens: self.consumed.len().await,
            default_expiry_minutes: self.default_expiry_minutes,
        }
    }

    /// HMAC-SHA256 of the canonical payload under the server secret, as lowercase hex.
    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        format!("{:x}", mac.finalize().into_bytes())
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
