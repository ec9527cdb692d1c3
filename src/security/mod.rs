pub mod audit_log;
pub mod confirmation;
pub mod credential_store;
pub mod crypto;
pub mod identity;
pub mod replay;
pub mod request_context;
pub mod token_cache;
