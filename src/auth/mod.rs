pub mod oauth;
pub mod provider;
pub mod token_manager;
