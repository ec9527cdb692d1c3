pub mod context_layer;
pub mod local_api;
