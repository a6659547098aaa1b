use crate::config_key::Product;
use crate::protocol::{ClientGetConfigsRequest, ClientInfo, ClientState, TracerInfo};
use crate::reconciler::ProductState;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use std::collections::BTreeMap;

/// Who is asking for configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientIdentity {
    pub client_id: String,
    pub runtime_id: String,
    pub language: String,
    pub tracer_version: String,
    pub service: String,
    pub env: String,
    pub app_version: String,
    pub tags: Vec<String>,
}

/// Base64 of the minimal big-endian byte representation of the mask. Zero encodes as an
/// empty string.
pub fn encode_capabilities(capabilities: u64) -> String {
    let bytes = capabilities.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    STANDARD.encode(&bytes[first..])
}

/// Assembles the next request from the client state and every registered product.
/// Products, cached files and config states come out sorted.
pub fn build_request(
    identity: &ClientIdentity,
    state: &ClientState,
    products: &BTreeMap<Product, ProductState>,
    capabilities: u64,
    extra_services: Vec<String>,
) -> ClientGetConfigsRequest {
    let mut config_states = Vec::new();
    let mut cached_target_files = Vec::new();
    for product in products.values() {
        config_states.extend(product.config_states());
        cached_target_files.extend(product.cached_target_files().cloned());
    }

    config_states.sort_by(|a, b| (a.product, &a.id).cmp(&(b.product, &b.id)));
    cached_target_files.sort_by(|a, b| a.path.cmp(&b.path));

    ClientGetConfigsRequest {
        client: ClientInfo {
            state: ClientState {
                config_states,
                ..state.clone()
            },
            id: identity.client_id.clone(),
            products: products.keys().copied().collect(),
            is_tracer: true,
            client_tracer: TracerInfo {
                runtime_id: identity.runtime_id.clone(),
                language: identity.language.clone(),
                tracer_version: identity.tracer_version.clone(),
                service: identity.service.clone(),
                env: identity.env.clone(),
                app_version: identity.app_version.clone(),
                tags: identity.tags.clone(),
                extra_services,
            },
            capabilities: encode_capabilities(capabilities),
        },
        cached_target_files,
    }
}
