//! Hardware capability probe and the model catalog.
//!
//! The probe runs once at startup; its result is an immutable snapshot
//! used by the orchestrator to pick a backend and by the engine to
//! pick a default model. Re-probing produces a new snapshot.

use reqwest::Client;
use sysinfo::System;
use tracing::info;

use super::runtime::{ModelRuntime, OllamaRuntime};

/// A model the engine knows how to recommend.
pub struct ModelSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub min_memory_gb: u64,
}

/// Ordered smallest to largest; the recommendation is the largest
/// model whose memory floor fits.
pub const MODEL_CATALOG: &[ModelSpec] = &[
    ModelSpec {
        id: "llama3.2:1b",
        display_name: "Llama 3.2 1B",
        min_memory_gb: 2,
    },
    ModelSpec {
        id: "llama3.2:3b",
        display_name: "Llama 3.2 3B",
        min_memory_gb: 6,
    },
    ModelSpec {
        id: "llama3.1:8b",
        display_name: "Llama 3.1 8B",
        min_memory_gb: 12,
    },
];

/// Immutable snapshot of what the host can run locally.
#[derive(Debug, Clone)]
pub struct HardwareCapabilities {
    pub local_inference_supported: bool,
    pub total_memory_gb: u64,
    pub recommended_model_id: String,
    pub reason: String,
}

fn recommend_for_memory(total_memory_gb: u64) -> Option<&'static ModelSpec> {
    MODEL_CATALOG
        .iter()
        .rev()
        .find(|spec| total_memory_gb >= spec.min_memory_gb)
}

/// Probe system memory only, without checking runtime reachability.
pub fn probe_memory() -> u64 {
    let sys = System::new_all();
    sys.total_memory() / (1024 * 1024 * 1024)
}

/// Full probe: system memory plus whether the local model runtime is
/// actually reachable. Unreachable runtime or too little memory both
/// force the cloud backend.
pub async fn probe_with_runtime(base_url: &str, client: &Client) -> HardwareCapabilities {
    let total_memory_gb = probe_memory();
    let runtime = OllamaRuntime::new(base_url, client.clone());
    let reachable = runtime.is_reachable().await;

    let caps = match (reachable, recommend_for_memory(total_memory_gb)) {
        (true, Some(spec)) => HardwareCapabilities {
            local_inference_supported: true,
            total_memory_gb,
            recommended_model_id: spec.id.to_string(),
            reason: format!("{} fits in {total_memory_gb} GiB", spec.display_name),
        },
        (true, None) => HardwareCapabilities {
            local_inference_supported: false,
            total_memory_gb,
            recommended_model_id: String::new(),
            reason: format!("{total_memory_gb} GiB is below the smallest model's floor"),
        },
        (false, _) => HardwareCapabilities {
            local_inference_supported: false,
            total_memory_gb,
            recommended_model_id: String::new(),
            reason: format!("local model runtime at {base_url} is not reachable"),
        },
    };

    info!(
        supported = caps.local_inference_supported,
        memory_gb = caps.total_memory_gb,
        model = %caps.recommended_model_id,
        reason = %caps.reason,
        "Hardware probe complete"
    );
    caps
}
