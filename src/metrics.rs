//! Prometheus metrics for the agent loop and sandboxes
//!
//! Everything registers into the default registry on first use;
//! [`gather_text`] renders it in the text exposition format.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram, register_histogram_vec,
    CounterVec, Encoder, GaugeVec, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Agent Loop Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Finished agent sessions by outcome.
    ///
    /// Labels:
    /// - outcome: "success", "budget_exhausted" or "fatal"
    pub static ref AGENT_SESSIONS: CounterVec = register_counter_vec!(
        "sandagent_agent_sessions_total",
        "Agent sessions by terminal outcome",
        &["outcome"]
    ).expect("failed to register AGENT_SESSIONS metric");

    /// Model rounds consumed per session.
    pub static ref AGENT_TURNS: Histogram = register_histogram!(
        "sandagent_agent_turns",
        "Model rounds consumed per agent session",
        vec![1.0, 2.0, 3.0, 5.0, 8.0, 10.0, 15.0, 20.0, 30.0]
    ).expect("failed to register AGENT_TURNS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Provider Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Wall time of a single model call, retries excluded.
    ///
    /// Labels:
    /// - provider: "ollama", "openai", "gemini" or "anthropic"
    /// - model: model name as sent to the provider
    pub static ref LLM_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "sandagent_llm_call_duration_seconds",
        "Duration of model calls",
        &["provider", "model"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register LLM_CALL_DURATION metric");

    /// Provider calls retried after a retryable error.
    ///
    /// Labels:
    /// - kind: error kind that triggered the retry (e.g. "RateLimit")
    pub static ref PROVIDER_RETRIES: CounterVec = register_counter_vec!(
        "sandagent_provider_retries_total",
        "Provider calls retried after a retryable error",
        &["kind"]
    ).expect("failed to register PROVIDER_RETRIES metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Execution Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Code executions by language and status.
    ///
    /// Labels:
    /// - language: "python", "bash" or "javascript"
    /// - status: "success", "error", "timeout", "unsupported" (no interpreter)
    ///   or "failed" (sandbox infrastructure)
    pub static ref CODE_EXECUTIONS: CounterVec = register_counter_vec!(
        "sandagent_code_executions_total",
        "Code executions by language and status",
        &["language", "status"]
    ).expect("failed to register CODE_EXECUTIONS metric");

    pub static ref CODE_EXECUTION_DURATION: HistogramVec = register_histogram_vec!(
        "sandagent_code_execution_duration_seconds",
        "Duration of code executions",
        &["language"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).expect("failed to register CODE_EXECUTION_DURATION metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Sandbox Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Live sandbox environments.
    ///
    /// Labels:
    /// - backend: "docker" or "process"
    pub static ref SANDBOXES_ACTIVE: GaugeVec = register_gauge_vec!(
        "sandagent_sandboxes_active",
        "Sandbox environments currently provisioned",
        &["backend"]
    ).expect("failed to register SANDBOXES_ACTIVE metric");

    pub static ref SANDBOX_PROVISION_DURATION: HistogramVec = register_histogram_vec!(
        "sandagent_sandbox_provision_duration_seconds",
        "Time to provision a sandbox environment",
        &["backend"],
        vec![0.001, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).expect("failed to register SANDBOX_PROVISION_DURATION metric");
}

/// Touch every metric so it shows up before the first session.
pub fn init() {
    for backend in ["docker", "process"] {
        SANDBOXES_ACTIVE.with_label_values(&[backend]).set(0.0);
    }
    for outcome in ["success", "budget_exhausted", "fatal"] {
        let _ = AGENT_SESSIONS.with_label_values(&[outcome]);
    }
    lazy_static::initialize(&AGENT_TURNS);
}

/// Render all registered metrics in the Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_sandagent_metrics() {
        init();
        CODE_EXECUTIONS.with_label_values(&["python", "success"]).inc();
        let text = gather_text();
        assert!(text.contains("sandagent_code_executions_total"));
        assert!(text.contains("sandagent_sandboxes_active"));
    }
}
