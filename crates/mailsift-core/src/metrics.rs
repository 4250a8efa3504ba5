//! Prometheus counters for the filter

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Filter metrics, registered in a registry owned by this struct
pub struct Metrics {
    registry: Registry,
    pub protocol_errors: IntCounter,
    pub callback_failures: IntCounterVec,
    pub callback_panics: IntCounter,
    pub module_errors: IntCounterVec,
    pub module_duration: HistogramVec,
    pub verdicts: IntCounterVec,
    pub sessions_pruned: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let protocol_errors = IntCounter::new(
            "mailsift_protocol_errors_total",
            "Milter callbacks that violated the protocol contract",
        )?;
        let callback_failures = IntCounterVec::new(
            Opts::new(
                "mailsift_callback_failures_total",
                "Milter callbacks that failed, by stage",
            ),
            &["stage"],
        )?;
        let callback_panics = IntCounter::new(
            "mailsift_callback_panics_total",
            "Panics caught at a callback boundary",
        )?;
        let module_errors = IntCounterVec::new(
            Opts::new(
                "mailsift_module_errors_total",
                "Module checks that failed, panicked or timed out",
            ),
            &["module"],
        )?;
        let module_duration = HistogramVec::new(
            HistogramOpts::new(
                "mailsift_module_check_seconds",
                "Duration of module message checks",
            ),
            &["module"],
        )?;
        let verdicts = IntCounterVec::new(
            Opts::new("mailsift_verdicts_total", "Final verdicts by action"),
            &["action"],
        )?;
        let sessions_pruned = IntCounter::new(
            "mailsift_sessions_pruned_total",
            "Sessions evicted without a Close callback",
        )?;

        registry.register(Box::new(protocol_errors.clone()))?;
        registry.register(Box::new(callback_failures.clone()))?;
        registry.register(Box::new(callback_panics.clone()))?;
        registry.register(Box::new(module_errors.clone()))?;
        registry.register(Box::new(module_duration.clone()))?;
        registry.register(Box::new(verdicts.clone()))?;
        registry.register(Box::new(sessions_pruned.clone()))?;

        Ok(Self {
            registry,
            protocol_errors,
            callback_failures,
            callback_panics,
            module_errors,
            module_duration,
            verdicts,
            sessions_pruned,
        })
    }

    /// Text exposition of all metrics
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
