//! Outbound notification surface: the only way the core reports results or
//! critical failures to the outside world.

use async_trait::async_trait;
use tracing::{error, info};

use crate::linking::MemberOutcome;

/// Sink the Scheduler and Health Monitor report through. Implementations
/// might email, page, or post to a chat webhook; the core only needs the
/// two calls below.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Report a batch of member outcomes from one scheduler tick or manual
    /// trigger. `origin_label` is the configured hour (`"HH:MM"`),
    /// `"manual"`, or `"batch"`.
    async fn notify_results(&self, results: &[MemberOutcome], origin_label: &str, error_context: Option<&str>);

    /// Report a failure severe enough to bypass the normal results path
    /// (e.g. the scheduler tick itself panicked before producing results).
    async fn notify_critical(&self, error_message: &str, scheduled_hour: &str, extra_context: Option<&str>);
}

// Compile-time assertion: NotificationSink must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn NotificationSink) {}
};

/// Logs results and critical errors via `tracing` rather than delivering
/// them anywhere. Suitable as a default until a real sink is wired up.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotificationSink;

#[async_trait]
impl NotificationSink for LoggingNotificationSink {
    async fn notify_results(&self, results: &[MemberOutcome], origin_label: &str, error_context: Option<&str>) {
        let successes = results.iter().filter(|r| r.result.success).count();
        info!(
            origin = origin_label,
            total = results.len(),
            successes,
            error_context = error_context.unwrap_or(""),
            "transfer results"
        );
    }

    async fn notify_critical(&self, error_message: &str, scheduled_hour: &str, extra_context: Option<&str>) {
        error!(
            scheduled_hour,
            extra_context = extra_context.unwrap_or(""),
            "critical scheduler failure: {error_message}"
        );
    }
}
