// # Notifier Trait
//
// Fire-and-forget renewal alerts. Concrete channels (mail, chat webhooks)
// live outside the core; the scheduler logs and swallows send errors.

use async_trait::async_trait;

/// Alert sink for renewal outcomes
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send one notification
    async fn send(&self, title: &str, body: &str) -> Result<(), crate::Error>;
}

/// Notifier that writes alerts to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, title: &str, body: &str) -> Result<(), crate::Error> {
        tracing::info!(title = %title, "{}", body);
        Ok(())
    }
}
