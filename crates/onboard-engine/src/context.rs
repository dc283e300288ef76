//! Explicit logging context handed to every engine component.
//!
//! Components never reach for process-wide state: they log through the span
//! they were given. A default context carries a disabled span, and without
//! an installed subscriber `tracing` discards everything, so tests need no
//! setup.

use std::future::Future;

use tracing::Instrument;

/// Logging context for one onboarding run.
#[derive(Debug, Clone)]
pub struct OnboardContext {
    span: tracing::Span,
}

impl OnboardContext {
    /// Create a context whose events are tagged with the device label.
    #[must_use]
    pub fn for_device(device: &str) -> Self {
        Self {
            span: tracing::info_span!("onboard", device = %device),
        }
    }

    /// Create a context from an existing span.
    #[must_use]
    pub fn from_span(span: tracing::Span) -> Self {
        Self { span }
    }

    /// The span events are recorded under.
    #[must_use]
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Run `future` inside this context.
    pub fn scope<F: Future>(&self, future: F) -> tracing::instrument::Instrumented<F> {
        future.instrument(self.span.clone())
    }
}

impl Default for OnboardContext {
    fn default() -> Self {
        Self {
            span: tracing::Span::none(),
        }
    }
}
