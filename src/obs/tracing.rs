// self
use crate::{_prelude::*, obs::FlowKind};

/// Instrumented future returned by [`FlowSpan::instrument`].
pub type InstrumentedFlow<F> = tracing::instrument::Instrumented<F>;

/// A span builder used by token and session flows.
#[derive(Clone, Debug)]
pub struct FlowSpan {
	span: tracing::Span,
}
impl FlowSpan {
	/// Creates a new span tagged with the provided flow kind + stage.
	pub fn new(kind: FlowKind, stage: &'static str) -> Self {
		Self { span: tracing::info_span!("hiro_session.flow", flow = kind.as_str(), stage) }
	}

	/// Attaches the span to `fut`; the span is entered on every poll.
	pub fn instrument<Fut>(&self, fut: Fut) -> InstrumentedFlow<Fut>
	where
		Fut: Future,
	{
		use tracing::Instrument;

		fut.instrument(self.span.clone())
	}
}
