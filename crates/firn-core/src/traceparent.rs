//! Trace context smuggled through a requested filename.
//!
//! TFTP has no headers, so a booting client that wants its firmware fetch
//! correlated with a distributed trace appends a W3C `traceparent` to the
//! filename it asks for:
//!
//! ```text
//! snp.efi-00-23b1e307bb35484f535a1f772c06910e-d887dc3912240434-01
//! ```

use std::sync::LazyLock;

use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use regex::Regex;
use thiserror::Error;

// base filename, trace id, span id, flags
static TRACEPARENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*)-[[:xdigit:]]{2}-([[:xdigit:]]{32})-([[:xdigit:]]{16})-([[:xdigit:]]{2})")
        .unwrap_or_else(|e| unreachable!("static traceparent pattern: {e}"))
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceTagError {
    #[error("parsing OpenTelemetry trace id {0:?} failed: {1}")]
    TraceId(String, &'static str),

    #[error("parsing OpenTelemetry span id {0:?} failed: {1}")]
    SpanId(String, &'static str),
}

/// Parent span decoded from a filename suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub flags: TraceFlags,
}

impl TraceParent {
    pub fn is_sampled(&self) -> bool {
        self.flags.is_sampled()
    }

    /// Remote span context for this parent.
    pub fn span_context(&self) -> SpanContext {
        SpanContext::new(
            self.trace_id,
            self.span_id,
            self.flags,
            true,
            TraceState::default(),
        )
    }

    /// OpenTelemetry context carrying this parent, for attaching to a span.
    pub fn context(&self) -> opentelemetry::Context {
        opentelemetry::Context::new().with_remote_span_context(self.span_context())
    }
}

/// A filename with its trace tag removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tagged<'a> {
    pub filename: &'a str,
    pub parent: TraceParent,
}

/// Split a trace tag off `filename`.
///
/// - no tag: `Ok(None)`, the caller keeps using `filename` as is
/// - valid tag: `Ok(Some(..))` with the shortened filename
/// - tag with an unusable id: `Err(..)`; the caller must keep the original,
///   unshortened filename
pub fn extract(filename: &str) -> Result<Option<Tagged<'_>>, TraceTagError> {
    let Some(caps) = TRACEPARENT_RE.captures(filename) else {
        return Ok(None);
    };
    let (Some(base), Some(trace), Some(span), Some(flags)) =
        (caps.get(1), caps.get(2), caps.get(3), caps.get(4))
    else {
        return Ok(None);
    };

    let trace_id = TraceId::from_hex(trace.as_str())
        .map_err(|_| TraceTagError::TraceId(trace.as_str().to_string(), "invalid hex"))?;
    if trace_id == TraceId::INVALID {
        return Err(TraceTagError::TraceId(
            trace.as_str().to_string(),
            "trace-id can't be all zero",
        ));
    }

    let span_id = SpanId::from_hex(span.as_str())
        .map_err(|_| TraceTagError::SpanId(span.as_str().to_string(), "invalid hex"))?;
    if span_id == SpanId::INVALID {
        return Err(TraceTagError::SpanId(
            span.as_str().to_string(),
            "span-id can't be all zero",
        ));
    }

    let flags = u8::from_str_radix(flags.as_str(), 16).unwrap_or(0);

    Ok(Some(Tagged {
        filename: base.as_str(),
        parent: TraceParent {
            trace_id,
            span_id,
            flags: TraceFlags::new(flags),
        },
    }))
}
