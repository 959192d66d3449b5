//! Per-request trace hooks.
//!
//! A request may carry a [`TraceHook`]; the engines then emit paired
//! events around every major step: `<target>.started` with the call
//! arguments, then `<target>.complete` with the return value or
//! `<target>.failed` with the error. Targets follow the
//! `<layer>.<operation>` convention, e.g. `connection.connect_tcp` or
//! `http11.receive_response_headers`.

use std::fmt;
use std::sync::Arc;

use crate::error::Error;

/// Callback receiving trace events for a single request.
pub trait TraceHook: Send + Sync {
    /// `name` is the full event name (`http11.send_request_headers.started`);
    /// `info` carries the arguments, return value or error when available.
    fn on_event(&self, name: &str, info: Option<&dyn fmt::Debug>);
}

impl<F> TraceHook for F
where
    F: Fn(&str, Option<&dyn fmt::Debug>) + Send + Sync,
{
    fn on_event(&self, name: &str, info: Option<&dyn fmt::Debug>) {
        self(name, info)
    }
}

/// Emits the `.started` event on construction and exactly one of
/// `.complete` / `.failed` afterwards; dropping the span without an
/// explicit outcome reports `.failed`.
pub(crate) struct TraceSpan {
    hook: Option<Arc<dyn TraceHook>>,
    target: &'static str,
    settled: bool,
}

impl TraceSpan {
    pub fn start(
        hook: Option<&Arc<dyn TraceHook>>,
        target: &'static str,
        args: Option<&dyn fmt::Debug>,
    ) -> Self {
        if let Some(hook) = hook {
            hook.on_event(&format!("{target}.started"), args);
        }
        tracing::trace!(target: "hawser", event = target, "started");
        Self {
            hook: hook.cloned(),
            target,
            settled: false,
        }
    }

    pub fn complete(mut self, return_value: Option<&dyn fmt::Debug>) {
        if let Some(hook) = &self.hook {
            hook.on_event(&format!("{}.complete", self.target), return_value);
        }
        self.settled = true;
    }

    pub fn failed(mut self, error: &Error) {
        self.emit_failed(Some(error));
        self.settled = true;
    }

    fn emit_failed(&self, error: Option<&Error>) {
        if let Some(hook) = &self.hook {
            hook.on_event(
                &format!("{}.failed", self.target),
                error.map(|e| e as &dyn fmt::Debug),
            );
        }
        tracing::debug!(target: "hawser", event = self.target, ?error, "failed");
    }
}

impl Drop for TraceSpan {
    fn drop(&mut self) {
        if !self.settled {
            self.emit_failed(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl TraceHook for Recorder {
        fn on_event(&self, name: &str, _info: Option<&dyn fmt::Debug>) {
            self.0.lock().unwrap().push(name.to_string());
        }
    }

    #[test]
    fn spans_emit_paired_events() {
        let hook = Arc::new(Recorder::default());
        let dyn_hook: Arc<dyn TraceHook> = hook.clone();

        let span = TraceSpan::start(Some(&dyn_hook), "http11.send_request_headers", None);
        span.complete(None);

        let span = TraceSpan::start(Some(&dyn_hook), "connection.connect_tcp", None);
        span.failed(&Error::ConnectTimeout);

        let events = hook.0.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                "http11.send_request_headers.started",
                "http11.send_request_headers.complete",
                "connection.connect_tcp.started",
                "connection.connect_tcp.failed",
            ]
        );
    }

    #[test]
    fn dropped_span_reports_failure() {
        let hook = Arc::new(Recorder::default());
        let dyn_hook: Arc<dyn TraceHook> = hook.clone();
        drop(TraceSpan::start(Some(&dyn_hook), "http11.send_request_body", None));
        assert_eq!(
            *hook.0.lock().unwrap(),
            vec![
                "http11.send_request_body.started",
                "http11.send_request_body.failed",
            ]
        );
    }
}
