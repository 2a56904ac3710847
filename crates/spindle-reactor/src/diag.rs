//! Diagnostic sink backed by `tracing`.

use spindle_core::diag::{Diagnostic, DiagnosticSink};

use tracing::{debug, trace, warn};

/// Forwards reactor diagnostics to `tracing`.
///
/// Severity follows recoverability: benign races and the silent-drop
/// submission policy log at `trace`, per-connection failures at `warn`.
#[derive(Debug, Default)]
pub struct TraceSink;

impl DiagnosticSink for TraceSink {
    fn report(&self, event: Diagnostic) {
        match event {
            Diagnostic::CancelledKey { token } => {
                trace!(token, "ready key already cancelled");
            }
            Diagnostic::RegistrationRaced { token } => {
                trace!(token, "registration raced with close");
            }
            Diagnostic::SubmissionRejected { token } => {
                trace!(token, "worker pool rejected action; dropping");
            }
            Diagnostic::DeregisterFailed { token, error } => {
                debug!(token, %error, "deregister failed");
            }
            Diagnostic::AcceptFailed { error } => {
                warn!(%error, "accept failed");
            }
            Diagnostic::ConnectFailed { peer, error } => {
                warn!(%peer, %error, "unable to finish connection");
            }
        }
    }
}
