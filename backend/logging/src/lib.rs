//! Structured logging for Keystone.
//!
//! Console and rolling NDJSON file output, audit events for trust-store
//! mutations, and redaction of certificate material and credentials.

pub mod audit;
pub mod logger;
pub mod redact;

pub use audit::{AuditEntry, AuditEvent, AuditLog, AUDIT_TARGET};
pub use logger::{init_logger, LogFormat};
pub use redact::redact_sensitive_data;
