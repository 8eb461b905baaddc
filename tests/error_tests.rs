//! Tests for error types.
//!
//! Validates display formatting across the error categories the rest of
//! the launcher matches on.

use std::path::PathBuf;
use std::time::Duration;

use orbox::Error;

#[test]
fn test_missing_env_display() {
    let err = Error::MissingEnv("XDG_RUNTIME_DIR");
    let msg = format!("{}", err);
    assert!(msg.contains("XDG_RUNTIME_DIR"), "should name the variable");
}

#[test]
fn test_helper_too_old_display() {
    let err = Error::HelperTooOld {
        found: "0.1.2".to_string(),
        required: "0.1.3".to_string(),
    };
    let msg = format!("{}", err);
    assert!(msg.contains("0.1.2"), "should include the found version");
    assert!(msg.contains("0.1.3"), "should include the required version");
}

#[test]
fn test_bind_source_missing_display() {
    let err = Error::BindSourceMissing(PathBuf::from("/srv/nope"));
    let msg = format!("{}", err);
    assert!(msg.contains("/srv/nope"), "should include the path");
    assert!(msg.contains("does not exist"));
}

#[test]
fn test_policy_syntax_display() {
    let err = Error::PolicySyntax {
        line: 7,
        reason: "expected 'argN == value'".to_string(),
    };
    let msg = format!("{}", err);
    assert!(msg.contains("line 7"), "should include the line number");
    assert!(msg.contains("argN"), "should include the reason");
}

#[test]
fn test_program_too_large_display() {
    let err = Error::ProgramTooLarge {
        len: 70_000,
        limit: 65_535,
    };
    let msg = format!("{}", err);
    assert!(msg.contains("70000"));
    assert!(msg.contains("65535"));
}

#[test]
fn test_http_status_display() {
    let err = Error::HttpStatus {
        status: 503,
        url: "https://dist.example/update.xml".to_string(),
    };
    let msg = format!("{}", err);
    assert!(msg.contains("503"));
    assert!(msg.contains("dist.example"));
}

#[test]
fn test_pin_mismatch_display() {
    let err = Error::PinMismatch {
        host: "dist.torproject.org".to_string(),
    };
    let msg = format!("{}", err);
    assert!(msg.contains("pin"), "should mention pinning");
    assert!(msg.contains("dist.torproject.org"));
}

#[test]
fn test_canceled_matching() {
    assert!(Error::Canceled.is_canceled());
    assert!(!Error::TorNotRunning.is_canceled());
}

#[test]
fn test_timeout_display() {
    let err = Error::Timeout {
        operation: "tor network bootstrap".to_string(),
        duration: Duration::from_secs(120),
    };
    let msg = format!("{}", err);
    assert!(msg.contains("tor network bootstrap"));
    assert!(msg.contains("120"));
}

#[test]
fn test_io_error_wrapping() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
    let err: Error = io.into();
    assert!(matches!(err, Error::Io(_)));
    assert!(format!("{}", err).contains("pipe gone"));
}
