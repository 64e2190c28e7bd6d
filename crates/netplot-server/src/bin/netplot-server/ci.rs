//! Startup failure classification (stable process exit codes).

use netplot_server::NetplotError;

/// Exit code: invalid configuration file or CLI override.
pub const EXIT_INVALID_CONFIG: i32 = 10;
/// Exit code: a port in the listening range could not be bound.
pub const EXIT_BIND_FAILED: i32 = 11;
/// Exit code: unexpected/internal failure.
pub const EXIT_INTERNAL: i32 = 20;

/// Map a startup error to its exit code, preferring the typed cause.
#[must_use]
pub fn classify_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        match cause.downcast_ref::<NetplotError>() {
            Some(NetplotError::InvalidConfig(_)) => return EXIT_INVALID_CONFIG,
            Some(NetplotError::Bind { .. }) => return EXIT_BIND_FAILED,
            _ => {}
        }
    }
    classify_message(&err.to_string())
}

/// Fallback for errors that only carry a message.
#[must_use]
pub fn classify_message(message: &str) -> i32 {
    let msg = message.to_ascii_lowercase();
    if msg.contains("invalid config") || msg.contains("netplot.toml") {
        return EXIT_INVALID_CONFIG;
    }
    if msg.contains("failed to bind") || msg.contains("address already in use") {
        return EXIT_BIND_FAILED;
    }
    EXIT_INTERNAL
}
