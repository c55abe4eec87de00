//! Task execution helpers.
//!
//! Re-exports the blocking spawn primitives and provides the panic-payload
//! formatting the engine uses when a task body unwinds.

use std::any::Any;

pub use tokio::task::{spawn_blocking, JoinError, JoinHandle};

/// Renders a panic payload captured by `catch_unwind` as a message.
///
/// Panics raised with a string literal or a formatted string yield that text;
/// any other payload type is reported generically.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    #[test]
    fn test_panic_message_from_literal() {
        let payload = panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");
    }

    #[test]
    fn test_panic_message_from_format() {
        let payload = panic::catch_unwind(|| panic!("failed at {}", 3)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "failed at 3");
    }

    #[test]
    fn test_panic_message_other_payload() {
        let payload = panic::catch_unwind(|| panic::panic_any(42_u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
