//! Outbound RPC message-id generation.

use uuid::Uuid;

/// A fresh unique id for an outbound Call. UUIDv4 in canonical form is
/// 36 ASCII characters, exactly the OCPP-J cap.
pub fn message_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_ocpp_cap() {
        let id = message_id();
        assert!(id.len() <= 36);
        assert!(id.is_ascii());
    }

    #[test]
    fn unique_among_samples() {
        let a = message_id();
        let b = message_id();
        assert_ne!(a, b);
    }
}
