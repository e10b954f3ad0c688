pub mod calendar;
pub mod github;
pub mod nats;
pub mod webhook;

use anyhow::Result;
use eventgate::event::DispatchError;
use tracing::error;

/// Applies the connector dispatch contract: bus-level failures end the
/// listen loop, anything else only concerns the one message.
pub(crate) fn dispatch_outcome(
    result: Result<(), DispatchError>,
    event_source: &str,
    event_name: &str,
) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_bus_error() => Err(e.into()),
        Err(e) => {
            error!(
                event_source = %event_source,
                event_name = %event_name,
                error = %e,
                "Failed to dispatch event"
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventgate::event::is_bus_unavailable;

    #[test]
    fn test_bus_errors_end_listen() {
        let err = dispatch_outcome(
            Err(DispatchError::BusUnavailable("closed".into())),
            "s",
            "e",
        )
        .unwrap_err();
        assert!(is_bus_unavailable(&err));

        assert!(dispatch_outcome(
            Err(DispatchError::Publish {
                id: "1".into(),
                reason: "nak".into()
            }),
            "s",
            "e"
        )
        .is_err());
    }

    #[test]
    fn test_message_errors_are_skipped() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(dispatch_outcome(Err(DispatchError::Serialize(bad)), "s", "e").is_ok());
        assert!(dispatch_outcome(Ok(()), "s", "e").is_ok());
    }
}
