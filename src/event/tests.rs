use super::*;
use serde_json::json;

#[test]
fn test_build_assigns_identity_fields() {
    let envelope = EventEnvelope::build(
        "webhook",
        "ingress",
        "example",
        br#"{"a":1}"#.to_vec(),
        &[],
    )
    .unwrap();

    assert_eq!(envelope.event_type, "webhook");
    assert_eq!(envelope.source, "ingress");
    assert_eq!(envelope.subject, "example");
    assert_eq!(envelope.payload, br#"{"a":1}"#.to_vec());
    assert_eq!(envelope.id.len(), 32);
    assert!(envelope.id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn test_same_payload_gets_distinct_ids() {
    let first = EventEnvelope::build("webhook", "ingress", "example", b"{}".to_vec(), &[]).unwrap();
    let second = EventEnvelope::build("webhook", "ingress", "example", b"{}".to_vec(), &[]).unwrap();
    assert_ne!(first.id, second.id);
}

#[test]
fn test_id_option_overrides_generated_id() {
    let envelope = EventEnvelope::build(
        "github",
        "scm",
        "push",
        b"{}".to_vec(),
        &[EventOption::Id("delivery-42".to_string())],
    )
    .unwrap();
    assert_eq!(envelope.id, "delivery-42");
}

#[test]
fn test_empty_id_option_is_rejected() {
    let result = EventEnvelope::build(
        "github",
        "scm",
        "push",
        b"{}".to_vec(),
        &[EventOption::Id(String::new())],
    );
    assert_eq!(result.unwrap_err(), EnvelopeError::EmptyId);
}

#[test]
fn test_missing_identity_fails() {
    assert_eq!(
        EventEnvelope::build("", "s", "e", vec![], &[]).unwrap_err(),
        EnvelopeError::MissingType
    );
    assert_eq!(
        EventEnvelope::build("t", "", "e", vec![], &[]).unwrap_err(),
        EnvelopeError::MissingSource
    );
    assert_eq!(
        EventEnvelope::build("t", "s", "", vec![], &[]).unwrap_err(),
        EnvelopeError::MissingSubject
    );
}

#[test]
fn test_envelope_errors_read_as_messages() {
    assert_eq!(EnvelopeError::EmptyId.to_string(), "event id override must not be empty");
    let err = DispatchError::from(EnvelopeError::MissingSubject);
    assert_eq!(err.to_string(), "invalid event: event subject is required");
}

#[test]
fn test_json_payload_is_embedded_as_data() {
    let envelope =
        EventEnvelope::build("webhook", "ingress", "example", br#"{"a":1}"#.to_vec(), &[]).unwrap();
    let wire: Value = serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();

    assert_eq!(wire["specversion"], "1.0");
    assert_eq!(wire["type"], "webhook");
    assert_eq!(wire["source"], "ingress");
    assert_eq!(wire["subject"], "example");
    assert_eq!(wire["id"], json!(envelope.id));
    assert_eq!(wire["data"], json!({"a": 1}));
    assert!(wire.get("data_base64").is_none());
}

#[test]
fn test_binary_payload_is_base64_encoded() {
    let payload = vec![0xff, 0x00, 0x10];
    let envelope = EventEnvelope::build("nats", "bus", "raw", payload.clone(), &[]).unwrap();
    let bytes = envelope.to_json().unwrap();

    let wire: Value = serde_json::from_slice(&bytes).unwrap();
    assert!(wire.get("data").is_none());
    assert_eq!(wire["data_base64"], "/wAQ");

    let decoded = EventEnvelope::from_json(&bytes).unwrap();
    assert_eq!(decoded.payload, payload);
    assert_eq!(decoded.id, envelope.id);
}

#[test]
fn test_bus_error_classification() {
    assert!(DispatchError::BusUnavailable("closed".into()).is_bus_error());
    assert!(DispatchError::Publish {
        id: "1".into(),
        reason: "timeout".into()
    }
    .is_bus_error());
    assert!(!DispatchError::Envelope(EnvelopeError::EmptyId).is_bus_error());

    let wrapped = anyhow::Error::new(DispatchError::BusUnavailable("closed".into()))
        .context("failed to dispatch event");
    assert!(is_bus_unavailable(&wrapped));
    assert!(!is_bus_unavailable(&anyhow::anyhow!("broker unreachable")));
}
