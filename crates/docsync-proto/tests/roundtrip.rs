//! Property-based tests for the change message wire model.

use docsync_proto::keys;
use docsync_proto::{ChangeMessage, Envelope, Operation, ResourceType};
use proptest::prelude::*;
use serde_json::Value;

fn resource_type() -> impl Strategy<Value = ResourceType> {
    prop::sample::select(ResourceType::ALL.to_vec())
}

fn operation() -> impl Strategy<Value = Operation> {
    prop::sample::select(Operation::ALL.to_vec())
}

fn path() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9_.-]{1,8}", 1..5).prop_map(|segments| {
        let mut path = String::new();
        for segment in segments {
            path.push('/');
            path.push_str(&segment);
        }
        path
    })
}

fn metadata_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        "[ -~]{0,16}".prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        any::<bool>().prop_map(Value::from),
    ]
}

fn metadata_key() -> impl Strategy<Value = String> {
    "[a-z][a-z-]{0,12}".prop_filter("routing keys are not metadata", |key| {
        !keys::is_routing_key(key)
    })
}

prop_compose! {
    fn change_message()(
        resource_type in resource_type(),
        operation in operation(),
        source in path(),
        destination in path(),
        metadata in prop::collection::btree_map(metadata_key(), metadata_value(), 0..6),
        payload in prop::collection::vec(any::<u8>(), 0..64),
    ) -> ChangeMessage {
        let mut message = ChangeMessage::new(resource_type, operation, source);
        message.metadata = metadata;
        if operation.has_destination() {
            message.destination_path = Some(destination);
        }
        if docsync_proto::message::carries_payload(resource_type, operation) {
            message.payload = Some(payload);
        }
        message
    }
}

proptest! {
    /// Envelope conversion is lossless for every valid message
    #[test]
    fn envelope_roundtrip(message in change_message()) {
        let decoded = ChangeMessage::from_envelope(&message.to_envelope()).unwrap();
        prop_assert_eq!(decoded, message);
    }

    /// CBOR wire encoding preserves the message
    #[test]
    fn cbor_roundtrip(message in change_message()) {
        let bytes = message.to_envelope().to_cbor().unwrap();
        let envelope = Envelope::from_cbor(&bytes).unwrap();
        let decoded = ChangeMessage::from_envelope(&envelope).unwrap();
        prop_assert_eq!(decoded, message);
    }

    /// Compressed payloads decode to the original content
    #[test]
    fn payload_codec_roundtrip(content in prop::collection::vec(any::<u8>(), 0..2048)) {
        let compressed = docsync_proto::codec::compress(&content).unwrap();
        let decoded = docsync_proto::codec::decode_body(
            Some(docsync_proto::codec::ZSTD_ENCODING),
            &compressed,
        ).unwrap();
        prop_assert_eq!(decoded, content);
    }
}

#[test]
fn unknown_properties_survive_as_metadata() {
    let envelope = Envelope::new()
        .with_property(keys::RESOURCE_TYPE, "COLLECTION")
        .with_property(keys::RESOURCE_OPERATION, "CREATE")
        .with_property(keys::SOURCE_PATH, "/db/a")
        .with_property("vendor-extension", serde_json::json!({"k": [1, "two"]}));

    let message = ChangeMessage::from_envelope(&envelope).unwrap();
    assert_eq!(
        message.metadata.get("vendor-extension"),
        Some(&serde_json::json!({"k": [1, "two"]}))
    );
}
