#![no_main]

use libfuzzer_sys::fuzz_target;
use markersync_core::{marker_id, IndexDocument, PrimaryRecord};

fuzz_target!(|data: &[u8]| {
    // Fuzz document decoding.
    // Tests handling of:
    // - Malformed JSON
    // - Non-object documents
    // - Wrong field types (numeric groupKey, missing id)
    // - Unknown kinds
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    if let Ok(record) = PrimaryRecord::from_document(value.clone()) {
        // A decoded record must survive re-encoding
        let again = PrimaryRecord::from_document(record.to_document())
            .expect("re-encoded record must decode");
        assert_eq!(again.group_key(), record.group_key());
    }

    if let Ok(document) = IndexDocument::decode(value) {
        if let Some(marker) = document.as_marker() {
            assert_eq!(marker.id, marker_id(&marker.group_key));
        }
        if let Ok(encoded) = document.encode() {
            let _ = IndexDocument::decode(encoded);
        }
    }
});
