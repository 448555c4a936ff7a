//! Conversion between tonic metadata and the data-channel `Metadata` envelope
//!
//! Binary (`-bin`) entries travel base64 encoded, as they do in gRPC headers.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tonic::metadata::{Ascii, Binary, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue};
use tracing::warn;

use crate::generated::proto::rpc::webrtc::v1::{Metadata, Strings};

/// Encode a metadata map for a `RequestHeaders` frame
pub fn to_proto(map: &MetadataMap) -> Metadata {
    let mut proto = Metadata::default();
    for entry in map.iter() {
        match entry {
            KeyAndValueRef::Ascii(key, value) => match value.to_str() {
                Ok(v) => push(&mut proto, key.as_str(), v.to_string()),
                Err(_) => warn!("Dropping non-ASCII metadata value for key {}", key),
            },
            KeyAndValueRef::Binary(key, value) => match value.to_bytes() {
                Ok(bytes) => push(&mut proto, key.as_str(), STANDARD.encode(bytes)),
                Err(e) => warn!("Dropping undecodable binary metadata {}: {}", key, e),
            },
        }
    }
    proto
}

/// Decode the metadata carried by response headers or trailers
pub fn from_proto(proto: Option<Metadata>) -> MetadataMap {
    let mut map = MetadataMap::new();
    let Some(proto) = proto else {
        return map;
    };

    for (key, strings) in proto.md {
        let key = key.to_ascii_lowercase();
        if key.ends_with("-bin") {
            let Ok(name) = MetadataKey::<Binary>::from_bytes(key.as_bytes()) else {
                warn!("Ignoring invalid metadata key {}", key);
                continue;
            };
            for value in strings.values {
                match STANDARD.decode(value.as_bytes()) {
                    Ok(bytes) => {
                        map.append_bin(name.clone(), MetadataValue::from_bytes(&bytes));
                    }
                    Err(e) => warn!("Ignoring invalid base64 in metadata {}: {}", key, e),
                }
            }
        } else {
            let Ok(name) = MetadataKey::<Ascii>::from_bytes(key.as_bytes()) else {
                warn!("Ignoring invalid metadata key {}", key);
                continue;
            };
            for value in strings.values {
                match MetadataValue::<Ascii>::try_from(value.as_str()) {
                    Ok(v) => {
                        map.append(name.clone(), v);
                    }
                    Err(_) => warn!("Ignoring invalid metadata value for key {}", key),
                }
            }
        }
    }
    map
}

fn push(proto: &mut Metadata, key: &str, value: String) {
    proto
        .md
        .entry(key.to_string())
        .or_insert_with(Strings::default)
        .values
        .push(value);
}
