//! Wire encodings used on the signaling service
//!
//! SDP travels as base64 of the JSON object `{"type": "...", "sdp": "..."}`.
//! ICE candidates map one-to-one onto the browser `RTCIceCandidateInit` shape.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::generated::proto::rpc::webrtc::v1::IceCandidate;
use crate::{Error, Result};

/// SDP type string for offers
pub const SDP_OFFER: &str = "offer";
/// SDP type string for answers
pub const SDP_ANSWER: &str = "answer";

/// Session description as exchanged through signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SDP_OFFER.to_string(),
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SDP_ANSWER.to_string(),
            sdp: sdp.into(),
        }
    }
}

/// base64(JSON) encoding of a description
pub fn encode_sdp(description: &SessionDescription) -> Result<String> {
    let json = serde_json::to_vec(description)?;
    Ok(STANDARD.encode(json))
}

/// Inverse of [`encode_sdp`]
pub fn decode_sdp(encoded: &str) -> Result<SessionDescription> {
    let json = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Sdp(format!("Invalid base64 session description: {}", e)))?;
    let description: SessionDescription = serde_json::from_slice(&json)
        .map_err(|e| Error::Sdp(format!("Invalid session description JSON: {}", e)))?;
    if description.sdp.is_empty() {
        return Err(Error::Sdp("Session description has no SDP".to_string()));
    }
    Ok(description)
}

/// Local candidate to signaling form
pub fn candidate_to_proto(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index.map(u32::from),
        username_fragment: init.username_fragment,
    }
}

/// Remote candidate from signaling form
pub fn candidate_from_proto(candidate: IceCandidate) -> Result<RTCIceCandidateInit> {
    let sdp_mline_index = candidate
        .sdp_mline_index
        .map(u16::try_from)
        .transpose()
        .map_err(|_| {
            Error::IceCandidate(format!(
                "sdp_mline_index out of range: {:?}",
                candidate.sdp_mline_index
            ))
        })?;

    Ok(RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index,
        username_fragment: candidate.username_fragment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp_encoding_is_base64_json() {
        let encoded = encode_sdp(&SessionDescription::offer("v=0\r\n")).unwrap();
        let json = String::from_utf8(STANDARD.decode(&encoded).unwrap()).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0\r\n"}"#);

        let decoded = decode_sdp(&encoded).unwrap();
        assert_eq!(decoded.kind, SDP_OFFER);
        assert_eq!(decoded.sdp, "v=0\r\n");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_sdp("not base64!"), Err(Error::Sdp(_))));
        let not_json = STANDARD.encode("hello");
        assert!(matches!(decode_sdp(&not_json), Err(Error::Sdp(_))));
        let empty = STANDARD.encode(r#"{"type":"answer","sdp":""}"#);
        assert!(matches!(decode_sdp(&empty), Err(Error::Sdp(_))));
    }

    #[test]
    fn test_candidate_conversion() {
        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: Some("abcd".to_string()),
        };

        let proto = candidate_to_proto(init.clone());
        assert_eq!(proto.sdp_mline_index, Some(0));

        let back = candidate_from_proto(proto).unwrap();
        assert_eq!(back.candidate, init.candidate);
        assert_eq!(back.sdp_mid, init.sdp_mid);
        assert_eq!(back.username_fragment, init.username_fragment);
    }

    #[test]
    fn test_candidate_mline_out_of_range() {
        let proto = IceCandidate {
            candidate: "candidate:1".to_string(),
            sdp_mid: None,
            sdp_mline_index: Some(70_000),
            username_fragment: None,
        };
        assert!(matches!(
            candidate_from_proto(proto),
            Err(Error::IceCandidate(_))
        ));
    }
}
