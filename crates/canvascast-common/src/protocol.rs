use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of a signaling envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalEvent {
    /// Server asks the browser to create and send its own offer. Data is `{}`.
    OfferRequest,
    /// Session description offer.
    Offer,
    /// Session description answer.
    Answer,
    /// Trickled ICE candidate.
    Ice,
}

impl SignalEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OfferRequest => "offer-request",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Ice => "ice",
        }
    }
}

/// Wire envelope exchanged over the signaling WebSocket.
///
/// `data` is itself a JSON document encoded as a string, matching what the
/// browser produces with `JSON.stringify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub event: SignalEvent,
    pub data: String,
}

impl Signal {
    pub fn offer_request() -> Self {
        Self {
            event: SignalEvent::OfferRequest,
            data: "{}".to_string(),
        }
    }

    pub fn offer(desc: &SessionDescription) -> Result<Self> {
        SignalPayload::Offer(desc.clone()).encode()
    }

    pub fn answer(desc: &SessionDescription) -> Result<Self> {
        SignalPayload::Answer(desc.clone()).encode()
    }

    pub fn ice(candidate: &IceCandidate) -> Result<Self> {
        SignalPayload::Ice(candidate.clone()).encode()
    }

    /// Parses `data` according to `event`.
    pub fn decode(&self) -> Result<SignalPayload> {
        match self.event {
            SignalEvent::OfferRequest => {
                let value: serde_json::Value = serde_json::from_str(&self.data)?;
                if !value.is_object() {
                    return Err(Error::protocol("offer-request data must be a JSON object"));
                }
                Ok(SignalPayload::OfferRequest)
            }
            SignalEvent::Offer => Ok(SignalPayload::Offer(serde_json::from_str(&self.data)?)),
            SignalEvent::Answer => Ok(SignalPayload::Answer(serde_json::from_str(&self.data)?)),
            SignalEvent::Ice => Ok(SignalPayload::Ice(serde_json::from_str(&self.data)?)),
        }
    }
}

/// A [`Signal`] with its `data` decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    OfferRequest,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Ice(IceCandidate),
}

impl SignalPayload {
    pub fn event(&self) -> SignalEvent {
        match self {
            Self::OfferRequest => SignalEvent::OfferRequest,
            Self::Offer(_) => SignalEvent::Offer,
            Self::Answer(_) => SignalEvent::Answer,
            Self::Ice(_) => SignalEvent::Ice,
        }
    }

    pub fn encode(&self) -> Result<Signal> {
        let data = match self {
            Self::OfferRequest => "{}".to_string(),
            Self::Offer(desc) | Self::Answer(desc) => serde_json::to_string(desc)?,
            Self::Ice(candidate) => serde_json::to_string(candidate)?,
        };
        Ok(Signal {
            event: self.event(),
            data,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Browser `RTCSessionDescriptionInit` shape: `{"type": "offer", "sdp": "v=0..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_request_wire_format() {
        let json = serde_json::to_string(&Signal::offer_request()).unwrap();
        assert_eq!(json, r#"{"event":"offer-request","data":"{}"}"#);
    }

    #[test]
    fn test_decode_browser_offer() {
        let raw = r#"{"event":"offer","data":"{\"type\":\"offer\",\"sdp\":\"v=0\\r\\n\"}"}"#;
        let signal: Signal = serde_json::from_str(raw).unwrap();
        match signal.decode().unwrap() {
            SignalPayload::Offer(desc) => {
                assert_eq!(desc.sdp_type, SdpType::Offer);
                assert_eq!(desc.sdp, "v=0\r\n");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_decode_browser_candidate_field_names() {
        let data = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}"#;
        let signal = Signal {
            event: SignalEvent::Ice,
            data: data.to_string(),
        };
        let SignalPayload::Ice(candidate) = signal.decode().unwrap() else {
            panic!("expected ice payload");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
        assert_eq!(candidate.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_decode_rejects_mismatched_payload() {
        let signal = Signal {
            event: SignalEvent::Offer,
            data: r#"{"candidate":"x"}"#.to_string(),
        };
        assert!(matches!(signal.decode(), Err(Error::Serialization(_))));

        let signal = Signal {
            event: SignalEvent::OfferRequest,
            data: "[]".to_string(),
        };
        assert!(matches!(signal.decode(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        let raw = r#"{"event":"hello","data":"{}"}"#;
        assert!(serde_json::from_str::<Signal>(raw).is_err());
    }

    #[test]
    fn test_answer_signal_carries_description() {
        let signal = Signal::answer(&SessionDescription::answer("v=0")).unwrap();
        assert_eq!(signal.event, SignalEvent::Answer);
        assert_eq!(signal.data, r#"{"type":"answer","sdp":"v=0"}"#);
    }
}
