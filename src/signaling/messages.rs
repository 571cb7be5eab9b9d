//! Message Types für das Signaling-Protokoll
//!
//! `SignalingMessage` ist der einzige Typ, den der Controller sieht.
//! Relay-spezifische Events werden hier in diese Form normalisiert.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// SIGNALING MESSAGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
    CallRequest,
    CallAccept,
    CallReject,
    CallEnd,
    ParticipantUpdate,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Offer => "offer",
            SignalType::Answer => "answer",
            SignalType::IceCandidate => "ice-candidate",
            SignalType::CallRequest => "call-request",
            SignalType::CallAccept => "call-accept",
            SignalType::CallReject => "call-reject",
            SignalType::CallEnd => "call-end",
            SignalType::ParticipantUpdate => "participant-update",
        }
    }
}

/// Envelope für alle Call-Nachrichten
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub call_id: String,
    pub from_user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl SignalingMessage {
    pub fn new(kind: SignalType, call_id: impl Into<String>, from_user_id: impl Into<String>) -> Self {
        Self {
            kind,
            call_id: call_id.into(),
            from_user_id: from_user_id.into(),
            to_user_id: None,
            data: Value::Null,
        }
    }

    pub fn to(mut self, user_id: impl Into<String>) -> Self {
        self.to_user_id = Some(user_id.into());
        self
    }

    pub fn with_data<T: Serialize>(mut self, data: &T) -> Self {
        self.data = serde_json::to_value(data).unwrap_or(Value::Null);
        self
    }

    /// Parst den Payload entsprechend dem Nachrichtentyp
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Offer oder Answer
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Teil-Update eines Teilnehmers (Mute, Kamera, Screen-Share)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_video_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_audio_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_sharing_screen: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequestData {
    #[serde(default)]
    pub from_user_name: Option<String>,
}

// ============================================================================
// CLIENT → RELAY FRAMES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequestPayload {
    pub target_user_id: Option<String>,
    pub call_id: String,
    pub from_user_id: String,
    pub from_user_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponsePayload {
    pub call_id: String,
    pub accepted: bool,
    pub target_user_id: Option<String>,
    pub from_user_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEndPayload {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    pub from_user_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantUpdatePayload {
    pub call_id: String,
    pub updates: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    pub from_user_id: String,
}

/// Alle Frames, die der Client an den Relay schickt
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientFrame {
    WebrtcSignal(SignalingMessage),
    CallRequest(CallRequestPayload),
    CallResponse(CallResponsePayload),
    CallEnd(CallEndPayload),
    ParticipantUpdate(ParticipantUpdatePayload),
    JoinDocument(String),
    LeaveDocument(String),
}

impl ClientFrame {
    /// Bildet eine Call-Nachricht auf das passende Relay-Event ab
    pub fn from_message(message: SignalingMessage) -> Self {
        match message.kind {
            SignalType::Offer | SignalType::Answer | SignalType::IceCandidate => {
                ClientFrame::WebrtcSignal(message)
            }
            SignalType::CallRequest => {
                let from_user_name = message
                    .payload::<CallRequestData>()
                    .ok()
                    .and_then(|d| d.from_user_name);
                ClientFrame::CallRequest(CallRequestPayload {
                    target_user_id: message.to_user_id,
                    call_id: message.call_id,
                    from_user_id: message.from_user_id,
                    from_user_name,
                })
            }
            SignalType::CallAccept | SignalType::CallReject => {
                ClientFrame::CallResponse(CallResponsePayload {
                    accepted: message.kind == SignalType::CallAccept,
                    call_id: message.call_id,
                    target_user_id: message.to_user_id,
                    from_user_id: message.from_user_id,
                })
            }
            SignalType::CallEnd => ClientFrame::CallEnd(CallEndPayload {
                call_id: message.call_id,
                target_user_id: message.to_user_id,
                from_user_id: message.from_user_id,
            }),
            SignalType::ParticipantUpdate => {
                ClientFrame::ParticipantUpdate(ParticipantUpdatePayload {
                    call_id: message.call_id,
                    updates: message.data,
                    target_user_id: message.to_user_id,
                    from_user_id: message.from_user_id,
                })
            }
        }
    }
}

// ============================================================================
// RELAY → CLIENT FRAMES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallRequest {
    pub call_id: String,
    pub from_user_id: String,
    #[serde(default)]
    pub from_user_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallResponse {
    pub call_id: String,
    pub from_user_id: String,
    pub accepted: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingCallEnded {
    pub call_id: String,
    pub from_user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingParticipantUpdate {
    pub call_id: String,
    pub from_user_id: String,
    #[serde(default)]
    pub updates: Value,
}

/// Alle Frames, die der Relay an den Client schickt
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayFrame {
    WebrtcSignal(SignalingMessage),
    CallRequest(IncomingCallRequest),
    CallResponse(IncomingCallResponse),
    CallEnded(IncomingCallEnded),
    ParticipantUpdate(IncomingParticipantUpdate),
}

impl RelayFrame {
    /// Normalisiert das Relay-Event in eine `SignalingMessage`
    pub fn into_message(self) -> SignalingMessage {
        match self {
            RelayFrame::WebrtcSignal(message) => message,
            RelayFrame::CallRequest(req) => {
                SignalingMessage::new(SignalType::CallRequest, req.call_id, req.from_user_id)
                    .with_data(&CallRequestData {
                        from_user_name: req.from_user_name,
                    })
            }
            RelayFrame::CallResponse(resp) => {
                let kind = if resp.accepted {
                    SignalType::CallAccept
                } else {
                    SignalType::CallReject
                };
                SignalingMessage::new(kind, resp.call_id, resp.from_user_id)
            }
            RelayFrame::CallEnded(ended) => {
                SignalingMessage::new(SignalType::CallEnd, ended.call_id, ended.from_user_id)
            }
            RelayFrame::ParticipantUpdate(update) => SignalingMessage {
                kind: SignalType::ParticipantUpdate,
                call_id: update.call_id,
                from_user_id: update.from_user_id,
                to_user_id: None,
                data: update.updates,
            },
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_is_flat_camel_case() {
        let msg = SignalingMessage::new(SignalType::IceCandidate, "call-1", "alice")
            .to("bob")
            .with_data(&IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            });

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["callId"], "call-1");
        assert_eq!(value["fromUserId"], "alice");
        assert_eq!(value["toUserId"], "bob");
        assert_eq!(value["data"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_message_without_target_or_data() {
        let value = serde_json::to_value(SignalingMessage::new(
            SignalType::CallEnd,
            "call-1",
            "alice",
        ))
        .unwrap();
        assert!(value.get("toUserId").is_none());
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_call_response_is_normalized() {
        let frame: RelayFrame = serde_json::from_value(json!({
            "event": "call-response",
            "data": { "callId": "call-1", "fromUserId": "bob", "accepted": false }
        }))
        .unwrap();

        let msg = frame.into_message();
        assert_eq!(msg.kind, SignalType::CallReject);
        assert_eq!(msg.call_id, "call-1");
        assert_eq!(msg.from_user_id, "bob");
    }

    #[test]
    fn test_call_request_and_update_are_normalized() {
        let frame: RelayFrame = serde_json::from_value(json!({
            "event": "call-request",
            "data": { "callId": "call-7", "fromUserId": "carol", "fromUserName": "Carol" }
        }))
        .unwrap();
        let msg = frame.into_message();
        assert_eq!(msg.kind, SignalType::CallRequest);
        let data: CallRequestData = msg.payload().unwrap();
        assert_eq!(data.from_user_name.as_deref(), Some("Carol"));

        let frame: RelayFrame = serde_json::from_value(json!({
            "event": "participant-update",
            "data": { "callId": "call-7", "fromUserId": "carol", "updates": { "isAudioEnabled": false } }
        }))
        .unwrap();
        let update: ParticipantUpdate = frame.into_message().payload().unwrap();
        assert_eq!(update.is_audio_enabled, Some(false));
        assert_eq!(update.is_video_enabled, None);
    }

    #[test]
    fn test_outbound_frames() {
        let reject = SignalingMessage::new(SignalType::CallReject, "call-1", "bob").to("alice");
        let value = serde_json::to_value(ClientFrame::from_message(reject)).unwrap();
        assert_eq!(value["event"], "call-response");
        assert_eq!(value["data"]["accepted"], false);
        assert_eq!(value["data"]["targetUserId"], "alice");

        let offer = SignalingMessage::new(SignalType::Offer, "call-1", "alice")
            .to("bob")
            .with_data(&SessionDescription::offer("v=0"));
        let value = serde_json::to_value(ClientFrame::from_message(offer)).unwrap();
        assert_eq!(value["event"], "webrtc-signal");
        assert_eq!(value["data"]["data"]["type"], "offer");

        let join = serde_json::to_value(ClientFrame::JoinDocument("doc-1".into())).unwrap();
        assert_eq!(join, json!({ "event": "join-document", "data": "doc-1" }));
    }
}
