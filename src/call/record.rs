use serde::{Deserialize, Serialize};

use crate::providers::{CallDirection, EndReason};

/// Lifecycle phase of one call. Only `Initiating` is a start state; every
/// other state is reachable only through `can_transition_to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Initiating,
    Ringing,
    Answered,
    Active,
    Speaking,
    Listening,
    Ending,
    HangupBot,
    HangupUser,
    Timeout,
    Busy,
    NoAnswer,
    Voicemail,
    Failed,
    Completed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::HangupBot
                | CallState::HangupUser
                | CallState::Timeout
                | CallState::Busy
                | CallState::NoAnswer
                | CallState::Voicemail
                | CallState::Failed
                | CallState::Completed
        )
    }

    /// The transition table. Unlisted edges are invalid.
    pub fn can_transition_to(self, to: CallState) -> bool {
        if self == to || self.is_terminal() {
            return false;
        }

        // Any non-terminal state may fall into the generic terminal set.
        if matches!(
            to,
            CallState::Busy
                | CallState::NoAnswer
                | CallState::Voicemail
                | CallState::Timeout
                | CallState::Failed
                | CallState::Completed
        ) {
            return true;
        }

        matches!(
            (self, to),
            (CallState::Initiating, CallState::Ringing)
                | (CallState::Ringing, CallState::Answered)
                | (CallState::Answered, CallState::Active)
                | (CallState::Active, CallState::Speaking)
                | (CallState::Active, CallState::Listening)
                | (CallState::Speaking, CallState::Listening)
                | (CallState::Listening, CallState::Speaking)
                | (CallState::Speaking, CallState::Active)
                | (CallState::Listening, CallState::Active)
                | (CallState::Answered, CallState::Ending)
                | (CallState::Active, CallState::Ending)
                | (CallState::Speaking, CallState::Ending)
                | (CallState::Listening, CallState::Ending)
                | (CallState::Ending, CallState::HangupBot)
                | (CallState::Ending, CallState::HangupUser)
        )
    }

    /// Terminal state matching an end reason.
    pub fn from_end_reason(reason: EndReason) -> CallState {
        match reason {
            EndReason::Busy => CallState::Busy,
            EndReason::NoAnswer => CallState::NoAnswer,
            EndReason::Voicemail => CallState::Voicemail,
            EndReason::Timeout => CallState::Timeout,
            EndReason::HangupUser => CallState::HangupUser,
            EndReason::HangupBot => CallState::HangupBot,
            EndReason::Failed => CallState::Failed,
            EndReason::Completed => CallState::Completed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Bot,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    /// Millisecond timestamp at emission.
    pub timestamp: i64,
}

/// How the bot participates in this call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallMode {
    /// Speak a message, listen for acknowledgement, hang up.
    #[default]
    Notify,
    /// Full dialog through the realtime model.
    Conversation,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CallMetadata {
    /// Natural-language task for the call.
    pub prompt: String,
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub mode: CallMode,
    /// Fallback delivery channel when sessionKey does not resolve.
    #[serde(default)]
    pub message_to: Option<String>,
    /// Originating chat-session key; required for outcome delivery.
    #[serde(default)]
    pub session_key: Option<String>,
}

/// Authoritative per-call state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    #[serde(default)]
    pub provider_call_id: Option<String>,
    pub from: String,
    pub to: String,
    pub direction: CallDirection,
    pub state: CallState,
    #[serde(default)]
    pub end_reason: Option<String>,
    pub started_at: i64,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
    pub metadata: CallMetadata,
    #[serde(default)]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub control_url: Option<String>,
    #[serde(default)]
    pub stream_auth_token: Option<String>,
}

impl CallRecord {
    pub fn new(
        call_id: String,
        from: String,
        to: String,
        direction: CallDirection,
        metadata: CallMetadata,
        now_ms: i64,
    ) -> Self {
        Self {
            call_id,
            provider_call_id: None,
            from,
            to,
            direction,
            state: CallState::Initiating,
            end_reason: None,
            started_at: now_ms,
            ended_at: None,
            transcript: Vec::new(),
            metadata,
            stream_sid: None,
            control_url: None,
            stream_auth_token: None,
        }
    }

    /// Append a transcript entry. Entries are immutable once appended;
    /// out-of-order arrivals are kept as they arrive.
    pub fn append_transcript(&mut self, speaker: Speaker, text: String, timestamp: i64) {
        self.transcript.push(TranscriptEntry {
            speaker,
            text,
            timestamp,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_edges_are_valid() {
        let path = [
            CallState::Initiating,
            CallState::Ringing,
            CallState::Answered,
            CallState::Active,
            CallState::Speaking,
            CallState::Listening,
            CallState::Speaking,
            CallState::Ending,
            CallState::HangupUser,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{:?} -> {:?} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn skipping_phases_is_rejected() {
        assert!(!CallState::Initiating.can_transition_to(CallState::Answered));
        assert!(!CallState::Ringing.can_transition_to(CallState::Active));
        assert!(!CallState::Initiating.can_transition_to(CallState::Speaking));
        assert!(!CallState::Answered.can_transition_to(CallState::HangupUser));
    }

    #[test]
    fn any_non_terminal_can_fail_or_timeout() {
        for from in [
            CallState::Initiating,
            CallState::Ringing,
            CallState::Answered,
            CallState::Active,
            CallState::Speaking,
            CallState::Listening,
            CallState::Ending,
        ] {
            assert!(from.can_transition_to(CallState::Busy));
            assert!(from.can_transition_to(CallState::NoAnswer));
            assert!(from.can_transition_to(CallState::Voicemail));
            assert!(from.can_transition_to(CallState::Timeout));
            assert!(from.can_transition_to(CallState::Failed));
            assert!(from.can_transition_to(CallState::Completed));
        }
    }

    #[test]
    fn answered_call_can_start_ending() {
        // A hangup can arrive before the media stream ever came up.
        assert!(CallState::Answered.can_transition_to(CallState::Ending));
    }

    #[test]
    fn hangup_states_only_from_ending() {
        for from in [
            CallState::Initiating,
            CallState::Ringing,
            CallState::Answered,
            CallState::Active,
            CallState::Speaking,
            CallState::Listening,
        ] {
            assert!(!from.can_transition_to(CallState::HangupUser));
            assert!(!from.can_transition_to(CallState::HangupBot));
        }
        assert!(CallState::Ending.can_transition_to(CallState::HangupUser));
        assert!(CallState::Ending.can_transition_to(CallState::HangupBot));
    }

    #[test]
    fn terminal_states_are_sinks() {
        for terminal in [
            CallState::HangupBot,
            CallState::HangupUser,
            CallState::Timeout,
            CallState::Busy,
            CallState::NoAnswer,
            CallState::Voicemail,
            CallState::Failed,
            CallState::Completed,
        ] {
            assert!(terminal.is_terminal());
            for to in [
                CallState::Initiating,
                CallState::Ringing,
                CallState::Active,
                CallState::Completed,
                CallState::Failed,
            ] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn self_transition_rejected() {
        assert!(!CallState::Active.can_transition_to(CallState::Active));
    }

    #[test]
    fn record_serializes_camel_case() {
        let record = CallRecord::new(
            "call-1".into(),
            "+15550001111".into(),
            "+15550002222".into(),
            CallDirection::Outbound,
            CallMetadata::default(),
            1_700_000_000_000,
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["callId"], "call-1");
        assert_eq!(json["state"], "initiating");
        assert_eq!(json["direction"], "outbound");
        assert_eq!(json["startedAt"], 1_700_000_000_000i64);
    }

    #[test]
    fn transcript_appends_keep_arrival_order() {
        let mut record = CallRecord::new(
            "call-1".into(),
            "a".into(),
            "b".into(),
            CallDirection::Outbound,
            CallMetadata::default(),
            0,
        );
        record.append_transcript(Speaker::Bot, "hello".into(), 100);
        record.append_transcript(Speaker::User, "hi".into(), 90); // late arrival
        assert_eq!(record.transcript.len(), 2);
        assert_eq!(record.transcript[0].timestamp, 100);
        assert_eq!(record.transcript[1].timestamp, 90);
    }
}
