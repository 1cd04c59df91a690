//! Control events published to live playback actors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What a control event asks the actor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlKind {
    Stop,
    Skip,
    Pause,
    Resume,
}

impl ControlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::Stop => "stop",
            ControlKind::Skip => "skip",
            ControlKind::Pause => "pause",
            ControlKind::Resume => "resume",
        }
    }
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlKind {
    type Err = EventParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(ControlKind::Stop),
            "skip" => Ok(ControlKind::Skip),
            "pause" => Ok(ControlKind::Pause),
            "resume" => Ok(ControlKind::Resume),
            other => Err(EventParseError::UnknownKind(other.to_string())),
        }
    }
}

/// Error raised for a control event payload that cannot be routed.
#[derive(Error, Debug)]
pub enum EventParseError {
    #[error("malformed control event: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown control event kind: {0}")]
    UnknownKind(String),

    #[error("control event has an empty channel id")]
    MissingChannel,
}

/// A stop/skip/pause/resume request for one channel.
///
/// Wire format: `{"type": "skip", "channelId": "...", "correlationId": "..."}`.
/// `kind` is accepted for `type` and `interactionId` for `correlationId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlEvent {
    #[serde(rename = "type", alias = "kind")]
    pub kind: ControlKind,
    pub channel_id: String,
    #[serde(default, alias = "interactionId", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ControlEvent {
    pub fn new(kind: ControlKind, channel_id: impl Into<String>) -> Self {
        Self {
            kind,
            channel_id: channel_id.into(),
            correlation_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Parse and validate a published payload.
    pub fn parse(payload: &str) -> Result<Self, EventParseError> {
        let event: ControlEvent = serde_json::from_str(payload)?;
        if event.channel_id.trim().is_empty() {
            return Err(EventParseError::MissingChannel);
        }
        Ok(event)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize() {
        let event = ControlEvent::new(ControlKind::Skip, "c1").with_correlation("i1");
        assert_eq!(
            event.to_json().unwrap(),
            r#"{"type":"skip","channelId":"c1","correlationId":"i1"}"#
        );
    }

    #[test]
    fn test_parse_accepts_aliases() {
        let event =
            ControlEvent::parse(r#"{"kind":"pause","channelId":"c1","interactionId":"i2"}"#)
                .unwrap();
        assert_eq!(event.kind, ControlKind::Pause);
        assert_eq!(event.correlation_id.as_deref(), Some("i2"));

        let event = ControlEvent::parse(r#"{"type":"stop","channelId":"c2"}"#).unwrap();
        assert_eq!(event.kind, ControlKind::Stop);
        assert_eq!(event.correlation_id, None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ControlEvent::parse("not json").is_err());
        assert!(ControlEvent::parse(r#"{"type":"rewind","channelId":"c1"}"#).is_err());
        assert!(matches!(
            ControlEvent::parse(r#"{"type":"skip","channelId":" "}"#),
            Err(EventParseError::MissingChannel)
        ));
        assert!(ControlEvent::parse(r#"{"type":"skip"}"#).is_err());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("Resume".parse::<ControlKind>().unwrap(), ControlKind::Resume);
        assert!("rewind".parse::<ControlKind>().is_err());
    }
}
