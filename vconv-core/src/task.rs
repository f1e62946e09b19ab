use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to unmarshal task: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid video id {0}: must not be negative")]
    NegativeId(i64),
}

/// Conversion request delivered by the message transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTask {
    pub video_id: i64,
    /// Advisory only; the chunk directory is derived from `video_id`.
    #[serde(default)]
    pub path: String,
}

impl UploadTask {
    pub fn new(video_id: i64, path: impl Into<String>) -> Self {
        Self {
            video_id,
            path: path.into(),
        }
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let task: UploadTask = serde_json::from_slice(payload)?;
        if task.video_id < 0 {
            return Err(ParseError::NegativeId(task.video_id));
        }
        Ok(task)
    }

    pub fn to_payload(&self) -> Vec<u8> {
        // Serializing a struct of plain fields cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transport_payload() {
        let task = UploadTask::parse(br#"{"video_id": 42, "path": "upload/42"}"#).unwrap();
        assert_eq!(task, UploadTask::new(42, "upload/42"));
    }

    #[test]
    fn path_is_optional() {
        let task = UploadTask::parse(br#"{"video_id": 1}"#).unwrap();
        assert_eq!(task.video_id, 1);
        assert!(task.path.is_empty());
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            UploadTask::parse(b"not json"),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(
            UploadTask::parse(br#"{"video_id": "abc"}"#),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(
            UploadTask::parse(br#"{"path": "x"}"#),
            Err(ParseError::Json(_))
        ));
        assert!(matches!(
            UploadTask::parse(br#"{"video_id": -5}"#),
            Err(ParseError::NegativeId(-5))
        ));
    }

    #[test]
    fn payload_round_trips() {
        let task = UploadTask::new(8, "upload/8");
        assert_eq!(UploadTask::parse(&task.to_payload()).unwrap(), task);
    }
}
