use serde::{Deserialize, Serialize};

/// Requested output of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaFormat {
    /// Best audio stream only, no merge stage
    Audio,
    /// Best video and best audio, transferred concurrently then merged
    Video,
}

/// Body of `POST /download`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FetchRequest {
    pub url: String,
    pub format: MediaFormat,
    /// Session identifier previously received as `USER_ID`
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_request_parses() {
        let req: FetchRequest = serde_json::from_str(
            r#"{"url":"https://example.com/watch?v=1","format":"video","id":"Zk91a"}"#,
        )
        .unwrap();
        assert_eq!(req.format, MediaFormat::Video);
        assert_eq!(req.id, "Zk91a");

        assert!(serde_json::from_str::<FetchRequest>(
            r#"{"url":"x","format":"gif","id":"Zk91a"}"#
        )
        .is_err());
    }
}
