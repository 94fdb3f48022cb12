//! Archive API response types

use serde::{Deserialize, Serialize};

/// Response of `GET {base}?prefix=...`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    /// Keys matching the prefix on this page
    #[serde(default)]
    pub keys: Vec<String>,

    /// Marker to pass back for the next page, absent on the last page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_marker: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_response_defaults() {
        let page: ListResponse = serde_json::from_str("{}").unwrap();
        assert!(page.keys.is_empty());
        assert!(page.next_marker.is_none());

        let page: ListResponse =
            serde_json::from_str(r#"{"keys":["a","b"],"next_marker":"b"}"#).unwrap();
        assert_eq!(page.keys, vec!["a", "b"]);
        assert_eq!(page.next_marker.as_deref(), Some("b"));
    }
}
