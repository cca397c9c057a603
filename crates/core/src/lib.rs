//! Sift core types: search modes and the Zoekt wire payload model.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod response;

pub use response::{MergedFiles, MultiNodeResponse, Response};

/// Identifier of a backend search node in the external registry.
pub type NodeId = i64;

/// How the query string is interpreted by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Query is a Zoekt regular expression, passed through untouched.
    Regex,
    /// Query is a literal string; metacharacters are escaped before sending.
    Exact,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Regex => "regex",
            SearchMode::Exact => "exact",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("invalid search mode: {0} (expect regex or exact)")]
pub struct InvalidSearchMode(pub String);

impl FromStr for SearchMode {
    type Err = InvalidSearchMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regex" => Ok(SearchMode::Regex),
            "exact" => Ok(SearchMode::Exact),
            other => Err(InvalidSearchMode(other.to_string())),
        }
    }
}

/// Where `file_count`/`match_count` come from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum CountSource {
    /// Trust the backend's pre-aggregated `FileCount`/`MatchCount`.
    #[default]
    Reported,
    /// Recompute both counters from the `Files` list.
    Derived,
}

/// Top-level body returned by a node. A populated `Error` marks a
/// per-query semantic failure (bad regex and the like); transport and
/// protocol failures never reach this type.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchPayload {
    #[serde(rename = "Result", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SearchResult>,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    #[serde(rename = "FileCount", default)]
    pub file_count: u64,
    #[serde(rename = "MatchCount", default)]
    pub match_count: u64,
    /// Zoekt emits `"Files": null` for empty result sets.
    #[serde(rename = "Files", default)]
    pub files: Option<Vec<FileMatch>>,
}

/// One matched file. Line-match payloads are opaque at this layer; they are
/// carried through for rendering but never inspected beyond counting.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileMatch {
    #[serde(rename = "FileName")]
    pub file_name: String,
    #[serde(rename = "RepositoryID", default)]
    pub repository_id: i64,
    #[serde(rename = "Score", default)]
    pub score: f64,
    #[serde(rename = "LineMatches", default)]
    pub line_matches: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_mode_parses_known_values() {
        assert_eq!("regex".parse::<SearchMode>().unwrap(), SearchMode::Regex);
        assert_eq!("exact".parse::<SearchMode>().unwrap(), SearchMode::Exact);
    }

    #[test]
    fn search_mode_rejects_unknown_values() {
        let err = "dummy".parse::<SearchMode>().unwrap_err();
        assert_eq!(err, InvalidSearchMode("dummy".to_string()));
    }

    #[test]
    fn payload_parses_zoekt_wire_names() {
        let body = r#"{"Result":{"FileCount":2,"MatchCount":10,"Files":[
            {"FileName":"a.rb","RepositoryID":7,"Score":9.5,"LineMatches":[{"Line":"x"}]},
            {"FileName":"b.rb","RepositoryID":7,"Score":2.0}
        ]}}"#;
        let p: SearchPayload = serde_json::from_str(body).unwrap();
        let result = p.result.unwrap();
        assert_eq!(result.file_count, 2);
        assert_eq!(result.match_count, 10);
        let files = result.files.unwrap();
        assert_eq!(files[0].file_name, "a.rb");
        assert_eq!(files[0].repository_id, 7);
        assert_eq!(files[1].line_matches.len(), 0);
    }

    #[test]
    fn payload_tolerates_null_files_and_error_bodies() {
        let p: SearchPayload =
            serde_json::from_str(r#"{"Result":{"FileCount":0,"MatchCount":0,"Files":null}}"#)
                .unwrap();
        assert!(p.result.unwrap().files.is_none());

        let p: SearchPayload =
            serde_json::from_str(r#"{"Error":"error parsing regexp: missing closing )"}"#).unwrap();
        assert!(p.result.is_none());
        assert_eq!(p.error.as_deref(), Some("error parsing regexp: missing closing )"));
    }
}
