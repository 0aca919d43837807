use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of an ingested file.
///
/// `Completed` and `Failed` are terminal: no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, FileStatus::Completed | FileStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Processing -> Processing` is allowed so progress can be recorded.
    pub fn can_transition_to(self, next: FileStatus) -> bool {
        use FileStatus::*;
        matches!(
            (self, next),
            (Uploaded, Processing)
                | (Uploaded, Failed)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Uploaded => "uploaded",
            FileStatus::Processing => "processing",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use FileStatus::*;

    const ALL: [FileStatus; 4] = [Uploaded, Processing, Completed, Failed];

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [Completed, Failed] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_no_transition_back_to_uploaded() {
        for from in ALL {
            assert!(!from.can_transition_to(Uploaded));
        }
    }

    #[test]
    fn test_forward_transitions() {
        assert!(Uploaded.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Uploaded.can_transition_to(Completed));
    }

    #[test]
    fn test_serialized_as_lowercase() {
        assert_eq!(serde_json::to_string(&Processing).unwrap(), "\"processing\"");
        let parsed: FileStatus = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(parsed, Failed);
    }
}
