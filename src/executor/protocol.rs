//! Wire protocol of the build connection.
//!
//! Close codes and the exit-code mapping are contractual: 1000 for a normal
//! completion, 1007 for protocol/input errors (including a build driver exit
//! of 2, which means the command itself was malformed), 1011 for everything
//! else.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_INVALID_PAYLOAD: u16 = 1007;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Build driver exit code meaning the command itself was invalid.
pub const EXIT_INVALID_COMMAND: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WsJobStatus {
    Starting,
    Running,
    Failed,
    Success,
}

/// One message on the build connection. `timestamp` is server-assigned
/// (milliseconds since epoch).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMessage {
    pub job_status: WsJobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_exit_code: Option<i32>,
    pub timestamp: i64,
}

impl WsMessage {
    fn new(job_status: WsJobStatus) -> Self {
        Self {
            job_status,
            msg: None,
            stdout: None,
            error: None,
            build_exit_code: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn starting(msg: impl Into<String>) -> Self {
        Self {
            msg: Some(msg.into()),
            ..Self::new(WsJobStatus::Starting)
        }
    }

    pub fn stdout_line(line: impl Into<String>) -> Self {
        Self {
            stdout: Some(line.into()),
            ..Self::new(WsJobStatus::Running)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(WsJobStatus::Failed)
        }
    }

    pub fn failed_with_code(error: impl Into<String>, exit_code: i32) -> Self {
        Self {
            error: Some(error.into()),
            build_exit_code: Some(exit_code),
            ..Self::new(WsJobStatus::Failed)
        }
    }

    pub fn success() -> Self {
        Self {
            msg: Some("Build was successful".to_string()),
            build_exit_code: Some(0),
            ..Self::new(WsJobStatus::Success)
        }
    }

    pub fn canceled() -> Self {
        Self {
            msg: Some("Build was canceled".to_string()),
            ..Self::new(WsJobStatus::Failed)
        }
    }

    pub fn already_running() -> Self {
        Self {
            error: Some("A build job is already running.".to_string()),
            ..Self::new(WsJobStatus::Running)
        }
    }
}

/// The job specification a node hands to its executor after winning a claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    pub id: Uuid,
    pub builder_id: String,
    pub build_options: BuildOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOptions {
    pub command: String,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
}

impl BuildSpec {
    /// Schema check beyond what deserialization enforces.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        if self.builder_id.is_empty() {
            return Err("builderId must not be empty");
        }
        if self.build_options.command.trim().is_empty() {
            return Err("buildOptions.command must not be empty");
        }
        Ok(())
    }
}

/// Terminal outcome of a finished build process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disposition {
    pub message: WsMessage,
    pub close_code: u16,
}

impl PartialEq for WsMessage {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are server-assigned; equality is about content.
        self.job_status == other.job_status
            && self.msg == other.msg
            && self.stdout == other.stdout
            && self.error == other.error
            && self.build_exit_code == other.build_exit_code
    }
}

impl Eq for WsMessage {}

/// Map a build process exit to its terminal message and close code.
/// Exit 0 → success/1000, exit 2 → failed/1007 (malformed command),
/// anything else → failed/1011.
pub fn exit_disposition(exit_code: Option<i32>, command: &str) -> Disposition {
    match exit_code {
        Some(0) => Disposition {
            message: WsMessage::success(),
            close_code: CLOSE_NORMAL,
        },
        Some(EXIT_INVALID_COMMAND) => Disposition {
            message: WsMessage::failed_with_code(
                format!("Invalid command: '{command}'"),
                EXIT_INVALID_COMMAND,
            ),
            close_code: CLOSE_INVALID_PAYLOAD,
        },
        Some(code) => Disposition {
            message: WsMessage::failed_with_code(
                format!(
                    "Something went wrong while building. Builder exited with error code {code}"
                ),
                code,
            ),
            close_code: CLOSE_INTERNAL_ERROR,
        },
        None => Disposition {
            message: WsMessage::failed(
                "Something went wrong while building. Builder was terminated by a signal",
            ),
            close_code: CLOSE_INTERNAL_ERROR,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_zero_is_success_with_normal_close() {
        let d = exit_disposition(Some(0), "nix build .");
        assert_eq!(d.close_code, CLOSE_NORMAL);
        assert_eq!(d.message.job_status, WsJobStatus::Success);
        assert_eq!(d.message.build_exit_code, Some(0));
    }

    #[test]
    fn exit_two_names_the_invalid_command() {
        let d = exit_disposition(Some(2), "frobnicate --all");
        assert_eq!(d.close_code, CLOSE_INVALID_PAYLOAD);
        assert_eq!(d.message.job_status, WsJobStatus::Failed);
        assert_eq!(d.message.build_exit_code, Some(2));
        assert_eq!(
            d.message.error.as_deref(),
            Some("Invalid command: 'frobnicate --all'")
        );
    }

    #[test]
    fn other_exit_codes_are_internal_errors() {
        for code in [1, 3, 127, 255] {
            let d = exit_disposition(Some(code), "nix build .");
            assert_eq!(d.close_code, CLOSE_INTERNAL_ERROR);
            assert_eq!(d.message.job_status, WsJobStatus::Failed);
            assert_eq!(d.message.build_exit_code, Some(code));
        }
    }

    #[test]
    fn signal_termination_is_internal_error() {
        let d = exit_disposition(None, "nix build .");
        assert_eq!(d.close_code, CLOSE_INTERNAL_ERROR);
        assert!(d.message.build_exit_code.is_none());
    }

    #[test]
    fn message_wire_format_is_camel_case() {
        let msg = WsMessage::failed_with_code("boom", 3);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"jobStatus\":\"failed\""));
        assert!(json.contains("\"buildExitCode\":3"));
        assert!(json.contains("\"timestamp\":"));
        // Unset optional fields stay off the wire.
        assert!(!json.contains("stdout"));
        assert!(!json.contains("msg"));
    }

    #[test]
    fn spec_round_trips_through_validation_unchanged() {
        let json = r#"{
            "id": "3fa5c3a0-68e1-4e4e-9b32-52e403c0b0a1",
            "builderId": "b1",
            "buildOptions": {"command": "nix build .#default"}
        }"#;
        let spec: BuildSpec = serde_json::from_str(json).unwrap();
        spec.validate().unwrap();
        let reparsed: BuildSpec =
            serde_json::from_str(&serde_json::to_string(&spec).unwrap()).unwrap();
        assert_eq!(reparsed.id, spec.id);
        assert_eq!(reparsed.build_options.command, spec.build_options.command);
    }

    #[test]
    fn spec_rejects_empty_command() {
        let json = r#"{
            "id": "3fa5c3a0-68e1-4e4e-9b32-52e403c0b0a1",
            "builderId": "b1",
            "buildOptions": {"command": "  "}
        }"#;
        let spec: BuildSpec = serde_json::from_str(json).unwrap();
        assert!(spec.validate().is_err());
    }
}
