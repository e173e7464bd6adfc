//! JSON-facing request and response types, plus the thin wrappers that bind
//! them to a [`CommandManager`].
//!
//! Numeric parameters arrive as strings ("timeout": "2.5") to suit callers
//! that cannot emit typed JSON numbers. Defaults match what an interactive
//! caller expects: run waits 1s, status does not wait, send_input waits 1s.
//!
//! Caller mistakes (unknown id, malformed parameter, both or neither of
//! input/terminate) come back as an `{error}` value; only run propagates
//! faults such as a failed spawn.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::manager::{CommandManager, InputAction, SessionSummary, StatusSnapshot};
use crate::session::CommandStatus;

const MAX_WAIT_SECS: f64 = 10.0;

fn default_run_timeout() -> String {
    "1".to_string()
}

fn default_status_wait() -> String {
    "0".to_string()
}

fn default_input_wait() -> String {
    "1".to_string()
}

fn default_output_lines() -> String {
    "50".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunParams {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Seconds to wait for completion before returning a running result
    #[serde(default = "default_run_timeout")]
    pub timeout: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusParams {
    pub command_id: String,
    /// Seconds to wait for completion before snapshotting
    #[serde(default = "default_status_wait")]
    pub wait: String,
    #[serde(default = "default_output_lines")]
    pub output_lines: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendInputParams {
    pub command_id: String,
    /// Text delivered verbatim to the child's stdin
    #[serde(default)]
    pub input: Option<String>,
    /// "true" to stop the command instead of sending input
    #[serde(default)]
    pub terminate: Option<String>,
    #[serde(default = "default_input_wait")]
    pub wait: String,
}

#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub status: CommandStatus,
    pub command_id: String,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Response for status and send_input: either a session snapshot or a
/// structured error.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PollResponse {
    Snapshot {
        status: CommandStatus,
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Serialize)]
pub struct SessionEntry {
    pub command_id: String,
    pub status: CommandStatus,
    pub output_lines: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Start a command. Spawn failures and other faults propagate to the caller
/// as errors; a command that merely runs past the timeout is a success with
/// `status: running`.
pub async fn run(manager: &CommandManager, params: RunParams) -> Result<RunResponse, ExecError> {
    let timeout = parse_seconds(&params.timeout, "timeout")?;
    let outcome = manager
        .run(&params.command, params.cwd.as_deref(), timeout)
        .await?;
    Ok(RunResponse {
        status: outcome.status,
        command_id: outcome.command_id,
        output: outcome.output,
        exit_code: outcome.exit_code,
    })
}

/// Poll a session's status and recent output.
pub async fn status(manager: &CommandManager, params: StatusParams) -> PollResponse {
    match status_inner(manager, params).await {
        Ok(snapshot) => snapshot_response(snapshot),
        Err(err) => PollResponse::Error {
            error: err.to_string(),
        },
    }
}

async fn status_inner(
    manager: &CommandManager,
    params: StatusParams,
) -> Result<StatusSnapshot, ExecError> {
    let wait = parse_seconds(&params.wait, "wait")?;
    let output_lines = parse_line_count(&params.output_lines)?;
    manager.status(&params.command_id, wait, output_lines).await
}

/// Send input to a session or terminate it. Exactly one of `input` and
/// `terminate` must be provided; anything else is rejected before the
/// session is touched.
pub async fn send_input(manager: &CommandManager, params: SendInputParams) -> PollResponse {
    match send_input_inner(manager, params).await {
        Ok(snapshot) => snapshot_response(snapshot),
        Err(err) => PollResponse::Error {
            error: err.to_string(),
        },
    }
}

async fn send_input_inner(
    manager: &CommandManager,
    params: SendInputParams,
) -> Result<StatusSnapshot, ExecError> {
    let wait = parse_seconds(&params.wait, "wait")?;
    let terminate = params
        .terminate
        .as_deref()
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let action = match (params.input, terminate) {
        (Some(_), true) => {
            return Err(ExecError::InvalidParam(
                "provide either 'input' or 'terminate', not both".into(),
            ));
        }
        (None, false) => {
            return Err(ExecError::InvalidParam(
                "either 'input' or 'terminate' must be provided".into(),
            ));
        }
        (Some(text), false) => InputAction::Text(text),
        (None, true) => InputAction::Terminate,
    };
    manager.send_input(&params.command_id, action, wait).await
}

/// List all live sessions, oldest first.
pub async fn list(manager: &CommandManager) -> Vec<SessionEntry> {
    manager
        .list()
        .await
        .into_iter()
        .map(|s: SessionSummary| SessionEntry {
            command_id: s.command_id,
            status: s.status,
            output_lines: s.output_lines,
            exit_code: s.exit_code,
            started_at: s.started_at,
        })
        .collect()
}

fn snapshot_response(snapshot: StatusSnapshot) -> PollResponse {
    PollResponse::Snapshot {
        status: snapshot.status,
        output: snapshot.output,
        exit_code: snapshot.exit_code,
    }
}

/// Parse a seconds value from its string form, clamping to [0, 10].
fn parse_seconds(raw: &str, what: &str) -> Result<Duration, ExecError> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| ExecError::InvalidParam(format!("{what} must be numeric, got '{raw}'")))?;
    if !value.is_finite() {
        return Err(ExecError::InvalidParam(format!(
            "{what} must be finite, got '{raw}'"
        )));
    }
    Ok(Duration::from_secs_f64(value.clamp(0.0, MAX_WAIT_SECS)))
}

fn parse_line_count(raw: &str) -> Result<usize, ExecError> {
    raw.trim().parse().map_err(|_| {
        ExecError::InvalidParam(format!("output_lines must be a non-negative integer, got '{raw}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use serde_json::json;

    fn manager() -> CommandManager {
        CommandManager::new(ManagerConfig {
            shell: "/bin/sh".into(),
            ..ManagerConfig::default()
        })
    }

    #[test]
    fn run_params_default_timeout_is_one_second() {
        let params: RunParams = serde_json::from_value(json!({"command": "ls"})).expect("params");
        assert_eq!(params.timeout, "1");
        assert_eq!(params.cwd, None);
    }

    #[test]
    fn status_params_defaults() {
        let params: StatusParams =
            serde_json::from_value(json!({"command_id": "cmd_1"})).expect("params");
        assert_eq!(params.wait, "0");
        assert_eq!(params.output_lines, "50");
    }

    #[test]
    fn seconds_are_clamped_to_ten() {
        assert_eq!(
            parse_seconds("99", "timeout").expect("parse"),
            Duration::from_secs(10)
        );
        assert_eq!(
            parse_seconds("-3", "timeout").expect("parse"),
            Duration::ZERO
        );
        assert_eq!(
            parse_seconds("2.5", "timeout").expect("parse"),
            Duration::from_millis(2500)
        );
    }

    #[test]
    fn malformed_seconds_are_rejected() {
        assert!(parse_seconds("soon", "wait").is_err());
        assert!(parse_seconds("NaN", "wait").is_err());
        assert!(parse_line_count("-1").is_err());
    }

    #[tokio::test]
    async fn send_input_with_both_fields_is_an_error() {
        let response = send_input(
            &manager(),
            SendInputParams {
                command_id: "cmd_1".into(),
                input: Some("x\n".into()),
                terminate: Some("true".into()),
                wait: "0".into(),
            },
        )
        .await;
        let value = serde_json::to_value(&response).expect("serialize");
        assert!(
            value["error"]
                .as_str()
                .expect("error field")
                .contains("not both")
        );
    }

    #[tokio::test]
    async fn send_input_with_neither_field_is_an_error() {
        let response = send_input(
            &manager(),
            SendInputParams {
                command_id: "cmd_1".into(),
                input: None,
                terminate: None,
                wait: "0".into(),
            },
        )
        .await;
        let value = serde_json::to_value(&response).expect("serialize");
        assert!(value.get("error").is_some());
    }

    #[tokio::test]
    async fn unknown_id_is_a_structured_error() {
        let response = status(
            &manager(),
            StatusParams {
                command_id: "cmd_404".into(),
                wait: "0".into(),
                output_lines: "50".into(),
            },
        )
        .await;
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["error"], "Command 'cmd_404' not found");
    }

    #[test]
    fn running_response_omits_exit_code() {
        let response = RunResponse {
            status: CommandStatus::Running,
            command_id: "cmd_1".into(),
            output: String::new(),
            exit_code: None,
        };
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["status"], "running");
        assert!(value.get("exit_code").is_none());
    }

    #[test]
    fn done_response_includes_exit_code() {
        let response = RunResponse {
            status: CommandStatus::Done,
            command_id: "cmd_1".into(),
            output: "hi".into(),
            exit_code: Some(0),
        };
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["status"], "done");
        assert_eq!(value["exit_code"], 0);
    }
}
