//! Slurm: `sbatch`, `sacct`, `scancel`.
//!
//! Status comes from `sacct` rather than `squeue` because `squeue` forgets a
//! job shortly after it leaves the queue, while the accounting database keeps
//! the final state and exit code.

use std::path::Path;

use crate::status::{BackendStatus, SchedulerState, StatusQuery};
use crate::{BatchRequest, CommandLine};

pub(crate) fn directives(request: &BatchRequest) -> Vec<String> {
    let mut lines = vec![
        format!("#SBATCH --job-name={}", request.job_name),
        format!("#SBATCH --output={}", request.output_path.display()),
        format!("#SBATCH --error={}", request.error_path.display()),
    ];
    if let Some(ref partition) = request.queue {
        lines.push(format!("#SBATCH --partition={}", partition));
    }
    if let Some(ref account) = request.account {
        lines.push(format!("#SBATCH --account={}", account));
    }
    if let Some(ref qos) = request.qos {
        lines.push(format!("#SBATCH --qos={}", qos));
    }
    if let Some(nodes) = request.nodes {
        lines.push(format!("#SBATCH --nodes={}", nodes));
    }
    if let Some(procs) = request.procs {
        lines.push(format!("#SBATCH --ntasks={}", procs));
    }
    if let Some(minutes) = request.time_limit_minutes {
        lines.push(format!("#SBATCH --time={}", minutes));
    }
    for option in &request.options {
        lines.push(format!("#SBATCH {}", option));
    }
    lines
}

pub(crate) fn submit_command(script: &Path) -> CommandLine {
    CommandLine::new("sbatch")
        .arg("--parsable")
        .arg(script.display().to_string())
}

/// `sbatch --parsable` prints `<jobid>` or `<jobid>;<cluster>`.
pub(crate) fn parse_submit_reply(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

pub(crate) fn status_command(job_id: &str) -> CommandLine {
    CommandLine::new("sacct")
        .arg("-j")
        .arg(job_id)
        .arg("-X")
        .arg("-n")
        .arg("-P")
        .arg("-o")
        .arg("State,ExitCode")
}

pub(crate) fn parse_status(exit_code: i32, stdout: &str, stderr: &str) -> StatusQuery {
    if exit_code != 0 {
        return StatusQuery::Error(format!(
            "sacct exited with {}: {}",
            exit_code,
            stderr.trim()
        ));
    }

    // Accounting may lag submission; no row means no record yet.
    let line = match stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(l) => l,
        None => return StatusQuery::Absent,
    };

    let mut fields = line.split('|');
    let state_field = fields.next().unwrap_or("").trim();
    // "CANCELLED by 1234" carries the uid of the canceller
    let raw = state_field
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_end_matches('+')
        .to_string();
    let exit = fields.next().and_then(parse_exit_code);

    StatusQuery::Found(BackendStatus {
        state: map_state(&raw),
        raw,
        exit_code: exit,
    })
}

/// `ExitCode` is `<code>:<signal>`; a signal with a zero code maps to 128+signal.
fn parse_exit_code(field: &str) -> Option<i32> {
    let mut parts = field.trim().split(':');
    let code: i32 = parts.next()?.trim().parse().ok()?;
    let signal: i32 = parts.next().and_then(|s| s.trim().parse().ok()).unwrap_or(0);
    if code == 0 && signal != 0 {
        Some(128 + signal)
    } else {
        Some(code)
    }
}

/// Job state codes from the `sacct(1)` JOB STATE CODES section.
pub(crate) fn map_state(literal: &str) -> SchedulerState {
    match literal {
        "PENDING" | "REQUEUED" | "REQUEUE_FED" | "REQUEUE_HOLD" | "RESV_DEL_HOLD"
        | "SUSPENDED" | "CONFIGURING" => SchedulerState::Pending,
        "RUNNING" | "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "RESIZING" => {
            SchedulerState::Running
        }
        "COMPLETED" => SchedulerState::Completed,
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" | "REVOKED" | "SPECIAL_EXIT" => SchedulerState::Failed,
        "CANCELLED" => SchedulerState::Cancelled,
        _ => SchedulerState::Unrecognized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_directives_include_resources() {
        let request = BatchRequest {
            job_name: "hostname".to_string(),
            output_path: PathBuf::from("/r/hostname.out"),
            error_path: PathBuf::from("/r/hostname.err"),
            queue: Some("debug".to_string()),
            account: Some("m1234".to_string()),
            qos: Some("premium".to_string()),
            nodes: Some(2),
            procs: Some(8),
            time_limit_minutes: Some(10),
            options: vec!["--exclusive".to_string()],
        };
        let lines = directives(&request);
        assert_eq!(lines[0], "#SBATCH --job-name=hostname");
        assert!(lines.contains(&"#SBATCH --partition=debug".to_string()));
        assert!(lines.contains(&"#SBATCH --account=m1234".to_string()));
        assert!(lines.contains(&"#SBATCH --qos=premium".to_string()));
        assert!(lines.contains(&"#SBATCH --nodes=2".to_string()));
        assert!(lines.contains(&"#SBATCH --ntasks=8".to_string()));
        assert!(lines.contains(&"#SBATCH --time=10".to_string()));
        assert_eq!(lines.last().unwrap(), "#SBATCH --exclusive");
    }

    #[test]
    fn test_parse_submit_reply() {
        assert_eq!(parse_submit_reply("4242\n"), Some("4242".to_string()));
        assert_eq!(parse_submit_reply("4242;perlmutter\n"), Some("4242".to_string()));
        assert_eq!(
            parse_submit_reply("sbatch: error: invalid partition"),
            None
        );
    }

    #[test]
    fn test_parse_status_running() {
        let status = parse_status(0, "RUNNING|0:0\n", "");
        match status {
            StatusQuery::Found(s) => {
                assert_eq!(s.state, SchedulerState::Running);
                assert_eq!(s.raw, "RUNNING");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_completed_with_exit_code() {
        let status = parse_status(0, "FAILED|3:0\n", "");
        assert_eq!(
            status,
            StatusQuery::Found(BackendStatus {
                state: SchedulerState::Failed,
                raw: "FAILED".to_string(),
                exit_code: Some(3),
            })
        );
    }

    #[test]
    fn test_parse_status_cancelled_by_uid() {
        match parse_status(0, "CANCELLED by 501|0:15\n", "") {
            StatusQuery::Found(s) => {
                assert_eq!(s.state, SchedulerState::Cancelled);
                assert_eq!(s.exit_code, Some(143));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_empty_is_absent() {
        assert_eq!(parse_status(0, "\n", ""), StatusQuery::Absent);
    }

    #[test]
    fn test_parse_status_error() {
        let status = parse_status(1, "", "sacct: error: slurmdbd unreachable");
        assert!(matches!(status, StatusQuery::Error(msg) if msg.contains("slurmdbd")));
    }

    #[test]
    fn test_unknown_literal_not_guessed() {
        assert_eq!(map_state("SOMETHING_NEW"), SchedulerState::Unrecognized);
    }
}
