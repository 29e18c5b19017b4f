//! PBS Pro: `qsub`, `qstat -x -f`, `qdel`.
//!
//! Torque shares the submission side; see [`crate::torque`] for its status
//! vocabulary.

use std::path::Path;

use crate::status::{BackendStatus, SchedulerState, StatusQuery};
use crate::{walltime, BatchRequest, CommandLine};

pub(crate) fn directives(request: &BatchRequest) -> Vec<String> {
    let mut lines = header_directives(request);
    match (request.nodes, request.procs) {
        (Some(nodes), Some(procs)) => {
            lines.push(format!("#PBS -l select={}:ncpus={}", nodes, procs))
        }
        (Some(nodes), None) => lines.push(format!("#PBS -l select={}", nodes)),
        (None, Some(procs)) => lines.push(format!("#PBS -l ncpus={}", procs)),
        (None, None) => {}
    }
    trailer_directives(request, &mut lines);
    lines
}

/// Directives common to PBS Pro and Torque that precede resource lines.
pub(crate) fn header_directives(request: &BatchRequest) -> Vec<String> {
    let mut lines = vec![
        format!("#PBS -N {}", request.job_name),
        format!("#PBS -o {}", request.output_path.display()),
        format!("#PBS -e {}", request.error_path.display()),
    ];
    if let Some(ref queue) = request.queue {
        lines.push(format!("#PBS -q {}", queue));
    }
    if let Some(ref account) = request.account {
        lines.push(format!("#PBS -A {}", account));
    }
    lines
}

pub(crate) fn trailer_directives(request: &BatchRequest, lines: &mut Vec<String>) {
    if let Some(minutes) = request.time_limit_minutes {
        lines.push(format!("#PBS -l walltime={}", walltime(minutes)));
    }
    for option in &request.options {
        lines.push(format!("#PBS {}", option));
    }
}

pub(crate) fn submit_command(script: &Path) -> CommandLine {
    CommandLine::new("qsub").arg(script.display().to_string())
}

/// `qsub` prints the full job id, e.g. `1234.pbs-server`.
pub(crate) fn parse_submit_reply(stdout: &str) -> Option<String> {
    let id = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    if id.starts_with(|c: char| c.is_ascii_digit()) && !id.contains(char::is_whitespace) {
        Some(id.to_string())
    } else {
        None
    }
}

pub(crate) fn status_command(job_id: &str) -> CommandLine {
    CommandLine::new("qstat").arg("-x").arg("-f").arg(job_id)
}

pub(crate) fn parse_status(exit_code: i32, stdout: &str, stderr: &str) -> StatusQuery {
    parse_full_listing(exit_code, stdout, stderr, "Exit_status", map_state)
}

/// Shared reader for `qstat -f` attribute listings.
pub(crate) fn parse_full_listing(
    exit_code: i32,
    stdout: &str,
    stderr: &str,
    exit_attribute: &str,
    map: fn(&str) -> SchedulerState,
) -> StatusQuery {
    if stderr.contains("Unknown Job Id") || stdout.contains("Unknown Job Id") {
        return StatusQuery::Absent;
    }
    if exit_code != 0 {
        return StatusQuery::Error(format!(
            "qstat exited with {}: {}",
            exit_code,
            stderr.trim()
        ));
    }

    let mut raw = None;
    let mut exit = None;
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key == "job_state" {
            raw = Some(value.to_string());
        } else if key == exit_attribute {
            exit = value.parse().ok();
        }
    }

    match raw {
        Some(raw) => StatusQuery::Found(BackendStatus {
            state: map(&raw),
            raw,
            exit_code: exit,
        }),
        None => StatusQuery::Absent,
    }
}

/// PBS Pro job states from `qstat(1B)`.
pub(crate) fn map_state(literal: &str) -> SchedulerState {
    match literal {
        "Q" | "H" | "W" | "T" | "S" | "U" => SchedulerState::Pending,
        "R" | "E" | "B" => SchedulerState::Running,
        "F" | "X" => SchedulerState::Completed,
        _ => SchedulerState::Unrecognized,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const FINISHED: &str = "Job Id: 77.pbs\n    Job_Name = hostname\n    job_state = F\n    queue = workq\n    Exit_status = 0\n";

    #[test]
    fn test_directives_select() {
        let request = BatchRequest {
            job_name: "mpi".to_string(),
            output_path: PathBuf::from("mpi.out"),
            error_path: PathBuf::from("mpi.err"),
            nodes: Some(2),
            procs: Some(4),
            time_limit_minutes: Some(75),
            ..Default::default()
        };
        let lines = directives(&request);
        assert!(lines.contains(&"#PBS -l select=2:ncpus=4".to_string()));
        assert!(lines.contains(&"#PBS -l walltime=01:15:00".to_string()));
    }

    #[test]
    fn test_parse_submit_reply() {
        assert_eq!(parse_submit_reply("77.pbs\n"), Some("77.pbs".to_string()));
        assert_eq!(parse_submit_reply("qsub: Unknown queue\n"), None);
    }

    #[test]
    fn test_parse_status_finished() {
        assert_eq!(
            parse_status(0, FINISHED, ""),
            StatusQuery::Found(BackendStatus {
                state: SchedulerState::Completed,
                raw: "F".to_string(),
                exit_code: Some(0),
            })
        );
    }

    #[test]
    fn test_parse_status_queued_has_no_exit() {
        let listing = "Job Id: 78.pbs\n    job_state = Q\n";
        match parse_status(0, listing, "") {
            StatusQuery::Found(s) => {
                assert_eq!(s.state, SchedulerState::Pending);
                assert_eq!(s.exit_code, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_status_unknown_job() {
        assert_eq!(
            parse_status(153, "", "qstat: Unknown Job Id 79.pbs\n"),
            StatusQuery::Absent
        );
    }

    #[test]
    fn test_parse_status_server_down() {
        let status = parse_status(1, "", "Connection refused\n");
        assert!(matches!(status, StatusQuery::Error(_)));
    }
}
