//! IBM Spectrum LSF: `bsub`, `bjobs`, `bkill`.

use std::path::Path;

use crate::status::{BackendStatus, SchedulerState, StatusQuery};
use crate::{BatchRequest, CommandLine};

pub(crate) fn directives(request: &BatchRequest) -> Vec<String> {
    let mut lines = vec![
        format!("#BSUB -J {}", request.job_name),
        format!("#BSUB -o {}", request.output_path.display()),
        format!("#BSUB -e {}", request.error_path.display()),
    ];
    if let Some(ref queue) = request.queue {
        lines.push(format!("#BSUB -q {}", queue));
    }
    if let Some(ref account) = request.account {
        lines.push(format!("#BSUB -P {}", account));
    }
    if let Some(nodes) = request.nodes {
        lines.push(format!("#BSUB -nnodes {}", nodes));
    }
    if let Some(procs) = request.procs {
        lines.push(format!("#BSUB -n {}", procs));
    }
    if let Some(minutes) = request.time_limit_minutes {
        lines.push(format!("#BSUB -W {}", minutes));
    }
    for option in &request.options {
        lines.push(format!("#BSUB {}", option));
    }
    lines
}

/// `#BSUB` directives are only honoured when the script arrives on stdin.
pub(crate) fn submit_command(script: &Path) -> CommandLine {
    CommandLine::new("bsub").stdin_from(script)
}

/// `bsub` replies `Job <1234> is submitted to queue <batch>.`
pub(crate) fn parse_submit_reply(stdout: &str) -> Option<String> {
    let line = stdout.lines().find(|l| l.contains("is submitted"))?;
    let start = line.find('<')? + 1;
    let end = start + line[start..].find('>')?;
    let id = &line[start..end];
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

pub(crate) fn status_command(job_id: &str) -> CommandLine {
    CommandLine::new("bjobs")
        .arg("-noheader")
        .arg("-o")
        .arg("stat exit_code delimiter='|'")
        .arg(job_id)
}

pub(crate) fn parse_status(exit_code: i32, stdout: &str, stderr: &str) -> StatusQuery {
    // bjobs reports unknown ids on either stream, with or without a zero exit
    if stdout.contains("is not found") || stderr.contains("is not found") {
        return StatusQuery::Absent;
    }
    if exit_code != 0 {
        return StatusQuery::Error(format!(
            "bjobs exited with {}: {}",
            exit_code,
            stderr.trim()
        ));
    }

    let line = match stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(l) => l,
        None => return StatusQuery::Absent,
    };

    let mut fields = line.split('|');
    let raw = fields.next().unwrap_or("").trim().to_string();
    let state = map_state(&raw);

    // EXIT_CODE prints "-" for a zero exit
    let exit = match fields.next().map(str::trim) {
        Some("-") | Some("") | None => {
            if state == SchedulerState::Completed {
                Some(0)
            } else {
                None
            }
        }
        Some(code) => code.parse().ok(),
    };

    StatusQuery::Found(BackendStatus {
        state,
        raw,
        exit_code: exit,
    })
}

/// Job states from the `bjobs(1)` description of the STAT field.
pub(crate) fn map_state(literal: &str) -> SchedulerState {
    match literal {
        "PEND" | "PSUSP" | "USUSP" | "SSUSP" | "WAIT" | "PROV" => SchedulerState::Pending,
        "RUN" => SchedulerState::Running,
        "DONE" => SchedulerState::Completed,
        "EXIT" => SchedulerState::Failed,
        _ => SchedulerState::Unrecognized,
    }
}
