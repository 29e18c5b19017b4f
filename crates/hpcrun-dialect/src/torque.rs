//! Torque: PBS-style submission, but `qstat -f` without history and a
//! different status vocabulary.

use crate::pbs;
use crate::status::{SchedulerState, StatusQuery};
use crate::{BatchRequest, CommandLine};

pub(crate) fn directives(request: &BatchRequest) -> Vec<String> {
    let mut lines = pbs::header_directives(request);
    match (request.nodes, request.procs) {
        (Some(nodes), Some(procs)) => lines.push(format!("#PBS -l nodes={}:ppn={}", nodes, procs)),
        (Some(nodes), None) => lines.push(format!("#PBS -l nodes={}", nodes)),
        (None, Some(procs)) => lines.push(format!("#PBS -l nodes=1:ppn={}", procs)),
        (None, None) => {}
    }
    pbs::trailer_directives(request, &mut lines);
    lines
}

pub(crate) fn status_command(job_id: &str) -> CommandLine {
    CommandLine::new("qstat").arg("-f").arg(job_id)
}

pub(crate) fn parse_status(exit_code: i32, stdout: &str, stderr: &str) -> StatusQuery {
    pbs::parse_full_listing(exit_code, stdout, stderr, "exit_status", map_state)
}

/// Torque job states from `qstat(1)`.
pub(crate) fn map_state(literal: &str) -> SchedulerState {
    match literal {
        "Q" | "H" | "W" | "T" | "S" => SchedulerState::Pending,
        "R" | "E" => SchedulerState::Running,
        "C" => SchedulerState::Completed,
        _ => SchedulerState::Unrecognized,
    }
}
