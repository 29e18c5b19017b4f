//! Identifier resolution
//!
//! Accepted forms, tried in order:
//! - a full job id: exactly that job
//! - `name/prefix`: most recent job of `name` whose id starts with `prefix`
//! - `name`: most recent job of that name
//! - an id prefix: most recent job whose id starts with it, as long as all
//!   such jobs belong to one test name
//!
//! "Most recent" is the latest end time, ties broken by recording order.

use uuid::Uuid;

use crate::job::Job;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("no job matches '{ident}'{}", candidate_list(.candidates))]
    NotFound {
        ident: String,
        candidates: Vec<String>,
    },

    #[error("'{ident}' is ambiguous{}", candidate_list(.candidates))]
    Ambiguous {
        ident: String,
        candidates: Vec<String>,
    },
}

fn candidate_list(candidates: &[String]) -> String {
    if candidates.is_empty() {
        String::new()
    } else {
        format!("; candidates: {}", candidates.join(", "))
    }
}

/// Most recent of `jobs`
fn latest<'a>(jobs: impl Iterator<Item = &'a Job>) -> Option<&'a Job> {
    jobs.enumerate()
        .max_by_key(|(index, job)| (job.end_time, *index))
        .map(|(_, job)| job)
}

fn names(jobs: &[&Job]) -> Vec<String> {
    let mut names: Vec<String> = jobs.iter().map(|j| j.test_name.clone()).collect();
    names.sort();
    names.dedup();
    names
}

/// Resolve `ident` against `records` (in recording order)
pub fn resolve<'a>(records: &'a [Job], ident: &str) -> Result<&'a Job, ResolveError> {
    let ident = ident.trim();

    if let Ok(id) = Uuid::parse_str(ident) {
        return records
            .iter()
            .find(|job| job.id == id)
            .ok_or_else(|| ResolveError::NotFound {
                ident: ident.to_string(),
                candidates: Vec::new(),
            });
    }

    if let Some((name, prefix)) = ident.split_once('/') {
        let of_name: Vec<&Job> = records.iter().filter(|j| j.test_name == name).collect();
        return latest(
            of_name
                .iter()
                .copied()
                .filter(|j| j.id.to_string().starts_with(prefix)),
        )
        .ok_or_else(|| ResolveError::NotFound {
            ident: ident.to_string(),
            candidates: of_name
                .iter()
                .map(|j| format!("{}/{}", j.test_name, j.short_id()))
                .collect(),
        });
    }

    if let Some(job) = latest(records.iter().filter(|j| j.test_name == ident)) {
        return Ok(job);
    }

    let by_prefix: Vec<&Job> = if ident.is_empty() {
        Vec::new()
    } else {
        records
            .iter()
            .filter(|j| j.id.to_string().starts_with(ident))
            .collect()
    };
    if names(&by_prefix).len() > 1 {
        return Err(ResolveError::Ambiguous {
            ident: ident.to_string(),
            candidates: by_prefix
                .iter()
                .map(|j| format!("{}/{}", j.test_name, j.id))
                .collect(),
        });
    }
    latest(by_prefix.into_iter()).ok_or_else(|| ResolveError::NotFound {
        ident: ident.to_string(),
        candidates: names(&records.iter().collect::<Vec<_>>()),
    })
}
