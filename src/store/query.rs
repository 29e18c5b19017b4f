//! Report queries
//!
//! Filtering, field selection and per-name summaries over report records.
//! Everything here works on a slice of records already read from the store.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::job::{Job, JobState, Verdict};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("unknown filter field '{field}' (valid: {valid})")]
    UnknownFilterField { field: String, valid: String },

    #[error("unknown format field '{field}' (valid: {valid})")]
    UnknownFormatField { field: String, valid: String },

    #[error("invalid filter '{0}': expected key=value")]
    MalformedFilter(String),

    #[error("invalid value '{value}' for filter '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Fields a report can be filtered on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterField {
    Name,
    State,
    Verdict,
    Executor,
    Returncode,
    Tags,
    BuildId,
}

impl FilterField {
    pub const ALL: [FilterField; 7] = [
        FilterField::Name,
        FilterField::State,
        FilterField::Verdict,
        FilterField::Executor,
        FilterField::Returncode,
        FilterField::Tags,
        FilterField::BuildId,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterField::Name => "name",
            FilterField::State => "state",
            FilterField::Verdict => "verdict",
            FilterField::Executor => "executor",
            FilterField::Returncode => "returncode",
            FilterField::Tags => "tags",
            FilterField::BuildId => "build_id",
        }
    }
}

impl FromStr for FilterField {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FilterField::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| QueryError::UnknownFilterField {
                field: s.to_string(),
                valid: FilterField::ALL.map(|f| f.as_str()).join(", "),
            })
    }
}

/// Fields a report row can show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatField {
    Name,
    Id,
    State,
    Verdict,
    Returncode,
    Starttime,
    Endtime,
    Runtime,
    Testroot,
    Outputfile,
    Errorfile,
    Executor,
    BackendId,
    BuildId,
    Tags,
}

impl FormatField {
    pub const ALL: [FormatField; 15] = [
        FormatField::Name,
        FormatField::Id,
        FormatField::State,
        FormatField::Verdict,
        FormatField::Returncode,
        FormatField::Starttime,
        FormatField::Endtime,
        FormatField::Runtime,
        FormatField::Testroot,
        FormatField::Outputfile,
        FormatField::Errorfile,
        FormatField::Executor,
        FormatField::BackendId,
        FormatField::BuildId,
        FormatField::Tags,
    ];

    pub const DEFAULT: [FormatField; 8] = [
        FormatField::Name,
        FormatField::Id,
        FormatField::State,
        FormatField::Verdict,
        FormatField::Returncode,
        FormatField::Starttime,
        FormatField::Endtime,
        FormatField::Runtime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FormatField::Name => "name",
            FormatField::Id => "id",
            FormatField::State => "state",
            FormatField::Verdict => "verdict",
            FormatField::Returncode => "returncode",
            FormatField::Starttime => "starttime",
            FormatField::Endtime => "endtime",
            FormatField::Runtime => "runtime",
            FormatField::Testroot => "testroot",
            FormatField::Outputfile => "outputfile",
            FormatField::Errorfile => "errorfile",
            FormatField::Executor => "executor",
            FormatField::BackendId => "backend_id",
            FormatField::BuildId => "build_id",
            FormatField::Tags => "tags",
        }
    }

    /// Value of this field for `job`; empty when absent
    pub fn value(&self, job: &Job) -> String {
        fn opt<T: fmt::Display>(value: Option<T>) -> String {
            value.map(|v| v.to_string()).unwrap_or_default()
        }

        match self {
            FormatField::Name => job.test_name.clone(),
            FormatField::Id => job.id.to_string(),
            FormatField::State => job.state.to_string(),
            FormatField::Verdict => opt(job.verdict),
            FormatField::Returncode => opt(job.returncode),
            FormatField::Starttime => opt(job.start_time.map(|t| t.to_rfc3339())),
            FormatField::Endtime => opt(job.end_time.map(|t| t.to_rfc3339())),
            FormatField::Runtime => opt(job.runtime().map(|r| format!("{:.3}", r))),
            FormatField::Testroot => job.test_root_path.display().to_string(),
            FormatField::Outputfile => job.output_path.display().to_string(),
            FormatField::Errorfile => job.error_path.display().to_string(),
            FormatField::Executor => job.executor_ref.clone(),
            FormatField::BackendId => opt(job.backend_job_id.as_ref()),
            FormatField::BuildId => job.build_id.to_string(),
            FormatField::Tags => job.tags.join(" "),
        }
    }
}

impl FromStr for FormatField {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FormatField::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| QueryError::UnknownFormatField {
                field: s.to_string(),
                valid: FormatField::ALL.map(|f| f.as_str()).join(", "),
            })
    }
}

/// Parse a comma-separated format field list
pub fn parse_format(spec: &str) -> Result<Vec<FormatField>, QueryError> {
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(FormatField::from_str)
        .collect()
}

/// Conjunction of `field=value` conditions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    conditions: Vec<(FilterField, String)>,
}

impl Filter {
    /// Parse `key=value[,key=value...]`
    pub fn parse(spec: &str) -> Result<Self, QueryError> {
        let mut filter = Filter::default();
        for pair in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| QueryError::MalformedFilter(pair.to_string()))?;
            filter = filter.with(key.trim().parse()?, value.trim())?;
        }
        Ok(filter)
    }

    /// Add a condition, validating the value for its field
    pub fn with(mut self, field: FilterField, value: &str) -> Result<Self, QueryError> {
        let invalid = |reason: &str| QueryError::InvalidValue {
            field: field.as_str().to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let value = match field {
            FilterField::Returncode => {
                value.parse::<i32>().map_err(|_| invalid("must be an integer"))?;
                value.to_string()
            }
            FilterField::BuildId => {
                value
                    .parse::<u64>()
                    .map_err(|_| invalid("must be a non-negative integer"))?;
                value.to_string()
            }
            FilterField::State => JobState::parse(value)
                .ok_or_else(|| invalid("not a job state"))?
                .as_str()
                .to_string(),
            FilterField::Verdict => Verdict::parse(value)
                .ok_or_else(|| invalid("must be PASS or FAIL"))?
                .as_str()
                .to_string(),
            FilterField::Name | FilterField::Executor | FilterField::Tags => value.to_string(),
        };
        self.conditions.push((field, value));
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.conditions.iter().all(|(field, value)| match field {
            FilterField::Name => job.test_name == *value,
            FilterField::State => job.state.as_str() == value.as_str(),
            FilterField::Verdict => job.verdict.map(|v| v.as_str()) == Some(value.as_str()),
            FilterField::Executor => job.executor_ref == *value,
            FilterField::Returncode => {
                job.returncode.map(|c| c.to_string()).as_deref() == Some(value.as_str())
            }
            FilterField::Tags => job.tags.iter().any(|t| t == value),
            FilterField::BuildId => job.build_id.to_string() == *value,
        })
    }
}

/// Which records per test name to keep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    All,
    /// Most recent record per name
    Latest,
    /// Earliest record per name
    Oldest,
}

#[derive(Debug, Clone, Default)]
pub struct ReportQuery {
    pub filter: Filter,
    pub selection: Selection,
    /// Keep only the N most recent records overall
    pub count: Option<usize>,
}

/// Sort key: end time, falling back to recording order
fn recency(records: &[Job]) -> Vec<(usize, &Job)> {
    let mut ordered: Vec<(usize, &Job)> = records.iter().enumerate().collect();
    ordered.sort_by_key(|(index, job)| (job.end_time, *index));
    ordered
}

/// Run `query` over `records`, oldest first
pub fn select<'a>(records: &'a [Job], query: &ReportQuery) -> Vec<&'a Job> {
    let mut matching: Vec<&Job> = recency(records)
        .into_iter()
        .map(|(_, job)| job)
        .filter(|job| query.filter.matches(job))
        .collect();

    match query.selection {
        Selection::All => {}
        Selection::Latest | Selection::Oldest => {
            let mut chosen: BTreeMap<&str, &Job> = BTreeMap::new();
            for job in matching.iter().copied() {
                if query.selection == Selection::Latest {
                    chosen.insert(&job.test_name, job);
                } else {
                    chosen.entry(&job.test_name).or_insert(job);
                }
            }
            matching.retain(|job| {
                chosen
                    .get(job.test_name.as_str())
                    .is_some_and(|c| c.id == job.id)
            });
        }
    }

    if let Some(count) = query.count {
        let skip = matching.len().saturating_sub(count);
        matching.drain(..skip);
    }
    matching
}

/// Runs and outcomes of one test name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameBreakdown {
    pub runs: usize,
    pub pass: usize,
    pub fail: usize,
    /// Runs that never completed (timeout, cancelled, ...)
    pub incomplete: usize,
}

pub fn breakdown_by_name(records: &[Job]) -> BTreeMap<String, NameBreakdown> {
    let mut breakdown: BTreeMap<String, NameBreakdown> = BTreeMap::new();
    for job in records {
        let entry = breakdown.entry(job.test_name.clone()).or_default();
        entry.runs += 1;
        match job.verdict {
            Some(Verdict::Pass) => entry.pass += 1,
            Some(Verdict::Fail) => entry.fail += 1,
            None => entry.incomplete += 1,
        }
    }
    breakdown
}

/// Distinct test names, sorted
pub fn test_names(records: &[Job]) -> Vec<String> {
    let mut names: Vec<String> = records.iter().map(|j| j.test_name.clone()).collect();
    names.sort();
    names.dedup();
    names
}

/// Every job id, in recording order
pub fn job_ids(records: &[Job]) -> Vec<Uuid> {
    records.iter().map(|j| j.id).collect()
}

/// Test name to job ids, in recording order
pub fn lookup(records: &[Job]) -> BTreeMap<String, Vec<Uuid>> {
    let mut table: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
    for job in records {
        table.entry(job.test_name.clone()).or_default().push(job.id);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TestSpec;
    use chrono::{Duration, TimeZone, Utc};
    use std::path::Path;

    fn record(name: &str, minute: i64, returncode: i32, verdict: Verdict) -> Job {
        let mut test = TestSpec::new(name, "local/sh", "true");
        test.tags = vec!["smoke".to_string()];
        let mut job = Job::new(&test, 0, Path::new("/r"));
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        job.transition(JobState::Submitted).unwrap();
        job.start_time = Some(base + Duration::minutes(minute));
        job.complete(returncode, base + Duration::minutes(minute) + Duration::seconds(2))
            .unwrap();
        job.verdict = Some(verdict);
        job
    }

    fn records() -> Vec<Job> {
        vec![
            record("a", 1, 0, Verdict::Pass),
            record("b", 2, 1, Verdict::Fail),
            record("a", 3, 2, Verdict::Fail),
        ]
    }

    #[test]
    fn test_filter_parse_and_match() {
        let records = records();
        let filter = Filter::parse("name=a,verdict=fail").unwrap();
        let matched: Vec<_> = records.iter().filter(|j| filter.matches(j)).collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].returncode, Some(2));
    }

    #[test]
    fn test_filter_rejects_bad_input() {
        assert!(matches!(
            Filter::parse("colour=red"),
            Err(QueryError::UnknownFilterField { .. })
        ));
        assert!(matches!(
            Filter::parse("returncode=zero"),
            Err(QueryError::InvalidValue { .. })
        ));
        assert!(matches!(
            Filter::parse("state=DONE"),
            Err(QueryError::InvalidValue { .. })
        ));
        assert!(matches!(Filter::parse("name"), Err(QueryError::MalformedFilter(_))));
    }

    #[test]
    fn test_filter_by_tag_and_returncode() {
        let records = records();
        let filter = Filter::parse("tags=smoke,returncode=1").unwrap();
        assert_eq!(records.iter().filter(|j| filter.matches(j)).count(), 1);
    }

    #[test]
    fn test_format_fields() {
        assert_eq!(
            parse_format("name, id,runtime").unwrap(),
            vec![FormatField::Name, FormatField::Id, FormatField::Runtime]
        );
        assert!(parse_format("name,colour").is_err());

        let job = &records()[1];
        assert_eq!(FormatField::Returncode.value(job), "1");
        assert_eq!(FormatField::Verdict.value(job), "FAIL");
        assert_eq!(FormatField::Runtime.value(job), "2.000");
        assert_eq!(FormatField::BackendId.value(job), "");
    }

    #[test]
    fn test_latest_and_oldest() {
        let records = records();
        let latest = select(
            &records,
            &ReportQuery {
                selection: Selection::Latest,
                ..Default::default()
            },
        );
        assert_eq!(latest.len(), 2);
        assert!(latest.iter().any(|j| j.test_name == "a" && j.returncode == Some(2)));

        let oldest = select(
            &records,
            &ReportQuery {
                selection: Selection::Oldest,
                ..Default::default()
            },
        );
        assert!(oldest.iter().any(|j| j.test_name == "a" && j.returncode == Some(0)));
    }

    #[test]
    fn test_count_keeps_most_recent() {
        let records = records();
        let recent = select(
            &records,
            &ReportQuery {
                count: Some(2),
                ..Default::default()
            },
        );
        assert_eq!(
            recent.iter().map(|j| j.returncode.unwrap()).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_breakdown_and_lookup() {
        let records = records();
        let breakdown = breakdown_by_name(&records);
        assert_eq!(
            breakdown["a"],
            NameBreakdown {
                runs: 2,
                pass: 1,
                fail: 1,
                incomplete: 0
            }
        );
        assert_eq!(test_names(&records), vec!["a", "b"]);
        assert_eq!(lookup(&records)["a"], vec![records[0].id, records[2].id]);
        assert_eq!(job_ids(&records).len(), 3);
    }
}
