//! Job table — pending results for every job in flight.
//!
//! Results for one job can arrive concurrently from many node connections.
//! Each job lives in a single map entry and is only ever mutated under that
//! entry's lock, which is the one point of serialization for its pending
//! set. The `coordinate` call that opened the job waits on a oneshot that
//! fires when nothing is left pending.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use strata_core::task::{JobId, Matrix, ResultUnit, Row, TaskUnit};

use crate::transport::ConnectionId;

/// Terminal state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Every row came back.
    Complete,
    /// The deadline passed with rows still outstanding.
    TimedOut,
    /// At least one row could not be placed on any live node.
    NoNodesAvailable,
}

/// What `coordinate` hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub state: JobState,
    /// Assembled result, indexed by row. `None` for rows that never came back.
    pub rows: Vec<Option<Row>>,
    /// Row indices without a result, sorted.
    pub unresolved: Vec<i32>,
    pub elapsed_ms: u64,
}

impl JobReport {
    pub fn is_complete(&self) -> bool {
        self.state == JobState::Complete
    }

    /// The full result matrix, if every row is present.
    pub fn into_matrix(self) -> Option<Matrix> {
        self.rows.into_iter().collect()
    }
}

/// Outcome of feeding one result into the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Stored. `remaining` rows are still pending.
    Accepted { remaining: usize },
    /// The row was already resolved; the result was dropped.
    Duplicate,
    /// The row index is outside the job.
    OutOfRange,
    /// No such job (never existed, or already finished).
    UnknownJob,
}

/// Where a row was last sent.
#[derive(Debug, Clone)]
struct Assignment {
    node_id: String,
    connection: ConnectionId,
}

struct PendingJob {
    input: Arc<Matrix>,
    results: Vec<Option<Row>>,
    pending: BTreeSet<i32>,
    failed: BTreeSet<i32>,
    assigned: HashMap<i32, Assignment>,
    done: Option<oneshot::Sender<()>>,
}

impl PendingJob {
    fn signal_if_settled(&mut self) {
        if self.pending.is_empty() {
            if let Some(done) = self.done.take() {
                let _ = done.send(());
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct JobTable {
    jobs: Arc<DashMap<JobId, PendingJob>>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `job`. Every row of `input` begins pending. The
    /// receiver fires once no row is pending; for an empty matrix that is
    /// immediately.
    pub fn open(&self, job: JobId, input: Arc<Matrix>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let rows = input.len();
        let mut pending = PendingJob {
            results: vec![None; rows],
            pending: (0..rows as i32).collect(),
            failed: BTreeSet::new(),
            assigned: HashMap::new(),
            input,
            done: Some(tx),
        };
        pending.signal_if_settled();
        self.jobs.insert(job, pending);
        rx
    }

    /// Record that `row` of `job` was handed to `node_id` over `connection`.
    pub fn assign(&self, job: JobId, row: i32, node_id: &str, connection: ConnectionId) {
        if let Some(mut entry) = self.jobs.get_mut(&job) {
            entry.assigned.insert(
                row,
                Assignment {
                    node_id: node_id.to_string(),
                    connection,
                },
            );
        }
    }

    /// The node a row was last sent to.
    pub fn assignee(&self, job: JobId, row: i32) -> Option<String> {
        self.jobs
            .get(&job)
            .and_then(|e| e.assigned.get(&row).map(|a| a.node_id.clone()))
    }

    /// Store a returned row.
    pub fn resolve(&self, job: JobId, unit: ResultUnit) -> Resolution {
        let Some(mut entry) = self.jobs.get_mut(&job) else {
            return Resolution::UnknownJob;
        };
        let row = unit.row_index;
        if row < 0 || row as usize >= entry.results.len() {
            return Resolution::OutOfRange;
        }
        if entry.results[row as usize].is_some() {
            return Resolution::Duplicate;
        }

        entry.results[row as usize] = Some(unit.values);
        entry.pending.remove(&row);
        entry.failed.remove(&row);
        entry.assigned.remove(&row);
        entry.signal_if_settled();
        Resolution::Accepted {
            remaining: entry.pending.len(),
        }
    }

    /// Give up on a row that could not be placed on any node.
    pub fn fail(&self, job: JobId, row: i32) {
        if let Some(mut entry) = self.jobs.get_mut(&job) {
            if entry.pending.remove(&row) {
                entry.failed.insert(row);
                entry.assigned.remove(&row);
                entry.signal_if_settled();
            }
        }
    }

    /// Take every pending row that was last sent over `connection`.
    ///
    /// The rows stay pending; only their assignment is cleared, so the
    /// caller can place them again.
    pub fn orphans(&self, connection: ConnectionId) -> Vec<(JobId, TaskUnit)> {
        let mut orphans = Vec::new();
        for mut entry in self.jobs.iter_mut() {
            let job = *entry.key();
            let state = entry.value_mut();
            let lost: Vec<i32> = state
                .assigned
                .iter()
                .filter(|(row, a)| a.connection == connection && state.pending.contains(*row))
                .map(|(row, _)| *row)
                .collect();
            for row in lost {
                state.assigned.remove(&row);
                let values = state.input[row as usize].clone();
                orphans.push((job, TaskUnit::new(row, values)));
            }
        }
        orphans.sort_by_key(|(job, unit)| (*job, unit.row_index));
        orphans
    }

    /// Stop tracking `job` and build its report.
    pub fn close(&self, job: JobId, started: Instant) -> Option<JobReport> {
        let (_, state) = self.jobs.remove(&job)?;

        let (status, unresolved) = if !state.pending.is_empty() {
            let unresolved = state.pending.union(&state.failed).copied().collect();
            (JobState::TimedOut, unresolved)
        } else if !state.failed.is_empty() {
            (JobState::NoNodesAvailable, state.failed.into_iter().collect())
        } else {
            (JobState::Complete, Vec::new())
        };

        Some(JobReport {
            job_id: job,
            state: status,
            rows: state.results,
            unresolved,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Number of jobs in flight.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::task::RowUnit;

    fn matrix() -> Arc<Matrix> {
        Arc::new(vec![vec![1, 2], vec![3, 4], vec![5, 6]])
    }

    #[tokio::test]
    async fn completes_when_every_row_resolves() {
        let table = JobTable::new();
        let job = JobId(1);
        let mut done = table.open(job, matrix());

        assert_eq!(
            table.resolve(job, RowUnit::new(2, vec![50, 60])),
            Resolution::Accepted { remaining: 2 }
        );
        assert!(done.try_recv().is_err());
        table.resolve(job, RowUnit::new(0, vec![10, 20]));
        table.resolve(job, RowUnit::new(1, vec![30, 40]));
        done.await.unwrap();

        let report = table.close(job, Instant::now()).unwrap();
        assert_eq!(report.state, JobState::Complete);
        assert!(report.unresolved.is_empty());
        assert_eq!(
            report.into_matrix().unwrap(),
            vec![vec![10, 20], vec![30, 40], vec![50, 60]]
        );
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn empty_matrix_settles_immediately() {
        let table = JobTable::new();
        let done = table.open(JobId(9), Arc::new(Vec::new()));
        done.await.unwrap();
        let report = table.close(JobId(9), Instant::now()).unwrap();
        assert!(report.is_complete());
        assert!(report.rows.is_empty());
    }

    #[test]
    fn duplicates_and_strays_are_ignored() {
        let table = JobTable::new();
        let job = JobId(1);
        let _done = table.open(job, matrix());

        table.resolve(job, RowUnit::new(0, vec![1]));
        assert_eq!(
            table.resolve(job, RowUnit::new(0, vec![2])),
            Resolution::Duplicate
        );
        assert_eq!(
            table.resolve(job, RowUnit::new(3, vec![])),
            Resolution::OutOfRange
        );
        assert_eq!(
            table.resolve(job, RowUnit::new(-1, vec![])),
            Resolution::OutOfRange
        );
        assert_eq!(
            table.resolve(JobId(77), RowUnit::new(0, vec![])),
            Resolution::UnknownJob
        );

        let report = table.close(job, Instant::now()).unwrap();
        assert_eq!(report.rows[0], Some(vec![1]), "first result wins");
    }

    #[test]
    fn unfinished_job_reports_timeout_with_unresolved_rows() {
        let table = JobTable::new();
        let job = JobId(4);
        let _done = table.open(job, matrix());
        table.resolve(job, RowUnit::new(1, vec![0, 0]));
        table.fail(job, 2);

        let report = table.close(job, Instant::now()).unwrap();
        assert_eq!(report.state, JobState::TimedOut);
        assert_eq!(report.unresolved, vec![0, 2]);
        assert_eq!(report.rows[1], Some(vec![0, 0]));
        assert!(report.into_matrix().is_none());
    }

    #[tokio::test]
    async fn failed_rows_settle_the_job_as_no_nodes() {
        let table = JobTable::new();
        let job = JobId(5);
        let done = table.open(job, matrix());
        table.resolve(job, RowUnit::new(0, vec![]));
        table.fail(job, 1);
        table.fail(job, 2);
        done.await.unwrap();

        let report = table.close(job, Instant::now()).unwrap();
        assert_eq!(report.state, JobState::NoNodesAvailable);
        assert_eq!(report.unresolved, vec![1, 2]);
    }

    #[test]
    fn orphans_are_pending_rows_on_the_dead_connection() {
        let table = JobTable::new();
        let job = JobId(6);
        let _done = table.open(job, matrix());
        table.assign(job, 0, "A", 10);
        table.assign(job, 1, "B", 11);
        table.assign(job, 2, "A", 10);
        table.resolve(job, RowUnit::new(2, vec![5, 6]));

        assert_eq!(table.assignee(job, 1).as_deref(), Some("B"));
        let orphans = table.orphans(10);
        assert_eq!(orphans, vec![(job, RowUnit::new(0, vec![1, 2]))]);
        assert_eq!(table.assignee(job, 0), None);
        assert!(table.orphans(10).is_empty(), "orphans are handed out once");
    }

    #[test]
    fn close_unknown_job_is_none() {
        assert!(JobTable::new().close(JobId(1), Instant::now()).is_none());
    }
}
