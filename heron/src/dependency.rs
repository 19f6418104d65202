//! Dependency gating between jobs.
//!
//! A job names at most one dependency through `depends_on`. It becomes
//! eligible once that dependency has reached `Completed`; if the dependency
//! ends `Failed` or `Cancelled` the dependent can never run and is failed
//! with `DependencyFailed`. Because dependencies must already exist when a
//! job is enqueued and ids only grow, chains cannot form cycles.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::job::{BackgroundJob, JobId, JobState};

/// Result of checking whether a queued job may be claimed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Eligibility {
    Ready,
    /// `run_after` is still in the future.
    NotDue { run_after: DateTime<Utc> },
    /// The dependency exists but has not completed yet.
    Waiting { on: JobId, state: JobState },
    /// The dependency terminated without completing.
    Blocked { on: JobId, state: JobState },
    /// The dependency can no longer be found.
    Orphaned { on: JobId },
}

impl Eligibility {
    pub fn is_ready(&self) -> bool {
        matches!(self, Eligibility::Ready)
    }

    /// Whether the dependent must be failed rather than left waiting.
    pub fn is_permanent_failure(&self) -> bool {
        matches!(
            self,
            Eligibility::Blocked { .. } | Eligibility::Orphaned { .. }
        )
    }
}

/// Stateless queries over the `depends_on` edges of a set of jobs.
#[derive(Clone, Copy, Debug, Default)]
pub struct DependencyGraph;

impl DependencyGraph {
    /// Decide whether `job` may be claimed at `now`.
    ///
    /// `state_of` returns the current state of any job, live or archived.
    pub fn evaluate(
        job: &BackgroundJob,
        now: DateTime<Utc>,
        state_of: impl Fn(JobId) -> Option<JobState>,
    ) -> Eligibility {
        if let Some(on) = job.depends_on {
            match state_of(on) {
                None => return Eligibility::Orphaned { on },
                Some(JobState::Completed) => {}
                Some(state @ (JobState::Failed | JobState::Cancelled)) => {
                    return Eligibility::Blocked { on, state };
                }
                Some(state) => return Eligibility::Waiting { on, state },
            }
        }

        match job.run_after {
            Some(run_after) if run_after > now => Eligibility::NotDue { run_after },
            _ => Eligibility::Ready,
        }
    }

    /// Ids of jobs that directly depend on `id`, in dispatch order.
    pub fn dependents_of<'a>(
        id: JobId,
        jobs: impl IntoIterator<Item = &'a BackgroundJob>,
    ) -> Vec<JobId> {
        let mut dependents: Vec<&BackgroundJob> = jobs
            .into_iter()
            .filter(|job| job.depends_on == Some(id))
            .collect();
        dependents.sort_by_key(|job| job.dispatch_key());
        dependents.into_iter().map(|job| job.id).collect()
    }

    /// Ancestors of `id` following `depends_on`, nearest first.
    pub fn chain(id: JobId, depends_on: impl Fn(JobId) -> Option<JobId>) -> Vec<JobId> {
        let mut seen = HashSet::from([id]);
        let mut chain = Vec::new();
        let mut current = id;
        while let Some(next) = depends_on(current) {
            if !seen.insert(next) {
                break;
            }
            chain.push(next);
            current = next;
        }
        chain
    }

    /// Members of a batch. Batches are only a label; they impose no ordering.
    pub fn batch<'a>(
        batch_id: &str,
        jobs: impl IntoIterator<Item = &'a BackgroundJob>,
    ) -> Vec<JobId> {
        let mut ids: Vec<JobId> = jobs
            .into_iter()
            .filter(|job| job.batch_id.as_deref() == Some(batch_id))
            .map(|job| job.id)
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::collections::HashMap;

    fn job(id: i64) -> BackgroundJob {
        let mut job = BackgroundJob::command("Noop", json!(null));
        job.id = JobId(id);
        job
    }

    #[test]
    fn test_job_without_dependency_is_ready() {
        let now = Utc::now();
        assert_eq!(
            DependencyGraph::evaluate(&job(1), now, |_| None),
            Eligibility::Ready
        );
    }

    #[test]
    fn test_run_after_in_future_is_not_due() {
        let now = Utc::now();
        let mut j = job(1);
        j.run_after = Some(now + Duration::seconds(10));
        assert!(matches!(
            DependencyGraph::evaluate(&j, now, |_| None),
            Eligibility::NotDue { .. }
        ));
        assert!(DependencyGraph::evaluate(&j, now + Duration::seconds(11), |_| None).is_ready());
    }

    #[test]
    fn test_dependency_gates_until_completed() {
        let now = Utc::now();
        let mut child = job(2);
        child.depends_on = Some(JobId(1));

        for state in [JobState::Queued, JobState::Started, JobState::Executed] {
            assert_eq!(
                DependencyGraph::evaluate(&child, now, |_| Some(state)),
                Eligibility::Waiting { on: JobId(1), state }
            );
        }
        assert!(DependencyGraph::evaluate(&child, now, |_| Some(JobState::Completed)).is_ready());
    }

    #[test]
    fn test_failed_or_cancelled_dependency_blocks() {
        let now = Utc::now();
        let mut child = job(2);
        child.depends_on = Some(JobId(1));

        let failed = DependencyGraph::evaluate(&child, now, |_| Some(JobState::Failed));
        assert!(failed.is_permanent_failure());
        let cancelled = DependencyGraph::evaluate(&child, now, |_| Some(JobState::Cancelled));
        assert_eq!(
            cancelled,
            Eligibility::Blocked {
                on: JobId(1),
                state: JobState::Cancelled
            }
        );
        assert!(DependencyGraph::evaluate(&child, now, |_| None).is_permanent_failure());
    }

    #[test]
    fn test_dependents_and_chain() {
        let mut b = job(2);
        b.depends_on = Some(JobId(1));
        let mut c = job(3);
        c.depends_on = Some(JobId(2));
        let mut d = job(4);
        d.depends_on = Some(JobId(1));
        let jobs = vec![job(1), b, c, d];

        assert_eq!(
            DependencyGraph::dependents_of(JobId(1), &jobs),
            vec![JobId(2), JobId(4)]
        );

        let edges: HashMap<JobId, JobId> = jobs
            .iter()
            .filter_map(|j| j.depends_on.map(|on| (j.id, on)))
            .collect();
        assert_eq!(
            DependencyGraph::chain(JobId(3), |id| edges.get(&id).copied()),
            vec![JobId(2), JobId(1)]
        );
    }

    #[test]
    fn test_batch_is_label_only() {
        let mut a = job(1);
        a.batch_id = Some("b1".into());
        let mut b = job(2);
        b.batch_id = Some("b1".into());
        let c = job(3);
        let jobs = [b, c, a];
        assert_eq!(DependencyGraph::batch("b1", &jobs), vec![JobId(1), JobId(2)]);
    }
}
