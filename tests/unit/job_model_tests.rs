//! Unit tests for the job model and its status machine.

use world_warden::models::job::{Job, JobStatus};
use world_warden::rights::DEPLOY_CANCEL_COMPILE;

fn job_with_status(status: JobStatus) -> Job {
    let mut job = Job::new("test".into(), "tester".into(), DEPLOY_CANCEL_COMPILE);
    job.status = status;
    job
}

#[test]
fn new_jobs_are_pending_with_generated_ids() {
    let a = Job::new("one".into(), "tester".into(), DEPLOY_CANCEL_COMPILE);
    let b = Job::new("two".into(), "tester".into(), DEPLOY_CANCEL_COMPILE);

    assert_eq!(a.status, JobStatus::Pending);
    assert_ne!(a.id, b.id);
    assert!(a.started_at.is_none());
    assert!(a.stopped_at.is_none());
    assert!(a.error_text.is_none());
    assert_eq!(a.cancel_right, DEPLOY_CANCEL_COMPILE.0);
}

#[test]
fn terminal_statuses_are_terminal() {
    assert!(JobStatus::Completed.is_terminal());
    assert!(JobStatus::Errored.is_terminal());
    assert!(JobStatus::Cancelled.is_terminal());
    assert!(!JobStatus::Pending.is_terminal());
    assert!(!JobStatus::Running.is_terminal());
    assert!(!JobStatus::Cancelling.is_terminal());
}

#[test]
fn pending_moves_to_running_or_cancelling_only() {
    let job = job_with_status(JobStatus::Pending);

    assert!(job.can_transition_to(JobStatus::Running));
    assert!(job.can_transition_to(JobStatus::Cancelling));
    assert!(!job.can_transition_to(JobStatus::Completed));
    assert!(!job.can_transition_to(JobStatus::Errored));
    assert!(!job.can_transition_to(JobStatus::Cancelled));
}

#[test]
fn running_reaches_every_outcome_via_the_machine() {
    let job = job_with_status(JobStatus::Running);

    assert!(job.can_transition_to(JobStatus::Completed));
    assert!(job.can_transition_to(JobStatus::Errored));
    assert!(job.can_transition_to(JobStatus::Cancelling));
    assert!(!job.can_transition_to(JobStatus::Cancelled));
    assert!(!job.can_transition_to(JobStatus::Pending));
}

#[test]
fn cancelling_resolves_to_any_terminal_status() {
    let job = job_with_status(JobStatus::Cancelling);

    // The operation may still finish (or fail) before observing the
    // signal; all three outcomes are legal.
    assert!(job.can_transition_to(JobStatus::Cancelled));
    assert!(job.can_transition_to(JobStatus::Completed));
    assert!(job.can_transition_to(JobStatus::Errored));
    assert!(!job.can_transition_to(JobStatus::Running));
}

#[test]
fn terminal_statuses_allow_no_transitions() {
    for status in [JobStatus::Completed, JobStatus::Errored, JobStatus::Cancelled] {
        let job = job_with_status(status);
        for next in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Errored,
            JobStatus::Cancelling,
            JobStatus::Cancelled,
        ] {
            assert!(!job.can_transition_to(next), "{status:?} -> {next:?}");
        }
    }
}
