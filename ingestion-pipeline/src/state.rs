use state_machines::state_machine;

use crate::error::PipelineError;

/// Runtime lifecycle state of an ingestion job. One attempt walks
/// `Fetching -> Staging -> Uploading`; a transient failure parks the job in
/// `RetryScheduled` until the next attempt, and `Succeeded`/`Failed` are
/// terminal.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum JobState {
    #[default]
    Pending,
    Fetching,
    Staging,
    Uploading,
    RetryScheduled,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "Pending",
            JobState::Fetching => "Fetching",
            JobState::Staging => "Staging",
            JobState::Uploading => "Uploading",
            JobState::RetryScheduled => "RetryScheduled",
            JobState::Succeeded => "Succeeded",
            JobState::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum JobTransition {
    Fetch,
    Stage,
    Upload,
    Complete,
    ScheduleRetry,
    Abort,
}

impl JobTransition {
    fn as_str(&self) -> &'static str {
        match self {
            JobTransition::Fetch => "fetch",
            JobTransition::Stage => "stage",
            JobTransition::Upload => "upload",
            JobTransition::Complete => "complete",
            JobTransition::ScheduleRetry => "schedule_retry",
            JobTransition::Abort => "abort",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: JobLifecycleMachine,
        initial: Pending,
        states: [Pending, Fetching, Staging, Uploading, RetryScheduled, Succeeded, Failed],
        events {
            fetch {
                transition: { from: Pending, to: Fetching }
                transition: { from: RetryScheduled, to: Fetching }
            }
            stage {
                transition: { from: Fetching, to: Staging }
            }
            upload {
                transition: { from: Staging, to: Uploading }
            }
            complete {
                transition: { from: Uploading, to: Succeeded }
            }
            schedule_retry {
                transition: { from: Fetching, to: RetryScheduled }
                transition: { from: Staging, to: RetryScheduled }
                transition: { from: Uploading, to: RetryScheduled }
            }
            abort {
                transition: { from: Fetching, to: Failed }
                transition: { from: Staging, to: Failed }
                transition: { from: Uploading, to: Failed }
                transition: { from: RetryScheduled, to: Failed }
            }
        }
    }

    pub(super) fn pending() -> JobLifecycleMachine<(), Pending> {
        JobLifecycleMachine::new(())
    }

    pub(super) fn fetching() -> JobLifecycleMachine<(), Fetching> {
        pending()
            .fetch()
            .expect("fetch transition from Pending should exist")
    }

    pub(super) fn staging() -> JobLifecycleMachine<(), Staging> {
        fetching()
            .stage()
            .expect("stage transition from Fetching should exist")
    }

    pub(super) fn uploading() -> JobLifecycleMachine<(), Uploading> {
        staging()
            .upload()
            .expect("upload transition from Staging should exist")
    }

    pub(super) fn retry_scheduled() -> JobLifecycleMachine<(), RetryScheduled> {
        fetching()
            .schedule_retry()
            .expect("schedule_retry transition from Fetching should exist")
    }
}

fn invalid_transition(state: &JobState, event: JobTransition) -> PipelineError {
    PipelineError::InvalidTransition {
        from: state.as_str(),
        event: event.as_str(),
    }
}

pub fn compute_next_state(
    state: &JobState,
    event: JobTransition,
) -> Result<JobState, PipelineError> {
    use lifecycle::*;
    match (state, event) {
        (JobState::Pending, JobTransition::Fetch) => pending()
            .fetch()
            .map(|_| JobState::Fetching)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::RetryScheduled, JobTransition::Fetch) => retry_scheduled()
            .fetch()
            .map(|_| JobState::Fetching)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::Fetching, JobTransition::Stage) => fetching()
            .stage()
            .map(|_| JobState::Staging)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::Staging, JobTransition::Upload) => staging()
            .upload()
            .map(|_| JobState::Uploading)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::Uploading, JobTransition::Complete) => uploading()
            .complete()
            .map(|_| JobState::Succeeded)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::Fetching, JobTransition::ScheduleRetry) => fetching()
            .schedule_retry()
            .map(|_| JobState::RetryScheduled)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::Staging, JobTransition::ScheduleRetry) => staging()
            .schedule_retry()
            .map(|_| JobState::RetryScheduled)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::Uploading, JobTransition::ScheduleRetry) => uploading()
            .schedule_retry()
            .map(|_| JobState::RetryScheduled)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::Fetching, JobTransition::Abort) => fetching()
            .abort()
            .map(|_| JobState::Failed)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::Staging, JobTransition::Abort) => staging()
            .abort()
            .map(|_| JobState::Failed)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::Uploading, JobTransition::Abort) => uploading()
            .abort()
            .map(|_| JobState::Failed)
            .map_err(|_| invalid_transition(state, event)),
        (JobState::RetryScheduled, JobTransition::Abort) => retry_scheduled()
            .abort()
            .map(|_| JobState::Failed)
            .map_err(|_| invalid_transition(state, event)),
        _ => Err(invalid_transition(state, event)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_attempt_walks_the_happy_path() {
        let mut state = JobState::Pending;
        for event in [
            JobTransition::Fetch,
            JobTransition::Stage,
            JobTransition::Upload,
            JobTransition::Complete,
        ] {
            state = compute_next_state(&state, event).expect("valid transition");
        }
        assert_eq!(state, JobState::Succeeded);
        assert!(state.is_terminal());
    }

    #[test]
    fn retry_loops_back_into_fetching() {
        let state = compute_next_state(&JobState::Staging, JobTransition::ScheduleRetry)
            .expect("schedule retry");
        assert_eq!(state, JobState::RetryScheduled);

        let state = compute_next_state(&state, JobTransition::Fetch).expect("fetch again");
        assert_eq!(state, JobState::Fetching);
    }

    #[test]
    fn terminal_states_accept_no_events() {
        for event in [
            JobTransition::Fetch,
            JobTransition::ScheduleRetry,
            JobTransition::Abort,
        ] {
            assert!(compute_next_state(&JobState::Succeeded, event).is_err());
            assert!(compute_next_state(&JobState::Failed, event).is_err());
        }
    }

    #[test]
    fn completion_requires_an_upload_in_flight() {
        let result = compute_next_state(&JobState::Fetching, JobTransition::Complete);
        assert!(matches!(
            result,
            Err(PipelineError::InvalidTransition {
                from: "Fetching",
                event: "complete"
            })
        ));
    }
}
