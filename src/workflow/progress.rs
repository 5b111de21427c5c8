use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statig::prelude::*;
use tracing::{info, warn};

use super::WorkflowError;

/// Orchestration phase of one onboarding instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnboardingPhase {
    #[default]
    Received,
    Verifying,
    ApprovalGate,
    ApprovalPending,
    Provisioning,
    Updating,
    Completed,
    Rejected,
    Failed,
}

impl OnboardingPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OnboardingPhase::Completed | OnboardingPhase::Rejected | OnboardingPhase::Failed
        )
    }
}

/// Progress reported by the orchestrator as it moves through the steps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Milestone {
    VerificationStarted,
    Verified { approval_required: bool },
    VerificationRejected,
    ApprovalRequested,
    Approved,
    Disapproved,
    Provisioned,
    Updated,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: OnboardingPhase,
    pub to: OnboardingPhase,
    pub milestone: Milestone,
    pub timestamp: DateTime<Utc>,
}

/// Forward-only phase machine. Milestones that do not apply to the current
/// phase are counted and otherwise ignored.
#[derive(Debug, Default)]
pub struct OnboardingProgress {
    pub instance_id: String,
    pub phase: OnboardingPhase,
    pub transitions: Vec<PhaseTransition>,
    pub rejected_milestones: u32,
}

impl OnboardingProgress {
    pub fn new(instance_id: String) -> Self {
        Self {
            instance_id,
            ..Default::default()
        }
    }
}

#[state_machine(initial = "State::received()")]
impl OnboardingProgress {
    #[state]
    fn received(&mut self, event: &Milestone) -> Outcome<State> {
        match event {
            Milestone::VerificationStarted => {
                self.enter(OnboardingPhase::Verifying, event);
                Transition(State::verifying())
            }
            Milestone::Failed => self.fail(event),
            _ => self.reject(event),
        }
    }

    #[state]
    fn verifying(&mut self, event: &Milestone) -> Outcome<State> {
        match event {
            Milestone::Verified {
                approval_required: true,
            } => {
                self.enter(OnboardingPhase::ApprovalGate, event);
                Transition(State::approval_gate())
            }
            Milestone::Verified {
                approval_required: false,
            } => {
                self.enter(OnboardingPhase::Provisioning, event);
                Transition(State::provisioning())
            }
            Milestone::VerificationRejected => {
                self.enter(OnboardingPhase::Rejected, event);
                Transition(State::rejected())
            }
            Milestone::Failed => self.fail(event),
            _ => self.reject(event),
        }
    }

    #[state]
    fn approval_gate(&mut self, event: &Milestone) -> Outcome<State> {
        match event {
            Milestone::ApprovalRequested => {
                self.enter(OnboardingPhase::ApprovalPending, event);
                Transition(State::approval_pending())
            }
            Milestone::Failed => self.fail(event),
            _ => self.reject(event),
        }
    }

    #[state]
    fn approval_pending(&mut self, event: &Milestone) -> Outcome<State> {
        match event {
            Milestone::Approved => {
                self.enter(OnboardingPhase::Provisioning, event);
                Transition(State::provisioning())
            }
            Milestone::Disapproved => {
                self.enter(OnboardingPhase::Rejected, event);
                Transition(State::rejected())
            }
            Milestone::Failed => self.fail(event),
            _ => self.reject(event),
        }
    }

    #[state]
    fn provisioning(&mut self, event: &Milestone) -> Outcome<State> {
        match event {
            Milestone::Provisioned => {
                self.enter(OnboardingPhase::Updating, event);
                Transition(State::updating())
            }
            Milestone::Failed => self.fail(event),
            _ => self.reject(event),
        }
    }

    #[state]
    fn updating(&mut self, event: &Milestone) -> Outcome<State> {
        match event {
            Milestone::Updated => {
                self.enter(OnboardingPhase::Completed, event);
                Transition(State::completed())
            }
            Milestone::Failed => self.fail(event),
            _ => self.reject(event),
        }
    }

    #[state]
    fn completed(&mut self, event: &Milestone) -> Outcome<State> {
        self.reject(event)
    }

    #[state]
    fn rejected(&mut self, event: &Milestone) -> Outcome<State> {
        self.reject(event)
    }

    #[state]
    fn failed(&mut self, event: &Milestone) -> Outcome<State> {
        self.reject(event)
    }
}

impl OnboardingProgress {
    fn enter(&mut self, to: OnboardingPhase, milestone: &Milestone) {
        let from = self.phase;
        self.phase = to;
        self.transitions.push(PhaseTransition {
            from,
            to,
            milestone: milestone.clone(),
            timestamp: Utc::now(),
        });
        info!(
            instance_id = %self.instance_id,
            from = ?from,
            to = ?to,
            milestone = ?milestone,
            "Onboarding phase changed"
        );
    }

    fn fail(&mut self, milestone: &Milestone) -> Outcome<State> {
        self.enter(OnboardingPhase::Failed, milestone);
        Transition(State::failed())
    }

    fn reject(&mut self, milestone: &Milestone) -> Outcome<State> {
        self.rejected_milestones += 1;
        warn!(
            instance_id = %self.instance_id,
            phase = ?self.phase,
            milestone = ?milestone,
            "Milestone does not apply to the current phase"
        );
        Handled
    }
}

/// Drives [`OnboardingProgress`] and turns ignored milestones into errors
pub struct ProgressTracker {
    machine: StateMachine<OnboardingProgress>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("phase", &self.phase())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            machine: OnboardingProgress::new(instance_id.into()).state_machine(),
        }
    }

    pub fn phase(&self) -> OnboardingPhase {
        self.machine.inner().phase
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.machine.inner().transitions
    }

    pub fn advance(&mut self, milestone: Milestone) -> Result<OnboardingPhase, WorkflowError> {
        let from = self.phase();
        let rejected_before = self.machine.inner().rejected_milestones;

        self.machine.handle(&milestone);

        if self.machine.inner().rejected_milestones > rejected_before {
            return Err(WorkflowError::InvalidTransition {
                from,
                milestone: format!("{milestone:?}"),
            });
        }
        Ok(self.phase())
    }
}
