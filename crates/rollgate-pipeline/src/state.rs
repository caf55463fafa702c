//! Pipeline state machine.
//!
//! Transitions are plain data: `transition` is a pure function of the
//! current state, the outcome of its executor, and the run's rollback
//! intent. The controller owns the side effects.

use std::fmt;

use serde::Serialize;

use rollgate_core::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    StagingDeploy,
    StagingUpdate,
    StagingGate,
    ProdDeploy,
    ProdUpdate,
    ProdGate,
    Succeeded,
    RollingBack,
    RolledBack,
    Failed,
}

impl PipelineState {
    pub const ALL: [PipelineState; 11] = [
        PipelineState::Pending,
        PipelineState::StagingDeploy,
        PipelineState::StagingUpdate,
        PipelineState::StagingGate,
        PipelineState::ProdDeploy,
        PipelineState::ProdUpdate,
        PipelineState::ProdGate,
        PipelineState::Succeeded,
        PipelineState::RollingBack,
        PipelineState::RolledBack,
        PipelineState::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Succeeded | PipelineState::RolledBack | PipelineState::Failed
        )
    }

    /// The executor this state invokes. `Pending` and terminal states run none.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineState::StagingDeploy => Some(Stage::StagingDeploy),
            PipelineState::StagingUpdate => Some(Stage::StagingUpdate),
            PipelineState::StagingGate => Some(Stage::StagingGate),
            PipelineState::ProdDeploy => Some(Stage::ProdDeploy),
            PipelineState::ProdUpdate => Some(Stage::ProdUpdate),
            PipelineState::ProdGate => Some(Stage::ProdGate),
            PipelineState::RollingBack => Some(Stage::Rollback),
            PipelineState::Pending
            | PipelineState::Succeeded
            | PipelineState::RolledBack
            | PipelineState::Failed => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Pending => "PENDING",
            PipelineState::StagingDeploy => "STAGING_DEPLOY",
            PipelineState::StagingUpdate => "STAGING_UPDATE",
            PipelineState::StagingGate => "STAGING_GATE",
            PipelineState::ProdDeploy => "PROD_DEPLOY",
            PipelineState::ProdUpdate => "PROD_UPDATE",
            PipelineState::ProdGate => "PROD_GATE",
            PipelineState::Succeeded => "SUCCEEDED",
            PipelineState::RollingBack => "ROLLING_BACK",
            PipelineState::RolledBack => "ROLLED_BACK",
            PipelineState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of the executor a state invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    Failed,
}

/// Operator opt-in to rolling production back when its gate fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollbackIntent(bool);

impl RollbackIntent {
    pub const PRESENT: RollbackIntent = RollbackIntent(true);
    pub const ABSENT: RollbackIntent = RollbackIntent(false);

    /// Intent is present when `marker` occurs anywhere in `description`,
    /// ignoring case. An empty marker never matches.
    pub fn from_description(description: &str, marker: &str) -> Self {
        let marker = marker.trim();
        if marker.is_empty() {
            return Self::ABSENT;
        }
        Self(
            description
                .to_lowercase()
                .contains(&marker.to_lowercase()),
        )
    }

    pub fn is_present(&self) -> bool {
        self.0
    }
}

impl From<bool> for RollbackIntent {
    fn from(present: bool) -> Self {
        Self(present)
    }
}

/// Next state after `state` finished with `outcome`.
///
/// Only a production gate failure can enter `RollingBack`, and only with
/// intent: before `ProdDeploy` there is nothing in production to restore,
/// and the deploy and update stages fail closed. Terminal states map to
/// themselves.
pub fn transition(
    state: PipelineState,
    outcome: StepOutcome,
    intent: RollbackIntent,
) -> PipelineState {
    use PipelineState::*;

    if state.is_terminal() {
        return state;
    }
    match (state, outcome) {
        (Pending, _) => StagingDeploy,

        (StagingDeploy, StepOutcome::Succeeded) => StagingUpdate,
        (StagingUpdate, StepOutcome::Succeeded) => StagingGate,
        (StagingGate, StepOutcome::Succeeded) => ProdDeploy,
        (ProdDeploy, StepOutcome::Succeeded) => ProdUpdate,
        (ProdUpdate, StepOutcome::Succeeded) => ProdGate,
        (ProdGate, StepOutcome::Succeeded) => Succeeded,
        (RollingBack, StepOutcome::Succeeded) => RolledBack,

        (ProdGate, StepOutcome::Failed) if intent.is_present() => RollingBack,
        (_, StepOutcome::Failed) => Failed,

        (Succeeded | RolledBack | Failed, StepOutcome::Succeeded) => state,
    }
}

/// One row of the transition table. `intent` is `None` when the row holds
/// regardless of rollback intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub from: PipelineState,
    pub outcome: StepOutcome,
    pub intent: Option<bool>,
    pub to: PipelineState,
}

/// Every non-terminal transition, derived from `transition`.
pub fn transition_table() -> Vec<Transition> {
    let mut rows = Vec::new();
    for from in PipelineState::ALL.into_iter().filter(|s| !s.is_terminal()) {
        let outcomes: &[StepOutcome] = if from == PipelineState::Pending {
            &[StepOutcome::Succeeded]
        } else {
            &[StepOutcome::Succeeded, StepOutcome::Failed]
        };
        for &outcome in outcomes {
            let without = transition(from, outcome, RollbackIntent::ABSENT);
            let with = transition(from, outcome, RollbackIntent::PRESENT);
            if without == with {
                rows.push(Transition {
                    from,
                    outcome,
                    intent: None,
                    to: without,
                });
            } else {
                rows.push(Transition {
                    from,
                    outcome,
                    intent: Some(false),
                    to: without,
                });
                rows.push(Transition {
                    from,
                    outcome,
                    intent: Some(true),
                    to: with,
                });
            }
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORWARD: [PipelineState; 8] = [
        PipelineState::Pending,
        PipelineState::StagingDeploy,
        PipelineState::StagingUpdate,
        PipelineState::StagingGate,
        PipelineState::ProdDeploy,
        PipelineState::ProdUpdate,
        PipelineState::ProdGate,
        PipelineState::Succeeded,
    ];

    #[test]
    fn success_walks_forward_in_order() {
        for pair in FORWARD.windows(2) {
            for intent in [RollbackIntent::ABSENT, RollbackIntent::PRESENT] {
                assert_eq!(transition(pair[0], StepOutcome::Succeeded, intent), pair[1]);
            }
        }
    }

    #[test]
    fn failures_before_prod_gate_never_roll_back() {
        for state in &FORWARD[1..6] {
            assert_eq!(
                transition(*state, StepOutcome::Failed, RollbackIntent::PRESENT),
                PipelineState::Failed,
                "{state} must fail closed"
            );
        }
    }

    #[test]
    fn prod_gate_failure_depends_on_intent() {
        assert_eq!(
            transition(PipelineState::ProdGate, StepOutcome::Failed, RollbackIntent::ABSENT),
            PipelineState::Failed
        );
        assert_eq!(
            transition(PipelineState::ProdGate, StepOutcome::Failed, RollbackIntent::PRESENT),
            PipelineState::RollingBack
        );
    }

    #[test]
    fn rollback_side_path() {
        let intent = RollbackIntent::PRESENT;
        assert_eq!(
            transition(PipelineState::RollingBack, StepOutcome::Succeeded, intent),
            PipelineState::RolledBack
        );
        assert_eq!(
            transition(PipelineState::RollingBack, StepOutcome::Failed, intent),
            PipelineState::Failed
        );
    }

    #[test]
    fn terminal_states_are_absorbing() {
        for state in PipelineState::ALL.iter().filter(|s| s.is_terminal()) {
            assert_eq!(state.stage(), None);
            for outcome in [StepOutcome::Succeeded, StepOutcome::Failed] {
                assert_eq!(transition(*state, outcome, RollbackIntent::PRESENT), *state);
            }
        }
    }

    #[test]
    fn intent_parses_marker_case_insensitively() {
        let marker = "[rollback]";
        assert!(RollbackIntent::from_description("fix checkout [ROLLBACK]", marker).is_present());
        assert!(RollbackIntent::from_description("[Rollback] hotfix", marker).is_present());
        assert!(!RollbackIntent::from_description("roll back later", marker).is_present());
        assert!(!RollbackIntent::from_description("anything", "  ").is_present());
    }

    #[test]
    fn table_splits_only_the_prod_gate_failure() {
        let table = transition_table();
        let split: Vec<_> = table.iter().filter(|t| t.intent.is_some()).collect();

        assert_eq!(split.len(), 2);
        assert!(split.iter().all(|t| t.from == PipelineState::ProdGate
            && t.outcome == StepOutcome::Failed));
        // Pending has one row, the six forward states and rolling back have
        // two each, plus the extra prod gate row.
        assert_eq!(table.len(), 1 + 7 * 2 + 1);
    }
}
