//! Lifecycle transition table.
//!
//! The whole state machine is [`transition`]: a pure match over
//! `(state, event)` that returns the next state and the producer hooks to run,
//! in order. Implicit edges (start from Disabled, disable from Running) are
//! spelled out as effect sequences so `OnStop` always precedes `OnDisable`.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Disabled,
    Enabled,
    Running,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Disabled => "disabled",
            LifecycleState::Enabled => "enabled",
            LifecycleState::Running => "running",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Enable,
    Start,
    Stop,
    Disable,
}

/// Producer hook invoked as part of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    OnEnable,
    OnStart,
    OnStop,
    OnDisable,
}

/// Apply `event` to `state`.
pub fn transition(state: LifecycleState, event: LifecycleEvent) -> (LifecycleState, &'static [Effect]) {
    use LifecycleEvent as E;
    use LifecycleState as S;

    const NONE: &[Effect] = &[];
    const ENABLE: &[Effect] = &[Effect::OnEnable];
    const ENABLE_START: &[Effect] = &[Effect::OnEnable, Effect::OnStart];
    const START: &[Effect] = &[Effect::OnStart];
    const STOP: &[Effect] = &[Effect::OnStop];
    const DISABLE: &[Effect] = &[Effect::OnDisable];
    const STOP_DISABLE: &[Effect] = &[Effect::OnStop, Effect::OnDisable];

    match (state, event) {
        (S::Disabled, E::Enable) => (S::Enabled, ENABLE),
        (S::Disabled, E::Start) => (S::Running, ENABLE_START),
        (S::Disabled, E::Stop | E::Disable) => (S::Disabled, NONE),

        (S::Enabled, E::Enable | E::Stop) => (S::Enabled, NONE),
        (S::Enabled, E::Start) => (S::Running, START),
        (S::Enabled, E::Disable) => (S::Disabled, DISABLE),

        (S::Running, E::Enable | E::Start) => (S::Running, NONE),
        (S::Running, E::Stop) => (S::Enabled, STOP),
        (S::Running, E::Disable) => (S::Disabled, STOP_DISABLE),
    }
}

/// State reached after a single effect, used to validate effect sequences.
fn after(effect: Effect) -> LifecycleState {
    match effect {
        Effect::OnEnable | Effect::OnStop => LifecycleState::Enabled,
        Effect::OnStart => LifecycleState::Running,
        Effect::OnDisable => LifecycleState::Disabled,
    }
}

/// The only single-step moves: Disabled↔Enabled↔Running.
pub fn is_adjacent(from: LifecycleState, effect: Effect) -> bool {
    matches!(
        (from, effect),
        (LifecycleState::Disabled, Effect::OnEnable)
            | (LifecycleState::Enabled, Effect::OnStart)
            | (LifecycleState::Running, Effect::OnStop)
            | (LifecycleState::Enabled, Effect::OnDisable)
    )
}

/// Walk `effects` from `from`, returning the final state if every step is a
/// valid single-step move.
pub fn replay(from: LifecycleState, effects: &[Effect]) -> Option<LifecycleState> {
    effects.iter().try_fold(from, |state, &effect| {
        is_adjacent(state, effect).then(|| after(effect))
    })
}
