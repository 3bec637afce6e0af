//! Role-specific transition tables and handlers composed over the generic
//! state-machine core. Each role module only supplies a `TransitionTable`
//! and a `RoleHandlers` impl; the run loop, effect application, and
//! mailbox plumbing are shared here.

pub mod architect;
pub mod coder;
pub mod pm;

use crate::dispatcher::{Dispatcher, MailboxReceiver};
use crate::message::AgentId;
use crate::state_machine::{Effect, EffectsRuntime, RoleHandlers, StateMachine, StepInput, ERROR};
use std::sync::Arc;
use tracing::{info, warn};

/// Runs one agent's `Step` loop until its mailbox closes or it receives
/// SHUTDOWN, applying effects after each step and mirroring the live state
/// into the Dispatcher's registry for logical-name resolution.
pub async fn run<H: RoleHandlers>(
    agent_id: AgentId,
    mut state_machine: StateMachine<H>,
    mut mailbox: MailboxReceiver,
    effects: Arc<EffectsRuntime>,
    dispatcher: Arc<Dispatcher>,
) {
    loop {
        let input = match mailbox.recv().await {
            Some(msg) if msg.msg_type == crate::message::MessageType::Shutdown => StepInput::Shutdown,
            Some(msg) => StepInput::Message(msg),
            None => StepInput::Shutdown,
        };
        let shutting_down = matches!(input, StepInput::Shutdown);

        let step_effects: Vec<Effect> = match state_machine.step(input).await {
            Ok(effects) => effects,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "driver step failed");
                vec![]
            }
        };

        if let Err(e) = effects.apply_all(step_effects).await {
            warn!(agent_id = %agent_id, error = %e, "effect application failed, forcing ERROR transition");
            if let Err(e) = state_machine.base.transition_to(ERROR, Default::default()).await {
                warn!(agent_id = %agent_id, error = %e, "could not transition to ERROR after effect failure");
            }
        }

        dispatcher.set_agent_state(&agent_id, state_machine.base.get_current_state()).await;

        if shutting_down || state_machine.base.get_current_state() == crate::state_machine::DONE {
            info!(agent_id = %agent_id, "driver loop exiting");
            break;
        }
    }
}
