//! Turn-based proof-of-understanding dialogue.
//!
//! Both parties derive the dialogue stage from the shared message log alone:
//! the author of the first proof-mode message is the initiator of the thread,
//! and textual prefixes classify every later proof message. No private state
//! feeds the projection, so two peers observing the same log always agree.
//!
//! Completion is different: confirming understanding is a local user gesture
//! that publishes nothing, so `is_completed` belongs to the session, not to
//! the projection.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::MessageStore;

/// Prefix the responding party uses to ask a question about the statement.
pub const QUESTION_PREFIX: &str = "提问：";
/// Prefix the responding party uses to paraphrase the statement back.
pub const PARAPHRASE_PREFIX: &str = "复述：";
/// Prefix used to clarify the statement under discussion.
pub const CLARIFY_PREFIX: &str = "澄清：";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofStage {
    Initial,
    ReceiverResponse,
    SenderClarification,
    Completion,
}

impl ProofStage {
    /// Stage string as stamped into wire message content.
    pub fn as_wire(&self) -> &'static str {
        match self {
            ProofStage::Initial => "initial",
            ProofStage::ReceiverResponse => "receiver_response",
            ProofStage::SenderClarification => "sender_clarification",
            ProofStage::Completion => "completion",
        }
    }
}

/// Dialogue state the session holds between events.
#[derive(Debug, Clone, PartialEq)]
pub struct DialogueState {
    pub is_active: bool,
    pub stage: ProofStage,
    /// Id of the last proof event this side published.
    pub last_message_id: Option<String>,
    pub is_completed: bool,
}

impl Default for DialogueState {
    fn default() -> Self {
        Self {
            is_active: false,
            stage: ProofStage::Initial,
            last_message_id: None,
            is_completed: false,
        }
    }
}

/// Gestures the local party may currently take in the proof dialogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofAction {
    AskQuestion,
    Paraphrase,
    Clarify,
    ConfirmUnderstanding,
}

#[derive(Debug, Error)]
pub enum DialogueError {
    #[error("confirmation requires a fresh paraphrase from the other party")]
    ConfirmNotReady,
    #[error("only the initiating party confirms understanding")]
    NotInitiator,
    #[error("dialogue already completed")]
    AlreadyCompleted,
}

/// Whether the local party initiated the current proof thread, if one exists.
pub fn local_is_initiator(store: &MessageStore) -> Option<bool> {
    store.proof_messages().next().map(|first| first.is_from_me)
}

/// Pure projection of the dialogue stage from the message log.
///
/// Walks proof messages in store order: the first activates the thread and
/// puts it at `receiver_response`; a clarification returns the turn to the
/// responder; a question or paraphrase from the responding party hands the
/// turn to the initiator. Runs identically for both peers because roles are
/// resolved relative to the first message's author.
pub fn project(store: &MessageStore) -> DialogueState {
    let mut state = DialogueState::default();
    let mut initiator_is_me: Option<bool> = None;

    for message in store.proof_messages() {
        let initiator = match initiator_is_me {
            Some(initiator) => initiator,
            None => {
                initiator_is_me = Some(message.is_from_me);
                state.is_active = true;
                state.stage = ProofStage::ReceiverResponse;
                continue;
            }
        };

        let text = message.content.text.as_str();
        let from_initiator = message.is_from_me == initiator;
        if text.starts_with(CLARIFY_PREFIX) {
            state.is_active = true;
            state.stage = ProofStage::ReceiverResponse;
        } else if !from_initiator
            && (text.starts_with(QUESTION_PREFIX) || text.starts_with(PARAPHRASE_PREFIX))
        {
            state.is_active = true;
            state.stage = ProofStage::SenderClarification;
        }
    }

    state
}

/// The dialogue state machine one session holds.
#[derive(Debug, Default)]
pub struct DialogueEngine {
    state: DialogueState,
}

impl DialogueEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &DialogueState {
        &self.state
    }

    /// Re-derive `is_active` and `stage` from the log. Called after every
    /// proof message lands in the store, whether sent or received.
    /// Completion is sticky: once confirmed, late arrivals cannot regress it.
    pub fn apply(&mut self, store: &MessageStore) {
        if self.state.is_completed {
            return;
        }
        let projected = project(store);
        self.state.is_active = projected.is_active;
        self.state.stage = projected.stage;
    }

    /// Record the event id of a proof message this side just published.
    pub fn note_published(&mut self, event_id: &str) {
        self.state.last_message_id = Some(event_id.to_string());
    }

    /// The initiator's explicit confirm gesture. Enabled only while the most
    /// recent inbound proof message is a paraphrase; the transition to
    /// `completion` is terminal.
    pub fn confirm_understanding(&mut self, store: &MessageStore) -> Result<(), DialogueError> {
        if self.state.is_completed {
            return Err(DialogueError::AlreadyCompleted);
        }
        if local_is_initiator(store) != Some(true) {
            return Err(DialogueError::NotInitiator);
        }
        let ready = store
            .proof_messages()
            .filter(|message| !message.is_from_me)
            .last()
            .map(|message| message.content.text.starts_with(PARAPHRASE_PREFIX))
            .unwrap_or(false);
        if !ready {
            return Err(DialogueError::ConfirmNotReady);
        }
        self.state.stage = ProofStage::Completion;
        self.state.is_completed = true;
        Ok(())
    }

    /// Exit the current dialogue without finishing it. Clears the whole
    /// state, including `is_completed` — ending a conversation is not the
    /// same as confirming it, and only the confirm gesture marks completion.
    pub fn exit_dialogue(&mut self) {
        self.state = DialogueState::default();
    }

    /// Gestures currently legal for the local party, derived from the log
    /// the same way both peers derive the stage.
    pub fn permitted_actions(&self, store: &MessageStore) -> Vec<ProofAction> {
        if self.state.is_completed {
            return Vec::new();
        }
        let Some(initiator_is_me) = local_is_initiator(store) else {
            return Vec::new();
        };
        let Some(last) = store.proof_messages().last() else {
            return Vec::new();
        };
        let last_from_initiator = last.is_from_me == initiator_is_me;

        let mut actions = Vec::new();
        if !initiator_is_me && last_from_initiator && !last.is_from_me {
            // The initiator spoke last; the responder may probe the
            // statement.
            actions.push(ProofAction::AskQuestion);
            actions.push(ProofAction::Paraphrase);
        }
        if initiator_is_me && !last_from_initiator && !last.is_from_me {
            let text = last.content.text.as_str();
            if text.starts_with(QUESTION_PREFIX) || text.starts_with(PARAPHRASE_PREFIX) {
                actions.push(ProofAction::Clarify);
            }
            if text.starts_with(PARAPHRASE_PREFIX) {
                actions.push(ProofAction::ConfirmUnderstanding);
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Message;
    use crate::nostr::MessageContent;

    /// Build the same exchange as seen by each party: `from_a` flags say who
    /// authored each message, and the store is rendered from one side's
    /// point of view.
    fn store_for(local_is_a: bool, script: &[(bool, &str)]) -> MessageStore {
        let mut store = MessageStore::new();
        for (index, (from_a, text)) in script.iter().enumerate() {
            store.insert(Message {
                content: MessageContent::proof(*text, None),
                sender: if *from_a { "aa".repeat(32) } else { "bb".repeat(32) },
                receiver: None,
                timestamp: 1_700_000_000 + index as u64,
                is_from_me: *from_a == local_is_a,
            });
        }
        store
    }

    #[test]
    fn empty_log_is_inactive_initial() {
        let store = MessageStore::new();
        let state = project(&store);
        assert!(!state.is_active);
        assert_eq!(state.stage, ProofStage::Initial);
        assert_eq!(local_is_initiator(&store), None);
    }

    #[test]
    fn first_proof_message_activates_thread() {
        let store = store_for(true, &[(true, "理解是一种耐心")]);
        let state = project(&store);
        assert!(state.is_active);
        assert_eq!(state.stage, ProofStage::ReceiverResponse);
        assert_eq!(local_is_initiator(&store), Some(true));
    }

    #[test]
    fn question_from_responder_hands_turn_to_initiator() {
        let script = [(true, "理解是一种耐心"), (false, "提问：为什么是耐心？")];
        for local_is_a in [true, false] {
            let state = project(&store_for(local_is_a, &script));
            assert_eq!(state.stage, ProofStage::SenderClarification);
        }
    }

    #[test]
    fn clarification_returns_turn_to_responder() {
        let script = [
            (true, "理解是一种耐心"),
            (false, "提问：为什么是耐心？"),
            (true, "澄清：因为语言是误解的源头"),
        ];
        for local_is_a in [true, false] {
            let state = project(&store_for(local_is_a, &script));
            assert_eq!(state.stage, ProofStage::ReceiverResponse);
        }
    }

    #[test]
    fn clarification_from_non_initiator_also_returns_turn() {
        // B initiated; A answers a question with a clarification of its own.
        // Role resolution still pins B as initiator, and both sides project
        // the same transition out of sender_clarification.
        let script = [
            (false, "先说一个想法"),
            (true, "提问：此话怎讲？"),
            (true, "澄清：why?"),
        ];
        for local_is_a in [true, false] {
            let store = store_for(local_is_a, &script);
            assert_eq!(local_is_initiator(&store), Some(!local_is_a));
            let state = project(&store);
            assert_eq!(state.stage, ProofStage::ReceiverResponse);
        }
    }

    #[test]
    fn unprefixed_proof_text_does_not_transition() {
        let script = [
            (true, "理解是一种耐心"),
            (false, "提问：为什么？"),
            (false, "随便聊聊而已"),
        ];
        let state = project(&store_for(true, &script));
        assert_eq!(state.stage, ProofStage::SenderClarification);
    }

    #[test]
    fn normal_mode_messages_are_invisible_to_the_projection() {
        let mut store = store_for(true, &[(true, "理解是一种耐心")]);
        store.insert(Message {
            content: MessageContent::normal("提问：这句是普通聊天"),
            sender: "bb".repeat(32),
            receiver: None,
            timestamp: 1_700_000_100,
            is_from_me: false,
        });
        let state = project(&store);
        assert_eq!(state.stage, ProofStage::ReceiverResponse);
    }

    #[test]
    fn projection_is_symmetric_across_parties() {
        let script = [
            (true, "理解是一种耐心"),
            (false, "提问：为什么是耐心？"),
            (true, "澄清：因为语言是误解的源头"),
            (false, "复述：你是说误解需要时间化解"),
        ];
        let state_a = project(&store_for(true, &script));
        let state_b = project(&store_for(false, &script));
        assert_eq!(state_a, state_b);
        assert_eq!(state_a.stage, ProofStage::SenderClarification);

        let init_a = local_is_initiator(&store_for(true, &script));
        let init_b = local_is_initiator(&store_for(false, &script));
        assert_eq!(init_a, Some(true));
        assert_eq!(init_b, Some(false));
    }

    #[test]
    fn confirm_requires_initiator_and_fresh_paraphrase() {
        let script = [
            (true, "理解是一种耐心"),
            (false, "提问：为什么是耐心？"),
        ];
        let store = store_for(true, &script);
        let mut engine = DialogueEngine::new();
        engine.apply(&store);
        assert!(matches!(
            engine.confirm_understanding(&store),
            Err(DialogueError::ConfirmNotReady)
        ));

        let script = [
            (true, "理解是一种耐心"),
            (false, "复述：你是说理解需要时间"),
        ];
        // The responder cannot confirm, even against a paraphrase.
        let store_b = store_for(false, &script);
        let mut engine_b = DialogueEngine::new();
        engine_b.apply(&store_b);
        assert!(matches!(
            engine_b.confirm_understanding(&store_b),
            Err(DialogueError::NotInitiator)
        ));

        let store = store_for(true, &script);
        let mut engine = DialogueEngine::new();
        engine.apply(&store);
        engine.confirm_understanding(&store).unwrap();
        assert!(engine.state().is_completed);
        assert_eq!(engine.state().stage, ProofStage::Completion);

        assert!(matches!(
            engine.confirm_understanding(&store),
            Err(DialogueError::AlreadyCompleted)
        ));
        // Completion is sticky against further log applications.
        engine.apply(&store);
        assert_eq!(engine.state().stage, ProofStage::Completion);
    }

    #[test]
    fn exit_resets_everything_and_leaves_completion_to_confirm_only() {
        let script = [
            (true, "理解是一种耐心"),
            (false, "复述：你是说理解需要时间"),
        ];
        let store = store_for(true, &script);
        let mut engine = DialogueEngine::new();
        engine.apply(&store);
        engine.note_published("abcd");
        engine.exit_dialogue();
        assert_eq!(engine.state(), &DialogueState::default());

        // Re-applying the log resumes the paused thread.
        engine.apply(&store);
        assert!(engine.state().is_active);
        assert!(!engine.state().is_completed);
    }

    #[test]
    fn permitted_actions_follow_the_turn() {
        let opening = [(true, "理解是一种耐心")];
        // Responder side: initiator spoke last.
        let store = store_for(false, &opening);
        let engine = DialogueEngine::new();
        assert_eq!(
            engine.permitted_actions(&store),
            vec![ProofAction::AskQuestion, ProofAction::Paraphrase]
        );
        // Initiator side: own message last, nothing to do but wait.
        let store = store_for(true, &opening);
        assert!(engine.permitted_actions(&store).is_empty());

        let questioned = [
            (true, "理解是一种耐心"),
            (false, "提问：为什么是耐心？"),
        ];
        let store = store_for(true, &questioned);
        assert_eq!(
            engine.permitted_actions(&store),
            vec![ProofAction::Clarify]
        );

        let paraphrased = [
            (true, "理解是一种耐心"),
            (false, "复述：你是说理解需要时间"),
        ];
        let store = store_for(true, &paraphrased);
        assert_eq!(
            engine.permitted_actions(&store),
            vec![ProofAction::Clarify, ProofAction::ConfirmUnderstanding]
        );

        // After confirming, no further gestures.
        let mut engine = DialogueEngine::new();
        engine.apply(&store);
        engine.confirm_understanding(&store).unwrap();
        assert!(engine.permitted_actions(&store).is_empty());
    }
}
