//! Participants registered by the coordinator's `init`

use super::participant::ParticipantStateMachine;
use crate::events::ParticipantId;

use std::collections::HashMap;

/// Id-keyed participants, iterated in registration order
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    participants: HashMap<ParticipantId, ParticipantStateMachine>,
    order: Vec<ParticipantId>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant. Returns false, leaving the registry unchanged, if
    /// the id is already taken.
    pub fn register(&mut self, participant: ParticipantStateMachine) -> bool {
        let id = participant.id().clone();
        if self.participants.contains_key(&id) {
            return false;
        }
        self.order.push(id.clone());
        self.participants.insert(id, participant);
        true
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&ParticipantStateMachine> {
        self.participants.get(id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut ParticipantStateMachine> {
        self.participants.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParticipantStateMachine> + '_ {
        self.order.iter().filter_map(|id| self.participants.get(id))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ParticipantStateMachine> + '_ {
        self.participants.values_mut()
    }
}
