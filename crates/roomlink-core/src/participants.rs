use std::sync::Arc;

use crate::events::{ConnectivityState, ParticipantInfo};
use crate::identity::ParticipantId;
use crate::media::{InboundMedia, MediaKind, RenderSink};
use crate::protocol::{Publication, PullSpec, UserInfo};
use crate::subscription::SubscriptionSession;

/// One remote room member.
pub struct Participant {
    id: ParticipantId,
    name: String,
    publications: Vec<Publication>,
    subscription: Option<Arc<SubscriptionSession>>,
    media: InboundMedia,
    state: ConnectivityState,
    renderer: Option<Arc<dyn RenderSink>>,
}

impl Participant {
    fn new(id: ParticipantId, name: String) -> Self {
        Self {
            id,
            name,
            publications: Vec::new(),
            subscription: None,
            media: InboundMedia::new(),
            state: ConnectivityState::Connected,
            renderer: None,
        }
    }

    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publications(&self) -> &[Publication] {
        &self.publications
    }

    pub fn publication(&self, id: &str) -> Option<&Publication> {
        self.publications.iter().find(|p| p.id == id)
    }

    pub fn specs(&self) -> Vec<PullSpec> {
        self.publications.iter().map(Publication::spec).collect()
    }

    pub fn subscription(&self) -> Option<&Arc<SubscriptionSession>> {
        self.subscription.as_ref()
    }

    pub fn media(&self) -> &InboundMedia {
        &self.media
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn is_muted(&self, kind: MediaKind) -> bool {
        self.media.is_muted(kind)
    }

    pub fn renderer(&self) -> Option<&Arc<dyn RenderSink>> {
        self.renderer.as_ref()
    }

    /// True once the participant publishes something but has no session yet.
    pub fn needs_subscription(&self) -> bool {
        !self.publications.is_empty() && self.subscription.is_none()
    }

    pub(crate) fn set_subscription(&mut self, session: Arc<SubscriptionSession>) {
        self.subscription = Some(session);
    }

    pub(crate) fn set_renderer(&mut self, sink: Arc<dyn RenderSink>) -> Option<Arc<dyn RenderSink>> {
        self.renderer.replace(sink)
    }

    /// Append publications with unseen ids; returns the ones actually added.
    fn merge_publications(&mut self, incoming: &[Publication]) -> Vec<Publication> {
        let mut added = Vec::new();
        for publication in incoming {
            if self.publication(&publication.id).is_none() {
                self.publications.push(publication.clone());
                added.push(publication.clone());
            }
        }
        added
    }

    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.state,
            publications: self.publications.clone(),
            audio_muted: self.media.is_muted(MediaKind::Audio),
            video_muted: self.media.is_muted(MediaKind::Video),
            track_count: self.media.len(),
            subscribed: self.subscription.is_some(),
        }
    }
}

/// Result of merging one announced user into the table.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub created: bool,
    pub added: Vec<Publication>,
}

/// All known remote participants, in order of first appearance.
///
/// Mutated only by the room orchestrator. Identities are normalized
/// [`ParticipantId`]s, so upserting any representation of a known member
/// updates the existing entry.
#[derive(Default)]
pub struct ParticipantTable {
    participants: Vec<Participant>,
}

impl ParticipantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, user: &UserInfo) -> UpsertOutcome {
        let created = !self.contains(&user.user_id);
        if created {
            self.participants
                .push(Participant::new(user.user_id.clone(), user.user_name.clone()));
        }
        let participant = self
            .participants
            .iter_mut()
            .find(|p| p.id == user.user_id);
        let added = match participant {
            Some(p) => {
                if !user.user_name.is_empty() {
                    p.name = user.user_name.clone();
                }
                p.merge_publications(&user.pushers)
            }
            None => Vec::new(),
        };
        UpsertOutcome { created, added }
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.id == id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.get(id).is_some()
    }

    /// Returns false when the participant is unknown.
    pub fn set_state(&mut self, id: &ParticipantId, state: ConnectivityState) -> bool {
        match self.get_mut(id) {
            Some(p) => {
                p.state = state;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        let idx = self.participants.iter().position(|p| &p.id == id)?;
        Some(self.participants.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    pub fn drain(&mut self) -> Vec<Participant> {
        std::mem::take(&mut self.participants)
    }

    pub fn snapshot(&self) -> Vec<ParticipantInfo> {
        self.participants.iter().map(Participant::info).collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
