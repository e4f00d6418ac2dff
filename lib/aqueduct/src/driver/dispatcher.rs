use crate::driver::image::PublicationImage;
use crate::protocol;
use hashbrown::HashMap;
use indexmap::IndexSet;
use std::sync::Arc;

/// Per-(stream, session) slot state.
pub enum SessionInterest {
    /// Wired to an image; frames flow straight into its term log.
    Active {
        image: Arc<PublicationImage>,
        transport_index: usize,
    },
    /// A DATA frame arrived first; a setup-eliciting SM has gone out.
    PendingSetupFrame { since_ns: i64 },
    /// The conductor is building the image.
    InitInProgress,
    /// Image recently removed; the slot must not resurrect until the
    /// deadline so in-flight frames drain harmlessly.
    OnCoolDown { deadline_ns: i64 },
    /// Session actively not wanted; cheap drop for its frames.
    NoInterest { last_hit_ns: i64 },
}

struct StreamInterest {
    is_all_sessions: bool,
    subscribed_session_ids: IndexSet<i32>,
    sessions: HashMap<i32, SessionInterest>,
}

impl StreamInterest {
    fn wants(&self, session_id: i32) -> bool {
        self.is_all_sessions || self.subscribed_session_ids.contains(&session_id)
    }
}

pub enum DataOutcome {
    /// Bytes accepted by an image.
    Dispatched(usize),
    /// New session on a wanted stream; caller sends the eliciting SM.
    ElicitSetup,
    Dropped,
}

pub enum SetupOutcome {
    /// Ask the conductor for a new image.
    CreateImage,
    /// Known session; nothing to do.
    Ignored,
}

/// Inbound (streamId, sessionId) state machine for one receive endpoint.
pub struct DataPacketDispatcher {
    streams: HashMap<i32, StreamInterest>,
}

impl DataPacketDispatcher {
    pub fn new() -> DataPacketDispatcher {
        DataPacketDispatcher {
            streams: HashMap::new(),
        }
    }

    #[inline]
    pub fn has_interest(&self, stream_id: i32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn add_subscription(&mut self, stream_id: i32) {
        let interest = self.streams.entry(stream_id).or_insert_with(|| StreamInterest {
            is_all_sessions: false,
            subscribed_session_ids: IndexSet::new(),
            sessions: HashMap::new(),
        });

        interest.is_all_sessions = true;
        // Sessions parked as unwanted are now fair game again.
        interest
            .sessions
            .retain(|_, state| !matches!(state, SessionInterest::NoInterest { .. }));
    }

    pub fn add_subscription_session(&mut self, stream_id: i32, session_id: i32) {
        let interest = self.streams.entry(stream_id).or_insert_with(|| StreamInterest {
            is_all_sessions: false,
            subscribed_session_ids: IndexSet::new(),
            sessions: HashMap::new(),
        });

        interest.subscribed_session_ids.insert(session_id);
        if let Some(SessionInterest::NoInterest { .. }) = interest.sessions.get(&session_id) {
            interest.sessions.remove(&session_id);
        }
    }

    /// Drop the all-sessions interest. Images for explicitly subscribed
    /// sessions survive; everything else is purged and returned for
    /// tear-down.
    pub fn remove_subscription(&mut self, stream_id: i32) -> Vec<Arc<PublicationImage>> {
        let mut removed = Vec::new();

        if let Some(interest) = self.streams.get_mut(&stream_id) {
            interest.is_all_sessions = false;
            let keep = interest.subscribed_session_ids.clone();
            interest.sessions.retain(|session_id, state| {
                if keep.contains(session_id) {
                    return true;
                }
                if let SessionInterest::Active { image, .. } = state {
                    removed.push(image.clone());
                }
                false
            });

            if keep.is_empty() {
                self.streams.remove(&stream_id);
            }
        }

        removed
    }

    pub fn remove_subscription_session(
        &mut self,
        stream_id: i32,
        session_id: i32,
    ) -> Option<Arc<PublicationImage>> {
        let mut removed = None;

        if let Some(interest) = self.streams.get_mut(&stream_id) {
            interest.subscribed_session_ids.swap_remove(&session_id);
            if !interest.is_all_sessions {
                if let Some(SessionInterest::Active { image, .. }) =
                    interest.sessions.remove(&session_id)
                {
                    removed = Some(image);
                }
                if interest.subscribed_session_ids.is_empty() && !interest.is_all_sessions {
                    self.streams.remove(&stream_id);
                }
            }
        }

        removed
    }

    pub fn on_data(
        &mut self,
        session_id: i32,
        stream_id: i32,
        packet: &[u8],
        transport_hint: usize,
        now_ns: i64,
    ) -> DataOutcome {
        let _ = transport_hint;
        let interest = match self.streams.get_mut(&stream_id) {
            Some(interest) => interest,
            None => return DataOutcome::Dropped,
        };

        match interest.sessions.get_mut(&session_id) {
            Some(SessionInterest::Active {
                image,
                transport_index,
            }) => {
                let term_id = protocol::header::term_id(packet);
                let term_offset = protocol::header::term_offset(packet);
                let bytes = image.insert_packet(term_id, term_offset, packet, *transport_index, now_ns);
                DataOutcome::Dispatched(bytes)
            }
            Some(SessionInterest::NoInterest { last_hit_ns }) => {
                *last_hit_ns = now_ns;
                DataOutcome::Dropped
            }
            Some(_) => DataOutcome::Dropped,
            None => {
                if protocol::is_end_of_stream(packet) {
                    return DataOutcome::Dropped;
                }

                if interest.wants(session_id) {
                    interest
                        .sessions
                        .insert(session_id, SessionInterest::PendingSetupFrame { since_ns: now_ns });
                    DataOutcome::ElicitSetup
                } else {
                    interest
                        .sessions
                        .insert(session_id, SessionInterest::NoInterest { last_hit_ns: now_ns });
                    DataOutcome::Dropped
                }
            }
        }
    }

    pub fn on_setup(&mut self, session_id: i32, stream_id: i32, now_ns: i64) -> SetupOutcome {
        let interest = match self.streams.get_mut(&stream_id) {
            Some(interest) => interest,
            None => return SetupOutcome::Ignored,
        };

        match interest.sessions.get(&session_id) {
            Some(SessionInterest::PendingSetupFrame { .. }) => {
                interest
                    .sessions
                    .insert(session_id, SessionInterest::InitInProgress);
                SetupOutcome::CreateImage
            }
            None => {
                if interest.wants(session_id) {
                    interest
                        .sessions
                        .insert(session_id, SessionInterest::InitInProgress);
                    SetupOutcome::CreateImage
                } else {
                    interest
                        .sessions
                        .insert(session_id, SessionInterest::NoInterest { last_hit_ns: now_ns });
                    SetupOutcome::Ignored
                }
            }
            Some(_) => SetupOutcome::Ignored,
        }
    }

    /// Wire an image into its slot once the conductor created it (or an
    /// MDS attach found an existing one).
    pub fn set_image(
        &mut self,
        stream_id: i32,
        session_id: i32,
        image: Arc<PublicationImage>,
        transport_index: usize,
    ) {
        if let Some(interest) = self.streams.get_mut(&stream_id) {
            interest.sessions.insert(
                session_id,
                SessionInterest::Active {
                    image,
                    transport_index,
                },
            );
        }
    }

    /// Replace an image slot with a cool-down so the pair cannot
    /// immediately re-create an image while stale frames drain.
    pub fn remove_image(&mut self, stream_id: i32, session_id: i32, cool_down_deadline_ns: i64) {
        if let Some(interest) = self.streams.get_mut(&stream_id) {
            if let Some(SessionInterest::Active { .. }) = interest.sessions.get(&session_id) {
                interest.sessions.insert(
                    session_id,
                    SessionInterest::OnCoolDown {
                        deadline_ns: cool_down_deadline_ns,
                    },
                );
            }
        }
    }

    /// Expire cool-downs and evict aged no-interest slots.
    pub fn housekeeping(&mut self, now_ns: i64, no_interest_timeout_ns: i64) {
        for interest in self.streams.values_mut() {
            interest.sessions.retain(|_, state| match state {
                SessionInterest::OnCoolDown { deadline_ns } => now_ns < *deadline_ns,
                SessionInterest::NoInterest { last_hit_ns } => {
                    now_ns - *last_hit_ns < no_interest_timeout_ns
                }
                _ => true,
            });
        }
    }

    /// Stale pending-setup slots, for the receiver's timeout bookkeeping.
    pub fn pending_setup_sessions(&self, older_than_ns: i64) -> Vec<(i32, i32)> {
        let mut stale = Vec::new();
        for (stream_id, interest) in self.streams.iter() {
            for (session_id, state) in interest.sessions.iter() {
                if let SessionInterest::PendingSetupFrame { since_ns } = state {
                    if *since_ns <= older_than_ns {
                        stale.push((*stream_id, *session_id));
                    }
                }
            }
        }
        stale
    }

    /// Abandon a pending setup that never completed.
    pub fn remove_pending_setup(&mut self, stream_id: i32, session_id: i32) {
        if let Some(interest) = self.streams.get_mut(&stream_id) {
            if let Some(SessionInterest::PendingSetupFrame { .. }) =
                interest.sessions.get(&session_id)
            {
                interest.sessions.remove(&session_id);
            }
        }
    }

    /// Find the live image for a (stream, session) pair on this endpoint.
    pub fn find_image(&self, stream_id: i32, session_id: i32) -> Option<Arc<PublicationImage>> {
        self.streams.get(&stream_id).and_then(|interest| {
            match interest.sessions.get(&session_id) {
                Some(SessionInterest::Active { image, .. }) => Some(image.clone()),
                _ => None,
            }
        })
    }
}
