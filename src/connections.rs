//! Per-tab connection and icon state.
//!
//! Two pieces of state are kept: the set of tabs that currently carry the
//! injected bridge, and the single tab that holds the live transport. The
//! three-level display status is derived from both at query time.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub type TabId = u32;

/// Display status of the extension icon for one tab
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IconState {
    Disconnected,
    Injected,
    Connected,
}

/// Emitted whenever a tab's derived state changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IconStateChange {
    pub tab_id: TabId,
    pub state: IconState,
}

/// A tab that is not disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabConnection {
    pub tab_id: TabId,
    pub state: IconState,
}

/// Identifies one transport handshake started by [`ConnectionTracker::begin_handshake`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTicket(u64);

/// What became of a handshake once the transport answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The tab now holds the transport
    Attached,
    /// A newer handshake for the same tab is in flight
    Superseded,
    /// The tab navigated, closed or dropped its transport meanwhile
    Cancelled,
}

#[derive(Debug, Default)]
struct TrackerState {
    injected: BTreeSet<TabId>,
    active: Option<TabId>,
    pending: HashMap<TabId, u64>,
    next_ticket: u64,
}

impl TrackerState {
    fn state_of(&self, tab: TabId) -> IconState {
        if self.active == Some(tab) {
            IconState::Connected
        } else if self.injected.contains(&tab) {
            IconState::Injected
        } else {
            IconState::Disconnected
        }
    }

    fn forget(&mut self, tab: TabId) {
        self.pending.remove(&tab);
        self.injected.remove(&tab);
        if self.active == Some(tab) {
            self.active = None;
        }
    }
}

pub struct ConnectionTracker {
    state: Mutex<TrackerState>,
    events: broadcast::Sender<IconStateChange>,
}

impl ConnectionTracker {
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            state: Mutex::new(TrackerState::default()),
            events,
        }
    }

    /// Receive every state change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<IconStateChange> {
        self.events.subscribe()
    }

    pub fn icon_state(&self, tab: TabId) -> IconState {
        self.lock().state_of(tab)
    }

    /// Tab currently holding the live transport
    pub fn active_tab(&self) -> Option<TabId> {
        self.lock().active
    }

    /// All tabs that are injected or connected, by tab id
    pub fn connections(&self) -> Vec<TabConnection> {
        let state = self.lock();
        let mut tabs: BTreeSet<TabId> = state.injected.clone();
        tabs.extend(state.active);
        tabs.into_iter()
            .map(|tab_id| TabConnection {
                tab_id,
                state: state.state_of(tab_id),
            })
            .collect()
    }

    /// The bridge code was injected into `tab`
    pub fn mark_injected(&self, tab: TabId) {
        self.update(&[tab], |s| {
            s.injected.insert(tab);
        });
    }

    /// `tab` completed a transport handshake and is now the single holder.
    /// The previous holder keeps its bridge and falls back to injected.
    pub fn attach_transport(&self, tab: TabId) {
        self.update(&[tab], |s| {
            s.injected.insert(tab);
            s.active = Some(tab);
        });
    }

    /// Record that a handshake for `tab` is starting. Navigation, tab close
    /// and transport close invalidate the ticket.
    pub fn begin_handshake(&self, tab: TabId) -> HandshakeTicket {
        let mut state = self.lock();
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.pending.insert(tab, ticket);
        HandshakeTicket(ticket)
    }

    /// Attach `tab` if `ticket` is still the live handshake for it
    pub fn complete_handshake(&self, tab: TabId, ticket: HandshakeTicket) -> HandshakeOutcome {
        let mut outcome = HandshakeOutcome::Cancelled;
        self.update(&[tab], |s| {
            outcome = match s.pending.get(&tab) {
                Some(current) if *current == ticket.0 => {
                    s.pending.remove(&tab);
                    s.injected.insert(tab);
                    s.active = Some(tab);
                    HandshakeOutcome::Attached
                }
                Some(_) => HandshakeOutcome::Superseded,
                None => HandshakeOutcome::Cancelled,
            };
        });
        outcome
    }

    /// Drop a handshake that failed
    pub fn abandon_handshake(&self, tab: TabId, ticket: HandshakeTicket) {
        let mut state = self.lock();
        if state.pending.get(&tab) == Some(&ticket.0) {
            state.pending.remove(&tab);
        }
    }

    /// The transport of `tab` closed or failed
    pub fn transport_closed(&self, tab: TabId) {
        self.update(&[tab], |s| s.forget(tab));
    }

    /// `tab` navigated away; the injected bridge is gone
    pub fn navigated(&self, tab: TabId) {
        self.update(&[tab], |s| s.forget(tab));
    }

    pub fn tab_closed(&self, tab: TabId) {
        self.update(&[tab], |s| s.forget(tab));
    }

    /// Apply `change` and emit events for `tabs` and the transport holder
    /// as it was before the change.
    fn update(&self, tabs: &[TabId], change: impl FnOnce(&mut TrackerState)) {
        let changes: Vec<IconStateChange> = {
            let mut state = self.lock();
            let mut affected = tabs.to_vec();
            if let Some(holder) = state.active.filter(|h| !tabs.contains(h)) {
                affected.push(holder);
            }
            let before: Vec<IconState> = affected.iter().map(|t| state.state_of(*t)).collect();
            change(&mut *state);
            affected
                .iter()
                .zip(before)
                .filter_map(|(tab, old)| {
                    let new = state.state_of(*tab);
                    (new != old).then_some(IconStateChange {
                        tab_id: *tab,
                        state: new,
                    })
                })
                .collect()
        };

        for event in changes {
            debug!(tab = event.tab_id, state = ?event.state, "Icon state changed");
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Connection state mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new(64)
    }
}
