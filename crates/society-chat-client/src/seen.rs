//! Decides when to emit `mark as seen` for the open conversation.
//!
//! Three triggers feed the same idempotent call: the window regaining
//! focus, the newest message scrolling at least 80% into view, and history
//! finishing loading for a freshly selected peer. Firing more than once is
//! harmless, so none of them suppresses the others.

use society_chat_shared::constants::SEEN_VISIBILITY_THRESHOLD;
use society_chat_shared::{MarkAsSeen, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeenTrigger {
    Focus,
    LastMessageVisible,
    HistoryLoaded,
}

#[derive(Debug, Clone)]
pub struct SeenTracker {
    me: UserId,
    active: Option<UserId>,
    focused: bool,
    /// Whether the newest message is currently past the visibility threshold.
    last_visible: bool,
    threshold: f64,
}

impl SeenTracker {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            active: None,
            focused: true,
            last_visible: false,
            threshold: SEEN_VISIBILITY_THRESHOLD,
        }
    }

    pub fn active(&self) -> Option<&UserId> {
        self.active.as_ref()
    }

    pub fn select(&mut self, peer: Option<UserId>) {
        self.active = peer;
        self.last_visible = false;
    }

    fn emit(&self, trigger: SeenTrigger) -> Option<MarkAsSeen> {
        let peer = self.active.clone()?;
        tracing::debug!(peer = %peer.short(), ?trigger, "Marking conversation seen");
        Some(MarkAsSeen {
            user_id: self.me.clone(),
            peer_id: peer,
        })
    }

    /// Window focus changed. Fires on regaining focus only.
    pub fn on_focus(&mut self, focused: bool) -> Option<MarkAsSeen> {
        let regained = focused && !self.focused;
        self.focused = focused;
        if regained {
            self.emit(SeenTrigger::Focus)
        } else {
            None
        }
    }

    /// Visible fraction of the newest message element, `0.0..=1.0`. Fires
    /// when it crosses the threshold upwards.
    pub fn on_visibility(&mut self, ratio: f64) -> Option<MarkAsSeen> {
        let visible = ratio >= self.threshold;
        let crossed = visible && !self.last_visible;
        self.last_visible = visible;
        if crossed {
            self.emit(SeenTrigger::LastMessageVisible)
        } else {
            None
        }
    }

    /// A different message became the newest one; its visibility starts over.
    pub fn on_new_last_message(&mut self) {
        self.last_visible = false;
    }

    pub fn on_history_loaded(&mut self, peer: &UserId) -> Option<MarkAsSeen> {
        if self.active.as_ref() != Some(peer) {
            return None;
        }
        self.emit(SeenTrigger::HistoryLoaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> SeenTracker {
        let mut t = SeenTracker::new("me".into());
        t.select(Some("peer".into()));
        t
    }

    #[test]
    fn test_nothing_without_selection() {
        let mut t = SeenTracker::new("me".into());
        t.on_focus(false);
        assert!(t.on_focus(true).is_none());
        assert!(t.on_visibility(1.0).is_none());
    }

    #[test]
    fn test_focus_regained() {
        let mut t = tracker();
        assert!(t.on_focus(true).is_none());
        t.on_focus(false);
        let mark = t.on_focus(true).unwrap();
        assert_eq!(mark.user_id, UserId::from("me"));
        assert_eq!(mark.peer_id, UserId::from("peer"));
    }

    #[test]
    fn test_visibility_threshold() {
        let mut t = tracker();
        assert!(t.on_visibility(0.79).is_none());
        assert!(t.on_visibility(0.8).is_some());
        assert!(t.on_visibility(0.95).is_none());

        t.on_new_last_message();
        assert!(t.on_visibility(1.0).is_some());

        t.on_visibility(0.1);
        assert!(t.on_visibility(0.9).is_some());
    }

    #[test]
    fn test_history_loaded_for_active_peer_only() {
        let mut t = tracker();
        assert!(t.on_history_loaded(&"other".into()).is_none());
        assert!(t.on_history_loaded(&"peer".into()).is_some());
    }
}
