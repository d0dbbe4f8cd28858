use crossbeam_channel::Sender;

use crate::feed::FeedEvent;

/// Producer side of the end-of-list signal.
///
/// Fires at most once per entry into view. After a page settles the consumer
/// calls [`Sentinel::rearm`], so a sentinel that is still visible below the
/// new items fires again on the next observation.
pub struct Sentinel {
    tx: Sender<FeedEvent>,
    in_view: bool,
}

impl Sentinel {
    pub fn new(tx: Sender<FeedEvent>) -> Self {
        Self { tx, in_view: false }
    }

    /// Returns whether an event was delivered.
    pub fn observe(&mut self, visible: bool) -> bool {
        let entering = visible && !self.in_view;
        self.in_view = visible;
        entering && self.tx.send(FeedEvent::EndVisible).is_ok()
    }

    pub fn rearm(&mut self) {
        self.in_view = false;
    }

    pub fn in_view(&self) -> bool {
        self.in_view
    }
}
