use crate::{
    error::PortalError,
    local_store::{LocalStore, DISMISSED_ANNOUNCEMENT_KEY},
    models::Announcement,
    subscription::Subscription,
};

pub type FeedEvent = Result<Option<Announcement>, PortalError>;

/// Realtime view of the single announcement document.
///
/// Subscribers get the current state immediately, then every change. `None`
/// means the document does not exist.
pub trait AnnouncementFeed {
    fn subscribe(&self) -> Subscription<FeedEvent>;
}

/// Decides whether the banner is up. An announcement is shown iff its
/// timestamp differs from the last dismissed one.
pub struct AnnouncementGate<L> {
    store: L,
    current: Option<Announcement>,
    visible: bool,
}

impl<L: LocalStore> AnnouncementGate<L> {
    pub fn new(store: L) -> Self {
        Self {
            store,
            current: None,
            visible: false,
        }
    }

    /// Applies one feed update; returns true when the banner went up or now
    /// shows a different announcement.
    pub fn on_snapshot(&mut self, document: Option<Announcement>) -> bool {
        let announcement = match document {
            Some(a) => a,
            None => return false,
        };

        let dismissed = self.store.get(DISMISSED_ANNOUNCEMENT_KEY);
        if dismissed.as_deref() == Some(announcement.timestamp.as_str()) {
            tracing::debug!(id = %announcement.timestamp, "Announcement already dismissed");
            return false;
        }

        let already_up = self.visible && self.current.as_ref() == Some(&announcement);
        if !already_up {
            tracing::info!(id = %announcement.timestamp, "Showing announcement");
        }
        self.current = Some(announcement);
        self.visible = true;
        !already_up
    }

    pub fn on_error(&mut self, error: &PortalError) {
        tracing::warn!(error = %error, "Announcement feed failed; hiding banner");
        self.visible = false;
    }

    pub fn dismiss(&mut self) {
        let announcement = match &self.current {
            Some(a) => a,
            None => return,
        };

        if let Err(e) = self.store.set(DISMISSED_ANNOUNCEMENT_KEY, &announcement.timestamp) {
            tracing::error!(error = %e, "Unable to record dismissed announcement");
        }
        self.visible = false;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// The announcement on screen, if any.
    pub fn banner(&self) -> Option<&Announcement> {
        if self.visible {
            self.current.as_ref()
        } else {
            None
        }
    }
}

/// Owns the feed subscription for the lifetime of one view.
pub struct AnnouncementWatcher<L> {
    gate: AnnouncementGate<L>,
    feed: Subscription<FeedEvent>,
}

impl<L: LocalStore> AnnouncementWatcher<L> {
    pub fn start<F: AnnouncementFeed>(feed: &F, store: L) -> Self {
        Self {
            gate: AnnouncementGate::new(store),
            feed: feed.subscribe(),
        }
    }

    /// Waits for the next update that raises the banner. `None` once the
    /// feed has ended.
    pub async fn next_banner(&mut self) -> Option<Announcement> {
        loop {
            match self.feed.next().await? {
                Ok(document) => {
                    if self.gate.on_snapshot(document) {
                        return self.gate.banner().cloned();
                    }
                }
                Err(e) => self.gate.on_error(&e),
            }
        }
    }

    pub fn dismiss(&mut self) {
        self.gate.dismiss();
    }

    pub fn gate(&self) -> &AnnouncementGate<L> {
        &self.gate
    }

    pub fn stop(self) {
        self.feed.unsubscribe();
    }
}
