//! Feed controller: an ordered, de-duplicated post list fed by a paginated
//! upstream, with optimistic likes and request-gated create/edit/delete.
//!
//! Remote calls run on worker threads. Their results come back through a
//! channel and are applied only inside [`FeedController::pump`] or
//! [`FeedController::wait_idle`], so every mutation of the list happens on
//! the caller's thread, one response at a time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::api::{ApiError, Cursor, LikeOutcome, Page, Post, PostId};
use crate::config::FeedConfig;
use crate::data::PostService;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("post content cannot be empty")]
    EmptyContent,
    #[error("post {0} is not in the feed")]
    UnknownPost(PostId),
    #[error("the feed has been shut down")]
    ShutDown,
}

/// Signals pushed by the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEvent {
    /// The end-of-list sentinel came into view.
    EndVisible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub text: String,
    expires_at: Instant,
}

/// What happened during one pump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pump {
    pub changed: bool,
    /// A page request finished, successfully or not. The end-of-list
    /// sentinel should be re-armed.
    pub page_settled: bool,
}

impl Pump {
    fn absorb(&mut self, other: Pump) {
        self.changed |= other.changed;
        self.page_settled |= other.page_settled;
    }
}

#[derive(Debug, Clone)]
pub struct FeedOptions {
    pub notice_ttl: Duration,
}

impl Default for FeedOptions {
    fn default() -> Self {
        FeedConfig::default().into()
    }
}

impl From<FeedConfig> for FeedOptions {
    fn from(cfg: FeedConfig) -> Self {
        Self {
            notice_ttl: cfg.notice_ttl,
        }
    }
}

struct PendingPage {
    request_id: u64,
    cancel_flag: Arc<AtomicBool>,
}

/// Last server-consistent like state of a post plus the toggles still in
/// flight. The displayed state is `confirmed` with every pending toggle
/// applied; a failed toggle is undone by dropping it from `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LikeLedger {
    confirmed: LikeState,
    pending: usize,
    /// Set once a toggle was issued while another was in flight.
    overlapped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LikeState {
    liked: bool,
    count: u32,
}

impl LikeState {
    fn of(post: &Post) -> Self {
        Self {
            liked: post.is_liked,
            count: post.likes_count,
        }
    }

    fn toggled(self) -> Self {
        if self.liked {
            Self {
                liked: false,
                count: self.count.saturating_sub(1),
            }
        } else {
            Self {
                liked: true,
                count: self.count.saturating_add(1),
            }
        }
    }

    fn apply_to(self, post: &mut Post) {
        post.is_liked = self.liked;
        post.likes_count = self.count;
    }
}

impl LikeLedger {
    fn displayed(&self) -> LikeState {
        (0..self.pending).fold(self.confirmed, |state, _| state.toggled())
    }

    fn begin(&mut self) {
        if self.pending > 0 {
            self.overlapped = true;
        }
        self.pending += 1;
    }

    /// Folds one confirmed toggle in. A server-reported state is trusted only
    /// for a toggle that never overlapped another: replies to overlapping
    /// toggles may arrive in any order.
    fn confirm(&mut self, outcome: &LikeOutcome) {
        self.pending = self.pending.saturating_sub(1);
        self.confirmed = self.confirmed.toggled();
        if self.pending > 0 || self.overlapped {
            return;
        }
        if let Some(liked) = outcome.liked {
            if liked != self.confirmed.liked {
                self.confirmed = self.confirmed.toggled();
            }
        }
        if let Some(count) = outcome.likes_count {
            self.confirmed.count = count;
        }
    }

    fn reject(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }
}

enum AsyncResponse {
    Page {
        request_id: u64,
        result: Result<Page<Post>, ApiError>,
    },
    Created {
        result: Result<Post, ApiError>,
    },
    Liked {
        id: PostId,
        generation: u64,
        result: Result<LikeOutcome, ApiError>,
    },
    Deleted {
        id: PostId,
        result: Result<(), ApiError>,
    },
    Edited {
        id: PostId,
        result: Result<Post, ApiError>,
    },
}

pub struct FeedController {
    service: Arc<dyn PostService>,
    options: FeedOptions,
    posts: Vec<Post>,
    cursor: Cursor,
    pending_page: Option<PendingPage>,
    likes: HashMap<PostId, LikeLedger>,
    /// Bumped whenever `likes` is dropped; replies tagged with an older
    /// value belong to ledgers that no longer exist.
    like_generation: u64,
    pending_deletes: HashSet<PostId>,
    notice: Option<Notice>,
    next_request_id: u64,
    in_flight: usize,
    alive: Arc<AtomicBool>,
    event_tx: Sender<FeedEvent>,
    event_rx: Receiver<FeedEvent>,
    response_tx: Sender<AsyncResponse>,
    response_rx: Receiver<AsyncResponse>,
}

impl FeedController {
    pub fn new(service: Arc<dyn PostService>, options: FeedOptions) -> Self {
        let (event_tx, event_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();
        Self {
            service,
            options,
            posts: Vec::new(),
            cursor: Cursor::Start,
            pending_page: None,
            likes: HashMap::new(),
            like_generation: 0,
            pending_deletes: HashSet::new(),
            notice: None,
            next_request_id: 0,
            in_flight: 0,
            alive: Arc::new(AtomicBool::new(true)),
            event_tx,
            event_rx,
            response_tx,
            response_rx,
        }
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn post(&self, id: PostId) -> Option<&Post> {
        self.posts.iter().find(|post| post.id == id)
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn is_loading(&self) -> bool {
        self.pending_page.is_some()
    }

    pub fn has_more(&self) -> bool {
        !self.cursor.is_exhausted()
    }

    pub fn is_like_pending(&self, id: PostId) -> bool {
        self.likes.get(&id).is_some_and(|ledger| ledger.pending > 0)
    }

    pub fn is_delete_pending(&self, id: PostId) -> bool {
        self.pending_deletes.contains(&id)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Requests still awaiting a response.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Sender for presentation-layer signals; drained by [`Self::pump`].
    pub fn events(&self) -> Sender<FeedEvent> {
        self.event_tx.clone()
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice_at(Instant::now())
    }

    pub fn notice_at(&self, now: Instant) -> Option<&Notice> {
        self.notice
            .as_ref()
            .filter(|notice| now < notice.expires_at)
    }

    /// Requests the page at the stored cursor. Returns `false` without doing
    /// anything while a page is already in flight or the feed is exhausted.
    pub fn load_next_page(&mut self) -> bool {
        if !self.is_alive() || self.pending_page.is_some() || self.cursor.is_exhausted() {
            return false;
        }

        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.pending_page = Some(PendingPage {
            request_id,
            cancel_flag: cancel_flag.clone(),
        });

        let cursor = self.cursor.clone();
        debug!("feed: loading page {:?} (request {})", cursor, request_id);
        let service = Arc::clone(&self.service);
        self.dispatch(move || {
            let result = if cancel_flag.load(Ordering::SeqCst) {
                Ok(Page::default())
            } else {
                service.fetch_page(&cursor)
            };
            AsyncResponse::Page { request_id, result }
        });
        true
    }

    /// Drops the list and starts over from the first page. An in-flight page
    /// request is cancelled and its response ignored.
    pub fn reload(&mut self) -> bool {
        if let Some(pending) = self.pending_page.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
        self.posts.clear();
        self.clear_likes();
        self.cursor = Cursor::Start;
        self.load_next_page()
    }

    pub fn create_post(&mut self, content: &str) -> Result<(), FeedError> {
        if !self.is_alive() {
            return Err(FeedError::ShutDown);
        }
        if content.trim().is_empty() {
            return Err(FeedError::EmptyContent);
        }
        let content = content.to_string();
        let service = Arc::clone(&self.service);
        self.dispatch(move || AsyncResponse::Created {
            result: service.create_post(&content),
        });
        Ok(())
    }

    /// Flips the like locally right away and sends the toggle. Returns
    /// `false` if the post isn't in the feed.
    pub fn toggle_like(&mut self, id: PostId) -> bool {
        if !self.is_alive() {
            return false;
        }
        let Some(post) = self.posts.iter_mut().find(|post| post.id == id) else {
            return false;
        };
        let ledger = self.likes.entry(id).or_insert(LikeLedger {
            confirmed: LikeState::of(post),
            pending: 0,
            overlapped: false,
        });
        ledger.begin();
        ledger.displayed().apply_to(post);

        let generation = self.like_generation;
        let service = Arc::clone(&self.service);
        self.dispatch(move || AsyncResponse::Liked {
            id,
            generation,
            result: service.toggle_like(id),
        });
        true
    }

    /// Sends a delete; the post leaves the list only once the server agrees.
    /// A second call while the first is in flight does nothing.
    pub fn delete_post(&mut self, id: PostId) -> bool {
        if !self.is_alive() || self.pending_deletes.contains(&id) || self.post(id).is_none() {
            return false;
        }
        self.pending_deletes.insert(id);
        let service = Arc::clone(&self.service);
        self.dispatch(move || AsyncResponse::Deleted {
            id,
            result: service.delete_post(id),
        });
        true
    }

    pub fn edit_post(&mut self, id: PostId, content: &str) -> Result<(), FeedError> {
        if !self.is_alive() {
            return Err(FeedError::ShutDown);
        }
        if content.trim().is_empty() {
            return Err(FeedError::EmptyContent);
        }
        if self.post(id).is_none() {
            return Err(FeedError::UnknownPost(id));
        }
        let content = content.to_string();
        let service = Arc::clone(&self.service);
        self.dispatch(move || AsyncResponse::Edited {
            id,
            result: service.update_post(id, &content),
        });
        Ok(())
    }

    /// Applies queued events and responses without blocking.
    pub fn pump(&mut self) -> Pump {
        self.pump_at(Instant::now())
    }

    fn pump_at(&mut self, now: Instant) -> Pump {
        let mut pump = Pump::default();
        while let Ok(event) = self.event_rx.try_recv() {
            match event {
                FeedEvent::EndVisible => {
                    if self.load_next_page() {
                        pump.changed = true;
                    }
                }
            }
        }
        while let Ok(message) = self.response_rx.try_recv() {
            pump.absorb(self.handle_async_response(message));
        }
        if self
            .notice
            .as_ref()
            .is_some_and(|notice| now >= notice.expires_at)
        {
            self.notice = None;
            pump.changed = true;
        }
        pump
    }

    /// Pumps until nothing is in flight or `timeout` passes.
    pub fn wait_idle(&mut self, timeout: Duration) -> Pump {
        let deadline = Instant::now() + timeout;
        let mut pump = self.pump();
        while self.in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.response_rx.recv_timeout(deadline - now) {
                Ok(message) => pump.absorb(self.handle_async_response(message)),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => break,
            }
            pump.absorb(self.pump());
        }
        pump
    }

    /// Tears the feed down. Responses still in flight are discarded.
    pub fn shutdown(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(pending) = self.pending_page.take() {
            pending.cancel_flag.store(true, Ordering::SeqCst);
        }
        self.posts.clear();
        self.clear_likes();
        self.pending_deletes.clear();
        self.notice = None;
        self.in_flight = 0;
    }

    fn clear_likes(&mut self) {
        self.likes.clear();
        self.like_generation = self.like_generation.wrapping_add(1);
    }

    fn dispatch<F>(&mut self, job: F)
    where
        F: FnOnce() -> AsyncResponse + Send + 'static,
    {
        if !self.is_alive() {
            return;
        }
        self.in_flight += 1;
        let tx = self.response_tx.clone();
        let alive = Arc::clone(&self.alive);
        thread::spawn(move || {
            let response = job();
            if alive.load(Ordering::SeqCst) {
                let _ = tx.send(response);
            }
        });
    }

    fn set_notice(&mut self, kind: NoticeKind, text: impl Into<String>) {
        self.notice = Some(Notice {
            kind,
            text: text.into(),
            expires_at: Instant::now() + self.options.notice_ttl,
        });
    }

    fn handle_async_response(&mut self, message: AsyncResponse) -> Pump {
        if !self.is_alive() {
            return Pump::default();
        }
        self.in_flight = self.in_flight.saturating_sub(1);
        let mut pump = Pump {
            changed: true,
            page_settled: false,
        };

        match message {
            AsyncResponse::Page { request_id, result } => {
                let Some(pending) = &self.pending_page else {
                    return Pump::default();
                };
                if pending.request_id != request_id
                    || pending.cancel_flag.load(Ordering::SeqCst)
                {
                    return Pump::default();
                }
                self.pending_page = None;
                pump.page_settled = true;

                match result {
                    Ok(page) => {
                        let incoming = page.results.len();
                        let added = merge_page(&mut self.posts, page.results);
                        if added < incoming {
                            debug!(
                                "feed: skipped {} duplicate post{}",
                                incoming - added,
                                if incoming - added == 1 { "" } else { "s" }
                            );
                        }
                        self.cursor = Cursor::from_next(page.next);
                        debug!(
                            "feed: merged {} posts, {} total, next {:?}",
                            added,
                            self.posts.len(),
                            self.cursor
                        );
                    }
                    Err(err) => {
                        warn!("feed: failed to load posts: {err}");
                        self.set_notice(NoticeKind::Error, format!("Failed to load posts: {err}"));
                    }
                }
            }
            AsyncResponse::Created { result } => match result {
                Ok(post) => {
                    self.posts.retain(|existing| existing.id != post.id);
                    self.posts.insert(0, post);
                    self.set_notice(NoticeKind::Info, "Post created successfully!");
                }
                Err(err) => {
                    warn!("feed: failed to create post: {err}");
                    let text = match err {
                        ApiError::Validation(reason) => {
                            format!("Failed to create the post: {reason}")
                        }
                        _ => "Failed to create the post. Please try again.".to_string(),
                    };
                    self.set_notice(NoticeKind::Error, text);
                }
            },
            AsyncResponse::Liked {
                id,
                generation,
                result,
            } => {
                if generation != self.like_generation {
                    debug!("feed: dropping like reply for {id} from before a reload");
                    return pump;
                }
                let Some(ledger) = self.likes.get_mut(&id) else {
                    debug!("feed: like reply for {id} no longer tracked");
                    return pump;
                };
                match &result {
                    Ok(outcome) => ledger.confirm(outcome),
                    Err(err) => {
                        warn!("feed: failed to toggle like on {id}: {err}");
                        ledger.reject();
                    }
                }
                let ledger = *ledger;
                if ledger.pending == 0 {
                    self.likes.remove(&id);
                }
                if let Some(post) = self.posts.iter_mut().find(|post| post.id == id) {
                    ledger.displayed().apply_to(post);
                }
                if result.is_err() {
                    self.set_notice(NoticeKind::Error, "Failed to update like.");
                }
            }
            AsyncResponse::Deleted { id, result } => {
                self.pending_deletes.remove(&id);
                match result {
                    Ok(()) => {
                        self.posts.retain(|post| post.id != id);
                        self.likes.remove(&id);
                    }
                    Err(err) => {
                        warn!("feed: failed to delete post {id}: {err}");
                        self.set_notice(NoticeKind::Error, format!("Failed to delete post: {err}"));
                    }
                }
            }
            AsyncResponse::Edited { id, result } => match result {
                Ok(updated) => {
                    if let Some(post) = self.posts.iter_mut().find(|post| post.id == id) {
                        post.content = updated.content;
                        post.updated_at = updated.updated_at;
                    }
                }
                Err(err) => {
                    warn!("feed: failed to update post {id}: {err}");
                    self.set_notice(NoticeKind::Error, format!("Failed to update post: {err}"));
                }
            },
        }
        pump
    }
}

impl Drop for FeedController {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Appends the posts of `incoming` whose ids are not already present,
/// keeping their relative order. Returns how many were added.
pub fn merge_page(posts: &mut Vec<Post>, incoming: Vec<Post>) -> usize {
    let mut seen: HashSet<PostId> = posts.iter().map(|post| post.id).collect();
    let before = posts.len();
    posts.extend(incoming.into_iter().filter(|post| seen.insert(post.id)));
    posts.len() - before
}
