use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{error::QueueError, sources::Track};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepeatMode {
    #[default]
    Off,
    Track,
    Queue,
}

impl std::str::FromStr for RepeatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" | "none" => Ok(RepeatMode::Off),
            "track" | "song" => Ok(RepeatMode::Track),
            "queue" | "all" => Ok(RepeatMode::Queue),
            other => Err(format!("unknown repeat mode: {other}")),
        }
    }
}

/// Ordered tracks with a cursor, a bounded history and repeat/shuffle policy.
///
/// A fresh list has not started: `current()` is `None` until the first
/// `next()` (or `skip_to`) lands on a track. Running off the end leaves the
/// list exhausted with the cursor on the last track; tracks appended later are
/// picked up by the following `next()` without replaying that last track.
/// Switching to `RepeatMode::Queue` while exhausted makes the next `next()`
/// wrap to the first track. `RepeatMode::Track` does not reopen an exhausted
/// list: the last track was already left behind by the end of the queue or a
/// skip, so `next()` only moves onto appended tracks.
#[derive(Debug)]
pub struct Tracklist {
    tracks: Vec<Arc<Track>>,
    cursor: usize,
    started: bool,
    exhausted: bool,
    history: VecDeque<Arc<Track>>,
    history_cap: usize,
    repeat: RepeatMode,
    shuffle: bool,
    max_size: usize,
    revision: u64,
}

impl Tracklist {
    pub fn new(max_size: usize, history_cap: usize) -> Self {
        Self {
            tracks: Vec::new(),
            cursor: 0,
            started: false,
            exhausted: false,
            history: VecDeque::new(),
            history_cap,
            repeat: RepeatMode::Off,
            shuffle: false,
            max_size,
            revision: 0,
        }
    }

    /// Appends a track and returns its 1-indexed position.
    pub fn add(&mut self, track: Arc<Track>) -> Result<usize, QueueError> {
        if self.tracks.len() >= self.max_size {
            return Err(QueueError::Full(self.max_size));
        }
        info!("➕ Added to queue: {}", track.title());
        self.tracks.push(track);
        Ok(self.tracks.len())
    }

    /// Appends as many tracks as fit, returning how many were added.
    pub fn add_many(&mut self, tracks: impl IntoIterator<Item = Arc<Track>>) -> usize {
        let space = self.max_size.saturating_sub(self.tracks.len());
        let before = self.tracks.len();
        self.tracks.extend(tracks.into_iter().take(space));
        let added = self.tracks.len() - before;
        info!("➕ Added {} tracks to queue", added);
        added
    }

    pub fn current(&self) -> Option<Arc<Track>> {
        if !self.started || self.exhausted {
            return None;
        }
        self.tracks.get(self.cursor).cloned()
    }

    /// Advances according to the repeat mode.
    pub fn next(&mut self) -> Option<Arc<Track>> {
        if self.repeat == RepeatMode::Track {
            if let Some(current) = self.current() {
                debug!("🔂 Repeating: {}", current.title());
                return Some(current);
            }
        }
        self.advance()
    }

    /// Advances ignoring `RepeatMode::Track`. Used when the current track
    /// cannot be played or the user skips it.
    pub fn advance_past_current(&mut self) -> Option<Arc<Track>> {
        self.advance()
    }

    fn advance(&mut self) -> Option<Arc<Track>> {
        if self.tracks.is_empty() {
            return None;
        }
        self.revision += 1;

        if !self.started {
            self.started = true;
            self.cursor = 0;
            return self.tracks.first().cloned();
        }

        if self.exhausted {
            if self.cursor + 1 < self.tracks.len() {
                self.exhausted = false;
                self.cursor += 1;
                return self.tracks.get(self.cursor).cloned();
            }
            if self.repeat == RepeatMode::Queue {
                // the last track went to history when the end was reached
                info!("🔁 Queue wrapped around");
                self.exhausted = false;
                self.cursor = 0;
                return self.tracks.first().cloned();
            }
            return None;
        }

        if let Some(current) = self.tracks.get(self.cursor).cloned() {
            self.push_history(current);
        }

        self.cursor += 1;
        if self.cursor >= self.tracks.len() {
            if self.repeat == RepeatMode::Queue {
                info!("🔁 Queue wrapped around");
                self.cursor = 0;
            } else {
                info!("📭 Reached the end of the queue");
                self.cursor = self.tracks.len() - 1;
                self.exhausted = true;
                return None;
            }
        }
        self.tracks.get(self.cursor).cloned()
    }

    /// Steps back to the most recently played track.
    pub fn previous(&mut self) -> Option<Arc<Track>> {
        self.revision += 1;
        match self.history.pop_back() {
            Some(last) => {
                match self.index_of(last.id()) {
                    Some(index) => self.cursor = index,
                    None => {
                        // removed since it played; put it back where we are
                        let at = if self.tracks.is_empty() { 0 } else { self.cursor };
                        self.tracks.insert(at, last);
                        self.cursor = at;
                    }
                }
                self.started = true;
                self.exhausted = false;
            }
            None => {
                if self.exhausted {
                    self.exhausted = false;
                } else if self.started && self.cursor > 0 {
                    self.cursor -= 1;
                }
            }
        }
        self.current()
    }

    /// Jumps to a 1-indexed position, recording the current track in history.
    pub fn skip_to(&mut self, position: usize) -> Result<Arc<Track>, QueueError> {
        if position == 0 || position > self.tracks.len() {
            return Err(QueueError::NotFound(position));
        }
        if let Some(current) = self.current() {
            self.push_history(current);
        }
        self.cursor = position - 1;
        self.started = true;
        self.exhausted = false;
        self.revision += 1;
        let track = Arc::clone(&self.tracks[self.cursor]);
        info!("⏭️ Jumped to #{}: {}", position, track.title());
        Ok(track)
    }

    /// Removes the track at a 1-indexed position.
    pub fn remove(&mut self, position: usize) -> Result<Arc<Track>, QueueError> {
        if position == 0 || position > self.tracks.len() {
            return Err(QueueError::NotFound(position));
        }
        let index = position - 1;
        let removed = self.tracks.remove(index);

        if index < self.cursor {
            self.cursor -= 1;
        } else if index == self.cursor {
            self.revision += 1;
            // the track after it slides into the cursor slot; nothing has played it yet
            if self.started && !self.exhausted && self.cursor >= self.tracks.len() {
                self.exhausted = true;
            }
        }
        self.clamp_cursor();
        debug!("❌ Removed #{}: {}", position, removed.title());
        Ok(removed)
    }

    /// Current track moves to position 1; the rest is permuted uniformly.
    pub fn shuffle(&mut self) {
        let current = self.current();
        match current {
            Some(current) => {
                self.tracks.remove(self.cursor);
                self.tracks.shuffle(&mut rand::thread_rng());
                self.tracks.insert(0, current);
            }
            None => {
                self.tracks.shuffle(&mut rand::thread_rng());
                self.started = false;
                self.exhausted = false;
            }
        }
        self.cursor = 0;
        info!("🔀 Queue shuffled");
    }

    pub fn upcoming(&self, limit: usize) -> Vec<Arc<Track>> {
        let start = if self.started { self.cursor + 1 } else { 0 };
        self.tracks.iter().skip(start).take(limit).cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// `(current, total)`, current 1-indexed and 0 when nothing is current.
    pub fn position(&self) -> (usize, usize) {
        let current = if self.current().is_some() { self.cursor + 1 } else { 0 };
        (current, self.tracks.len())
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat
    }

    pub fn set_repeat_mode(&mut self, mode: RepeatMode) {
        self.repeat = mode;
        match mode {
            RepeatMode::Off => info!("➡️ Repeat off"),
            RepeatMode::Track => info!("🔂 Repeat track"),
            RepeatMode::Queue => info!("🔁 Repeat queue"),
        }
    }

    pub fn is_shuffle_enabled(&self) -> bool {
        self.shuffle
    }

    pub fn set_shuffle(&mut self, enabled: bool) {
        self.shuffle = enabled;
        if enabled {
            self.shuffle();
        }
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.history.clear();
        self.cursor = 0;
        self.started = false;
        self.exhausted = false;
        self.revision += 1;
        info!("🗑️ Queue cleared");
    }

    pub fn all(&self) -> Vec<Arc<Track>> {
        self.tracks.clone()
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<Arc<Track>> {
        self.history.iter().cloned().collect()
    }

    /// Remaining play time: the current track plus everything after it.
    pub fn total_duration(&self) -> Duration {
        self.current()
            .into_iter()
            .chain(self.upcoming(usize::MAX))
            .filter_map(|t| t.duration())
            .sum()
    }

    /// Bumped whenever the current track is moved by something other than `add`.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn page(&self, page: usize, per_page: usize) -> QueuePage {
        let per_page = per_page.max(1);
        let page = page.max(1);
        let start = (page - 1) * per_page;
        let total_items = self.tracks.len();
        let total_pages = total_items.div_ceil(per_page).max(1);

        QueuePage {
            items: self
                .tracks
                .iter()
                .enumerate()
                .skip(start)
                .take(per_page)
                .map(|(index, track)| (index + 1, Arc::clone(track)))
                .collect(),
            current: self.position().0,
            current_page: page,
            total_pages,
            total_items,
        }
    }

    fn index_of(&self, id: Uuid) -> Option<usize> {
        self.tracks.iter().position(|t| t.id() == id)
    }

    fn push_history(&mut self, track: Arc<Track>) {
        if self.history_cap == 0 {
            return;
        }
        while self.history.len() >= self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(track);
    }

    fn clamp_cursor(&mut self) {
        if self.tracks.is_empty() {
            self.cursor = 0;
            self.started = false;
            self.exhausted = false;
        } else if self.cursor >= self.tracks.len() {
            self.cursor = self.tracks.len() - 1;
        }
    }
}

/// One page of a queue listing; positions are 1-indexed.
#[derive(Debug, Clone)]
pub struct QueuePage {
    pub items: Vec<(usize, Arc<Track>)>,
    pub current: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

/// A [`Tracklist`] shared between the orchestrator and command handlers.
#[derive(Debug)]
pub struct SessionQueue {
    inner: RwLock<Tracklist>,
    changed: Notify,
}

impl SessionQueue {
    pub fn new(max_size: usize, history_cap: usize) -> Self {
        Self {
            inner: RwLock::new(Tracklist::new(max_size, history_cap)),
            changed: Notify::new(),
        }
    }

    pub fn add(&self, track: Arc<Track>) -> Result<usize, QueueError> {
        let position = self.inner.write().add(track)?;
        self.changed.notify_one();
        Ok(position)
    }

    pub fn add_many(&self, tracks: impl IntoIterator<Item = Arc<Track>>) -> usize {
        let added = self.inner.write().add_many(tracks);
        if added > 0 {
            self.changed.notify_one();
        }
        added
    }

    /// Resolves after the next `add`, or immediately if one happened since the
    /// last wait.
    pub async fn wait_for_tracks(&self) {
        self.changed.notified().await;
    }

    pub fn current(&self) -> Option<Arc<Track>> {
        self.inner.read().current()
    }

    pub fn next(&self) -> Option<Arc<Track>> {
        self.inner.write().next()
    }

    pub fn advance_past_current(&self) -> Option<Arc<Track>> {
        self.inner.write().advance_past_current()
    }

    pub fn previous(&self) -> Option<Arc<Track>> {
        self.inner.write().previous()
    }

    pub fn skip_to(&self, position: usize) -> Result<Arc<Track>, QueueError> {
        self.inner.write().skip_to(position)
    }

    pub fn remove(&self, position: usize) -> Result<Arc<Track>, QueueError> {
        self.inner.write().remove(position)
    }

    pub fn shuffle(&self) {
        self.inner.write().shuffle();
    }

    pub fn upcoming(&self, limit: usize) -> Vec<Arc<Track>> {
        self.inner.read().upcoming(limit)
    }

    pub fn size(&self) -> usize {
        self.inner.read().size()
    }

    pub fn position(&self) -> (usize, usize) {
        self.inner.read().position()
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.inner.read().repeat_mode()
    }

    pub fn set_repeat_mode(&self, mode: RepeatMode) {
        self.inner.write().set_repeat_mode(mode);
    }

    pub fn is_shuffle_enabled(&self) -> bool {
        self.inner.read().is_shuffle_enabled()
    }

    pub fn set_shuffle(&self, enabled: bool) {
        self.inner.write().set_shuffle(enabled);
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn all(&self) -> Vec<Arc<Track>> {
        self.inner.read().all()
    }

    pub fn history(&self) -> Vec<Arc<Track>> {
        self.inner.read().history()
    }

    pub fn total_duration(&self) -> Duration {
        self.inner.read().total_duration()
    }

    pub fn revision(&self) -> u64 {
        self.inner.read().revision()
    }

    pub fn page(&self, page: usize, per_page: usize) -> QueuePage {
        self.inner.read().page(page, per_page)
    }

    /// Current track and revision read under one lock.
    pub fn current_with_revision(&self) -> (Option<Arc<Track>>, u64) {
        let list = self.inner.read();
        (list.current(), list.revision())
    }
}
