use std::collections::{BTreeSet, VecDeque};

use crate::source::{ConferenceSourceMap, MediaType};

/// What a peer is able to receive; sources are filtered through this before
/// being signaled to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFilter {
  pub audio: bool,
  pub video: bool,
  pub receive_simulcast: bool,
  pub receive_multiple_streams: bool,
}

impl Default for SourceFilter {
  fn default() -> SourceFilter {
    SourceFilter {
      audio: true,
      video: true,
      receive_simulcast: true,
      receive_multiple_streams: true,
    }
  }
}

impl SourceFilter {
  pub fn apply(&self, map: &ConferenceSourceMap) -> ConferenceSourceMap {
    let mut keep = BTreeSet::new();
    if self.audio {
      keep.insert(MediaType::Audio);
    }
    if self.video {
      keep.insert(MediaType::Video);
    }
    map.map_sets(|set| {
      let mut set = set.filter_by_media_type(&keep);
      if !self.receive_simulcast {
        set = set.strip_simulcast();
      }
      if !self.receive_multiple_streams {
        set = set.filter_multi_stream();
      }
      set
    })
  }
}

/// A source-add or source-remove to signal to one peer.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingOp {
  Add(ConferenceSourceMap),
  Remove(ConferenceSourceMap),
}

impl SignalingOp {
  pub fn sources(&self) -> &ConferenceSourceMap {
    match self {
      SignalingOp::Add(sources) => sources,
      SignalingOp::Remove(sources) => sources,
    }
  }
}

/// Tracks, for one peer, the difference between the sources it has been told
/// about and the current state of the conference.
#[derive(Debug, Clone, Default)]
pub struct SourceSignaling {
  filter: SourceFilter,
  signaled: ConferenceSourceMap,
  updated: ConferenceSourceMap,
}

impl SourceSignaling {
  pub fn new(filter: SourceFilter) -> SourceSignaling {
    SourceSignaling {
      filter,
      signaled: ConferenceSourceMap::new(),
      updated: ConferenceSourceMap::new(),
    }
  }

  pub fn add_sources(&mut self, sources: &ConferenceSourceMap) {
    self.updated.add_all(sources);
  }

  pub fn remove_sources(&mut self, sources: &ConferenceSourceMap) {
    self.updated.remove_all(sources);
  }

  /// Forgets everything previously signaled, for a full resend after a
  /// transport replacement. The next flush emits the whole current set.
  pub fn reset(&mut self, current: ConferenceSourceMap) {
    self.signaled = ConferenceSourceMap::new();
    self.updated = current;
  }

  /// The filtered set as the peer currently knows it.
  pub fn signaled(&self) -> ConferenceSourceMap {
    self.filter.apply(&self.signaled)
  }

  /// Records that the peer was just told the whole of `current` out of
  /// band (in a session-initiate or transport-replace); the next flush
  /// diffs against it.
  pub fn mark_signaled(&mut self, current: ConferenceSourceMap) {
    self.signaled = current.clone();
    self.updated = current;
  }

  /// Commits pending changes, returning the operations to send. Adds come
  /// before removes.
  pub fn flush(&mut self) -> Vec<SignalingOp> {
    let filtered_updated = self.filter.apply(&self.updated);
    let filtered_signaled = self.filter.apply(&self.signaled);
    let to_add = filtered_updated.difference(&filtered_signaled);
    let to_remove = filtered_signaled.difference(&filtered_updated);
    self.signaled = self.updated.clone();
    let mut ops = Vec::new();
    if !to_add.is_empty() {
      ops.push(SignalingOp::Add(to_add));
    }
    if !to_remove.is_empty() {
      ops.push(SignalingOp::Remove(to_remove));
    }
    ops
  }
}

/// Queue of pending signaling operations for a peer whose session is not
/// ready yet. Consecutive operations of the same kind fold into one.
#[derive(Debug, Clone, Default)]
pub struct SourceAddRemoveQueue {
  queue: VecDeque<SignalingOp>,
}

impl SourceAddRemoveQueue {
  pub fn new() -> SourceAddRemoveQueue {
    Default::default()
  }

  pub fn is_empty(&self) -> bool {
    self.queue.is_empty()
  }

  pub fn push_add(&mut self, sources: ConferenceSourceMap) {
    if let Some(SignalingOp::Add(pending)) = self.queue.back_mut() {
      pending.add_all(&sources);
    }
    else {
      self.queue.push_back(SignalingOp::Add(sources));
    }
  }

  pub fn push_remove(&mut self, sources: ConferenceSourceMap) {
    if let Some(SignalingOp::Remove(pending)) = self.queue.back_mut() {
      pending.add_all(&sources);
    }
    else {
      self.queue.push_back(SignalingOp::Remove(sources));
    }
  }

  pub fn drain(&mut self) -> Vec<SignalingOp> {
    self.queue.drain(..).collect()
  }
}
