use std::{
  collections::{BTreeMap, BTreeSet},
  fmt,
  ops::{Add, AddAssign, Sub},
  str::FromStr,
};

use jitsi_xmpp_parsers::{
  jingle::{Content, Description},
  jingle_ssma,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use jitsi_xmpp_parsers::jingle_ssma::Semantics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MediaType {
  Audio,
  Video,
}

impl fmt::Display for MediaType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      MediaType::Audio => "audio",
      MediaType::Video => "video",
    })
  }
}

impl FromStr for MediaType {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> anyhow::Result<MediaType> {
    match s {
      "audio" => Ok(MediaType::Audio),
      "video" => Ok(MediaType::Video),
      other => Err(anyhow::anyhow!("unknown media type: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VideoType {
  Camera,
  Desktop,
}

impl fmt::Display for VideoType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      VideoType::Camera => "camera",
      VideoType::Desktop => "desktop",
    })
  }
}

impl FromStr for VideoType {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> anyhow::Result<VideoType> {
    match s {
      "camera" => Ok(VideoType::Camera),
      "desktop" => Ok(VideoType::Desktop),
      other => Err(anyhow::anyhow!("unknown video type: {}", other)),
    }
  }
}

/// One media source. Parameters other than msid are dropped on the way in;
/// peers regenerate what they need from the compact form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Source {
  pub ssrc: u32,
  pub media_type: MediaType,
  pub name: Option<String>,
  pub msid: Option<String>,
  pub video_type: Option<VideoType>,
  pub injected: bool,
}

impl Source {
  pub fn new(ssrc: u32, media_type: MediaType) -> Source {
    Source {
      ssrc,
      media_type,
      name: None,
      msid: None,
      video_type: None,
      injected: false,
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Source {
    self.name = Some(name.into());
    self
  }

  pub fn with_msid(mut self, msid: impl Into<String>) -> Source {
    self.msid = Some(msid.into());
    self
  }

  pub fn with_video_type(mut self, video_type: VideoType) -> Source {
    self.video_type = Some(video_type);
    self
  }

  fn from_signaled(signaled: &jingle_ssma::Source, media_type: MediaType) -> Source {
    Source {
      ssrc: signaled.id,
      media_type,
      name: signaled.name.clone(),
      msid: signaled.msid().map(ToOwned::to_owned),
      video_type: signaled
        .video_type
        .as_deref()
        .and_then(|video_type| video_type.parse().ok()),
      injected: signaled.injected,
    }
  }

  fn to_signaled(&self, owner: Option<&str>) -> jingle_ssma::Source {
    let mut signaled = jingle_ssma::Source::new(self.ssrc);
    signaled.name = self.name.clone();
    signaled.video_type = self.video_type.map(|video_type| video_type.to_string());
    signaled.injected = self.injected;
    if let Some(msid) = &self.msid {
      signaled.parameters.push(jingle_ssma::Parameter {
        name: "msid".to_owned(),
        value: Some(msid.clone()),
      });
    }
    if let Some(owner) = owner {
      signaled.info = Some(jingle_ssma::SsrcInfo {
        owner: owner.to_owned(),
      });
    }
    signaled
  }
}

/// A group of sources with RFC 5888 semantics. Holds at least two ssrcs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SsrcGroup {
  pub semantics: Semantics,
  pub media_type: MediaType,
  pub ssrcs: Vec<u32>,
}

impl SsrcGroup {
  pub fn new(semantics: Semantics, media_type: MediaType, ssrcs: Vec<u32>) -> SsrcGroup {
    SsrcGroup {
      semantics,
      media_type,
      ssrcs,
    }
  }

  fn to_signaled(&self) -> jingle_ssma::Group {
    jingle_ssma::Group::new(self.semantics, self.ssrcs.iter().copied())
  }
}

/// The set of sources and groups one endpoint advertises.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndpointSourceSet {
  pub sources: BTreeSet<Source>,
  pub ssrc_groups: BTreeSet<SsrcGroup>,
}

impl EndpointSourceSet {
  pub fn is_empty(&self) -> bool {
    self.sources.is_empty() && self.ssrc_groups.is_empty()
  }

  pub fn ssrcs(&self) -> BTreeSet<u32> {
    self.sources.iter().map(|source| source.ssrc).collect()
  }

  pub fn has_video(&self) -> bool {
    self
      .sources
      .iter()
      .any(|source| source.media_type == MediaType::Video)
  }

  /// The union of `self` and `other`.
  pub fn union(&self, other: &EndpointSourceSet) -> EndpointSourceSet {
    EndpointSourceSet {
      sources: self.sources.union(&other.sources).cloned().collect(),
      ssrc_groups: self.ssrc_groups.union(&other.ssrc_groups).cloned().collect(),
    }
  }

  /// The sources and groups of `self` not present in `other`.
  pub fn difference(&self, other: &EndpointSourceSet) -> EndpointSourceSet {
    EndpointSourceSet {
      sources: self.sources.difference(&other.sources).cloned().collect(),
      ssrc_groups: self
        .ssrc_groups
        .difference(&other.ssrc_groups)
        .cloned()
        .collect(),
    }
  }

  pub fn filter_by_media_type(&self, keep: &BTreeSet<MediaType>) -> EndpointSourceSet {
    EndpointSourceSet {
      sources: self
        .sources
        .iter()
        .filter(|source| keep.contains(&source.media_type))
        .cloned()
        .collect(),
      ssrc_groups: self
        .ssrc_groups
        .iter()
        .filter(|group| keep.contains(&group.media_type))
        .cloned()
        .collect(),
    }
  }

  /// Keeps only the desktop video sources if the endpoint shares its screen,
  /// for peers that can receive a single video stream per endpoint. Groups
  /// are re-filtered against the retained ssrc set so the result stays
  /// valid.
  pub fn filter_multi_stream(&self) -> EndpointSourceSet {
    let has_desktop = self
      .sources
      .iter()
      .any(|source| source.video_type == Some(VideoType::Desktop));
    if !has_desktop {
      return self.clone();
    }
    let sources: BTreeSet<Source> = self
      .sources
      .iter()
      .filter(|source| {
        source.media_type != MediaType::Video || source.video_type == Some(VideoType::Desktop)
      })
      .cloned()
      .collect();
    let retained: BTreeSet<u32> = sources.iter().map(|source| source.ssrc).collect();
    EndpointSourceSet {
      ssrc_groups: self
        .ssrc_groups
        .iter()
        .filter(|group| group.ssrcs.iter().all(|ssrc| retained.contains(ssrc)))
        .cloned()
        .collect(),
      sources,
    }
  }

  /// Collapses each SIM group to its primary ssrc, dropping the secondary
  /// simulcast layers and their RTX (FID) companions.
  pub fn strip_simulcast(&self) -> EndpointSourceSet {
    let mut dropped: BTreeSet<u32> = BTreeSet::new();
    for group in &self.ssrc_groups {
      if group.semantics == Semantics::Sim {
        dropped.extend(group.ssrcs.iter().skip(1).copied());
      }
    }
    let mut groups: BTreeSet<SsrcGroup> = BTreeSet::new();
    for group in &self.ssrc_groups {
      if group.semantics == Semantics::Sim {
        continue;
      }
      if group.ssrcs.iter().any(|ssrc| dropped.contains(ssrc)) {
        // An RTX group for a dropped simulcast layer: its companions go too.
        dropped.extend(group.ssrcs.iter().copied());
      }
      else {
        groups.insert(group.clone());
      }
    }
    // Primary RTX ssrcs stay only while their group survived.
    let grouped_rtx: BTreeSet<u32> = groups
      .iter()
      .flat_map(|group| group.ssrcs.iter().copied())
      .collect();
    let sim_primaries: BTreeSet<u32> = self
      .ssrc_groups
      .iter()
      .filter(|group| group.semantics == Semantics::Sim)
      .filter_map(|group| group.ssrcs.first().copied())
      .collect();
    let sim_members: BTreeSet<u32> = self
      .ssrc_groups
      .iter()
      .filter(|group| group.semantics == Semantics::Sim)
      .flat_map(|group| group.ssrcs.iter().copied())
      .collect();
    EndpointSourceSet {
      sources: self
        .sources
        .iter()
        .filter(|source| {
          if dropped.contains(&source.ssrc) {
            return false;
          }
          if sim_members.contains(&source.ssrc) {
            return sim_primaries.contains(&source.ssrc);
          }
          // Sources only reachable through a dropped FID group are gone.
          !self
            .ssrc_groups
            .iter()
            .any(|group| group.semantics == Semantics::Fid && group.ssrcs.contains(&source.ssrc))
            || grouped_rtx.contains(&source.ssrc)
        })
        .cloned()
        .collect(),
      ssrc_groups: groups,
    }
  }

  /// Extracts the source set carried in the RTP descriptions of Jingle
  /// contents. The media type comes from the enclosing content.
  pub fn from_contents(contents: &[Content]) -> EndpointSourceSet {
    let mut set = EndpointSourceSet::default();
    for content in contents {
      let media_type = match content.name.0.parse() {
        Ok(media_type) => media_type,
        Err(_) => continue,
      };
      if let Some(Description::Rtp(description)) = &content.description {
        for signaled in &description.ssrcs {
          set.sources.insert(Source::from_signaled(signaled, media_type));
        }
        for group in &description.ssrc_groups {
          set.ssrc_groups.insert(SsrcGroup {
            semantics: group.semantics,
            media_type,
            ssrcs: group.ssrcs(),
          });
        }
      }
    }
    set
  }
}

impl Add for EndpointSourceSet {
  type Output = EndpointSourceSet;

  fn add(self, other: EndpointSourceSet) -> EndpointSourceSet {
    self.union(&other)
  }
}

impl Sub for EndpointSourceSet {
  type Output = EndpointSourceSet;

  fn sub(self, other: EndpointSourceSet) -> EndpointSourceSet {
    self.difference(&other)
  }
}

/// The sources of a whole conference, keyed by endpoint id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConferenceSourceMap(pub BTreeMap<String, EndpointSourceSet>);

impl ConferenceSourceMap {
  pub fn new() -> ConferenceSourceMap {
    Default::default()
  }

  pub fn of_endpoint(endpoint_id: impl Into<String>, set: EndpointSourceSet) -> ConferenceSourceMap {
    let mut map = ConferenceSourceMap::new();
    map.0.insert(endpoint_id.into(), set);
    map
  }

  pub fn is_empty(&self) -> bool {
    self.0.values().all(EndpointSourceSet::is_empty)
  }

  pub fn get(&self, endpoint_id: &str) -> Option<&EndpointSourceSet> {
    self.0.get(endpoint_id)
  }

  pub fn remove(&mut self, endpoint_id: &str) -> Option<EndpointSourceSet> {
    self.0.remove(endpoint_id)
  }

  pub fn ssrcs(&self) -> BTreeSet<u32> {
    self.0.values().flat_map(EndpointSourceSet::ssrcs).collect()
  }

  pub fn union(&self, other: &ConferenceSourceMap) -> ConferenceSourceMap {
    let mut result = self.clone();
    result.add_all(other);
    result
  }

  pub fn add_all(&mut self, other: &ConferenceSourceMap) {
    for (endpoint_id, set) in &other.0 {
      let entry = self.0.entry(endpoint_id.clone()).or_default();
      *entry = entry.union(set);
    }
  }

  pub fn remove_all(&mut self, other: &ConferenceSourceMap) {
    for (endpoint_id, set) in &other.0 {
      if let Some(entry) = self.0.get_mut(endpoint_id) {
        *entry = entry.difference(set);
        if entry.is_empty() {
          self.0.remove(endpoint_id);
        }
      }
    }
  }

  pub fn difference(&self, other: &ConferenceSourceMap) -> ConferenceSourceMap {
    let mut result = ConferenceSourceMap::new();
    for (endpoint_id, set) in &self.0 {
      let difference = match other.0.get(endpoint_id) {
        Some(other_set) => set.difference(other_set),
        None => set.clone(),
      };
      if !difference.is_empty() {
        result.0.insert(endpoint_id.clone(), difference);
      }
    }
    result
  }

  pub fn map_sets(&self, f: impl Fn(&EndpointSourceSet) -> EndpointSourceSet) -> ConferenceSourceMap {
    let mut result = ConferenceSourceMap::new();
    for (endpoint_id, set) in &self.0 {
      let mapped = f(set);
      if !mapped.is_empty() {
        result.0.insert(endpoint_id.clone(), mapped);
      }
    }
    result
  }

  /// Renders this map as Jingle contents (one per media type), stamping each
  /// source with the owner's occupant jid in the given room.
  pub fn to_contents(&self, room: Option<&xmpp_parsers::BareJid>) -> Vec<Content> {
    use jitsi_xmpp_parsers::{
      jingle::{Content as JingleContent, Description as JingleDescription},
      jingle_rtp::Description as RtpDescription,
    };
    use xmpp_parsers::jingle::{ContentId, Creator, Senders};

    let mut contents = Vec::new();
    for media_type in [MediaType::Audio, MediaType::Video] {
      let mut description = RtpDescription::new(media_type.to_string());
      for (endpoint_id, set) in &self.0 {
        let owner = room.map(|room| format!("{}/{}", room, endpoint_id));
        for source in &set.sources {
          if source.media_type == media_type {
            description.ssrcs.push(source.to_signaled(owner.as_deref()));
          }
        }
        for group in &set.ssrc_groups {
          if group.media_type == media_type {
            description.ssrc_groups.push(group.to_signaled());
          }
        }
      }
      if !description.ssrcs.is_empty() || !description.ssrc_groups.is_empty() {
        contents.push(
          JingleContent::new(Creator::Initiator, ContentId(media_type.to_string()))
            .with_senders(Senders::Both)
            .with_description(JingleDescription::Rtp(description)),
        );
      }
    }
    contents
  }

  /// Extracts a single-endpoint map from Jingle contents.
  pub fn from_contents(endpoint_id: &str, contents: &[Content]) -> ConferenceSourceMap {
    let set = EndpointSourceSet::from_contents(contents);
    if set.is_empty() {
      ConferenceSourceMap::new()
    }
    else {
      ConferenceSourceMap::of_endpoint(endpoint_id, set)
    }
  }
}

impl Add for ConferenceSourceMap {
  type Output = ConferenceSourceMap;

  fn add(self, other: ConferenceSourceMap) -> ConferenceSourceMap {
    self.union(&other)
  }
}

impl AddAssign for ConferenceSourceMap {
  fn add_assign(&mut self, other: ConferenceSourceMap) {
    self.add_all(&other);
  }
}

impl Sub for ConferenceSourceMap {
  type Output = ConferenceSourceMap;

  fn sub(self, other: ConferenceSourceMap) -> ConferenceSourceMap {
    self.difference(&other)
  }
}

/// Compact JSON encoding of a source: `{"s":<ssrc>,"n":"<name>","m":"<msid>"}`,
/// with `n` and `m` omitted when absent. The media type comes from the
/// enclosing object key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactSource {
  pub s: u32,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub n: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub m: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactSsrcGroup {
  pub sem: String,
  pub ssrcs: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompactEndpointSources {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub audio: Vec<CompactSource>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub video: Vec<CompactSource>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub groups: Vec<CompactSsrcGroup>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompactSources {
  pub sources: BTreeMap<String, CompactEndpointSources>,
}

impl From<&ConferenceSourceMap> for CompactSources {
  fn from(map: &ConferenceSourceMap) -> CompactSources {
    let mut compact = CompactSources::default();
    for (endpoint_id, set) in &map.0 {
      let mut endpoint = CompactEndpointSources::default();
      for source in &set.sources {
        let compact_source = CompactSource {
          s: source.ssrc,
          n: source.name.clone(),
          m: source.msid.clone(),
        };
        match source.media_type {
          MediaType::Audio => endpoint.audio.push(compact_source),
          MediaType::Video => endpoint.video.push(compact_source),
        }
      }
      for group in &set.ssrc_groups {
        endpoint.groups.push(CompactSsrcGroup {
          sem: group.semantics.to_string(),
          ssrcs: group.ssrcs.clone(),
        });
      }
      compact.sources.insert(endpoint_id.clone(), endpoint);
    }
    compact
  }
}

impl From<&CompactSources> for ConferenceSourceMap {
  fn from(compact: &CompactSources) -> ConferenceSourceMap {
    let mut map = ConferenceSourceMap::new();
    for (endpoint_id, endpoint) in &compact.sources {
      let mut set = EndpointSourceSet::default();
      for (compact_sources, media_type) in [
        (&endpoint.audio, MediaType::Audio),
        (&endpoint.video, MediaType::Video),
      ] {
        for compact_source in compact_sources {
          set.sources.insert(Source {
            ssrc: compact_source.s,
            media_type,
            name: compact_source.n.clone(),
            msid: compact_source.m.clone(),
            video_type: None,
            injected: false,
          });
        }
      }
      let video_ssrcs: BTreeSet<u32> = set
        .sources
        .iter()
        .filter(|source| source.media_type == MediaType::Video)
        .map(|source| source.ssrc)
        .collect();
      for group in &endpoint.groups {
        if let Ok(semantics) = group.sem.parse::<Semantics>() {
          let media_type = if group.ssrcs.iter().all(|ssrc| video_ssrcs.contains(ssrc)) {
            MediaType::Video
          }
          else {
            MediaType::Audio
          };
          set.ssrc_groups.insert(SsrcGroup {
            semantics,
            media_type,
            ssrcs: group.ssrcs.clone(),
          });
        }
      }
      map.0.insert(endpoint_id.clone(), set);
    }
    map
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
  #[error("illegal ssrc value: {0}")]
  IllegalSsrc(i64),
  #[error("duplicate ssrc: {0}")]
  DuplicateSsrc(u32),
  #[error("ssrc-group references a ssrc not advertised by the endpoint")]
  GroupReferencesMissingSsrc,
  #[error("grouped ssrc without msid")]
  GroupedSsrcMissingMsid,
  #[error("sources in a group have differing msid")]
  GroupMsidMismatch,
  #[error("duplicate msid: {0}")]
  DuplicateMsid(String),
}

/// Validates `candidate` against the sources already in the conference and
/// returns the accepted subset. Sources beyond the per-endpoint limit are
/// truncated rather than rejected; groups that only reference truncated
/// sources are silently dropped with them.
pub fn try_add(
  existing: &ConferenceSourceMap,
  endpoint_id: &str,
  candidate: &EndpointSourceSet,
  max_ssrcs_per_endpoint: usize,
) -> Result<EndpointSourceSet, ValidationError> {
  let endpoint_existing = existing.get(endpoint_id).cloned().unwrap_or_default();
  let conference_ssrcs = existing.ssrcs();

  let mut accepted = EndpointSourceSet::default();
  let mut truncated: BTreeSet<u32> = BTreeSet::new();
  let mut endpoint_count = endpoint_existing.sources.len();

  for source in &candidate.sources {
    if source.ssrc == 0 {
      return Err(ValidationError::IllegalSsrc(source.ssrc as i64));
    }
    if conference_ssrcs.contains(&source.ssrc)
      || accepted.ssrcs().contains(&source.ssrc)
    {
      return Err(ValidationError::DuplicateSsrc(source.ssrc));
    }
    if endpoint_count >= max_ssrcs_per_endpoint {
      warn!(
        endpoint_id,
        ssrc = source.ssrc,
        "dropping source beyond the per-endpoint limit"
      );
      truncated.insert(source.ssrc);
      continue;
    }
    endpoint_count += 1;
    accepted.sources.insert(source.clone());
  }

  let visible = endpoint_existing.union(&accepted);

  for group in &candidate.ssrc_groups {
    if group.ssrcs.len() < 2 {
      warn!(endpoint_id, "dropping degenerate ssrc-group");
      continue;
    }
    if visible.ssrc_groups.contains(group) || accepted.ssrc_groups.contains(group) {
      warn!(endpoint_id, "dropping duplicate ssrc-group");
      continue;
    }
    if group.ssrcs.iter().any(|ssrc| truncated.contains(ssrc)) {
      warn!(endpoint_id, "dropping ssrc-group referencing truncated sources");
      continue;
    }
    let mut group_msid: Option<&str> = None;
    for ssrc in &group.ssrcs {
      let source = visible
        .sources
        .iter()
        .find(|source| source.ssrc == *ssrc && source.media_type == group.media_type)
        .ok_or(ValidationError::GroupReferencesMissingSsrc)?;
      let msid = source
        .msid
        .as_deref()
        .filter(|msid| !msid.is_empty())
        .ok_or(ValidationError::GroupedSsrcMissingMsid)?;
      match group_msid {
        None => group_msid = Some(msid),
        Some(expected) if expected != msid => return Err(ValidationError::GroupMsidMismatch),
        Some(_) => {},
      }
    }
    accepted.ssrc_groups.insert(group.clone());
  }

  // Distinct ungrouped sources of the same media must not share a msid.
  let all_groups: BTreeSet<&SsrcGroup> = visible
    .ssrc_groups
    .iter()
    .chain(accepted.ssrc_groups.iter())
    .collect();
  let grouped: BTreeSet<u32> = all_groups
    .iter()
    .flat_map(|group| group.ssrcs.iter().copied())
    .collect();
  let mut seen_msids: BTreeMap<(MediaType, &str), u32> = BTreeMap::new();
  for source in visible.sources.iter() {
    if grouped.contains(&source.ssrc) {
      continue;
    }
    if let Some(msid) = source.msid.as_deref() {
      if let Some(previous) = seen_msids.insert((source.media_type, msid), source.ssrc) {
        if previous != source.ssrc {
          return Err(ValidationError::DuplicateMsid(msid.to_owned()));
        }
      }
    }
  }

  Ok(accepted)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn camera(ssrc: u32) -> Source {
    Source::new(ssrc, MediaType::Video)
      .with_msid("stream track-v0")
      .with_video_type(VideoType::Camera)
  }

  fn desktop(ssrc: u32) -> Source {
    Source::new(ssrc, MediaType::Video)
      .with_msid("stream track-d0")
      .with_video_type(VideoType::Desktop)
  }

  fn audio(ssrc: u32) -> Source {
    Source::new(ssrc, MediaType::Audio).with_msid("stream track-a0")
  }

  fn set(sources: Vec<Source>, groups: Vec<SsrcGroup>) -> EndpointSourceSet {
    EndpointSourceSet {
      sources: sources.into_iter().collect(),
      ssrc_groups: groups.into_iter().collect(),
    }
  }

  #[test]
  fn union_and_difference() {
    let a = set(vec![audio(1), camera(2)], vec![]);
    let b = set(vec![camera(2), desktop(3)], vec![]);
    let union = a.clone().union(&b);
    assert_eq!(union.ssrcs(), [1, 2, 3].into_iter().collect());
    let difference = union.difference(&b);
    assert_eq!(difference.ssrcs(), [1].into_iter().collect());
  }

  #[test]
  fn multi_stream_filter_keeps_desktop_only() {
    let sim = SsrcGroup::new(Semantics::Sim, MediaType::Video, vec![2, 4, 5]);
    let endpoint = set(
      vec![camera(2), camera(4), camera(5), desktop(3), audio(1)],
      vec![sim],
    );
    let filtered = endpoint.filter_multi_stream();
    assert_eq!(filtered.ssrcs(), [1, 3].into_iter().collect());
    assert!(filtered.ssrc_groups.is_empty());
  }

  #[test]
  fn multi_stream_filter_without_desktop_is_identity() {
    let endpoint = set(vec![camera(2), audio(1)], vec![]);
    assert_eq!(endpoint.filter_multi_stream(), endpoint);
  }

  #[test]
  fn strip_simulcast_collapses_to_primary() {
    let sim = SsrcGroup::new(Semantics::Sim, MediaType::Video, vec![10, 20, 30]);
    let fid_primary = SsrcGroup::new(Semantics::Fid, MediaType::Video, vec![10, 11]);
    let fid_secondary = SsrcGroup::new(Semantics::Fid, MediaType::Video, vec![20, 21]);
    let endpoint = set(
      vec![
        camera(10),
        camera(11),
        camera(20),
        camera(21),
        camera(30),
        audio(1),
      ],
      vec![sim, fid_primary.clone(), fid_secondary],
    );
    let stripped = endpoint.strip_simulcast();
    assert_eq!(stripped.ssrcs(), [1, 10, 11].into_iter().collect());
    assert_eq!(
      stripped.ssrc_groups,
      [fid_primary].into_iter().collect()
    );
  }

  #[test]
  fn validator_rejects_duplicate_ssrc() {
    let existing = ConferenceSourceMap::of_endpoint("peer", set(vec![audio(1)], vec![]));
    let candidate = set(vec![audio(1)], vec![]);
    assert_eq!(
      try_add(&existing, "other", &candidate, 20),
      Err(ValidationError::DuplicateSsrc(1))
    );
  }

  #[test]
  fn validator_rejects_zero_ssrc() {
    let candidate = set(vec![audio(0)], vec![]);
    assert!(matches!(
      try_add(&ConferenceSourceMap::new(), "e", &candidate, 20),
      Err(ValidationError::IllegalSsrc(_))
    ));
  }

  #[test]
  fn validator_truncates_beyond_limit() {
    let candidate = set(vec![audio(1), audio(2).with_msid("m2"), audio(3).with_msid("m3")], vec![]);
    let accepted = try_add(&ConferenceSourceMap::new(), "e", &candidate, 2).unwrap();
    assert_eq!(accepted.sources.len(), 2);
  }

  #[test]
  fn validator_rejects_group_with_missing_ssrc() {
    let candidate = set(
      vec![camera(10)],
      vec![SsrcGroup::new(Semantics::Fid, MediaType::Video, vec![10, 99])],
    );
    assert_eq!(
      try_add(&ConferenceSourceMap::new(), "e", &candidate, 20),
      Err(ValidationError::GroupReferencesMissingSsrc)
    );
  }

  #[test]
  fn validator_rejects_grouped_source_without_msid() {
    let bare = Source::new(10, MediaType::Video);
    let candidate = set(
      vec![bare, camera(11)],
      vec![SsrcGroup::new(Semantics::Fid, MediaType::Video, vec![10, 11])],
    );
    assert_eq!(
      try_add(&ConferenceSourceMap::new(), "e", &candidate, 20),
      Err(ValidationError::GroupedSsrcMissingMsid)
    );
  }

  #[test]
  fn validator_rejects_msid_mismatch_within_group() {
    let candidate = set(
      vec![
        Source::new(10, MediaType::Video).with_msid("a"),
        Source::new(11, MediaType::Video).with_msid("b"),
      ],
      vec![SsrcGroup::new(Semantics::Fid, MediaType::Video, vec![10, 11])],
    );
    assert_eq!(
      try_add(&ConferenceSourceMap::new(), "e", &candidate, 20),
      Err(ValidationError::GroupMsidMismatch)
    );
  }

  #[test]
  fn validator_rejects_duplicate_msid_across_ungrouped_sources() {
    let candidate = set(
      vec![
        Source::new(10, MediaType::Video).with_msid("same"),
        Source::new(11, MediaType::Video).with_msid("same"),
      ],
      vec![],
    );
    assert_eq!(
      try_add(&ConferenceSourceMap::new(), "e", &candidate, 20),
      Err(ValidationError::DuplicateMsid("same".to_owned()))
    );
  }

  #[test]
  fn accepted_sources_always_merge_cleanly() {
    let mut conference = ConferenceSourceMap::new();
    let first = set(vec![audio(1), camera(2)], vec![]);
    let accepted = try_add(&conference, "e1", &first, 20).unwrap();
    conference.add_all(&ConferenceSourceMap::of_endpoint("e1", accepted));
    let second = set(vec![audio(3), desktop(4)], vec![]);
    let accepted = try_add(&conference, "e2", &second, 20).unwrap();
    conference.add_all(&ConferenceSourceMap::of_endpoint("e2", accepted));
    assert_eq!(conference.ssrcs(), [1, 2, 3, 4].into_iter().collect());
    // A rejected candidate leaves the conference untouched.
    let before = conference.clone();
    let duplicate = set(vec![audio(3)], vec![]);
    assert!(try_add(&conference, "e3", &duplicate, 20).is_err());
    assert_eq!(conference, before);
  }

  #[test]
  fn compact_source_json_is_stable() {
    let source = CompactSource {
      s: 123,
      n: Some("e-v0".to_owned()),
      m: Some("stream track".to_owned()),
    };
    assert_eq!(
      serde_json::to_string(&source).unwrap(),
      r#"{"s":123,"n":"e-v0","m":"stream track"}"#
    );
    let bare = CompactSource {
      s: 7,
      n: None,
      m: None,
    };
    assert_eq!(serde_json::to_string(&bare).unwrap(), r#"{"s":7}"#);
  }

  #[test]
  fn compact_map_round_trip() {
    let endpoint = set(
      vec![audio(1), camera(2), camera(3)],
      vec![SsrcGroup::new(Semantics::Fid, MediaType::Video, vec![2, 3])],
    );
    let map = ConferenceSourceMap::of_endpoint("e1", endpoint);
    let compact = CompactSources::from(&map);
    let round_tripped = ConferenceSourceMap::from(&compact);
    assert_eq!(round_tripped.ssrcs(), map.ssrcs());
    assert_eq!(
      round_tripped.get("e1").unwrap().ssrc_groups.len(),
      map.get("e1").unwrap().ssrc_groups.len()
    );
  }

  #[test]
  fn contents_round_trip_with_owner() {
    let map = ConferenceSourceMap::of_endpoint("e1", set(vec![audio(1), camera(2)], vec![]));
    let room: xmpp_parsers::BareJid = "r1@conference.example.com".parse().unwrap();
    let contents = map.to_contents(Some(&room));
    assert_eq!(contents.len(), 2);
    let parsed = EndpointSourceSet::from_contents(&contents);
    assert_eq!(parsed.ssrcs(), [1, 2].into_iter().collect());
  }
}
