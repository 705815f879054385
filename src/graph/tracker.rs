use std::collections::{BTreeSet, HashMap, VecDeque};

use nohash_hasher::BuildNoHashHasher;
use tracing::{debug, warn};

use crate::graph::storage::{
  ClassId, ClassTable, GraphStats, GraphStorage, ObjectId, ObjectTable, ReferenceId, StringId,
};

/// The static-class wrapper emitted for class objects.
const JAVA_CLASS_TEMPLATE: &str = "java.lang.Class<";

/// Field holding the superclass pointer on static-class objects.
const SUPERCLASS_FIELD: &str = "java.lang.Class.superClass";

/// Dump locations under this prefix carry the package in the path itself.
const DATA_APP_PREFIX: &str = "/data/app/";

/// System apps whose dump locations do not follow the `/data/app/` scheme.
const PACKAGE_LOCATION_PREFIXES: &[(&str, &str)] = &[
  (
    "/system_ext/priv-app/SystemUIGoogle/SystemUIGoogle.apk",
    "com.android.systemui",
  ),
  ("/product/priv-app/Phonesky/Phonesky.apk", "com.android.vending"),
  ("/product/app/Maps/Maps.apk", "com.google.android.apps.maps"),
  (
    "/system_ext/priv-app/NexusLauncherRelease/NexusLauncherRelease.apk",
    "com.google.android.apps.nexuslauncher",
  ),
  ("/product/app/Photos/Photos.apk", "com.google.android.apps.photos"),
  (
    "/product/priv-app/WellbeingPrebuilt/WellbeingPrebuilt.apk",
    "com.google.android.apps.wellbeing",
  ),
  ("/product/app/PrebuiltGmail/PrebuiltGmail.apk", "com.google.android.gm"),
  (
    "/product/priv-app/PrebuiltGmsCore/PrebuiltGmsCore",
    "com.google.android.gms",
  ),
  (
    "/product/priv-app/Velvet/Velvet.apk",
    "com.google.android.googlequicksearchbox",
  ),
  (
    "/product/app/LatinIMEGooglePrebuilt/LatinIMEGooglePrebuilt.apk",
    "com.google.android.inputmethod.latin",
  ),
];

/// Substring match for the on-device intelligence apks, which move around.
const MATCHMAKER_FRAGMENT: &str = "MatchMaker";
const MATCHMAKER_PACKAGE: &str = "com.google.android.as";

/// A class name with trailing `[]` pairs and any `java.lang.Class<...>`
/// wrapper removed, plus flags recording what was stripped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NormalizedType<'a> {
  pub name: &'a str,
  pub is_static_class: bool,
  pub number_of_arrays: usize,
}

/// `java.lang.Class<Foo>` yields `Foo`; anything else yields nothing.
#[must_use]
pub fn static_class_type_name(type_name: &str) -> Option<&str> {
  if type_name.ends_with('>') && type_name.starts_with(JAVA_CLASS_TEMPLATE) {
    return Some(&type_name[JAVA_CLASS_TEMPLATE.len()..type_name.len() - 1]);
  }
  None
}

/// Number of trailing `[]` pairs on a type name.
#[must_use]
pub fn number_of_arrays(type_name: &str) -> usize {
  let bytes = type_name.as_bytes();
  let mut arrays = 0;
  while bytes.len() >= 2 * (arrays + 1)
    && &bytes[bytes.len() - 2 * (arrays + 1)..bytes.len() - 2 * arrays] == b"[]"
  {
    arrays += 1;
  }
  arrays
}

#[must_use]
pub fn normalized_type(type_name: &str) -> NormalizedType<'_> {
  let (inner, is_static_class) = match static_class_type_name(type_name) {
    Some(inner) => (inner, true),
    None => (type_name, false),
  };
  let arrays = number_of_arrays(inner);
  NormalizedType {
    name: &inner[..inner.len() - 2 * arrays],
    is_static_class,
    number_of_arrays: arrays,
  }
}

#[must_use]
pub fn normalize_type_name(type_name: &str) -> &str {
  normalized_type(type_name).name
}

/// Re-apply the array suffix and static-class wrapper recorded in
/// `normalized` to `name`.
#[must_use]
pub fn denormalize_type_name(normalized: NormalizedType<'_>, name: &str) -> String {
  let mut result = String::from(name);
  for _ in 0..normalized.number_of_arrays {
    result.push_str("[]");
  }
  if normalized.is_static_class {
    result = format!("{JAVA_CLASS_TEMPLATE}{result}>");
  }
  result
}

/// An object frame as it appears on the wire.
#[derive(Clone, Debug, Default)]
pub struct SourceObject {
  pub object_id: u64,
  pub self_size: u64,
  pub type_id: u64,
  pub references: Vec<SourceReference>,
}

/// One outbound reference of a wire object. A zero `owned_object_id` is an
/// unset field.
#[derive(Clone, Copy, Debug)]
pub struct SourceReference {
  pub field_name_id: u64,
  pub owned_object_id: u64,
}

/// A root frame: every listed object is a GC root of the given kind.
#[derive(Clone, Debug)]
pub struct SourceRoot {
  pub root_type: String,
  pub object_ids: Vec<u64>,
}

type WireIdMap<V> = HashMap<u64, V, BuildNoHashHasher<u64>>;

#[derive(Clone, Copy, Debug)]
struct InternedType {
  name: StringId,
  location_id: Option<u64>,
}

/// Streaming state for one sequence, discarded at finalization.
#[derive(Debug, Default)]
struct SequenceState {
  current_upid: Option<u32>,
  current_ts: Option<i64>,
  interned_location_names: WireIdMap<StringId>,
  interned_types: WireIdMap<InternedType>,
  object_id_to_row: WireIdMap<ObjectId>,
  type_id_to_row: WireIdMap<ClassId>,
  references_for_field_name_id: WireIdMap<Vec<ReferenceId>>,
  current_roots: Vec<SourceRoot>,
  prev_index: Option<u64>,
}

/// Normalized class name and dump location; the identity under which
/// superclass edges are resolved.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct ClassDescriptor {
  name: StringId,
  location: Option<StringId>,
}

/// Reconstructs heap graphs from streamed frames: interning, object and
/// reference upserts, root-distance propagation, superclass resolution and
/// package attribution. One tracker processes one trace, single-threaded.
#[derive(Debug, Default)]
pub struct HeapGraphTracker {
  class_to_rows: HashMap<(Option<StringId>, StringId), Vec<ClassId>>,
  deobfuscation_mapping: HashMap<(Option<StringId>, StringId), StringId>,
  roots: HashMap<(u32, i64), BTreeSet<ObjectId>>,
  sequence_state: HashMap<u32, SequenceState, BuildNoHashHasher<u32>>,
  storage: GraphStorage,
}

impl HeapGraphTracker {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Map a deobfuscated name to its obfuscated (package, class) pair, and
  /// give already-known matching classes their readable name right away.
  pub fn add_deobfuscation_mapping(
    &mut self,
    package: Option<&str>,
    obfuscated: &str,
    deobfuscated: &str,
  ) {
    let package_id = package.map(|package| self.storage.strings.intern(package));
    let obfuscated_id = self.storage.strings.intern(obfuscated);
    let deobfuscated_id = self.storage.strings.intern(deobfuscated);
    self
      .deobfuscation_mapping
      .insert((package_id, obfuscated_id), deobfuscated_id);

    if let Some(rows) = self.class_to_rows.get(&(package_id, obfuscated_id)) {
      for &class_id in rows {
        let row = class_id.0 as usize;
        let denormalized = {
          let name = self.storage.strings.get(self.storage.classes.name[row]);
          denormalize_type_name(normalized_type(name), deobfuscated)
        };
        let denormalized_id = self.storage.strings.intern(&denormalized);
        self.storage.classes.deobfuscated_name[row] = Some(denormalized_id);
      }
    }
  }

  /// Record a field-name interning entry. The string optionally carries a
  /// space-separated declaring-type prefix, which is split off.
  pub fn add_interned_field_name(&mut self, seq_id: u32, intern_id: u64, field: &str) {
    let seq = self.sequence_state.entry(seq_id).or_default();
    let (type_name, field_name) = match field.find(' ') {
      Some(space) => (&field[..space], &field[space + 1..]),
      None => ("", field),
    };
    let field_name = self.storage.strings.intern(field_name);
    let type_name = self.storage.strings.intern(type_name);

    if let Some(reference_ids) = seq.references_for_field_name_id.get(&intern_id) {
      for &reference_id in reference_ids {
        let row = reference_id.0 as usize;
        self.storage.references.field_name[row] = Some(field_name);
        self.storage.references.field_type_name[row] = Some(type_name);
      }
    }
  }

  pub fn add_interned_location_name(&mut self, seq_id: u32, intern_id: u64, name: &str) {
    let name = self.storage.strings.intern(name);
    let seq = self.sequence_state.entry(seq_id).or_default();
    seq.interned_location_names.insert(intern_id, name);
  }

  pub fn add_interned_type(
    &mut self,
    seq_id: u32,
    intern_id: u64,
    name: &str,
    location_id: Option<u64>,
  ) {
    let name = self.storage.strings.intern(name);
    let seq = self.sequence_state.entry(seq_id).or_default();
    seq.interned_types.insert(intern_id, InternedType { name, location_id });
  }

  /// Upsert the object row for this frame, then append one reference row
  /// per set field. The owner's reference block starts at the current end
  /// of the reference table, which keeps it contiguous.
  pub fn add_object(&mut self, seq_id: u32, upid: u32, ts: i64, obj: SourceObject) {
    let seq = self.sequence_state.entry(seq_id).or_default();
    if !set_pid_and_timestamp(&mut self.storage.stats, seq, upid, ts) {
      return;
    }
    let current_upid = seq.current_upid.unwrap_or(0);
    let current_ts = seq.current_ts.unwrap_or(0);

    let owner_id = get_or_insert_object(
      &mut self.storage.objects,
      &mut seq.object_id_to_row,
      current_upid,
      current_ts,
      obj.object_id,
    );
    let type_id =
      get_or_insert_type(&mut self.storage.classes, &mut seq.type_id_to_row, obj.type_id);

    let row = owner_id.0 as usize;
    self.storage.objects.self_size[row] = obj.self_size as i64;
    self.storage.objects.type_id[row] = Some(type_id);

    let reference_set_id = self.storage.references.row_count() as u32;
    let mut any_references = false;
    for reference in &obj.references {
      if reference.owned_object_id == 0 {
        continue;
      }
      let owned_id = get_or_insert_object(
        &mut self.storage.objects,
        &mut seq.object_id_to_row,
        current_upid,
        current_ts,
        reference.owned_object_id,
      );
      let reference_id = self.storage.references.insert(reference_set_id, owner_id, owned_id);
      seq
        .references_for_field_name_id
        .entry(reference.field_name_id)
        .or_default()
        .push(reference_id);
      any_references = true;
    }
    if any_references {
      self.storage.objects.reference_set_id[owner_id.0 as usize] = Some(reference_set_id);
    }
  }

  /// Buffer a root frame; roots are applied at finalization, once every
  /// object they can name has had a chance to arrive.
  pub fn add_root(&mut self, seq_id: u32, upid: u32, ts: i64, root: SourceRoot) {
    let seq = self.sequence_state.entry(seq_id).or_default();
    if !set_pid_and_timestamp(&mut self.storage.stats, seq, upid, ts) {
      return;
    }
    seq.current_roots.push(root);
  }

  /// Fill in classes, apply buffered roots, resolve superclasses and drop
  /// the sequence state.
  pub fn finalize_profile(&mut self, seq_id: u32) {
    let Some(mut seq) = self.sequence_state.remove(&seq_id) else {
      return;
    };
    let upid = seq.current_upid.unwrap_or(0);
    let ts = seq.current_ts.unwrap_or(0);

    // Location names arrive at the end of the dump, so classes can only be
    // filled in now.
    for (&wire_type_id, interned) in &seq.interned_types {
      let location = match interned.location_id {
        Some(location_id) => match seq.interned_location_names.get(&location_id) {
          Some(&name) => Some(name),
          None => {
            self.storage.stats.invalid_location_ids += 1;
            None
          }
        },
        None => None,
      };

      let type_id =
        get_or_insert_type(&mut self.storage.classes, &mut seq.type_id_to_row, wire_type_id);
      let row = type_id.0 as usize;
      self.storage.classes.name[row] = interned.name;
      self.storage.classes.location[row] = location;

      let normalized_name = {
        let type_name = self.storage.strings.get(interned.name);
        normalize_type_name(type_name).to_string()
      };
      let normalized_id = self.storage.strings.intern(&normalized_name);

      // Some apps report a relative path to base.apk; that means the main
      // package, with no better location info available.
      let is_base_apk = location
        .map(|loc| self.storage.strings.get(loc).starts_with("base.apk"))
        .unwrap_or(false);

      if let Some(loc) = location.filter(|_| !is_base_apk) {
        let location_name = self.storage.strings.get(loc).to_string();
        if let Some(package) = package_from_location(&mut self.storage.stats, &location_name) {
          let package_id = self.storage.strings.intern(&package);
          self
            .class_to_rows
            .entry((Some(package_id), normalized_id))
            .or_default()
            .push(type_id);
        }
      } else {
        // No usable location: attribute to the main package.
        self
          .class_to_rows
          .entry((None, normalized_id))
          .or_default()
          .push(type_id);
      }
    }

    for root in &seq.current_roots {
      let root_type = self.storage.strings.intern(&root.root_type);
      for &wire_object_id in &root.object_ids {
        // Unknown ids were already reported when their frame failed.
        let Some(&object_id) = seq.object_id_to_row.get(&wire_object_id) else {
          continue;
        };
        let newly_rooted = self.roots.entry((upid, ts)).or_default().insert(object_id);
        if newly_rooted {
          mark_root(&mut self.storage, object_id, root_type);
        }
      }
    }

    self.populate_super_classes(upid, ts);
  }

  /// Translate a type name to its deobfuscated form, keeping the array
  /// suffix and static-class wrapper. Names without a mapping come back
  /// unchanged.
  #[must_use]
  pub fn maybe_deobfuscate(&mut self, package: Option<StringId>, id: StringId) -> StringId {
    let (normalized_name, is_static_class, arrays) = {
      let type_name = self.storage.strings.get(id);
      let normalized = normalized_type(type_name);
      (
        normalized.name.to_string(),
        normalized.is_static_class,
        normalized.number_of_arrays,
      )
    };
    let normalized_id = self.storage.strings.intern(&normalized_name);

    let Some(&deobfuscated) = self.deobfuscation_mapping.get(&(package, normalized_id)) else {
      return id;
    };

    let result = {
      let deobfuscated_name = self.storage.strings.get(deobfuscated).to_string();
      denormalize_type_name(
        NormalizedType {
          name: &normalized_name,
          is_static_class,
          number_of_arrays: arrays,
        },
        &deobfuscated_name,
      )
    };
    self.storage.strings.intern(&result)
  }

  /// Finalize any straggler sequences. Truncated traces still carry
  /// useful data.
  pub fn notify_end_of_file(&mut self) {
    if self.sequence_state.is_empty() {
      return;
    }
    self.storage.stats.truncated_graphs += 1;
    let pending: Vec<u32> = self.sequence_state.keys().copied().collect();
    for seq_id in pending {
      self.finalize_profile(seq_id);
    }
  }

  pub(crate) fn roots_for(&self, upid: u32, ts: i64) -> Option<&BTreeSet<ObjectId>> {
    self.roots.get(&(upid, ts))
  }

  /// Packet indexes start at 0 and increase by one; anything else means the
  /// transport dropped data.
  pub fn set_packet_index(&mut self, seq_id: u32, index: u64) {
    let seq = self.sequence_state.entry(seq_id).or_default();
    let dropped = match seq.prev_index {
      None => index != 0,
      Some(prev) => prev + 1 != index,
    };
    if dropped {
      match seq.prev_index {
        Some(prev) => warn!(prev, index, "missing packets in heap graph sequence"),
        None => warn!(index, "heap graph sequence does not start at packet 0"),
      }
      self.storage.stats.dropped_packets += 1;
    }
    seq.prev_index = Some(index);
  }

  #[must_use]
  pub fn storage(&self) -> &GraphStorage {
    &self.storage
  }

  /// superClass pointers live on the synthetic static-class objects; arrays
  /// are generated types and carry none.
  fn build_superclass_map(&mut self, upid: u32, ts: i64) -> HashMap<ClassDescriptor, ClassDescriptor> {
    let superclass_field = self.storage.strings.intern(SUPERCLASS_FIELD);
    let mut map = HashMap::new();

    for row in 0..self.storage.objects.row_count() {
      if self.storage.objects.upid[row] != upid
        || self.storage.objects.graph_sample_ts[row] != ts
      {
        continue;
      }
      let Some(descriptor) = self.class_descriptor_of(ObjectId(row as u32)) else {
        continue;
      };

      let class_name = {
        let name = self.storage.strings.get(descriptor.name);
        let normalized = normalized_type(name);
        if !normalized.is_static_class || normalized.number_of_arrays > 0 {
          continue;
        }
        normalized.name.to_string()
      };

      let Some(reference_set_id) = self.storage.objects.reference_set_id[row] else {
        continue;
      };
      // Missing for java.lang.Object and primitive types.
      let Some(super_object) = self.referred_object(reference_set_id, superclass_field) else {
        continue;
      };
      let Some(super_descriptor) = self.class_descriptor_of(super_object) else {
        continue;
      };

      let super_name = {
        let name = self.storage.strings.get(super_descriptor.name);
        normalize_type_name(name).to_string()
      };
      let super_name_id = self.storage.strings.intern(&super_name);
      let class_name_id = self.storage.strings.intern(&class_name);
      map.insert(
        ClassDescriptor {
          name: class_name_id,
          location: descriptor.location,
        },
        ClassDescriptor {
          name: super_name_id,
          location: super_descriptor.location,
        },
      );
    }
    map
  }

  fn class_descriptor_of(&self, id: ObjectId) -> Option<ClassDescriptor> {
    let type_id = self.storage.objects.type_id[id.0 as usize]?;
    let row = type_id.0 as usize;
    Some(ClassDescriptor {
      name: self.storage.classes.name[row],
      location: self.storage.classes.location[row],
    })
  }

  /// Annotate ordinary class rows with their superclass. All rows are
  /// visited, not just the finalizing sequence's; rows that cannot be
  /// matched are skipped.
  fn populate_super_classes(&mut self, upid: u32, ts: i64) {
    let superclass_map = self.build_superclass_map(upid, ts);

    let mut class_to_id: HashMap<ClassDescriptor, ClassId> = HashMap::new();
    for row in 0..self.storage.classes.row_count() {
      class_to_id.insert(
        ClassDescriptor {
          name: self.storage.classes.name[row],
          location: self.storage.classes.location[row],
        },
        ClassId(row as u32),
      );
    }

    for row in 0..self.storage.classes.row_count() {
      let normalized_name = {
        let name = self.storage.strings.get(self.storage.classes.name[row]);
        let normalized = normalized_type(name);
        if normalized.is_static_class || normalized.number_of_arrays > 0 {
          continue;
        }
        normalized.name.to_string()
      };
      let class_name_id = self.storage.strings.intern(&normalized_name);
      let location = self.storage.classes.location[row];

      let Some(super_descriptor) = superclass_map.get(&ClassDescriptor {
        name: class_name_id,
        location,
      }) else {
        continue;
      };
      // Superclasses without live instances may not have a row at all in
      // older traces.
      let Some(&superclass_id) = class_to_id.get(super_descriptor) else {
        continue;
      };
      self.storage.classes.superclass_id[row] = Some(superclass_id);
    }
  }

  /// First reference out of `reference_set_id` whose field name matches.
  fn referred_object(&self, reference_set_id: u32, field_name: StringId) -> Option<ObjectId> {
    let refs = &self.storage.references;
    for row in (reference_set_id as usize)..refs.row_count() {
      if refs.reference_set_id[row] != reference_set_id {
        break;
      }
      if refs.field_name[row] == Some(field_name) {
        return Some(refs.owned_id[row]);
      }
    }
    None
  }
}

/// Stamp `id` as a root of kind `root_type` and propagate shortest root
/// distances to everything it reaches.
///
/// Retention chains reach tens of thousands of edges, so the frontier lives
/// on the heap rather than the call stack. First writer wins at any given
/// distance; a revisit at an equal distance is a no-op.
pub fn mark_root(storage: &mut GraphStorage, id: ObjectId, root_type: StringId) {
  storage.objects.root_type[id.0 as usize] = Some(root_type);

  let mut frontier: VecDeque<(i32, ObjectId)> = VecDeque::new();
  frontier.push_back((0, id));
  while let Some((distance, node)) = frontier.pop_front() {
    let row = node.0 as usize;
    let current = storage.objects.root_distance[row];
    if current != -1 && current <= distance {
      continue;
    }
    if current == -1 {
      storage.objects.reachable[row] = true;
    }
    storage.objects.root_distance[row] = distance;

    for child in storage.children_of(node) {
      let child_distance = storage.objects.root_distance[child.0 as usize];
      if child_distance == -1 || child_distance > distance + 1 {
        frontier.push_back((distance + 1, child));
      }
    }
  }
}

fn get_or_insert_object(
  objects: &mut ObjectTable,
  map: &mut WireIdMap<ObjectId>,
  upid: u32,
  ts: i64,
  wire_id: u64,
) -> ObjectId {
  *map.entry(wire_id).or_insert_with(|| objects.insert(upid, ts))
}

fn get_or_insert_type(
  classes: &mut ClassTable,
  map: &mut WireIdMap<ClassId>,
  wire_id: u64,
) -> ClassId {
  *map.entry(wire_id).or_insert_with(|| classes.insert_empty())
}

/// Parse the package out of a `/data/app/<random>/<package>-<suffix>/...`
/// path. Paths with a single segment carry the suffix directly.
fn package_from_app_path(path: &str) -> Option<&str> {
  let slash = path.find('/')?;
  let segment = match path[slash + 1..].find('/') {
    Some(second) => &path[slash + 1..slash + 1 + second],
    None => &path[..slash],
  };
  let minus = segment.find('-')?;
  Some(&segment[..minus])
}

fn package_from_location(stats: &mut GraphStats, location: &str) -> Option<String> {
  for (prefix, package) in PACKAGE_LOCATION_PREFIXES {
    if location.starts_with(prefix) {
      return Some((*package).to_string());
    }
  }
  if location.contains(MATCHMAKER_FRAGMENT) {
    return Some(MATCHMAKER_PACKAGE.to_string());
  }
  if let Some(rest) = location.strip_prefix(DATA_APP_PREFIX) {
    return match package_from_app_path(rest) {
      Some(package) => Some(package.to_string()),
      None => {
        debug!(location, "failed to parse package from dump location");
        stats.location_parse_errors += 1;
        None
      }
    };
  }
  None
}

fn set_pid_and_timestamp(
  stats: &mut GraphStats,
  seq: &mut SequenceState,
  upid: u32,
  ts: i64,
) -> bool {
  if seq.current_upid.is_some_and(|current| current != upid)
    || seq.current_ts.is_some_and(|current| current != ts)
  {
    stats.mismatched_sequence_frames += 1;
    return false;
  }
  seq.current_upid = Some(upid);
  seq.current_ts = Some(ts);
  true
}

#[cfg(test)]
mod tests {
  use super::*;

  const SEQ: u32 = 1;
  const UPID: u32 = 7;
  const TS: i64 = 100;

  fn object(object_id: u64, type_id: u64, self_size: u64, refs: &[(u64, u64)]) -> SourceObject {
    SourceObject {
      object_id,
      self_size,
      type_id,
      references: refs
        .iter()
        .map(|&(field_name_id, owned_object_id)| SourceReference {
          field_name_id,
          owned_object_id,
        })
        .collect(),
    }
  }

  fn root(root_type: &str, object_ids: &[u64]) -> SourceRoot {
    SourceRoot {
      root_type: root_type.to_string(),
      object_ids: object_ids.to_vec(),
    }
  }

  #[test]
  fn roots_propagate_reachability_and_distance() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "A", None);
    tracker.add_interned_type(SEQ, 2, "B", None);
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 8, &[(1, 2)]));
    tracker.add_object(SEQ, UPID, TS, object(2, 2, 16, &[]));
    tracker.add_root(SEQ, UPID, TS, root("global", &[1]));
    tracker.finalize_profile(SEQ);

    let storage = tracker.storage();
    assert_eq!(storage.objects.root_distance[0], 0);
    assert!(storage.objects.reachable[0]);
    assert!(storage.objects.root_type[0].is_some());
    assert_eq!(storage.objects.root_distance[1], 1);
    assert!(storage.objects.reachable[1]);
  }

  #[test]
  fn every_reachable_object_has_a_parent_one_step_closer() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "Node", None);
    // A diamond with a long tail: 1 -> {2, 3}, 2 -> 4, 3 -> 4, 4 -> 5.
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 8, &[(1, 2), (1, 3)]));
    tracker.add_object(SEQ, UPID, TS, object(2, 1, 8, &[(1, 4)]));
    tracker.add_object(SEQ, UPID, TS, object(3, 1, 8, &[(1, 4)]));
    tracker.add_object(SEQ, UPID, TS, object(4, 1, 8, &[(1, 5)]));
    tracker.add_object(SEQ, UPID, TS, object(5, 1, 8, &[]));
    tracker.add_root(SEQ, UPID, TS, root("global", &[1]));
    tracker.finalize_profile(SEQ);

    let storage = tracker.storage();
    for row in 0..storage.objects.row_count() {
      let distance = storage.objects.root_distance[row];
      assert!(storage.objects.reachable[row]);
      if distance == 0 {
        continue;
      }
      let has_closer_parent = (0..storage.references.row_count()).any(|ref_row| {
        storage.references.owned_id[ref_row] == ObjectId(row as u32)
          && storage.objects.root_distance[storage.references.owner_id[ref_row].0 as usize]
            == distance - 1
      });
      assert!(has_closer_parent, "object {row} at distance {distance}");
    }
  }

  #[test]
  fn unreferenced_objects_stay_unreachable() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "A", None);
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 8, &[]));
    tracker.add_object(SEQ, UPID, TS, object(2, 1, 8, &[]));
    tracker.add_root(SEQ, UPID, TS, root("global", &[1]));
    tracker.finalize_profile(SEQ);

    let storage = tracker.storage();
    assert!(!storage.objects.reachable[1]);
    assert_eq!(storage.objects.root_distance[1], -1);
  }

  #[test]
  fn mismatched_upid_drops_the_frame_and_counts_it() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 8, &[]));
    tracker.add_object(SEQ, UPID + 1, TS, object(2, 1, 8, &[]));
    tracker.add_object(SEQ, UPID, TS + 1, object(3, 1, 8, &[]));

    let storage = tracker.storage();
    assert_eq!(storage.objects.row_count(), 1);
    assert_eq!(storage.stats.mismatched_sequence_frames, 2);
  }

  #[test]
  fn unknown_root_ids_are_silently_skipped() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "A", None);
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 8, &[]));
    tracker.add_root(SEQ, UPID, TS, root("global", &[1, 999]));
    tracker.finalize_profile(SEQ);

    assert_eq!(tracker.roots_for(UPID, TS).map(BTreeSet::len), Some(1));
  }

  #[test]
  fn packet_gaps_increment_the_dropped_stat() {
    let mut tracker = HeapGraphTracker::new();
    tracker.set_packet_index(SEQ, 0);
    tracker.set_packet_index(SEQ, 1);
    assert_eq!(tracker.storage().stats.dropped_packets, 0);

    tracker.set_packet_index(SEQ, 3);
    assert_eq!(tracker.storage().stats.dropped_packets, 1);

    // A second sequence must start at zero.
    tracker.set_packet_index(SEQ + 1, 5);
    assert_eq!(tracker.storage().stats.dropped_packets, 2);
  }

  #[test]
  fn field_names_split_the_declaring_type_prefix() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "A", None);
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 8, &[(77, 2)]));
    tracker.add_interned_field_name(SEQ, 77, "java.lang.Object next");
    tracker.finalize_profile(SEQ);

    let storage = tracker.storage();
    let field = storage.references.field_name[0].expect("field name");
    let field_type = storage.references.field_type_name[0].expect("field type");
    assert_eq!(storage.strings.get(field), "next");
    assert_eq!(storage.strings.get(field_type), "java.lang.Object");
  }

  #[test]
  fn type_name_normalization_round_trips() {
    for type_name in ["Foo", "Foo[]", "Foo[][]", "java.lang.Class<Bar>"] {
      let normalized = normalized_type(type_name);
      assert_eq!(denormalize_type_name(normalized, normalized.name), type_name);
    }

    assert_eq!(number_of_arrays("Foo[][]"), 2);
    assert_eq!(number_of_arrays("Foo"), 0);
    assert_eq!(static_class_type_name("java.lang.Class<Bar>"), Some("Bar"));
    assert_eq!(static_class_type_name("Bar"), None);
    assert_eq!(normalize_type_name("java.lang.Class<Bar[]>"), "Bar");
  }

  #[test]
  fn location_resolution_counts_unknown_interned_ids() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "A", Some(404));
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 8, &[]));
    tracker.finalize_profile(SEQ);

    let storage = tracker.storage();
    assert_eq!(storage.stats.invalid_location_ids, 1);
    assert_eq!(storage.classes.location[0], None);
  }

  #[test]
  fn packages_parse_out_of_data_app_locations() {
    let mut stats = GraphStats::default();
    assert_eq!(
      package_from_location(&mut stats, "/data/app/~~abc==/com.example.app-XyZ==/base.apk"),
      Some("com.example.app".to_string())
    );
    assert_eq!(
      package_from_location(&mut stats, "/data/app/com.example.app-1/base.apk"),
      Some("com.example.app".to_string())
    );
    assert_eq!(
      package_from_location(&mut stats, "/product/app/Maps/Maps.apk"),
      Some("com.google.android.apps.maps".to_string())
    );
    assert_eq!(
      package_from_location(&mut stats, "/apex/MatchMakerPrebuilt/thing.apk"),
      Some("com.google.android.as".to_string())
    );
    assert_eq!(package_from_location(&mut stats, "/system/framework/boot.art"), None);
    assert_eq!(stats.location_parse_errors, 0);

    assert_eq!(package_from_location(&mut stats, "/data/app/noslash"), None);
    assert_eq!(stats.location_parse_errors, 1);
  }

  #[test]
  fn superclass_edges_resolve_through_static_class_objects() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "A", None);
    tracker.add_interned_type(SEQ, 2, "B", None);
    tracker.add_interned_type(SEQ, 3, "java.lang.Class<A>", None);
    tracker.add_interned_type(SEQ, 4, "java.lang.Class<B>", None);
    // Static-class objects; A's superClass field points at B's class object.
    tracker.add_object(SEQ, UPID, TS, object(10, 3, 32, &[(5, 11)]));
    tracker.add_object(SEQ, UPID, TS, object(11, 4, 32, &[]));
    tracker.add_interned_field_name(SEQ, 5, "java.lang.Class.superClass");
    tracker.finalize_profile(SEQ);

    let storage = tracker.storage();
    let class_a = (0..storage.classes.row_count())
      .find(|&row| storage.strings.get(storage.classes.name[row]) == "A")
      .expect("class A row");
    let class_b = (0..storage.classes.row_count())
      .find(|&row| storage.strings.get(storage.classes.name[row]) == "B")
      .expect("class B row");

    assert_eq!(storage.classes.superclass_id[class_a], Some(ClassId(class_b as u32)));
    assert_eq!(storage.classes.superclass_id[class_b], None);

    // No cycles: walking superclass edges terminates.
    let mut seen = 0;
    let mut cursor = Some(ClassId(class_a as u32));
    while let Some(class_id) = cursor {
      cursor = storage.classes.superclass_id[class_id.0 as usize];
      seen += 1;
      assert!(seen <= storage.classes.row_count());
    }
  }

  #[test]
  fn deobfuscation_applies_to_known_classes_and_lookups() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "a", None);
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 8, &[]));
    tracker.finalize_profile(SEQ);

    tracker.add_deobfuscation_mapping(None, "a", "com.example.Clear");

    let storage = tracker.storage();
    let deobfuscated = storage.classes.deobfuscated_name[0].expect("deobfuscated name");
    assert_eq!(storage.strings.get(deobfuscated), "com.example.Clear");

    // Arrays keep their suffix through the lookup path.
    let array_id = tracker.storage.strings.intern("a[]");
    let result = tracker.maybe_deobfuscate(None, array_id);
    assert_eq!(tracker.storage().strings.get(result), "com.example.Clear[]");

    // Unmapped names come back unchanged.
    let unknown = tracker.storage.strings.intern("b");
    assert_eq!(tracker.maybe_deobfuscate(None, unknown), unknown);
  }

  #[test]
  fn end_of_file_finalizes_stragglers() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "A", None);
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 8, &[]));
    tracker.add_root(SEQ, UPID, TS, root("global", &[1]));

    tracker.notify_end_of_file();

    assert_eq!(tracker.storage().stats.truncated_graphs, 1);
    assert_eq!(tracker.storage().objects.root_distance[0], 0);
    assert!(tracker.roots_for(UPID, TS).is_some());
  }
}
