use std::collections::HashMap;

use smallvec::SmallVec;

/// Interned string handle. Id 0 is always the empty string.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct StringId(pub u32);

impl StringId {
  pub const EMPTY: StringId = StringId(0);
}

/// One id per distinct string.
#[derive(Debug)]
pub struct StringPool {
  entries: Vec<String>,
  index: HashMap<String, StringId>,
}

impl StringPool {
  #[must_use]
  pub fn get(&self, id: StringId) -> &str {
    &self.entries[id.0 as usize]
  }

  pub fn intern(&mut self, value: &str) -> StringId {
    if let Some(id) = self.index.get(value) {
      return *id;
    }

    let id = StringId(self.entries.len() as u32);
    self.entries.push(value.to_string());
    self.index.insert(value.to_string(), id);
    id
  }

  #[must_use]
  pub fn new() -> Self {
    Self {
      entries: vec![String::new()],
      index: HashMap::from([(String::new(), StringId::EMPTY)]),
    }
  }
}

impl Default for StringPool {
  fn default() -> Self {
    Self::new()
  }
}

/// Row handle into `ObjectTable`; ids are dense row indexes.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObjectId(pub u32);

/// Row handle into `ClassTable`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClassId(pub u32);

/// Row handle into `ReferenceTable`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ReferenceId(pub u32);

/// Heap objects, one row each, stored as typed columns.
///
/// `root_distance` is -1 until a root marks the object reachable.
#[derive(Debug, Default)]
pub struct ObjectTable {
  pub upid: Vec<u32>,
  pub graph_sample_ts: Vec<i64>,
  pub self_size: Vec<i64>,
  pub reference_set_id: Vec<Option<u32>>,
  pub reachable: Vec<bool>,
  pub type_id: Vec<Option<ClassId>>,
  pub root_type: Vec<Option<StringId>>,
  pub root_distance: Vec<i32>,
}

impl ObjectTable {
  pub fn insert(&mut self, upid: u32, graph_sample_ts: i64) -> ObjectId {
    let id = ObjectId(self.upid.len() as u32);
    self.upid.push(upid);
    self.graph_sample_ts.push(graph_sample_ts);
    self.self_size.push(0);
    self.reference_set_id.push(None);
    self.reachable.push(false);
    self.type_id.push(None);
    self.root_type.push(None);
    self.root_distance.push(-1);
    id
  }

  #[must_use]
  pub fn row_count(&self) -> usize {
    self.upid.len()
  }
}

/// Outbound references. All rows sharing a `reference_set_id` belong to the
/// same owner and are contiguous in insertion order; child enumeration
/// depends on that.
#[derive(Debug, Default)]
pub struct ReferenceTable {
  pub reference_set_id: Vec<u32>,
  pub owner_id: Vec<ObjectId>,
  pub owned_id: Vec<ObjectId>,
  pub field_name: Vec<Option<StringId>>,
  pub field_type_name: Vec<Option<StringId>>,
}

impl ReferenceTable {
  pub fn insert(&mut self, reference_set_id: u32, owner_id: ObjectId, owned_id: ObjectId) -> ReferenceId {
    let id = ReferenceId(self.owner_id.len() as u32);
    self.reference_set_id.push(reference_set_id);
    self.owner_id.push(owner_id);
    self.owned_id.push(owned_id);
    self.field_name.push(None);
    self.field_type_name.push(None);
    id
  }

  #[must_use]
  pub fn row_count(&self) -> usize {
    self.owner_id.len()
  }
}

/// Classes, created on first reference and filled in at finalization.
#[derive(Debug, Default)]
pub struct ClassTable {
  pub name: Vec<StringId>,
  pub location: Vec<Option<StringId>>,
  pub superclass_id: Vec<Option<ClassId>>,
  pub deobfuscated_name: Vec<Option<StringId>>,
}

impl ClassTable {
  pub fn insert_empty(&mut self) -> ClassId {
    let id = ClassId(self.name.len() as u32);
    self.name.push(StringId::EMPTY);
    self.location.push(None);
    self.superclass_id.push(None);
    self.deobfuscated_name.push(None);
    id
  }

  #[must_use]
  pub fn row_count(&self) -> usize {
    self.name.len()
  }
}

/// Soft-failure counters. The tracker never rejects a trace outright; it
/// counts what it had to drop or guess.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GraphStats {
  pub dropped_packets: u64,
  pub invalid_location_ids: u64,
  pub location_parse_errors: u64,
  pub mismatched_sequence_frames: u64,
  pub truncated_graphs: u64,
}

/// The analyzed rows: interned strings plus the typed column tables the
/// analysis pipeline reads.
#[derive(Debug, Default)]
pub struct GraphStorage {
  pub classes: ClassTable,
  pub objects: ObjectTable,
  pub references: ReferenceTable,
  pub stats: GraphStats,
  pub strings: StringPool,
}

impl GraphStorage {
  /// Distinct outbound edges of `id`, deduplicated and in ascending id
  /// order, walked from the owner's `reference_set_id` until the set id
  /// changes.
  ///
  /// The ordering is part of the contract: the flamegraph walk breaks
  /// shared-descendant ties by visit order, so children must come back
  /// sorted regardless of the order the reference rows were inserted in.
  #[must_use]
  pub fn children_of(&self, id: ObjectId) -> SmallVec<[ObjectId; 8]> {
    let mut children = SmallVec::new();
    let Some(set_id) = self.objects.reference_set_id[id.0 as usize] else {
      return children;
    };
    for row in (set_id as usize)..self.references.row_count() {
      if self.references.reference_set_id[row] != set_id {
        break;
      }
      debug_assert_eq!(self.references.owner_id[row], id);
      children.push(self.references.owned_id[row]);
    }
    children.sort_unstable();
    children.dedup();
    children
  }
}
