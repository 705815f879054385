use std::{
  collections::{HashMap, HashSet},
  fmt::{self, Display, Formatter},
  io::{self, Write},
};

use serde::Serialize;
use smallvec::SmallVec;

use crate::graph::storage::{ClassId, GraphStorage, ObjectId};
use crate::graph::tracker::HeapGraphTracker;

/// Profile-type tag attached to every emitted row.
const PROFILE_TYPE: &str = "graph";

/// Synthetic map name; heap graphs have no real mapping.
const MAP_NAME: &str = "JAVA";

/// Index of the artificial root in the result tree.
const ROOT_NODE: usize = 0;

/// One node of the folded retention tree. `id` values are dense and a row's
/// parent always precedes it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FlamegraphRow {
  pub id: u32,
  pub upid: u32,
  pub ts: i64,
  pub depth: u32,
  pub name: String,
  pub map_name: &'static str,
  pub profile_type: &'static str,
  pub count: i64,
  pub cumulative_count: i64,
  pub size: i64,
  pub cumulative_size: i64,
  pub parent_id: Option<u32>,
}

/// Errors surfaced while exporting flamegraph rows.
#[derive(Debug)]
pub enum ExportError {
  Io(io::Error),
  Json(serde_json::Error),
}

impl Display for ExportError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "i/o error during export: {err}"),
      Self::Json(err) => write!(f, "failed to encode flamegraph as json: {err}"),
    }
  }
}

impl std::error::Error for ExportError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
    }
  }
}

impl From<io::Error> for ExportError {
  fn from(value: io::Error) -> Self {
    Self::Io(value)
  }
}

impl From<serde_json::Error> for ExportError {
  fn from(value: serde_json::Error) -> Self {
    Self::Json(value)
  }
}

/// Serialize flamegraph rows as one JSON array, newline terminated.
///
/// # Errors
///
/// Returns an `ExportError` if serialization fails or the underlying writer
/// does.
pub fn export_flamegraph_json<W: Write>(
  rows: &[FlamegraphRow],
  mut writer: W,
) -> Result<(), ExportError> {
  serde_json::to_writer(&mut writer, rows)?;
  writer.write_all(b"\n")?;
  Ok(())
}

#[derive(Debug, Default)]
struct PathNode {
  children: HashMap<ClassId, usize>,
  type_id: Option<ClassId>,
  depth: u32,
  parent_id: usize,
  size: i64,
  count: i64,
}

/// Result tree of the shortest-path traversal. Node 0 is the artificial
/// root and is never emitted.
#[derive(Debug, Default)]
struct PathFromRoot {
  nodes: Vec<PathNode>,
  visited: HashSet<ObjectId>,
}

struct StackElem {
  node: ObjectId,
  /// Result-tree node the object's type folds into.
  parent_id: usize,
  /// Next child of `node` to handle.
  next_child: usize,
  depth: u32,
  children: SmallVec<[ObjectId; 8]>,
}

/// Walk the shortest-path spanning tree under one graph root, folding
/// objects into per-type tree nodes.
///
/// Retention chains (LinkedList and friends) are deep enough to overflow
/// the OS stack, so the traversal state lives in an explicit heap stack. A
/// child edge is taken only when the child sits exactly one step further
/// from the root and has not been visited in this traversal; every object
/// therefore contributes its self size to exactly one tree node.
fn find_path_from_root(storage: &GraphStorage, id: ObjectId, path: &mut PathFromRoot) {
  let mut stack = vec![StackElem {
    node: id,
    parent_id: ROOT_NODE,
    next_child: 0,
    depth: 1,
    children: SmallVec::new(),
  }];

  while !stack.is_empty() {
    let frame = stack.len() - 1;
    let node = stack[frame].node;
    let parent_id = stack[frame].parent_id;
    let depth = stack[frame].depth;
    let row = node.0 as usize;

    let Some(type_id) = storage.objects.type_id[row] else {
      // An object referenced but never described; nothing to attribute.
      stack.pop();
      continue;
    };

    let path_id = match path.nodes[parent_id].children.get(&type_id) {
      Some(&existing) => existing,
      None => {
        let path_id = path.nodes.len();
        path.nodes.push(PathNode {
          type_id: Some(type_id),
          depth,
          parent_id,
          ..PathNode::default()
        });
        path.nodes[parent_id].children.insert(type_id, path_id);
        path_id
      }
    };

    if stack[frame].next_child == 0 {
      // First time at this object: its bytes belong to this tree node.
      path.nodes[path_id].size += storage.objects.self_size[row];
      path.nodes[path_id].count += 1;
      stack[frame].children = storage.children_of(node);
    }

    let i = stack[frame].next_child;
    if i >= stack[frame].children.len() {
      stack.pop();
      continue;
    }
    let child = stack[frame].children[i];
    stack[frame].next_child = i + 1;

    let child_distance = storage.objects.root_distance[child.0 as usize];
    let node_distance = storage.objects.root_distance[row];
    debug_assert!(node_distance >= 0);

    if child_distance == node_distance + 1 && path.visited.insert(child) {
      stack.push(StackElem {
        node: child,
        parent_id: path_id,
        next_child: 0,
        depth: depth + 1,
        children: SmallVec::new(),
      });
    }
  }
}

impl HeapGraphTracker {
  /// Fold the retention graph recorded for `(upid, ts)` into flamegraph
  /// rows. Empty when no roots were recorded for that snapshot.
  #[must_use]
  pub fn build_flamegraph(&self, upid: u32, ts: i64) -> Vec<FlamegraphRow> {
    let Some(roots) = self.roots_for(upid, ts) else {
      return Vec::new();
    };

    let mut path = PathFromRoot::default();
    path.nodes.push(PathNode::default());
    for &root in roots {
      find_path_from_root(self.storage(), root, &mut path);
    }

    // Fold cumulative totals bottom-up; parents always precede their
    // children in the node vector, so the reverse scan sees every child
    // before its parent.
    let mut cumulative_size = vec![0i64; path.nodes.len()];
    let mut cumulative_count = vec![0i64; path.nodes.len()];
    for i in (1..path.nodes.len()).rev() {
      let node = &path.nodes[i];
      cumulative_size[i] += node.size;
      cumulative_count[i] += node.count;
      cumulative_size[node.parent_id] += cumulative_size[i];
      cumulative_count[node.parent_id] += cumulative_count[i];
    }

    let storage = self.storage();
    let mut rows = Vec::with_capacity(path.nodes.len().saturating_sub(1));
    for i in 1..path.nodes.len() {
      let node = &path.nodes[i];
      let Some(type_id) = node.type_id else {
        continue;
      };
      let type_row = type_id.0 as usize;
      let name_id = storage.classes.deobfuscated_name[type_row]
        .unwrap_or(storage.classes.name[type_row]);
      let parent_id = if node.parent_id == ROOT_NODE {
        None
      } else {
        Some((node.parent_id - 1) as u32)
      };

      rows.push(FlamegraphRow {
        id: (i - 1) as u32,
        upid,
        ts,
        depth: node.depth,
        name: storage.strings.get(name_id).to_string(),
        map_name: MAP_NAME,
        profile_type: PROFILE_TYPE,
        count: node.count,
        cumulative_count: cumulative_count[i],
        size: node.size,
        cumulative_size: cumulative_size[i],
        parent_id,
      });
    }
    rows
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::graph::tracker::{SourceObject, SourceReference, SourceRoot};

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

  fn root(object_ids: &[u64]) -> SourceRoot {
    SourceRoot {
      root_type: "global".to_string(),
      object_ids: object_ids.to_vec(),
    }
  }

  fn two_object_tracker() -> HeapGraphTracker {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "A", None);
    tracker.add_interned_type(SEQ, 2, "B", None);
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 8, &[(1, 2)]));
    tracker.add_object(SEQ, UPID, TS, object(2, 2, 16, &[]));
    tracker.add_root(SEQ, UPID, TS, root(&[1]));
    tracker.finalize_profile(SEQ);
    tracker
  }

  #[test]
  fn folds_a_simple_chain() {
    let tracker = two_object_tracker();
    let rows = tracker.build_flamegraph(UPID, TS);

    assert_eq!(rows.len(), 2);

    assert_eq!(rows[0].depth, 1);
    assert_eq!(rows[0].name, "A");
    assert_eq!(rows[0].size, 8);
    assert_eq!(rows[0].cumulative_size, 24);
    assert_eq!(rows[0].count, 1);
    assert_eq!(rows[0].parent_id, None);
    assert_eq!(rows[0].profile_type, "graph");
    assert_eq!(rows[0].map_name, "JAVA");

    assert_eq!(rows[1].depth, 2);
    assert_eq!(rows[1].name, "B");
    assert_eq!(rows[1].size, 16);
    assert_eq!(rows[1].cumulative_size, 16);
    assert_eq!(rows[1].parent_id, Some(rows[0].id));
  }

  #[test]
  fn unknown_snapshots_fold_to_nothing() {
    let tracker = two_object_tracker();
    assert!(tracker.build_flamegraph(UPID, TS + 1).is_empty());
    assert!(tracker.build_flamegraph(UPID + 1, TS).is_empty());
  }

  #[test]
  fn objects_of_one_type_fold_into_one_node() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "Holder", None);
    tracker.add_interned_type(SEQ, 2, "Leaf", None);
    // One holder retains three leaves.
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 32, &[(1, 2), (2, 3), (3, 4)]));
    tracker.add_object(SEQ, UPID, TS, object(2, 2, 8, &[]));
    tracker.add_object(SEQ, UPID, TS, object(3, 2, 8, &[]));
    tracker.add_object(SEQ, UPID, TS, object(4, 2, 8, &[]));
    tracker.add_root(SEQ, UPID, TS, root(&[1]));
    tracker.finalize_profile(SEQ);

    let rows = tracker.build_flamegraph(UPID, TS);
    assert_eq!(rows.len(), 2);

    let leaf = rows.iter().find(|row| row.name == "Leaf").expect("leaf row");
    assert_eq!(leaf.count, 3);
    assert_eq!(leaf.size, 24);
    assert_eq!(leaf.cumulative_count, 3);

    let holder = rows.iter().find(|row| row.name == "Holder").expect("holder row");
    assert_eq!(holder.cumulative_size, 56);
    assert_eq!(holder.cumulative_count, 4);
  }

  #[test]
  fn cumulative_sizes_satisfy_the_fold_law() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "A", None);
    tracker.add_interned_type(SEQ, 2, "B", None);
    tracker.add_interned_type(SEQ, 3, "C", None);
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 10, &[(1, 2), (2, 3)]));
    tracker.add_object(SEQ, UPID, TS, object(2, 2, 20, &[(1, 4)]));
    tracker.add_object(SEQ, UPID, TS, object(3, 3, 30, &[]));
    tracker.add_object(SEQ, UPID, TS, object(4, 3, 40, &[]));
    tracker.add_root(SEQ, UPID, TS, root(&[1]));
    tracker.finalize_profile(SEQ);

    let rows = tracker.build_flamegraph(UPID, TS);

    for row in &rows {
      let children_cumulative: i64 = rows
        .iter()
        .filter(|candidate| candidate.parent_id == Some(row.id))
        .map(|child| child.cumulative_size)
        .sum();
      assert_eq!(row.cumulative_size, row.size + children_cumulative);
    }

    let total: i64 = rows
      .iter()
      .filter(|row| row.parent_id.is_none())
      .map(|row| row.cumulative_size)
      .sum();
    assert_eq!(total, 100);
  }

  #[test]
  fn shared_objects_count_once_via_the_shortest_path() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "A", None);
    tracker.add_interned_type(SEQ, 2, "B", None);
    tracker.add_interned_type(SEQ, 3, "C", None);
    // A retains B and C; both B and C point at the same C-typed leaf, which
    // sits at distance 1 via neither (it is also directly referenced by A).
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 1, &[(1, 2), (2, 3), (3, 4)]));
    tracker.add_object(SEQ, UPID, TS, object(2, 2, 2, &[(1, 4)]));
    tracker.add_object(SEQ, UPID, TS, object(3, 3, 4, &[(1, 4)]));
    tracker.add_object(SEQ, UPID, TS, object(4, 3, 8, &[]));
    tracker.add_root(SEQ, UPID, TS, root(&[1]));
    tracker.finalize_profile(SEQ);

    let rows = tracker.build_flamegraph(UPID, TS);
    let total_self: i64 = rows.iter().map(|row| row.size).sum();
    let total_count: i64 = rows.iter().map(|row| row.count).sum();

    assert_eq!(total_self, 15);
    assert_eq!(total_count, 4);
  }

  #[test]
  fn shared_descendant_tie_breaks_ignore_reference_insertion_order() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "A", None);
    tracker.add_interned_type(SEQ, 2, "B", None);
    tracker.add_interned_type(SEQ, 3, "C", None);
    tracker.add_interned_type(SEQ, 4, "D", None);
    // B and C both retain D, and the root's reference rows name C before B
    // even though B holds the lower object row. Child enumeration sorts by
    // object id, so B still wins the shared descendant.
    tracker.add_object(SEQ, UPID, TS, object(2, 2, 2, &[(1, 4)]));
    tracker.add_object(SEQ, UPID, TS, object(3, 3, 4, &[(1, 4)]));
    tracker.add_object(SEQ, UPID, TS, object(4, 4, 8, &[]));
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 1, &[(1, 3), (1, 2)]));
    tracker.add_root(SEQ, UPID, TS, root(&[1]));
    tracker.finalize_profile(SEQ);

    let rows = tracker.build_flamegraph(UPID, TS);
    let b = rows.iter().find(|row| row.name == "B").expect("B row");
    let c = rows.iter().find(|row| row.name == "C").expect("C row");
    let d = rows.iter().find(|row| row.name == "D").expect("D row");

    assert_eq!(d.parent_id, Some(b.id));
    assert_eq!(b.cumulative_size, 10);
    assert_eq!(c.cumulative_size, 4);
  }

  #[test]
  fn deobfuscated_names_win_over_raw_names() {
    let mut tracker = HeapGraphTracker::new();
    tracker.add_interned_type(SEQ, 1, "a", None);
    tracker.add_object(SEQ, UPID, TS, object(1, 1, 8, &[]));
    tracker.add_root(SEQ, UPID, TS, root(&[1]));
    tracker.finalize_profile(SEQ);
    tracker.add_deobfuscation_mapping(None, "a", "com.example.Clear");

    let rows = tracker.build_flamegraph(UPID, TS);
    assert_eq!(rows[0].name, "com.example.Clear");
  }

  #[test]
  fn rows_export_as_json() {
    let tracker = two_object_tracker();
    let rows = tracker.build_flamegraph(UPID, TS);

    let mut encoded = Vec::new();
    export_flamegraph_json(&rows, &mut encoded).expect("export");

    let parsed: serde_json::Value = serde_json::from_slice(&encoded).expect("valid json");
    let array = parsed.as_array().expect("array of rows");
    assert_eq!(array.len(), 2);
    assert_eq!(array[0]["name"], "A");
    assert_eq!(array[0]["cumulative_size"], 24);
    assert_eq!(array[1]["parent_id"], 0);
  }
}
