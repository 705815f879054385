//! In-process client of a sampling heap profiler, plus the offline heap
//! graph reconstruction used by the analysis pipeline.
//!
//! The client half is dynamically loaded into a target process by its
//! allocator runtime. Registered heaps report allocation and free events
//! from any thread; Poisson sampling decides which are worth keeping, and
//! sampled records travel over a local stream socket to a collector daemon.
//! The hot path never allocates from the host heap and never blocks on
//! anything slower than a spinlock.
//!
//! The offline half consumes serialized graph frames, materializes a
//! reachability graph with root distances and superclass edges, and folds
//! retention into a flamegraph tree.

mod api;
mod graph;
mod registry;
mod sampler;
mod session;
mod spinlock;
mod unhooked;
mod wire;

pub use {
  api::{
    heapprof_init_session, heapprof_register_heap, heapprof_report_allocation,
    heapprof_report_free,
  },
  graph::{
    flamegraph::{export_flamegraph_json, ExportError, FlamegraphRow},
    storage::{
      ClassId, ClassTable, GraphStats, GraphStorage, ObjectId, ObjectTable, ReferenceId,
      ReferenceTable, StringId, StringPool,
    },
    tracker::{
      denormalize_type_name, mark_root, normalize_type_name, normalized_type, number_of_arrays,
      static_class_type_name, HeapGraphTracker, NormalizedType, SourceObject, SourceReference,
      SourceRoot,
    },
  },
  registry::{EnabledCallback, HeapInfo, HEAP_NAME_SZ},
  sampler::Sampler,
  session::{Session, SessionError, DAEMON_BIN_PATH, DAEMON_SOCKET_PATH},
  spinlock::{Spinlock, SpinlockGuard},
  unhooked::{FreeFn, MallocFn, UnhookedAllocator, UnhookedArc},
  wire::{
    read_record, write_record, ClientConfiguration, FreeRecord, Handshake, HeapConfig,
    MallocRecord, Payload, Record, MAX_FRAME_SZ,
  },
};
