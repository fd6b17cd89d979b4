use crate::trace::def::Arg;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// One interpreter frame worth of values needed to resume after a guard
/// fails. Frames are chained innermost first through `prev`; chains are
/// shared between guards recorded in the same frame.
#[derive(Debug, PartialEq)]
pub struct Snapshot {
    pub prev: Option<Arc<Snapshot>>,
    pub boxes: Vec<Arg>,
}

impl Snapshot {
    pub fn new(prev: Option<Arc<Snapshot>>, boxes: Vec<Arg>) -> Arc<Self> {
        Arc::new(Self { prev, boxes })
    }

    pub fn frames(&self) -> Frames<'_> {
        Frames { next: Some(self) }
    }

    pub fn depth(&self) -> usize {
        self.frames().count()
    }
}

pub struct Frames<'a> {
    next: Option<&'a Snapshot>,
}

impl<'a> Iterator for Frames<'a> {
    type Item = &'a Snapshot;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next?;
        self.next = cur.prev.as_deref();
        Some(cur)
    }
}

/// Rebuilds snapshot chains through a box mapping. A chain node that several
/// guards share is rebuilt once and the copies stay shared.
#[derive(Default)]
pub struct SnapshotRelinker {
    // Keyed by node address; the source Arc is kept so the address stays valid.
    memo: FxHashMap<usize, (Arc<Snapshot>, Arc<Snapshot>)>,
    reuse_unchanged: bool,
}

impl SnapshotRelinker {
    /// Every relinked node is a new node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes the mapping leaves untouched, tail included, are returned as is.
    pub fn sharing() -> Self {
        Self {
            reuse_unchanged: true,
            ..Self::default()
        }
    }

    pub fn relink<F>(
        &mut self,
        snapshot: Option<&Arc<Snapshot>>,
        mut map: F,
    ) -> Option<Arc<Snapshot>>
    where
        F: FnMut(Arg) -> Arg,
    {
        let head = snapshot?;

        let mut pending: Vec<&Arc<Snapshot>> = Vec::new();
        let mut base: Option<Arc<Snapshot>> = None;
        let mut cur = Some(head);
        while let Some(node) = cur {
            if let Some((_, done)) = self.memo.get(&(Arc::as_ptr(node) as usize)) {
                base = Some(Arc::clone(done));
                break;
            }
            pending.push(node);
            cur = node.prev.as_ref();
        }

        for src in pending.into_iter().rev() {
            let boxes = src
                .boxes
                .iter()
                .map(|a| match a {
                    Arg::Box(_) => map(*a),
                    Arg::Const(_) => *a,
                })
                .collect();
            let prev = base.take();
            let unchanged = self.reuse_unchanged
                && boxes == src.boxes
                && match (&prev, &src.prev) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                };
            let node = if unchanged {
                Arc::clone(src)
            } else {
                Snapshot::new(prev, boxes)
            };
            self.memo
                .insert(Arc::as_ptr(src) as usize, (Arc::clone(src), Arc::clone(&node)));
            base = Some(node);
        }
        base
    }

    pub fn len(&self) -> usize {
        self.memo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memo.is_empty()
    }
}
