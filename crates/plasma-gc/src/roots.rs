//! A stack of root words.

use crate::trace::{HeapMarkState, Tracer};

// ============================================================================
// RootStack - explicit root registration
// ============================================================================

/// A list of words the collector treats as roots.
///
/// Words may be plain cell addresses or tagged pointers; anything that does
/// not resolve to an allocated cell is ignored during marking. Frames let a
/// caller drop every root pushed since a point in one step.
///
/// ```
/// use plasma_gc::RootStack;
///
/// let mut roots = RootStack::new();
/// roots.push(0x1000);
/// roots.push_frame();
/// roots.push(0x2000);
/// roots.push(0x3000);
/// roots.pop_frame();
/// assert_eq!(roots.len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RootStack {
    roots: Vec<usize>,
    frame_markers: Vec<usize>,
}

impl RootStack {
    /// Create an empty stack.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            roots: Vec::new(),
            frame_markers: Vec::new(),
        }
    }

    /// Register a root.
    pub fn push(&mut self, word: usize) {
        self.roots.push(word);
    }

    /// Register a cell address as a root.
    pub fn push_ptr<T>(&mut self, ptr: std::ptr::NonNull<T>) {
        self.push(ptr.as_ptr() as usize);
    }

    /// Unregister the most recent occurrence of `word`. Returns whether it
    /// was present.
    pub fn remove(&mut self, word: usize) -> bool {
        match self.roots.iter().rposition(|&r| r == word) {
            Some(pos) => {
                self.roots.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of roots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Whether there are no roots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Iterate over all roots.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.roots.iter().copied()
    }

    /// Remove all roots and frames.
    pub fn clear(&mut self) {
        self.roots.clear();
        self.frame_markers.clear();
    }

    /// Remember the current height.
    pub fn push_frame(&mut self) {
        self.frame_markers.push(self.roots.len());
    }

    /// Drop every root pushed since the matching [`push_frame`](Self::push_frame).
    pub fn pop_frame(&mut self) {
        if let Some(marker) = self.frame_markers.pop() {
            self.roots.truncate(marker);
        }
    }
}

impl Tracer for RootStack {
    fn do_trace(&self, marker: &mut HeapMarkState<'_>) {
        for word in self.iter() {
            marker.mark_word(word);
        }
    }
}
