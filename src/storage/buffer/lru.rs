use super::replacer::{FrameId, Replacer};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Node {
    prev: Option<FrameId>,
    next: Option<FrameId>,
}

/// Least-recently-unpinned replacer.
///
/// Evictable frames form a doubly linked list threaded through `nodes`; the
/// head is the frame unpinned longest ago. Every operation is O(1).
#[derive(Debug)]
pub struct LruReplacer {
    nodes: HashMap<FrameId, Node>,
    head: Option<FrameId>,
    tail: Option<FrameId>,
    /// Maximum number of frames
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            nodes: HashMap::with_capacity(max_size),
            head: None,
            tail: None,
            max_size,
        }
    }

    fn push_back(&mut self, frame_id: FrameId) {
        let node = Node {
            prev: self.tail,
            next: None,
        };
        match self.tail {
            Some(tail) => {
                if let Some(tail_node) = self.nodes.get_mut(&tail) {
                    tail_node.next = Some(frame_id);
                }
            }
            None => self.head = Some(frame_id),
        }
        self.tail = Some(frame_id);
        self.nodes.insert(frame_id, node);
    }

    fn unlink(&mut self, frame_id: FrameId) -> bool {
        let Some(node) = self.nodes.remove(&frame_id) else {
            return false;
        };

        match node.prev {
            Some(prev) => {
                if let Some(prev_node) = self.nodes.get_mut(&prev) {
                    prev_node.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(next_node) = self.nodes.get_mut(&next) {
                    next_node.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }

        true
    }
}

impl Replacer for LruReplacer {
    fn victim(&mut self) -> Option<FrameId> {
        let frame_id = self.head?;
        self.unlink(frame_id);
        Some(frame_id)
    }

    fn pin(&mut self, frame_id: FrameId) {
        self.unlink(frame_id);
    }

    fn unpin(&mut self, frame_id: FrameId) {
        if !self.nodes.contains_key(&frame_id) && self.nodes.len() < self.max_size {
            self.push_back(frame_id);
        }
    }

    fn size(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_lru_operations() {
        let mut replacer = LruReplacer::new(3);

        // Initially empty
        assert_eq!(replacer.size(), 0);
        assert_eq!(replacer.victim(), None);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);
        assert_eq!(replacer.size(), 3);

        // First unpinned is first evicted
        assert_eq!(replacer.victim(), Some(1));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_pin_unpin() {
        let mut replacer = LruReplacer::new(3);

        replacer.unpin(1);
        replacer.unpin(2);
        assert_eq!(replacer.size(), 2);

        replacer.pin(1);
        assert_eq!(replacer.size(), 1);

        // Only frame 2 should be evictable
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), None);

        // Unpin frame 1 again
        replacer.unpin(1);
        assert_eq!(replacer.victim(), Some(1));
    }

    #[test]
    fn test_duplicate_unpin_keeps_position() {
        let mut replacer = LruReplacer::new(3);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(1);
        assert_eq!(replacer.size(), 2);
        assert_eq!(replacer.victim(), Some(1));
    }

    #[test]
    fn test_pin_non_existent() {
        let mut replacer = LruReplacer::new(2);

        replacer.pin(999);
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_max_size_limit() {
        let mut replacer = LruReplacer::new(2);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3); // Ignored due to max size

        assert_eq!(replacer.size(), 2);
    }

    #[test]
    fn test_pin_head_middle_and_tail() {
        let mut replacer = LruReplacer::new(5);
        for frame in 1..=5 {
            replacer.unpin(frame);
        }

        replacer.pin(1);
        replacer.pin(3);
        replacer.pin(5);
        assert_eq!(replacer.size(), 2);

        replacer.unpin(3);
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(4));
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), None);
    }

    #[test]
    fn test_complex_scenario() {
        let mut replacer = LruReplacer::new(3);

        replacer.unpin(1);
        replacer.unpin(2);
        replacer.unpin(3);

        // Pin middle frame
        replacer.pin(2);
        assert_eq!(replacer.size(), 2);

        assert_eq!(replacer.victim(), Some(1));

        replacer.unpin(2);
        replacer.unpin(4);

        // Should evict in order: 3, 2, 4
        assert_eq!(replacer.victim(), Some(3));
        assert_eq!(replacer.victim(), Some(2));
        assert_eq!(replacer.victim(), Some(4));
    }
}
