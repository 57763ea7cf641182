use glam::Vec2;

use crate::geometry::Segment;

/// Result of testing one tick of motion against the gates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Crossing {
    pub forward: bool,
    pub progress: f32,
    pub backward: bool,
}

/// Ordered gates that must be crossed in racing order.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    gates: Vec<Segment>,
    next_index: usize,
}

impl CheckpointManager {
    pub fn new(gates: Vec<Segment>) -> Self {
        Self {
            gates,
            next_index: 0,
        }
    }

    pub fn gates(&self) -> &[Segment] {
        &self.gates
    }

    pub fn total(&self) -> usize {
        self.gates.len()
    }

    /// Index of the first gate not yet cleared.
    pub fn next_index(&self) -> usize {
        self.next_index
    }

    pub fn crossed_count(&self) -> usize {
        self.next_index
    }

    pub fn progress(&self) -> f32 {
        if self.gates.is_empty() {
            0.0
        } else {
            self.next_index as f32 / self.gates.len() as f32
        }
    }

    /// Test the motion `prev -> cur`. Backward crossings are reported against
    /// already-cleared gates and never move `next_index` back; a forward
    /// crossing of the next gate advances it by one.
    pub fn check_crossing(&mut self, prev: Vec2, cur: Vec2) -> Crossing {
        let motion = Segment::new(prev, cur);
        let backward = self.gates[..self.next_index]
            .iter()
            .any(|gate| gate.intersects(&motion));

        let forward = self
            .gates
            .get(self.next_index)
            .is_some_and(|gate| gate.intersects(&motion));
        if forward {
            self.next_index += 1;
        }

        Crossing {
            forward,
            progress: self.progress(),
            backward,
        }
    }

    pub fn reset(&mut self) {
        self.next_index = 0;
    }
}
