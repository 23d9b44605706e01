//! Write-ordering constraints between buffer frames.
//!
//! An edge `(must_precede, must_follow)` says the page in `must_precede`
//! has to reach disk no later than the page in `must_follow`. Edges live in
//! an arena addressed by stable indices; freed slots go on a free list and
//! are reused. The graph is kept acyclic: `add` refuses any edge that would
//! close a cycle.

use std::collections::HashSet;

use thiserror::Error;

use crate::common::types::FrameId;

pub type EdgeId = u32;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecedenceError {
    #[error("Edge {must_precede} -> {must_follow} would close a cycle")]
    Cycle { must_precede: FrameId, must_follow: FrameId },
    #[error("Frame {0} cannot precede itself")]
    SelfEdge(FrameId),
}

#[derive(Debug, Clone, Copy)]
struct Edge {
    must_precede: FrameId,
    must_follow: FrameId,
}

#[derive(Debug)]
pub struct PrecedenceGraph {
    edges: Vec<Option<Edge>>,
    free: Vec<EdgeId>,
    // Per frame: edges where the frame must be written first
    outgoing: Vec<Vec<EdgeId>>,
    // Per frame: edges where the frame waits on another
    incoming: Vec<Vec<EdgeId>>,
}

impl PrecedenceGraph {
    pub fn new(frame_count: usize) -> Self {
        Self {
            edges: Vec::new(),
            free: Vec::new(),
            outgoing: vec![Vec::new(); frame_count],
            incoming: vec![Vec::new(); frame_count],
        }
    }

    /// Register that `must_precede` is written no later than `must_follow`.
    ///
    /// Adding an edge that already exists returns the existing edge.
    pub fn add(&mut self, must_precede: FrameId, must_follow: FrameId) -> Result<EdgeId, PrecedenceError> {
        if must_precede == must_follow {
            return Err(PrecedenceError::SelfEdge(must_precede));
        }
        if let Some(existing) = self.find(must_precede, must_follow) {
            return Ok(existing);
        }
        if self.exists_dependency(must_follow, must_precede) {
            return Err(PrecedenceError::Cycle { must_precede, must_follow });
        }

        let edge = Edge { must_precede, must_follow };
        let id = match self.free.pop() {
            Some(id) => {
                self.edges[id as usize] = Some(edge);
                id
            }
            None => {
                self.edges.push(Some(edge));
                (self.edges.len() - 1) as EdgeId
            }
        };
        self.outgoing[must_precede as usize].push(id);
        self.incoming[must_follow as usize].push(id);
        Ok(id)
    }

    /// Drop one edge and return its slot to the free list
    pub fn detach(&mut self, id: EdgeId) {
        let Some(edge) = self.edges.get_mut(id as usize).and_then(Option::take) else {
            return;
        };
        self.outgoing[edge.must_precede as usize].retain(|&e| e != id);
        self.incoming[edge.must_follow as usize].retain(|&e| e != id);
        self.free.push(id);
    }

    /// Drop every edge touching `frame`; returns how many were dropped.
    pub fn clear_frame(&mut self, frame: FrameId) -> usize {
        let mut ids = std::mem::take(&mut self.outgoing[frame as usize]);
        ids.append(&mut std::mem::take(&mut self.incoming[frame as usize]));
        let count = ids.len();
        for id in ids {
            self.detach(id);
        }
        count
    }

    /// Frames that must be written before `frame`
    pub fn predecessors(&self, frame: FrameId) -> Vec<FrameId> {
        self.incoming[frame as usize]
            .iter()
            .filter_map(|&id| self.edges[id as usize].map(|e| e.must_precede))
            .collect()
    }

    /// Frames that must not be written before `frame`
    pub fn successors(&self, frame: FrameId) -> Vec<FrameId> {
        self.outgoing[frame as usize]
            .iter()
            .filter_map(|&id| self.edges[id as usize].map(|e| e.must_follow))
            .collect()
    }

    pub fn has_predecessors(&self, frame: FrameId) -> bool {
        !self.incoming[frame as usize].is_empty()
    }

    /// Follow the first predecessor of each frame until reaching one that
    /// nothing has to precede. Returns `frame` itself if it has none.
    pub fn terminal_predecessor(&self, frame: FrameId) -> FrameId {
        let mut current = frame;
        while let Some(&id) = self.incoming[current as usize].first() {
            match self.edges[id as usize] {
                Some(edge) => current = edge.must_precede,
                None => break,
            }
        }
        current
    }

    /// Whether `to` is reachable from `from` along must-follow edges, i.e.
    /// `from` is (transitively) ordered before `to`.
    pub fn exists_dependency(&self, from: FrameId, to: FrameId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(frame) = stack.pop() {
            if !seen.insert(frame) {
                continue;
            }
            for next in self.successors(frame) {
                if next == to {
                    return true;
                }
                stack.push(next);
            }
        }
        false
    }

    /// Length (in edges) of the longest ordering chain in the graph
    pub fn longest_chain(&self) -> usize {
        let mut memo: Vec<Option<usize>> = vec![None; self.outgoing.len()];
        (0..self.outgoing.len())
            .map(|frame| self.depth(frame as FrameId, &mut memo))
            .max()
            .unwrap_or(0)
    }

    fn depth(&self, frame: FrameId, memo: &mut Vec<Option<usize>>) -> usize {
        if let Some(depth) = memo[frame as usize] {
            return depth;
        }
        let depth = self
            .successors(frame)
            .into_iter()
            .map(|next| self.depth(next, memo) + 1)
            .max()
            .unwrap_or(0);
        memo[frame as usize] = Some(depth);
        depth
    }

    pub fn live_edges(&self) -> usize {
        self.edges.len() - self.free.len()
    }

    pub fn free_edges(&self) -> usize {
        self.free.len()
    }

    fn find(&self, must_precede: FrameId, must_follow: FrameId) -> Option<EdgeId> {
        self.outgoing[must_precede as usize]
            .iter()
            .copied()
            .find(|&id| matches!(self.edges[id as usize], Some(e) if e.must_follow == must_follow))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_query() {
        let mut graph = PrecedenceGraph::new(8);
        graph.add(1, 2).unwrap();
        graph.add(2, 3).unwrap();

        assert_eq!(graph.predecessors(2), vec![1]);
        assert_eq!(graph.successors(2), vec![3]);
        assert!(graph.exists_dependency(1, 3));
        assert!(!graph.exists_dependency(3, 1));
        assert_eq!(graph.terminal_predecessor(3), 1);
        assert_eq!(graph.terminal_predecessor(5), 5);
        assert_eq!(graph.longest_chain(), 2);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut graph = PrecedenceGraph::new(4);
        graph.add(0, 1).unwrap();
        graph.add(1, 2).unwrap();

        assert_eq!(
            graph.add(2, 0),
            Err(PrecedenceError::Cycle { must_precede: 2, must_follow: 0 })
        );
        assert_eq!(graph.add(3, 3), Err(PrecedenceError::SelfEdge(3)));
        assert_eq!(graph.live_edges(), 2);
    }

    #[test]
    fn test_duplicate_edge_is_idempotent() {
        let mut graph = PrecedenceGraph::new(4);
        let first = graph.add(0, 1).unwrap();
        let second = graph.add(0, 1).unwrap();
        assert_eq!(first, second);
        assert_eq!(graph.live_edges(), 1);
    }

    #[test]
    fn test_clear_frame_recycles_slots() {
        let mut graph = PrecedenceGraph::new(6);
        graph.add(0, 1).unwrap();
        graph.add(1, 2).unwrap();
        graph.add(3, 1).unwrap();

        assert_eq!(graph.clear_frame(1), 3);
        assert_eq!(graph.live_edges(), 0);
        assert_eq!(graph.free_edges(), 3);
        assert!(!graph.has_predecessors(2));

        // Freed slots are handed out again
        let reused = graph.add(4, 5).unwrap();
        assert!(reused < 3);
        assert_eq!(graph.free_edges(), 2);
    }
}
