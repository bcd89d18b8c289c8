//! Hierarchical softmax: a balanced binary tree over the vocabulary.
//!
//! Each internal node scores the left/right branch decision with
//! `sigmoid(weights · h)`; the probability of a word is the product of the
//! branch probabilities along its root→leaf path, so training touches
//! O(log V) weight vectors per target instead of all V output rows.
//!
//! Nodes live in an arena (`Vec<TreeNode>`) and refer to each other by
//! `NodeId`. Topology is fixed at construction; only node weights and the
//! per-node gradient accumulators change afterwards.
//!
//! ```text
//! loss(word, h) = Σ_{ancestors}  -ln sigmoid(sign · w_node · h)
//!                 sign = +1 if the path goes left at that node, else -1
//! ```

use std::collections::BTreeSet;

use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::math::{add_scaled, dot, sigmoid};
use super::{check_index, ModelError};

/// Std-dev of the Gaussian used to initialize node weight vectors.
const NODE_INIT_STD: f64 = 0.1;

/// Index of a node inside the tree arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
enum NodeKind {
    Internal {
        left: NodeId,
        right: NodeId,
        weights: Vec<f64>,
        /// Unset until the first accumulation of a round.
        grad: Option<Vec<f64>>,
    },
    Leaf {
        word: usize,
    },
}

#[derive(Debug, Clone)]
struct TreeNode {
    parent: Option<NodeId>,
    /// Whether this node is its parent's left child.
    is_left: bool,
    kind: NodeKind,
}

#[derive(Debug, Clone)]
pub struct HierarchicalSoftmaxTree {
    nodes: Vec<TreeNode>,
    root: NodeId,
    /// Vocabulary index → leaf.
    leaves: Vec<NodeId>,
    hidden_dim: usize,
}

impl HierarchicalSoftmaxTree {
    /// Build a balanced tree with exactly `vocab_size` leaves. Words are
    /// split by index range, so leaf order follows vocabulary order.
    pub fn new<R: Rng + ?Sized>(
        vocab_size: usize,
        hidden_dim: usize,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        if vocab_size == 0 || hidden_dim == 0 {
            return Err(ModelError::Construction(format!(
                "tree needs a non-empty vocabulary and hidden layer, got V={} D={}",
                vocab_size, hidden_dim
            )));
        }
        let normal = Normal::new(0.0, NODE_INIT_STD)
            .map_err(|e| ModelError::Construction(format!("node init distribution: {}", e)))?;

        let mut tree = Self {
            nodes: Vec::with_capacity(2 * vocab_size - 1),
            root: NodeId(0),
            leaves: vec![NodeId(0); vocab_size],
            hidden_dim,
        };
        tree.root = tree.build(0, vocab_size, None, false, &normal, rng);
        Ok(tree)
    }

    fn build<R: Rng + ?Sized>(
        &mut self,
        lo: usize,
        hi: usize,
        parent: Option<NodeId>,
        is_left: bool,
        normal: &Normal<f64>,
        rng: &mut R,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        if hi - lo == 1 {
            self.nodes.push(TreeNode { parent, is_left, kind: NodeKind::Leaf { word: lo } });
            self.leaves[lo] = id;
            return id;
        }

        let weights = (0..self.hidden_dim).map(|_| normal.sample(rng)).collect();
        // Children are patched in once built.
        self.nodes.push(TreeNode {
            parent,
            is_left,
            kind: NodeKind::Internal { left: id, right: id, weights, grad: None },
        });

        let mid = lo + (hi - lo) / 2;
        let left_child = self.build(lo, mid, Some(id), true, normal, rng);
        let right_child = self.build(mid, hi, Some(id), false, normal, rng);
        if let NodeKind::Internal { left, right, .. } = &mut self.nodes[id.0].kind {
            *left = left_child;
            *right = right_child;
        }
        id
    }

    pub fn vocab_size(&self) -> usize {
        self.leaves.len()
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn num_internal(&self) -> usize {
        self.nodes.len() - self.leaves.len()
    }

    fn leaf(&self, word: usize) -> Result<NodeId, ModelError> {
        check_index(word, self.vocab_size())?;
        Ok(self.leaves[word])
    }

    /// Ancestors of a word's leaf, bottom-up, each paired with the branch
    /// taken into it (`true` = left).
    fn path(&self, word: usize) -> Result<Vec<(NodeId, bool)>, ModelError> {
        let mut cur = self.leaf(word)?;
        let mut path = Vec::new();
        while let Some(parent) = self.nodes[cur.0].parent {
            path.push((parent, self.nodes[cur.0].is_left));
            cur = parent;
        }
        Ok(path)
    }

    /// Number of branch decisions between the root and `word`.
    pub fn depth(&self, word: usize) -> Result<usize, ModelError> {
        Ok(self.path(word)?.len())
    }

    /// Binary code of `word`, root to leaf (`true` = left).
    pub fn code(&self, word: usize) -> Result<Vec<bool>, ModelError> {
        let mut code: Vec<bool> = self.path(word)?.into_iter().map(|(_, left)| left).collect();
        code.reverse();
        Ok(code)
    }

    /// Follow a root→leaf code; `None` if it stops early or overruns a leaf.
    pub fn decode(&self, code: &[bool]) -> Option<usize> {
        let mut cur = self.root;
        for &go_left in code {
            match &self.nodes[cur.0].kind {
                NodeKind::Internal { left, right, .. } => {
                    cur = if go_left { *left } else { *right };
                }
                NodeKind::Leaf { .. } => return None,
            }
        }
        match self.nodes[cur.0].kind {
            NodeKind::Leaf { word } => Some(word),
            NodeKind::Internal { .. } => None,
        }
    }

    pub fn weights(&self, node: NodeId) -> Option<&[f64]> {
        match &self.nodes.get(node.0)?.kind {
            NodeKind::Internal { weights, .. } => Some(weights),
            NodeKind::Leaf { .. } => None,
        }
    }

    pub fn weights_mut(&mut self, node: NodeId) -> Option<&mut [f64]> {
        match &mut self.nodes.get_mut(node.0)?.kind {
            NodeKind::Internal { weights, .. } => Some(weights),
            NodeKind::Leaf { .. } => None,
        }
    }

    pub fn grad(&self, node: NodeId) -> Option<&[f64]> {
        match &self.nodes.get(node.0)?.kind {
            NodeKind::Internal { grad, .. } => grad.as_deref(),
            NodeKind::Leaf { .. } => None,
        }
    }

    /// Internal nodes in depth-first pre-order (root, left, right).
    pub fn internal_nodes(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.num_internal());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let NodeKind::Internal { left, right, .. } = &self.nodes[id.0].kind {
                order.push(id);
                stack.push(*right);
                stack.push(*left);
            }
        }
        order
    }

    /// Internal nodes whose gradient has been written this round, pre-order.
    pub fn touched_nodes(&self) -> Vec<NodeId> {
        self.internal_nodes().into_iter().filter(|&id| self.grad(id).is_some()).collect()
    }

    /// `Σ_{ancestors} -ln sigmoid(sign · w · h)` for a single target word.
    pub fn path_probability_loss(&self, word: usize, hidden: &[f64]) -> Result<f64, ModelError> {
        let mut loss = 0.0;
        for (node, went_left) in self.path(word)? {
            let sign = if went_left { 1.0 } else { -1.0 };
            let w = self.weights(node).unwrap_or_default();
            loss -= sigmoid(sign * dot(w, hidden)).ln();
        }
        Ok(loss)
    }

    /// Backprop one target through its path.
    ///
    /// For each ancestor, `s = sigmoid(w · h) - t` (t = 1 on a left branch):
    /// `s · h` is summed into the node's gradient and `s · w` into
    /// `upstream`, the gradient flowing back into the recurrence.
    pub fn accumulate_gradient(
        &mut self,
        word: usize,
        hidden: &[f64],
        upstream: &mut [f64],
    ) -> Result<(), ModelError> {
        for (node, went_left) in self.path(word)? {
            let t = if went_left { 1.0 } else { 0.0 };
            if let NodeKind::Internal { weights, grad, .. } = &mut self.nodes[node.0].kind {
                let s = sigmoid(dot(weights, hidden)) - t;
                let g = grad.get_or_insert_with(|| vec![0.0; hidden.len()]);
                add_scaled(g, hidden, s);
                add_scaled(upstream, weights, s);
            }
        }
        Ok(())
    }

    /// Full distribution over the vocabulary for one hidden state.
    ///
    /// O(V·D): every leaf multiplies the branch factors along its path. Only
    /// the generator uses this; training never materializes it.
    pub fn sample_distribution(&self, hidden: &[f64]) -> Vec<f64> {
        let mut probs = vec![0.0; self.vocab_size()];
        let mut stack = vec![(self.root, 1.0_f64)];
        while let Some((id, p)) = stack.pop() {
            match &self.nodes[id.0].kind {
                NodeKind::Internal { left, right, weights, .. } => {
                    let go_left = sigmoid(dot(weights, hidden));
                    stack.push((*left, p * go_left));
                    stack.push((*right, p * (1.0 - go_left)));
                }
                NodeKind::Leaf { word } => probs[*word] = p,
            }
        }
        probs
    }

    /// Clear every node gradient back to unset.
    pub fn reset_gradients(&mut self) {
        for node in &mut self.nodes {
            if let NodeKind::Internal { grad, .. } = &mut node.kind {
                *grad = None;
            }
        }
    }

    /// Add `lambda · w` once to each node on the path of any word in
    /// `targets`, i.e. the nodes one sequence visits.
    pub fn add_l2_gradient(&mut self, targets: &[usize], lambda: f64) -> Result<(), ModelError> {
        let mut visited = BTreeSet::new();
        for &word in targets {
            visited.extend(self.path(word)?.into_iter().map(|(node, _)| node));
        }
        let dim = self.hidden_dim;
        for id in visited {
            if let NodeKind::Internal { weights, grad, .. } = &mut self.nodes[id.0].kind {
                let g = grad.get_or_insert_with(|| vec![0.0; dim]);
                add_scaled(g, weights, lambda);
            }
        }
        Ok(())
    }

    /// `w -= lr · grad` for every node with a gradient.
    pub fn apply_gradients(&mut self, learning_rate: f64) {
        for node in &mut self.nodes {
            if let NodeKind::Internal { weights, grad: Some(g), .. } = &mut node.kind {
                add_scaled(weights, g, -learning_rate);
            }
        }
    }

    /// `Σ ||w||²` over all internal nodes.
    pub fn sum_squared_weights(&self) -> f64 {
        self.nodes
            .iter()
            .map(|node| match &node.kind {
                NodeKind::Internal { weights, .. } => weights.iter().map(|v| v * v).sum(),
                NodeKind::Leaf { .. } => 0.0,
            })
            .sum()
    }
}
