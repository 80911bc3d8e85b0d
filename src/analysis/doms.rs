//! Dominator Tree
//!
//! Immediate dominators are computed with the standard iterative
//! data-flow algorithm over the CFG in reverse postorder (Cooper,
//! Harvey and Kennedy's formulation): every block's idom is repeatedly
//! intersected with its processed predecessors until nothing changes.
//!
//! Children lists preserve CFG block order so tree traversals are
//! deterministic. Post-dominator information is computed on request by
//! running the same algorithm over the reversed CFG from a virtual exit.

use crate::ir::{BlockId, FuncId, Module};
use std::collections::HashMap;

/// Dominator information for one function
#[derive(Clone, Debug)]
pub struct DomTree {
    /// Entry block of the function
    pub root: BlockId,
    /// Reachable blocks in reverse postorder
    pub order: Vec<BlockId>,
    /// Immediate dominator of each reachable block (the root maps to
    /// itself)
    idom: HashMap<BlockId, BlockId>,
    /// Dominator-tree children, in CFG block order
    children: HashMap<BlockId, Vec<BlockId>>,
    /// Immediate post-dominators, when requested. Blocks whose only
    /// post-dominator is the virtual exit are absent.
    ipostdom: Option<HashMap<BlockId, BlockId>>,
}

impl DomTree {
    /// Build the dominator tree for `func`
    pub fn build(module: &Module, func: FuncId, with_postdom: bool) -> DomTree {
        let blocks = module.func(func).blocks.clone();
        let root = blocks[0];

        let order = reverse_postorder(module, root);
        let position: HashMap<BlockId, usize> =
            order.iter().enumerate().map(|(i, b)| (*b, i)).collect();

        let idom = compute_idoms(&order, &position, root, |b| {
            module
                .predecessors(b)
                .into_iter()
                .filter(|p| position.contains_key(p))
                .collect()
        });

        // Children in CFG block order.
        let mut children: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        for block in &blocks {
            if *block == root {
                continue;
            }
            if let Some(parent) = idom.get(block) {
                children.entry(*parent).or_default().push(*block);
            }
        }

        let ipostdom = with_postdom.then(|| compute_ipostdoms(module, &blocks));

        DomTree {
            root,
            order,
            idom,
            children,
            ipostdom,
        }
    }

    /// Immediate dominator of `block`; `None` for the root and for
    /// unreachable blocks
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        if block == self.root {
            return None;
        }
        self.idom.get(&block).copied()
    }

    /// Dominator-tree children of `block`
    pub fn children(&self, block: BlockId) -> &[BlockId] {
        self.children.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `a` dominates `b` (reflexive)
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cursor = b;
        loop {
            if cursor == a {
                return true;
            }
            match self.idom(cursor) {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }

    /// Immediate post-dominator of `block`, when post-dominators were
    /// requested
    pub fn ipostdom(&self, block: BlockId) -> Option<BlockId> {
        self.ipostdom.as_ref()?.get(&block).copied()
    }
}

fn reverse_postorder(module: &Module, root: BlockId) -> Vec<BlockId> {
    let mut postorder = Vec::new();
    let mut visited = vec![root];
    // Iterative DFS; the second stack element tracks whether children
    // were already expanded.
    let mut stack = vec![(root, false)];
    while let Some((block, expanded)) = stack.pop() {
        if expanded {
            postorder.push(block);
            continue;
        }
        stack.push((block, true));
        for succ in module.successors(block).into_iter().rev() {
            if !visited.contains(&succ) {
                visited.push(succ);
                stack.push((succ, false));
            }
        }
    }
    postorder.reverse();
    postorder
}

fn compute_idoms(
    order: &[BlockId],
    position: &HashMap<BlockId, usize>,
    root: BlockId,
    preds: impl Fn(BlockId) -> Vec<BlockId>,
) -> HashMap<BlockId, BlockId> {
    let mut idom: HashMap<BlockId, BlockId> = HashMap::new();
    idom.insert(root, root);

    let intersect = |idom: &HashMap<BlockId, BlockId>, mut a: BlockId, mut b: BlockId| {
        while a != b {
            while position[&a] > position[&b] {
                a = idom[&a];
            }
            while position[&b] > position[&a] {
                b = idom[&b];
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for block in order.iter().skip(1) {
            let mut new_idom = None;
            for pred in preds(*block) {
                if !idom.contains_key(&pred) {
                    continue;
                }
                new_idom = Some(match new_idom {
                    None => pred,
                    Some(current) => intersect(&idom, pred, current),
                });
            }
            if let Some(new_idom) = new_idom
                && idom.get(block) != Some(&new_idom)
            {
                idom.insert(*block, new_idom);
                changed = true;
            }
        }
    }

    idom
}

/// Post-dominators via the same iteration on the reversed CFG. Exit
/// blocks (no successors) attach to a virtual exit, which the result
/// leaves implicit.
fn compute_ipostdoms(module: &Module, blocks: &[BlockId]) -> HashMap<BlockId, BlockId> {
    let exits: Vec<BlockId> = blocks
        .iter()
        .copied()
        .filter(|b| module.successors(*b).is_empty())
        .collect();
    if exits.is_empty() {
        return HashMap::new();
    }

    // Postorder of the reversed graph, rooted at each exit.
    let mut order: Vec<BlockId> = Vec::new();
    let mut visited: Vec<BlockId> = exits.clone();
    let mut stack: Vec<(BlockId, bool)> = exits.iter().map(|e| (*e, false)).collect();
    while let Some((block, expanded)) = stack.pop() {
        if expanded {
            order.push(block);
            continue;
        }
        stack.push((block, true));
        for pred in module.predecessors(block).into_iter().rev() {
            if !visited.contains(&pred) {
                visited.push(pred);
                stack.push((pred, false));
            }
        }
    }
    order.reverse();

    let position: HashMap<BlockId, usize> =
        order.iter().enumerate().map(|(i, b)| (*b, i)).collect();

    let mut ipdom: HashMap<BlockId, BlockId> = HashMap::new();
    for exit in &exits {
        ipdom.insert(*exit, *exit);
    }

    let intersect = |ipdom: &HashMap<BlockId, BlockId>, mut a: BlockId, mut b: BlockId| {
        while a != b {
            while position[&a] > position[&b] {
                a = ipdom[&a];
            }
            while position[&b] > position[&a] {
                b = ipdom[&b];
            }
        }
        a
    };

    let mut changed = true;
    while changed {
        changed = false;
        for block in &order {
            if exits.contains(block) {
                continue;
            }
            let mut new_ipdom = None;
            for succ in module.successors(*block) {
                if !ipdom.contains_key(&succ) {
                    continue;
                }
                new_ipdom = Some(match new_ipdom {
                    None => succ,
                    Some(current) => intersect(&ipdom, succ, current),
                });
            }
            if let Some(new_ipdom) = new_ipdom
                && ipdom.get(block) != Some(&new_ipdom)
            {
                ipdom.insert(*block, new_ipdom);
                changed = true;
            }
        }
    }

    for exit in &exits {
        ipdom.remove(exit);
    }
    ipdom
}
