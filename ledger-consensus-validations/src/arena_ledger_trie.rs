use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use generational_arena::{Arena, Index};

use ledger_consensus_core::{Ledger, LedgerIndex};

use crate::ledger_trie::LedgerTrie;
use crate::span::{Span, SpanTip};

#[derive(Debug)]
struct Node<T: Ledger> {
    idx: Index,
    span: Span<T>,
    tip_support: u32,
    branch_support: u32,
    children: Vec<Index>,
    parent: Option<Index>,
}

impl<T: Ledger> Node<T> {
    fn from_span(idx: Index, span: Span<T>, parent: Option<Index>) -> Self {
        Node {
            idx,
            span,
            tip_support: 0,
            branch_support: 0,
            children: vec![],
            parent,
        }
    }
}

/// A `LedgerTrie` whose nodes live in a `generational_arena::Arena` and refer to
/// each other by `Index`, which sidesteps shared ownership between parents and
/// children.
#[derive(Debug)]
pub struct ArenaLedgerTrie<T: Ledger> {
    root: Index,
    arena: Arena<Node<T>>,
    /// Count of tip support for each sequence number. Ordered so that
    /// `get_preferred` can walk it alongside the trie.
    seq_support: BTreeMap<LedgerIndex, u32>,
}

impl<T: Ledger> Default for ArenaLedgerTrie<T> {
    fn default() -> Self {
        let mut arena = Arena::new();
        let root = arena.insert_with(|idx| Node::from_span(idx, Span::default(), None));
        ArenaLedgerTrie {
            root,
            arena,
            seq_support: BTreeMap::new(),
        }
    }
}

impl<T: Ledger> LedgerTrie<T> for ArenaLedgerTrie<T> {

    fn insert(&mut self, ledger: &T, count: Option<u32>) {
        let count = count.unwrap_or(1);

        // Find the ID of the node with the longest common ancestry with `ledger`
        // and the sequence of the first ledger difference
        let (loc_idx, diff_seq) = self.find(ledger);

        let mut inc_node_idx = loc_idx;

        // loc.span has the longest common prefix with Span{ledger} of all
        // existing nodes in the trie. The Option<Span>'s below represent
        // the possible common suffixes between loc.span and Span{ledger}.
        //
        // loc.span
        //  a b c  | d e f
        //  prefix | old_suffix
        //
        // Span{ledger}
        //  a b c  | g h i
        //  prefix | new_suffix
        let loc_span = self.arena[loc_idx].span.clone();
        let prefix = loc_span.before(diff_seq);
        let old_suffix = loc_span.from_seq(diff_seq);
        let new_suffix = Span::from(ledger.clone()).from_seq(diff_seq);

        if let Some(old_suffix) = old_suffix {
            // Have
            //   abcdef -> ....
            // Inserting
            //   abc
            // Becomes
            //   abc -> def -> ...

            // Create an old_suffix node that takes over loc's support and
            // children and becomes loc's only child.
            let (tip_support, branch_support, children) = {
                let loc = &mut self.arena[loc_idx];
                (loc.tip_support, loc.branch_support, std::mem::take(&mut loc.children))
            };
            let new_node_idx = self.arena.insert_with(|idx| Node {
                idx,
                span: old_suffix,
                tip_support,
                branch_support,
                children: children.clone(),
                parent: Some(loc_idx),
            });
            for child_idx in children {
                self.arena[child_idx].parent = Some(new_node_idx);
            }

            // loc truncates to prefix and new_node is its child. A prefix always
            // exists since every ledger shares the genesis ledger with the root.
            let loc = &mut self.arena[loc_idx];
            if let Some(prefix) = prefix {
                loc.span = prefix;
            }
            loc.children.push(new_node_idx);
            loc.tip_support = 0;
        }

        if let Some(new_suffix) = new_suffix {
            // Have
            //  abc -> ...
            // Inserting
            //  abcdef-> ...
            // Becomes
            //  abc -> ...
            //     \-> def
            let new_node_idx = self.arena.insert_with(|idx| Node::from_span(idx, new_suffix, Some(loc_idx)));
            self.arena[loc_idx].children.push(new_node_idx);
            inc_node_idx = new_node_idx;
        }

        self.arena[inc_node_idx].tip_support += count;
        let mut curr = Some(inc_node_idx);
        while let Some(idx) = curr {
            let node = &mut self.arena[idx];
            node.branch_support += count;
            curr = node.parent;
        }

        *self.seq_support.entry(ledger.seq()).or_insert(0) += count;
    }

    fn remove(&mut self, ledger: &T, count: Option<u32>) -> bool {
        let loc_idx = match self.find_by_ledger_id(ledger, self.root) {
            Some(idx) if self.arena[idx].tip_support > 0 => idx,
            // Must be exact match with tip support
            _ => return false,
        };

        let count = std::cmp::min(count.unwrap_or(1), self.arena[loc_idx].tip_support);
        self.arena[loc_idx].tip_support -= count;

        if let Entry::Occupied(mut e) = self.seq_support.entry(ledger.seq()) {
            *e.get_mut() = e.get().saturating_sub(count);
            if *e.get() == 0 {
                e.remove();
            }
        }

        let mut curr = Some(loc_idx);
        while let Some(idx) = curr {
            let node = &mut self.arena[idx];
            node.branch_support -= count;
            curr = node.parent;
        }

        // Compress the trie now that loc may no longer be needed
        let mut loc = loc_idx;
        while self.arena[loc].tip_support == 0 && loc != self.root {
            let parent = match self.arena[loc].parent {
                Some(parent) => parent,
                None => break,
            };

            match self.arena[loc].children.len() {
                0 => {
                    // this node can be erased
                    self.erase_child(parent, loc);
                }
                1 => {
                    // This node can be combined with its child
                    let child = self.arena[loc].children[0];
                    let merged = Span::merge(&self.arena[loc].span, &self.arena[child].span);
                    let child_node = &mut self.arena[child];
                    child_node.span = merged;
                    child_node.parent = Some(parent);
                    self.arena[parent].children.push(child);
                    self.erase_child(parent, loc);
                }
                _ => break,
            }
            loc = parent;
        }
        true
    }

    fn tip_support(&self, ledger: &T) -> u32 {
        self.find_by_ledger_id(ledger, self.root)
            .map_or(0, |idx| self.arena[idx].tip_support)
    }

    fn branch_support(&self, ledger: &T) -> u32 {
        let loc = self.find_by_ledger_id(ledger, self.root).or_else(|| {
            // Check that ledger is a proper prefix of the closest node
            let (idx, diff_seq) = self.find(ledger);
            let end = self.arena[idx].span.end();
            (diff_seq > ledger.seq() && ledger.seq() < end).then_some(idx)
        });
        loc.map_or(0, |idx| self.arena[idx].branch_support)
    }

    fn get_preferred(&self, largest_issued: LedgerIndex) -> Option<SpanTip<T>> {
        if self.is_empty() {
            return None;
        }

        let mut curr = self.root;
        let mut uncommitted: u32 = 0;
        let mut uncommitted_it = self.seq_support.iter().peekable();

        loop {
            let node = &self.arena[curr];

            // Within a single span, the preferred ledger is decided by seq support
            let mut next_seq = node.span.start() + 1;
            let committed_below = std::cmp::max(next_seq, largest_issued);
            // Add any initial uncommitted support prior for ledgers earlier
            // than next_seq or earlier than largest_issued
            while let Some((_, support)) = uncommitted_it.next_if(|(seq, _)| **seq < committed_below) {
                uncommitted += *support;
            }

            // Advance next_seq along the span
            while next_seq < node.span.end() && node.branch_support > uncommitted {
                // Jump to the next seq_support change
                let end = node.span.end();
                match uncommitted_it.next_if(|(seq, _)| **seq < end) {
                    Some((seq, support)) => {
                        next_seq = *seq + 1;
                        uncommitted += *support;
                    }
                    None => next_seq = end,
                }
            }

            // We did not consume the entire span, so we have found the preferred ledger
            if next_seq < node.span.end() {
                return node.span.before(next_seq).map(|span| span.tip());
            }

            // We have reached the end of the current span, so we need to find the best child
            let mut margin = 0;
            let mut best = None;
            if node.children.len() == 1 {
                best = Some(node.children[0]);
                margin = self.arena[node.children[0]].branch_support;
            } else if !node.children.is_empty() {
                // Sort placing children with largest branch support in the front,
                // breaking ties with the span's starting ID
                let mut children = node.children.clone();
                children.sort_by(|a, b| {
                    let (a, b) = (&self.arena[*a], &self.arena[*b]);
                    b.branch_support.cmp(&a.branch_support)
                        .then_with(|| b.span.start_id().cmp(&a.span.start_id()))
                });

                let (first, second) = (&self.arena[children[0]], &self.arena[children[1]]);
                best = Some(children[0]);
                margin = first.branch_support - second.branch_support;

                // If best holds the tie-breaker, it gets one larger margin since
                // the second best needs additional branch support to overcome
                // the tie
                if first.span.start_id() > second.span.start_id() {
                    margin += 1;
                }
            }

            // If the best child has margin exceeding the uncommitted support,
            // continue from that child, otherwise we are done
            match best {
                Some(best) if margin > uncommitted || uncommitted == 0 => curr = best,
                _ => break,
            }
        }

        Some(self.arena[curr].span.tip())
    }

    fn is_empty(&self) -> bool {
        self.arena[self.root].branch_support == 0
    }

    fn check_invariants(&self) -> bool {
        let mut expected_seq_support: BTreeMap<LedgerIndex, u32> = BTreeMap::new();

        for (idx, node) in self.arena.iter() {
            if node.idx != idx || node.tip_support > node.branch_support {
                return false;
            }

            // branch_support = tip + sum(child.branch)
            let child_support: u32 = node.children.iter()
                .map(|child| self.arena[*child].branch_support)
                .sum();
            if node.tip_support + child_support != node.branch_support {
                return false;
            }

            if node.children.iter().any(|child| self.arena[*child].parent != Some(idx)) {
                return false;
            }

            if node.tip_support != 0 {
                *expected_seq_support.entry(node.span.end() - 1).or_insert(0) += node.tip_support;
            }
        }

        expected_seq_support == self.seq_support
    }
}

impl<T: Ledger> ArenaLedgerTrie<T> {

    /// Find the node in the trie that represents the longest common ancestry
    /// with the given ledger.
    ///
    /// # Return
    /// A tuple of the found node's `Index` and the `LedgerIndex` of the first
    /// ledger difference.
    fn find(&self, ledger: &T) -> (Index, LedgerIndex) {
        // Root is always defined and is in common with all ledgers
        let mut curr = &self.arena[self.root];
        let mut pos = curr.span.diff(ledger);
        let mut done = false;

        // Continue searching for a better span as long as the current position
        // matches the entire span
        while !done && pos == curr.span.end() {
            done = true;

            // Find the child with the longest ancestry match
            for child_idx in &curr.children {
                let child = &self.arena[*child_idx];
                let child_pos = child.span.diff(ledger);
                if child_pos > pos {
                    done = false;
                    pos = child_pos;
                    curr = child;
                    break;
                }
            }
        }

        (curr.idx, pos)
    }

    /// Find the node in the subtree rooted at `parent` whose tip is exactly `ledger`.
    fn find_by_ledger_id(&self, ledger: &T, parent: Index) -> Option<Index> {
        let node = &self.arena[parent];
        if ledger.id() == node.span.tip().id() {
            return Some(parent);
        }

        node.children.iter()
            .filter_map(|child| self.find_by_ledger_id(ledger, *child))
            .find(|found| self.arena[*found].span.tip().seq() == ledger.seq())
    }

    fn erase_child(&mut self, parent: Index, child: Index) {
        let children = &mut self.arena[parent].children;
        if let Some(position) = children.iter().position(|idx| *idx == child) {
            children.swap_remove(position);
        }
        self.arena.remove(child);
    }
}
