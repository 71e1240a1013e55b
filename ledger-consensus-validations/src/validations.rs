use std::collections::{BTreeSet, HashMap, HashSet};
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use ledger_consensus_core::{Ledger, LedgerIndex, Validation};
use ledger_consensus_core::aged_unordered_map::AgedUnorderedMap;

use crate::adaptor::{Adaptor, Mismatch};
use crate::ledger_trie::LedgerTrie;
use crate::seq_enforcer::SeqEnforcer;
use crate::validation_params::ValidationParams;

/// Status of a newly received validation.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum ValidationStatus {
    /// This was a new validation and was added
    Current,
    /// Not current or was older than current from this node
    Stale,
    /// A validation violates the increasing seq requirement
    BadSeq,
    /// Multiple validations by a validator for the same ledger
    Multiple,
    /// Multiple validations by a validator for different ledgers
    Conflicting,
}

#[derive(Debug, Clone, Copy)]
struct KeepRange {
    low: LedgerIndex,
    high: LedgerIndex,
}

impl KeepRange {
    fn contains(&self, seq: LedgerIndex) -> bool {
        seq >= self.low && seq < self.high
    }
}

/// Maintains current and recent ledger validations.
///
/// Manages storage and queries related to validations received on the network.
/// Stores the most current validation from nodes and sets of recent
/// validations grouped by ledger identifier.
///
/// Stored validations are not necessarily from trusted nodes, so clients and
/// implementations should take care to use `trusted` member functions or check
/// the validation's trusted status.
///
/// All public methods take `&self` and are safe to call from multiple threads.
/// The [`Adaptor`] is only ever called with the internal lock released.
pub struct Validations<A: Adaptor, T: LedgerTrie<A::LedgerType>> {
    /// Manages concurrent access to members
    state: Mutex<State<A, T>>,
    /// Parameters to determine validation staleness
    params: ValidationParams,
    /// Adaptor instance. Is NOT managed by the Mutex above
    adaptor: A,
    /// Set while a pass over the acquiring ledgers is calling out to the adaptor
    checking_acquired: AtomicBool,
}

struct State<A: Adaptor, T: LedgerTrie<A::LedgerType>> {
    /// Validations from currently listed and trusted nodes (partial and full)
    current: HashMap<A::NodeIdType, A::ValidationType>,
    /// Used to enforce the largest validation invariant for the local node
    local_seq_enforcer: SeqEnforcer,
    /// Sequence of the largest validation received from each node
    seq_enforcers: HashMap<A::NodeIdType, SeqEnforcer>,
    /// Validations from listed nodes, indexed by ledger id (partial and full)
    by_ledger: AgedUnorderedMap<A::LedgerIdType, HashMap<A::NodeIdType, A::ValidationType>>,
    /// Partial and full validations indexed by sequence
    by_sequence: AgedUnorderedMap<LedgerIndex, HashMap<A::NodeIdType, A::ValidationType>>,
    /// A range [low, high) of validations to keep from expire
    to_keep: Option<KeepRange>,
    /// Represents the ancestry of validated ledgers
    trie: T,
    /// Last (validated) ledger successfully acquired. If in this map, it is
    /// accounted for in the trie.
    last_ledger: HashMap<A::NodeIdType, A::LedgerType>,
    /// Set of ledgers being acquired from the network
    acquiring: HashMap<(LedgerIndex, A::LedgerIdType), HashSet<A::NodeIdType>>,
    /// Conflicting ledger ids already reported, by sequence
    forks: HashMap<LedgerIndex, BTreeSet<A::LedgerIdType>>,
    /// Replaced or expired validations awaiting `Adaptor::on_stale`
    stale: Vec<A::ValidationType>,
    /// Mismatches awaiting `Adaptor::on_mismatch`
    mismatches: Vec<Mismatch<A::LedgerIdType>>,
}

/// What a locked operation needs besides the state itself.
struct Ctx<'a> {
    params: &'a ValidationParams,
    now: SystemTime,
}

impl<A: Adaptor, T: LedgerTrie<A::LedgerType>> Validations<A, T> {
    pub fn new(params: ValidationParams, adaptor: A) -> Self {
        Validations {
            state: Mutex::new(State {
                current: Default::default(),
                local_seq_enforcer: SeqEnforcer::new(),
                seq_enforcers: Default::default(),
                by_ledger: AgedUnorderedMap::new(),
                by_sequence: AgedUnorderedMap::new(),
                to_keep: None,
                trie: T::default(),
                last_ledger: Default::default(),
                acquiring: Default::default(),
                forks: Default::default(),
                stale: vec![],
                mismatches: vec![],
            }),
            params,
            adaptor,
            checking_acquired: AtomicBool::new(false),
        }
    }

    pub fn adaptor(&self) -> &A {
        &self.adaptor
    }

    pub fn params(&self) -> &ValidationParams {
        &self.params
    }

    /// Return whether the local node can issue a validation for the given
    /// sequence number.
    ///
    /// # Params
    /// - seq: The [`LedgerIndex`] of the ledger the node wants to validate
    ///
    /// # Return
    /// A bool indicating whether the validation satisfies the invariant, updating the
    /// largest sequence number seen accordingly.
    pub fn can_validate_seq(&self, seq: LedgerIndex) -> bool {
        self.with_state(|state, ctx| {
            state.local_seq_enforcer.advance_ledger(ctx.now, seq, ctx.params)
        })
    }

    /// Add a new validation.
    ///
    /// Attempt to add a new validation. A validation older than the current
    /// one from the same node is stored by ledger and sequence but does not
    /// replace it. A newer one replaces it, and the replaced validation is
    /// handed to [`Adaptor::on_stale`].
    pub fn add(&self, node_id: &A::NodeIdType, validation: &A::ValidationType) -> ValidationStatus {
        let status = self.with_state(|state, ctx| state.add(ctx, node_id, validation));
        if status == ValidationStatus::Current && validation.trusted() {
            self.check_acquired();
        }
        status
    }

    /// Set the range [low, high) of validations to keep from expire.
    pub fn set_seq_to_keep(&self, low: LedgerIndex, high: LedgerIndex) {
        debug_assert!(low < high);
        self.with_state(|state, _| state.to_keep = Some(KeepRange { low, high }))
    }

    /// Expire old validation sets.
    ///
    /// Remove validation sets that were accessed more than
    /// `validation_set_expires` ago and were not asked to be kept.
    pub fn expire(&self) {
        self.with_state(|state, ctx| state.expire(ctx))
    }

    /// Update trust status of validations.
    ///
    /// Updates the trusted status of known validations to account for nodes
    /// that have been added or removed from the UNL. This also updates the
    /// trie to ensure only currently trusted nodes' validations are used.
    pub fn trust_changed(&self, added: &HashSet<A::NodeIdType>, removed: &HashSet<A::NodeIdType>) {
        self.with_state(|state, _| state.trust_changed(added, removed));
        self.check_acquired();
    }

    /// Return the sequence number and ID of the preferred working ledger.
    ///
    /// A ledger is preferred if it has more support amongst trusted validators and is **not**
    /// an ancestor of the current working ledger; otherwise it remains the current working ledger.
    ///
    /// # Params
    /// - curr: The local node's current working ledger.
    ///
    /// # Returns
    /// The sequence and id of the preferred working ledger, or `None` if no trusted validations
    /// are available to determine the preferred ledger.
    pub fn get_preferred(&self, curr: &A::LedgerType) -> Option<(LedgerIndex, A::LedgerIdType)> {
        self.check_acquired();
        self.with_state(|state, ctx| state.get_preferred(ctx, curr))
    }

    /// Return the ID of the preferred working ledger that exceeds a minimum valid ledger sequence
    /// number.
    ///
    /// # Params
    /// - curr: The local node's current working ledger.
    /// - min_valid_seq: Minimum allowed sequence number.
    ///
    /// # Returns
    /// The ID of the preferred working ledger, or `curr` if the preferred ledger is not valid.
    pub fn get_preferred_id(&self, curr: &A::LedgerType, min_valid_seq: LedgerIndex) -> A::LedgerIdType {
        self.get_preferred(curr)
            .filter(|preferred| preferred.0 >= min_valid_seq)
            .map_or_else(|| curr.id(), |preferred| preferred.1)
    }

    /// Determine the preferred last closed ledger for the next consensus round.
    ///
    /// Called before starting the next round of ledger consensus to determine
    /// the preferred working ledger. Uses the dominant peer ledger if no
    /// trusted validations are available.
    ///
    /// # Params
    /// - lcl: Last closed ledger by this node.
    /// - min_seq: Minimum allowed sequence number of the trusted preferred ledger.
    /// - peer_counts: Number of peers with each ledger as their last closed ledger.
    pub fn get_preferred_lcl(
        &self,
        lcl: &A::LedgerType,
        min_seq: LedgerIndex,
        peer_counts: &HashMap<A::LedgerIdType, u32>,
    ) -> A::LedgerIdType {
        // Trusted validations exist, but stick with local preferred ledger if
        // preferred is in the past
        if let Some((seq, id)) = self.get_preferred(lcl) {
            return if seq >= min_seq { id } else { lcl.id() };
        }

        // Otherwise, rely on peer ledgers
        peer_counts
            .iter()
            .max_by(|(id, count), (id2, count2)| (count, id).cmp(&(count2, id2)))
            .map_or_else(|| lcl.id(), |(max_id, _)| *max_id)
    }

    /// Count the number of current trusted validators working on a ledger
    /// after the specified one.
    ///
    /// If `ledger.id() != ledger_id`, only counts immediate child ledgers of
    /// `ledger_id`.
    pub fn get_nodes_after(&self, ledger: &A::LedgerType, ledger_id: A::LedgerIdType) -> usize {
        self.check_acquired();
        self.with_state(|state, ctx| {
            // Use trie if ledger is the right one
            if ledger.id() == ledger_id {
                return state.with_trie(ctx, |trie| {
                    (trie.branch_support(ledger) - trie.tip_support(ledger)) as usize
                });
            }

            // Otherwise count parent ledgers as a fallback
            state
                .last_ledger
                .values()
                .filter(|curr| curr.seq() > 0 && curr.get_ancestor(curr.seq() - 1) == ledger_id)
                .count()
        })
    }

    /// Get the currently trusted full validations.
    pub fn current_trusted(&self) -> Vec<A::ValidationType> {
        self.with_state(|state, ctx| {
            let mut ret = Vec::with_capacity(state.current.len());
            state.current(ctx, |_, val| {
                if val.trusted() && val.full() {
                    ret.push(val.clone());
                }
            });
            ret
        })
    }

    /// Get the set of node ids associated with current validations.
    pub fn get_current_node_ids(&self) -> HashSet<A::NodeIdType> {
        self.with_state(|state, ctx| {
            let mut ret = HashSet::with_capacity(state.current.len());
            state.current(ctx, |node_id, _| {
                ret.insert(*node_id);
            });
            ret
        })
    }

    /// Count the number of trusted full validations for the given ledger.
    pub fn num_trusted_for_ledger(&self, ledger_id: &A::LedgerIdType) -> usize {
        self.with_state(|state, ctx| {
            state.by_ledger(ctx, ledger_id, |vals| {
                vals.values().filter(|val| val.trusted() && val.full()).count()
            })
        })
    }

    /// Get trusted full validations for a specific ledger and sequence.
    pub fn get_trusted_for_ledger(&self, ledger_id: &A::LedgerIdType, seq: LedgerIndex) -> Vec<A::ValidationType> {
        self.with_state(|state, ctx| {
            state.by_ledger(ctx, ledger_id, |vals| {
                vals.values()
                    .filter(|val| val.trusted() && val.full() && val.seq() == seq)
                    .cloned()
                    .collect()
            })
        })
    }

    /// Returns the fees reported by trusted full validators in the given ledger.
    ///
    /// Validations without a load fee report `base_fee`.
    pub fn fees(&self, ledger_id: &A::LedgerIdType, base_fee: u32) -> Vec<u32> {
        self.with_state(|state, ctx| {
            state.by_ledger(ctx, ledger_id, |vals| {
                vals.values()
                    .filter(|val| val.trusted() && val.full())
                    .map(|val| val.load_fee().unwrap_or(base_fee))
                    .collect()
            })
        })
    }

    /// Flush all current validations to the adaptor.
    pub fn flush(&self) {
        let remaining = self.with_state(|state, _| state.flush());
        debug!(count = remaining.len(), "Flushing current validations");
        self.adaptor.flush(remaining);
    }

    /// Return quantity of lagging proposers, and remove online proposers for
    /// purposes of evaluating whether to pause.
    ///
    /// Laggards are the trusted proposers whose sequence number is lower than
    /// the sequence number from which our current pending proposal is based.
    /// Proposers from whom we have not received a validation for awhile are
    /// considered offline.
    ///
    /// # Params
    /// - seq: Our current sequence number.
    /// - trusted_keys: Public keys of trusted proposers; the keys of every
    ///   fresh, current proposer are removed.
    pub fn laggards(&self, seq: LedgerIndex, trusted_keys: &mut HashSet<A::NodeKeyType>) -> usize {
        self.with_state(|state, ctx| {
            let mut laggards = 0;
            state.current(ctx, |_, val| {
                if trusted_keys.contains(&val.key()) {
                    trusted_keys.remove(&val.key());
                    if val.seq() < seq && ctx.now < val.seen_time() + ctx.params.validation_freshness() {
                        laggards += 1;
                    }
                }
            });
            laggards
        })
    }

    /// Compare our own ledger against what trusted validators fully validated
    /// at the same sequence.
    ///
    /// Returns the ledger id validated by at least `quorum` trusted validators,
    /// if any. A [`Mismatch::Local`] is reported when that id differs from ours.
    pub fn check_local(&self, ledger: &A::LedgerType, quorum: usize) -> Option<A::LedgerIdType> {
        self.with_state(|state, _| state.check_local(ledger, quorum))
    }

    /// Run `f` against the locked state, then deliver queued notifications with
    /// the lock released.
    fn with_state<R>(&self, f: impl FnOnce(&mut State<A, T>, &Ctx) -> R) -> R {
        let ctx = Ctx {
            params: &self.params,
            now: self.adaptor.now(),
        };
        let (ret, stale, mismatches) = {
            let mut state = self.state.lock();
            let ret = f(&mut state, &ctx);
            (ret, std::mem::take(&mut state.stale), std::mem::take(&mut state.mismatches))
        };

        for validation in stale {
            self.adaptor.on_stale(validation);
        }
        for mismatch in mismatches {
            self.adaptor.on_mismatch(mismatch);
        }
        ret
    }

    /// Move any ledgers that finished acquiring into the trie.
    ///
    /// [`Adaptor::acquire`] is called with the lock released, so the adaptor
    /// may query the tracker while fetching. A pass started from inside such
    /// a query, or while another thread's pass is running, returns at once.
    fn check_acquired(&self) {
        if self
            .checking_acquired
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let pending: Vec<_> = self.state.lock().acquiring.keys().copied().collect();
        let acquired: Vec<_> = pending
            .into_iter()
            .filter_map(|key| self.adaptor.acquire(&key.1).map(|ledger| (key, ledger)))
            .collect();

        if !acquired.is_empty() {
            let mut state = self.state.lock();
            for (key, ledger) in acquired {
                // Nodes that moved on while the ledger was fetched are no
                // longer in the set
                if let Some(nodes) = state.acquiring.remove(&key) {
                    trace!(seq = key.0, nodes = nodes.len(), "Acquired validated ledger");
                    for node_id in nodes {
                        state.update_trie(&node_id, ledger.clone());
                    }
                }
            }
        }
        self.checking_acquired.store(false, Ordering::Release);
    }
}

impl<A: Adaptor, T: LedgerTrie<A::LedgerType>> State<A, T> {
    fn add(&mut self, ctx: &Ctx, node_id: &A::NodeIdType, validation: &A::ValidationType) -> ValidationStatus {
        if !is_current(ctx.params, ctx.now, validation.sign_time(), validation.seen_time()) {
            debug!(node = ?node_id, seq = validation.seq(), "Rejecting validation that is not current");
            return ValidationStatus::Stale;
        }

        // Check that validation sequence is greater than any non-expired
        // validations sequence from that validator; if it's not, perform
        // additional work to detect Byzantine validations
        let inserted = match self.by_sequence.get_or_insert_mut(validation.seq(), ctx.now).entry(*node_id) {
            Entry::Occupied(mut e) => {
                // Check if the entry we're already tracking was signed
                // long enough ago that we can disregard it.
                let (tracked, incoming) = (e.get().sign_time(), validation.sign_time());
                let diff = tracked.max(incoming).duration_since(tracked.min(incoming)).unwrap_or_default();
                if diff > ctx.params.validation_current_wall() && incoming > tracked {
                    e.insert(validation.clone());
                }
                e.get().clone()
            }
            Entry::Vacant(e) => e.insert(validation.clone()).clone(),
        };

        // Enforce monotonically increasing sequences for validations
        // by a given node, and run the active Byzantine detector:
        let enforcer = self.seq_enforcers.entry(*node_id).or_default();
        if !enforcer.advance_ledger(ctx.now, validation.seq(), ctx.params) {
            let status = classify_repeat(&inserted, validation);
            debug!(node = ?node_id, seq = validation.seq(), ?status, "Rejecting validation");
            return status;
        }

        self.by_ledger
            .get_or_insert_mut(validation.ledger_id(), ctx.now)
            .insert(*node_id, validation.clone());

        if validation.trusted() && validation.full() {
            self.detect_fork(validation.seq());
        }

        match self.current.entry(*node_id) {
            Entry::Occupied(mut e) => {
                // Replace existing only if this one is newer
                if validation.sign_time() <= e.get().sign_time() {
                    return ValidationStatus::Stale;
                }
                let old = e.insert(validation.clone());
                trace!(node = ?node_id, seq = old.seq(), "Replaced current validation");
                if validation.trusted() {
                    self.process_validation(node_id, validation, Some((old.seq(), old.ledger_id())));
                }
                self.stale.push(old);
            }
            Entry::Vacant(e) => {
                e.insert(validation.clone());
                if validation.trusted() {
                    self.process_validation(node_id, validation, None);
                }
            }
        }
        ValidationStatus::Current
    }

    /// Report trusted full validations for different ledgers at `seq`, once
    /// per newly seen ledger id.
    fn detect_fork(&mut self, seq: LedgerIndex) {
        let Some(vals) = self.by_sequence.get(&seq) else {
            return;
        };
        let ids: BTreeSet<A::LedgerIdType> = vals
            .values()
            .filter(|val| val.trusted() && val.full())
            .map(|val| val.ledger_id())
            .collect();
        if ids.len() < 2 {
            return;
        }

        let reported = self.forks.entry(seq).or_default();
        if ids.is_subset(reported) {
            return;
        }
        reported.extend(ids.iter().copied());
        let ledger_ids: Vec<_> = reported.iter().copied().collect();
        warn!(seq, ledgers = ?ledger_ids, "Trusted validators validated different ledgers");
        self.mismatches.push(Mismatch::Fork { seq, ledger_ids });
    }

    fn expire(&mut self, ctx: &Ctx) {
        let keep = self.to_keep;
        let kept = move |seq: LedgerIndex| keep.map_or(false, |range| range.contains(seq));
        let set_expires = ctx.params.validation_set_expires();

        let by_ledger = self.by_ledger.expire(ctx.now, set_expires, |_, vals| {
            vals.values().next().map_or(false, |val| kept(val.seq()))
        });
        let by_sequence = self.by_sequence.expire(ctx.now, set_expires, |seq, _| kept(*seq));
        let by_sequence_map = &self.by_sequence;
        self.forks.retain(|seq, _| by_sequence_map.get(seq).is_some());
        if by_ledger + by_sequence > 0 {
            debug!(by_ledger, by_sequence, "Expired validation sets");
        }

        // Drop stale current validations as well
        self.current(ctx, |_, _| {});
    }

    fn trust_changed(&mut self, added: &HashSet<A::NodeIdType>, removed: &HashSet<A::NodeIdType>) {
        let mut now_trusted = vec![];
        let mut now_untrusted = vec![];
        for (node_id, val) in self.current.iter_mut() {
            if added.contains(node_id) {
                val.set_trusted();
                now_trusted.push((*node_id, val.clone()));
            } else if removed.contains(node_id) {
                val.set_untrusted();
                now_untrusted.push((*node_id, val.clone()));
            }
        }

        for (node_id, val) in now_trusted {
            self.process_validation(&node_id, &val, None);
        }
        for (node_id, val) in now_untrusted {
            self.remove_trie(&node_id, &val);
        }

        let update = |node_id: &A::NodeIdType, val: &mut A::ValidationType| {
            if added.contains(node_id) {
                val.set_trusted();
            } else if removed.contains(node_id) {
                val.set_untrusted();
            }
        };
        for (_, vals) in self.by_ledger.iter_mut() {
            vals.iter_mut().for_each(|(node_id, val)| update(node_id, val));
        }
        for (_, vals) in self.by_sequence.iter_mut() {
            vals.iter_mut().for_each(|(node_id, val)| update(node_id, val));
        }
        debug!(added = added.len(), removed = removed.len(), "Trusted validators changed");
    }

    fn get_preferred(&mut self, ctx: &Ctx, curr: &A::LedgerType) -> Option<(LedgerIndex, A::LedgerIdType)> {
        let seq = self.local_seq_enforcer.largest();
        let preferred = self.with_trie(ctx, |trie| trie.get_preferred(seq));

        let Some(preferred) = preferred else {
            // No trusted validations to determine branch, so fall back to
            // majority over acquiring ledgers. Ties break by ledger id.
            return self
                .acquiring
                .iter()
                .max_by(|a, b| (a.1.len(), &a.0 .1).cmp(&(b.1.len(), &b.0 .1)))
                .map(|(key, _)| *key);
        };

        // If we are the parent of the preferred ledger, stick with our
        // current ledger since we might be about to generate it
        if preferred.seq() == curr.seq() + 1 && preferred.ancestor(curr.seq()) == curr.id() {
            return Some((curr.seq(), curr.id()));
        }

        // A ledger ahead of us is preferred regardless of whether it is
        // a descendant of our working ledger or it is on a different chain
        if preferred.seq() > curr.seq() {
            return Some((preferred.seq(), preferred.id()));
        }

        // Only switch to earlier or same sequence number
        // if it is a different chain.
        if curr.get_ancestor(preferred.seq()) != preferred.id() {
            return Some((preferred.seq(), preferred.id()));
        }

        // Stick with current ledger
        Some((curr.seq(), curr.id()))
    }

    fn flush(&mut self) -> HashMap<A::NodeIdType, A::ValidationType> {
        let flushed = std::mem::take(&mut self.current);
        for (node_id, val) in &flushed {
            self.remove_trie(node_id, val);
        }
        flushed
    }

    fn check_local(&mut self, ledger: &A::LedgerType, quorum: usize) -> Option<A::LedgerIdType> {
        let vals = self.by_sequence.get(&ledger.seq())?;
        let mut counts: HashMap<A::LedgerIdType, usize> = HashMap::new();
        for val in vals.values().filter(|val| val.trusted() && val.full()) {
            *counts.entry(val.ledger_id()).or_default() += 1;
        }

        let (validated, _) = counts
            .into_iter()
            .filter(|(_, count)| *count >= quorum)
            .max_by(|(id, count), (id2, count2)| (count, id).cmp(&(count2, id2)))?;
        if validated != ledger.id() {
            warn!(seq = ledger.seq(), local = ?ledger.id(), ?validated, "Local ledger differs from validated ledger");
            self.mismatches.push(Mismatch::Local {
                seq: ledger.seq(),
                local: ledger.id(),
                validated,
            });
        }
        Some(validated)
    }

    /// Remove support of a validated ledger.
    fn remove_trie(&mut self, node_id: &A::NodeIdType, validation: &A::ValidationType) {
        if let Entry::Occupied(mut e) = self.acquiring.entry((validation.seq(), validation.ledger_id())) {
            e.get_mut().remove(node_id);
            if e.get().is_empty() {
                e.remove();
            }
        }

        if let Entry::Occupied(e) = self.last_ledger.entry(*node_id) {
            if e.get().id() == validation.ledger_id() {
                self.trie.remove(e.get(), None);
                e.remove();
            }
        }
    }

    /// Update the trie to reflect a new validated ledger.
    fn update_trie(&mut self, node_id: &A::NodeIdType, ledger: A::LedgerType) {
        if let Some(prior) = self.last_ledger.insert(*node_id, ledger.clone()) {
            self.trie.remove(&prior, None);
        }
        self.trie.insert(&ledger, None);
    }

    /// Process a new validation.
    ///
    /// Process a new trusted validation from a validator. This will be
    /// reflected only after the validated ledger is successfully acquired by
    /// the local node. In the interim, the prior validated ledger from this
    /// node remains. The ledger is queued here and fetched by
    /// `Validations::check_acquired` once the lock is released.
    fn process_validation(
        &mut self,
        node_id: &A::NodeIdType,
        validation: &A::ValidationType,
        prior: Option<(LedgerIndex, A::LedgerIdType)>,
    ) {
        // Clear any prior acquiring ledger for this node
        if let Some(prior) = prior {
            if let Entry::Occupied(mut e) = self.acquiring.entry(prior) {
                e.get_mut().remove(node_id);
                if e.get().is_empty() {
                    e.remove();
                }
            }
        }

        trace!(node = ?node_id, seq = validation.seq(), "Acquiring validated ledger");
        self.acquiring
            .entry((validation.seq(), validation.ledger_id()))
            .or_default()
            .insert(*node_id);
    }

    /// Use the trie for a calculation.
    ///
    /// Accessing the trie through this helper ensures any stale validations are
    /// flushed from the trie. Callers check acquiring ledgers before taking
    /// the lock.
    fn with_trie<R>(&mut self, ctx: &Ctx, f: impl FnOnce(&mut T) -> R) -> R {
        // Call current to flush any stale validations
        self.current(ctx, |_, _| {});
        f(&mut self.trie)
    }

    /// Iterate through current validations, flushing any which are stale.
    fn current(&mut self, ctx: &Ctx, mut f: impl FnMut(&A::NodeIdType, &A::ValidationType)) {
        let expired: Vec<A::NodeIdType> = self
            .current
            .iter()
            .filter(|(_, val)| !is_current(ctx.params, ctx.now, val.sign_time(), val.seen_time()))
            .map(|(node_id, _)| *node_id)
            .collect();

        for node_id in expired {
            if let Some(val) = self.current.remove(&node_id) {
                trace!(node = ?node_id, seq = val.seq(), "Current validation went stale");
                self.remove_trie(&node_id, &val);
                self.stale.push(val);
            }
        }

        for (node_id, val) in &self.current {
            f(node_id, val);
        }
    }

    /// Apply `f` to the validations for a ledger, touching the set so it is
    /// not expired.
    fn by_ledger<R: Default>(
        &mut self,
        ctx: &Ctx,
        ledger_id: &A::LedgerIdType,
        f: impl FnOnce(&HashMap<A::NodeIdType, A::ValidationType>) -> R,
    ) -> R {
        self.by_ledger.touch(ledger_id, ctx.now);
        self.by_ledger.get(ledger_id).map(f).unwrap_or_default()
    }
}

/// Decide why a validation that violates the increasing seq requirement is rejected.
fn classify_repeat<V: Validation>(tracked: &V, incoming: &V) -> ValidationStatus {
    // If the validation is for the same sequence as one we are
    // tracking, check it closely:
    if tracked.seq() == incoming.seq() {
        // Two validations for the same sequence but for different
        // ledgers. This could be the result of misconfiguration
        // but it can also mean a Byzantine validator.
        if tracked.ledger_id() != incoming.ledger_id() {
            return ValidationStatus::Conflicting;
        }

        // Two validations for the same sequence and for the same
        // ledger with different sign times. This could be the
        // result of a misconfiguration but it can also mean a
        // Byzantine validator.
        if tracked.sign_time() != incoming.sign_time() {
            return ValidationStatus::Conflicting;
        }

        // Two validations for the same sequence but with different
        // cookies. This is probably accidental misconfiguration.
        if tracked.cookie() != incoming.cookie() {
            return ValidationStatus::Multiple;
        }
    }

    ValidationStatus::BadSeq
}

/// Whether a validation is still current.
///
/// Determines whether a validation can still be considered the current
/// validation from a node based on when it was signed by that node and first
/// seen by this node. An unset seen time (the epoch) is ignored.
fn is_current(p: &ValidationParams, now: SystemTime, sign_time: SystemTime, seen_time: SystemTime) -> bool {
    // Saturate rather than underflow when `now` is close to the epoch.
    let earliest = now.checked_sub(p.validation_current_early()).unwrap_or(UNIX_EPOCH);
    sign_time > earliest
        && sign_time < now + p.validation_current_wall()
        && (seen_time == UNIX_EPOCH || seen_time < now + p.validation_current_local())
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, OnceLock, Weak};
    use std::time::{Duration, SystemTime};

    use parking_lot::Mutex;
    use tracing_test::traced_test;

    use ledger_consensus_core::{Ledger, LedgerIndex, NetClock, Validation};
    use ledger_consensus_core::test_utils::ManualClock;
    use ledger_consensus_core::test_utils::ledgers::{LedgerHistoryHelper, LedgerId, LedgerOracle, SimulatedLedger};
    use ledger_consensus_core::test_utils::validation::{PeerId, PeerKey, TestValidation};

    use crate::adaptor::{Adaptor, Mismatch};
    use crate::arena_ledger_trie::ArenaLedgerTrie;
    use crate::validation_params::ValidationParams;
    use crate::validations::{Validations, ValidationStatus};

    #[test]
    fn test_add_validations() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");
        let ab = h.get_or_create("ab");
        let abc = h.get_or_create("abc");
        let abcd = h.get_or_create("abcd");
        let abcde = h.get_or_create("abcde");

        let harness = TestHarness::new(h.into_oracle());
        let mut node = harness.make_node(1);
        let v = node.validate_ledger(&a);
        assert_eq!(harness.add(&v), ValidationStatus::Current);

        // Re-adding violates the increasing seq requirement for full
        // validations
        assert_eq!(harness.add(&v), ValidationStatus::BadSeq);

        harness.advance_time(Duration::from_secs(1));

        assert_eq!(harness.add(&node.validate_ledger(&ab)), ValidationStatus::Current);
        // The replaced validation was handed off exactly once
        assert_eq!(harness.adaptor().stale(), vec![v]);

        // Confirm old ledger on hand, but not new ledger
        assert_eq!(harness.validations.num_trusted_for_ledger(&ab.id()), 1);
        assert_eq!(harness.validations.num_trusted_for_ledger(&abc.id()), 0);

        // Rotate signing keys
        node.advance_key();

        harness.advance_time(Duration::from_secs(1));

        // Cannot re-do the same full validation sequence
        assert_eq!(harness.add(&node.validate_ledger(&ab)), ValidationStatus::Conflicting);

        // Cannot send the same partial validation sequence
        assert_eq!(harness.add(&node.partial(&ab)), ValidationStatus::Conflicting);

        // Now trusts the newest ledger too
        harness.advance_time(Duration::from_secs(1));
        assert_eq!(harness.add(&node.validate_ledger(&abc)), ValidationStatus::Current);
        assert_eq!(harness.validations.num_trusted_for_ledger(&ab.id()), 1);
        assert_eq!(harness.validations.num_trusted_for_ledger(&abc.id()), 1);

        // Processing validations out of order should ignore the older
        // validation
        harness.advance_time(Duration::from_secs(2));
        let val_abcde = node.validate_ledger(&abcde);
        harness.advance_time(Duration::from_secs(4));
        let val_abcd = node.validate_ledger(&abcd);

        assert_eq!(harness.add(&val_abcd), ValidationStatus::Current);
        assert_eq!(harness.add(&val_abcde), ValidationStatus::Stale);
    }

    #[test]
    fn test_add_validations_multiple_cookies() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");

        let harness = TestHarness::new(h.into_oracle());
        let node = harness.make_node(1);
        let first = node.validate_with_cookie(&a, 1);
        assert_eq!(harness.add(&first), ValidationStatus::Current);

        // Same ledger and sign time from a second instance of the validator
        let second = node.validate_with_cookie(&a, 2);
        assert_eq!(harness.add(&second), ValidationStatus::Multiple);
    }

    #[test]
    fn test_add_validations_out_of_order_with_shifted_times() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");
        let ab = h.get_or_create("ab");
        let abc = h.get_or_create("abc");

        let harness = TestHarness::new(h.into_oracle());
        let node = harness.make_node(1);

        // Establish a new current validation
        assert_eq!(harness.add(&node.validate_ledger(&a)), ValidationStatus::Current);

        // Process a validation that has "later" seq but early sign time
        assert_eq!(
            harness.add(&node.validate_full(
                &ab,
                DurationOffset::Minus(Duration::from_secs(1)),
                DurationOffset::Minus(Duration::from_secs(1)),
            )),
            ValidationStatus::Stale
        );

        // Process a validation that has a later seq and later sign
        // time
        assert_eq!(
            harness.add(&node.validate_full(
                &abc,
                DurationOffset::Plus(Duration::from_secs(1)),
                DurationOffset::Plus(Duration::from_secs(1)),
            )),
            ValidationStatus::Current
        );
    }

    #[test]
    fn test_add_validations_stale_on_arrival() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");

        let harness = TestHarness::new(h.into_oracle());
        let node = harness.make_node(1);
        let params = harness.params();
        assert_eq!(
            harness.add(&node.validate_full(
                &a,
                DurationOffset::Minus(params.validation_current_early()),
                DurationOffset::Zero,
            )),
            ValidationStatus::Stale
        );

        assert_eq!(
            harness.add(&node.validate_full(
                &a,
                DurationOffset::Plus(params.validation_current_wall()),
                DurationOffset::Zero,
            )),
            ValidationStatus::Stale
        );

        assert_eq!(
            harness.add(&node.validate_full(
                &a,
                DurationOffset::Zero,
                DurationOffset::Plus(params.validation_current_local()),
            )),
            ValidationStatus::Stale
        );
    }

    #[test]
    fn test_add_validations_full_or_partials_cannot_be_sent_for_older_seqs_unless_timeout() {
        let mut h = LedgerHistoryHelper::new();
        let ab = h.get_or_create("ab");
        let az = h.get_or_create("az");
        let abc = h.get_or_create("abc");
        let oracle = h.into_oracle();

        for do_full in [true, false] {
            let harness = TestHarness::new(oracle.clone());
            let node = harness.make_node(1);

            let process = |ledger: &SimulatedLedger| {
                if do_full {
                    harness.add(&node.validate_ledger(ledger))
                } else {
                    harness.add(&node.partial(ledger))
                }
            };

            assert_eq!(process(&abc), ValidationStatus::Current);
            harness.advance_time(Duration::from_secs(1));
            assert!(ab.seq() < abc.seq());
            assert_eq!(process(&ab), ValidationStatus::BadSeq);

            // If we advance far enough for AB to expire, we can fully
            // validate or partially validate that sequence number again
            assert_eq!(process(&az), ValidationStatus::Conflicting);
            harness.advance_time(harness.params().validation_set_expires() + Duration::from_millis(1));
            assert_eq!(process(&az), ValidationStatus::Current);
        }
    }

    #[test]
    fn test_on_stale() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");
        let ab = h.get_or_create("ab");
        let oracle = h.into_oracle();

        let genesis = SimulatedLedger::genesis();

        // Each of these operations flushes stale validations
        let triggers: Vec<Box<dyn Fn(&TestValidations)>> = vec![
            Box::new(|vals: &TestValidations| {
                vals.current_trusted();
            }),
            Box::new(|vals: &TestValidations| {
                vals.get_current_node_ids();
            }),
            Box::new(|vals: &TestValidations| {
                vals.get_preferred(&SimulatedLedger::genesis());
            }),
            Box::new(|vals: &TestValidations| {
                vals.get_nodes_after(&SimulatedLedger::genesis(), SimulatedLedger::genesis().id());
            }),
        ];

        for trigger in triggers {
            let harness = TestHarness::new(oracle.clone());
            let node = harness.make_node(1);

            let val = node.validate_ledger(&ab);
            assert_eq!(harness.add(&val), ValidationStatus::Current);
            trigger(&harness.validations);
            assert_eq!(harness.validations.get_nodes_after(&a, a.id()), 1);
            assert_eq!(harness.validations.get_preferred(&genesis), Some((ab.seq(), ab.id())));
            assert!(harness.adaptor().stale().is_empty());

            harness.advance_time(harness.params().validation_current_local());

            trigger(&harness.validations);

            assert_eq!(harness.adaptor().stale(), vec![val]);
            assert_eq!(harness.validations.get_nodes_after(&a, a.id()), 0);
            assert_eq!(harness.validations.get_preferred(&genesis), None);
        }
    }

    /// Test getting number of nodes working on a validation descending
    /// a prescribed one. This count should only be for trusted nodes, but
    /// includes partial and full validations.
    #[test]
    fn test_get_nodes_after() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");
        let ab = h.get_or_create("ab");
        let abc = h.get_or_create("abc");
        let ad = h.get_or_create("ad");

        let harness = TestHarness::new(h.into_oracle());
        let a_node = harness.make_node(1);
        let b_node = harness.make_node(2);
        let mut c_node = harness.make_node(3);
        let d_node = harness.make_node(4);
        c_node.untrust();

        assert_eq!(harness.add(&a_node.validate_ledger(&a)), ValidationStatus::Current);
        assert_eq!(harness.add(&b_node.validate_ledger(&a)), ValidationStatus::Current);
        assert_eq!(harness.add(&c_node.validate_ledger(&a)), ValidationStatus::Current);
        assert_eq!(harness.add(&d_node.partial(&a)), ValidationStatus::Current);

        for ledger in [&a, &ab, &abc, &ad] {
            assert_eq!(harness.validations.get_nodes_after(ledger, ledger.id()), 0);
        }

        harness.advance_time(Duration::from_secs(5));

        assert_eq!(harness.add(&a_node.validate_ledger(&ab)), ValidationStatus::Current);
        assert_eq!(harness.add(&b_node.validate_ledger(&abc)), ValidationStatus::Current);
        assert_eq!(harness.add(&c_node.validate_ledger(&ab)), ValidationStatus::Current);
        assert_eq!(harness.add(&d_node.partial(&abc)), ValidationStatus::Current);

        assert_eq!(harness.validations.get_nodes_after(&a, a.id()), 3);
        assert_eq!(harness.validations.get_nodes_after(&ab, ab.id()), 2);
        assert_eq!(harness.validations.get_nodes_after(&abc, abc.id()), 0);
        assert_eq!(harness.validations.get_nodes_after(&ad, ad.id()), 0);

        // If given a ledger inconsistent with the id, is still able to check
        // using slower method
        assert_eq!(harness.validations.get_nodes_after(&ad, a.id()), 1);
        assert_eq!(harness.validations.get_nodes_after(&ad, ab.id()), 2);
    }

    #[test]
    fn test_current_trusted() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");
        let b = h.get_or_create("b");
        let ac = h.get_or_create("ac");

        let harness = TestHarness::new(h.into_oracle());
        let a_node = harness.make_node(1);
        let mut b_node = harness.make_node(2);
        b_node.untrust();

        assert_eq!(harness.add(&a_node.validate_ledger(&a)), ValidationStatus::Current);
        assert_eq!(harness.add(&b_node.validate_ledger(&b)), ValidationStatus::Current);

        // Only a_node is trusted
        let trusted = harness.validations.current_trusted();
        assert_eq!(trusted.len(), 1);
        assert_eq!(trusted[0].ledger_id(), a.id());
        assert_eq!(trusted[0].seq(), a.seq());

        harness.advance_time(Duration::from_secs(3));

        assert_eq!(harness.add(&a_node.validate_ledger(&ac)), ValidationStatus::Current);
        assert_eq!(harness.add(&b_node.validate_ledger(&ac)), ValidationStatus::Current);

        // New validation for a_node
        let trusted = harness.validations.current_trusted();
        assert_eq!(trusted.len(), 1);
        assert_eq!(trusted[0].ledger_id(), ac.id());
        assert_eq!(trusted[0].seq(), ac.seq());

        // Pass enough time for it to go stale
        harness.advance_time(harness.params().validation_current_local());
        assert!(harness.validations.current_trusted().is_empty());
    }

    #[test]
    fn test_get_current_node_ids() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");
        let ac = h.get_or_create("ac");

        let harness = TestHarness::new(h.into_oracle());
        let mut a_node = harness.make_node(1);
        let mut b_node = harness.make_node(2);
        b_node.untrust();

        assert_eq!(harness.add(&a_node.validate_ledger(&a)), ValidationStatus::Current);
        assert_eq!(harness.add(&b_node.validate_ledger(&a)), ValidationStatus::Current);

        assert_eq!(
            harness.validations.get_current_node_ids(),
            HashSet::from([a_node.node_id(), b_node.node_id()])
        );

        harness.advance_time(Duration::from_secs(3));

        // Change keys and issue partials
        a_node.advance_key();
        b_node.advance_key();

        assert_eq!(harness.add(&a_node.partial(&ac)), ValidationStatus::Current);
        assert_eq!(harness.add(&b_node.partial(&ac)), ValidationStatus::Current);

        assert_eq!(
            harness.validations.get_current_node_ids(),
            HashSet::from([a_node.node_id(), b_node.node_id()])
        );

        harness.advance_time(harness.params().validation_current_wall());
        assert!(harness.validations.get_current_node_ids().is_empty());
    }

    /// Test the Validations functions that calculate a value by ledger ID.
    ///
    /// Several Validations functions return a set of values associated
    /// with trusted ledgers sharing the same ledger ID.  The tests below
    /// exercise this logic by saving the set of trusted Validations, and
    /// verifying that the Validations member functions all calculate the
    /// proper transformation of the available ledgers.
    #[test]
    fn test_trusted_by_ledger() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");
        let b = h.get_or_create("b");
        let ac = h.get_or_create("ac");

        let harness = TestHarness::new(h.into_oracle());
        let mut a_node = harness.make_node(1);
        let mut b_node = harness.make_node(2);
        let mut c_node = harness.make_node(3);
        let d_node = harness.make_node(4);
        let mut e_node = harness.make_node(5);
        c_node.untrust();

        a_node.set_load_fee(12);
        b_node.set_load_fee(1);
        c_node.set_load_fee(12);
        e_node.set_load_fee(12);

        let mut trusted_validations: HashMap<(LedgerId, LedgerIndex), Vec<TestValidation>> = HashMap::new();

        // Add a dummy ID to cover unknown ledger identifiers
        trusted_validations.insert((LedgerId(100), 100), vec![]);

        // first round a,b,c agree
        for node in [&a_node, &b_node, &c_node] {
            let val = node.validate_ledger(&a);
            assert_eq!(harness.add(&val), ValidationStatus::Current);
            if val.trusted() {
                trusted_validations.entry((val.ledger_id(), val.seq())).or_default().push(val);
            }
        }

        // d disagrees
        let val = d_node.validate_ledger(&b);
        assert_eq!(harness.add(&val), ValidationStatus::Current);
        trusted_validations.entry((val.ledger_id(), val.seq())).or_default().push(val);

        // e only issued partials
        assert_eq!(harness.add(&e_node.partial(&a)), ValidationStatus::Current);

        harness.advance_time(Duration::from_secs(5));
        // second round, a,b,c move to ledger 2
        for node in [&a_node, &b_node, &c_node] {
            let val = node.validate_ledger(&ac);
            assert_eq!(harness.add(&val), ValidationStatus::Current);
            if val.trusted() {
                trusted_validations.entry((val.ledger_id(), val.seq())).or_default().push(val);
            }
        }

        // d now thinks ledger 1, but cannot re-issue a previously used seq
        // and attempting it should generate a conflict.
        assert_eq!(harness.add(&d_node.partial(&a)), ValidationStatus::Conflicting);

        // e only issues partials
        assert_eq!(harness.add(&e_node.partial(&ac)), ValidationStatus::Current);

        for ((id, seq), vals) in trusted_validations.iter_mut() {
            assert_eq!(harness.validations.num_trusted_for_ledger(id), vals.len());
            let mut trusted = harness.validations.get_trusted_for_ledger(id, *seq);
            trusted.sort();
            vals.sort();
            assert_eq!(&trusted, vals);

            let base_fee = 0;
            let mut expected_fees: Vec<u32> = vals.iter().map(|val| val.load_fee().unwrap_or(base_fee)).collect();
            expected_fees.sort();
            let mut fees = harness.validations.fees(id, base_fee);
            fees.sort();
            assert_eq!(fees, expected_fees);
        }
    }

    #[test]
    fn test_expire() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");
        let ab = h.get_or_create("ab");
        let oracle = h.into_oracle();

        // Validations are expired once their set has not been touched for
        // validation_set_expires
        let harness = TestHarness::new(oracle.clone());
        let node = harness.make_node(1);
        assert_eq!(harness.add(&node.validate_ledger(&a)), ValidationStatus::Current);
        assert_eq!(harness.validations.num_trusted_for_ledger(&a.id()), 1);
        harness.advance_time(harness.params().validation_set_expires());
        harness.validations.expire();
        assert_eq!(harness.validations.num_trusted_for_ledger(&a.id()), 1);
        harness.advance_time(Duration::from_secs(1));
        harness.validations.expire();
        assert_eq!(harness.validations.num_trusted_for_ledger(&a.id()), 0);

        // Validations inside the keep range survive expiration
        let harness = TestHarness::new(oracle);
        let node = harness.make_node(1);
        assert_eq!(harness.add(&node.validate_ledger(&a)), ValidationStatus::Current);
        assert_eq!(harness.add(&node.validate_ledger(&ab)), ValidationStatus::Stale);
        harness.validations.set_seq_to_keep(a.seq(), ab.seq());
        harness.advance_time(harness.params().validation_set_expires() + Duration::from_secs(1));
        harness.validations.expire();
        assert_eq!(harness.validations.num_trusted_for_ledger(&a.id()), 1);
        assert_eq!(harness.validations.num_trusted_for_ledger(&ab.id()), 0);
    }

    #[test]
    fn test_flush() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");
        let ab = h.get_or_create("ab");

        let harness = TestHarness::new(h.into_oracle());
        let a_node = harness.make_node(1);
        let b_node = harness.make_node(2);
        let mut c_node = harness.make_node(3);
        c_node.untrust();

        let mut expected = HashMap::new();
        for node in [&a_node, &b_node, &c_node] {
            let val = node.validate_ledger(&a);
            assert_eq!(harness.add(&val), ValidationStatus::Current);
            expected.insert(node.node_id(), val);
        }

        // A newer validation from a_node goes stale immediately
        harness.advance_time(Duration::from_secs(1));
        let stale = expected[&a_node.node_id()];
        let newer = a_node.validate_ledger(&ab);
        assert_eq!(harness.add(&newer), ValidationStatus::Current);
        assert_eq!(harness.adaptor().stale(), vec![stale]);
        expected.insert(a_node.node_id(), newer);

        // A validation signed before b_node's current one does not replace it
        assert_eq!(
            harness.add(&b_node.validate_full(&ab, DurationOffset::Minus(Duration::from_secs(2)), DurationOffset::Zero)),
            ValidationStatus::Stale
        );

        harness.validations.flush();
        assert_eq!(harness.adaptor().flushed(), expected);
        assert!(harness.validations.get_current_node_ids().is_empty());
        assert_eq!(harness.validations.get_preferred(&SimulatedLedger::genesis()), None);
    }

    #[test]
    fn test_get_preferred_ledger() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");
        let b = h.get_or_create("b");
        let ac = h.get_or_create("ac");
        let acd = h.get_or_create("acd");

        let harness = TestHarness::new(h.into_oracle());
        let a_node = harness.make_node(1);
        let b_node = harness.make_node(2);
        let mut c_node = harness.make_node(3);
        let d_node = harness.make_node(4);
        c_node.untrust();

        // Empty, no ledgers
        assert!(harness.validations.get_preferred(&a).is_none());

        // Single ledger
        assert_eq!(harness.add(&a_node.validate_ledger(&b)), ValidationStatus::Current);
        assert_eq!(harness.validations.get_preferred(&a), Some((b.seq(), b.id())));
        assert_eq!(harness.validations.get_preferred(&b), Some((b.seq(), b.id())));

        // Minimum valid sequence
        assert_eq!(harness.validations.get_preferred_id(&a, 10), a.id());

        // Untrusted doesn't impact preferred ledger
        // (ledger b has tie-break over ledger a)
        assert_eq!(harness.add(&b_node.validate_ledger(&a)), ValidationStatus::Current);
        assert_eq!(harness.add(&c_node.validate_ledger(&a)), ValidationStatus::Current);
        assert!(b.id() > a.id());
        assert_eq!(harness.validations.get_preferred(&a), Some((b.seq(), b.id())));
        assert_eq!(harness.validations.get_preferred(&b), Some((b.seq(), b.id())));

        // Partial does break ties
        assert_eq!(harness.add(&d_node.partial(&a)), ValidationStatus::Current);
        assert_eq!(harness.validations.get_preferred(&a), Some((a.seq(), a.id())));
        assert_eq!(harness.validations.get_preferred(&b), Some((a.seq(), a.id())));

        harness.advance_time(Duration::from_secs(5));

        for node in [&a_node, &b_node, &c_node, &d_node] {
            assert_eq!(harness.add(&node.validate_ledger(&ac)), ValidationStatus::Current);
        }

        // Parent of preferred stays put
        assert_eq!(harness.validations.get_preferred(&a), Some((a.seq(), a.id())));
        // Earlier different chain, switch
        assert_eq!(harness.validations.get_preferred(&b), Some((ac.seq(), ac.id())));
        // Later on chain, stays where it is
        assert_eq!(harness.validations.get_preferred(&acd), Some((acd.seq(), acd.id())));

        // Any later grandchild or different chain is preferred
        harness.advance_time(Duration::from_secs(5));
        for node in [&a_node, &b_node, &c_node, &d_node] {
            assert_eq!(harness.add(&node.validate_ledger(&acd)), ValidationStatus::Current);
        }

        for ledger in [&a, &b, &acd] {
            assert_eq!(harness.validations.get_preferred(ledger), Some((acd.seq(), acd.id())));
        }
    }

    #[test]
    fn test_get_preferred_lcl() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");
        let b = h.get_or_create("b");
        let c = h.get_or_create("c");

        let harness = TestHarness::new(h.into_oracle());
        let a_node = harness.make_node(1);

        let mut peer_counts = HashMap::new();

        // No trusted validations or counts sticks with current ledger
        assert_eq!(harness.validations.get_preferred_lcl(&a, 0, &peer_counts), a.id());

        peer_counts.insert(b.id(), 1);

        // No trusted validations, rely on peer counts
        assert_eq!(harness.validations.get_preferred_lcl(&a, 0, &peer_counts), b.id());

        peer_counts.insert(c.id(), 1);

        // No trusted validations, tied peers goes with larger ID
        assert!(c.id() > b.id());
        assert_eq!(harness.validations.get_preferred_lcl(&a, 0, &peer_counts), c.id());

        peer_counts.insert(c.id(), 1001);

        // Single trusted always wins over peer counts
        assert_eq!(harness.add(&a_node.validate_ledger(&a)), ValidationStatus::Current);
        assert_eq!(harness.validations.get_preferred_lcl(&a, 0, &peer_counts), a.id());
        assert_eq!(harness.validations.get_preferred_lcl(&b, 0, &peer_counts), a.id());
        assert_eq!(harness.validations.get_preferred_lcl(&c, 0, &peer_counts), a.id());

        // Stick with current ledger if trusted validation ledger has too old
        // of a sequence
        assert_eq!(harness.validations.get_preferred_lcl(&b, 2, &peer_counts), b.id());
    }

    #[test]
    fn test_acquire_validated_ledger() {
        let mut h = LedgerHistoryHelper::new();
        let ab = h.get_or_create("ab");
        let az = h.get_or_create("az");
        let genesis = SimulatedLedger::genesis();

        let harness = TestHarness::new(h.into_oracle());
        harness.adaptor().hide(ab.id());
        harness.adaptor().hide(az.id());
        let a_node = harness.make_node(1);
        let b_node = harness.make_node(2);

        // Validate the ledger before it is actually available
        assert_eq!(harness.add(&a_node.validate_ledger(&ab)), ValidationStatus::Current);
        // Validation is available
        assert_eq!(harness.validations.num_trusted_for_ledger(&ab.id()), 1);
        // but ledger based data is not
        assert_eq!(harness.validations.get_nodes_after(&genesis, genesis.id()), 0);
        // Initial preferred branch falls back to the ledger we are trying to
        // acquire
        assert_eq!(harness.validations.get_preferred(&genesis), Some((ab.seq(), ab.id())));

        // After adding another unavailable validation, the preferred ledger
        // breaks ties via higher id
        assert!(az.id() > ab.id());
        assert_eq!(harness.add(&b_node.validate_ledger(&az)), ValidationStatus::Current);
        assert_eq!(harness.validations.get_preferred(&genesis), Some((az.seq(), az.id())));

        // Once the ledger arrives it is accounted for in the trie
        harness.adaptor().reveal(ab.id());
        assert_eq!(harness.validations.get_nodes_after(&genesis, genesis.id()), 1);
        assert_eq!(harness.validations.get_preferred(&genesis), Some((ab.seq(), ab.id())));

        harness.adaptor().reveal(az.id());
        assert_eq!(harness.validations.get_nodes_after(&genesis, genesis.id()), 2);
        assert_eq!(harness.validations.get_preferred(&genesis), Some((az.seq(), az.id())));
    }

    #[test]
    fn test_acquire_can_query_tracker() {
        let mut h = LedgerHistoryHelper::new();
        let ab = h.get_or_create("ab");
        let genesis = SimulatedLedger::genesis();
        let clock = Arc::new(ManualClock::new());

        let validations = Arc::new(Validations::new(
            ValidationParams::default(),
            QueryingAdaptor::new(TestAdaptor::new(h.into_oracle(), clock.clone())),
        ));
        validations.adaptor().attach(&validations);
        validations.adaptor().inner.hide(ab.id());

        let node = TestNode::new(PeerId(1), clock);
        let v = node.validate_ledger(&ab);
        assert_eq!(validations.add(&node.node_id(), &v), ValidationStatus::Current);
        // The validation is stored before the ledger is fetched
        assert_eq!(validations.adaptor().seen(), vec![(1, 0)]);
        assert_eq!(validations.get_nodes_after(&genesis, genesis.id()), 0);
        assert_eq!(validations.adaptor().seen().len(), 2);

        validations.adaptor().inner.reveal(ab.id());
        assert_eq!(validations.get_nodes_after(&genesis, genesis.id()), 1);
        assert_eq!(validations.get_preferred(&genesis), Some((ab.seq(), ab.id())));
        // Fetching the ledger saw it still outside the trie
        assert_eq!(validations.adaptor().seen().last(), Some(&(1, 0)));

        // Trust changes fetch with the lock released too
        validations.trust_changed(&HashSet::new(), &HashSet::from([node.node_id()]));
        validations.trust_changed(&HashSet::from([node.node_id()]), &HashSet::new());
        assert_eq!(validations.get_nodes_after(&genesis, genesis.id()), 1);
    }

    #[test]
    fn test_trust_changed() {
        let mut h = LedgerHistoryHelper::new();
        let ab = h.get_or_create("ab");
        let oracle = h.into_oracle();
        let genesis = SimulatedLedger::genesis();

        // Trusted to untrusted
        let harness = TestHarness::new(oracle.clone());
        let a_node = harness.make_node(1);
        assert_eq!(harness.add(&a_node.validate_ledger(&ab)), ValidationStatus::Current);
        assert_eq!(harness.validations.num_trusted_for_ledger(&ab.id()), 1);
        assert_eq!(harness.validations.get_preferred(&genesis), Some((ab.seq(), ab.id())));

        harness
            .validations
            .trust_changed(&HashSet::new(), &HashSet::from([a_node.node_id()]));
        assert_eq!(harness.validations.num_trusted_for_ledger(&ab.id()), 0);
        assert!(harness.validations.current_trusted().is_empty());
        assert_eq!(harness.validations.get_preferred(&genesis), None);

        // Untrusted to trusted
        let harness = TestHarness::new(oracle);
        let mut a_node = harness.make_node(1);
        a_node.untrust();
        assert_eq!(harness.add(&a_node.validate_ledger(&ab)), ValidationStatus::Current);
        assert_eq!(harness.validations.num_trusted_for_ledger(&ab.id()), 0);
        assert_eq!(harness.validations.get_preferred(&genesis), None);

        harness
            .validations
            .trust_changed(&HashSet::from([a_node.node_id()]), &HashSet::new());
        assert_eq!(harness.validations.num_trusted_for_ledger(&ab.id()), 1);
        assert_eq!(harness.validations.current_trusted().len(), 1);
        assert_eq!(harness.validations.get_preferred(&genesis), Some((ab.seq(), ab.id())));
    }

    #[test]
    #[traced_test]
    fn test_fork_reported_once() {
        let harness = TestHarness::new(LedgerOracle::new());
        let a_node = harness.make_node(1);
        let b_node = harness.make_node(2);
        let c_node = harness.make_node(3);

        let first = a_node.validate(LedgerId(1000), 100, DurationOffset::Zero, DurationOffset::Zero, true);
        let second = b_node.validate(LedgerId(1001), 100, DurationOffset::Zero, DurationOffset::Zero, true);
        assert_eq!(harness.add(&first), ValidationStatus::Current);
        assert!(harness.adaptor().mismatches().is_empty());
        assert_eq!(harness.add(&second), ValidationStatus::Current);

        let fork = Mismatch::Fork {
            seq: 100,
            ledger_ids: vec![LedgerId(1000), LedgerId(1001)],
        };
        assert_eq!(harness.adaptor().mismatches(), vec![fork.clone()]);
        assert_eq!(harness.validations.current_trusted().len(), 2);

        // Joining an already reported side does not report again
        let third = c_node.validate(LedgerId(1000), 100, DurationOffset::Zero, DurationOffset::Zero, true);
        assert_eq!(harness.add(&third), ValidationStatus::Current);
        assert_eq!(harness.adaptor().mismatches(), vec![fork]);
        assert!(logs_contain("Trusted validators validated different ledgers"));
    }

    #[test]
    fn test_fork_ignores_untrusted_and_partial() {
        let harness = TestHarness::new(LedgerOracle::new());
        let a_node = harness.make_node(1);
        let mut b_node = harness.make_node(2);
        let c_node = harness.make_node(3);
        b_node.untrust();

        let trusted = a_node.validate(LedgerId(1000), 100, DurationOffset::Zero, DurationOffset::Zero, true);
        let untrusted = b_node.validate(LedgerId(1001), 100, DurationOffset::Zero, DurationOffset::Zero, true);
        let partial = c_node.validate(LedgerId(1002), 100, DurationOffset::Zero, DurationOffset::Zero, false);
        for val in [trusted, untrusted, partial] {
            assert_eq!(harness.add(&val), ValidationStatus::Current);
        }
        assert!(harness.adaptor().mismatches().is_empty());
    }

    #[test]
    fn test_check_local() {
        let mut h = LedgerHistoryHelper::new();
        let ab = h.get_or_create("ab");
        let az = h.get_or_create("az");

        let harness = TestHarness::new(h.into_oracle());
        for id in 1..=3 {
            let node = harness.make_node(id);
            assert_eq!(harness.add(&node.validate_ledger(&ab)), ValidationStatus::Current);
        }

        // Not enough support for a quorum
        assert_eq!(harness.validations.check_local(&az, 4), None);
        assert!(harness.adaptor().mismatches().is_empty());

        assert_eq!(harness.validations.check_local(&ab, 3), Some(ab.id()));
        assert!(harness.adaptor().mismatches().is_empty());

        assert_eq!(harness.validations.check_local(&az, 3), Some(ab.id()));
        assert_eq!(
            harness.adaptor().mismatches(),
            vec![Mismatch::Local {
                seq: az.seq(),
                local: az.id(),
                validated: ab.id(),
            }]
        );
    }

    #[test]
    fn test_laggards() {
        let mut h = LedgerHistoryHelper::new();
        let a = h.get_or_create("a");
        let ab = h.get_or_create("ab");

        let harness = TestHarness::new(h.into_oracle());
        let a_node = harness.make_node(1);
        let b_node = harness.make_node(2);
        let c_node = harness.make_node(3);

        assert_eq!(harness.add(&a_node.validate_ledger(&a)), ValidationStatus::Current);
        assert_eq!(harness.add(&b_node.validate_ledger(&a)), ValidationStatus::Current);
        assert_eq!(harness.add(&c_node.validate_ledger(&ab)), ValidationStatus::Current);

        let all_keys = || HashSet::from([a_node.curr_key(), b_node.curr_key(), c_node.curr_key()]);

        // Everyone has caught up to seq 1
        let mut keys = all_keys();
        assert_eq!(harness.validations.laggards(a.seq(), &mut keys), 0);
        assert!(keys.is_empty());

        // a_node and b_node are still on seq 1
        let mut keys = all_keys();
        assert_eq!(harness.validations.laggards(ab.seq(), &mut keys), 2);

        // Only fresh validations count
        harness.advance_time(harness.params().validation_freshness());
        let mut keys = all_keys();
        assert_eq!(harness.validations.laggards(ab.seq(), &mut keys), 0);
        assert!(keys.is_empty());
    }

    #[test]
    fn test_can_validate_seq() {
        let harness = TestHarness::new(LedgerOracle::new());
        assert!(harness.validations.can_validate_seq(1));
        assert!(!harness.validations.can_validate_seq(1));
        assert!(harness.validations.can_validate_seq(10));
        assert!(!harness.validations.can_validate_seq(5));

        harness.advance_time(harness.params().validation_set_expires() + Duration::from_secs(1));
        assert!(harness.validations.can_validate_seq(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds() {
        const NODES: u32 = 8;
        const ROUNDS: u32 = 20;

        let harness = Arc::new(TestHarness::new(LedgerOracle::new()));
        let tasks: Vec<_> = (1..=NODES)
            .map(|id| {
                let harness = harness.clone();
                tokio::spawn(async move {
                    let node = harness.make_node(id);
                    for seq in 1..=ROUNDS {
                        let val = node.validate(
                            LedgerId(seq),
                            seq,
                            DurationOffset::Plus(Duration::from_millis(seq as u64)),
                            DurationOffset::Zero,
                            true,
                        );
                        assert_eq!(harness.add(&val), ValidationStatus::Current);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        let current = harness.validations.current_trusted();
        assert_eq!(current.len(), NODES as usize);
        assert!(current.iter().all(|val| val.seq() == ROUNDS));
        assert_eq!(harness.adaptor().stale().len(), (NODES * (ROUNDS - 1)) as usize);
        assert!(harness.adaptor().mismatches().is_empty());
    }

    pub enum DurationOffset {
        Plus(Duration),
        Minus(Duration),
        Zero,
    }

    impl DurationOffset {
        pub fn apply_to(&self, sys_time: SystemTime) -> SystemTime {
            match self {
                DurationOffset::Plus(d) => sys_time + *d,
                DurationOffset::Minus(d) => sys_time - *d,
                DurationOffset::Zero => sys_time,
            }
        }
    }

    struct TestNode {
        node_id: PeerId,
        trusted: bool,
        sign_idx: usize,
        load_fee: Option<u32>,
        clock: Arc<ManualClock>,
    }

    impl TestNode {
        pub fn new(node_id: PeerId, clock: Arc<ManualClock>) -> Self {
            TestNode {
                node_id,
                trusted: true,
                sign_idx: 1,
                load_fee: None,
                clock,
            }
        }

        pub fn untrust(&mut self) {
            self.trusted = false;
        }

        pub fn set_load_fee(&mut self, fee: u32) {
            self.load_fee = Some(fee);
        }

        pub fn node_id(&self) -> PeerId {
            self.node_id
        }

        pub fn advance_key(&mut self) {
            self.sign_idx += 1;
        }

        pub fn curr_key(&self) -> PeerKey {
            PeerKey(self.node_id, self.sign_idx)
        }

        pub fn validate(
            &self,
            id: LedgerId,
            seq: LedgerIndex,
            sign_offset: DurationOffset,
            seen_offset: DurationOffset,
            full: bool,
        ) -> TestValidation {
            let now = self.clock.now();
            TestValidation::new(
                id,
                seq,
                sign_offset.apply_to(now),
                seen_offset.apply_to(now),
                self.curr_key(),
                self.node_id,
                self.trusted,
                full,
                self.load_fee,
                None,
            )
        }

        pub fn validate_full(
            &self,
            ledger: &SimulatedLedger,
            sign_offset: DurationOffset,
            seen_offset: DurationOffset,
        ) -> TestValidation {
            self.validate(ledger.id(), ledger.seq(), sign_offset, seen_offset, true)
        }

        pub fn validate_ledger(&self, ledger: &SimulatedLedger) -> TestValidation {
            self.validate(ledger.id(), ledger.seq(), DurationOffset::Zero, DurationOffset::Zero, true)
        }

        pub fn validate_with_cookie(&self, ledger: &SimulatedLedger, cookie: u64) -> TestValidation {
            let now = self.clock.now();
            TestValidation::new(
                ledger.id(),
                ledger.seq(),
                now,
                now,
                self.curr_key(),
                self.node_id,
                self.trusted,
                true,
                self.load_fee,
                Some(cookie),
            )
        }

        pub fn partial(&self, ledger: &SimulatedLedger) -> TestValidation {
            self.validate(ledger.id(), ledger.seq(), DurationOffset::Zero, DurationOffset::Zero, false)
        }
    }

    /// Adaptor backed by a ledger oracle. Ledgers can be hidden to simulate
    /// ones still being fetched from the network.
    struct TestAdaptor {
        oracle: LedgerOracle,
        clock: Arc<ManualClock>,
        hidden: Mutex<HashSet<LedgerId>>,
        stale: Mutex<Vec<TestValidation>>,
        flushed: Mutex<HashMap<PeerId, TestValidation>>,
        mismatches: Mutex<Vec<Mismatch<LedgerId>>>,
    }

    impl TestAdaptor {
        fn new(oracle: LedgerOracle, clock: Arc<ManualClock>) -> Self {
            TestAdaptor {
                oracle,
                clock,
                hidden: Default::default(),
                stale: Default::default(),
                flushed: Default::default(),
                mismatches: Default::default(),
            }
        }

        fn hide(&self, id: LedgerId) {
            self.hidden.lock().insert(id);
        }

        fn reveal(&self, id: LedgerId) {
            self.hidden.lock().remove(&id);
        }

        fn stale(&self) -> Vec<TestValidation> {
            self.stale.lock().clone()
        }

        fn flushed(&self) -> HashMap<PeerId, TestValidation> {
            self.flushed.lock().clone()
        }

        fn mismatches(&self) -> Vec<Mismatch<LedgerId>> {
            self.mismatches.lock().clone()
        }
    }

    impl Adaptor for TestAdaptor {
        type ValidationType = TestValidation;
        type LedgerType = SimulatedLedger;
        type LedgerIdType = LedgerId;
        type NodeIdType = PeerId;
        type NodeKeyType = PeerKey;

        fn now(&self) -> SystemTime {
            self.clock.now()
        }

        fn acquire(&self, ledger_id: &LedgerId) -> Option<SimulatedLedger> {
            if self.hidden.lock().contains(ledger_id) {
                return None;
            }
            self.oracle.lookup(ledger_id)
        }

        fn on_stale(&self, validation: TestValidation) {
            self.stale.lock().push(validation);
        }

        fn flush(&self, remaining: HashMap<PeerId, TestValidation>) {
            self.flushed.lock().extend(remaining);
        }

        fn on_mismatch(&self, mismatch: Mismatch<LedgerId>) {
            self.mismatches.lock().push(mismatch);
        }
    }

    type TestValidations = Validations<TestAdaptor, ArenaLedgerTrie<SimulatedLedger>>;

    type QueryingValidations = Validations<QueryingAdaptor, ArenaLedgerTrie<SimulatedLedger>>;

    /// Adaptor that queries the tracker that owns it while fetching a ledger.
    /// Records the trusted validation count and the nodes after genesis each
    /// time a ledger is fetched.
    struct QueryingAdaptor {
        inner: TestAdaptor,
        tracker: OnceLock<Weak<QueryingValidations>>,
        seen: Mutex<Vec<(usize, usize)>>,
    }

    impl QueryingAdaptor {
        fn new(inner: TestAdaptor) -> Self {
            QueryingAdaptor {
                inner,
                tracker: OnceLock::new(),
                seen: Default::default(),
            }
        }

        fn attach(&self, tracker: &Arc<QueryingValidations>) {
            let _ = self.tracker.set(Arc::downgrade(tracker));
        }

        fn seen(&self) -> Vec<(usize, usize)> {
            self.seen.lock().clone()
        }
    }

    impl Adaptor for QueryingAdaptor {
        type ValidationType = TestValidation;
        type LedgerType = SimulatedLedger;
        type LedgerIdType = LedgerId;
        type NodeIdType = PeerId;
        type NodeKeyType = PeerKey;

        fn now(&self) -> SystemTime {
            self.inner.now()
        }

        fn acquire(&self, ledger_id: &LedgerId) -> Option<SimulatedLedger> {
            if let Some(tracker) = self.tracker.get().and_then(Weak::upgrade) {
                let genesis = SimulatedLedger::genesis();
                let trusted = tracker.current_trusted().len();
                let after = tracker.get_nodes_after(&genesis, genesis.id());
                self.seen.lock().push((trusted, after));
            }
            self.inner.acquire(ledger_id)
        }

        fn on_stale(&self, validation: TestValidation) {
            self.inner.on_stale(validation);
        }

        fn flush(&self, remaining: HashMap<PeerId, TestValidation>) {
            self.inner.flush(remaining);
        }

        fn on_mismatch(&self, mismatch: Mismatch<LedgerId>) {
            self.inner.on_mismatch(mismatch);
        }
    }

    struct TestHarness {
        validations: TestValidations,
        clock: Arc<ManualClock>,
    }

    impl TestHarness {
        pub fn new(oracle: LedgerOracle) -> Self {
            let clock = Arc::new(ManualClock::new());
            TestHarness {
                validations: Validations::new(ValidationParams::default(), TestAdaptor::new(oracle, clock.clone())),
                clock,
            }
        }

        pub fn add(&self, v: &TestValidation) -> ValidationStatus {
            self.validations.add(&v.node_id(), v)
        }

        pub fn make_node(&self, id: u32) -> TestNode {
            TestNode::new(PeerId(id), self.clock.clone())
        }

        pub fn adaptor(&self) -> &TestAdaptor {
            self.validations.adaptor()
        }

        pub fn params(&self) -> ValidationParams {
            self.validations.params().clone()
        }

        pub fn advance_time(&self, dur: Duration) {
            self.clock.advance(dur);
        }
    }
}
