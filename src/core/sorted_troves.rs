//! Sorted troves index.
//!
//! A doubly linked list of trove owners ordered by nominal collateral ratio
//! (NICR), highest at the head and riskiest at the tail. Ratios are read live
//! through a [`NicrSource`] because pending redistribution rewards change them
//! between touches; each node also keeps the ratio it was inserted with.
//!
//! Callers supply a `(prev, next)` hint. A hint that no longer brackets the
//! ratio is corrected by walking the list, at most `max_hint_traversal` steps.
//! A newly inserted trove is placed ahead of existing troves with an equal
//! ratio.

use serde::{Deserialize, Serialize};

use crate::core::access::{AccessList, Role};
use crate::error::{Error, Result};
use crate::utils::crypto::Address;
use crate::utils::journal::{JournaledMap, Saved, Transactional};

/// Live nominal ratio lookup
pub trait NicrSource {
    /// Current NICR of `id`, including pending rewards
    fn get_nominal_icr(&self, id: Address) -> u128;
}

/// A list node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Trove owner
    pub id: Address,
    /// Neighbour with a higher or equal ratio
    pub prev: Option<Address>,
    /// Neighbour with a lower or equal ratio
    pub next: Option<Address>,
    /// NICR at insertion
    pub nicr: u128,
}

/// Caller-supplied neighbours bracketing an insert position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionHint {
    /// Expected neighbour with a higher ratio
    pub prev: Option<Address>,
    /// Expected neighbour with a lower or equal ratio
    pub next: Option<Address>,
}

impl PositionHint {
    /// No hint; the position is searched from the head
    pub const NONE: Self = Self {
        prev: None,
        next: None,
    };

    /// Hint from a `(prev, next)` pair
    pub fn new(prev: Option<Address>, next: Option<Address>) -> Self {
        Self { prev, next }
    }
}

impl From<(Option<Address>, Option<Address>)> for PositionHint {
    fn from((prev, next): (Option<Address>, Option<Address>)) -> Self {
        Self { prev, next }
    }
}

/// Ordered trove index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortedTroves {
    head: Option<Address>,
    tail: Option<Address>,
    nodes: JournaledMap<Address, Node>,
    max_size: usize,
    max_hint_traversal: u32,
    access: AccessList,
    #[serde(skip)]
    saved: Saved<(Option<Address>, Option<Address>)>,
}

impl SortedTroves {
    /// Create an empty list
    pub fn new(max_size: usize, max_hint_traversal: u32) -> Self {
        Self {
            head: None,
            tail: None,
            nodes: JournaledMap::new(),
            max_size,
            max_hint_traversal,
            access: AccessList::new("sorted_troves"),
            saved: Saved::default(),
        }
    }

    /// Wire trusted callers; only once
    pub fn set_addresses(&mut self, trove_manager: Address, borrower_operations: Address) -> Result<()> {
        self.access.configure([
            (Role::TroveManager, trove_manager),
            (Role::BorrowerOperations, borrower_operations),
        ])
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // MUTATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Insert `id` with ratio `nicr` using a position hint
    pub fn insert(
        &mut self,
        caller: Address,
        source: &dyn NicrSource,
        id: Address,
        nicr: u128,
        prev_hint: Option<Address>,
        next_hint: Option<Address>,
    ) -> Result<()> {
        self.access.require(
            caller,
            &[Role::TroveManager, Role::BorrowerOperations],
            "insert",
        )?;
        self.insert_node(source, id, nicr, prev_hint, next_hint)
    }

    /// Remove `id`
    pub fn remove(&mut self, caller: Address, id: Address) -> Result<()> {
        self.access
            .require(caller, &[Role::TroveManager], "remove")?;
        self.remove_node(id).map(|_| ())
    }

    /// Move `id` to the position for `new_nicr`
    pub fn reinsert(
        &mut self,
        caller: Address,
        source: &dyn NicrSource,
        id: Address,
        new_nicr: u128,
        prev_hint: Option<Address>,
        next_hint: Option<Address>,
    ) -> Result<()> {
        self.access.require(
            caller,
            &[Role::TroveManager, Role::BorrowerOperations],
            "reinsert",
        )?;
        if !self.contains(id) {
            return Err(Error::NodeNotFound(id.to_hex()));
        }
        validate_nicr(new_nicr)?;

        let old = self.remove_node(id)?;
        match self.resolve_position(source, new_nicr, prev_hint, next_hint) {
            Ok((prev, next)) => {
                self.link(id, new_nicr, prev, next);
                Ok(())
            }
            Err(e) => {
                // Back into the slot it was unlinked from
                self.link(id, old.nicr, old.prev, old.next);
                Err(e)
            }
        }
    }

    fn insert_node(
        &mut self,
        source: &dyn NicrSource,
        id: Address,
        nicr: u128,
        prev_hint: Option<Address>,
        next_hint: Option<Address>,
    ) -> Result<()> {
        if self.is_full() {
            return Err(Error::ListFull(self.max_size));
        }
        if self.contains(id) {
            return Err(Error::NodeExists(id.to_hex()));
        }
        if id.is_zero() {
            return Err(Error::InvalidParameter {
                name: "id".into(),
                reason: "zero address".into(),
            });
        }
        validate_nicr(nicr)?;

        let (prev, next) = self.resolve_position(source, nicr, prev_hint, next_hint)?;
        self.link(id, nicr, prev, next);
        Ok(())
    }

    fn resolve_position(
        &self,
        source: &dyn NicrSource,
        nicr: u128,
        prev_hint: Option<Address>,
        next_hint: Option<Address>,
    ) -> Result<(Option<Address>, Option<Address>)> {
        if self.valid_insert_position(source, nicr, prev_hint, next_hint) {
            Ok((prev_hint, next_hint))
        } else {
            self.find_insert_position(source, nicr, prev_hint, next_hint)
        }
    }

    fn link(&mut self, id: Address, nicr: u128, prev: Option<Address>, next: Option<Address>) {
        match prev {
            Some(p) => {
                if let Some(node) = self.nodes.get_mut(&p) {
                    node.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes.get_mut(&n) {
                    node.prev = Some(id);
                }
            }
            None => self.tail = Some(id),
        }
        self.nodes.insert(id, Node { id, prev, next, nicr });
        tracing::debug!(trove = %id.short(), nicr, size = self.nodes.len(), "sorted troves insert");
    }

    fn remove_node(&mut self, id: Address) -> Result<Node> {
        let node = self
            .nodes
            .remove(&id)
            .ok_or_else(|| Error::NodeNotFound(id.to_hex()))?;

        match node.prev {
            Some(p) => {
                if let Some(prev) = self.nodes.get_mut(&p) {
                    prev.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => {
                if let Some(next) = self.nodes.get_mut(&n) {
                    next.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        Ok(node)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // POSITIONING
    // ═══════════════════════════════════════════════════════════════════════════

    /// Whether `(prev, next)` is the exact slot for `nicr`
    pub fn valid_insert_position(
        &self,
        source: &dyn NicrSource,
        nicr: u128,
        prev: Option<Address>,
        next: Option<Address>,
    ) -> bool {
        match (prev, next) {
            (None, None) => self.is_empty(),
            (None, Some(n)) => self.head == Some(n) && nicr >= source.get_nominal_icr(n),
            (Some(p), None) => self.tail == Some(p) && source.get_nominal_icr(p) > nicr,
            (Some(p), Some(n)) => {
                self.get_next(p) == Some(n)
                    && source.get_nominal_icr(p) > nicr
                    && nicr >= source.get_nominal_icr(n)
            }
        }
    }

    /// Correct a hint by walking at most `max_hint_traversal` steps
    pub fn find_insert_position(
        &self,
        source: &dyn NicrSource,
        nicr: u128,
        prev_hint: Option<Address>,
        next_hint: Option<Address>,
    ) -> Result<(Option<Address>, Option<Address>)> {
        self.walk(source, nicr, prev_hint, next_hint, Some(self.max_hint_traversal))
    }

    /// Exact slot for `nicr`, walking from the head without a step bound.
    ///
    /// Meant for callers computing a fresh hint before submitting an action.
    pub fn find_hint(
        &self,
        source: &dyn NicrSource,
        nicr: u128,
    ) -> Result<(Option<Address>, Option<Address>)> {
        self.walk(source, nicr, None, None, None)
    }

    fn walk(
        &self,
        source: &dyn NicrSource,
        nicr: u128,
        prev_hint: Option<Address>,
        next_hint: Option<Address>,
        bound: Option<u32>,
    ) -> Result<(Option<Address>, Option<Address>)> {
        let prev = prev_hint.filter(|p| self.contains(*p) && source.get_nominal_icr(*p) > nicr);
        let next = next_hint.filter(|n| self.contains(*n) && nicr >= source.get_nominal_icr(*n));

        match (prev, next) {
            (None, None) => match self.head {
                Some(head) => self.descend(source, nicr, head, bound),
                None => Ok((None, None)),
            },
            (None, Some(n)) => self.ascend(source, nicr, n, bound),
            (Some(p), _) => self.descend(source, nicr, p, bound),
        }
    }

    fn descend(
        &self,
        source: &dyn NicrSource,
        nicr: u128,
        start: Address,
        bound: Option<u32>,
    ) -> Result<(Option<Address>, Option<Address>)> {
        if self.head == Some(start) && nicr >= source.get_nominal_icr(start) {
            return Ok((None, Some(start)));
        }

        let mut prev = start;
        let mut next = self.get_next(start);
        let mut steps: u32 = 0;

        while !self.valid_insert_position(source, nicr, Some(prev), next) {
            steps += 1;
            if bound.is_some_and(|max| steps > max) {
                tracing::debug!(steps, nicr, "hint walk exceeded bound");
                return Err(Error::StaleHint {
                    max_steps: self.max_hint_traversal,
                });
            }
            prev = next.ok_or_else(|| {
                Error::InvariantViolation("sorted troves order broken while descending".into())
            })?;
            next = self.get_next(prev);
        }

        tracing::debug!(steps, nicr, "hint corrected descending");
        Ok((Some(prev), next))
    }

    fn ascend(
        &self,
        source: &dyn NicrSource,
        nicr: u128,
        start: Address,
        bound: Option<u32>,
    ) -> Result<(Option<Address>, Option<Address>)> {
        if self.tail == Some(start) && source.get_nominal_icr(start) > nicr {
            return Ok((Some(start), None));
        }

        let mut next = start;
        let mut prev = self.get_prev(start);
        let mut steps: u32 = 0;

        while !self.valid_insert_position(source, nicr, prev, Some(next)) {
            steps += 1;
            if bound.is_some_and(|max| steps > max) {
                tracing::debug!(steps, nicr, "hint walk exceeded bound");
                return Err(Error::StaleHint {
                    max_steps: self.max_hint_traversal,
                });
            }
            next = prev.ok_or_else(|| {
                Error::InvariantViolation("sorted troves order broken while ascending".into())
            })?;
            prev = self.get_prev(next);
        }

        tracing::debug!(steps, nicr, "hint corrected ascending");
        Ok((prev, Some(next)))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════════

    /// Whether `id` is in the list
    pub fn contains(&self, id: Address) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Highest-ratio trove
    pub fn get_first(&self) -> Option<Address> {
        self.head
    }

    /// Lowest-ratio trove
    pub fn get_last(&self) -> Option<Address> {
        self.tail
    }

    /// Successor of `id` (lower ratio)
    pub fn get_next(&self, id: Address) -> Option<Address> {
        self.nodes.get(&id).and_then(|n| n.next)
    }

    /// Predecessor of `id` (higher ratio)
    pub fn get_prev(&self, id: Address) -> Option<Address> {
        self.nodes.get(&id).and_then(|n| n.prev)
    }

    /// Node record of `id`
    pub fn node(&self, id: Address) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Number of nodes
    pub fn get_size(&self) -> usize {
        self.nodes.len()
    }

    /// Configured capacity
    pub fn get_max_size(&self) -> usize {
        self.max_size
    }

    /// Whether the capacity is reached
    pub fn is_full(&self) -> bool {
        self.nodes.len() >= self.max_size
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids from head to tail
    pub fn iter(&self) -> impl Iterator<Item = Address> + '_ {
        std::iter::successors(self.head, move |id| self.get_next(*id))
    }

    /// Whether live ratios are non-increasing from head to tail
    pub fn is_ordered(&self, source: &dyn NicrSource) -> bool {
        let ratios: Vec<u128> = self.iter().map(|id| source.get_nominal_icr(id)).collect();
        ratios.windows(2).all(|w| w[0] >= w[1])
    }
}

impl Transactional for SortedTroves {
    fn begin(&mut self) {
        self.saved.save((self.head, self.tail));
        self.nodes.begin();
    }

    fn commit(&mut self) {
        self.saved.clear();
        self.nodes.commit();
    }

    fn rollback(&mut self) {
        if let Some((head, tail)) = self.saved.take() {
            self.head = head;
            self.tail = tail;
        }
        self.nodes.rollback();
    }
}

fn validate_nicr(nicr: u128) -> Result<()> {
    if nicr == 0 {
        return Err(Error::InvalidParameter {
            name: "nicr".into(),
            reason: "must be positive".into(),
        });
    }
    Ok(())
}
