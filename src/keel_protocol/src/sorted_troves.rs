//! Troves ordered by descending nominal collateral ratio.
//!
//! The list is an arena of nodes keyed by owner with explicit `prev`/`next`
//! links. Callers pass hints for the insertion point; the list only walks a
//! bounded number of steps from a hint and reports
//! [`SortedTrovesError::HintOutOfRange`] instead of scanning.

use crate::numeric::Nicr;
use crate::{ProtocolError, StateError, ValidationError};
use candid::{CandidType, Principal};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Live nominal ratio of list members. The ledger's implementation includes
/// pending redistribution rewards.
pub trait NominalRatioSource {
    fn nominal_icr(&self, id: &Principal) -> Nicr;
}

impl NominalRatioSource for BTreeMap<Principal, Nicr> {
    fn nominal_icr(&self, id: &Principal) -> Nicr {
        self.get(id).copied().unwrap_or_default()
    }
}

/// The pair of neighbours an entry is linked between. `None` is the list
/// boundary.
#[derive(CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertPosition {
    pub prev: Option<Principal>,
    pub next: Option<Principal>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortedTrovesError {
    ListFull,
    AlreadyContains,
    NotFound,
    ZeroNicr,
    HintOutOfRange,
}

impl From<SortedTrovesError> for ProtocolError {
    fn from(err: SortedTrovesError) -> Self {
        match err {
            SortedTrovesError::ListFull => ValidationError::ListFull.into(),
            SortedTrovesError::HintOutOfRange => ValidationError::HintOutOfRange.into(),
            SortedTrovesError::ZeroNicr => ValidationError::ZeroAmount.into(),
            SortedTrovesError::AlreadyContains => StateError::TroveAlreadyActive.into(),
            SortedTrovesError::NotFound => StateError::TroveNotActive.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Node {
    prev: Option<Principal>,
    next: Option<Principal>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortedTroves {
    nodes: BTreeMap<Principal, Node>,
    head: Option<Principal>,
    tail: Option<Principal>,
    max_size: u64,
    max_walk: u32,
}

impl SortedTroves {
    pub fn new(max_size: u64, max_walk: u32) -> Self {
        Self {
            nodes: BTreeMap::new(),
            head: None,
            tail: None,
            max_size,
            max_walk,
        }
    }

    pub fn len(&self) -> u64 {
        self.nodes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn contains(&self, id: &Principal) -> bool {
        self.nodes.contains_key(id)
    }

    /// Entry with the highest NICR.
    pub fn first(&self) -> Option<Principal> {
        self.head
    }

    /// Entry with the lowest NICR.
    pub fn last(&self) -> Option<Principal> {
        self.tail
    }

    pub fn next(&self, id: &Principal) -> Option<Principal> {
        self.nodes.get(id).and_then(|node| node.next)
    }

    pub fn prev(&self, id: &Principal) -> Option<Principal> {
        self.nodes.get(id).and_then(|node| node.prev)
    }

    /// Walks from head to tail.
    pub fn iter(&self) -> impl Iterator<Item = Principal> + '_ {
        std::iter::successors(self.head, move |id| self.next(id))
    }

    /// Walks from tail to head, lowest NICR first.
    pub fn iter_from_tail(&self) -> impl Iterator<Item = Principal> + '_ {
        std::iter::successors(self.tail, move |id| self.prev(id))
    }

    /// Checks that linking an entry with `nicr` between `position.prev` and
    /// `position.next` keeps the order. An entry goes after every existing
    /// entry of equal NICR, so earlier insertions rank higher.
    pub fn valid_insert_position(
        &self,
        nicr: Nicr,
        position: InsertPosition,
        source: &impl NominalRatioSource,
    ) -> bool {
        self.valid_position_excluding(nicr, position, source, &BTreeSet::new())
    }

    /// Resolves approximate hints into the exact pair of neighbours.
    pub fn find_insert_position(
        &self,
        nicr: Nicr,
        prev_hint: Option<Principal>,
        next_hint: Option<Principal>,
        source: &impl NominalRatioSource,
    ) -> Result<InsertPosition, SortedTrovesError> {
        self.find_insert_position_excluding(nicr, prev_hint, next_hint, source, &BTreeSet::new())
    }

    /// Like [`Self::find_insert_position`], but treats the `excluded` entries
    /// as already removed. Used to plan a re-insert or a redemption before any
    /// node is unlinked; the returned neighbours are adjacent once the
    /// excluded entries are gone.
    pub fn find_insert_position_excluding(
        &self,
        nicr: Nicr,
        prev_hint: Option<Principal>,
        next_hint: Option<Principal>,
        source: &impl NominalRatioSource,
        excluded: &BTreeSet<Principal>,
    ) -> Result<InsertPosition, SortedTrovesError> {
        let head = self.head_excluding(excluded);
        let tail = self.tail_excluding(excluded);
        if head.is_none() {
            return Ok(InsertPosition::default());
        }

        let usable = |id: &Principal| self.contains(id) && !excluded.contains(id);
        let prev = prev_hint.filter(|p| usable(p) && nicr <= source.nominal_icr(p));
        let next = next_hint.filter(|n| usable(n) && nicr > source.nominal_icr(n));

        match (prev, next) {
            (Some(prev), _) => self.descend(nicr, prev, source, excluded),
            (None, Some(next)) => self.ascend(nicr, next, source, excluded),
            (None, None) => {
                // No usable hint: try both ends of the list.
                let from_head = head.and_then(|h| self.descend(nicr, h, source, excluded).ok());
                match from_head {
                    Some(position) => Ok(position),
                    None => match tail {
                        Some(t) => self.ascend(nicr, t, source, excluded),
                        None => Err(SortedTrovesError::HintOutOfRange),
                    },
                }
            }
        }
    }

    pub fn insert(
        &mut self,
        id: Principal,
        nicr: Nicr,
        prev_hint: Option<Principal>,
        next_hint: Option<Principal>,
        source: &impl NominalRatioSource,
    ) -> Result<InsertPosition, SortedTrovesError> {
        if self.is_full() {
            return Err(SortedTrovesError::ListFull);
        }
        if self.contains(&id) {
            return Err(SortedTrovesError::AlreadyContains);
        }
        if nicr == 0 {
            return Err(SortedTrovesError::ZeroNicr);
        }
        let position = self.find_insert_position(nicr, prev_hint, next_hint, source)?;
        self.link(id, position);
        Ok(position)
    }

    pub fn remove(&mut self, id: &Principal) -> Result<(), SortedTrovesError> {
        let node = self.nodes.remove(id).ok_or(SortedTrovesError::NotFound)?;
        match node.prev {
            Some(prev) => self.node_mut(&prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(&next).prev = node.prev,
            None => self.tail = node.prev,
        }
        Ok(())
    }

    pub fn re_insert(
        &mut self,
        id: Principal,
        new_nicr: Nicr,
        prev_hint: Option<Principal>,
        next_hint: Option<Principal>,
        source: &impl NominalRatioSource,
    ) -> Result<InsertPosition, SortedTrovesError> {
        if !self.contains(&id) {
            return Err(SortedTrovesError::NotFound);
        }
        if new_nicr == 0 {
            return Err(SortedTrovesError::ZeroNicr);
        }
        let excluded = BTreeSet::from([id]);
        let position =
            self.find_insert_position_excluding(new_nicr, prev_hint, next_hint, source, &excluded)?;
        self.remove(&id)?;
        self.link(id, position);
        Ok(position)
    }

    /// Links `id` between a resolved pair of neighbours.
    ///
    /// # Panics
    ///
    /// If `id` is already linked or the neighbours are not adjacent.
    pub(crate) fn link(&mut self, id: Principal, position: InsertPosition) {
        assert!(!self.contains(&id), "bug: {} is already in the trove list", id);
        let adjacent = match (position.prev, position.next) {
            (None, None) => self.is_empty(),
            (None, Some(next)) => self.head == Some(next),
            (Some(prev), None) => self.tail == Some(prev),
            (Some(prev), Some(next)) => self.next(&prev) == Some(next),
        };
        assert!(adjacent, "bug: {:?} is not an adjacent pair", position);

        match position.prev {
            Some(prev) => self.node_mut(&prev).next = Some(id),
            None => self.head = Some(id),
        }
        match position.next {
            Some(next) => self.node_mut(&next).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.nodes.insert(
            id,
            Node {
                prev: position.prev,
                next: position.next,
            },
        );
    }

    fn node_mut(&mut self, id: &Principal) -> &mut Node {
        match self.nodes.get_mut(id) {
            Some(node) => node,
            None => panic!("bug: dangling link to {}", id),
        }
    }

    fn next_excluding(&self, id: &Principal, excluded: &BTreeSet<Principal>) -> Option<Principal> {
        let mut next = self.next(id);
        while let Some(n) = next.filter(|n| excluded.contains(n)) {
            next = self.next(&n);
        }
        next
    }

    fn prev_excluding(&self, id: &Principal, excluded: &BTreeSet<Principal>) -> Option<Principal> {
        let mut prev = self.prev(id);
        while let Some(p) = prev.filter(|p| excluded.contains(p)) {
            prev = self.prev(&p);
        }
        prev
    }

    fn head_excluding(&self, excluded: &BTreeSet<Principal>) -> Option<Principal> {
        self.iter().find(|id| !excluded.contains(id))
    }

    fn tail_excluding(&self, excluded: &BTreeSet<Principal>) -> Option<Principal> {
        self.iter_from_tail().find(|id| !excluded.contains(id))
    }

    fn valid_position_excluding(
        &self,
        nicr: Nicr,
        position: InsertPosition,
        source: &impl NominalRatioSource,
        excluded: &BTreeSet<Principal>,
    ) -> bool {
        let usable = |id: &Principal| self.contains(id) && !excluded.contains(id);
        match (position.prev, position.next) {
            (None, None) => self.head_excluding(excluded).is_none(),
            (None, Some(next)) => {
                usable(&next)
                    && self.head_excluding(excluded) == Some(next)
                    && nicr > source.nominal_icr(&next)
            }
            (Some(prev), None) => {
                usable(&prev)
                    && self.tail_excluding(excluded) == Some(prev)
                    && nicr <= source.nominal_icr(&prev)
            }
            (Some(prev), Some(next)) => {
                usable(&prev)
                    && usable(&next)
                    && self.next_excluding(&prev, excluded) == Some(next)
                    && source.nominal_icr(&prev) >= nicr
                    && nicr > source.nominal_icr(&next)
            }
        }
    }

    // Walks toward the tail starting at `start`, an entry ranking at or
    // above `nicr` (or the head).
    fn descend(
        &self,
        nicr: Nicr,
        start: Principal,
        source: &impl NominalRatioSource,
        excluded: &BTreeSet<Principal>,
    ) -> Result<InsertPosition, SortedTrovesError> {
        if self.head_excluding(excluded) == Some(start) && nicr > source.nominal_icr(&start) {
            return Ok(InsertPosition {
                prev: None,
                next: Some(start),
            });
        }

        let mut prev = start;
        for _ in 0..=self.max_walk {
            let next = self.next_excluding(&prev, excluded);
            let position = InsertPosition {
                prev: Some(prev),
                next,
            };
            if self.valid_position_excluding(nicr, position, source, excluded) {
                return Ok(position);
            }
            match next {
                Some(next) => prev = next,
                None => break,
            }
        }
        Err(SortedTrovesError::HintOutOfRange)
    }

    // Walks toward the head starting at `start`, an entry ranking below
    // `nicr` (or the tail).
    fn ascend(
        &self,
        nicr: Nicr,
        start: Principal,
        source: &impl NominalRatioSource,
        excluded: &BTreeSet<Principal>,
    ) -> Result<InsertPosition, SortedTrovesError> {
        if self.tail_excluding(excluded) == Some(start) && nicr <= source.nominal_icr(&start) {
            return Ok(InsertPosition {
                prev: Some(start),
                next: None,
            });
        }

        let mut next = start;
        for _ in 0..=self.max_walk {
            let prev = self.prev_excluding(&next, excluded);
            let position = InsertPosition {
                prev,
                next: Some(next),
            };
            if self.valid_position_excluding(nicr, position, source, excluded) {
                return Ok(position);
            }
            match prev {
                Some(prev) => next = prev,
                None => break,
            }
        }
        Err(SortedTrovesError::HintOutOfRange)
    }
}
