//! Validators and the weighted committee they form.

use crate::{Address, PeerId, PublicKey};
use std::collections::HashSet;
use std::fmt;

/// Errors constructing a validator set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidatorSetError {
    #[error("validator set is empty")]
    Empty,

    #[error("duplicate validator address {0}")]
    DuplicateAddress(Address),

    #[error("validator {0} has zero voting power")]
    ZeroVotingPower(Address),

    #[error("total voting power overflows")]
    TotalPowerOverflow,
}

/// A committee member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validator {
    pub address: Address,
    pub public_key: PublicKey,
    pub voting_power: u64,
    /// Proposer-priority accumulator. Only changed by `increment_accum`.
    pub proposer_priority: i64,
}

impl Validator {
    pub fn new(public_key: PublicKey, voting_power: u64) -> Self {
        Self {
            address: public_key.address(),
            public_key,
            voting_power,
            proposer_priority: 0,
        }
    }

    /// Whether `self` should be preferred over `other` as proposer.
    fn outranks(&self, other: &Validator) -> bool {
        match self.proposer_priority.cmp(&other.proposer_priority) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.address < other.address,
        }
    }
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Validator{{{} VP:{} A:{}}}",
            self.address, self.voting_power, self.proposer_priority
        )
    }
}

/// Ordered, de-duplicated committee with weighted round-robin proposer
/// selection.
///
/// Each rotation step adds every validator's power to its priority, picks the
/// highest priority (ties go to the smaller address) and charges the winner
/// the total power. Over many steps each validator proposes in proportion to
/// its power.
///
/// `increment_accum` mutates in place; callers that share a set must rotate a
/// clone (`copy_increment_accum`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_voting_power: u64,
    /// Index of the cached proposer.
    proposer: Option<usize>,
}

impl ValidatorSet {
    /// Build a set, preserving the given order.
    pub fn new(validators: Vec<Validator>) -> Result<Self, ValidatorSetError> {
        if validators.is_empty() {
            return Err(ValidatorSetError::Empty);
        }
        let mut seen = HashSet::with_capacity(validators.len());
        let mut total: u64 = 0;
        for v in &validators {
            if !seen.insert(v.address) {
                return Err(ValidatorSetError::DuplicateAddress(v.address));
            }
            if v.voting_power == 0 {
                return Err(ValidatorSetError::ZeroVotingPower(v.address));
            }
            total = total
                .checked_add(v.voting_power)
                .ok_or(ValidatorSetError::TotalPowerOverflow)?;
        }
        // Priorities are charged `total` per step; keep that within i64.
        if total > i64::MAX as u64 / 4 {
            return Err(ValidatorSetError::TotalPowerOverflow);
        }
        Ok(Self {
            validators,
            total_voting_power: total,
            proposer: None,
        })
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_voting_power(&self) -> u64 {
        self.total_voting_power
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn iter(&self) -> impl Iterator<Item = &Validator> {
        self.validators.iter()
    }

    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    pub fn get_by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.validators
            .iter()
            .enumerate()
            .find(|(_, v)| v.address == *address)
            .map(|(i, v)| (i as u32, v))
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// True when `power` is strictly more than two thirds of the total.
    pub fn has_two_thirds(&self, power: u64) -> bool {
        (power as u128) * 3 > (self.total_voting_power as u128) * 2
    }

    /// Advance proposer priorities by `times` rotation steps.
    pub fn increment_accum(&mut self, times: u32) {
        for _ in 0..times {
            for v in &mut self.validators {
                v.proposer_priority += v.voting_power as i64;
            }
            let winner = self.highest_priority();
            self.validators[winner].proposer_priority -= self.total_voting_power as i64;
            self.proposer = Some(winner);
        }
    }

    /// Clone and advance the clone by `times` steps.
    pub fn copy_increment_accum(&self, times: u32) -> Self {
        let mut copy = self.clone();
        copy.increment_accum(times);
        copy
    }

    /// Clone advanced by `steps` rotation steps, for gaps too large to
    /// replay one by one.
    ///
    /// From all-zero priorities the rotation returns to all-zero after
    /// exactly `total_voting_power` steps, so only `1..=total_voting_power`
    /// steps are replayed. Other starting points are replayed in full.
    pub fn copy_advance(&self, steps: u64) -> Self {
        let fresh = self.validators.iter().all(|v| v.proposer_priority == 0);
        let mut remaining = if fresh && steps > 0 {
            (steps - 1) % self.total_voting_power + 1
        } else {
            steps
        };
        let mut copy = self.clone();
        while remaining > 0 {
            let chunk = u32::try_from(remaining).unwrap_or(u32::MAX);
            copy.increment_accum(chunk);
            remaining -= u64::from(chunk);
        }
        copy
    }

    /// The current proposer.
    ///
    /// Before any rotation this is the validator with the highest priority,
    /// which for a fresh set is the smallest address.
    pub fn get_proposer(&self) -> &Validator {
        let index = self.proposer.unwrap_or_else(|| self.highest_priority());
        &self.validators[index]
    }

    fn highest_priority(&self) -> usize {
        let mut best = 0;
        for (i, v) in self.validators.iter().enumerate().skip(1) {
            if v.outranks(&self.validators[best]) {
                best = i;
            }
        }
        best
    }

    /// Peer ids of every member, used to admit transport connections.
    pub fn make_ids(&self) -> HashSet<PeerId> {
        self.validators
            .iter()
            .map(|v| PeerId::from_address(&v.address))
            .collect()
    }
}

impl fmt::Display for ValidatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ValidatorSet{{n:{} power:{} proposer:{}}}",
            self.validators.len(),
            self.total_voting_power,
            self.get_proposer().address
        )
    }
}
