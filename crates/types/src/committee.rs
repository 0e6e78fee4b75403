//! Committee membership supplied by the chain agent.

use crate::{Address, PublicKey, Validator, ValidatorSet, ValidatorSetError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Voting power assigned to every used committee member.
pub const MEMBER_VOTING_POWER: u64 = 1;

/// Whether a member currently takes part in consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberFlag {
    Used,
    Removed,
    Unused,
}

/// How a member joined the committee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberType {
    /// Seed member, fixed by chain configuration.
    Fixed,
    /// Elected member.
    Worked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub public_key: PublicKey,
    pub flag: MemberFlag,
    pub member_type: MemberType,
    /// Reward address; informational only.
    #[serde(default)]
    pub address: Option<Address>,
}

impl CommitteeMember {
    pub fn new(public_key: PublicKey, flag: MemberFlag, member_type: MemberType) -> Self {
        Self {
            public_key,
            flag,
            member_type,
            address: None,
        }
    }

    /// Validator address derived from the member's key.
    pub fn validator_address(&self) -> Address {
        self.public_key.address()
    }

    /// Same key, flag and type.
    pub fn same_as(&self, other: &CommitteeMember) -> bool {
        self.public_key == other.public_key
            && self.flag == other.flag
            && self.member_type == other.member_type
    }
}

/// One committee as handed over by the chain agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeInfo {
    pub id: u64,
    pub start_height: u64,
    /// Last height the committee decides; zero when not yet known.
    #[serde(default)]
    pub end_height: u64,
    pub members: Vec<CommitteeMember>,
    #[serde(default)]
    pub back_members: Vec<CommitteeMember>,
}

impl CommitteeInfo {
    /// Members followed by back members, in order.
    pub fn all_members(&self) -> impl Iterator<Item = &CommitteeMember> {
        self.members.iter().chain(self.back_members.iter())
    }

    /// Validator set of every used member, preserving committee order.
    pub fn validator_set(&self) -> Result<ValidatorSet, ValidatorSetError> {
        let validators = self
            .all_members()
            .filter(|m| m.flag == MemberFlag::Used)
            .map(|m| Validator::new(m.public_key, MEMBER_VOTING_POWER))
            .collect();
        ValidatorSet::new(validators)
    }

    /// Members flagged as removed.
    pub fn removed_members(&self) -> impl Iterator<Item = &CommitteeMember> {
        self.all_members().filter(|m| m.flag == MemberFlag::Removed)
    }
}

impl fmt::Display for CommitteeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Committee{{id:{} start:{} end:{} members:{} back:{}}}",
            self.id,
            self.start_height,
            self.end_height,
            self.members.len(),
            self.back_members.len()
        )
    }
}

/// Network location of a committee member.
///
/// Members listen on two ports; committees alternate between them so that
/// consecutive committees can run side by side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeNode {
    pub public_key: PublicKey,
    pub ip: String,
    pub port: u16,
    pub port2: u16,
}

impl CommitteeNode {
    /// Port used by committee `committee_id`.
    pub fn port_for(&self, committee_id: u64) -> u16 {
        if committee_id % 2 == 0 {
            self.port
        } else {
            self.port2
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    fn member(seed: u8, flag: MemberFlag) -> CommitteeMember {
        CommitteeMember::new(
            KeyPair::from_seed([seed; 32]).public_key(),
            flag,
            MemberType::Worked,
        )
    }

    #[test]
    fn test_validator_set_uses_only_used_members() {
        let info = CommitteeInfo {
            id: 1,
            start_height: 10,
            end_height: 0,
            members: vec![
                member(1, MemberFlag::Used),
                member(2, MemberFlag::Removed),
                member(3, MemberFlag::Used),
            ],
            back_members: vec![member(4, MemberFlag::Used), member(5, MemberFlag::Unused)],
        };
        let set = info.validator_set().unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.total_voting_power(), 3);
        let order: Vec<_> = set.iter().map(|v| v.public_key).collect();
        assert_eq!(
            order,
            vec![
                info.members[0].public_key,
                info.members[2].public_key,
                info.back_members[0].public_key
            ]
        );
        assert_eq!(info.removed_members().count(), 1);
    }

    #[test]
    fn test_all_removed_is_invalid() {
        let info = CommitteeInfo {
            id: 1,
            start_height: 0,
            end_height: 0,
            members: vec![member(1, MemberFlag::Removed)],
            back_members: vec![],
        };
        assert_eq!(info.validator_set(), Err(ValidatorSetError::Empty));
    }

    #[test]
    fn test_port_alternates_by_committee() {
        let node = CommitteeNode {
            public_key: KeyPair::from_seed([1; 32]).public_key(),
            ip: "10.0.0.1".into(),
            port: 30310,
            port2: 30311,
        };
        assert_eq!(node.port_for(4), 30310);
        assert_eq!(node.port_for(5), 30311);
    }
}
