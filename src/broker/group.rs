//! Consumer group coordination
//!
//! A group owns, per partition of its topic, a committed offset (where the
//! group resumes) and a fetch position (what the current owner has already
//! been handed). Every membership change rebalances the whole group, and any
//! partition that changes hands restarts from its committed offset. That is
//! what turns "fetched but not committed" into "redelivered".

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::broker::record::Record;
use crate::broker::topic::Topic;
use crate::broker::transport::RebalanceListener;
use crate::config::OffsetReset;
use crate::utils::{Error, Result};

pub type MemberId = String;

struct Member {
    listener: Option<Arc<dyn RebalanceListener>>,
    assigned: Vec<u32>,
}

/// Ownership delta for one member produced by a rebalance.
pub struct AssignmentChange {
    pub member_id: MemberId,
    pub listener: Option<Arc<dyn RebalanceListener>>,
    pub revoked: Vec<u32>,
    pub assigned: Vec<u32>,
}

impl AssignmentChange {
    /// Invokes the member's listener, revocations first.
    pub fn notify(&self) {
        if let Some(listener) = &self.listener {
            if !self.revoked.is_empty() {
                listener.on_partitions_revoked(&self.member_id, &self.revoked);
            }
            if !self.assigned.is_empty() {
                listener.on_partitions_assigned(&self.member_id, &self.assigned);
            }
        }
    }
}

pub struct ConsumerGroupState {
    pub group_id: String,
    reset: OffsetReset,
    // BTreeMap keeps assignment deterministic for a given member set
    members: BTreeMap<MemberId, Member>,
    committed: HashMap<u32, u64>,
    positions: HashMap<u32, u64>,
    generation: u64,
}

impl ConsumerGroupState {
    pub fn new(group_id: &str, reset: OffsetReset) -> Self {
        Self {
            group_id: group_id.to_string(),
            reset,
            members: BTreeMap::new(),
            committed: HashMap::new(),
            positions: HashMap::new(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Adds (or re-registers) a member and rebalances.
    pub fn join(
        &mut self,
        member_id: &str,
        listener: Option<Arc<dyn RebalanceListener>>,
        topic: &Topic,
    ) -> Vec<AssignmentChange> {
        let previous = self.members.insert(
            member_id.to_string(),
            Member {
                listener,
                assigned: Vec::new(),
            },
        );

        let mut changes = Vec::new();
        if let Some(previous) = previous.filter(|m| !m.assigned.is_empty()) {
            // a rejoin drops whatever the stale registration owned
            changes.push(AssignmentChange {
                member_id: member_id.to_string(),
                listener: previous.listener,
                revoked: previous.assigned,
                assigned: Vec::new(),
            });
        }
        changes.extend(self.rebalance(topic));
        changes
    }

    /// Removes a member and hands its partitions to the others.
    pub fn leave(&mut self, member_id: &str, topic: &Topic) -> Vec<AssignmentChange> {
        let Some(member) = self.members.remove(member_id) else {
            return Vec::new();
        };

        let mut changes = vec![AssignmentChange {
            member_id: member_id.to_string(),
            listener: member.listener,
            revoked: member.assigned,
            assigned: Vec::new(),
        }];
        changes.extend(self.rebalance(topic));
        changes
    }

    /// Round-robin assignment over members sorted by id: partition `p` goes
    /// to member `p % n`.
    fn rebalance(&mut self, topic: &Topic) -> Vec<AssignmentChange> {
        self.generation += 1;

        let ids: Vec<MemberId> = self.members.keys().cloned().collect();
        let mut target: HashMap<&str, Vec<u32>> = HashMap::new();
        if !ids.is_empty() {
            for partition in 0..topic.partition_count() {
                let owner = &ids[partition as usize % ids.len()];
                target.entry(owner.as_str()).or_default().push(partition);
            }
        }

        let mut changes = Vec::new();
        for (id, member) in self.members.iter_mut() {
            let next = target.remove(id.as_str()).unwrap_or_default();
            let revoked: Vec<u32> = member
                .assigned
                .iter()
                .filter(|p| !next.contains(p))
                .copied()
                .collect();
            let assigned: Vec<u32> = next
                .iter()
                .filter(|p| !member.assigned.contains(p))
                .copied()
                .collect();
            member.assigned = next;

            if !revoked.is_empty() || !assigned.is_empty() {
                changes.push(AssignmentChange {
                    member_id: id.clone(),
                    listener: member.listener.clone(),
                    revoked,
                    assigned,
                });
            }
        }

        for partition in changes.iter().flat_map(|c| c.assigned.iter().copied()) {
            let start = self.start_offset(partition, topic);
            self.positions.insert(partition, start);
        }

        changes
    }

    /// Committed offset, or the reset policy when the group never committed.
    fn start_offset(&mut self, partition: u32, topic: &Topic) -> u64 {
        if let Some(offset) = self.committed.get(&partition) {
            return *offset;
        }
        let offset = match self.reset {
            OffsetReset::Earliest => 0,
            OffsetReset::Latest => topic.end_offset(partition),
        };
        self.committed.insert(partition, offset);
        offset
    }

    pub fn assigned(&self, member_id: &str) -> Vec<u32> {
        self.members
            .get(member_id)
            .map(|m| m.assigned.clone())
            .unwrap_or_default()
    }

    pub fn owner_of(&self, partition: u32) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, m)| m.assigned.contains(&partition))
            .map(|(id, _)| id.as_str())
    }

    pub fn committed(&self, partition: u32) -> Option<u64> {
        self.committed.get(&partition).copied()
    }

    /// Hands the member the next records of its partitions and advances the
    /// fetch positions past them.
    pub fn fetch(&mut self, member_id: &str, topic: &Topic, max: usize) -> Result<Vec<Record>> {
        let partitions = self
            .members
            .get(member_id)
            .map(|m| m.assigned.clone())
            .ok_or_else(|| self.not_a_member(member_id))?;

        let mut batch = Vec::new();
        for partition in partitions {
            if batch.len() >= max {
                break;
            }
            let position = self.positions.get(&partition).copied().unwrap_or(0);
            let records = topic.read(partition, position, max - batch.len());
            self.positions
                .insert(partition, position + records.len() as u64);
            batch.extend(records);
        }
        Ok(batch)
    }

    /// Records `offset` as processed, so the group resumes at `offset + 1`.
    pub fn commit(&mut self, member_id: &str, partition: u32, offset: u64) -> Result<()> {
        self.ensure_owner(member_id, partition)?;
        let next = offset + 1;
        let committed = self.committed.entry(partition).or_insert(0);
        if next > *committed {
            *committed = next;
        }
        Ok(())
    }

    pub fn seek(&mut self, member_id: &str, partition: u32, offset: u64) -> Result<()> {
        self.ensure_owner(member_id, partition)?;
        self.positions.insert(partition, offset);
        Ok(())
    }

    fn ensure_owner(&self, member_id: &str, partition: u32) -> Result<()> {
        match self.owner_of(partition) {
            Some(owner) if owner == member_id => Ok(()),
            _ => Err(Error::Transport(format!(
                "member '{member_id}' of group '{}' does not own partition {partition} (generation {})",
                self.group_id, self.generation
            ))),
        }
    }

    fn not_a_member(&self, member_id: &str) -> Error {
        Error::Transport(format!(
            "'{member_id}' is not a member of group '{}'",
            self.group_id
        ))
    }
}
