//! Leader election within a Tactical-level group.
//!
//! Liveness is heartbeat-based. When the leader stops heartbeating within
//! the timeout, the surviving members elect a replacement by simple majority
//! of live children. Terms make elections idempotent: a late heartbeat from
//! a deposed leader carries a stale term and is ignored, never merged.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Result, StewardError};

pub struct ElectionGroup {
    group_id: String,
    members: HashSet<String>,
    heartbeat_timeout: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    term: u64,
    /// Leader and the term it was elected for.
    leader: Option<(String, u64)>,
    heartbeats: HashMap<String, Instant>,
    /// term → voter → candidate.
    ballots: HashMap<u64, HashMap<String, String>>,
}

impl ElectionGroup {
    pub fn new(
        group_id: impl Into<String>,
        members: impl IntoIterator<Item = String>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            members: members.into_iter().collect(),
            heartbeat_timeout,
            inner: Mutex::new(Inner {
                term: 0,
                leader: None,
                heartbeats: HashMap::new(),
                ballots: HashMap::new(),
            }),
        }
    }

    pub fn leader(&self) -> Option<(String, u64)> {
        self.inner.lock().leader.clone()
    }

    pub fn current_term(&self) -> u64 {
        self.inner.lock().term
    }

    /// Record a heartbeat. Returns false when the heartbeat is ignored:
    /// unknown member, or a term older than the current one (the deposed-
    /// leader case).
    pub fn heartbeat(&self, node: &str, term: u64) -> bool {
        if !self.members.contains(node) {
            return false;
        }
        let mut inner = self.inner.lock();
        if term < inner.term {
            warn!(
                group = %self.group_id,
                node,
                term,
                current_term = inner.term,
                "Stale-term heartbeat ignored"
            );
            return false;
        }
        inner.heartbeats.insert(node.to_string(), Instant::now());
        true
    }

    pub fn live_members(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut live: Vec<String> = self
            .members
            .iter()
            .filter(|m| {
                inner
                    .heartbeats
                    .get(*m)
                    .is_some_and(|at| at.elapsed() < self.heartbeat_timeout)
            })
            .cloned()
            .collect();
        live.sort();
        live
    }

    pub fn leader_alive(&self) -> bool {
        let leader = {
            let inner = self.inner.lock();
            inner.leader.clone()
        };
        match leader {
            Some((leader, _)) => self.live_members().contains(&leader),
            None => false,
        }
    }

    /// Open a new term. Safe to call repeatedly: each call invalidates the
    /// previous term's heartbeats from the old leader.
    pub fn start_election(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.term += 1;
        info!(group = %self.group_id, term = inner.term, "Election started");
        inner.term
    }

    /// Cast one vote for `term`. Votes from non-live members and for stale
    /// terms are dropped.
    pub fn vote(&self, term: u64, voter: &str, candidate: &str) -> Result<()> {
        if !self.members.contains(candidate) {
            return Err(StewardError::Coordination(format!(
                "vote for non-member {} in group {}",
                candidate, self.group_id
            )));
        }
        if !self.live_members().contains(&voter.to_string()) {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        if term < inner.term {
            return Ok(());
        }
        inner
            .ballots
            .entry(term)
            .or_default()
            .insert(voter.to_string(), candidate.to_string());
        Ok(())
    }

    /// Count ballots for `term`. A simple majority of the currently-live
    /// members wins. Electing a second, different leader for the same term is
    /// an invariant violation, not a merge.
    pub fn tally(&self, term: u64) -> Result<Option<String>> {
        let live = self.live_members();
        let quorum = live.len() / 2 + 1;

        let mut inner = self.inner.lock();
        let Some(ballots) = inner.ballots.get(&term) else {
            return Ok(None);
        };

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for candidate in ballots.values() {
            *counts.entry(candidate.as_str()).or_insert(0) += 1;
        }

        // Stale ballots from since-dead voters can push more than one
        // candidate past quorum; the most-voted candidate wins. An exact tie
        // has no majority to prefer and is raised, never picked.
        let mut qualified: Vec<(String, usize)> = counts
            .into_iter()
            .filter(|(_, count)| *count >= quorum)
            .map(|(candidate, count)| (candidate.to_string(), count))
            .collect();
        qualified.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        if let [(first, first_count), (second, second_count), ..] = qualified.as_slice()
            && first_count == second_count
        {
            return Err(StewardError::Coordination(format!(
                "tied quorums for term {} in group {}: {} and {}",
                term, self.group_id, first, second
            )));
        }
        let winner = qualified.into_iter().next().map(|(candidate, _)| candidate);

        if let Some(winner) = winner {
            if let Some((existing, elected_term)) = &inner.leader
                && *elected_term == term
                && *existing != winner
            {
                return Err(StewardError::Coordination(format!(
                    "double leader for term {} in group {}: {} and {}",
                    term, self.group_id, existing, winner
                )));
            }
            if term >= inner.term {
                inner.term = term;
                inner.leader = Some((winner.clone(), term));
                info!(group = %self.group_id, leader = %winner, term, "Leader elected");
            }
            return Ok(Some(winner));
        }
        Ok(None)
    }
}
