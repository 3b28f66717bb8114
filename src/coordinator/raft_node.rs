//! Raft consensus node
//!
//! The protocol state machine only: terms, votes, the log, commit index and
//! per-follower replication progress. It performs no I/O besides persisting
//! its own state; the [`Consensus`](crate::coordinator::consensus::Consensus)
//! driver moves messages and applies committed entries.
//!
//! Deviations from textbook Raft:
//! - the voter set is the peer registry of the metadata state machine and
//!   changes when an `AddPeer`/`RemovePeer` entry is applied, one peer at a time
//! - a peer that heard from a live leader within the minimum election
//!   timeout ignores vote requests (leader stickiness)
//! - a leader that has not heard from a majority for two election timeouts
//!   steps down (check-quorum)

use crate::common::raft::{
    AppendRequest, AppendResponse, InstallSnapshotRequest, InstallSnapshotResponse, LogEntry,
    Snapshot, VoteRequest, VoteResponse,
};
use crate::common::{ConsensusError, PeerId, Result};
use crate::coordinator::raft_storage::{PersistentState, RaftStorage};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RaftTimings {
    pub heartbeat_interval: Duration,
    /// Election timeouts are drawn from [min, 2 * min)
    pub election_timeout: Duration,
}

/// What the driver should do after a tick.
#[derive(Debug)]
pub enum Tick {
    Idle,
    /// Ask these peers for votes
    Campaign {
        peers: Vec<(PeerId, String)>,
        request: VoteRequest,
    },
    /// Send AppendEntries / InstallSnapshot to followers
    Replicate,
}

/// A message from the leader to one follower.
#[derive(Debug)]
pub enum Outbound {
    Append {
        peer_id: PeerId,
        uri: String,
        request: AppendRequest,
    },
    Snapshot {
        peer_id: PeerId,
        uri: String,
        request: InstallSnapshotRequest,
    },
}

/// Committed work the apply loop has not consumed yet.
#[derive(Debug)]
pub enum Committed {
    /// The log below the applied position was compacted: restore this first
    Snapshot(Snapshot),
    Entries(Vec<LogEntry>),
}

#[derive(Debug, Clone, Copy)]
struct Progress {
    next_index: u64,
    match_index: u64,
    last_contact: Option<Instant>,
    in_flight: bool,
}

impl Progress {
    fn new(next_index: u64) -> Self {
        Self {
            next_index,
            match_index: 0,
            last_contact: None,
            in_flight: false,
        }
    }
}

/// Replication state of one follower, as seen by the leader.
#[derive(Debug, Clone, Serialize)]
pub struct PeerProgress {
    pub match_index: u64,
    pub last_contact_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RaftStatus {
    pub peer_id: PeerId,
    pub term: u64,
    pub role: RaftRole,
    pub leader_id: Option<PeerId>,
    pub leader_uri: Option<String>,
    pub commit_index: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
    pub voters: BTreeMap<PeerId, String>,
    /// Only populated on the leader
    pub progress: BTreeMap<PeerId, PeerProgress>,
}

struct RaftState {
    role: RaftRole,
    term: u64,
    voted_for: Option<PeerId>,
    leader: Option<(PeerId, String)>,
    /// Entries after the snapshot, contiguous
    log: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
    commit_index: u64,
    voters: BTreeMap<PeerId, String>,

    votes: HashSet<PeerId>,
    progress: HashMap<PeerId, Progress>,
    election_deadline: Instant,
    last_leader_contact: Option<Instant>,
    leader_since: Instant,
    next_heartbeat: Instant,
}

impl RaftState {
    fn snapshot_index(&self) -> u64 {
        self.snapshot.as_ref().map(|s| s.last_index).unwrap_or(0)
    }

    fn snapshot_term(&self) -> u64 {
        self.snapshot.as_ref().map(|s| s.last_term).unwrap_or(0)
    }

    fn first_index(&self) -> u64 {
        self.snapshot_index() + 1
    }

    fn last_index(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.index)
            .unwrap_or_else(|| self.snapshot_index())
    }

    fn last_term(&self) -> u64 {
        self.log
            .last()
            .map(|e| e.term)
            .unwrap_or_else(|| self.snapshot_term())
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        if index == self.snapshot_index() {
            return Some(self.snapshot_term());
        }
        if index < self.first_index() {
            return None;
        }
        self.log
            .get((index - self.first_index()) as usize)
            .map(|e| e.term)
    }

    fn entries_from(&self, from: u64, max: usize) -> Vec<LogEntry> {
        if from < self.first_index() {
            return Vec::new();
        }
        let start = (from - self.first_index()) as usize;
        self.log.iter().skip(start).take(max).cloned().collect()
    }

    /// Drop every entry with index >= `index`.
    fn truncate_from(&mut self, index: u64) {
        if index < self.first_index() {
            self.log.clear();
            return;
        }
        self.log.truncate((index - self.first_index()) as usize);
    }

    fn quorum(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    fn to_persistent(&self, peer_id: PeerId) -> PersistentState {
        PersistentState {
            peer_id,
            term: self.term,
            voted_for: self.voted_for,
            log: self.log.clone(),
            commit_index: self.commit_index,
            snapshot: self.snapshot.clone(),
            voters: self.voters.clone(),
        }
    }
}

pub struct RaftNode {
    id: PeerId,
    uri: String,
    timings: RaftTimings,
    state: Mutex<RaftState>,
    storage: Option<RaftStorage>,
}

impl RaftNode {
    /// Create a node, recovering persisted state when `storage` holds some.
    pub fn new(
        id: PeerId,
        uri: String,
        timings: RaftTimings,
        storage: Option<RaftStorage>,
    ) -> Result<Self> {
        let now = Instant::now();
        let persisted = match &storage {
            Some(storage) => storage.load()?,
            None => None,
        };

        let mut state = RaftState {
            role: RaftRole::Follower,
            term: 0,
            voted_for: None,
            leader: None,
            log: Vec::new(),
            snapshot: None,
            commit_index: 0,
            voters: BTreeMap::new(),
            votes: HashSet::new(),
            progress: HashMap::new(),
            election_deadline: now,
            last_leader_contact: None,
            leader_since: now,
            next_heartbeat: now,
        };

        if let Some(p) = persisted {
            if p.peer_id != id {
                return Err(crate::Error::InvalidConfig(format!(
                    "data directory belongs to peer {}, not {}",
                    p.peer_id, id
                )));
            }
            tracing::info!(
                "Recovered Raft state: term {}, {} log entries, commit {}",
                p.term,
                p.log.len(),
                p.commit_index
            );
            state.term = p.term;
            state.voted_for = p.voted_for;
            state.log = p.log;
            state.commit_index = p.commit_index;
            state.snapshot = p.snapshot;
            state.voters = p.voters;
        }

        let node = Self {
            id,
            uri,
            timings,
            state: Mutex::new(state),
            storage,
        };
        {
            let mut s = node.lock();
            node.reset_election_deadline(&mut s, now);
        }
        Ok(node)
    }

    fn lock(&self) -> MutexGuard<'_, RaftState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn persist(&self, s: &RaftState) -> Result<()> {
        match &self.storage {
            Some(storage) => storage.save(&s.to_persistent(self.id)),
            None => Ok(()),
        }
    }

    fn reset_election_deadline(&self, s: &mut RaftState, now: Instant) {
        let min = self.timings.election_timeout;
        let jitter = rand::random::<f64>();
        s.election_deadline = now + min + min.mul_f64(jitter);
    }

    fn become_follower(&self, s: &mut RaftState, term: u64, leader: Option<(PeerId, String)>) {
        if s.role == RaftRole::Leader {
            tracing::info!("Peer {} stepping down in term {}", self.id, term);
        }
        if term > s.term {
            s.term = term;
            s.voted_for = None;
        }
        s.role = RaftRole::Follower;
        s.leader = leader;
        s.votes.clear();
        s.progress.clear();
    }

    fn become_leader(&self, s: &mut RaftState, now: Instant) {
        tracing::info!(
            "Peer {} became leader in term {} ({} voters)",
            self.id,
            s.term,
            s.voters.len()
        );
        s.role = RaftRole::Leader;
        s.leader = Some((self.id, self.uri.clone()));
        s.leader_since = now;
        s.next_heartbeat = now;

        // No-op entry so that entries of this term can commit
        let noop = LogEntry {
            term: s.term,
            index: s.last_index() + 1,
            data: Vec::new(),
        };
        s.log.push(noop);

        let next = s.last_index();
        s.progress = s
            .voters
            .keys()
            .filter(|p| **p != self.id)
            .map(|p| (*p, Progress::new(next)))
            .collect();

        self.maybe_advance_commit(s);
    }

    /// Advance the commit index over entries of the current term stored by
    /// a majority of voters.
    fn maybe_advance_commit(&self, s: &mut RaftState) -> bool {
        if s.role != RaftRole::Leader {
            return false;
        }
        let quorum = s.quorum();
        let self_voter = s.voters.contains_key(&self.id);
        let mut n = s.last_index();
        while n > s.commit_index {
            match s.term_at(n) {
                Some(t) if t == s.term => {}
                _ => break,
            }
            let replicated = usize::from(self_voter)
                + s.progress
                    .iter()
                    .filter(|(peer, p)| s.voters.contains_key(*peer) && p.match_index >= n)
                    .count();
            if replicated >= quorum {
                s.commit_index = n;
                return true;
            }
            n -= 1;
        }
        false
    }

    // === Accessors ===

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn role(&self) -> RaftRole {
        self.lock().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == RaftRole::Leader
    }

    pub fn term(&self) -> u64 {
        self.lock().term
    }

    pub fn leader(&self) -> Option<(PeerId, String)> {
        self.lock().leader.clone()
    }

    pub fn commit_index(&self) -> u64 {
        self.lock().commit_index
    }

    pub fn last_index(&self) -> u64 {
        self.lock().last_index()
    }

    pub fn snapshot_index(&self) -> u64 {
        self.lock().snapshot_index()
    }

    pub fn voters(&self) -> BTreeMap<PeerId, String> {
        self.lock().voters.clone()
    }

    /// Entries currently held in the log (after the snapshot)
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.lock().log.clone()
    }

    pub fn status(&self) -> RaftStatus {
        let now = Instant::now();
        let s = self.lock();
        RaftStatus {
            peer_id: self.id,
            term: s.term,
            role: s.role,
            leader_id: s.leader.as_ref().map(|(id, _)| *id),
            leader_uri: s.leader.as_ref().map(|(_, uri)| uri.clone()),
            commit_index: s.commit_index,
            last_log_index: s.last_index(),
            snapshot_index: s.snapshot_index(),
            voters: s.voters.clone(),
            progress: s
                .progress
                .iter()
                .map(|(peer, p)| {
                    (
                        *peer,
                        PeerProgress {
                            match_index: p.match_index,
                            last_contact_ms: p
                                .last_contact
                                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
                        },
                    )
                })
                .collect(),
        }
    }

    // === Membership ===

    /// Make this peer the single voter of a new cluster. No-op when the
    /// node already knows a voter set.
    pub fn bootstrap_single(&self) -> Result<bool> {
        let now = Instant::now();
        let mut s = self.lock();
        if !s.voters.is_empty() || s.last_index() > 0 {
            return Ok(false);
        }
        s.voters.insert(self.id, self.uri.clone());
        // Campaign on the next tick
        s.election_deadline = now;
        self.persist(&s)?;
        Ok(true)
    }

    /// Voter set changed by an applied membership entry.
    pub fn set_voters(&self, voters: BTreeMap<PeerId, String>) -> Result<()> {
        let mut s = self.lock();
        if s.voters == voters {
            return Ok(());
        }
        tracing::info!(
            "Peer {} voters: {:?}",
            self.id,
            voters.keys().collect::<Vec<_>>()
        );
        s.voters = voters;

        if s.role == RaftRole::Leader {
            if !s.voters.contains_key(&self.id) {
                let term = s.term;
                self.become_follower(&mut s, term, None);
            } else {
                let next = s.last_index() + 1;
                let voters: Vec<PeerId> = s.voters.keys().copied().collect();
                s.progress.retain(|peer, _| voters.contains(peer));
                for peer in voters.into_iter().filter(|p| *p != self.id) {
                    s.progress.entry(peer).or_insert_with(|| Progress::new(next));
                }
                self.maybe_advance_commit(&mut s);
            }
        }

        self.persist(&s)
    }

    // === Timers ===

    pub fn tick(&self, now: Instant) -> Result<Tick> {
        let mut s = self.lock();

        if s.role == RaftRole::Leader {
            let window = self.timings.election_timeout * 2;
            if now.saturating_duration_since(s.leader_since) >= window {
                let alive = usize::from(s.voters.contains_key(&self.id))
                    + s.progress
                        .iter()
                        .filter(|(peer, p)| {
                            s.voters.contains_key(*peer)
                                && p.last_contact
                                    .is_some_and(|t| now.saturating_duration_since(t) < window)
                        })
                        .count();
                if alive < s.quorum() {
                    tracing::warn!(
                        "Leader {} lost contact with a majority ({}/{}), stepping down",
                        self.id,
                        alive,
                        s.voters.len()
                    );
                    let term = s.term;
                    self.become_follower(&mut s, term, None);
                    self.reset_election_deadline(&mut s, now);
                    return Ok(Tick::Idle);
                }
            }
            if now >= s.next_heartbeat {
                s.next_heartbeat = now + self.timings.heartbeat_interval;
                return Ok(Tick::Replicate);
            }
            return Ok(Tick::Idle);
        }

        if now < s.election_deadline {
            return Ok(Tick::Idle);
        }
        self.reset_election_deadline(&mut s, now);

        if !s.voters.contains_key(&self.id) {
            // Not (yet) a member: nothing to campaign for
            return Ok(Tick::Idle);
        }

        s.term += 1;
        s.role = RaftRole::Candidate;
        s.voted_for = Some(self.id);
        s.leader = None;
        s.last_leader_contact = None;
        s.votes = HashSet::from([self.id]);
        tracing::info!("Peer {} starting election for term {}", self.id, s.term);

        if s.votes.len() >= s.quorum() {
            self.become_leader(&mut s, now);
            self.persist(&s)?;
            return Ok(Tick::Replicate);
        }
        self.persist(&s)?;

        let request = VoteRequest {
            term: s.term,
            candidate_id: self.id,
            last_log_index: s.last_index(),
            last_log_term: s.last_term(),
        };
        let peers = s
            .voters
            .iter()
            .filter(|(p, _)| **p != self.id)
            .map(|(p, uri)| (*p, uri.clone()))
            .collect();
        Ok(Tick::Campaign { peers, request })
    }

    /// Force the next tick to replicate (after a proposal).
    pub fn replicate_now(&self) {
        let mut s = self.lock();
        s.next_heartbeat = Instant::now();
    }

    // === Elections ===

    pub fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let now = Instant::now();
        let mut s = self.lock();

        if req.term < s.term {
            return Ok(VoteResponse {
                term: s.term,
                vote_granted: false,
            });
        }

        if req.term > s.term {
            let leader_alive = s.role == RaftRole::Leader
                || s.last_leader_contact.is_some_and(|t| {
                    now.saturating_duration_since(t) < self.timings.election_timeout
                });
            if leader_alive {
                return Ok(VoteResponse {
                    term: s.term,
                    vote_granted: false,
                });
            }
            self.become_follower(&mut s, req.term, None);
        }

        let up_to_date = req.last_log_term > s.last_term()
            || (req.last_log_term == s.last_term() && req.last_log_index >= s.last_index());
        let free = s.voted_for.is_none() || s.voted_for == Some(req.candidate_id);

        let vote_granted = up_to_date && free;
        if vote_granted {
            s.voted_for = Some(req.candidate_id);
            self.reset_election_deadline(&mut s, now);
            tracing::debug!(
                "Peer {} voted for {} in term {}",
                self.id,
                req.candidate_id,
                s.term
            );
        }
        self.persist(&s)?;

        Ok(VoteResponse {
            term: s.term,
            vote_granted,
        })
    }

    /// Count a vote. Returns true if this vote made the node leader.
    pub fn handle_vote_response(
        &self,
        from: PeerId,
        request_term: u64,
        resp: VoteResponse,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut s = self.lock();

        if resp.term > s.term {
            self.become_follower(&mut s, resp.term, None);
            self.persist(&s)?;
            return Ok(false);
        }
        if s.role != RaftRole::Candidate || s.term != request_term || !resp.vote_granted {
            return Ok(false);
        }

        s.votes.insert(from);
        let granted = s.votes.iter().filter(|p| s.voters.contains_key(*p)).count();
        if granted >= s.quorum() {
            self.become_leader(&mut s, now);
            self.persist(&s)?;
            return Ok(true);
        }
        Ok(false)
    }

    // === Replication (follower side) ===

    fn accept_leader(&self, s: &mut RaftState, term: u64, leader_id: PeerId, leader_uri: &str) {
        let now = Instant::now();
        if term > s.term || s.role != RaftRole::Follower {
            self.become_follower(s, term, None);
        }
        if s.leader.as_ref().map(|(id, _)| *id) != Some(leader_id) {
            tracing::info!("Peer {} follows leader {} (term {})", self.id, leader_id, term);
        }
        s.leader = Some((leader_id, leader_uri.to_string()));
        s.last_leader_contact = Some(now);
        self.reset_election_deadline(s, now);
    }

    pub fn handle_append_entries(&self, req: AppendRequest) -> Result<AppendResponse> {
        let mut s = self.lock();

        if req.term < s.term {
            return Ok(AppendResponse {
                term: s.term,
                success: false,
                match_index: 0,
                conflict_index: 0,
            });
        }
        self.accept_leader(&mut s, req.term, req.leader_id, &req.leader_uri);

        let mut prev = req.prev_log_index;
        let mut entries = req.entries;
        let snapshot_index = s.snapshot_index();

        if prev < snapshot_index {
            // Everything up to the snapshot is committed and identical
            entries.retain(|e| e.index > snapshot_index);
            prev = snapshot_index;
        } else {
            match s.term_at(prev) {
                None => {
                    let conflict_index = s.last_index() + 1;
                    return Ok(AppendResponse {
                        term: s.term,
                        success: false,
                        match_index: 0,
                        conflict_index,
                    });
                }
                Some(t) if t != req.prev_log_term => {
                    // Skip back over the whole conflicting term
                    let mut conflict_index = prev;
                    while conflict_index > s.first_index()
                        && s.term_at(conflict_index - 1) == Some(t)
                    {
                        conflict_index -= 1;
                    }
                    return Ok(AppendResponse {
                        term: s.term,
                        success: false,
                        match_index: 0,
                        conflict_index,
                    });
                }
                Some(_) => {}
            }
        }

        let last_new = entries.last().map(|e| e.index).unwrap_or(prev);
        for entry in entries {
            match s.term_at(entry.index) {
                Some(t) if t == entry.term => continue,
                Some(_) => {
                    tracing::debug!(
                        "Peer {} truncating conflicting log from {}",
                        self.id,
                        entry.index
                    );
                    s.truncate_from(entry.index);
                    s.log.push(entry);
                }
                None => s.log.push(entry),
            }
        }

        let commit = req.leader_commit.min(last_new);
        if commit > s.commit_index {
            s.commit_index = commit;
        }

        // Term or vote may have changed in accept_leader as well
        self.persist(&s)?;

        Ok(AppendResponse {
            term: s.term,
            success: true,
            match_index: last_new,
            conflict_index: 0,
        })
    }

    pub fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut s = self.lock();

        if req.term < s.term {
            return Ok(InstallSnapshotResponse {
                term: s.term,
                match_index: 0,
            });
        }
        self.accept_leader(&mut s, req.term, req.leader_id, &req.leader_uri);

        let snapshot = req.snapshot;
        let match_index = snapshot.last_index;
        if snapshot.last_index > s.commit_index {
            tracing::info!(
                "Peer {} installing snapshot at index {} (term {})",
                self.id,
                snapshot.last_index,
                snapshot.last_term
            );
            self.install_snapshot_locked(&mut s, snapshot);
        }
        self.persist(&s)?;

        Ok(InstallSnapshotResponse {
            term: s.term,
            match_index,
        })
    }

    fn install_snapshot_locked(&self, s: &mut RaftState, snapshot: Snapshot) {
        if s.term_at(snapshot.last_index) == Some(snapshot.last_term) {
            let last = snapshot.last_index;
            s.log.retain(|e| e.index > last);
        } else {
            s.log.clear();
        }
        s.commit_index = s.commit_index.max(snapshot.last_index);
        s.voters = snapshot.voters.clone();
        s.snapshot = Some(snapshot);
    }

    /// Adopt the state handed out by a bootstrap peer on join.
    pub fn install_join_snapshot(
        &self,
        snapshot: Snapshot,
        leader: Option<(PeerId, String)>,
    ) -> Result<()> {
        let now = Instant::now();
        let mut s = self.lock();
        if snapshot.last_index > s.commit_index {
            self.install_snapshot_locked(&mut s, snapshot);
        }
        if let Some((leader_id, leader_uri)) = leader {
            s.leader = Some((leader_id, leader_uri));
            s.last_leader_contact = Some(now);
        }
        self.reset_election_deadline(&mut s, now);
        self.persist(&s)
    }

    // === Replication (leader side) ===

    /// Append a new entry. Only the leader accepts proposals.
    pub fn propose(&self, data: Vec<u8>) -> Result<(u64, u64)> {
        let mut s = self.lock();
        if s.role != RaftRole::Leader {
            return Err(ConsensusError::NotLeader {
                leader: s.leader.as_ref().map(|(_, uri)| uri.clone()),
            }
            .into());
        }
        let index = s.last_index() + 1;
        let term = s.term;
        s.log.push(LogEntry { term, index, data });
        self.maybe_advance_commit(&mut s);
        s.next_heartbeat = Instant::now();
        self.persist(&s)?;
        Ok((index, term))
    }

    /// Messages for every follower without a request in flight.
    pub fn replication_requests(&self, max_entries: usize) -> Vec<Outbound> {
        let mut s = self.lock();
        if s.role != RaftRole::Leader {
            return Vec::new();
        }

        let targets: Vec<(PeerId, String)> = s
            .voters
            .iter()
            .filter(|(p, _)| **p != self.id)
            .map(|(p, uri)| (*p, uri.clone()))
            .collect();
        let next_default = s.last_index() + 1;

        let mut out = Vec::with_capacity(targets.len());
        for (peer_id, uri) in targets {
            let progress = *s
                .progress
                .entry(peer_id)
                .or_insert_with(|| Progress::new(next_default));
            if progress.in_flight {
                continue;
            }

            let message = if progress.next_index <= s.snapshot_index() {
                match s.snapshot.clone() {
                    Some(snapshot) => Outbound::Snapshot {
                        peer_id,
                        uri,
                        request: InstallSnapshotRequest {
                            term: s.term,
                            leader_id: self.id,
                            leader_uri: self.uri.clone(),
                            snapshot,
                        },
                    },
                    None => continue,
                }
            } else {
                let prev = progress.next_index - 1;
                Outbound::Append {
                    peer_id,
                    uri,
                    request: AppendRequest {
                        term: s.term,
                        leader_id: self.id,
                        leader_uri: self.uri.clone(),
                        prev_log_index: prev,
                        prev_log_term: s.term_at(prev).unwrap_or(0),
                        entries: s.entries_from(progress.next_index, max_entries),
                        leader_commit: s.commit_index,
                    },
                }
            };

            if let Some(p) = s.progress.get_mut(&peer_id) {
                p.in_flight = true;
            }
            out.push(message);
        }
        out
    }

    /// The request to `peer_id` failed in transport.
    pub fn release(&self, peer_id: PeerId) {
        let mut s = self.lock();
        if let Some(p) = s.progress.get_mut(&peer_id) {
            p.in_flight = false;
        }
    }

    /// Returns true if the commit index advanced.
    pub fn handle_append_response(&self, peer_id: PeerId, resp: AppendResponse) -> Result<bool> {
        let now = Instant::now();
        let mut s = self.lock();

        if let Some(p) = s.progress.get_mut(&peer_id) {
            p.in_flight = false;
        }
        if resp.term > s.term {
            self.become_follower(&mut s, resp.term, None);
            self.reset_election_deadline(&mut s, now);
            self.persist(&s)?;
            return Ok(false);
        }
        if s.role != RaftRole::Leader || resp.term < s.term {
            return Ok(false);
        }

        let Some(p) = s.progress.get_mut(&peer_id) else {
            return Ok(false);
        };
        p.last_contact = Some(now);
        if resp.success {
            p.match_index = p.match_index.max(resp.match_index);
            p.next_index = p.match_index + 1;
        } else {
            let target = if resp.conflict_index > 0 && resp.conflict_index < p.next_index {
                resp.conflict_index
            } else {
                p.next_index.saturating_sub(1)
            };
            p.next_index = target.max(1);
            // Retry without waiting for the next heartbeat
            s.next_heartbeat = now;
            return Ok(false);
        }

        let advanced = self.maybe_advance_commit(&mut s);
        if advanced {
            self.persist(&s)?;
        }
        Ok(advanced)
    }

    pub fn handle_snapshot_response(
        &self,
        peer_id: PeerId,
        resp: InstallSnapshotResponse,
    ) -> Result<bool> {
        self.handle_append_response(
            peer_id,
            AppendResponse {
                term: resp.term,
                success: resp.match_index > 0,
                match_index: resp.match_index,
                conflict_index: 0,
            },
        )
    }

    // === Apply & compaction ===

    /// Committed work after `applied`.
    pub fn committed_after(&self, applied: u64) -> Committed {
        let s = self.lock();
        if applied < s.snapshot_index() {
            if let Some(snapshot) = s.snapshot.clone() {
                return Committed::Snapshot(snapshot);
            }
        }
        if s.commit_index <= applied {
            return Committed::Entries(Vec::new());
        }
        let count = (s.commit_index - applied) as usize;
        Committed::Entries(s.entries_from(applied + 1, count))
    }

    /// Replace the log prefix up to `index` (applied) with a snapshot.
    pub fn compact(&self, index: u64, data: Vec<u8>) -> Result<()> {
        let mut s = self.lock();
        if index <= s.snapshot_index() || index > s.commit_index {
            return Ok(());
        }
        let Some(term) = s.term_at(index) else {
            return Ok(());
        };
        s.log.retain(|e| e.index > index);
        s.snapshot = Some(Snapshot {
            last_index: index,
            last_term: term,
            voters: s.voters.clone(),
            data,
        });
        tracing::info!("Peer {} compacted log up to index {}", self.id, index);
        self.persist(&s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timings() -> RaftTimings {
        RaftTimings {
            heartbeat_interval: Duration::from_millis(20),
            election_timeout: Duration::from_millis(100),
        }
    }

    fn node(id: PeerId, voters: &[PeerId]) -> RaftNode {
        let n = RaftNode::new(id, format!("local://{}", id), timings(), None).unwrap();
        n.set_voters(
            voters
                .iter()
                .map(|p| (*p, format!("local://{}", p)))
                .collect(),
        )
        .unwrap();
        n
    }

    /// Run an election on `candidate` against `others` by hand.
    fn elect(candidate: &RaftNode, others: &[&RaftNode]) {
        let far = Instant::now() + Duration::from_secs(1);
        let Tick::Campaign { request, .. } = candidate.tick(far).unwrap() else {
            panic!("expected campaign");
        };
        for other in others {
            let resp = other.handle_request_vote(request.clone()).unwrap();
            candidate
                .handle_vote_response(other.id(), request.term, resp)
                .unwrap();
        }
    }

    /// Deliver the leader's requests to `followers`; requests to any other
    /// peer are lost, as if it were partitioned away.
    fn replicate(leader: &RaftNode, followers: &[&RaftNode]) {
        for out in leader.replication_requests(64) {
            match out {
                Outbound::Append {
                    peer_id, request, ..
                } => match followers.iter().find(|f| f.id() == peer_id) {
                    Some(follower) => {
                        let resp = follower.handle_append_entries(request).unwrap();
                        leader.handle_append_response(peer_id, resp).unwrap();
                    }
                    None => leader.release(peer_id),
                },
                Outbound::Snapshot {
                    peer_id, request, ..
                } => match followers.iter().find(|f| f.id() == peer_id) {
                    Some(follower) => {
                        let resp = follower.handle_install_snapshot(request).unwrap();
                        leader.handle_snapshot_response(peer_id, resp).unwrap();
                    }
                    None => leader.release(peer_id),
                },
            }
        }
    }

    #[test]
    fn test_single_voter_bootstrap() {
        let n = RaftNode::new(1, "local://1".into(), timings(), None).unwrap();
        assert!(n.bootstrap_single().unwrap());
        assert!(matches!(n.tick(Instant::now()).unwrap(), Tick::Replicate));
        assert!(n.is_leader());

        // No-op of the new term commits immediately with a single voter
        assert_eq!(n.commit_index(), 1);
        let (index, _) = n.propose(b"op".to_vec()).unwrap();
        assert_eq!(index, 2);
        assert_eq!(n.commit_index(), 2);

        // Already initialised
        assert!(!n.bootstrap_single().unwrap());
    }

    #[test]
    fn test_election_and_replication() {
        let n1 = node(1, &[1, 2, 3]);
        let n2 = node(2, &[1, 2, 3]);
        let n3 = node(3, &[1, 2, 3]);

        elect(&n1, &[&n2, &n3]);
        assert!(n1.is_leader());
        assert_eq!(n1.role(), RaftRole::Leader);

        let (index, term) = n1.propose(b"set x=42".to_vec()).unwrap();
        assert_eq!(index, 2);
        assert_eq!(n1.commit_index(), 0);

        replicate(&n1, &[&n2, &n3]);
        assert_eq!(n1.commit_index(), 2);
        assert_eq!(n2.log_entries().len(), 2);
        assert_eq!(n2.log_entries()[1].data, b"set x=42".to_vec());
        assert_eq!(n2.log_entries()[1].term, term);

        // Followers learn the commit index on the next round
        replicate(&n1, &[&n2, &n3]);
        assert_eq!(n3.commit_index(), 2);
        assert_eq!(n2.leader().map(|(id, _)| id), Some(1));
    }

    #[test]
    fn test_follower_rejects_proposals() {
        let n1 = node(1, &[1, 2, 3]);
        let n2 = node(2, &[1, 2, 3]);
        let n3 = node(3, &[1, 2, 3]);
        elect(&n1, &[&n2, &n3]);
        replicate(&n1, &[&n2, &n3]);

        let err = n2.propose(b"x".to_vec()).unwrap_err();
        match err {
            crate::Error::Consensus(ConsensusError::NotLeader { leader }) => {
                assert_eq!(leader.as_deref(), Some("local://1"))
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_vote_requires_up_to_date_log() {
        let n1 = node(1, &[1, 2, 3]);
        let n2 = node(2, &[1, 2, 3]);
        let n3 = node(3, &[1, 2, 3]);
        elect(&n1, &[&n2, &n3]);
        n1.propose(b"a".to_vec()).unwrap();
        replicate(&n1, &[&n2]);
        assert_eq!(n2.last_index(), n1.last_index());
        assert!(n3.last_index() < n1.last_index());

        // n2 gives up on the leader and campaigns itself
        let far = Instant::now() + Duration::from_secs(10);
        assert!(matches!(n2.tick(far).unwrap(), Tick::Campaign { .. }));

        // n3 missed the entries and cannot win n2's vote
        let resp = n2
            .handle_request_vote(VoteRequest {
                term: 100,
                candidate_id: 3,
                last_log_index: 0,
                last_log_term: 0,
            })
            .unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(n2.term(), 100);
    }

    #[test]
    fn test_sticky_follower_ignores_disruptive_candidate() {
        let n1 = node(1, &[1, 2, 3]);
        let n2 = node(2, &[1, 2, 3]);
        let n3 = node(3, &[1, 2, 3]);
        elect(&n1, &[&n2, &n3]);
        replicate(&n1, &[&n2, &n3]);

        let term = n2.term();
        let resp = n2
            .handle_request_vote(VoteRequest {
                term: term + 5,
                candidate_id: 3,
                last_log_index: 100,
                last_log_term: term,
            })
            .unwrap();
        assert!(!resp.vote_granted);
        assert_eq!(n2.term(), term);
    }

    #[test]
    fn test_conflicting_entries_are_replaced() {
        let n1 = node(1, &[1, 2, 3]);
        let n2 = node(2, &[1, 2, 3]);
        let n3 = node(3, &[1, 2, 3]);
        elect(&n1, &[&n2, &n3]);
        replicate(&n1, &[&n2, &n3]);

        // n1 appends an entry nobody else sees, then loses leadership
        n1.propose(b"lost".to_vec()).unwrap();
        let far = Instant::now() + Duration::from_secs(10);
        n2.tick(far).unwrap();
        let Tick::Campaign { request, .. } = n3.tick(far).unwrap() else {
            panic!("expected campaign");
        };
        assert_eq!(request.candidate_id, 3);

        // n2 campaigns at a higher term and wins with n3's vote
        let far = far + Duration::from_secs(10);
        let Tick::Campaign { request, .. } = n2.tick(far).unwrap() else {
            panic!("expected campaign");
        };
        let resp = n3.handle_request_vote(request.clone()).unwrap();
        n2.handle_vote_response(3, request.term, resp).unwrap();
        assert!(n2.is_leader());

        n2.propose(b"kept".to_vec()).unwrap();
        replicate(&n2, &[&n1, &n3]);
        replicate(&n2, &[&n1, &n3]);

        let data: Vec<Vec<u8>> = n1.log_entries().into_iter().map(|e| e.data).collect();
        assert!(!data.contains(&b"lost".to_vec()));
        assert!(data.contains(&b"kept".to_vec()));
        assert!(!n1.is_leader());
    }

    #[test]
    fn test_snapshot_catches_up_lagging_follower() {
        let n1 = node(1, &[1, 2]);
        let n2 = node(2, &[1, 2]);
        elect(&n1, &[&n2]);
        replicate(&n1, &[&n2]);

        // A new follower with an empty log joins after compaction
        let n3 = RaftNode::new(3, "local://3".into(), timings(), None).unwrap();
        for i in 0..5u8 {
            n1.propose(vec![i]).unwrap();
        }
        replicate(&n1, &[&n2]);

        let mut voters = n1.voters();
        voters.insert(3, "local://3".into());
        n1.set_voters(voters.clone()).unwrap();
        n2.set_voters(voters).unwrap();

        let commit = n1.commit_index();
        n1.compact(commit, b"state".to_vec()).unwrap();
        assert_eq!(n1.snapshot_index(), commit);
        assert!(n1.log_entries().is_empty());

        // First round finds the gap, second ships the snapshot
        replicate(&n1, &[&n2, &n3]);
        replicate(&n1, &[&n2, &n3]);
        match n3.committed_after(0) {
            Committed::Snapshot(s) => {
                assert_eq!(s.last_index, commit);
                assert_eq!(s.data, b"state".to_vec());
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
        assert_eq!(n3.voters().len(), 3);
    }

    #[test]
    fn test_check_quorum_step_down() {
        let n1 = node(1, &[1, 2, 3]);
        let n2 = node(2, &[1, 2, 3]);
        let n3 = node(3, &[1, 2, 3]);
        elect(&n1, &[&n2, &n3]);
        assert!(n1.is_leader());

        // Nobody answers for more than two election timeouts
        let later = Instant::now() + Duration::from_secs(5);
        n1.tick(later).unwrap();
        assert!(!n1.is_leader());
    }
}
