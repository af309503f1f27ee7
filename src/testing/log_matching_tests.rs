//! Property tests for the log consistency check.
//!
//! A sequence of leaders with increasing terms each append entries and ship
//! random slices of their log to random followers, which accept a slice
//! only when its `prev` entry matches. Whatever the interleaving, any two
//! logs that agree on an entry agree on everything before it.

use crate::consensus::RaftLog;
use crate::types::{Command, LogEntry, LogIndex, Term};
use proptest::collection::vec as prop_vec;
use proptest::prelude::*;

const NODES: usize = 5;

#[derive(Debug, Clone)]
struct Ship {
    follower: usize,
    /// Start of the slice, as a fraction of the leader's log length.
    start: u8,
    len: usize,
}

#[derive(Debug, Clone)]
struct Epoch {
    leader: usize,
    new_entries: usize,
    sends: Vec<Ship>,
}

fn epoch() -> impl Strategy<Value = Epoch> {
    let send = (0..NODES, 0u8..=100, 1usize..6).prop_map(|(follower, start, len)| Ship {
        follower,
        start,
        len,
    });
    (0..NODES, 0usize..4, prop_vec(send, 0..8)).prop_map(|(leader, new_entries, sends)| Epoch {
        leader,
        new_entries,
        sends,
    })
}

fn entry(term: Term, index: LogIndex) -> LogEntry {
    LogEntry {
        term,
        index,
        command: Command::set(format!("{term}-{index}"), ""),
        timestamp: 0,
    }
}

/// Ship `len` entries of `leader` starting at `start` to `follower`.
fn replicate(leader: &RaftLog, follower: &mut RaftLog, start: LogIndex, len: usize) -> bool {
    let prev = start.checked_sub(1);
    let prev_term = prev.and_then(|p| leader.term_at(p)).unwrap_or(0);
    if !follower.matches(prev, prev_term) {
        return false;
    }
    follower.append_entries(prev, leader.entries_from(start, len));
    true
}

fn entries(log: &RaftLog) -> Vec<LogEntry> {
    log.iter().cloned().collect()
}

fn check_log_matching(a: &RaftLog, b: &RaftLog) -> Result<(), TestCaseError> {
    let common = a.next_index().min(b.next_index());
    let agreed = (0..common).rev().find(|&i| a.term_at(i) == b.term_at(i));
    if let Some(last) = agreed {
        for i in 0..=last {
            prop_assert_eq!(a.get(i), b.get(i), "logs diverge at {} below agreed {}", i, last);
        }
    }
    Ok(())
}

fn run(epochs: &[Epoch]) -> (Vec<RaftLog>, usize) {
    let mut logs = vec![RaftLog::new(); NODES];
    let mut last_leader = 0;
    for (n, epoch) in epochs.iter().enumerate() {
        let term = n as Term + 1;
        for _ in 0..epoch.new_entries {
            let log = &mut logs[epoch.leader];
            let index = log.next_index();
            log.append(entry(term, index));
        }
        for send in &epoch.sends {
            if send.follower == epoch.leader {
                continue;
            }
            let leader = logs[epoch.leader].clone();
            let start = leader.next_index() * send.start as u64 / 100;
            replicate(&leader, &mut logs[send.follower], start, send.len);
        }
        last_leader = epoch.leader;
    }
    (logs, last_leader)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_logs_agreeing_on_an_entry_share_its_prefix(epochs in prop_vec(epoch(), 1..12)) {
        let (logs, _) = run(&epochs);
        for a in 0..NODES {
            for b in a + 1..NODES {
                check_log_matching(&logs[a], &logs[b])?;
            }
        }
    }

    #[test]
    fn prop_full_resend_converges_to_leader(epochs in prop_vec(epoch(), 1..12)) {
        let (mut logs, leader) = run(&epochs);
        let leader_log = logs[leader].clone();
        for follower in 0..NODES {
            if follower == leader {
                continue;
            }
            prop_assert!(replicate(&leader_log, &mut logs[follower], 0, leader_log.len()));
            let follower_entries = entries(&logs[follower]);
            let leader_entries = entries(&leader_log);
            // Matching entries past the leader's end are kept.
            prop_assert!(follower_entries.len() >= leader_entries.len());
            prop_assert_eq!(&follower_entries[..leader_entries.len()], &leader_entries[..]);
        }
    }
}
