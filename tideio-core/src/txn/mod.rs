pub mod group;

use crate::error::{Result, TideError};
use crate::types::{HintList, TransId, HINT_ADJACENT_READABLE, HINT_LOWEST_READABLE, TID_UNKNOWN};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Lifecycle of one transaction. Aborted and Durable are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransStatus {
    /// Never started.
    Invalid,
    /// Started but not every participant has finished it.
    Started,
    /// Aborted by a caller; never becomes readable.
    Aborted,
    /// All participants finished, but a lower transaction is still open.
    Finished,
    /// Finished and every lower transaction is readable or aborted.
    Readable,
    /// Readable and migrated to central storage.
    Durable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransMode {
    Read,
    Write,
}

/// Abort request carried by `finish`. Only meaningful for writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortFlag {
    None,
    /// Abort only this transaction.
    Single,
    /// Abort this transaction and every higher in-flight writing one.
    All,
}

/// Snapshot of a container's TID timeline. Stale the instant it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerTids {
    pub lowest_durable: TransId,
    pub latest_readable: TransId,
    pub latest_writing: TransId,
}

/// What a completed finish call changed, so the caller can roll back aborted
/// deltas and react to newly readable transactions.
#[derive(Debug, Default)]
pub struct FinishOutcome {
    pub aborted: Vec<TransId>,
    pub became_readable: Vec<TransId>,
}

#[derive(Debug)]
struct TransRecord {
    mode: TransMode,
    status: TransStatus,
    /// Participant count declared at start; 0 means leader-driven.
    num_ranks: u32,
    /// Writer references taken by start/slip, released by finish/slip.
    refs: u32,
    /// Reader references; readers attach to settled records only.
    read_refs: u32,
    finish_calls: u32,
}

impl TransRecord {
    fn required_finishes(&self) -> u32 {
        self.num_ranks.max(1)
    }
}

#[derive(Debug, Default)]
struct Timeline {
    records: BTreeMap<TransId, TransRecord>,
    /// Highest TID ever started for writing. 0 means none yet.
    latest_writing: TransId,
    /// Highest readable TID. 0 means none yet.
    latest_readable: TransId,
    /// Frontier: every TID at or below is Finished(Readable/Durable) or
    /// Aborted. Readability never skips past a gap.
    frontier: TransId,
    lowest_durable: TransId,
    latest_durable: TransId,
}

impl Timeline {
    /// Advance the frontier over contiguous Finished/Aborted records and
    /// promote the Finished ones to Readable.
    fn catch_up(&mut self, out: &mut Vec<TransId>) {
        loop {
            let next = self.frontier + 1;
            match self.records.get_mut(&next) {
                Some(rec) if rec.status == TransStatus::Finished => {
                    rec.status = TransStatus::Readable;
                    self.frontier = next;
                    self.latest_readable = next;
                    out.push(next);
                }
                Some(rec) if rec.status == TransStatus::Aborted => {
                    self.frontier = next;
                }
                _ => break,
            }
        }
    }

    fn readable_tids(&self) -> impl Iterator<Item = TransId> + '_ {
        self.records
            .iter()
            .filter(|(_, r)| matches!(r.status, TransStatus::Readable | TransStatus::Durable))
            .map(|(tid, _)| *tid)
    }
}

/// Per-container transaction timeline. A TID becomes readable only once it
/// and every lower TID reached Finished or Aborted; the catch-up scan
/// enforces that under a single lock.
pub struct TransactionManager {
    state: Mutex<Timeline>,
    changed: Notify,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Timeline::default()),
            changed: Notify::new(),
        }
    }

    /// Start (or join) a transaction. Returns the effective TID.
    ///
    /// `TID_UNKNOWN` auto-selects: next writable for writing, latest readable
    /// for reading (lowest readable with the `lowest_readable=true` hint).
    /// Auto-selection is disallowed when `num_ranks > 0` because independent
    /// ranks cannot agree on the selected value.
    pub fn start(
        &self,
        tid: TransId,
        mode: TransMode,
        num_ranks: u32,
        hints: &HintList,
    ) -> Result<TransId> {
        let mut tl = self.state.lock().unwrap();

        if tid == TID_UNKNOWN && num_ranks > 0 {
            return Err(TideError::InvalidArgument(
                "TID auto-selection requires leader-driven mode (num_ranks == 0)".to_string(),
            ));
        }

        let tid = if tid == TID_UNKNOWN {
            match mode {
                TransMode::Write => tl.latest_writing.max(tl.frontier) + 1,
                TransMode::Read => {
                    let picked = if hints.is_true(HINT_LOWEST_READABLE) {
                        tl.readable_tids().next()
                    } else {
                        tl.readable_tids().last()
                    };
                    picked.ok_or_else(|| {
                        TideError::NotFound("no readable transaction in container".to_string())
                    })?
                }
            }
        } else {
            tid
        };

        match mode {
            TransMode::Write => {
                if let Some(rec) = tl.records.get_mut(&tid) {
                    if rec.mode != TransMode::Write || rec.status != TransStatus::Started {
                        return Err(TideError::StateConflict(format!(
                            "transaction {} is not open for writing",
                            tid
                        )));
                    }
                    if rec.num_ranks != num_ranks {
                        return Err(TideError::InvalidArgument(format!(
                            "participant count mismatch on transaction {}: {} vs {}",
                            tid, rec.num_ranks, num_ranks
                        )));
                    }
                    rec.refs += 1;
                } else {
                    if tid <= tl.frontier {
                        return Err(TideError::StateConflict(format!(
                            "transaction {} is already settled; next writable is {}",
                            tid,
                            tl.latest_writing.max(tl.frontier) + 1
                        )));
                    }
                    tl.records.insert(
                        tid,
                        TransRecord {
                            mode: TransMode::Write,
                            status: TransStatus::Started,
                            num_ranks,
                            refs: 1,
                            read_refs: 0,
                            finish_calls: 0,
                        },
                    );
                    tl.latest_writing = tl.latest_writing.max(tid);
                }
            }
            TransMode::Read => {
                let rec = tl.records.get_mut(&tid).ok_or_else(|| {
                    TideError::NotFound(format!("transaction {} was never started", tid))
                })?;
                match rec.status {
                    TransStatus::Readable | TransStatus::Durable => {}
                    TransStatus::Started => {
                        return Err(TideError::StateConflict(format!(
                            "transaction {} is open for writing; read and write are exclusive",
                            tid
                        )));
                    }
                    _ => {
                        return Err(TideError::StateConflict(format!(
                            "transaction {} is not readable",
                            tid
                        )));
                    }
                }
                rec.read_refs += 1;
            }
        }

        tracing::debug!("trans start: tid={} mode={:?} num_ranks={}", tid, mode, num_ranks);
        Ok(tid)
    }

    /// Finish a transaction.
    ///
    /// For writers this resolves once every participant has called finish;
    /// leader-driven transactions need exactly one call. For readers it only
    /// releases the reference taken by start/slip.
    pub async fn finish(&self, tid: TransId, abort: AbortFlag) -> Result<FinishOutcome> {
        // First call registers the finish/abort; later iterations wait for
        // the remaining participants.
        let mut registered = false;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);

            {
                let mut tl = self.state.lock().unwrap();
                let rec = tl.records.get_mut(&tid).ok_or_else(|| {
                    TideError::NotFound(format!("transaction {} was never started", tid))
                })?;

                if !registered {
                    // A settled record can only be finished by a reader
                    // releasing the reference taken by start/slip.
                    if matches!(rec.status, TransStatus::Readable | TransStatus::Durable) {
                        if rec.read_refs == 0 {
                            return Err(TideError::StateConflict(format!(
                                "transaction {} is settled with no outstanding read reference",
                                tid
                            )));
                        }
                        rec.read_refs -= 1;
                        return Ok(FinishOutcome::default());
                    }

                    match rec.status {
                        TransStatus::Started => {}
                        TransStatus::Aborted => {
                            // A concurrent abort settled it; nothing left.
                            return Ok(FinishOutcome::default());
                        }
                        _ => {
                            return Err(TideError::StateConflict(format!(
                                "transaction {} is not in writing",
                                tid
                            )));
                        }
                    }

                    let mut outcome = FinishOutcome::default();
                    match abort {
                        AbortFlag::Single | AbortFlag::All => {
                            rec.status = TransStatus::Aborted;
                            rec.refs = rec.refs.saturating_sub(1);
                            outcome.aborted.push(tid);
                            if abort == AbortFlag::All {
                                for (&other, other_rec) in tl.records.range_mut(tid + 1..) {
                                    if other_rec.mode == TransMode::Write
                                        && other_rec.status == TransStatus::Started
                                    {
                                        other_rec.status = TransStatus::Aborted;
                                        outcome.aborted.push(other);
                                    }
                                }
                            }
                            tl.catch_up(&mut outcome.became_readable);
                            self.changed.notify_waiters();
                            tracing::debug!("trans abort: tid={} flag={:?}", tid, abort);
                            return Ok(outcome);
                        }
                        AbortFlag::None => {
                            rec.finish_calls += 1;
                            rec.refs = rec.refs.saturating_sub(1);
                            registered = true;
                            if rec.finish_calls >= rec.required_finishes() {
                                rec.status = TransStatus::Finished;
                                tl.catch_up(&mut outcome.became_readable);
                                self.changed.notify_waiters();
                                tracing::debug!(
                                    "trans finish: tid={} readable={:?}",
                                    tid,
                                    outcome.became_readable
                                );
                                return Ok(outcome);
                            }
                        }
                    }
                } else {
                    // Waiting for the remaining participants' finish calls.
                    match rec.status {
                        TransStatus::Started => {}
                        TransStatus::Aborted => return Ok(FinishOutcome::default()),
                        _ => return Ok(FinishOutcome::default()),
                    }
                }
            }

            notified.as_mut().await;
        }
    }

    /// Finish the old transaction, then start the next. The old TID is fully
    /// settled before the next is started; the two steps take the timeline
    /// lock in turn, not jointly, so a racing observer may see the old TID
    /// settled before the new one exists but never an undetermined timeline.
    pub async fn slip(
        &self,
        tid: TransId,
        hints: &HintList,
    ) -> Result<(TransId, FinishOutcome)> {
        if tid == TID_UNKNOWN {
            return Err(TideError::InvalidArgument(
                "slip requires a determined TID".to_string(),
            ));
        }

        let (reading, num_ranks) = {
            let tl = self.state.lock().unwrap();
            let rec = tl.records.get(&tid).ok_or_else(|| {
                TideError::NotFound(format!("transaction {} was never started", tid))
            })?;
            let reading = matches!(rec.status, TransStatus::Readable | TransStatus::Durable);
            (reading, rec.num_ranks)
        };

        let outcome = self.finish(tid, AbortFlag::None).await?;

        let next = if reading {
            let picked = {
                let tl = self.state.lock().unwrap();
                if hints.is_true(HINT_ADJACENT_READABLE) {
                    tl.readable_tids().find(|&t| t > tid)
                } else {
                    tl.readable_tids().last()
                }
            };
            let picked = picked.ok_or_else(|| {
                TideError::NotFound("no readable transaction to slip to".to_string())
            })?;
            self.start(picked, TransMode::Read, num_ranks, hints)?
        } else {
            self.start(tid + 1, TransMode::Write, num_ranks, hints)?
        };

        Ok((next, outcome))
    }

    /// Validate that the given participant count matches the one recorded at
    /// start. Slip requires identical counts between old and new TID.
    pub fn check_num_ranks(&self, tid: TransId, num_ranks: u32) -> Result<()> {
        let tl = self.state.lock().unwrap();
        match tl.records.get(&tid) {
            Some(rec) if rec.num_ranks == num_ranks => Ok(()),
            Some(rec) => Err(TideError::InvalidArgument(format!(
                "participant count mismatch on transaction {}: {} vs {}",
                tid, rec.num_ranks, num_ranks
            ))),
            None => Err(TideError::NotFound(format!(
                "transaction {} was never started",
                tid
            ))),
        }
    }

    pub fn status(&self, tid: TransId) -> TransStatus {
        let tl = self.state.lock().unwrap();
        tl.records
            .get(&tid)
            .map(|r| r.status)
            .unwrap_or(TransStatus::Invalid)
    }

    pub fn query(&self) -> ContainerTids {
        let tl = self.state.lock().unwrap();
        ContainerTids {
            lowest_durable: tl.lowest_durable,
            latest_readable: tl.latest_readable,
            latest_writing: tl.latest_writing,
        }
    }

    pub fn is_writable(&self, tid: TransId) -> bool {
        let tl = self.state.lock().unwrap();
        tl.records
            .get(&tid)
            .map(|r| r.mode == TransMode::Write && r.status == TransStatus::Started)
            .unwrap_or(false)
    }

    pub fn is_readable(&self, tid: TransId) -> bool {
        matches!(self.status(tid), TransStatus::Readable | TransStatus::Durable)
    }

    /// All readable (or durable) TIDs at or below `tid`, ascending. Used by
    /// persist to migrate the full readable prefix.
    pub fn readable_upto(&self, tid: TransId) -> Vec<TransId> {
        let tl = self.state.lock().unwrap();
        tl.readable_tids().take_while(|&t| t <= tid).collect()
    }

    /// Mark every readable TID at or below `tid` durable. Called by the
    /// migration engine after persist completes.
    pub fn mark_durable_upto(&self, tid: TransId) {
        let mut tl = self.state.lock().unwrap();
        let mut lowest = tl.lowest_durable;
        let mut latest = tl.latest_durable;
        for (&t, rec) in tl.records.range_mut(..=tid) {
            if rec.status == TransStatus::Readable {
                rec.status = TransStatus::Durable;
                if lowest == 0 {
                    lowest = t;
                }
                latest = latest.max(t);
            } else if rec.status == TransStatus::Durable {
                if lowest == 0 {
                    lowest = t;
                }
                latest = latest.max(t);
            }
        }
        tl.lowest_durable = lowest;
        tl.latest_durable = latest;
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hints() -> HintList {
        HintList::new()
    }

    #[tokio::test]
    async fn test_unknown_tid_allocates_monotonically() {
        let tm = TransactionManager::new();
        let t1 = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
        let t2 = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
        assert_eq!(t1, 1);
        assert_eq!(t2, 2);
        assert_ne!(t1, t2);
    }

    #[tokio::test]
    async fn test_readable_requires_no_gaps() {
        let tm = TransactionManager::new();
        let t1 = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
        let t2 = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();

        // Finishing the higher TID first leaves it Finished, not Readable.
        let out = tm.finish(t2, AbortFlag::None).await.unwrap();
        assert!(out.became_readable.is_empty());
        assert_eq!(tm.status(t2), TransStatus::Finished);

        // Closing the gap promotes both.
        let out = tm.finish(t1, AbortFlag::None).await.unwrap();
        assert_eq!(out.became_readable, vec![t1, t2]);
        assert_eq!(tm.status(t1), TransStatus::Readable);
        assert_eq!(tm.status(t2), TransStatus::Readable);
        assert_eq!(tm.query().latest_readable, t2);
    }

    #[tokio::test]
    async fn test_aborted_tid_closes_gap_but_never_readable() {
        let tm = TransactionManager::new();
        let t1 = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
        let t2 = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
        tm.finish(t2, AbortFlag::None).await.unwrap();
        let out = tm.finish(t1, AbortFlag::Single).await.unwrap();
        assert_eq!(out.aborted, vec![t1]);
        assert_eq!(out.became_readable, vec![t2]);
        assert_eq!(tm.status(t1), TransStatus::Aborted);
        assert_eq!(tm.status(t2), TransStatus::Readable);
    }

    #[tokio::test]
    async fn test_abort_all_rolls_back_higher_writers() {
        let tm = TransactionManager::new();
        let t1 = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
        let t2 = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
        let t3 = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
        let out = tm.finish(t1, AbortFlag::All).await.unwrap();
        assert_eq!(out.aborted, vec![t1, t2, t3]);
        assert_eq!(tm.status(t3), TransStatus::Aborted);
    }

    #[tokio::test]
    async fn test_read_write_exclusive_on_same_tid() {
        let tm = TransactionManager::new();
        let t1 = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
        let err = tm.start(t1, TransMode::Read, 0, &hints()).unwrap_err();
        assert!(matches!(err, TideError::StateConflict(_)));

        tm.finish(t1, AbortFlag::None).await.unwrap();
        tm.start(t1, TransMode::Read, 0, &hints()).unwrap();
        // Now readable and referenced for reading; restarting for write fails.
        let err = tm.start(t1, TransMode::Write, 0, &hints()).unwrap_err();
        assert!(matches!(err, TideError::StateConflict(_)));
    }

    #[tokio::test]
    async fn test_unknown_tid_rejected_with_participants() {
        let tm = TransactionManager::new();
        let err = tm
            .start(TID_UNKNOWN, TransMode::Write, 4, &hints())
            .unwrap_err();
        assert!(matches!(err, TideError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_internal_mode_waits_for_all_participants() {
        let tm = std::sync::Arc::new(TransactionManager::new());
        let tid = tm.start(1, TransMode::Write, 2, &hints()).unwrap();
        tm.start(1, TransMode::Write, 2, &hints()).unwrap();

        let tm2 = tm.clone();
        let second = tokio::spawn(async move { tm2.finish(tid, AbortFlag::None).await });

        // Both finish calls must arrive before the TID settles.
        let (a, b) = tokio::join!(tm.finish(tid, AbortFlag::None), second);
        a.unwrap();
        b.unwrap().unwrap();
        assert_eq!(tm.status(tid), TransStatus::Readable);
    }

    #[tokio::test]
    async fn test_participant_count_mismatch_rejected() {
        let tm = TransactionManager::new();
        tm.start(1, TransMode::Write, 2, &hints()).unwrap();
        let err = tm.start(1, TransMode::Write, 3, &hints()).unwrap_err();
        assert!(matches!(err, TideError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_slip_write_advances_to_next_tid() {
        let tm = TransactionManager::new();
        let t1 = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
        let (t2, out) = tm.slip(t1, &hints()).await.unwrap();
        assert_eq!(t2, t1 + 1);
        assert_eq!(out.became_readable, vec![t1]);
        assert_eq!(tm.status(t1), TransStatus::Readable);
        assert_eq!(tm.status(t2), TransStatus::Started);
    }

    #[tokio::test]
    async fn test_slip_read_adjacent_hint() {
        let tm = TransactionManager::new();
        for _ in 0..3 {
            let t = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
            tm.finish(t, AbortFlag::None).await.unwrap();
        }

        let low = tm
            .start(
                TID_UNKNOWN,
                TransMode::Read,
                0,
                &HintList::new().push(HINT_LOWEST_READABLE, "true").unwrap(),
            )
            .unwrap();
        assert_eq!(low, 1);

        let adjacent = HintList::new().push(HINT_ADJACENT_READABLE, "true").unwrap();
        let (next, _) = tm.slip(low, &adjacent).await.unwrap();
        assert_eq!(next, 2);

        // Without the hint, slip jumps to the latest readable.
        let (latest, _) = tm.slip(next, &hints()).await.unwrap();
        assert_eq!(latest, 3);
        tm.finish(latest, AbortFlag::None).await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_finish_releases_reference() {
        let tm = TransactionManager::new();
        let t1 = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
        tm.finish(t1, AbortFlag::None).await.unwrap();

        tm.start(t1, TransMode::Read, 0, &hints()).unwrap();
        let out = tm.finish(t1, AbortFlag::None).await.unwrap();
        assert!(out.aborted.is_empty());
        assert!(out.became_readable.is_empty());
        assert_eq!(tm.status(t1), TransStatus::Readable);

        // No reference left to release.
        let err = tm.finish(t1, AbortFlag::None).await.unwrap_err();
        assert!(matches!(err, TideError::StateConflict(_)));
    }

    #[tokio::test]
    async fn test_durable_prefix() {
        let tm = TransactionManager::new();
        for _ in 0..3 {
            let t = tm.start(TID_UNKNOWN, TransMode::Write, 0, &hints()).unwrap();
            tm.finish(t, AbortFlag::None).await.unwrap();
        }
        assert_eq!(tm.readable_upto(2), vec![1, 2]);
        tm.mark_durable_upto(2);
        let tids = tm.query();
        assert_eq!(tids.lowest_durable, 1);
        assert_eq!(tm.status(1), TransStatus::Durable);
        assert_eq!(tm.status(2), TransStatus::Durable);
        assert_eq!(tm.status(3), TransStatus::Readable);
    }
}
