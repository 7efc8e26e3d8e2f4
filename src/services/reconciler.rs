//! Single owner of the reconciled dashboard view.
//!
//! Two mutation paths exist: `replace_all` after a full fetch and `apply_partial` for push updates.
//! Both run on the orchestrator's thread, so they never interleave. Every successful mutation bumps
//! the revision and hands the whole collection to each subscriber.

use crate::error::SyncError;
use crate::models::fermentation::{BatchId, BatchStatusSnapshot, LiveUpdateMessage};
use log::debug;
use std::collections::HashSet;

/// One hour of samples at the controller's 10 s control interval.
pub const DEFAULT_RECENT_LOG_LIMIT: usize = 360;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Subscriber = Box<dyn FnMut(&[BatchStatusSnapshot])>;

pub struct Reconciler {
    snapshots: Vec<BatchStatusSnapshot>,
    revision: u64,
    recent_log_limit: usize,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: u64,
}

impl Default for Reconciler {
    fn default() -> Self {
        Reconciler::new(DEFAULT_RECENT_LOG_LIMIT)
    }
}

impl Reconciler {
    pub fn new(recent_log_limit: usize) -> Self {
        Reconciler {
            snapshots: Vec::new(),
            revision: 0,
            recent_log_limit,
            subscribers: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn snapshots(&self) -> &[BatchStatusSnapshot] {
        &self.snapshots
    }

    pub fn get(&self, batch_id: BatchId) -> Option<&BatchStatusSnapshot> {
        self.snapshots.iter().find(|s| s.id() == batch_id)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Number of successful mutations so far. No-ops and rejections leave it unchanged.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Register a consumer. It is not called with the current state, only on later mutations.
    pub fn subscribe(&mut self, f: impl FnMut(&[BatchStatusSnapshot]) + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(f)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    /// Replace the whole collection with a fresh full fetch.
    ///
    /// Batches missing from `snapshots` disappear. A set naming the same batch twice is rejected and
    /// the current collection is kept.
    pub fn replace_all(&mut self, mut snapshots: Vec<BatchStatusSnapshot>) -> Result<(), SyncError> {
        let mut seen = HashSet::with_capacity(snapshots.len());
        for s in &snapshots {
            if !seen.insert(s.id()) {
                return Err(SyncError::Validation(format!(
                    "snapshot set contains batch {} more than once",
                    s.id().0
                )));
            }
        }

        for s in &mut snapshots {
            trim_recent_logs(s, self.recent_log_limit);
        }

        debug!(
            "Reconciler: replacing {} batch(es) with {}",
            self.snapshots.len(),
            snapshots.len()
        );
        self.snapshots = snapshots;
        self.commit();
        Ok(())
    }

    /// Merge the fields present in `update` into the matching batch.
    ///
    /// Returns `Ok(None)` when the batch is not known locally: a partial update has no identity
    /// fields, so it never creates a record.
    pub fn apply_partial(&mut self, update: &LiveUpdateMessage) -> Result<Option<&BatchStatusSnapshot>, SyncError> {
        validate_update(update)?;

        let Some(index) = self.snapshots.iter().position(|s| s.id() == update.batch_id) else {
            debug!("Reconciler: ignoring update for unknown batch {}", update.batch_id.0);
            return Ok(None);
        };

        merge_update(&mut self.snapshots[index], update);
        self.commit();
        Ok(Some(&self.snapshots[index]))
    }

    fn commit(&mut self) {
        self.revision += 1;
        for (_, subscriber) in &mut self.subscribers {
            subscriber(&self.snapshots);
        }
    }
}

fn validate_update(update: &LiveUpdateMessage) -> Result<(), SyncError> {
    let temps = [("current_temp", update.current_temp), ("target_temp", update.target_temp)];
    for (field, value) in temps {
        if let Some(Some(v)) = value
            && !v.is_finite()
        {
            return Err(SyncError::Validation(format!(
                "batch {}: {} is not a finite number",
                update.batch_id.0, field
            )));
        }
    }
    if let Some(Some(p)) = update.phase_progress
        && !(0.0..=100.0).contains(&p)
    {
        return Err(SyncError::Validation(format!(
            "batch {}: phase_progress {} outside 0..=100",
            update.batch_id.0, p
        )));
    }
    if let Some(Some(h)) = update.elapsed_hours
        && !(h.is_finite() && h >= 0.0)
    {
        return Err(SyncError::Validation(format!(
            "batch {}: elapsed_hours {} is not a non-negative number",
            update.batch_id.0, h
        )));
    }
    Ok(())
}

fn merge_update(snapshot: &mut BatchStatusSnapshot, update: &LiveUpdateMessage) {
    if let Some(v) = update.current_temp {
        snapshot.current_temp = v;
    }
    if let Some(v) = update.target_temp {
        snapshot.target_temp = v;
    }
    if let Some(v) = update.control_state {
        snapshot.control_state = v;
    }
    if let Some(v) = update.current_phase {
        snapshot.current_phase = v;
    }
    if let Some(v) = update.phase_progress {
        snapshot.phase_progress = v;
    }
    if let Some(v) = update.elapsed_hours {
        snapshot.elapsed_hours = v;
    }
}

fn trim_recent_logs(snapshot: &mut BatchStatusSnapshot, limit: usize) {
    let len = snapshot.recent_logs.len();
    if len > limit {
        snapshot.recent_logs.drain(..len - limit);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::fermentation::{
        BatchRecord, BatchStatus, ControlState, FermenterId, FermenterRef, ProfileId, ProfileRef, TemperatureLogPoint,
    };
    use chrono::{TimeZone, Utc};
    use std::cell::RefCell;
    use std::rc::Rc;

    pub(crate) fn snapshot(id: i64, current_temp: Option<f64>, target_temp: Option<f64>) -> BatchStatusSnapshot {
        BatchStatusSnapshot {
            batch: BatchRecord {
                id: BatchId(id),
                batch_number: Some(format!("B-{id:04}")),
                name: format!("Batch {id}"),
                status: BatchStatus::Active,
                fermenter: FermenterRef {
                    id: FermenterId(id),
                    name: format!("FV-{id}"),
                    size_liters: None,
                    status: None,
                },
                profile: ProfileRef {
                    id: ProfileId(1),
                    name: "Ale 19C".into(),
                    beer_type: None,
                },
                start_time: None,
                end_time: None,
                notes: None,
            },
            current_temp,
            target_temp,
            control_state: Some(ControlState::Idle),
            current_phase: Some(0),
            phase_progress: Some(10.0),
            elapsed_hours: Some(2.0),
            recent_logs: Vec::new(),
        }
    }

    fn update(id: i64) -> LiveUpdateMessage {
        LiveUpdateMessage {
            batch_id: BatchId(id),
            ..Default::default()
        }
    }

    #[test]
    fn replace_is_idempotent() {
        let mut r = Reconciler::default();
        let set = vec![snapshot(1, Some(20.0), Some(22.0)), snapshot(2, None, None)];
        r.replace_all(set.clone()).unwrap();
        let first = r.snapshots().to_vec();
        r.replace_all(set).unwrap();
        assert_eq!(r.snapshots(), first.as_slice());
    }

    #[test]
    fn partial_merge_preserves_untouched_fields() {
        let mut r = Reconciler::default();
        r.replace_all(vec![snapshot(1, Some(20.0), Some(22.0))]).unwrap();

        let mut msg = update(1);
        msg.current_temp = Some(Some(21.0));
        let merged = r.apply_partial(&msg).unwrap().expect("known batch");
        assert_eq!(merged.current_temp, Some(21.0));
        assert_eq!(merged.target_temp, Some(22.0));
        assert_eq!(merged.control_state, Some(ControlState::Idle));
        assert_eq!(merged.batch.name, "Batch 1");
    }

    #[test]
    fn explicit_null_clears_a_field() {
        let mut r = Reconciler::default();
        r.replace_all(vec![snapshot(1, Some(20.0), Some(22.0))]).unwrap();

        let mut msg = update(1);
        msg.target_temp = Some(None);
        msg.control_state = Some(Some(ControlState::Heating));
        r.apply_partial(&msg).unwrap();

        let s = r.get(BatchId(1)).unwrap();
        assert_eq!(s.target_temp, None);
        assert_eq!(s.current_temp, Some(20.0));
        assert_eq!(s.control_state, Some(ControlState::Heating));
    }

    #[test]
    fn unknown_batch_update_is_a_noop() {
        let mut r = Reconciler::default();
        r.replace_all(vec![snapshot(1, Some(20.0), Some(22.0))]).unwrap();
        let before = serde_json::to_string(r.snapshots()).unwrap();
        let revision = r.revision();

        let notified = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&notified);
        r.subscribe(move |_| *counter.borrow_mut() += 1);

        let mut msg = update(99);
        msg.current_temp = Some(Some(5.0));
        assert!(r.apply_partial(&msg).unwrap().is_none());

        assert_eq!(serde_json::to_string(r.snapshots()).unwrap(), before);
        assert_eq!(r.revision(), revision);
        assert_eq!(*notified.borrow(), 0);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn replace_removes_absent_batches() {
        let mut r = Reconciler::default();
        r.replace_all(vec![snapshot(1, Some(20.0), None), snapshot(2, Some(18.0), None)]).unwrap();

        let mut msg = update(2);
        msg.current_temp = Some(Some(17.5));
        r.apply_partial(&msg).unwrap();

        let a = snapshot(1, Some(20.0), None);
        r.replace_all(vec![a.clone()]).unwrap();
        assert_eq!(r.snapshots(), &[a]);
        assert!(r.get(BatchId(2)).is_none());
    }

    #[test]
    fn poll_overwrites_partial_state() {
        let mut r = Reconciler::default();
        r.replace_all(vec![snapshot(1, Some(20.0), Some(22.0))]).unwrap();
        let mut msg = update(1);
        msg.current_temp = Some(Some(25.0));
        r.apply_partial(&msg).unwrap();

        r.replace_all(vec![snapshot(1, Some(20.5), Some(22.0))]).unwrap();
        assert_eq!(r.get(BatchId(1)).unwrap().current_temp, Some(20.5));
    }

    #[test]
    fn duplicate_ids_are_rejected_without_touching_the_view() {
        let mut r = Reconciler::default();
        r.replace_all(vec![snapshot(1, Some(20.0), None)]).unwrap();
        let revision = r.revision();

        let err = r
            .replace_all(vec![snapshot(2, None, None), snapshot(2, Some(1.0), None)])
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
        assert_eq!(r.revision(), revision);
        assert_eq!(r.snapshots(), &[snapshot(1, Some(20.0), None)]);
    }

    #[test]
    fn out_of_range_updates_are_rejected() {
        let mut r = Reconciler::default();
        r.replace_all(vec![snapshot(1, Some(20.0), Some(22.0))]).unwrap();
        let before = r.snapshots().to_vec();

        let mut progress = update(1);
        progress.phase_progress = Some(Some(140.0));
        assert!(matches!(r.apply_partial(&progress), Err(SyncError::Validation(_))));

        let mut temp = update(1);
        temp.current_temp = Some(Some(f64::NAN));
        assert!(matches!(r.apply_partial(&temp), Err(SyncError::Validation(_))));

        assert_eq!(r.snapshots(), before.as_slice());
    }

    #[test]
    fn subscribers_receive_full_collection_and_can_leave() {
        let mut r = Reconciler::default();
        let seen: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let id = r.subscribe(move |all| sink.borrow_mut().push(all.len()));

        r.replace_all(vec![snapshot(1, None, None), snapshot(2, None, None)]).unwrap();
        let mut msg = update(2);
        msg.current_phase = Some(Some(1));
        r.apply_partial(&msg).unwrap();
        assert_eq!(*seen.borrow(), vec![2, 2]);
        assert_eq!(r.revision(), 2);

        assert!(r.unsubscribe(id));
        r.replace_all(Vec::new()).unwrap();
        assert_eq!(*seen.borrow(), vec![2, 2]);
        assert!(!r.unsubscribe(id));
    }

    #[test]
    fn recent_logs_keep_the_newest_points() {
        let mut r = Reconciler::new(2);
        let mut s = snapshot(1, Some(20.0), None);
        s.recent_logs = (0..5)
            .map(|i| TemperatureLogPoint {
                timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, i).unwrap(),
                actual_temp: 20.0 + f64::from(i),
                target_temp: None,
                control_state: None,
                power_consumed_wh: None,
            })
            .collect();
        r.replace_all(vec![s]).unwrap();

        let kept: Vec<f64> = r.snapshots()[0].recent_logs.iter().map(|p| p.actual_temp).collect();
        assert_eq!(kept, vec![23.0, 24.0]);
    }
}
