use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use super::snapshot::{ConnectionEntry, ConnectionMetadata, ConnectionSnapshot};

/// A connection as tracked by the monitor
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub id: String,
    pub metadata: ConnectionMetadata,
    pub upload: u64,
    pub download: u64,
    /// Bytes since the previous snapshot
    pub upload_speed: u64,
    pub download_speed: u64,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub alive: bool,
    pub chains: Vec<String>,
    pub rule: String,
    pub rule_payload: String,
}

impl ConnectionRecord {
    fn from_entry(entry: ConnectionEntry, upload_speed: u64, download_speed: u64) -> Self {
        Self {
            id: entry.id,
            metadata: entry.metadata,
            upload: entry.upload,
            download: entry.download,
            upload_speed,
            download_speed,
            start: entry.start,
            end: None,
            alive: true,
            chains: entry.chains,
            rule: entry.rule,
            rule_payload: entry.rule_payload,
        }
    }

    fn close(&mut self, at: DateTime<Utc>) {
        self.alive = false;
        self.upload_speed = 0;
        self.download_speed = 0;
        self.end = Some(at);
    }

    /// Destination shown to users: host when known, IP otherwise.
    pub fn destination(&self) -> String {
        let host = if self.metadata.host.is_empty() {
            &self.metadata.destination_ip
        } else {
            &self.metadata.host
        };
        format!("{}:{}", host, self.metadata.destination_port)
    }
}

/// Reconciled table of live and recently closed connections
#[derive(Debug, Default)]
pub struct ConnectionTable {
    records: HashMap<String, ConnectionRecord>,
    /// Counters of alive records from the last snapshot
    previous: HashMap<String, (u64, u64)>,
    ordered: Vec<ConnectionRecord>,
    upload_total: u64,
    download_total: u64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one snapshot; returns whether any record changed.
    ///
    /// Records missing from the snapshot are closed, never dropped, and an empty
    /// snapshot closes everything that is still alive.
    pub fn reconcile(&mut self, snapshot: ConnectionSnapshot, now: DateTime<Utc>) -> bool {
        self.upload_total = snapshot.upload_total;
        self.download_total = snapshot.download_total;

        let mut changed = false;
        let active: HashSet<String> = snapshot.connections.iter().map(|c| c.id.clone()).collect();

        for entry in snapshot.connections {
            let (upload_speed, download_speed) = match self.previous.get(&entry.id) {
                Some(&(upload, download)) => (
                    entry.upload.saturating_sub(upload),
                    entry.download.saturating_sub(download),
                ),
                None => (0, 0),
            };
            let record = ConnectionRecord::from_entry(entry, upload_speed, download_speed);
            if self.records.get(&record.id) != Some(&record) {
                changed = true;
                self.records.insert(record.id.clone(), record);
            }
        }

        for record in self.records.values_mut() {
            if record.alive && !active.contains(&record.id) {
                record.close(now);
                changed = true;
            }
        }

        self.previous = self
            .records
            .values()
            .filter(|record| record.alive)
            .map(|record| (record.id.clone(), (record.upload, record.download)))
            .collect();

        if changed {
            self.rebuild();
        }
        changed
    }

    /// Close one record locally; returns false if it was unknown or already closed.
    pub fn mark_closed(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        let closed = match self.records.get_mut(id) {
            Some(record) if record.alive => {
                record.close(now);
                true
            }
            _ => false,
        };
        if closed {
            self.previous.remove(id);
            self.rebuild();
        }
        closed
    }

    pub fn mark_all_closed(&mut self, now: DateTime<Utc>) -> usize {
        let mut closed = 0;
        for record in self.records.values_mut().filter(|r| r.alive) {
            record.close(now);
            closed += 1;
        }
        if closed > 0 {
            self.previous.clear();
            self.rebuild();
        }
        closed
    }

    /// Purge every closed record; returns how many were removed.
    pub fn clear_closed(&mut self) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.alive);
        let removed = before - self.records.len();
        if removed > 0 {
            self.rebuild();
        }
        removed
    }

    fn rebuild(&mut self) {
        let mut ordered: Vec<ConnectionRecord> = self.records.values().cloned().collect();
        ordered.sort_by(|a, b| b.start.cmp(&a.start).then_with(|| a.id.cmp(&b.id)));
        self.ordered = ordered;
    }

    /// Records by start time, newest first
    pub fn ordered(&self) -> &[ConnectionRecord] {
        &self.ordered
    }

    pub fn get(&self, id: &str) -> Option<&ConnectionRecord> {
        self.records.get(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn alive_count(&self) -> usize {
        self.records.values().filter(|r| r.alive).count()
    }

    pub fn totals(&self) -> (u64, u64) {
        (self.upload_total, self.download_total)
    }

    /// Aggregate (upload, download) speed of alive records
    pub fn speeds(&self) -> (u64, u64) {
        self.records
            .values()
            .filter(|r| r.alive)
            .fold((0, 0), |(up, down), r| (up + r.upload_speed, down + r.download_speed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn entry(id: &str, upload: u64, download: u64, start_secs: i64) -> ConnectionEntry {
        ConnectionEntry {
            id: id.to_string(),
            metadata: ConnectionMetadata {
                host: format!("{}.example.com", id),
                destination_port: 443,
                ..Default::default()
            },
            upload,
            download,
            start: Utc.timestamp_opt(1_700_000_000 + start_secs, 0).unwrap(),
            chains: vec!["Proxy".into()],
            rule: "Match".into(),
            rule_payload: String::new(),
        }
    }

    fn snapshot(entries: Vec<ConnectionEntry>) -> ConnectionSnapshot {
        ConnectionSnapshot {
            upload_total: entries.iter().map(|e| e.upload).sum(),
            download_total: entries.iter().map(|e| e.download).sum(),
            connections: entries,
        }
    }

    #[test]
    fn test_empty_snapshot_closes_but_retains() {
        let mut table = ConnectionTable::new();
        let now = Utc::now();
        assert!(table.reconcile(snapshot(vec![entry("c1", 100, 0, 0)]), now));

        let later = now + Duration::seconds(1);
        assert!(table.reconcile(snapshot(vec![]), later));

        let record = table.get("c1").unwrap();
        assert!(!record.alive);
        assert_eq!(record.end, Some(later));
        assert_eq!(record.upload, 100);
        assert_eq!(record.upload_speed, 0);
        assert_eq!(table.ordered().len(), 1);
    }

    #[test]
    fn test_closed_record_stays_frozen() {
        let mut table = ConnectionTable::new();
        let now = Utc::now();
        table.reconcile(snapshot(vec![entry("c1", 100, 50, 0)]), now);
        table.reconcile(snapshot(vec![entry("c2", 1, 1, 1)]), now + Duration::seconds(1));
        let closed = table.get("c1").cloned().unwrap();

        for i in 2..5 {
            table.reconcile(snapshot(vec![]), now + Duration::seconds(i));
            table.reconcile(snapshot(vec![entry("c3", 9, 9, i)]), now + Duration::seconds(i));
        }

        assert_eq!(table.get("c1"), Some(&closed));
        assert_eq!(table.clear_closed(), 2);
        assert_eq!(table.len(), 1);
        assert!(table.get("c3").unwrap().alive);
    }

    #[test]
    fn test_speed_is_delta_and_never_negative() {
        let mut table = ConnectionTable::new();
        let now = Utc::now();
        table.reconcile(snapshot(vec![entry("c1", 100, 1000, 0)]), now);
        assert_eq!(table.get("c1").unwrap().upload_speed, 0);

        table.reconcile(snapshot(vec![entry("c1", 160, 1500, 0)]), now);
        let record = table.get("c1").unwrap();
        assert_eq!((record.upload_speed, record.download_speed), (60, 500));

        // counter reset on the controller side
        table.reconcile(snapshot(vec![entry("c1", 10, 20, 0)]), now);
        let record = table.get("c1").unwrap();
        assert_eq!((record.upload_speed, record.download_speed), (0, 0));
    }

    #[test]
    fn test_reappearing_id_starts_at_zero_speed() {
        let mut table = ConnectionTable::new();
        let now = Utc::now();
        table.reconcile(snapshot(vec![entry("c1", 100, 100, 0)]), now);
        table.reconcile(snapshot(vec![]), now);
        table.reconcile(snapshot(vec![entry("c1", 400, 400, 0)]), now);
        let record = table.get("c1").unwrap();
        assert!(record.alive);
        assert_eq!(record.end, None);
        assert_eq!(record.upload_speed, 0);
    }

    #[test]
    fn test_identical_snapshot_reports_no_change() {
        let mut table = ConnectionTable::new();
        let now = Utc::now();
        table.reconcile(snapshot(vec![entry("c1", 5, 5, 0)]), now);
        table.reconcile(snapshot(vec![entry("c1", 5, 5, 0)]), now);
        assert!(!table.reconcile(snapshot(vec![entry("c1", 5, 5, 0)]), now));
    }

    #[test]
    fn test_ordered_newest_first() {
        let mut table = ConnectionTable::new();
        table.reconcile(
            snapshot(vec![entry("old", 0, 0, 0), entry("new", 0, 0, 30), entry("mid", 0, 0, 10)]),
            Utc::now(),
        );
        let ids: Vec<_> = table.ordered().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }
}
