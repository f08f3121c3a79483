//! Timestamp grouping
//!
//! Folds a flat sequence of typed measurements into one composite record per
//! (timestamp, user) pair, then partitions the result into per-user streams
//! ordered by recorded time.

use std::collections::BTreeMap;

use tracing::debug;

use crate::types::{CompositeRecord, Measurement, MeasurementKind, Timestamp, UserId};

/// Kinds excluded from grouping and replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IgnoreSet {
    mask: [bool; MeasurementKind::COUNT],
}

impl IgnoreSet {
    /// Ignore nothing
    pub fn none() -> Self {
        Self {
            mask: [false; MeasurementKind::COUNT],
        }
    }

    pub fn from_kinds(kinds: impl IntoIterator<Item = MeasurementKind>) -> Self {
        let mut set = Self::none();
        for kind in kinds {
            set.mask[kind.ordinal()] = true;
        }
        set
    }

    /// Parse a comma-separated list of kind labels
    pub fn parse_list(list: &str) -> Result<Self, String> {
        let mut kinds = Vec::new();
        for label in list.split(',').map(str::trim).filter(|l| !l.is_empty()) {
            match MeasurementKind::parse(label) {
                Some(kind) => kinds.push(kind),
                None => return Err(format!("unknown measurement kind '{}'", label)),
            }
        }
        Ok(Self::from_kinds(kinds))
    }

    pub fn contains(&self, kind: MeasurementKind) -> bool {
        self.mask[kind.ordinal()]
    }

    pub fn kinds(&self) -> impl Iterator<Item = MeasurementKind> + '_ {
        MeasurementKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }
}

impl Default for IgnoreSet {
    /// R2R and ECG are too dense to replay as messages; Position is superseded
    /// by the separate latitude/longitude/altitude kinds.
    fn default() -> Self {
        Self::from_kinds([
            MeasurementKind::R2R,
            MeasurementKind::Ecg,
            MeasurementKind::Position,
        ])
    }
}

/// Groups measurements into composite records
#[derive(Debug, Clone, Default)]
pub struct Grouper {
    ignore: IgnoreSet,
}

impl Grouper {
    pub fn new(ignore: IgnoreSet) -> Self {
        Self { ignore }
    }

    pub fn ignore(&self) -> &IgnoreSet {
        &self.ignore
    }

    /// Group measurements in a single pass.
    ///
    /// Input order does not matter. Within one (timestamp, user) key a later
    /// value for the same kind overwrites the earlier one.
    pub fn group(&self, measurements: &[Measurement]) -> GroupedRecords {
        let mut records: BTreeMap<(Timestamp, UserId), CompositeRecord> = BTreeMap::new();
        let mut unrecognized = 0;
        let mut ignored = 0;

        for measurement in measurements {
            let kind = match measurement.kind.kind() {
                Some(kind) => kind,
                None => {
                    unrecognized += 1;
                    continue;
                }
            };
            if self.ignore.contains(kind) {
                ignored += 1;
                continue;
            }

            let key = (measurement.timestamp, measurement.user_id);
            let record = records
                .entry(key)
                .or_insert_with(|| CompositeRecord::new(key.0, key.1));

            if record.fields.set(kind, measurement.values.clone()).is_some() {
                debug!(
                    timestamp = key.0,
                    user_id = key.1,
                    %kind,
                    "duplicate measurement for instant, keeping the later value"
                );
            }
        }

        if unrecognized > 0 || ignored > 0 {
            debug!(unrecognized, ignored, "measurements excluded from grouping");
        }

        GroupedRecords {
            records,
            unrecognized,
            ignored,
        }
    }
}

/// Grouper output, ordered by (timestamp, user)
#[derive(Debug, Clone, Default)]
pub struct GroupedRecords {
    records: BTreeMap<(Timestamp, UserId), CompositeRecord>,
    unrecognized: usize,
    ignored: usize,
}

impl GroupedRecords {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, timestamp: Timestamp, user_id: UserId) -> Option<&CompositeRecord> {
        self.records.get(&(timestamp, user_id))
    }

    /// Records in ascending timestamp order
    pub fn iter(&self) -> impl Iterator<Item = &CompositeRecord> + '_ {
        self.records.values()
    }

    /// Measurements dropped because their label was not recognized
    pub fn unrecognized(&self) -> usize {
        self.unrecognized
    }

    /// Measurements dropped because their kind was ignored
    pub fn ignored(&self) -> usize {
        self.ignored
    }

    /// Flatten back into one measurement per observed field
    pub fn to_measurements(&self) -> Vec<Measurement> {
        self.iter().flat_map(CompositeRecord::to_measurements).collect()
    }

    /// Split into one stream per user, each ordered by timestamp
    pub fn into_user_streams(self) -> Vec<UserStream> {
        let mut by_user: BTreeMap<UserId, Vec<CompositeRecord>> = BTreeMap::new();
        for ((_, user_id), record) in self.records {
            by_user.entry(user_id).or_default().push(record);
        }

        by_user
            .into_iter()
            .map(|(user_id, records)| UserStream { user_id, records })
            .collect()
    }
}

/// Ordered composite records of a single user
#[derive(Debug, Clone, PartialEq)]
pub struct UserStream {
    pub user_id: UserId,
    pub records: Vec<CompositeRecord>,
}

impl UserStream {
    pub fn timestamps(&self) -> Vec<Timestamp> {
        self.records.iter().map(|r| r.timestamp).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
