//! Core types for the replay pipeline
//!
//! This module defines the data that flows through each stage: recorded
//! measurements as read from disk, composite per-instant records produced by
//! the grouper, and the single-kind messages handed to the transport.

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Recorded instant, in epoch seconds
pub type Timestamp = i64;

/// Identifier of a (possibly synthesized) user
pub type UserId = i64;

/// Measurement kinds recognized by the replay pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MeasurementKind {
    HeartRate,
    BreathFrequency,
    Respiration,
    AccelerationX,
    AccelerationY,
    AccelerationZ,
    PhoneLatitude,
    PhoneLongitude,
    PhoneAltitude,
    /// Beat-to-beat interval
    R2R,
    #[serde(rename = "ECG")]
    Ecg,
    /// Raw positional reading, superseded by the Phone* kinds
    Position,
}

impl MeasurementKind {
    /// Number of kinds in the enumeration
    pub const COUNT: usize = 12;

    /// Every kind, in ordinal order
    pub const ALL: [MeasurementKind; Self::COUNT] = [
        MeasurementKind::HeartRate,
        MeasurementKind::BreathFrequency,
        MeasurementKind::Respiration,
        MeasurementKind::AccelerationX,
        MeasurementKind::AccelerationY,
        MeasurementKind::AccelerationZ,
        MeasurementKind::PhoneLatitude,
        MeasurementKind::PhoneLongitude,
        MeasurementKind::PhoneAltitude,
        MeasurementKind::R2R,
        MeasurementKind::Ecg,
        MeasurementKind::Position,
    ];

    pub fn ordinal(self) -> usize {
        self as usize
    }

    /// Canonical label used on the wire
    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementKind::HeartRate => "HeartRate",
            MeasurementKind::BreathFrequency => "BreathFrequency",
            MeasurementKind::Respiration => "Respiration",
            MeasurementKind::AccelerationX => "AccelerationX",
            MeasurementKind::AccelerationY => "AccelerationY",
            MeasurementKind::AccelerationZ => "AccelerationZ",
            MeasurementKind::PhoneLatitude => "PhoneLatitude",
            MeasurementKind::PhoneLongitude => "PhoneLongitude",
            MeasurementKind::PhoneAltitude => "PhoneAltitude",
            MeasurementKind::R2R => "R2R",
            MeasurementKind::Ecg => "ECG",
            MeasurementKind::Position => "Position",
        }
    }

    /// Map a raw label to a kind.
    ///
    /// Recordings from different exporters spell kinds differently
    /// (`heartRate`, `HeartRate`, `heart_rate`, `Ecg`, `ECG`, ...). Matching
    /// ignores case and any non-alphanumeric separators. Returns `None` for
    /// anything outside the recognized set.
    pub fn parse(label: &str) -> Option<Self> {
        let key: String = label
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();

        let kind = match key.as_str() {
            "heartrate" | "hr" => MeasurementKind::HeartRate,
            "breathfrequency" | "breathingfrequency" | "breathrate" => {
                MeasurementKind::BreathFrequency
            }
            "respiration" => MeasurementKind::Respiration,
            "accelerationx" | "accx" => MeasurementKind::AccelerationX,
            "accelerationy" | "accy" => MeasurementKind::AccelerationY,
            "accelerationz" | "accz" => MeasurementKind::AccelerationZ,
            "phonelatitude" | "latitude" => MeasurementKind::PhoneLatitude,
            "phonelongitude" | "longitude" => MeasurementKind::PhoneLongitude,
            "phonealtitude" | "altitude" => MeasurementKind::PhoneAltitude,
            "r2r" | "rr" | "rrinterval" => MeasurementKind::R2R,
            "ecg" => MeasurementKind::Ecg,
            "position" => MeasurementKind::Position,
            _ => return None,
        };
        Some(kind)
    }

    /// True for the phone GPS kinds
    pub fn is_gps(self) -> bool {
        matches!(
            self,
            MeasurementKind::PhoneLatitude
                | MeasurementKind::PhoneLongitude
                | MeasurementKind::PhoneAltitude
        )
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A kind label as found in an input file
///
/// Unrecognized labels are preserved so they can be reported, but they never
/// take part in replay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum KindLabel {
    Known(MeasurementKind),
    Unrecognized(String),
}

impl KindLabel {
    pub fn kind(&self) -> Option<MeasurementKind> {
        match self {
            KindLabel::Known(kind) => Some(*kind),
            KindLabel::Unrecognized(_) => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            KindLabel::Known(kind) => kind.as_str(),
            KindLabel::Unrecognized(label) => label.as_str(),
        }
    }
}

impl From<String> for KindLabel {
    fn from(label: String) -> Self {
        match MeasurementKind::parse(&label) {
            Some(kind) => KindLabel::Known(kind),
            None => KindLabel::Unrecognized(label),
        }
    }
}

impl From<&str> for KindLabel {
    fn from(label: &str) -> Self {
        KindLabel::from(label.to_string())
    }
}

impl From<KindLabel> for String {
    fn from(label: KindLabel) -> Self {
        match label {
            KindLabel::Known(kind) => kind.as_str().to_string(),
            KindLabel::Unrecognized(label) => label,
        }
    }
}

impl From<MeasurementKind> for KindLabel {
    fn from(kind: MeasurementKind) -> Self {
        KindLabel::Known(kind)
    }
}

/// One recorded reading
///
/// Field names on disk follow the recording exporter (`date`, `value`,
/// `userId`, `measureType`). The `_id` recording identifier is read but never
/// written back out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Recorded instant (epoch seconds)
    #[serde(rename = "date")]
    pub timestamp: Timestamp,
    /// Recorded user
    #[serde(rename = "userId")]
    pub user_id: UserId,
    /// Kind label
    #[serde(rename = "measureType")]
    pub kind: KindLabel,
    /// Sample values for this instant
    #[serde(rename = "value", deserialize_with = "one_or_many")]
    pub values: Vec<f64>,
    /// Recording-specific identifier
    #[serde(rename = "_id", default, skip_serializing)]
    pub recording_id: Option<serde_json::Value>,
}

impl Measurement {
    pub fn new(
        timestamp: Timestamp,
        user_id: UserId,
        kind: impl Into<KindLabel>,
        values: Vec<f64>,
    ) -> Self {
        Self {
            timestamp,
            user_id,
            kind: kind.into(),
            values,
            recording_id: None,
        }
    }
}

/// Accept either a bare number or an array of numbers
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(f64),
        Many(Vec<f64>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

/// Per-user wrapper used by some recording exports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserData {
    pub data: Vec<Measurement>,
}

/// Values observed at one instant, indexed by kind ordinal
///
/// A slot is `Some` only if that kind was observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KindFields {
    slots: [Option<Vec<f64>>; MeasurementKind::COUNT],
}

impl KindFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store values for a kind, returning whatever was there before
    pub fn set(&mut self, kind: MeasurementKind, values: Vec<f64>) -> Option<Vec<f64>> {
        self.slots[kind.ordinal()].replace(values)
    }

    pub fn get(&self, kind: MeasurementKind) -> Option<&[f64]> {
        self.slots[kind.ordinal()].as_deref()
    }

    pub fn contains(&self, kind: MeasurementKind) -> bool {
        self.slots[kind.ordinal()].is_some()
    }

    /// Observed kinds with their values, in ordinal order
    pub fn iter(&self) -> impl Iterator<Item = (MeasurementKind, &[f64])> + '_ {
        MeasurementKind::ALL
            .iter()
            .zip(self.slots.iter())
            .filter_map(|(kind, slot)| slot.as_deref().map(|values| (*kind, values)))
    }

    pub fn kinds(&self) -> impl Iterator<Item = MeasurementKind> + '_ {
        self.iter().map(|(kind, _)| kind)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

impl Serialize for KindFields {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (kind, values) in self.iter() {
            map.serialize_entry(kind.as_str(), values)?;
        }
        map.end()
    }
}

/// Every kind observed for one (timestamp, user) pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompositeRecord {
    pub timestamp: Timestamp,
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub fields: KindFields,
}

impl CompositeRecord {
    pub fn new(timestamp: Timestamp, user_id: UserId) -> Self {
        Self {
            timestamp,
            user_id,
            fields: KindFields::new(),
        }
    }

    /// Flatten back into one measurement per observed kind
    pub fn to_measurements(&self) -> Vec<Measurement> {
        self.fields
            .iter()
            .map(|(kind, values)| Measurement::new(self.timestamp, self.user_id, kind, values.to_vec()))
            .collect()
    }
}

/// Single-kind message handed to the transport
///
/// Serialized with the field names downstream subscribers expect: `date`
/// carries the emission time in epoch milliseconds, not the recorded instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "date", with = "chrono::serde::ts_milliseconds")]
    pub emitted_at: DateTime<Utc>,
    #[serde(rename = "value")]
    pub values: Vec<f64>,
    #[serde(rename = "userId")]
    pub user_id: UserId,
    #[serde(rename = "measureType")]
    pub kind: MeasurementKind,
}

impl OutboundMessage {
    pub fn new(user_id: UserId, kind: MeasurementKind, values: &[f64]) -> Self {
        Self {
            emitted_at: Utc::now(),
            values: values.to_vec(),
            user_id,
            kind,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label_variants() {
        assert_eq!(MeasurementKind::parse("heartRate"), Some(MeasurementKind::HeartRate));
        assert_eq!(MeasurementKind::parse("HeartRate"), Some(MeasurementKind::HeartRate));
        assert_eq!(MeasurementKind::parse("heart_rate"), Some(MeasurementKind::HeartRate));
        assert_eq!(MeasurementKind::parse("Ecg"), Some(MeasurementKind::Ecg));
        assert_eq!(MeasurementKind::parse("ECG"), Some(MeasurementKind::Ecg));
        assert_eq!(MeasurementKind::parse("accelerationX"), Some(MeasurementKind::AccelerationX));
        assert_eq!(MeasurementKind::parse("R2R"), Some(MeasurementKind::R2R));
        assert_eq!(MeasurementKind::parse("SkinTemperature"), None);
        assert_eq!(MeasurementKind::parse(""), None);
    }

    #[test]
    fn test_parse_round_trips_canonical_names() {
        for kind in MeasurementKind::ALL {
            assert_eq!(MeasurementKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn test_ordinals_match_all() {
        for (index, kind) in MeasurementKind::ALL.iter().enumerate() {
            assert_eq!(kind.ordinal(), index);
        }
    }

    #[test]
    fn test_deserialize_measurement() {
        let json = r#"{
            "_id": {"$oid": "64cb7f0e"},
            "date": 1691042400,
            "value": [72.0, 73.5],
            "userId": 7,
            "measureType": "HeartRate"
        }"#;

        let measurement: Measurement = serde_json::from_str(json).unwrap();
        assert_eq!(measurement.timestamp, 1691042400);
        assert_eq!(measurement.user_id, 7);
        assert_eq!(measurement.kind, KindLabel::Known(MeasurementKind::HeartRate));
        assert_eq!(measurement.values, vec![72.0, 73.5]);
        assert!(measurement.recording_id.is_some());
    }

    #[test]
    fn test_scalar_value_and_unknown_label() {
        let json = r#"{"date": 10, "value": 1.5, "userId": 1, "measureType": "Steps"}"#;
        let measurement: Measurement = serde_json::from_str(json).unwrap();

        assert_eq!(measurement.values, vec![1.5]);
        assert_eq!(measurement.kind, KindLabel::Unrecognized("Steps".to_string()));
        assert_eq!(measurement.kind.kind(), None);
    }

    #[test]
    fn test_recording_id_never_serialized() {
        let mut measurement = Measurement::new(1, 2, MeasurementKind::Respiration, vec![0.2]);
        measurement.recording_id = Some(serde_json::json!("abc"));

        let json = serde_json::to_string(&measurement).unwrap();
        assert!(!json.contains("_id"));
        assert!(json.contains("\"measureType\":\"Respiration\""));
    }

    #[test]
    fn test_kind_fields_presence() {
        let mut fields = KindFields::new();
        assert!(fields.is_empty());

        assert_eq!(fields.set(MeasurementKind::PhoneAltitude, vec![12.0]), None);
        assert_eq!(fields.set(MeasurementKind::HeartRate, vec![70.0]), None);
        assert_eq!(
            fields.set(MeasurementKind::HeartRate, vec![71.0]),
            Some(vec![70.0])
        );

        assert_eq!(fields.len(), 2);
        assert!(!fields.contains(MeasurementKind::Ecg));
        assert_eq!(fields.get(MeasurementKind::HeartRate), Some(&[71.0][..]));

        let kinds: Vec<_> = fields.kinds().collect();
        assert_eq!(kinds, vec![MeasurementKind::HeartRate, MeasurementKind::PhoneAltitude]);
    }

    #[test]
    fn test_outbound_message_wire_shape() {
        let message = OutboundMessage::new(3, MeasurementKind::Ecg, &[0.1, 0.2]);
        let value: serde_json::Value =
            serde_json::from_slice(&message.to_payload().unwrap()).unwrap();

        assert_eq!(value["measureType"], "ECG");
        assert_eq!(value["userId"], 3);
        assert_eq!(value["value"], serde_json::json!([0.1, 0.2]));
        assert_eq!(value["date"], message.emitted_at.timestamp_millis());
    }
}
