//! Multi-user synthesis
//!
//! Expands one recording into several simulated users. Every extra user is a
//! copy of the recording with a remapped id, a fixed per-user time shift and
//! per-value jitter sized for each measurement kind.

use rand::Rng;
use tracing::debug;

use crate::config::SynthesisConfig;
use crate::error::ReplayError;
use crate::types::{Measurement, MeasurementKind, Timestamp, UserId};

/// Id offset between consecutive simulated users
const USER_ID_STRIDE: UserId = 1000;

/// Largest time shift applied to a simulated user, in seconds
const MAX_TIME_SHIFT: i64 = 30 * 60;

/// Additive jitter bound for latitude/longitude, in degrees (about 55 m)
const GPS_OFFSET: f64 = 0.0005;

/// Multiplicative jitter band for a kind
fn jitter_band(kind: Option<MeasurementKind>) -> (f64, f64) {
    match kind {
        Some(MeasurementKind::HeartRate) => (0.85, 1.15),
        Some(MeasurementKind::BreathFrequency) => (0.8, 1.2),
        Some(MeasurementKind::R2R) => (0.9, 1.1),
        Some(MeasurementKind::PhoneLatitude) | Some(MeasurementKind::PhoneLongitude) => {
            (0.9999, 1.0001)
        }
        Some(MeasurementKind::PhoneAltitude) => (0.95, 1.05),
        Some(MeasurementKind::Ecg) => (0.95, 1.05),
        Some(MeasurementKind::Respiration) => (0.98, 1.02),
        Some(MeasurementKind::AccelerationX)
        | Some(MeasurementKind::AccelerationY)
        | Some(MeasurementKind::AccelerationZ) => (0.9, 1.1),
        _ => (0.9, 1.1),
    }
}

/// Deterministic shift within ±30 minutes for a user index
pub fn time_shift(user_index: usize) -> i64 {
    let spread = (MAX_TIME_SHIFT * 2) as usize;
    (user_index.wrapping_mul(7) % spread) as i64 - MAX_TIME_SHIFT
}

fn simulated_user_id(original: UserId, user_index: usize, custom: Option<&[UserId]>) -> UserId {
    match custom.and_then(|ids| ids.get(user_index)) {
        Some(id) => *id,
        None => original + user_index as UserId * USER_ID_STRIDE,
    }
}

fn jitter_value<R: Rng>(value: f64, kind: Option<MeasurementKind>, rng: &mut R) -> f64 {
    match kind {
        Some(MeasurementKind::PhoneLatitude) | Some(MeasurementKind::PhoneLongitude) => {
            value + rng.gen_range(-GPS_OFFSET..GPS_OFFSET)
        }
        _ => {
            let (min, max) = jitter_band(kind);
            value * rng.gen_range(min..max)
        }
    }
}

fn clone_for_user<R: Rng>(
    measurement: &Measurement,
    user_index: usize,
    custom: Option<&[UserId]>,
    rng: &mut R,
) -> Measurement {
    let kind = measurement.kind.kind();
    let timestamp: Timestamp = measurement.timestamp + time_shift(user_index);
    let values = measurement
        .values
        .iter()
        .map(|value| jitter_value(*value, kind, rng))
        .collect();

    Measurement {
        timestamp,
        user_id: simulated_user_id(measurement.user_id, user_index, custom),
        kind: measurement.kind.clone(),
        values,
        recording_id: None,
    }
}

/// Expand `measurements` to `config.users` simulated users.
///
/// With one user or fewer the input is returned as is. Without custom ids
/// the first user keeps the original measurements untouched.
pub fn generate_multi_user<R: Rng>(
    measurements: Vec<Measurement>,
    config: &SynthesisConfig,
    rng: &mut R,
) -> Result<Vec<Measurement>, ReplayError> {
    if config.users <= 1 {
        return Ok(measurements);
    }

    let custom = config.custom_user_ids.as_deref();
    if let Some(ids) = custom {
        if ids.len() != config.users {
            return Err(ReplayError::Synthesis(format!(
                "number of custom user ids ({}) must match number of users ({})",
                ids.len(),
                config.users
            )));
        }
    }

    let base: Vec<Measurement> = if config.gps_only {
        measurements
            .into_iter()
            .filter(|m| m.kind.kind().is_some_and(MeasurementKind::is_gps))
            .collect()
    } else {
        measurements
    };

    let mut result = Vec::with_capacity(base.len() * config.users);
    for user_index in 0..config.users {
        if user_index == 0 && custom.is_none() {
            result.extend(base.iter().cloned());
        } else {
            result.extend(
                base.iter()
                    .map(|m| clone_for_user(m, user_index, custom, rng)),
            );
        }
    }

    debug!(
        users = config.users,
        input = base.len(),
        output = result.len(),
        gps_only = config.gps_only,
        "synthesized users"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KindLabel;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample() -> Vec<Measurement> {
        let mut hr = Measurement::new(1_000_000, 7, MeasurementKind::HeartRate, vec![80.0]);
        hr.recording_id = Some(serde_json::json!("rec-1"));
        vec![
            hr,
            Measurement::new(1_000_000, 7, MeasurementKind::PhoneLatitude, vec![45.0]),
            Measurement::new(1_000_001, 7, MeasurementKind::PhoneAltitude, vec![200.0]),
            Measurement::new(1_000_001, 7, "SkinTemperature", vec![33.0]),
        ]
    }

    fn config(users: usize) -> SynthesisConfig {
        SynthesisConfig {
            users,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_user_is_unchanged() {
        let mut rng = StdRng::seed_from_u64(1);
        let out = generate_multi_user(sample(), &config(1), &mut rng).unwrap();
        assert_eq!(out, sample());
    }

    #[test]
    fn test_expands_with_original_first() {
        let mut rng = StdRng::seed_from_u64(1);
        let out = generate_multi_user(sample(), &config(3), &mut rng).unwrap();
        assert_eq!(out.len(), 12);

        assert_eq!(&out[..4], &sample()[..]);

        let second = &out[4];
        assert_eq!(second.user_id, 1007);
        assert_eq!(second.timestamp, 1_000_000 + 7 - 1800);
        assert_eq!(second.recording_id, None);

        let third = &out[8];
        assert_eq!(third.user_id, 2007);
        assert_eq!(third.timestamp, 1_000_000 + 14 - 1800);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut rng = StdRng::seed_from_u64(42);
        let out = generate_multi_user(sample(), &config(50), &mut rng).unwrap();

        for m in out.iter().skip(4) {
            let value = m.values[0];
            match m.kind.kind() {
                Some(MeasurementKind::HeartRate) => assert!((67.9..=92.1).contains(&value)),
                Some(MeasurementKind::PhoneLatitude) => assert!((value - 45.0).abs() <= 0.0005 + 1e-9),
                Some(MeasurementKind::PhoneAltitude) => assert!((189.9..=210.1).contains(&value)),
                _ => assert!((29.6..=36.4).contains(&value)),
            }
        }
    }

    #[test]
    fn test_custom_ids_replace_every_user() {
        let mut rng = StdRng::seed_from_u64(3);
        let cfg = SynthesisConfig {
            users: 2,
            custom_user_ids: Some(vec![501, 502]),
            ..Default::default()
        };

        let out = generate_multi_user(sample(), &cfg, &mut rng).unwrap();
        assert!(out[..4].iter().all(|m| m.user_id == 501 && m.recording_id.is_none()));
        assert!(out[4..].iter().all(|m| m.user_id == 502));
        assert_eq!(out[0].timestamp, 1_000_000 - 1800);
    }

    #[test]
    fn test_custom_id_count_mismatch() {
        let mut rng = StdRng::seed_from_u64(3);
        let cfg = SynthesisConfig {
            users: 3,
            custom_user_ids: Some(vec![1]),
            ..Default::default()
        };
        assert!(matches!(
            generate_multi_user(sample(), &cfg, &mut rng),
            Err(ReplayError::Synthesis(_))
        ));
    }

    #[test]
    fn test_gps_only_filter() {
        let mut rng = StdRng::seed_from_u64(9);
        let cfg = SynthesisConfig {
            users: 2,
            gps_only: true,
            ..Default::default()
        };

        let out = generate_multi_user(sample(), &cfg, &mut rng).unwrap();
        assert_eq!(out.len(), 4);
        assert!(out
            .iter()
            .all(|m| matches!(&m.kind, KindLabel::Known(kind) if kind.is_gps())));
    }

    #[test]
    fn test_same_seed_same_output() {
        let a = generate_multi_user(sample(), &config(4), &mut StdRng::seed_from_u64(5)).unwrap();
        let b = generate_multi_user(sample(), &config(4), &mut StdRng::seed_from_u64(5)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_time_shift_bounds() {
        assert_eq!(time_shift(0), -1800);
        assert_eq!(time_shift(1), -1793);
        for index in 0..2000 {
            let shift = time_shift(index);
            assert!((-1800..1800).contains(&shift));
        }
    }
}
