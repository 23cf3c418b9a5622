//! Synthetic subscription source for development and tests.
//!
//! Fulfils the [`OpcTransport`] contract without hardware: every sampling
//! cycle each active tag emits one sample whose value is synthesized from
//! the tag's logical type and bounds. Values are deterministic (a triangle
//! wave within the configured range, a toggling boolean, a cycling
//! enumeration) so tests can reason about them; quality is always Good.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

use crate::model::{LogicalType, Machine, OpcQuality, Sample, Tag, Value};
use crate::subscription::{MonitoringSettings, OpcTransport, SubscriptionError};

/// Steps per full triangle-wave period.
const WAVE_PERIOD: u64 = 16;

/// Default numeric range when a tag declares no bounds.
const DEFAULT_MIN: f64 = 0.0;
const DEFAULT_MAX: f64 = 100.0;

#[derive(Debug, Default)]
pub struct SimulatorTransport;

impl SimulatorTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OpcTransport for SimulatorTransport {
    async fn run_session(
        &self,
        machine: Machine,
        settings: MonitoringSettings,
        tx: Sender<Sample>,
        cancel: CancellationToken,
    ) -> Result<(), SubscriptionError> {
        let tags: Vec<Tag> = machine.active_tags().cloned().collect();
        if tags.is_empty() {
            tracing::debug!(machine = %machine.name, "No active tags, simulator session idle");
            cancel.cancelled().await;
            return Ok(());
        }

        tracing::info!(
            machine = %machine.name,
            endpoint = %machine.opc_endpoint,
            tags = tags.len(),
            sampling_interval = ?settings.sampling_interval,
            "Simulator session started"
        );

        let mut ticker = tokio::time::interval(settings.sampling_interval);
        let mut step: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(machine = %machine.name, "Simulator session cancelled");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            for tag in &tags {
                let now = Utc::now();
                let sample = Sample::new(
                    tag.node_id.clone(),
                    synth_value(tag, step),
                    OpcQuality::GOOD,
                    now,
                    now,
                );
                // A full channel must not mask cancellation.
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = tx.send(sample) => {
                        if sent.is_err() {
                            // Channel closed: the pipeline is shutting down.
                            return Ok(());
                        }
                    }
                }
            }
            step = step.wrapping_add(1);
        }
    }
}

/// Synthesize one value for a tag at the given step.
pub(crate) fn synth_value(tag: &Tag, step: u64) -> Value {
    let min = tag.min_value.unwrap_or(DEFAULT_MIN);
    let max = tag.max_value.unwrap_or(DEFAULT_MAX);
    let span = (max - min).max(0.0);

    match tag.logical_type() {
        LogicalType::Float | LogicalType::Double => {
            Value::Float64(min + span * triangle(step))
        }
        LogicalType::Int16 | LogicalType::Int32 | LogicalType::Int64 => {
            Value::Int64((min + span * triangle(step)).round() as i64)
        }
        LogicalType::UInt16 | LogicalType::UInt32 | LogicalType::UInt64 => {
            let base = min.max(0.0);
            let span = (max - base).max(0.0);
            Value::UInt64((base + span * triangle(step)).round() as u64)
        }
        LogicalType::Boolean => Value::Bool(step % 2 == 0),
        LogicalType::String => match tag.allowed_values_list() {
            Some(values) => {
                let index = (step % values.len() as u64) as usize;
                Value::Text(values[index].to_string())
            }
            None => Value::Text(format!("{}-{step}", tag.name)),
        },
        LogicalType::Unknown => Value::Text(format!("{}-{step}", tag.name)),
    }
}

/// Triangle wave over [0, 1] with period [`WAVE_PERIOD`].
fn triangle(step: u64) -> f64 {
    let pos = (step % WAVE_PERIOD) as f64 / WAVE_PERIOD as f64;
    if pos <= 0.5 {
        pos * 2.0
    } else {
        2.0 - pos * 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn tag(data_type: &str, min: Option<f64>, max: Option<f64>) -> Tag {
        Tag {
            id: 1,
            machine_id: 1,
            name: "sim".to_string(),
            node_id: "ns=2;s=Sim".to_string(),
            data_type: data_type.to_string(),
            unit: None,
            min_value: min,
            max_value: max,
            allowed_values: None,
            is_active: true,
        }
    }

    #[test]
    fn test_floats_stay_within_bounds() {
        let t = tag("Float", Some(10.0), Some(20.0));
        for step in 0..100 {
            match synth_value(&t, step) {
                Value::Float64(v) => assert!((10.0..=20.0).contains(&v), "step {step}: {v}"),
                other => panic!("unexpected variant: {other:?}"),
            }
        }
    }

    #[test]
    fn test_integers_ramp_within_default_range() {
        let t = tag("Int32", None, None);
        for step in 0..40 {
            match synth_value(&t, step) {
                Value::Int64(v) => assert!((0..=100).contains(&v)),
                other => panic!("unexpected variant: {other:?}"),
            }
        }
    }

    #[test]
    fn test_boolean_toggles() {
        let t = tag("Boolean", None, None);
        assert_eq!(synth_value(&t, 0), Value::Bool(true));
        assert_eq!(synth_value(&t, 1), Value::Bool(false));
        assert_eq!(synth_value(&t, 2), Value::Bool(true));
    }

    #[test]
    fn test_string_cycles_allowed_values() {
        let mut t = tag("String", None, None);
        t.allowed_values = Some("Auto,Manual,Off".to_string());

        assert_eq!(synth_value(&t, 0), Value::Text("Auto".to_string()));
        assert_eq!(synth_value(&t, 1), Value::Text("Manual".to_string()));
        assert_eq!(synth_value(&t, 2), Value::Text("Off".to_string()));
        assert_eq!(synth_value(&t, 3), Value::Text("Auto".to_string()));
    }

    #[tokio::test]
    async fn test_session_emits_and_cancels() {
        let machine = Machine {
            id: 1,
            name: "sim-press".to_string(),
            opc_endpoint: "opc.tcp://sim:4840".to_string(),
            automate_type: "SIM".to_string(),
            is_active: true,
            tags: vec![tag("Float", Some(0.0), Some(1.0))],
        };
        let settings = MonitoringSettings {
            sampling_interval: Duration::from_millis(10),
            ..Default::default()
        };

        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let transport = SimulatorTransport::new();

        let session = tokio::spawn({
            let cancel = cancel.clone();
            async move { transport.run_session(machine, settings, tx, cancel).await }
        });

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no sample emitted")
            .expect("channel closed early");
        assert_eq!(first.node_id, "ns=2;s=Sim");
        assert!(first.quality.is_good());

        cancel.cancel();
        session.await.unwrap().unwrap();
    }
}
