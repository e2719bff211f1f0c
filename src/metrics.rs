//! Prometheus text rendering of primary replication status.

use crate::replication::primary::PrimaryReplicationStatus;
use std::fmt::Write;

const METRIC_PREFIX: &str = "walrelay_replication";

/// Render a status snapshot in Prometheus text exposition format.
pub fn render_replication_metrics_prometheus(status: &PrimaryReplicationStatus) -> String {
  let mut text = PrometheusText::new(&[("identity", status.network_identity.as_str())]);

  text.gauge(
    "replica_count",
    "Replicas configured for this primary.",
    status.replica_count as u64,
  );
  text.gauge(
    "last_batch_id",
    "Most recently assigned record batch id (0 if none).",
    status.last_batch_id.unwrap_or(0),
  );
  text.gauge(
    "pending_batches",
    "Commit callback batches waiting for replica acknowledgement.",
    status.pending_batches as u64,
  );
  text.gauge(
    "pending_callbacks",
    "Commit callbacks waiting for replica acknowledgement.",
    status.pending_callbacks as u64,
  );
  text.gauge(
    "tracked_txns",
    "Transactions with partial replica applied tracking.",
    status.tracked_txns as u64,
  );
  text.gauge(
    "outstanding_acks",
    "Records batch deliveries not yet acknowledged by a replica.",
    status.outstanding_acks as u64,
  );
  text.gauge(
    "oldest_pending_age_ms",
    "Age of the batch blocking the head of the commit queue in milliseconds.",
    status
      .oldest_pending_age
      .map(|age| u64::try_from(age.as_millis()).unwrap_or(u64::MAX))
      .unwrap_or(0),
  );

  text.counter(
    "batches_sent_total",
    "Record batches shipped to the replica set.",
    status.batches_sent,
  );
  text.counter(
    "callbacks_invoked_total",
    "Commit callbacks released to clients.",
    status.callbacks_invoked,
  );
  text.counter(
    "applied_notifications_total",
    "Transaction applied notifications received from replicas.",
    status.applied_notifications,
  );
  text.counter(
    "send_failures_total",
    "Transport sends that failed.",
    status.send_failures,
  );

  text.finish()
}

/// Accumulates one metric family at a time, every sample carrying the same
/// label set.
struct PrometheusText {
  out: String,
  labels: String,
}

impl PrometheusText {
  fn new(labels: &[(&str, &str)]) -> Self {
    let labels = if labels.is_empty() {
      String::new()
    } else {
      let pairs = labels
        .iter()
        .map(|(key, value)| format!("{key}=\"{}\"", escape_label_value(value)))
        .collect::<Vec<_>>()
        .join(",");
      format!("{{{pairs}}}")
    };
    Self {
      out: String::new(),
      labels,
    }
  }

  fn gauge(&mut self, name: &str, help: &str, value: u64) {
    self.family(name, "gauge", help, value);
  }

  fn counter(&mut self, name: &str, help: &str, value: u64) {
    self.family(name, "counter", help, value);
  }

  fn family(&mut self, name: &str, kind: &str, help: &str, value: u64) {
    let metric = format!("{METRIC_PREFIX}_{name}");
    let _ = writeln!(self.out, "# HELP {metric} {help}");
    let _ = writeln!(self.out, "# TYPE {metric} {kind}");
    let _ = writeln!(self.out, "{metric}{} {value}", self.labels);
  }

  fn finish(self) -> String {
    self.out
  }
}

fn escape_label_value(value: &str) -> String {
  let mut escaped = String::with_capacity(value.len());
  for ch in value.chars() {
    match ch {
      '\\' => escaped.push_str("\\\\"),
      '"' => escaped.push_str("\\\""),
      '\n' => escaped.push_str("\\n"),
      other => escaped.push(other),
    }
  }
  escaped
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  fn sample_status() -> PrimaryReplicationStatus {
    PrimaryReplicationStatus {
      network_identity: "pri\"mary".to_string(),
      replica_count: 2,
      last_batch_id: Some(12),
      last_message_id: Some(40),
      pending_batches: 1,
      pending_callbacks: 3,
      tracked_txns: 2,
      outstanding_acks: 1,
      oldest_pending_age: Some(Duration::from_millis(250)),
      batches_sent: 12,
      callbacks_invoked: 30,
      applied_notifications: 55,
      send_failures: 0,
    }
  }

  #[test]
  fn renders_gauges_and_counters() {
    let text = render_replication_metrics_prometheus(&sample_status());
    assert!(text.contains("# TYPE walrelay_replication_pending_callbacks gauge"));
    assert!(text.contains("walrelay_replication_pending_callbacks{identity=\"pri\\\"mary\"} 3"));
    assert!(text.contains("# TYPE walrelay_replication_batches_sent_total counter"));
    assert!(text.contains("walrelay_replication_oldest_pending_age_ms{identity=\"pri\\\"mary\"} 250"));
    assert!(text.ends_with('\n'));
  }

  #[test]
  fn missing_values_render_as_zero() {
    let mut status = sample_status();
    status.last_batch_id = None;
    status.oldest_pending_age = None;
    let text = render_replication_metrics_prometheus(&status);
    assert!(text.contains("walrelay_replication_last_batch_id{identity=\"pri\\\"mary\"} 0"));
    assert!(text.contains("walrelay_replication_oldest_pending_age_ms{identity=\"pri\\\"mary\"} 0"));
  }

  #[test]
  fn every_sample_line_escapes_the_identity() {
    let mut status = sample_status();
    status.network_identity = "dc1\\node\nb".to_string();
    let text = render_replication_metrics_prometheus(&status);
    let samples: Vec<&str> = text.lines().filter(|line| !line.starts_with('#')).collect();
    assert_eq!(samples.len(), 11);
    assert!(samples
      .iter()
      .all(|line| line.contains("{identity=\"dc1\\\\node\\nb\"}")));
  }
}
