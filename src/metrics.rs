use crate::poller::PollerStatus;
use crate::stats::{Sensor, Snapshot};
use prometheus::core::Collector;
use prometheus::{opts, Counter, Encoder, Gauge, GaugeVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub tegrastats_usage_percent: GaugeVec,
    pub tegrastats_frequency_mhz: GaugeVec,
    pub tegrastats_mts_load_percent: GaugeVec,
    pub tegrastats_temperature_celsius: GaugeVec,
    pub tegrastats_power_milliwatts: GaugeVec,
    pub tegrastats_up: Gauge,
    pub tegrastats_snapshot_available: Gauge,
    pub tegrastats_last_publish_timestamp_seconds: Gauge,
    pub tegrastats_subprocess_starts_total: Gauge,
    pub tegrastats_lines_published_total: Gauge,
    pub tegrastats_parse_anomalies_total: Gauge,
    pub tegrastats_stream_errors_total: Gauge,
    pub tegrastats_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let tegrastats_usage_percent = GaugeVec::new(
            opts!(
                "tegrastats_usage_percent",
                "Engine utilization in percent (EMC, GR3D, VIC)"
            ),
            &["engine"],
        )?;
        let tegrastats_frequency_mhz = GaugeVec::new(
            opts!("tegrastats_frequency_mhz", "Engine clock frequency in MHz"),
            &["engine"],
        )?;
        let tegrastats_mts_load_percent = GaugeVec::new(
            opts!(
                "tegrastats_mts_load_percent",
                "MTS foreground/background load in percent"
            ),
            &["group"],
        )?;
        let tegrastats_temperature_celsius = GaugeVec::new(
            opts!(
                "tegrastats_temperature_celsius",
                "Temperature by sensor in Celsius"
            ),
            &["sensor"],
        )?;
        let tegrastats_power_milliwatts = GaugeVec::new(
            opts!(
                "tegrastats_power_milliwatts",
                "Power rail consumption in milliwatts, current or average"
            ),
            &["rail", "mode"],
        )?;
        let tegrastats_up = Gauge::with_opts(opts!(
            "tegrastats_up",
            "1 while the tegrastats subprocess is being read"
        ))?;
        let tegrastats_snapshot_available = Gauge::with_opts(opts!(
            "tegrastats_snapshot_available",
            "1 once a snapshot was published since the last start"
        ))?;
        let tegrastats_last_publish_timestamp_seconds = Gauge::with_opts(opts!(
            "tegrastats_last_publish_timestamp_seconds",
            "Unix timestamp of the last published snapshot"
        ))?;
        let tegrastats_subprocess_starts_total = Gauge::with_opts(opts!(
            "tegrastats_subprocess_starts_total",
            "Number of times tegrastats was launched"
        ))?;
        let tegrastats_lines_published_total = Gauge::with_opts(opts!(
            "tegrastats_lines_published_total",
            "Lines parsed into a published snapshot"
        ))?;
        let tegrastats_parse_anomalies_total = Gauge::with_opts(opts!(
            "tegrastats_parse_anomalies_total",
            "Lines skipped because no known field could be parsed"
        ))?;
        let tegrastats_stream_errors_total = Gauge::with_opts(opts!(
            "tegrastats_stream_errors_total",
            "Read errors that ended a tegrastats run"
        ))?;
        let tegrastats_scrape_count_total = Counter::with_opts(opts!(
            "tegrastats_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &tegrastats_usage_percent)?;
        register(&registry, &tegrastats_frequency_mhz)?;
        register(&registry, &tegrastats_mts_load_percent)?;
        register(&registry, &tegrastats_temperature_celsius)?;
        register(&registry, &tegrastats_power_milliwatts)?;
        register(&registry, &tegrastats_up)?;
        register(&registry, &tegrastats_snapshot_available)?;
        register(&registry, &tegrastats_last_publish_timestamp_seconds)?;
        register(&registry, &tegrastats_subprocess_starts_total)?;
        register(&registry, &tegrastats_lines_published_total)?;
        register(&registry, &tegrastats_parse_anomalies_total)?;
        register(&registry, &tegrastats_stream_errors_total)?;
        register(&registry, &tegrastats_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            tegrastats_usage_percent,
            tegrastats_frequency_mhz,
            tegrastats_mts_load_percent,
            tegrastats_temperature_celsius,
            tegrastats_power_milliwatts,
            tegrastats_up,
            tegrastats_snapshot_available,
            tegrastats_last_publish_timestamp_seconds,
            tegrastats_subprocess_starts_total,
            tegrastats_lines_published_total,
            tegrastats_parse_anomalies_total,
            tegrastats_stream_errors_total,
            tegrastats_scrape_count_total,
        }))
    }

    pub fn update(&self, snapshot: Option<&Snapshot>, status: &PollerStatus) {
        self.tegrastats_up.set(flag(status.running));
        self.tegrastats_snapshot_available
            .set(flag(snapshot.is_some()));
        self.tegrastats_subprocess_starts_total
            .set(status.starts as f64);
        self.tegrastats_lines_published_total
            .set(status.lines_published as f64);
        self.tegrastats_parse_anomalies_total
            .set(status.parse_anomalies as f64);
        self.tegrastats_stream_errors_total
            .set(status.stream_errors as f64);
        if let Some(at) = status.published_at {
            self.tegrastats_last_publish_timestamp_seconds
                .set(unix_seconds(at));
        }

        self.tegrastats_usage_percent.reset();
        self.tegrastats_frequency_mhz.reset();
        self.tegrastats_mts_load_percent.reset();
        self.tegrastats_temperature_celsius.reset();
        self.tegrastats_power_milliwatts.reset();

        let Some(snapshot) = snapshot else {
            return;
        };

        for (engine, usage) in snapshot.usages() {
            if let Some(v) = decimal(&usage.load) {
                self.tegrastats_usage_percent
                    .with_label_values(&[engine.label()])
                    .set(v);
            }
            if let Some(v) = usage.frequency.as_deref().and_then(decimal) {
                self.tegrastats_frequency_mhz
                    .with_label_values(&[engine.label()])
                    .set(v);
            }
        }

        for (sensor, value) in snapshot.scalars() {
            let Some(v) = decimal(value) else {
                continue;
            };
            match sensor {
                Sensor::Ape => self
                    .tegrastats_frequency_mhz
                    .with_label_values(&[sensor.label()])
                    .set(v),
                Sensor::MtsFg => self
                    .tegrastats_mts_load_percent
                    .with_label_values(&["fg"])
                    .set(v),
                Sensor::MtsBg => self
                    .tegrastats_mts_load_percent
                    .with_label_values(&["bg"])
                    .set(v),
                _ => self
                    .tegrastats_temperature_celsius
                    .with_label_values(&[sensor.label()])
                    .set(v),
            }
        }

        for (rail, power) in snapshot.rails() {
            if let Some(v) = decimal(&power.current) {
                self.tegrastats_power_milliwatts
                    .with_label_values(&[rail.label(), "current"])
                    .set(v);
            }
            if let Some(v) = decimal(&power.average) {
                self.tegrastats_power_milliwatts
                    .with_label_values(&[rail.label(), "avg"])
                    .set(v);
            }
        }
    }

    pub fn inc_scrape_count(&self) {
        self.tegrastats_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

fn decimal(text: &str) -> Option<f64> {
    text.parse().ok()
}

fn flag(on: bool) -> f64 {
    if on {
        1.0
    } else {
        0.0
    }
}

fn unix_seconds(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::parse;

    fn status() -> PollerStatus {
        PollerStatus {
            running: true,
            starts: 1,
            lines_published: 3,
            parse_anomalies: 1,
            stream_errors: 0,
            published_at: Some(UNIX_EPOCH + std::time::Duration::from_secs(42)),
        }
    }

    fn encoded(metrics: &Metrics) -> String {
        String::from_utf8(metrics.encode_metrics().expect("encode")).expect("utf8")
    }

    #[test]
    fn snapshot_fields_become_labelled_gauges() {
        let metrics = Metrics::new().expect("metrics init");
        let snapshot = parse("EMC_FREQ 7%@1600 APE 150 MTS fg 0% bg 1% thermal@38.5C VDD_IN 2930/3405");
        metrics.update(Some(&snapshot), &status());

        let text = encoded(&metrics);
        assert!(text.contains(r#"tegrastats_usage_percent{engine="EMC_FREQ"} 7"#));
        assert!(text.contains(r#"tegrastats_frequency_mhz{engine="EMC_FREQ"} 1600"#));
        assert!(text.contains(r#"tegrastats_frequency_mhz{engine="APE"} 150"#));
        assert!(text.contains(r#"tegrastats_mts_load_percent{group="bg"} 1"#));
        assert!(text.contains(r#"tegrastats_temperature_celsius{sensor="thermal"} 38.5"#));
        assert!(text.contains(r#"tegrastats_power_milliwatts{mode="avg",rail="VDD_IN"} 3405"#));
        assert!(text.contains("tegrastats_last_publish_timestamp_seconds 42"));
        assert!(text.contains("tegrastats_snapshot_available 1"));
    }

    #[test]
    fn missing_snapshot_clears_field_gauges() {
        let metrics = Metrics::new().expect("metrics init");
        metrics.update(Some(&parse("GPU@37C")), &status());
        metrics.update(None, &status());

        let text = encoded(&metrics);
        assert!(!text.contains(r#"sensor="GPU""#));
        assert!(text.contains("tegrastats_snapshot_available 0"));
        assert!(text.contains("tegrastats_parse_anomalies_total 1"));
    }
}
