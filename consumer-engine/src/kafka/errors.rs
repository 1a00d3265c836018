use std::time::Duration;

use common_metrics::MetricsSink;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::metrics_consts::KAFKA_ERRORS;

/// What a receive loop should do with an error from librdkafka.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorClass {
    /// Keep polling after a short pause. `pause_unit` is scaled by the consecutive error count.
    Transient {
        level: &'static str,
        error: &'static str,
        pause_unit: Duration,
        max_units: u64,
    },
    /// Stop the loop and surface the error.
    Fatal { error: &'static str },
}

fn transient(
    level: &'static str,
    error: &'static str,
    pause_unit: Duration,
    max_units: u64,
) -> ErrorClass {
    ErrorClass::Transient {
        level,
        error,
        pause_unit,
        max_units,
    }
}

pub(crate) fn classify(err: &KafkaError) -> ErrorClass {
    match err {
        KafkaError::MessageConsumption(code) => match code {
            RDKafkaErrorCode::PartitionEOF => transient("info", "partition_eof", Duration::ZERO, 0),
            RDKafkaErrorCode::OperationTimedOut => {
                transient("info", "op_timed_out", Duration::ZERO, 0)
            }
            // auto.offset.reset repositions the partition together with the broker
            RDKafkaErrorCode::OffsetOutOfRange => {
                transient("info", "offset_out_of_range", Duration::from_millis(500), 1)
            }
            _ => transient("warn", "consumer", Duration::from_millis(100), 10),
        },
        KafkaError::MessageConsumptionFatal(_) => ErrorClass::Fatal { error: "consumer" },
        KafkaError::Global(code) => match code {
            RDKafkaErrorCode::AllBrokersDown => {
                transient("warn", "all_brokers_down", Duration::from_secs(1), 5)
            }
            RDKafkaErrorCode::BrokerTransportFailure => {
                transient("warn", "broker_transport", Duration::from_secs(1), 3)
            }
            RDKafkaErrorCode::Authentication => ErrorClass::Fatal {
                error: "authentication",
            },
            _ => transient("warn", "global", Duration::from_millis(500), 6),
        },
        KafkaError::Canceled => ErrorClass::Fatal { error: "canceled" },
        _ => transient("warn", "unexpected", Duration::from_millis(100), 10),
    }
}

/// Count and log `err`, pausing for transient errors. Returns the error back when the
/// receive loop should stop.
pub(crate) async fn handle_kafka_error(
    err: KafkaError,
    consecutive: u64,
    metrics: &dyn MetricsSink,
) -> Option<KafkaError> {
    match classify(&err) {
        ErrorClass::Transient {
            level,
            error,
            pause_unit,
            max_units,
        } => {
            let labels = [
                ("level".to_string(), level.to_string()),
                ("error".to_string(), error.to_string()),
            ];
            metrics.increment(KAFKA_ERRORS, &labels, 1);
            if level == "info" {
                info!(error = %err, kind = error, "kafka consumer notice");
            } else {
                warn!(error = %err, kind = error, consecutive, "kafka consumer error");
            }

            let units = u32::try_from(consecutive.min(max_units)).unwrap_or(u32::MAX);
            let pause = pause_unit * units;
            if !pause.is_zero() {
                sleep(pause).await;
            }
            None
        }
        ErrorClass::Fatal { error: kind } => {
            let labels = [
                ("level".to_string(), "fatal".to_string()),
                ("error".to_string(), kind.to_string()),
            ];
            metrics.increment(KAFKA_ERRORS, &labels, 1);
            error!(error = %err, kind, "fatal kafka consumer error");
            Some(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_metrics::CapturingMetrics;

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify(&KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF)),
            ErrorClass::Transient { level: "info", .. }
        ));
        assert!(matches!(
            classify(&KafkaError::Global(RDKafkaErrorCode::AllBrokersDown)),
            ErrorClass::Transient {
                error: "all_brokers_down",
                ..
            }
        ));
        assert_eq!(
            classify(&KafkaError::Global(RDKafkaErrorCode::Authentication)),
            ErrorClass::Fatal {
                error: "authentication"
            }
        );
        assert_eq!(
            classify(&KafkaError::MessageConsumptionFatal(
                RDKafkaErrorCode::Fatal
            )),
            ErrorClass::Fatal { error: "consumer" }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_pause_and_continue() {
        let metrics = CapturingMetrics::new();
        let started = tokio::time::Instant::now();

        let outcome = handle_kafka_error(
            KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure),
            10,
            &metrics,
        )
        .await;

        assert!(outcome.is_none());
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(
            metrics.counter(KAFKA_ERRORS, &[("level", "warn"), ("error", "broker_transport")]),
            1
        );
    }

    #[tokio::test]
    async fn test_fatal_errors_are_returned() {
        let metrics = CapturingMetrics::new();
        let outcome = handle_kafka_error(KafkaError::Canceled, 1, &metrics).await;

        assert!(matches!(outcome, Some(KafkaError::Canceled)));
        assert_eq!(metrics.counter_total(KAFKA_ERRORS), 1);
    }
}
