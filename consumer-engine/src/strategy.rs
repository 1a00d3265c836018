use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// What to do with a message or batch whose processing callback failed.
///
/// `NackExit`, `Nack` and `Ack` apply to single messages handled by a
/// [`Supervisor`](crate::supervisor::Supervisor). `Exit` and `Skip` apply to batches
/// handled by a [`GroupComponent`](crate::group::GroupComponent). Handing a component a
/// strategy it does not understand is rejected when the component is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailStrategy {
    /// Negative-ack the message, then end the consuming attempt with the processing error.
    NackExit,
    /// Negative-ack the message and keep consuming.
    Nack,
    /// Treat the failure as a success.
    Ack,
    /// Stop consuming without marking the batch, so it is redelivered.
    Exit,
    /// Mark the batch as processed anyway and keep consuming.
    Skip,
}

impl FailStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailStrategy::NackExit => "nack_exit",
            FailStrategy::Nack => "nack",
            FailStrategy::Ack => "ack",
            FailStrategy::Exit => "exit",
            FailStrategy::Skip => "skip",
        }
    }
}

impl fmt::Display for FailStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_ref() {
            "nack_exit" | "nackexit" => Ok(FailStrategy::NackExit),
            "nack" => Ok(FailStrategy::Nack),
            "ack" => Ok(FailStrategy::Ack),
            "exit" => Ok(FailStrategy::Exit),
            "skip" => Ok(FailStrategy::Skip),
            _ => Err(ConfigError::UnknownFailStrategy(s.to_string())),
        }
    }
}

/// A single-message strategy, resolved once when a supervisor is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MessageFailureAction {
    NackExit,
    Nack,
    Ack,
}

impl MessageFailureAction {
    pub(crate) fn resolve(strategy: FailStrategy) -> Result<Self, ConfigError> {
        match strategy {
            FailStrategy::NackExit => Ok(MessageFailureAction::NackExit),
            FailStrategy::Nack => Ok(MessageFailureAction::Nack),
            FailStrategy::Ack => Ok(MessageFailureAction::Ack),
            FailStrategy::Exit | FailStrategy::Skip => Err(ConfigError::UnsupportedFailStrategy {
                strategy,
                component: "message supervisor",
            }),
        }
    }
}

/// A batch strategy, resolved once when a group component is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchFailureAction {
    Exit,
    Skip,
}

impl BatchFailureAction {
    pub(crate) fn resolve(strategy: FailStrategy) -> Result<Self, ConfigError> {
        match strategy {
            FailStrategy::Exit => Ok(BatchFailureAction::Exit),
            FailStrategy::Skip => Ok(BatchFailureAction::Skip),
            FailStrategy::NackExit | FailStrategy::Nack | FailStrategy::Ack => {
                Err(ConfigError::UnsupportedFailStrategy {
                    strategy,
                    component: "batch group engine",
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("nack_exit" => FailStrategy::NackExit; "snake case")]
    #[test_case("NACK-EXIT" => FailStrategy::NackExit; "upper kebab case")]
    #[test_case("nack" => FailStrategy::Nack; "nack")]
    #[test_case(" ack " => FailStrategy::Ack; "padded ack")]
    #[test_case("Exit" => FailStrategy::Exit; "exit")]
    #[test_case("skip" => FailStrategy::Skip; "skip")]
    fn test_parse_fail_strategy(raw: &str) -> FailStrategy {
        raw.parse().unwrap()
    }

    #[test]
    fn test_unknown_strategy_is_a_config_error() {
        let err = "retry".parse::<FailStrategy>().unwrap_err();
        assert_eq!(err, ConfigError::UnknownFailStrategy("retry".to_string()));
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        for strategy in [
            FailStrategy::NackExit,
            FailStrategy::Nack,
            FailStrategy::Ack,
            FailStrategy::Exit,
            FailStrategy::Skip,
        ] {
            assert_eq!(strategy.to_string().parse::<FailStrategy>(), Ok(strategy));
        }
    }

    #[test]
    fn test_message_actions_reject_batch_strategies() {
        assert_eq!(
            MessageFailureAction::resolve(FailStrategy::Nack),
            Ok(MessageFailureAction::Nack)
        );
        assert!(matches!(
            MessageFailureAction::resolve(FailStrategy::Skip),
            Err(ConfigError::UnsupportedFailStrategy {
                strategy: FailStrategy::Skip,
                ..
            })
        ));
    }

    #[test]
    fn test_batch_actions_reject_message_strategies() {
        assert_eq!(
            BatchFailureAction::resolve(FailStrategy::Skip),
            Ok(BatchFailureAction::Skip)
        );
        assert!(BatchFailureAction::resolve(FailStrategy::NackExit).is_err());
        assert!(BatchFailureAction::resolve(FailStrategy::Ack).is_err());
    }
}
