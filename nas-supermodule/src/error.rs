use std::fmt;

#[derive(Debug)]
pub enum NasError {
    AlphaSizeMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },
    EmptyCandidates {
        label: String,
    },
    InputArity {
        module: String,
        expected: usize,
        actual: usize,
    },
    InvalidArgument {
        operator: String,
        argument: String,
        reason: String,
    },
    InvalidValueChoice {
        reason: String,
    },
    LabelConflict {
        label: String,
        existing: Vec<String>,
        incoming: Vec<String>,
    },
    MissingArgument {
        operator: String,
        argument: String,
    },
    MissingSamplingPolicy {
        operator: String,
    },
    Tensor(candle_core::Error),
    UnresolvedChoice {
        module: String,
    },
    UnsupportedArgument {
        operator: String,
        argument: String,
    },
    UnsupportedReduction {
        reduction: String,
    },
    WeightedSamplingUnsupported {
        operator: String,
        argument: String,
    },
}

impl From<candle_core::Error> for NasError {
    fn from(err: candle_core::Error) -> Self {
        NasError::Tensor(err)
    }
}

impl fmt::Display for NasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NasError::AlphaSizeMismatch {
                label,
                expected,
                actual,
            } => write!(
                f,
                "Architecture parameter size of same label '{}' conflict. Expected: '{}', Actual: '{}'",
                label, expected, actual
            ),
            NasError::EmptyCandidates { label } => {
                write!(f, "Choice '{}' has no candidates", label)
            }
            NasError::InputArity {
                module,
                expected,
                actual,
            } => write!(
                f,
                "{} expects {} input tensor(s) but got {}",
                module, expected, actual
            ),
            NasError::InvalidArgument {
                operator,
                argument,
                reason,
            } => write!(
                f,
                "Invalid argument '{}' for {}: {}",
                argument, operator, reason
            ),
            NasError::InvalidValueChoice { reason } => {
                write!(f, "Invalid value choice: {}", reason)
            }
            NasError::LabelConflict {
                label,
                existing,
                incoming,
            } => write!(
                f,
                "Value choice conflict: same label '{}' with different candidates. Existing: {:?}, Incoming: {:?}",
                label, existing, incoming
            ),
            NasError::MissingArgument { operator, argument } => {
                write!(f, "{} is missing required argument '{}'", operator, argument)
            }
            NasError::MissingSamplingPolicy { operator } => write!(
                f,
                "No mixed-operation sampling policy is configured to mutate {}",
                operator
            ),
            NasError::Tensor(err) => write!(f, "Tensor error: {}", err),
            NasError::UnresolvedChoice { module } => write!(
                f,
                "{} still holds an unresolved choice and cannot be executed. Mutate it first",
                module
            ),
            NasError::UnsupportedArgument { operator, argument } => write!(
                f,
                "Unsupported value choice on argument '{}' of {}",
                argument, operator
            ),
            NasError::UnsupportedReduction { reduction } => write!(
                f,
                "Only input choice of sum/mean reduction is supported. Got: '{}'",
                reduction
            ),
            NasError::WeightedSamplingUnsupported { operator, argument } => write!(
                f,
                "Argument '{}' of {} does not support weighted sampling",
                argument, operator
            ),
        }
    }
}

impl std::error::Error for NasError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NasError::Tensor(err) => Some(err),
            _ => None,
        }
    }
}

pub type NasResult<T> = std::result::Result<T, NasError>;
