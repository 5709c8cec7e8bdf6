use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How a bus peer renders its `tracing` output.
///
/// `json` is meant for log shippers; the other two are for a person watching
/// a terminal while a controller and agent talk to each other.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per event, with the connection span flattened in.
    #[default]
    Json,
    /// One line per event.
    Compact,
    /// Multi-line output with span context under each event.
    Pretty,
}

impl LogFormat {
    /// Whether the format emits machine-readable records.
    #[must_use]
    pub const fn is_structured(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Error returned when text names no known [`LogFormat`].
pub type LogFormatParseError = strum::ParseError;
