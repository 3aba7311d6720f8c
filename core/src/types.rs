//! Shared primitive types and the small closed enums stored as TEXT columns.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// A stable, unique identifier for any scored entity (transaction, customer).
pub type EntityId = String;

/// The canonical case identifier.
pub type CaseId = String;

/// Escalation level. 0 = not escalated; rules target levels 1..N.
pub type Level = i64;

/// Optimistic-concurrency token on `sla_tracking` rows.
pub type Version = i64;

/// Wires an enum to its TEXT column representation: `as_str`, `Display`,
/// `FromStr`, and the rusqlite conversions, all from one variant table.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::EngineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(crate::error::EngineError::Configuration {
                        reason: format!("unknown {} value '{other}'", stringify!($name)),
                    }),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(self.as_str().into())
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// What kind of entity a snapshot describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Transaction,
    Customer,
}
text_enum!(EntityType { Transaction => "transaction", Customer => "customer" });

/// Risk rule category. Distinct matched categories are reported per assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Transaction,
    Kyc,
    Behavioral,
}
text_enum!(RuleCategory {
    Transaction => "transaction",
    Kyc => "kyc",
    Behavioral => "behavioral",
});

/// Pattern strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Structuring,
    HighRiskCorridor,
    TimePattern,
}
text_enum!(PatternCategory {
    Structuring => "structuring",
    HighRiskCorridor => "high_risk_corridor",
    TimePattern => "time_pattern",
});

/// Detection severity, scaled from how far a window exceeds its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}
text_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CasePriority {
    Low,
    Medium,
    High,
    Critical,
}
text_enum!(CasePriority {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// Case lifecycle states. `Closed` is terminal: no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    Open,
    UnderReview,
    Escalated,
    PendingInfo,
    Closed,
}
text_enum!(CaseState {
    Open => "open",
    UnderReview => "under_review",
    Escalated => "escalated",
    PendingInfo => "pending_info",
    Closed => "closed",
});

impl CaseState {
    /// Whether a transition out of `self` is accepted at all.
    /// `Closed` rejects everything; level checks happen in the coordinator.
    pub fn accepts_transitions(&self) -> bool {
        *self != CaseState::Closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Manual,
    Automatic,
}
text_enum!(TriggeredBy { Manual => "manual", Automatic => "automatic" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Read,
    Failed,
}
text_enum!(NotificationStatus {
    Pending => "pending",
    Read => "read",
    Failed => "failed",
});
