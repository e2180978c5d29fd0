use crate::db::DatabaseError;

/// Macro to generate enum with as_str + std::str::FromStr pattern.
/// Serde goes through the same strings, so the JSON and SQL forms always agree.
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

str_enum!(ExtractionStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl ExtractionStatus {
    /// Completed and failed end an extraction attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

str_enum!(ReviewStatus {
    Pending => "pending",
    Reviewed => "reviewed",
    Approved => "approved",
});

impl ReviewStatus {
    /// The only status a review may advance to from this one.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Reviewed),
            Self::Reviewed => Some(Self::Approved),
            Self::Approved => None,
        }
    }
}

str_enum!(ComplianceStatus {
    Compliant => "Compliant",
    NonCompliant => "Non-compliant",
    Partial => "Partial",
    RequiresClarification => "Requires Clarification",
});

impl ComplianceStatus {
    /// Lenient parse for provider output ("Non-Compliant", "non_compliant",
    /// "requires clarification" ...). Anything unrecognised needs a human.
    pub fn normalize(raw: &str) -> Self {
        let folded: String = raw
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphabetic())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match folded.as_str() {
            "compliant" => Self::Compliant,
            "noncompliant" | "notcompliant" => Self::NonCompliant,
            "partial" | "partiallycompliant" => Self::Partial,
            _ => Self::RequiresClarification,
        }
    }
}

str_enum!(RequirementStatus {
    InProgress => "in_progress",
    Completed => "completed",
});

str_enum!(Priority {
    High => "high",
    Medium => "medium",
    Low => "low",
});

str_enum!(JobKind {
    Extraction => "extraction",
    Analysis => "analysis",
});

str_enum!(JobStatus {
    Queued => "queued",
    Running => "running",
    Succeeded => "succeeded",
    Failed => "failed",
});

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn extraction_status_round_trips_through_str() {
        for status in [
            ExtractionStatus::Pending,
            ExtractionStatus::Processing,
            ExtractionStatus::Completed,
            ExtractionStatus::Failed,
        ] {
            assert_eq!(ExtractionStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_value_is_invalid_enum() {
        let err = ReviewStatus::from_str("rejected").unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidEnum { ref field, .. } if field == "ReviewStatus"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!ExtractionStatus::Pending.is_terminal());
        assert!(!ExtractionStatus::Processing.is_terminal());
        assert!(ExtractionStatus::Completed.is_terminal());
        assert!(ExtractionStatus::Failed.is_terminal());
    }

    #[test]
    fn review_advances_one_step_at_a_time() {
        assert_eq!(ReviewStatus::Pending.next(), Some(ReviewStatus::Reviewed));
        assert_eq!(ReviewStatus::Reviewed.next(), Some(ReviewStatus::Approved));
        assert_eq!(ReviewStatus::Approved.next(), None);
    }

    #[test]
    fn compliance_normalization_is_lenient() {
        assert_eq!(ComplianceStatus::normalize("Compliant"), ComplianceStatus::Compliant);
        assert_eq!(ComplianceStatus::normalize("Non-Compliant"), ComplianceStatus::NonCompliant);
        assert_eq!(ComplianceStatus::normalize("non_compliant"), ComplianceStatus::NonCompliant);
        assert_eq!(ComplianceStatus::normalize(" partial "), ComplianceStatus::Partial);
        assert_eq!(
            ComplianceStatus::normalize("Requires Clarification"),
            ComplianceStatus::RequiresClarification
        );
        assert_eq!(ComplianceStatus::normalize("maybe?"), ComplianceStatus::RequiresClarification);
    }

    #[test]
    fn serde_uses_storage_strings() {
        let json = serde_json::to_string(&ComplianceStatus::NonCompliant).unwrap();
        assert_eq!(json, "\"Non-compliant\"");
        let parsed: JobStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, JobStatus::Running);
        assert!(serde_json::from_str::<Priority>("\"urgent\"").is_err());
    }
}
