use anyhow::anyhow;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Store failure; the surrounding transaction was rolled back.
    Database,
    /// Structural problem with the request. Nothing was written.
    InvalidInput,
    NotFound,
    /// The request is well formed but cannot be honoured in the current
    /// state, e.g. an undo without the snapshot it needs.
    Conflict,
    Unknown,
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn database(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Database,
            code: "database_error",
            public,
            source,
        }
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self::invalid_with_code("invalid_input", public, source)
    }

    pub fn invalid_with_code(
        code: &'static str,
        public: &'static str,
        source: anyhow::Error,
    ) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code,
            public,
            source,
        }
    }

    pub fn not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "not_found",
            public,
            source,
        }
    }

    pub fn conflict(code: &'static str, public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            code,
            public,
            source,
        }
    }

    pub fn inversion_unavailable(patches: usize) -> Self {
        Self::conflict(
            "diagram_inversion_unavailable",
            "Inverse is unavailable without matching pre-images",
            anyhow!("no inverse for a batch of {} patches", patches),
        )
    }

    /// Serializing a model to a JSON column failed. Only reachable with values
    /// serde_json refuses to encode, so it is reported as unknown.
    pub fn serialization(source: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::Unknown,
            code: "serialization_error",
            public: "Failed to serialize diagram data",
            source: anyhow!(source),
        }
    }
}

impl std::fmt::Display for LibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.public, self.code, self.source)
    }
}

impl std::error::Error for LibError {}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for LibError {
    fn from(value: sqlx::Error) -> Self {
        Self::database("Diagram store request failed", anyhow!(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_public_message_and_code() {
        let err = LibError::inversion_unavailable(3);
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(
            err.to_string(),
            "Inverse is unavailable without matching pre-images (diagram_inversion_unavailable): no inverse for a batch of 3 patches"
        );
    }

    #[test]
    fn invalid_uses_generic_code() {
        let err = LibError::invalid("Grid size must be a positive number", anyhow!("-1"));
        assert_eq!(err.code, "invalid_input");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }
}
