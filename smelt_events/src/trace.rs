use std::fmt;

/// A globally-unique ID (UUIDv4) identifying one run. Required on every [`crate::Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(uuid::Uuid);

impl TraceId {
    pub fn new() -> Self {
        TraceId(uuid::Uuid::new_v4())
    }

    pub fn hash(&self) -> u64 {
        let bytes = self.0.as_bytes();
        u64::from_le_bytes(bytes[0..8].try_into().unwrap())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TraceId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(TraceId(uuid::Uuid::parse_str(s)?))
    }
}
