use thiserror::Error;

/// Position of a single cell in the flat grid.
pub type CellIndex = u64;

/// The fixed index space `[0, size)` served by one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Domain {
    size: u64,
}

impl Domain {
    pub fn new(size: u64) -> Result<Self, DomainError> {
        if size == 0 {
            return Err(DomainError::EmptyDomain);
        }
        Ok(Self { size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn contains(&self, index: CellIndex) -> bool {
        index < self.size
    }

    /// Validates a signed index as received over the wire.
    pub fn check(&self, raw: i64) -> Result<CellIndex, DomainError> {
        u64::try_from(raw)
            .ok()
            .filter(|index| self.contains(*index))
            .ok_or(DomainError::IndexOutOfDomain {
                index: raw,
                size: self.size,
            })
    }
}

/// Errors raised while validating indices or grid configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("domain size must be greater than zero")]
    EmptyDomain,
    #[error("chunk size must be greater than zero")]
    EmptyChunk,
    #[error("index {index} outside domain [0, {size})")]
    IndexOutOfDomain { index: i64, size: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn rejects_empty_domain() {
        assert_eq!(Domain::new(0), Err(DomainError::EmptyDomain));
    }

    #[test_timeout::timeout]
    fn check_accepts_only_in_range_indices() {
        let domain = Domain::new(10).unwrap();
        assert_eq!(domain.check(0), Ok(0));
        assert_eq!(domain.check(9), Ok(9));
        assert!(domain.check(10).is_err());
        assert!(domain.check(-1).is_err());
        assert!(domain.check(i64::MIN).is_err());
    }
}
