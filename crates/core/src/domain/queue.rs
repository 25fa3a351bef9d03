// Queue Domain Model

/// Queue identifier
pub type QueueName = String;

/// Subscribe queue declaration, created once at startup
///
/// Defaults mirror a plain non-durable declaration: every flag off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: QueueName,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Remove any existing messages right after declaring (test setups)
    pub purge: bool,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            purge: false,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn auto_delete(mut self, auto_delete: bool) -> Self {
        self.auto_delete = auto_delete;
        self
    }

    pub fn purge(mut self, purge: bool) -> Self {
        self.purge = purge;
        self
    }

    pub fn validate(&self) -> super::error::Result<()> {
        if self.name.trim().is_empty() {
            return Err(super::DomainError::ValidationError(
                "queue name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_all_off() {
        let spec = QueueSpec::new("feed");
        assert_eq!(spec.name, "feed");
        assert!(!spec.durable && !spec.exclusive && !spec.auto_delete && !spec.purge);
    }

    #[test]
    fn test_builder_flags() {
        let spec = QueueSpec::new("feed").durable(true).purge(true);
        assert!(spec.durable);
        assert!(spec.purge);
        assert!(!spec.exclusive);
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(QueueSpec::new("  ").validate().is_err());
    }
}
