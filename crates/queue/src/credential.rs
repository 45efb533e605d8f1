use std::fmt;
use std::sync::{Arc, RwLock};

/// Shared, swappable access token.
///
/// Clones share the same cell; [`SasCredential::update`] is visible to every
/// clone on its next [`SasCredential::current`] call.
#[derive(Clone)]
pub struct SasCredential(Arc<RwLock<Arc<str>>>);

impl SasCredential {
    pub fn new(token: &str) -> Self {
        Self(Arc::new(RwLock::new(Arc::from(token))))
    }

    pub fn current(&self) -> Arc<str> {
        let guard = self.0.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn update(&self, token: &str) {
        let mut guard = self.0.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::from(token);
    }
}

impl fmt::Debug for SasCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SasCredential(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_is_seen_by_clones() {
        let cred = SasCredential::new("old");
        let clone = cred.clone();
        cred.update("new");
        assert_eq!(&*clone.current(), "new");
    }

    #[test]
    fn debug_is_redacted() {
        let cred = SasCredential::new("sig=secret");
        assert!(!format!("{cred:?}").contains("secret"));
    }
}
