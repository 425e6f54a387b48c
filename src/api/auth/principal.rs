//! The resolved identity attached to every request.

use crate::api::store::UserRecord;

/// Outcome of credential resolution. Anonymous is a first-class variant,
/// not a sentinel user compared by identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Principal {
    Anonymous,
    Authenticated(UserRecord),
}

impl Principal {
    #[must_use]
    pub const fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    /// The user behind this principal, if any.
    #[must_use]
    pub const fn user(&self) -> Option<&UserRecord> {
        match self {
            Self::Anonymous => None,
            Self::Authenticated(user) => Some(user),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_variant_checks() {
        assert!(Principal::Anonymous.is_anonymous());
        assert!(Principal::Anonymous.user().is_none());

        let user = UserRecord {
            id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            activated: true,
        };
        let principal = Principal::Authenticated(user.clone());
        assert!(!principal.is_anonymous());
        assert_eq!(principal.user(), Some(&user));
    }
}
