//! Access to the signed-in user.

use async_trait::async_trait;
use std::sync::RwLock;

use listshare_common::{Error, Result, UserId};

/// Source of the current user identity.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The signed-in user, or `None` when signed out.
    async fn current_user(&self) -> Result<Option<UserId>>;
}

/// An auth provider whose user is set explicitly.
#[derive(Debug, Default)]
pub struct StaticAuth {
    user: RwLock<Option<UserId>>,
}

impl StaticAuth {
    /// Signed in as `user`.
    pub fn signed_in(user: UserId) -> Self {
        Self {
            user: RwLock::new(Some(user)),
        }
    }

    /// Nobody signed in.
    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Switch the current user.
    pub fn set_user(&self, user: Option<UserId>) -> Result<()> {
        let mut current = self
            .user
            .write()
            .map_err(|_| Error::Storage("Auth lock poisoned".to_string()))?;
        *current = user;
        Ok(())
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_user(&self) -> Result<Option<UserId>> {
        let user = self
            .user
            .read()
            .map_err(|_| Error::Storage("Auth lock poisoned".to_string()))?;
        Ok(user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sign_in_and_out() {
        let auth = StaticAuth::signed_out();
        assert_eq!(auth.current_user().await.unwrap(), None);

        let user = UserId::new("default-user").unwrap();
        auth.set_user(Some(user.clone())).unwrap();
        assert_eq!(auth.current_user().await.unwrap(), Some(user));

        auth.set_user(None).unwrap();
        assert_eq!(auth.current_user().await.unwrap(), None);
    }
}
