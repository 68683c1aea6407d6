//! Bearer-token authentication.

use std::collections::HashMap;

use taskboard_proto::ids::UserId;

use crate::config::UserToken;

/// Maps a presented token to a user.
pub trait Authenticator: Send + Sync {
    /// Returns the user the token belongs to, or `None` if it is not valid.
    fn authenticate(&self, token: &str) -> Option<UserId>;
}

/// Fixed token table loaded from configuration.
#[derive(Debug, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, UserId>,
}

impl StaticTokens {
    /// Builds a table from `(token, user)` pairs. Later duplicates win.
    pub fn new<I, T, U>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (T, U)>,
        T: Into<String>,
        U: Into<String>,
    {
        Self {
            tokens: pairs
                .into_iter()
                .map(|(token, user)| (token.into(), UserId::new(user)))
                .collect(),
        }
    }

    /// Builds a table from configured users.
    #[must_use]
    pub fn from_users(users: &[UserToken]) -> Self {
        Self::new(users.iter().map(|u| (u.token.clone(), u.id.clone())))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: &str) -> Option<UserId> {
        if token.is_empty() {
            return None;
        }
        self.tokens.get(token).cloned()
    }
}
