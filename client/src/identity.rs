//! Where the local player's id and profile come from

use rand::seq::SliceRandom;
use rand::Rng;
use shared::{
    find_avatar, Avatar, AVATARS, DEFAULT_DISPLAY_NAME, MAX_DISPLAY_NAME_LEN, MAX_PHOTO_URL_LEN,
    MAX_PLAYER_ID_LEN,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity has an empty user id")]
    EmptyId,
    #[error("unknown avatar {0}")]
    UnknownAvatar(String),
    #[error("{0} is longer than {1} bytes")]
    TooLong(&'static str, usize),
}

/// Who the local player is, as handed out once per session by an identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable and opaque; the primary key of the player's record.
    pub id: String,
    pub display_name: String,
    pub photo_url: Option<String>,
    /// Delegated credential for backends that need one. Never written to the presence store.
    pub access_token: Option<String>,
}

pub trait IdentitySource {
    fn authenticate(&mut self) -> Result<Identity, IdentityError>;
}

/// Identity taken straight from configuration.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    identity: Identity,
}

impl StaticIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        Self {
            identity: Identity {
                id: id.into(),
                display_name: if display_name.trim().is_empty() {
                    DEFAULT_DISPLAY_NAME.to_string()
                } else {
                    clip(display_name, MAX_DISPLAY_NAME_LEN)
                },
                photo_url: None,
                access_token: None,
            },
        }
    }

    /// A throwaway identity with a random id.
    pub fn guest<R: Rng>(rng: &mut R) -> Self {
        Self::new(format!("guest-{:08x}", rng.gen::<u32>()), DEFAULT_DISPLAY_NAME)
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !name.trim().is_empty() {
            self.identity.display_name = clip(name, MAX_DISPLAY_NAME_LEN);
        }
        self
    }

    pub fn with_photo_url(mut self, url: impl Into<String>) -> Self {
        self.identity.photo_url = Some(url.into());
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.identity.access_token = Some(token.into());
        self
    }
}

impl IdentitySource for StaticIdentity {
    fn authenticate(&mut self) -> Result<Identity, IdentityError> {
        if self.identity.id.trim().is_empty() {
            return Err(IdentityError::EmptyId);
        }
        if self.identity.id.len() > MAX_PLAYER_ID_LEN {
            return Err(IdentityError::TooLong("user id", MAX_PLAYER_ID_LEN));
        }
        if let Some(url) = &self.identity.photo_url {
            if url.len() > MAX_PHOTO_URL_LEN {
                return Err(IdentityError::TooLong("photo url", MAX_PHOTO_URL_LEN));
            }
        }
        Ok(self.identity.clone())
    }
}

/// Cuts `text` to at most `limit` bytes on a char boundary.
fn clip(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// The requested avatar if given, otherwise a random one from the catalog.
pub fn choose_avatar<R: Rng>(
    requested: Option<&str>,
    rng: &mut R,
) -> Result<&'static Avatar, IdentityError> {
    match requested {
        Some(id) => find_avatar(id).ok_or_else(|| IdentityError::UnknownAvatar(id.to_string())),
        None => Ok(AVATARS.choose(rng).unwrap_or(&AVATARS[0])),
    }
}
