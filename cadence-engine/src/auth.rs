//! Who the engine is acting for. The host application owns login; the
//! engine only asks whether a session exists right now.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub access_token: String,
}

pub trait AuthProvider {
    /// `None` means guest mode: mutations stay local and nothing is queued
    /// for upload.
    fn session(&self) -> Option<Session>;
}
