use super::session::ServerSession;

/// The starter of a session, or anyone they shared its secret with, may
/// control it. Either is enough on its own.
pub fn authorized(session: &ServerSession, caller_id: u64, supplied_secret: Option<&str>) -> bool {
    caller_id == session.owner_id
        || supplied_secret.is_some_and(|secret| session.secret.matches(secret))
}
