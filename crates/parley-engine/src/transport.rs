use parley_core::ids::SessionId;

/// Outbound side of a connected client, as seen by the controller.
///
/// Both calls are non-blocking. A session that has gone away is reported as
/// not live; emitting to it returns `false` rather than failing.
pub trait Transport: Send + Sync {
    fn is_live(&self, session_id: &SessionId) -> bool;

    /// Queue one `response` message for the session. Returns whether it was queued.
    fn emit(&self, session_id: &SessionId, text: String) -> bool;
}
