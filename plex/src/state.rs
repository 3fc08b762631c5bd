use storage::{Realm, RealmExt, StoreError};
use tracing::debug;
use uuid::Uuid;

const STATE_CLIENT_ID_KEY: &str = "clientID";

/// Stable identifier for this installation towards the media server:
/// recovered from state, or generated once and persisted.
pub(crate) fn get_client_id(state: &dyn Realm) -> Result<String, StoreError> {
    if let Some(client_id) = state.get::<String>(STATE_CLIENT_ID_KEY)? {
        debug!(target: "plex", client_id, "clientID recovered from state");
        return Ok(client_id);
    }
    let client_id = Uuid::new_v4().to_string();
    debug!(target: "plex", client_id, "new clientID generated");
    state.set(STATE_CLIENT_ID_KEY, &client_id)?;
    Ok(client_id)
}
