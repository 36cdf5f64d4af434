// src/bridge.rs
// Relays channel closure notifications onto the client's error channel

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::CloseEvent;
use crate::errors::CloseError;

impl From<CloseEvent> for CloseError {
    fn from(event: CloseEvent) -> Self {
        if event.server {
            CloseError::Server {
                code: event.code,
                reason: event.reason,
            }
        } else {
            CloseError::Client {
                code: event.code,
                reason: event.reason,
            }
        }
    }
}

/// Start the relay for one channel. The task exits once the notification
/// source is closed, which happens when the channel itself closes.
pub(crate) fn spawn(
    mut notifications: UnboundedReceiver<CloseEvent>,
    errors: UnboundedSender<CloseError>,
    client_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = notifications.recv().await {
            let error = CloseError::from(event);
            warn!(client_id = %client_id, error = %error, "Channel closed");

            if errors.send(error).is_err() {
                debug!(client_id = %client_id, "Error receiver dropped, notification discarded");
            }
        }

        debug!(client_id = %client_id, "Close notifications ended, error bridge exiting");
    })
}
