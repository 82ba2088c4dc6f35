use shared::{domain::SessionSnapshot, protocol::ServerEvent};
use tokio::sync::broadcast;

/// Fan-out of committed snapshots to every subscriber.
#[derive(Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<ServerEvent>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, snapshot: &SessionSnapshot) -> usize {
        self.sender
            .send(ServerEvent::SessionChanged {
                snapshot: snapshot.clone(),
            })
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
