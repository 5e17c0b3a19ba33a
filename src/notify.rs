use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-fixer broadcast of schedule changes. The engine publishes every
/// committed event here after the write succeeds; delivery is
/// fire-and-forget and never blocks or fails a booking.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Start watching one fixer's schedule, creating its channel on
    /// first use.
    pub fn subscribe(&self, fixer_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(fixer_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Publish an event to whoever is watching `fixer_id`. A channel
    /// whose last watcher has gone is dropped here rather than leaking.
    pub fn send(&self, fixer_id: Ulid, event: &Event) {
        let delivered = match self.channels.get(&fixer_id) {
            Some(sender) => sender.send(event.clone()).is_ok(),
            None => return,
        };
        if !delivered {
            self.channels
                .remove_if(&fixer_id, |_, sender| sender.receiver_count() == 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WeeklyTemplate;

    fn template_event(fixer: Ulid) -> Event {
        Event::TemplateReplaced {
            fixer_id: fixer,
            template: WeeklyTemplate::closed(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let fixer = Ulid::new();
        let mut rx = hub.subscribe(fixer);

        let event = template_event(fixer);
        hub.send(fixer, &event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let fixer = Ulid::new();
        hub.send(fixer, &template_event(fixer));
    }

    #[tokio::test]
    async fn abandoned_channel_is_dropped() {
        let hub = NotifyHub::new();
        let fixer = Ulid::new();

        let rx = hub.subscribe(fixer);
        assert_eq!(hub.channels.len(), 1);
        drop(rx);

        hub.send(fixer, &template_event(fixer));
        assert!(hub.channels.is_empty());
    }
}
