use super::coalesce::{Coalescer, deliver};
use super::types::{Event, UserEvent};
use crate::clock::LamportTime;

use std::collections::HashMap;
use tokio::sync::mpsc;

#[derive(Debug)]
struct LatestUserEvents {
    ltime: LamportTime,
    events: Vec<UserEvent>,
}

/// Keeps only the newest user events per event name.
///
/// Events that opted into coalescing and share a name replace each other by
/// Lamport time: an event with a newer time discards everything older, events
/// with the same time are all kept.
#[derive(Debug, Default)]
pub struct UserEventCoalescer {
    events: HashMap<String, LatestUserEvents>,
}

impl UserEventCoalescer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Coalescer for UserEventCoalescer {
    fn handle(&self, event: &Event) -> bool {
        matches!(event, Event::User(e) if e.coalesce)
    }

    fn coalesce(&mut self, event: Event) {
        let Event::User(event) = event else {
            return;
        };

        match self.events.get_mut(&event.name) {
            Some(latest) if latest.ltime > event.ltime => {}
            Some(latest) if latest.ltime == event.ltime => latest.events.push(event),
            _ => {
                self.events.insert(
                    event.name.clone(),
                    LatestUserEvents {
                        ltime: event.ltime,
                        events: vec![event],
                    },
                );
            }
        }
    }

    fn flush(&mut self, out: &mpsc::Sender<Event>) {
        for (_, latest) in self.events.drain() {
            for event in latest.events {
                deliver(out, Event::User(event));
            }
        }
    }
}
