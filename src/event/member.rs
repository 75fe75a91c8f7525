use super::coalesce::{Coalescer, deliver};
use super::types::{Event, MemberEvent, MemberEventType};
use crate::membership::types::Member;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Collapses bursts of member events into one batch per event kind.
///
/// `last_emitted` remembers the last kind actually delivered for every member
/// name ever seen and is never pruned, so it grows with cluster churn. That
/// memory is the price of suppressing repeated announcements of an unchanged
/// state across windows.
#[derive(Debug, Default)]
pub struct MemberEventCoalescer {
    last_emitted: HashMap<String, MemberEventType>,
    pending: HashMap<String, (MemberEventType, Arc<Member>)>,
}

impl MemberEventCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_emitted(&self, name: &str) -> Option<MemberEventType> {
        self.last_emitted.get(name).copied()
    }
}

impl Coalescer for MemberEventCoalescer {
    fn handle(&self, event: &Event) -> bool {
        matches!(event, Event::Member(_))
    }

    fn coalesce(&mut self, event: Event) {
        let Event::Member(event) = event else {
            return;
        };

        for member in event.members {
            self.pending
                .insert(member.name.clone(), (event.kind, member));
        }
    }

    fn flush(&mut self, out: &mpsc::Sender<Event>) {
        let mut pending: Vec<_> = self.pending.drain().collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));

        let mut batches: BTreeMap<MemberEventType, Vec<Arc<Member>>> = BTreeMap::new();

        for (name, (kind, member)) in pending {
            if kind != MemberEventType::Update && self.last_emitted.get(&name) == Some(&kind) {
                tracing::trace!("Suppressing repeated {:?} for {}", kind, name);
                continue;
            }

            self.last_emitted.insert(name, kind);
            batches.entry(kind).or_default().push(member);
        }

        for (kind, members) in batches {
            tracing::debug!("Flushing {:?} event with {} members", kind, members.len());
            deliver(out, Event::Member(MemberEvent { kind, members }));
        }
    }
}
