use crate::clock::LamportTime;
use crate::membership::types::Member;
use crate::query::query::Query;
use std::fmt;
use std::sync::Arc;

/// Every kind of event delivered to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    MemberJoin,
    MemberLeave,
    MemberFailed,
    MemberUpdate,
    MemberReap,
    User,
    Query,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::MemberJoin => "member-join",
            EventType::MemberLeave => "member-leave",
            EventType::MemberFailed => "member-failed",
            EventType::MemberUpdate => "member-update",
            EventType::MemberReap => "member-reap",
            EventType::User => "user",
            EventType::Query => "query",
        };
        f.write_str(name)
    }
}

/// The member subset of [`EventType`]. Ordered so batches flush in a stable order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemberEventType {
    Join,
    Leave,
    Failed,
    Update,
    Reap,
}

impl From<MemberEventType> for EventType {
    fn from(kind: MemberEventType) -> Self {
        match kind {
            MemberEventType::Join => EventType::MemberJoin,
            MemberEventType::Leave => EventType::MemberLeave,
            MemberEventType::Failed => EventType::MemberFailed,
            MemberEventType::Update => EventType::MemberUpdate,
            MemberEventType::Reap => EventType::MemberReap,
        }
    }
}

/// A batch of members that went through the same kind of change.
#[derive(Debug, Clone)]
pub struct MemberEvent {
    pub kind: MemberEventType,
    pub members: Vec<Arc<Member>>,
}

impl MemberEvent {
    pub fn new(kind: MemberEventType, members: Vec<Member>) -> Self {
        Self {
            kind,
            members: members.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn member_names(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.name.as_str()).collect()
    }
}

/// An application-defined event broadcast to the whole cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct UserEvent {
    pub ltime: LamportTime,
    pub name: String,
    pub payload: Vec<u8>,
    pub coalesce: bool,
}

#[derive(Debug, Clone)]
pub enum Event {
    Member(MemberEvent),
    User(UserEvent),
    Query(Query),
}

impl Event {
    pub fn event_type(&self) -> EventType {
        match self {
            Event::Member(e) => e.kind.into(),
            Event::User(_) => EventType::User,
            Event::Query(_) => EventType::Query,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Member(e) => write!(f, "{} {:?}", self.event_type(), e.member_names()),
            Event::User(e) => write!(f, "user-event: {}", e.name),
            Event::Query(q) => write!(f, "query: {}", q.name),
        }
    }
}
