//! Membership Module Tests
//!
//! Validates the transport side of the cluster: member records, the gossip
//! wire format and the reference UDP service.
//!
//! ## Test Scopes
//! - **Data Structures**: Status mapping and serialization of wire protocol messages.
//! - **Conflict Resolution**: Incarnation precedence and the member events it produces.
//! - **Failure Detection**: Suspect, Dead and Reap transitions over time.
//! - **Service Logic**: Socket binding, message envelopes and probe round trips.

#[cfg(test)]
mod tests {
    use crate::event::types::{MemberEvent, MemberEventType};
    use crate::membership::service::MembershipService;
    use crate::membership::transport::{PingDelegate, Transport, TransportEvent};
    use crate::membership::types::{GossipMessage, Member, MemberStatus, NodeRecord, NodeState};
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;

    fn record(name: &str, port: u16, state: NodeState, incarnation: u64) -> NodeRecord {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let mut record = NodeRecord::new(Member::new(name, addr), incarnation);
        record.state = state;
        record
    }

    async fn service(name: &str) -> (Arc<MembershipService>, mpsc::Receiver<TransportEvent>) {
        MembershipService::new(
            name,
            "127.0.0.1:0".parse().unwrap(),
            vec![],
            HashMap::new(),
            None,
        )
        .await
        .expect("Failed to create service")
    }

    fn member_events(rx: &mut mpsc::Receiver<TransportEvent>) -> Vec<MemberEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::Member(e) = event {
                out.push(e);
            }
        }
        out
    }

    fn kinds(events: &[MemberEvent]) -> Vec<MemberEventType> {
        events.iter().map(|e| e.kind).collect()
    }

    // ============================================================
    // NODE RECORD TESTS
    // ============================================================

    #[test]
    fn test_record_status_mapping() {
        let alive = record("node-a", 5000, NodeState::Alive, 1);
        let suspect = record("node-a", 5000, NodeState::Suspect, 1);
        let dead = record("node-a", 5000, NodeState::Dead, 1);
        let left = record("node-a", 5000, NodeState::Left, 1);

        assert_eq!(alive.to_member().status, MemberStatus::Alive);
        // Suspicion is internal to the transport
        assert_eq!(suspect.to_member().status, MemberStatus::Alive);
        assert_eq!(dead.to_member().status, MemberStatus::Failed);
        assert_eq!(left.to_member().status, MemberStatus::Left);

        assert!(suspect.is_alive());
        assert!(!dead.is_alive());
    }

    #[test]
    fn test_record_serialization_skips_last_seen() {
        let node = record("node-a", 5000, NodeState::Alive, 42);

        let json = serde_json::to_string(&node).expect("Serialization failed");
        let restored: NodeRecord = serde_json::from_str(&json).expect("Deserialization failed");

        assert_eq!(restored.member, node.member);
        assert_eq!(restored.incarnation, 42);
        assert!(restored.last_seen.is_none());
    }

    // ============================================================
    // GOSSIP MESSAGE TESTS
    // ============================================================

    #[test]
    fn test_gossip_ack_serialization() {
        let msg = GossipMessage::Ack {
            seq: 7,
            node: record("responder", 5000, NodeState::Alive, 10),
            members: vec![
                record("node-1", 5001, NodeState::Alive, 1),
                record("node-2", 5002, NodeState::Suspect, 2),
            ],
            payload: vec![1, 2, 3],
        };

        let encoded = bincode::serialize(&msg).expect("Failed to serialize Ack");
        let decoded: GossipMessage =
            bincode::deserialize(&encoded).expect("Failed to deserialize Ack");

        if let GossipMessage::Ack {
            seq,
            node,
            members,
            payload,
        } = decoded
        {
            assert_eq!(seq, 7);
            assert_eq!(node.name(), "responder");
            assert_eq!(members.len(), 2);
            assert_eq!(members[1].state, NodeState::Suspect);
            assert_eq!(payload, vec![1, 2, 3]);
        } else {
            panic!("Wrong message type");
        }
    }

    // ============================================================
    // CONFLICT RESOLUTION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_new_member_emits_join() {
        let (service, mut rx) = service("node-a").await;

        service
            .merge_member(record("node-b", 5002, NodeState::Alive, 1))
            .await;

        let events = member_events(&mut rx);
        assert_eq!(kinds(&events), vec![MemberEventType::Join]);
        assert_eq!(events[0].member_names(), vec!["node-b"]);
        assert_eq!(service.num_members(), 2);
    }

    #[tokio::test]
    async fn test_stale_and_repeated_records_are_ignored() {
        let (service, mut rx) = service("node-a").await;
        service
            .merge_member(record("node-b", 5002, NodeState::Alive, 5))
            .await;
        member_events(&mut rx);

        service
            .merge_member(record("node-b", 5002, NodeState::Alive, 5))
            .await;
        service
            .merge_member(record("node-b", 5002, NodeState::Dead, 4))
            .await;

        assert!(member_events(&mut rx).is_empty());
        assert_eq!(service.members.get("node-b").unwrap().state, NodeState::Alive);
    }

    #[tokio::test]
    async fn test_dead_then_revived_member() {
        let (service, mut rx) = service("node-a").await;
        service
            .merge_member(record("node-b", 5002, NodeState::Alive, 1))
            .await;

        service
            .merge_member(record("node-b", 5002, NodeState::Dead, 1))
            .await;
        // Equal incarnation cannot bring a dead node back
        service
            .merge_member(record("node-b", 5002, NodeState::Alive, 1))
            .await;
        service
            .merge_member(record("node-b", 5002, NodeState::Alive, 2))
            .await;

        let events = member_events(&mut rx);
        assert_eq!(
            kinds(&events),
            vec![
                MemberEventType::Join,
                MemberEventType::Failed,
                MemberEventType::Join
            ]
        );
    }

    #[tokio::test]
    async fn test_tag_change_emits_update() {
        let (service, mut rx) = service("node-a").await;
        service
            .merge_member(record("node-b", 5002, NodeState::Alive, 1))
            .await;

        let mut retagged = record("node-b", 5002, NodeState::Alive, 2);
        retagged
            .member
            .tags
            .insert("role".to_string(), "db".to_string());
        service.merge_member(retagged).await;

        let events = member_events(&mut rx);
        assert_eq!(
            kinds(&events),
            vec![MemberEventType::Join, MemberEventType::Update]
        );
        assert_eq!(events[1].members[0].tags["role"], "db");
    }

    #[tokio::test]
    async fn test_leave_emits_once() {
        let (service, mut rx) = service("node-a").await;
        service
            .merge_member(record("node-b", 5002, NodeState::Alive, 3))
            .await;

        service.handle_leave("node-b".to_string(), 3);
        service.handle_leave("node-b".to_string(), 3);

        let events = member_events(&mut rx);
        assert_eq!(
            kinds(&events),
            vec![MemberEventType::Join, MemberEventType::Leave]
        );
        assert_eq!(service.num_members(), 1);
    }

    #[tokio::test]
    async fn test_suspicion_about_self_is_refuted() {
        let (service, _rx) = service("node-a").await;
        assert_eq!(service.incarnation(), 1);

        service.handle_suspect("node-a".to_string(), 1).await;

        assert_eq!(service.incarnation(), 2);
        let local = service.members.get("node-a").unwrap().clone();
        assert_eq!(local.state, NodeState::Alive);
        assert_eq!(local.incarnation, 2);
    }

    #[tokio::test]
    async fn test_refutation_saturates_incarnation() {
        let (service, _rx) = service("node-a").await;

        service.handle_suspect("node-a".to_string(), u64::MAX).await;
        assert_eq!(service.incarnation(), u64::MAX);

        service.leave().await;
        assert_eq!(service.incarnation(), u64::MAX);
        assert_eq!(service.members.get("node-a").unwrap().state, NodeState::Left);
    }

    #[tokio::test]
    async fn test_suspect_requires_current_incarnation() {
        let (service, _rx) = service("node-a").await;
        service
            .merge_member(record("node-b", 5002, NodeState::Alive, 4))
            .await;

        service.handle_suspect("node-b".to_string(), 3).await;
        assert_eq!(service.members.get("node-b").unwrap().state, NodeState::Alive);

        service.handle_suspect("node-b".to_string(), 4).await;
        assert_eq!(service.members.get("node-b").unwrap().state, NodeState::Suspect);
    }

    // ============================================================
    // FAILURE DETECTION TESTS
    // ============================================================

    #[tokio::test]
    async fn test_silent_member_is_suspected_failed_and_reaped() {
        let (service, mut rx) = service("node-a").await;
        service
            .merge_member(record("node-b", 5002, NodeState::Alive, 1))
            .await;
        member_events(&mut rx);
        let start = Instant::now();

        service.detect_failures(start + Duration::from_secs(6)).await;
        assert_eq!(service.members.get("node-b").unwrap().state, NodeState::Suspect);
        assert!(member_events(&mut rx).is_empty());

        service.detect_failures(start + Duration::from_secs(11)).await;
        assert_eq!(service.members.get("node-b").unwrap().state, NodeState::Dead);
        assert_eq!(kinds(&member_events(&mut rx)), vec![MemberEventType::Failed]);

        service.detect_failures(start + Duration::from_secs(31)).await;
        assert!(service.members.get("node-b").is_none());
        assert_eq!(kinds(&member_events(&mut rx)), vec![MemberEventType::Reap]);

        // The local node is never suspected
        assert!(service.members.get("node-a").is_some());
    }

    // ============================================================
    // MEMBERSHIP SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_membership_service_creation() {
        let mut tags = HashMap::new();
        tags.insert("role".to_string(), "web".to_string());

        let (service, _rx) = MembershipService::new(
            "node-a",
            "127.0.0.1:0".parse().unwrap(), // port 0 = random available
            vec![],
            tags,
            None,
        )
        .await
        .expect("Failed to create service");

        // Should have itself as a member
        assert_eq!(service.members.len(), 1);

        let local = service.local_member();
        assert_eq!(local.name, "node-a");
        assert_eq!(local.tags["role"], "web");
        // The bound port is advertised, not the requested 0
        assert_ne!(local.port, 0);
        assert_eq!(local.socket_addr(), service.local_addr().unwrap());
    }

    struct RecordingDelegate {
        payload: Vec<u8>,
        seen: Mutex<Vec<(String, Duration, Vec<u8>)>>,
    }

    impl PingDelegate for RecordingDelegate {
        fn ack_payload(&self) -> Vec<u8> {
            self.payload.clone()
        }

        fn notify_ping_complete(&self, peer: &Member, rtt: Duration, payload: &[u8]) {
            self.seen
                .lock()
                .unwrap()
                .push((peer.name.clone(), rtt, payload.to_vec()));
        }
    }

    #[tokio::test]
    async fn test_two_nodes_join_probe_and_exchange_messages() {
        let delegate_a = Arc::new(RecordingDelegate {
            payload: b"from-a".to_vec(),
            seen: Mutex::new(Vec::new()),
        });
        let delegate_b = Arc::new(RecordingDelegate {
            payload: b"from-b".to_vec(),
            seen: Mutex::new(Vec::new()),
        });

        let (a, _a_rx) = MembershipService::new(
            "node-a",
            "127.0.0.1:0".parse().unwrap(),
            vec![],
            HashMap::new(),
            Some(delegate_a.clone()),
        )
        .await
        .unwrap();
        a.clone().start().await;

        let (b, mut b_rx) = MembershipService::new(
            "node-b",
            "127.0.0.1:0".parse().unwrap(),
            vec![a.local_addr().unwrap()],
            HashMap::new(),
            Some(delegate_b.clone()),
        )
        .await
        .unwrap();
        b.clone().start().await;

        // Wait for both sides to see each other and for a probe to complete
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let joined = a.num_members() == 2 && b.num_members() == 2;
            let probed = !delegate_a.seen.lock().unwrap().is_empty();
            if joined && probed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(a.num_members(), 2);
        assert_eq!(b.num_members(), 2);

        {
            let seen = delegate_a.seen.lock().unwrap();
            let (peer, rtt, payload) = seen.first().expect("No probe completed");
            assert_eq!(peer, "node-b");
            assert!(*rtt < Duration::from_secs(1));
            assert_eq!(payload, b"from-b");
        }

        // Application messages arrive unwrapped on the other side
        a.send_to_address(b.local_addr().unwrap(), b"hello".to_vec())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match b_rx.recv().await {
                    Some(TransportEvent::Message { from, payload }) => break Some((from, payload)),
                    Some(TransportEvent::Member(_)) => continue,
                    None => break None,
                }
            }
        })
        .await
        .expect("Timed out waiting for message");

        let (from, payload) = received.expect("Channel closed");
        assert_eq!(from, a.local_addr().unwrap());
        assert_eq!(payload, b"hello");

        a.stop();
        b.stop();
    }
}
