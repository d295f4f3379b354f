// =============================================================================
// Matrixon Matrix NextServer - Gap Resolution Integration Tests
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   End-to-end runs of the missing state resolver against in-memory
//   federation, local graph and ingestion doubles.
//
// =============================================================================

use std::{sync::Arc, time::Duration};

use matrixon_gapfill::{
    common::MatrixonError,
    core::{GapResolutionConfig, InputKind, InputRoomEvent, PduEvent},
    rooms::test_utils::{
        FakeFederation, FakeLocalGraph, FakeServer, FakeVerifier, FederationCall,
        LatestWinsResolver, RecordingSink, TestRoom,
    },
    RoomMutexMap, Service,
};
use ruma::{owned_room_id, owned_server_name, owned_user_id, OwnedServerName};
use serde_json::json;
use test_log::test;
use tracing::info;

fn origin() -> OwnedServerName {
    owned_server_name!("remote.example.org")
}

/// History the remote has and we lack:
/// `join_rules <- topic <- unseen <- first <- second <- incoming`
struct Gap {
    room: TestRoom,
    topic: Arc<PduEvent>,
    unseen: Arc<PduEvent>,
    first: Arc<PduEvent>,
    second: Arc<PduEvent>,
    incoming: Arc<PduEvent>,
}

impl Gap {
    fn new() -> Self {
        let mut room = TestRoom::new(
            owned_room_id!("!gap:remote.example.org"),
            owned_user_id!("@alice:remote.example.org"),
        )
        .unwrap();
        let jr = Arc::clone(&room.join_rules);
        let topic = room
            .state(&[&jr], "m.room.topic", "", json!({ "topic": "gaps" }))
            .unwrap();
        let unseen = room.message(&[&topic], "unseen").unwrap();
        let first = room.message(&[&unseen], "first").unwrap();
        let second = room.message(&[&first], "second").unwrap();
        let incoming = room.message(&[&second], "incoming").unwrap();
        Self {
            room,
            topic,
            unseen,
            first,
            second,
            incoming,
        }
    }

    /// State after `unseen`
    fn state_at_unseen(&self) -> Vec<Arc<PduEvent>> {
        let mut state = self.room.initial_events();
        state.push(Arc::clone(&self.topic));
        state
    }

    /// A remote that backfills `first` and `second` only
    fn remote(&self) -> FakeServer {
        FakeServer::new()
            .with_missing_events([&self.second, &self.first])
            .with_events([&self.unseen, &self.topic, &self.first, &self.second])
            .with_state_at(
                &self.unseen.event_id,
                &self.state_at_unseen(),
                &[
                    Arc::clone(&self.room.create),
                    Arc::clone(&self.room.creator_join),
                    Arc::clone(&self.room.power_levels),
                ],
            )
    }

    /// A local graph holding the room's initial events with their state
    fn seeded_graph(&self) -> Arc<FakeLocalGraph> {
        let graph = Arc::new(FakeLocalGraph::new());
        let mut state: Vec<Arc<PduEvent>> = Vec::new();
        for event in self.room.initial_events() {
            graph.add_with_state(&event, state.clone());
            state.push(event);
        }
        graph.set_latest_events(
            &self.room.room_id,
            vec![self.room.join_rules.event_id.clone()],
        );
        graph
    }
}

fn service(
    federation: &Arc<FakeFederation>,
    graph: &Arc<FakeLocalGraph>,
    sink: &Arc<RecordingSink>,
    resolver: &Arc<LatestWinsResolver>,
    config: GapResolutionConfig,
) -> Service {
    service_with_verifier(federation, graph, sink, resolver, FakeVerifier::new(), config)
}

fn service_with_verifier(
    federation: &Arc<FakeFederation>,
    graph: &Arc<FakeLocalGraph>,
    sink: &Arc<RecordingSink>,
    resolver: &Arc<LatestWinsResolver>,
    verifier: FakeVerifier,
    config: GapResolutionConfig,
) -> Service {
    Service::new(
        federation.clone(),
        graph.clone(),
        Arc::new(verifier),
        sink.clone(),
        resolver.clone(),
        Arc::new(RoomMutexMap::new()),
        config,
    )
}

fn position(inputs: &[InputRoomEvent], event: &PduEvent) -> usize {
    inputs
        .iter()
        .position(|input| input.event.event_id == event.event_id)
        .unwrap()
}

#[test(tokio::test)]
async fn test_state_at_backward_extremity_via_state_ids() {
    let gap = Gap::new();
    let federation = Arc::new(FakeFederation::new().with_server(&origin(), gap.remote()));
    let graph = gap.seeded_graph();
    let sink = Arc::new(RecordingSink::applying_to(Arc::clone(&graph)));
    let resolver = Arc::new(LatestWinsResolver::new());
    let service = service(
        &federation,
        &graph,
        &sink,
        &resolver,
        GapResolutionConfig::default(),
    );

    let outcome = service
        .process_event_with_missing_state(&origin(), &[], Arc::clone(&gap.incoming))
        .await
        .unwrap();

    // The rolled-forward state covers the incoming event's prev event.
    assert!(outcome.resolved_state.is_none());
    assert!(outcome.rejected.is_empty());
    assert!(graph.has_snapshot(&gap.second.event_id));

    let calls = federation.calls();
    assert!(calls.contains(&FederationCall::StateIds(origin(), gap.unseen.event_id.clone())));
    assert!(calls.contains(&FederationCall::Event(origin(), gap.topic.event_id.clone())));
    assert_eq!(federation.full_state_fetches(), 0);
    assert_eq!(resolver.calls(), 1);

    let inputs = sink.inputs();
    let first = position(&inputs, &gap.first);
    let second = position(&inputs, &gap.second);
    assert!(first < second);
    assert_eq!(second, inputs.len() - 1);
    match &inputs[first].kind {
        InputKind::Old {
            state_event_ids: Some(ids),
        } => assert!(ids.contains(&gap.topic.event_id)),
        other => panic!("extremity injected as {other:?}"),
    }
    assert!(matches!(
        inputs[second].kind,
        InputKind::Old {
            state_event_ids: None
        }
    ));
    assert!(inputs[..first]
        .iter()
        .all(|input| input.kind == InputKind::Outlier));
    assert!(inputs.iter().all(|input| input.send_as_server.is_none()));
    info!("✅ Extremity state built from /state_ids");
}

#[test(tokio::test)]
async fn test_large_gap_falls_back_to_full_state() {
    let mut gap = Gap::new();
    let mut big_state = gap.state_at_unseen();
    let topic = Arc::clone(&gap.topic);
    for n in 0..10 {
        big_state.push(
            gap.room
                .state(&[&topic], "org.example.slot", &format!("k{n}"), json!({ "n": n }))
                .unwrap(),
        );
    }
    let auth_chain = vec![
        Arc::clone(&gap.room.create),
        Arc::clone(&gap.room.creator_join),
        Arc::clone(&gap.room.power_levels),
    ];
    let remote = gap
        .remote()
        .with_state_at(&gap.unseen.event_id, &big_state, &auth_chain);

    // Nothing is known locally: 15 of 18 listed IDs are missing.
    let federation = Arc::new(FakeFederation::new().with_server(&origin(), remote));
    let graph = Arc::new(FakeLocalGraph::new());
    let sink = Arc::new(RecordingSink::applying_to(Arc::clone(&graph)));
    let resolver = Arc::new(LatestWinsResolver::new());
    let service = service(
        &federation,
        &graph,
        &sink,
        &resolver,
        GapResolutionConfig::default(),
    );

    let outcome = service
        .process_event_with_missing_state(&origin(), &[], Arc::clone(&gap.incoming))
        .await
        .unwrap();

    assert!(outcome.resolved_state.is_none());
    assert_eq!(federation.full_state_fetches(), 1);
    // Only the extremity's predecessor itself goes through /event.
    assert_eq!(federation.event_fetches(), 1);
    assert!(federation
        .calls()
        .contains(&FederationCall::Event(origin(), gap.unseen.event_id.clone())));
    assert_eq!(resolver.input_sizes(), vec![15]);
}

#[test(tokio::test(start_paused = true))]
async fn test_event_fetches_stay_within_pool_width() {
    let mut gap = Gap::new();
    let topic = Arc::clone(&gap.topic);
    let mut state = gap.state_at_unseen();
    for n in 0..2 {
        state.push(
            gap.room
                .state(&[&topic], "org.example.slot", &format!("k{n}"), json!({ "n": n }))
                .unwrap(),
        );
    }
    let auth_chain = vec![Arc::clone(&gap.room.create)];
    let mut remote = gap
        .remote()
        .with_state_at(&gap.unseen.event_id, &state, &auth_chain);
    remote = remote.with_events(state.iter());

    // Three unknown of eight listed IDs: below the fallback threshold.
    let federation = Arc::new(
        FakeFederation::new()
            .with_server(&origin(), remote)
            .with_delay(&origin(), Duration::from_secs(1)),
    );
    let graph = gap.seeded_graph();
    let sink = Arc::new(RecordingSink::applying_to(Arc::clone(&graph)));
    let resolver = Arc::new(LatestWinsResolver::new());
    let config = GapResolutionConfig {
        concurrent_requests: 2,
        ..GapResolutionConfig::default()
    };
    let service = service(&federation, &graph, &sink, &resolver, config);

    service
        .process_event_with_missing_state(&origin(), &[], Arc::clone(&gap.incoming))
        .await
        .unwrap();

    assert_eq!(federation.full_state_fetches(), 0);
    assert_eq!(federation.max_concurrent_event_fetches(), 2);
    // Three state events through the pool, then the predecessor.
    assert_eq!(federation.event_fetches(), 4);
}

#[test(tokio::test)]
async fn test_state_event_failing_verification_is_left_out() {
    let gap = Gap::new();
    let federation = Arc::new(FakeFederation::new().with_server(&origin(), gap.remote()));
    let graph = gap.seeded_graph();
    let sink = Arc::new(RecordingSink::applying_to(Arc::clone(&graph)));
    let resolver = Arc::new(LatestWinsResolver::new());
    let service = service_with_verifier(
        &federation,
        &graph,
        &sink,
        &resolver,
        FakeVerifier::new().rejecting(&gap.topic.event_id),
        GapResolutionConfig::default(),
    );

    let outcome = service
        .process_event_with_missing_state(&origin(), &[], Arc::clone(&gap.incoming))
        .await
        .unwrap();

    assert!(outcome.resolved_state.is_none());
    assert!(outcome.rejected.is_empty());
    assert!(federation
        .calls()
        .contains(&FederationCall::Event(origin(), gap.topic.event_id.clone())));
    assert!(!sink.injected_ids().contains(&gap.topic.event_id));

    let inputs = sink.inputs();
    let first = position(&inputs, &gap.first);
    match &inputs[first].kind {
        InputKind::Old {
            state_event_ids: Some(ids),
        } => {
            assert!(!ids.contains(&gap.topic.event_id));
            assert!(ids.contains(&gap.room.join_rules.event_id));
        }
        other => panic!("extremity injected as {other:?}"),
    }
    info!("✅ Unverifiable state event discarded, resolution continued");
}

#[test(tokio::test)]
async fn test_rejected_extremity_does_not_abort() {
    let gap = Gap::new();
    let remote = gap.remote().with_state_at(
        &gap.second.event_id,
        &gap.state_at_unseen(),
        &[Arc::clone(&gap.room.create)],
    );
    let federation = Arc::new(FakeFederation::new().with_server(&origin(), remote));
    let graph = gap.seeded_graph();
    let sink = Arc::new(
        RecordingSink::applying_to(Arc::clone(&graph)).rejecting(&gap.first.event_id),
    );
    let resolver = Arc::new(LatestWinsResolver::new());
    let service = service(
        &federation,
        &graph,
        &sink,
        &resolver,
        GapResolutionConfig::default(),
    );

    let outcome = service
        .process_event_with_missing_state(&origin(), &[], Arc::clone(&gap.incoming))
        .await
        .unwrap();

    let rejected: Vec<_> = outcome.rejected.iter().map(|r| &r.event_id).collect();
    assert_eq!(rejected, vec![&gap.first.event_id]);

    // With the extremity rejected, the state before the incoming event is
    // computed and handed back.
    let state = outcome.resolved_state.unwrap();
    assert!(!state.has_duplicate_state_keys());
    assert!(state.state_event_ids().contains(&gap.topic.event_id));
    assert!(federation
        .calls()
        .contains(&FederationCall::StateIds(origin(), gap.second.event_id.clone())));
    info!("✅ Rejection recorded and resolution continued");
}

#[test(tokio::test)]
async fn test_fallback_server_used_when_origin_fails() {
    let gap = Gap::new();
    let backup = owned_server_name!("backup.example.org");
    let federation = Arc::new(
        FakeFederation::new()
            .with_server(&origin(), FakeServer::new().unavailable())
            .with_server(&backup, gap.remote()),
    );
    let graph = gap.seeded_graph();
    let sink = Arc::new(RecordingSink::applying_to(Arc::clone(&graph)));
    let resolver = Arc::new(LatestWinsResolver::new());
    let service = service(
        &federation,
        &graph,
        &sink,
        &resolver,
        GapResolutionConfig::default(),
    );

    let outcome = service
        .process_event_with_missing_state(&origin(), &[backup.clone()], Arc::clone(&gap.incoming))
        .await
        .unwrap();

    assert!(outcome.resolved_state.is_none());
    let calls = federation.calls();
    assert!(matches!(&calls[0], FederationCall::MissingEvents(server, _) if *server == origin()));
    assert!(matches!(&calls[1], FederationCall::MissingEvents(server, request)
        if *server == backup && request.limit == 20));
}

#[test(tokio::test)]
async fn test_state_ids_falls_over_to_next_server() {
    let gap = Gap::new();
    let backup = owned_server_name!("backup.example.org");
    // The origin can backfill but holds no state.
    let stateless = FakeServer::new()
        .with_missing_events([&gap.second, &gap.first])
        .with_events([&gap.unseen, &gap.topic]);
    let federation = Arc::new(
        FakeFederation::new()
            .with_server(&origin(), stateless.clone())
            .with_server(&backup, gap.remote()),
    );
    let graph = gap.seeded_graph();
    let sink = Arc::new(RecordingSink::applying_to(Arc::clone(&graph)));
    let resolver = Arc::new(LatestWinsResolver::new());
    let primary_service = service(
        &federation,
        &graph,
        &sink,
        &resolver,
        GapResolutionConfig::default(),
    );

    let outcome = primary_service
        .process_event_with_missing_state(&origin(), &[backup.clone()], Arc::clone(&gap.incoming))
        .await
        .unwrap();

    assert!(outcome.resolved_state.is_none());
    let calls = federation.calls();
    assert!(calls.contains(&FederationCall::StateIds(origin(), gap.unseen.event_id.clone())));
    assert!(calls.contains(&FederationCall::StateIds(backup.clone(), gap.unseen.event_id.clone())));

    // With nobody holding the state the last server's failure is reported.
    let federation = Arc::new(
        FakeFederation::new()
            .with_server(&origin(), stateless.clone())
            .with_server(&backup, stateless),
    );
    let graph = gap.seeded_graph();
    let sink = Arc::new(RecordingSink::applying_to(Arc::clone(&graph)));
    let fallback_service = service(
        &federation,
        &graph,
        &sink,
        &resolver,
        GapResolutionConfig::default(),
    );
    let err = fallback_service
        .process_event_with_missing_state(&origin(), &[backup.clone()], Arc::clone(&gap.incoming))
        .await
        .unwrap_err();

    assert!(matches!(err, MatrixonError::Federation { server, .. } if server == backup));
}
