//! End-to-end assignment flow tests against the in-memory store.

use stagepass_core::events::{CaptureSink, EngineEventType};
use stagepass_core::types::*;
use stagepass_core::EngineError;
use stagepass_experiments::{
    CreateExperimentRequest, ExperimentPatch, ExperimentService, VariantSpec,
};
use stagepass_store::{ExperimentStore, MemoryStore};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

struct Harness {
    service: Arc<ExperimentService>,
    store: Arc<MemoryStore>,
    events: Arc<CaptureSink>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let events = Arc::new(CaptureSink::new());
    let service = Arc::new(ExperimentService::new(
        store.clone() as Arc<dyn ExperimentStore>,
        events.clone(),
    ));
    Harness {
        service,
        store,
        events,
    }
}

fn request(weights: &[f64]) -> CreateExperimentRequest {
    CreateExperimentRequest {
        owner_id: Uuid::new_v4(),
        name: "Checkout CTA".into(),
        hypothesis: Some("A bolder CTA converts better".into()),
        experiment_type: ExperimentType::AbTest,
        variants: weights
            .iter()
            .enumerate()
            .map(|(i, &weight)| VariantSpec {
                name: if i == 0 {
                    "Control".into()
                } else {
                    format!("Variant {i}")
                },
                weight,
                is_control: i == 0,
                changes: Vec::new(),
            })
            .collect(),
        targeting: TargetingConfig::default(),
        traffic: TrafficConfig::default(),
        goals: vec![Goal {
            id: "purchase".into(),
            name: "Ticket purchase".into(),
            goal_type: GoalType::Conversion,
            event_name: Some("order_completed".into()),
            is_primary: true,
        }],
        schedule: None,
        settings: Some(ExperimentSettings {
            min_sample_size: 100,
            ..Default::default()
        }),
    }
}

async fn running_experiment(h: &Harness, weights: &[f64]) -> Experiment {
    let experiment = h
        .service
        .create_experiment(request(weights))
        .await
        .expect("create");
    h.service
        .start_experiment(experiment.id)
        .await
        .expect("start")
}

#[tokio::test]
async fn assignment_is_stable_across_calls_and_weight_edits() {
    let h = harness();
    let experiment = running_experiment(&h, &[50.0, 50.0]).await;

    let first = h
        .service
        .get_or_create_assignment(experiment.id, "visitor-42", None, None)
        .await
        .expect("first assignment");

    for _ in 0..5 {
        let repeat = h
            .service
            .get_or_create_assignment(experiment.id, "visitor-42", None, None)
            .await
            .expect("repeat assignment");
        assert_eq!(repeat.variant.id, first.variant.id);
        assert_eq!(repeat.assignment.id, first.assignment.id);
    }

    // Rebalance all traffic onto one variant; existing assignments must
    // not re-roll.
    let weights: HashMap<Uuid, f64> = experiment
        .variants
        .iter()
        .map(|v| (v.id, if v.is_control { 0.0 } else { 100.0 }))
        .collect();
    h.service
        .update_experiment(
            experiment.id,
            ExperimentPatch {
                variant_weights: Some(weights),
                ..Default::default()
            },
        )
        .await
        .expect("weight update");

    let after_edit = h
        .service
        .get_or_create_assignment(experiment.id, "visitor-42", None, None)
        .await
        .expect("assignment after weight edit");
    assert_eq!(after_edit.variant.id, first.variant.id);

    // A brand-new visitor follows the new weights: everything goes to the
    // non-control variant now.
    let fresh = h
        .service
        .get_or_create_assignment(experiment.id, "visitor-fresh", None, None)
        .await
        .expect("fresh assignment");
    assert!(!fresh.variant.is_control);
}

#[tokio::test(flavor = "multi_thread")]
async fn weight_partition_matches_declared_split() {
    let h = harness();
    let experiment = running_experiment(&h, &[30.0, 70.0]).await;
    let control_id = experiment.variants[0].id;

    let mut control_count = 0u64;
    for i in 0..100_000u32 {
        let outcome = h
            .service
            .get_or_create_assignment(experiment.id, &format!("visitor-{i}"), None, None)
            .await
            .expect("assignment");
        if outcome.variant.id == control_id {
            control_count += 1;
        }
    }

    let control_share = control_count as f64 / 100_000.0 * 100.0;
    assert!(
        (27.0..=33.0).contains(&control_share),
        "control share {control_share:.2}% outside 30% +/- 3pts"
    );
}

#[tokio::test]
async fn conversions_count_at_most_once_per_visitor() {
    let h = harness();
    let experiment = running_experiment(&h, &[50.0, 50.0]).await;

    let outcome = h
        .service
        .get_or_create_assignment(experiment.id, "visitor-7", None, None)
        .await
        .expect("assignment");

    h.service
        .record_conversion(experiment.id, "visitor-7", "purchase", Some(59.0), None)
        .await
        .expect("first conversion");
    let duplicate = h
        .service
        .record_conversion(experiment.id, "visitor-7", "purchase", Some(59.0), None)
        .await
        .expect("duplicate conversion is a no-op");
    assert!(duplicate.converted);

    let stored = h
        .store
        .get_experiment(experiment.id)
        .await
        .unwrap()
        .unwrap();
    let variant = stored.variant(outcome.variant.id).unwrap();
    assert_eq!(variant.metrics.conversions, 1);
    assert!((variant.metrics.revenue - 59.0).abs() < f64::EPSILON);
    assert_eq!(h.events.count_type(EngineEventType::ConversionRecorded), 1);

    // A conversion for a visitor who was never assigned is an error.
    let missing = h
        .service
        .record_conversion(experiment.id, "visitor-unknown", "purchase", None, None)
        .await;
    assert!(matches!(
        missing,
        Err(EngineError::AssignmentNotFound { .. })
    ));
}

#[tokio::test]
async fn traffic_gate_is_monotone_when_percentage_changes() {
    let h = harness();
    let mut req = request(&[50.0, 50.0]);
    req.traffic.percentage = 30.0;
    let experiment = h.service.create_experiment(req).await.expect("create");
    let experiment = h
        .service
        .start_experiment(experiment.id)
        .await
        .expect("start");

    let visitors: Vec<String> = (0..300).map(|i| format!("visitor-{i}")).collect();
    let mut assigned = std::collections::HashSet::new();
    for visitor in &visitors {
        match h
            .service
            .get_or_create_assignment(experiment.id, visitor, None, None)
            .await
        {
            Ok(_) => {
                assigned.insert(visitor.clone());
            }
            Err(EngineError::TrafficExcluded) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    let included_at_30 = assigned.clone();
    assert!(!included_at_30.is_empty());
    assert!(included_at_30.len() < visitors.len());

    // Raise the allocation; every visitor admitted at 30% stays in (their
    // assignment already exists) and some of the excluded tail joins.
    h.service
        .update_experiment(
            experiment.id,
            ExperimentPatch {
                traffic: Some(TrafficConfig {
                    percentage: 60.0,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .expect("raise traffic");

    for visitor in &visitors {
        match h
            .service
            .get_or_create_assignment(experiment.id, visitor, None, None)
            .await
        {
            Ok(_) => {
                assigned.insert(visitor.clone());
            }
            Err(EngineError::TrafficExcluded) => {
                assert!(
                    !included_at_30.contains(visitor),
                    "raising the gate must not evict {visitor}"
                );
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(assigned.len() > included_at_30.len());

    // Lower the allocation below the original; only previously-assigned
    // visitors may still resolve a variant.
    h.service
        .update_experiment(
            experiment.id,
            ExperimentPatch {
                traffic: Some(TrafficConfig {
                    percentage: 10.0,
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .expect("lower traffic");

    for visitor in &visitors {
        match h
            .service
            .get_or_create_assignment(experiment.id, visitor, None, None)
            .await
        {
            Ok(_) => assert!(
                assigned.contains(visitor),
                "lowering the gate must not admit {visitor}"
            ),
            Err(EngineError::TrafficExcluded) => {
                assert!(!assigned.contains(visitor));
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}

#[tokio::test]
async fn pausing_a_draft_fails_and_leaves_state_unchanged() {
    let h = harness();
    let experiment = h
        .service
        .create_experiment(request(&[50.0, 50.0]))
        .await
        .expect("create");

    let result = h.service.pause_experiment(experiment.id).await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition {
            from: ExperimentStatus::Draft,
            to: ExperimentStatus::Paused,
        })
    ));

    let stored = h
        .store
        .get_experiment(experiment.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, ExperimentStatus::Draft);
}

#[tokio::test]
async fn assignment_requires_a_running_experiment() {
    let h = harness();
    let draft = h
        .service
        .create_experiment(request(&[50.0, 50.0]))
        .await
        .expect("create");

    let result = h
        .service
        .get_or_create_assignment(draft.id, "visitor-1", None, None)
        .await;
    assert!(matches!(
        result,
        Err(EngineError::ExperimentUnavailable(_))
    ));

    let missing = h
        .service
        .get_or_create_assignment(Uuid::new_v4(), "visitor-1", None, None)
        .await;
    assert!(matches!(missing, Err(EngineError::ExperimentNotFound(_))));
}

#[tokio::test]
async fn targeting_rules_gate_first_assignment() {
    let h = harness();
    let mut req = request(&[50.0, 50.0]);
    req.targeting = TargetingConfig {
        enabled: true,
        rules: vec![TargetingRule {
            rule_type: "device".into(),
            operator: RuleOperator::Equals,
            value: serde_json::json!("mobile"),
            logic: RuleLogic::And,
        }],
    };
    let experiment = h.service.create_experiment(req).await.expect("create");
    h.service
        .start_experiment(experiment.id)
        .await
        .expect("start");

    let desktop: HashMap<String, String> =
        [("device".to_string(), "desktop".to_string())].into();
    let result = h
        .service
        .get_or_create_assignment(experiment.id, "visitor-1", None, Some(desktop))
        .await;
    assert!(matches!(result, Err(EngineError::NotTargeted)));

    let mobile: HashMap<String, String> = [("device".to_string(), "mobile".to_string())].into();
    let outcome = h
        .service
        .get_or_create_assignment(experiment.id, "visitor-1", None, Some(mobile.clone()))
        .await
        .expect("targeted visitor is assigned");
    assert_eq!(outcome.assignment.metadata, mobile);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_visits_create_one_assignment() {
    let h = harness();
    let experiment = running_experiment(&h, &[50.0, 50.0]).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = h.service.clone();
        let experiment_id = experiment.id;
        handles.push(tokio::spawn(async move {
            service
                .get_or_create_assignment(experiment_id, "visitor-racy", None, None)
                .await
                .expect("assignment")
        }));
    }

    let mut variant_ids = Vec::new();
    for handle in handles {
        variant_ids.push(handle.await.expect("join").variant.id);
    }
    variant_ids.dedup();
    assert_eq!(variant_ids.len(), 1, "every racer sees the same variant");
    assert_eq!(h.store.assignment_count(), 1);

    let stored = h
        .store
        .get_experiment(experiment.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.total_visitors(), 1, "the race counts one visitor");
    assert_eq!(h.events.count_type(EngineEventType::AssignmentCreated), 1);
}

#[tokio::test]
async fn completion_freezes_results_and_supports_forced_winner() {
    let h = harness();
    let experiment = running_experiment(&h, &[50.0, 50.0]).await;
    let forced_winner = experiment
        .variants
        .iter()
        .find(|v| !v.is_control)
        .unwrap()
        .id;

    for i in 0..20 {
        let visitor = format!("visitor-{i}");
        if h.service
            .get_or_create_assignment(experiment.id, &visitor, None, None)
            .await
            .is_ok()
        {
            let _ = h
                .service
                .record_conversion(experiment.id, &visitor, "purchase", None, None)
                .await;
        }
    }

    let completed = h
        .service
        .complete_experiment(experiment.id, Some(forced_winner))
        .await
        .expect("complete");
    let frozen = completed.results.expect("results frozen at completion");
    assert_eq!(frozen.winner, Some(forced_winner));

    // Recalculation on a completed experiment returns the frozen snapshot.
    let recalculated = h
        .service
        .calculate_results(experiment.id)
        .await
        .expect("calculate");
    assert_eq!(recalculated.calculated_at, frozen.calculated_at);
    assert_eq!(recalculated.winner, Some(forced_winner));

    // And the experiment no longer hands out variants.
    let result = h
        .service
        .get_or_create_assignment(experiment.id, "visitor-late", None, None)
        .await;
    assert!(matches!(
        result,
        Err(EngineError::ExperimentUnavailable(_))
    ));
}

#[tokio::test]
async fn stats_view_combines_counters_and_progress() {
    let h = harness();
    let experiment = running_experiment(&h, &[50.0, 50.0]).await;

    for i in 0..10 {
        let _ = h
            .service
            .get_or_create_assignment(experiment.id, &format!("visitor-{i}"), None, None)
            .await;
    }

    let stats = h
        .service
        .get_experiment_stats(experiment.id)
        .await
        .expect("stats");
    assert_eq!(stats.variant_stats.len(), 2);
    assert_eq!(stats.progress.total_visitors, 10);
    assert_eq!(stats.progress.required_sample_size, 100);
    assert!((stats.progress.percent_complete - 10.0).abs() < 1e-9);
}
