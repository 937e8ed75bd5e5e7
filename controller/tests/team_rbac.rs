
use fake_rbac::FakeFleet;
use greenhouse_apis::{
    Cluster, ClusterAccessState, ClusterSpec, ClusterStatus, Team, TeamRole, TeamRoleBinding,
    TeamRoleBindingSpec, TeamRoleBindingStatus, TeamRoleSpec, TeamSpec, User,
};
use greenhouse_controller::teamrbac::propagation::{
    plan_clusters, propagate, ClusterAction, Propagation, PropagationOutcome,
};
use k8s_openapi::api::rbac::v1::PolicyRule;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use maplit::btreemap;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn cluster(name: &str, env: &str) -> Cluster {
    let mut cluster = Cluster::new(name, ClusterSpec::default());
    cluster.metadata.namespace = Some("org".to_owned());
    cluster.metadata.labels = Some(btreemap! {"env".to_owned() => env.to_owned()});
    cluster.status = Some(ClusterStatus {
        access_state: ClusterAccessState::Ready,
        ..Default::default()
    });
    cluster
}

fn binding() -> TeamRoleBinding {
    let mut binding = TeamRoleBinding::new(
        "ops-admin",
        TeamRoleBindingSpec {
            team_role_ref: "admin".to_owned(),
            team_ref: "ops".to_owned(),
            cluster_selector: Some(LabelSelector {
                match_labels: Some(btreemap! {"env".to_owned() => "prod".to_owned()}),
                ..Default::default()
            }),
            namespaces: vec!["default".to_owned(), "monitoring".to_owned()],
            ..Default::default()
        },
    );
    binding.metadata.namespace = Some("org".to_owned());
    binding
}

fn team_role() -> TeamRole {
    TeamRole::new(
        "admin",
        TeamRoleSpec {
            rules: vec![PolicyRule {
                api_groups: Some(vec!["".to_owned()]),
                resources: Some(vec!["pods".to_owned()]),
                verbs: vec!["get".to_owned(), "list".to_owned()],
                ..Default::default()
            }],
        },
    )
}

fn team(members: &[&str]) -> Team {
    Team::new(
        "ops",
        TeamSpec {
            mapped_idp_group: Some("ops-group".to_owned()),
            members: members
                .iter()
                .map(|id| User {
                    id: id.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        },
    )
}

async fn run(
    fleet: &FakeFleet,
    binding: &TeamRoleBinding,
    team: &Team,
    clusters: &[Cluster],
) -> anyhow::Result<PropagationOutcome> {
    let team_role = team_role();
    let plan = plan_clusters(binding, clusters, false)?;
    let propagation = Propagation {
        binding,
        team_role: &team_role,
        team,
    };
    Ok(propagate(fleet, &propagation, &plan, TIMEOUT).await)
}

fn record(binding: &mut TeamRoleBinding, outcome: &PropagationOutcome) {
    binding.status = Some(TeamRoleBindingStatus {
        propagation_status: outcome.status.clone(),
        ..Default::default()
    });
}

#[tokio::test]
async fn shrinking_target_set_deletes_only_on_removed_cluster() -> anyhow::Result<()> {
    let fleet = FakeFleet::with_clusters(&["a", "b"]);
    let mut trb = binding();
    let team = team(&["u1"]);

    let outcome = run(&fleet, &trb, &team, &[cluster("a", "prod"), cluster("b", "prod")]).await?;
    assert!(outcome.is_complete());
    let recorded: Vec<_> = outcome.status.iter().map(|s| s.cluster_name.as_str()).collect();
    assert_eq!(recorded, vec!["a", "b"]);
    assert!(fleet
        .cluster("b")
        .binding("default", "greenhouse:ops-admin")
        .is_some());
    record(&mut trb, &outcome);
    let writes_on_a = fleet.cluster("a").writes();

    let clusters = [cluster("a", "prod"), cluster("b", "dev")];
    assert_eq!(
        plan_clusters(&trb, &clusters, false)?,
        btreemap! {
            "a".to_owned() => ClusterAction::Apply,
            "b".to_owned() => ClusterAction::Retract,
        }
    );
    let outcome = run(&fleet, &trb, &team, &clusters).await?;

    assert!(outcome.is_complete());
    let recorded: Vec<_> = outcome.status.iter().map(|s| s.cluster_name.as_str()).collect();
    assert_eq!(recorded, vec!["a"]);
    assert_eq!(fleet.cluster("a").writes(), writes_on_a);
    let b = fleet.cluster("b");
    assert!(b.binding("default", "greenhouse:ops-admin").is_none());
    assert!(b.binding("monitoring", "greenhouse:ops-admin").is_none());
    assert!(b.role("default", "greenhouse:admin").is_some());
    Ok(())
}

#[tokio::test]
async fn unchanged_inputs_write_nothing() -> anyhow::Result<()> {
    let fleet = FakeFleet::with_clusters(&["a"]);
    let mut trb = binding();
    let team = team(&["u1", "u2"]);
    let clusters = [cluster("a", "prod")];

    let first = run(&fleet, &trb, &team, &clusters).await?;
    assert_eq!(
        fleet.cluster("a").writes(),
        vec![
            "apply role default/greenhouse:admin",
            "apply rolebinding default/greenhouse:ops-admin",
            "apply role monitoring/greenhouse:admin",
            "apply rolebinding monitoring/greenhouse:ops-admin",
        ]
    );
    record(&mut trb, &first);

    let second = run(&fleet, &trb, &team, &clusters).await?;
    assert_eq!(fleet.cluster("a").writes().len(), 4);
    assert_eq!(second.status, first.status);
    Ok(())
}

#[tokio::test]
async fn membership_change_rematerializes_bindings() -> anyhow::Result<()> {
    let fleet = FakeFleet::with_clusters(&["a"]);
    let mut trb = binding();
    let clusters = [cluster("a", "prod")];
    let outcome = run(&fleet, &trb, &team(&["u1"]), &clusters).await?;
    record(&mut trb, &outcome);

    run(&fleet, &trb, &team(&["u1", "u2"]), &clusters).await?;

    let target = fleet.cluster("a");
    let subjects: Vec<_> = target
        .binding("default", "greenhouse:ops-admin")
        .and_then(|binding| binding.subjects)
        .unwrap_or_default()
        .into_iter()
        .map(|subject| format!("{}:{}", subject.kind, subject.name))
        .collect();
    assert_eq!(subjects, vec!["Group:ops-group", "User:u1", "User:u2"]);
    assert_eq!(
        target.writes()[4..],
        [
            "apply rolebinding default/greenhouse:ops-admin",
            "apply rolebinding monitoring/greenhouse:ops-admin",
        ]
    );
    Ok(())
}

#[tokio::test]
async fn dropped_namespace_is_cleaned_up() -> anyhow::Result<()> {
    let fleet = FakeFleet::with_clusters(&["a"]);
    let mut trb = binding();
    let team = team(&["u1"]);
    let clusters = [cluster("a", "prod")];
    let outcome = run(&fleet, &trb, &team, &clusters).await?;
    record(&mut trb, &outcome);

    trb.spec.namespaces = vec!["default".to_owned()];
    let outcome = run(&fleet, &trb, &team, &clusters).await?;

    assert_eq!(outcome.status[0].namespaces, vec!["default"]);
    let target = fleet.cluster("a");
    assert!(target.binding("monitoring", "greenhouse:ops-admin").is_none());
    assert!(target.binding("default", "greenhouse:ops-admin").is_some());
    Ok(())
}

#[tokio::test]
async fn unreachable_cluster_keeps_its_record() -> anyhow::Result<()> {
    let fleet = FakeFleet::with_clusters(&["a"]);
    let trb = binding();
    let team = team(&["u1"]);

    let outcome = run(&fleet, &trb, &team, &[cluster("a", "prod"), cluster("c", "prod")]).await?;

    assert!(!outcome.is_complete());
    assert!(outcome.failures["c"].contains("unreachable"));
    let failed = outcome
        .status
        .iter()
        .find(|status| status.cluster_name == "c")
        .unwrap();
    assert!(!failed.condition.is_true());
    assert_eq!(failed.namespaces, vec!["default", "monitoring"]);
    Ok(())
}
