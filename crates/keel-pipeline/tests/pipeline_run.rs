//! Pipeline runs end to end: fake builder, static credentials, in-memory
//! cluster and release store.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::{Chart, ChartMetadata, EnvironmentConfig, ImageRef, Template, ValueTree};
use keel_pipeline::{
    ArtifactBuilder, BuildError, BuildRequest, JobStatus, Orchestrator, PipelineError, PipelineRun,
    PipelineSpec, RunFailure, RunStatus, Scope, ServiceSpec, StaticCredentialProvider, Trigger,
};
use keel_release::{ApplyConfig, MemoryCluster, ObjectKey, ReleaseManager};
use keel_state::ReleaseStore;

// ── Fake builder ────────────────────────────────────────────────────

#[derive(Default)]
struct FakeBuilder {
    delays: HashMap<String, Duration>,
    failures: HashSet<String>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    scopes: Mutex<Vec<(String, Vec<Scope>)>>,
}

impl FakeBuilder {
    fn slow(mut self, service: &str, delay: Duration) -> Self {
        self.delays.insert(service.to_string(), delay);
        self
    }

    fn failing(mut self, service: &str) -> Self {
        self.failures.insert(service.to_string());
        self
    }
}

#[async_trait]
impl ArtifactBuilder for FakeBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<ImageRef, BuildError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.scopes
            .lock()
            .unwrap()
            .push((request.service.name.clone(), request.credentials.scopes()));

        if let Some(delay) = self.delays.get(&request.service.name) {
            tokio::time::sleep(*delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failures.contains(&request.service.name) {
            return Err(BuildError::Failed {
                service: request.service.name.clone(),
                status: "exit status: 1".to_string(),
                output: "compile error".to_string(),
            });
        }
        Ok(request.image.clone())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

const WORKLOAD: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: NAME
spec:
  selector:
    matchLabels:
      app: NAME
  template:
    spec:
      containers:
        - name: NAME
          image: "{{ NAME.image.repository }}:{{ NAME.image.tag }}"
"#;

const DEFAULTS: &str = r#"
client:
  image:
    repository: example/client
    tag: latest
account:
  image:
    repository: example/account
    tag: latest
"#;

const SETTINGS: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  issuer: "{{ global.issuerUrl }}"
  environment: "{{ global.environment }}"
"#;

fn chart() -> Chart {
    Chart::new(
        ChartMetadata {
            name: "platform".to_string(),
            version: "0.3.0".to_string(),
            app_version: "1.0.0".to_string(),
            description: None,
        },
        ValueTree::from_yaml_str("values.yaml", DEFAULTS).unwrap(),
        vec![
            Template::new("templates/settings.yaml", SETTINGS),
            Template::new("templates/client.yaml", WORKLOAD.replace("NAME", "client")),
            Template::new("templates/account.yaml", WORKLOAD.replace("NAME", "account")),
        ],
    )
    .unwrap()
}

fn service(name: &str) -> ServiceSpec {
    ServiceSpec {
        name: name.to_string(),
        context: PathBuf::from(format!("services/{name}")),
        command: vec![],
        repository: format!("shop/{name}"),
        values_key: None,
    }
}

fn spec(branches: &[&str]) -> PipelineSpec {
    PipelineSpec {
        name: "platform".to_string(),
        release: "platform".to_string(),
        namespace: "shop".to_string(),
        chart: PathBuf::from("chart"),
        environment: None,
        branches: branches.iter().map(|b| b.to_string()).collect(),
        services: vec![service("client"), service("account")],
    }
}

fn environment() -> EnvironmentConfig {
    EnvironmentConfig {
        name: "staging".to_string(),
        registry: Some("registry.local".to_string()),
        cluster: Some("staging-eu-1".to_string()),
        issuer_url: Some("https://id.example.com/realms/staging".to_string()),
        values: None,
    }
}

fn all_scopes() -> StaticCredentialProvider {
    StaticCredentialProvider::new()
        .with(Scope::RegistryPush, "push")
        .with(Scope::RegistryPull, "pull")
        .with(Scope::ClusterWrite, "write")
}

struct Harness {
    orchestrator: Orchestrator,
    cluster: Arc<MemoryCluster>,
    releases: Arc<ReleaseManager>,
    builder: Arc<FakeBuilder>,
}

fn harness_with(
    builder: FakeBuilder,
    credentials: StaticCredentialProvider,
    spec: PipelineSpec,
    environment: EnvironmentConfig,
) -> Harness {
    let cluster = Arc::new(MemoryCluster::new());
    let releases = Arc::new(ReleaseManager::new(
        ReleaseStore::open_in_memory().unwrap(),
        cluster.clone(),
        ApplyConfig::default(),
    ));
    let builder = Arc::new(builder);
    let orchestrator = Orchestrator::new(
        spec,
        chart(),
        environment,
        builder.clone(),
        Arc::new(credentials),
        releases.clone(),
    );
    Harness {
        orchestrator,
        cluster,
        releases,
        builder,
    }
}

fn harness(builder: FakeBuilder) -> Harness {
    harness_with(builder, all_scopes(), spec(&["main"]), environment())
}

fn push() -> Trigger {
    Trigger::Event {
        ref_name: "refs/heads/main".to_string(),
        commit: "3f2a9c1d0e5b".to_string(),
    }
}

fn manual() -> Trigger {
    Trigger::Manual {
        actor: "ops".to_string(),
    }
}

fn position(run: &PipelineRun, job: &str, status: JobStatus) -> usize {
    run.events
        .iter()
        .position(|e| e.job == job && e.status == status)
        .unwrap_or_else(|| panic!("no {status} event for {job}"))
}

fn image_of(cluster: &MemoryCluster, name: &str) -> String {
    let object = cluster.object(&ObjectKey::new("shop", "Deployment", name)).unwrap();
    object["spec"]["template"]["spec"]["containers"][0]["image"]
        .as_str()
        .unwrap()
        .to_string()
}

// ── Happy path ──────────────────────────────────────────────────────

#[tokio::test]
async fn successful_run_deploys_built_images() {
    let h = harness(FakeBuilder::default());
    let run = h.orchestrator.run(push()).await.unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.revision, Some(1));
    assert_eq!(run.job("deploy").unwrap().status, JobStatus::Succeeded);
    assert_eq!(run.job("build-client").unwrap().image.as_ref().unwrap().tag, "3f2a9c1d");

    assert_eq!(image_of(&h.cluster, "client"), "registry.local/shop/client:3f2a9c1d");
    assert_eq!(image_of(&h.cluster, "account"), "registry.local/shop/account:3f2a9c1d");
    let settings = h
        .cluster
        .object(&ObjectKey::new("shop", "ConfigMap", "settings"))
        .unwrap();
    assert_eq!(settings["data"]["issuer"], "https://id.example.com/realms/staging");
    assert_eq!(settings["data"]["environment"], "staging");

    let release = h.releases.get("platform", None).unwrap();
    assert_eq!(release.revision(), 1);
}

#[tokio::test(start_paused = true)]
async fn builds_run_concurrently_and_deploy_waits_for_all() {
    let h = harness(
        FakeBuilder::default()
            .slow("client", Duration::from_secs(30))
            .slow("account", Duration::from_secs(5)),
    );
    let run = h.orchestrator.run(push()).await.unwrap();

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(h.builder.max_in_flight.load(Ordering::SeqCst), 2);

    let deploy_started = position(&run, "deploy", JobStatus::Running);
    assert!(position(&run, "build-client", JobStatus::Succeeded) < deploy_started);
    assert!(position(&run, "build-account", JobStatus::Succeeded) < deploy_started);
    // The faster build finishes first.
    assert!(
        position(&run, "build-account", JobStatus::Succeeded)
            < position(&run, "build-client", JobStatus::Succeeded)
    );
}

#[tokio::test]
async fn jobs_receive_only_their_scopes() {
    let h = harness(FakeBuilder::default());
    h.orchestrator.run(push()).await.unwrap();

    let scopes = h.builder.scopes.lock().unwrap().clone();
    assert_eq!(scopes.len(), 2);
    for (_, granted) in scopes {
        assert_eq!(granted, vec![Scope::RegistryPush]);
    }
}

#[tokio::test]
async fn manual_and_event_runs_behave_the_same() {
    let h = harness(FakeBuilder::default());
    let by_event = h.orchestrator.run(push()).await.unwrap();
    let by_hand = h.orchestrator.run(manual()).await.unwrap();

    assert_eq!(by_event.status, by_hand.status);
    let shape = |run: &PipelineRun| {
        run.jobs
            .iter()
            .map(|j| (j.id.clone(), j.kind.clone(), j.depends_on.clone(), j.status))
            .collect::<Vec<_>>()
    };
    assert_eq!(shape(&by_event), shape(&by_hand));
    assert_eq!(by_hand.revision, Some(2));
    assert!(image_of(&h.cluster, "client").contains(":run-"));
}

// ── Gate ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn failed_build_skips_deploy_after_siblings_finish() {
    let h = harness(
        FakeBuilder::default()
            .failing("account")
            .slow("client", Duration::from_secs(60)),
    );
    let run = h.orchestrator.run(push()).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(
        run.failure,
        Some(RunFailure::Build {
            services: vec!["account".to_string()]
        })
    );
    // The sibling was not aborted.
    assert_eq!(run.job("build-client").unwrap().status, JobStatus::Succeeded);
    assert_eq!(run.job("build-account").unwrap().error.as_deref().map(|e| e.contains("compile error")), Some(true));

    // Deploy never left queued while a build was running.
    let deploy_events: Vec<_> = run.events.iter().filter(|e| e.job == "deploy").map(|e| e.status).collect();
    assert_eq!(deploy_events, vec![JobStatus::Queued, JobStatus::Skipped]);
    assert!(position(&run, "build-client", JobStatus::Succeeded) < position(&run, "deploy", JobStatus::Skipped));

    assert!(h.cluster.keys().is_empty());
    assert!(h.releases.history("platform").is_err());
}

#[tokio::test]
async fn missing_deploy_credentials_abort_before_any_mutation() {
    let credentials = StaticCredentialProvider::new()
        .with(Scope::RegistryPush, "push")
        .with(Scope::RegistryPull, "pull");
    let h = harness_with(FakeBuilder::default(), credentials, spec(&[]), environment());
    let run = h.orchestrator.run(push()).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    assert!(matches!(run.failure, Some(RunFailure::Credential { .. })));
    assert_eq!(run.job("deploy").unwrap().status, JobStatus::Failed);
    assert!(h.cluster.keys().is_empty());
    assert!(h.releases.history("platform").is_err());
}

#[tokio::test]
async fn missing_build_credentials_fail_the_build() {
    let credentials = StaticCredentialProvider::new()
        .with(Scope::RegistryPull, "pull")
        .with(Scope::ClusterWrite, "write");
    let h = harness_with(FakeBuilder::default(), credentials, spec(&[]), environment());
    let run = h.orchestrator.run(manual()).await.unwrap();

    assert!(matches!(run.failure, Some(RunFailure::Build { ref services }) if services.len() == 2));
    assert_eq!(run.job("deploy").unwrap().status, JobStatus::Skipped);
    assert_eq!(h.builder.in_flight.load(Ordering::SeqCst), 0);
    assert!(h.builder.scopes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn apply_failure_is_reported_with_revision() {
    let h = harness(FakeBuilder::default());
    h.cluster.fail_on("Deployment", "account", "quota exceeded");
    let run = h.orchestrator.run(push()).await.unwrap();

    assert_eq!(run.status, RunStatus::Failed);
    match run.failure {
        Some(RunFailure::Apply { revision, ref message }) => {
            assert_eq!(revision, 1);
            assert!(message.contains("quota exceeded"));
        }
        ref other => panic!("unexpected failure: {other:?}"),
    }
    assert_eq!(run.job("deploy").unwrap().revision, Some(1));
}

// ── Runs that never start ───────────────────────────────────────────

#[tokio::test]
async fn events_on_other_branches_do_not_start_a_run() {
    let h = harness(FakeBuilder::default());
    let trigger = Trigger::Event {
        ref_name: "refs/heads/feature/login".to_string(),
        commit: "abc".to_string(),
    };
    let err = h.orchestrator.run(trigger).await.unwrap_err();
    assert!(matches!(err, PipelineError::NotTriggered { .. }));
    assert!(h.builder.scopes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn registry_is_required() {
    let env = EnvironmentConfig {
        registry: None,
        ..environment()
    };
    let h = harness_with(FakeBuilder::default(), all_scopes(), spec(&[]), env);
    let err = h.orchestrator.run(manual()).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoRegistry(_)));
}
