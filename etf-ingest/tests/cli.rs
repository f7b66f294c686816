use assert_cmd::Command;
use predicates::prelude::*;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{layer::Context, Layer, Registry};

const DEPLOY_VARS: [&str; 3] = ["ALPHA_VANTAGE_API_KEY", "GCS_BUCKET_NAME", "GCP_PROJECT_ID"];

/// The binary with a clean deployment environment and no `.env` side effects.
fn etf_ingest(workdir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("etf-ingest").expect("Binary exists");
    cmd.current_dir(workdir.path());
    for var in DEPLOY_VARS {
        cmd.env_remove(var);
    }
    cmd.env("GCLOUD_BIN", workdir.path().join("no-such-gcloud"));
    cmd
}

fn with_deploy_env(cmd: &mut Command) -> &mut Command {
    cmd.env("ALPHA_VANTAGE_API_KEY", "av-secret-key")
        .env("GCS_BUCKET_NAME", "etf-bucket")
        .env("GCP_PROJECT_ID", "etf-project")
}

#[test]
fn deploy_without_api_key_fails_before_running_gcloud() {
    let dir = TempDir::new().unwrap();
    let mut cmd = etf_ingest(&dir);
    cmd.arg("deploy")
        .env("GCS_BUCKET_NAME", "etf-bucket")
        .env("GCP_PROJECT_ID", "etf-project");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains(
            "ALPHA_VANTAGE_API_KEY environment variable is not set",
        ))
        .stdout(predicate::str::contains("Deployment complete").not());
}

#[test]
fn deploy_without_project_names_the_project_variable() {
    let dir = TempDir::new().unwrap();
    let mut cmd = etf_ingest(&dir);
    cmd.args(["deploy", "--scheduled"])
        .env("ALPHA_VANTAGE_API_KEY", "av-secret-key")
        .env("GCS_BUCKET_NAME", "etf-bucket");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("GCP_PROJECT_ID environment variable is not set"));
}

#[test]
fn dry_run_prints_masked_plan() {
    let dir = TempDir::new().unwrap();
    let mut cmd = etf_ingest(&dir);
    with_deploy_env(&mut cmd).args(["deploy", "--dry-run"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Deployment plan for etf_data_ingest:"))
        .stdout(predicate::str::contains("gcloud run deploy etf-data-ingest"))
        .stdout(predicate::str::contains("ALPHA_VANTAGE_API_KEY=***"))
        .stdout(predicate::str::contains("av-secret-key").not());
}

#[test]
fn scheduled_dry_run_shows_topic_and_scheduler_example() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("deploy.yaml");
    std::fs::write(&config, "topic: nightly-etf\nscheduler:\n  symbols: [IWM]\n").unwrap();

    let mut cmd = etf_ingest(&dir);
    with_deploy_env(&mut cmd)
        .args(["deploy", "--scheduled", "--dry-run", "--config"])
        .arg(&config);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("gcloud pubsub topics create nightly-etf"))
        .stdout(predicate::str::contains("--no-allow-unauthenticated"))
        .stdout(predicate::str::contains("Scheduler job (not created):"))
        .stdout(predicate::str::contains("IWM"));
}

#[test]
fn deploy_rejects_unknown_settings_keys() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("deploy.yaml");
    std::fs::write(&config, "regoin: us-east1\n").unwrap();

    let mut cmd = etf_ingest(&dir);
    with_deploy_env(&mut cmd).args(["deploy", "--config"]).arg(&config);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse config YAML"));
}

#[cfg(unix)]
mod fake_gcloud {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// Writes a `gcloud` stand-in that logs its arguments and answers `describe` with a URL.
    fn install(dir: &Path, deploy_exit: i32) -> (PathBuf, PathBuf) {
        let log = dir.join("gcloud.log");
        let script = dir.join("gcloud");
        let body = format!(
            "#!/bin/sh\n\
             echo \"$*\" >> '{log}'\n\
             case \"$*\" in\n\
             *'run services describe'*) echo 'https://etf-data-ingest-abc-uc.a.run.app' ;;\n\
             *'run deploy'*) echo 'ERROR: deploy rejected' >&2; exit {deploy_exit} ;;\n\
             esac\n",
            log = log.display(),
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    #[test]
    fn http_deploy_runs_gcloud_once_and_prints_url() {
        let dir = TempDir::new().unwrap();
        let (gcloud, log) = install(dir.path(), 0);

        let mut cmd = etf_ingest(&dir);
        with_deploy_env(&mut cmd)
            .env("GCLOUD_BIN", &gcloud)
            .arg("deploy");

        cmd.assert()
            .success()
            .stdout(predicate::str::contains("Deployment complete: etf_data_ingest"))
            .stdout(predicate::str::contains(
                "Function URL: https://etf-data-ingest-abc-uc.a.run.app",
            ))
            .stdout(predicate::str::contains("curl -X POST https://etf-data-ingest-abc-uc.a.run.app"));

        let calls = std::fs::read_to_string(log).unwrap();
        assert_eq!(calls.matches("run deploy").count(), 1, "{calls}");
        assert!(calls.contains("--allow-unauthenticated"));
        assert!(calls.contains("FUNCTION_TARGET=etf_data_ingest"));
    }

    #[test]
    fn renamed_http_function_still_serves_ingest() {
        let dir = TempDir::new().unwrap();
        let (gcloud, log) = install(dir.path(), 0);
        let config = dir.path().join("deploy.yaml");
        std::fs::write(&config, "http_function: etf_ingest_prod\n").unwrap();

        let mut cmd = etf_ingest(&dir);
        with_deploy_env(&mut cmd)
            .env("GCLOUD_BIN", &gcloud)
            .args(["deploy", "--config"])
            .arg(&config);

        cmd.assert()
            .success()
            .stdout(predicate::str::contains("Deployment complete: etf_ingest_prod"))
            .stdout(predicate::str::contains("Try it:"));

        let calls = std::fs::read_to_string(log).unwrap();
        assert!(calls.contains("run deploy etf-ingest-prod"), "{calls}");
        assert!(calls.contains("FUNCTION_TARGET=etf_data_ingest,"), "{calls}");
    }

    #[test]
    fn failed_deploy_propagates_gcloud_exit_status() {
        let dir = TempDir::new().unwrap();
        let (gcloud, log) = install(dir.path(), 3);

        let mut cmd = etf_ingest(&dir);
        with_deploy_env(&mut cmd)
            .env("GCLOUD_BIN", &gcloud)
            .arg("deploy");

        cmd.assert()
            .code(3)
            .stderr(predicate::str::contains("deploy rejected"))
            .stdout(predicate::str::contains("Deployment complete").not());

        let calls = std::fs::read_to_string(log).unwrap();
        assert!(!calls.contains("describe"), "{calls}");
    }
}

/// Collects the debug rendering of every emitted event.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        self.events.lock().unwrap().push(format!("{event:?}"));
    }
}

#[tokio::test]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use etf_ingest::cli::{run, Cli, Commands};

    // Fails on the missing settings file; the event is emitted first.
    let cli = Cli {
        command: Commands::Deploy {
            scheduled: false,
            config: Some(std::path::PathBuf::from("/nonexistent/deploy.yaml")),
            dry_run: true,
        },
    };
    let err = run(cli).await.unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
