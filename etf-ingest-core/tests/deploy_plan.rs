use std::sync::{Arc, Mutex};

use etf_ingest_core::contract::{CommandOutput, CommandSpec, MockCommandRunner};
use etf_ingest_core::deploy::{
    deploy_from_env, execute, DeployEnv, DeployError, DeployPlan, DeploySettings, DeployTarget,
    StepOutcome, SERVICE_URL_PLACEHOLDER,
};
use serial_test::serial;

const VARS: [&str; 3] = ["ALPHA_VANTAGE_API_KEY", "GCS_BUCKET_NAME", "GCP_PROJECT_ID"];

fn set_all_env() {
    std::env::set_var("ALPHA_VANTAGE_API_KEY", "av-secret-key");
    std::env::set_var("GCS_BUCKET_NAME", "etf-bucket");
    std::env::set_var("GCP_PROJECT_ID", "demo-project");
}

fn env() -> DeployEnv {
    DeployEnv {
        api_key: "av-secret-key".into(),
        bucket_name: "etf-bucket".into(),
        project_id: "demo-project".into(),
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        status: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        status: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Runner that records every command and answers describe calls with a URL.
fn recording_runner(log: Arc<Mutex<Vec<CommandSpec>>>, topic_exists: bool) -> MockCommandRunner {
    let mut runner = MockCommandRunner::new();
    runner.expect_run().returning(move |command: &CommandSpec| {
        log.lock().unwrap().push(command.clone());
        let args: Vec<&str> = command.args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["pubsub", "topics", "create", ..] if topic_exists => Ok(failed(
                1,
                "ERROR: (gcloud.pubsub.topics.create) Failed to create topic [projects/demo-project/topics/etf-data-ingest-trigger]: Resource already exists in the project",
            )),
            ["run", "services", "describe", service, ..] => {
                Ok(ok(&format!("https://{service}-abc123-uc.a.run.app\n")))
            }
            _ => Ok(ok("")),
        }
    });
    runner
}

#[test]
#[serial]
fn each_missing_variable_aborts_before_any_command() {
    for missing in VARS {
        set_all_env();
        std::env::remove_var(missing);

        let mut runner = MockCommandRunner::new();
        runner.expect_run().never();

        let err = deploy_from_env(DeployTarget::Http, &DeploySettings::default(), &runner)
            .unwrap_err();
        assert!(matches!(err, DeployError::MissingEnv(name) if name == missing));
        assert_eq!(err.to_string(), format!("{missing} environment variable is not set"));
        assert_eq!(err.exit_code(), 1);
    }
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn http_deploy_issues_exactly_one_deployment() {
    set_all_env();
    let log = Arc::new(Mutex::new(Vec::new()));
    let runner = recording_runner(log.clone(), false);

    let report =
        deploy_from_env(DeployTarget::Http, &DeploySettings::default(), &runner).unwrap();

    let commands = log.lock().unwrap();
    let deploys: Vec<_> = commands
        .iter()
        .filter(|c| c.args.starts_with(&["run".to_string(), "deploy".to_string()]))
        .collect();
    assert_eq!(deploys.len(), 1);

    let deploy = deploys[0];
    assert_eq!(deploy.program, "gcloud");
    assert_eq!(deploy.args[2], "etf-data-ingest");
    for flag in ["--allow-unauthenticated", "--source", "--region", "--project"] {
        assert!(deploy.args.iter().any(|a| a == flag), "missing {flag}");
    }
    let env_vars = deploy
        .args
        .iter()
        .skip_while(|a| *a != "--set-env-vars")
        .nth(1)
        .unwrap();
    assert_eq!(
        env_vars,
        "FUNCTION_TARGET=etf_data_ingest,ALPHA_VANTAGE_API_KEY=av-secret-key,GCS_BUCKET_NAME=etf-bucket"
    );

    assert_eq!(
        report.url.as_deref(),
        Some("https://etf-data-ingest-abc123-uc.a.run.app")
    );
    assert!(report.usage_example().unwrap().contains("\"symbol\": \"QQQ\""));
    assert!(report.scheduler_example.is_none());
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
fn scheduled_deploy_tolerates_existing_topic() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let runner = recording_runner(log.clone(), true);
    let plan = DeployPlan::scheduled(&env(), &DeploySettings::default()).unwrap();
    assert_eq!(plan.deploy_invocations(), 1);

    let report = execute(&plan, &runner).unwrap();

    assert_eq!(report.steps[0].outcome, StepOutcome::AlreadyExists);
    assert!(report.steps[1..].iter().all(|s| s.outcome == StepOutcome::Done));
    let commands = log.lock().unwrap();
    assert_eq!(commands[0].args[..4], ["pubsub", "topics", "create", "etf-data-ingest-trigger"]);
    assert_eq!(commands[1].args[2], "etf-data-ingest-scheduled");
    assert!(commands[1].args.iter().any(|a| a == "--no-allow-unauthenticated"));
    assert!(report
        .scheduler_example
        .as_deref()
        .unwrap()
        .starts_with("gcloud scheduler jobs create pubsub etf-daily-ingest"));
}

#[test]
fn scheduled_deploy_can_create_subscription_and_job() {
    let mut settings = DeploySettings::default();
    settings.scheduler.create_job = true;
    settings.scheduler.service_account = Some("invoker@demo-project.iam.gserviceaccount.com".into());

    let log = Arc::new(Mutex::new(Vec::new()));
    let runner = recording_runner(log.clone(), false);
    let plan = DeployPlan::scheduled(&env(), &settings).unwrap();
    let report = execute(&plan, &runner).unwrap();

    assert!(report.scheduler_example.is_none());
    let commands = log.lock().unwrap();
    assert_eq!(commands.len(), 5);
    let subscription = &commands[3];
    assert_eq!(subscription.args[..3], ["pubsub", "subscriptions", "create"]);
    assert!(subscription
        .args
        .contains(&"https://etf-data-ingest-scheduled-abc123-uc.a.run.app".to_string()));
    assert!(!subscription.args.iter().any(|a| a.contains(SERVICE_URL_PLACEHOLDER)));
    let job = &commands[4];
    assert!(job.args.contains(&"0 9 * * 1-5".to_string()));
}

#[test]
fn failing_deployment_propagates_cli_status() {
    let mut runner = MockCommandRunner::new();
    runner
        .expect_run()
        .times(1)
        .returning(|_| Ok(failed(2, "ERROR: (gcloud.run.deploy) PERMISSION_DENIED: av-secret-key leaked?")));

    let plan = DeployPlan::http(&env(), &DeploySettings::default());
    let err = execute(&plan, &runner).unwrap_err();

    assert_eq!(err.exit_code(), 2);
    match err {
        DeployError::CommandFailed { status, stderr, .. } => {
            assert_eq!(status, Some(2));
            assert!(stderr.contains("PERMISSION_DENIED"));
            assert!(!stderr.contains("av-secret-key"));
        }
        other => panic!("expected CommandFailed, got {other:?}"),
    }
}

#[test]
fn already_exists_is_fatal_on_required_steps() {
    let mut runner = MockCommandRunner::new();
    runner
        .expect_run()
        .times(1)
        .returning(|_| Ok(failed(1, "Resource already exists")));

    let plan = DeployPlan::http(&env(), &DeploySettings::default());
    assert!(matches!(
        execute(&plan, &runner),
        Err(DeployError::CommandFailed { .. })
    ));
}

#[test]
fn launch_failure_is_reported() {
    let mut runner = MockCommandRunner::new();
    runner
        .expect_run()
        .times(1)
        .returning(|_| Err("No such file or directory (os error 2)".into()));

    let plan = DeployPlan::http(&env(), &DeploySettings::default());
    let err = execute(&plan, &runner).unwrap_err();
    assert!(err.to_string().starts_with("failed to launch `deploy etf_data_ingest`"));
}
