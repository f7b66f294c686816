//! Deployment planning and execution for the two ingestion functions.
//!
//! A deployment is a short, strictly sequential list of `gcloud` invocations:
//!
//! - `etf_data_ingest`: deploy the service (public), then read back its URL.
//! - `etf_data_ingest_scheduled`: create the trigger topic, deploy the service (private),
//!   read back its URL, and optionally wire a push subscription and a Cloud Scheduler job.
//!
//! The entry point is selected at runtime through `FUNCTION_TARGET`, the same variable the
//! Functions Framework uses, so both services run the same image.
//!
//! Required environment is validated by [`DeployEnv::from_env`] before a plan exists, which
//! guarantees no command runs with missing configuration. Failures of required steps abort
//! with the CLI's own exit status and stderr; only "already exists" is tolerated, and only
//! on steps that create shared resources.

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{optional_env, API_KEY_ENV, BUCKET_ENV, PROJECT_ENV};
use crate::contract::{CommandOutput, CommandRunner, CommandSpec, RunError};
use crate::request::ScheduledRequest;

pub const HTTP_FUNCTION: &str = "etf_data_ingest";
pub const SCHEDULED_FUNCTION: &str = "etf_data_ingest_scheduled";
pub const FUNCTION_TARGET_ENV: &str = "FUNCTION_TARGET";
pub const GCLOUD: &str = "gcloud";

/// Replaced by the URL captured from the describe step.
pub const SERVICE_URL_PLACEHOLDER: &str = "{service_url}";

const MASK: &str = "***";

/// Secrets shorter than this are only masked where they appear as `NAME=value`.
const MIN_BARE_MASK_LEN: usize = 8;

/// Ack deadline, in seconds, of the push subscription; covers a full scheduled batch.
pub const PUSH_ACK_DEADLINE_SECS: u32 = 600;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("{0} environment variable is not set")]
    MissingEnv(&'static str),
    #[error("failed to launch `{step}`: {source}")]
    Launch {
        step: String,
        #[source]
        source: RunError,
    },
    #[error("`{step}` failed with exit status {}: {stderr}", status_text(.status))]
    CommandFailed {
        step: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("`{0}` needs the service URL, but no URL was captured")]
    MissingServiceUrl(String),
    #[error("failed to encode scheduler message: {0}")]
    Message(#[from] serde_json::Error),
}

fn status_text(status: &Option<i32>) -> String {
    status.map_or_else(|| "unknown".to_string(), |code| code.to_string())
}

impl DeployError {
    /// Exit status to report for this error: the CLI's own status when it has one.
    pub fn exit_code(&self) -> i32 {
        match self {
            DeployError::CommandFailed {
                status: Some(code), ..
            } if *code != 0 => *code,
            _ => 1,
        }
    }
}

/// Variables every deployment needs.
#[derive(Clone)]
pub struct DeployEnv {
    pub api_key: String,
    pub bucket_name: String,
    pub project_id: String,
}

impl std::fmt::Debug for DeployEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployEnv")
            .field("api_key", &MASK)
            .field("bucket_name", &self.bucket_name)
            .field("project_id", &self.project_id)
            .finish()
    }
}

impl DeployEnv {
    /// Checks `ALPHA_VANTAGE_API_KEY`, `GCS_BUCKET_NAME` and `GCP_PROJECT_ID` in that order.
    pub fn from_env() -> Result<Self, DeployError> {
        let get = |name: &'static str| optional_env(name).ok_or(DeployError::MissingEnv(name));
        let api_key = get(API_KEY_ENV)?;
        let bucket_name = get(BUCKET_ENV)?;
        let project_id = get(PROJECT_ENV)?;
        Ok(Self {
            api_key,
            bucket_name,
            project_id,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSettings {
    pub job_name: String,
    pub schedule: String,
    pub time_zone: String,
    pub symbols: Vec<String>,
    pub include_holdings: bool,
    /// Create the push subscription and scheduler job instead of printing the command.
    pub create_job: bool,
    /// Service account used to authenticate Pub/Sub pushes to the private service.
    pub service_account: Option<String>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            job_name: "etf-daily-ingest".into(),
            schedule: "0 9 * * 1-5".into(),
            time_zone: "America/New_York".into(),
            symbols: vec!["QQQ".into(), "SPY".into(), "VTI".into()],
            include_holdings: true,
            create_job: false,
            service_account: None,
        }
    }
}

/// Non-secret deployment settings, usually loaded from YAML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploySettings {
    pub region: String,
    pub source_dir: String,
    pub http_function: String,
    pub scheduled_function: String,
    pub topic: String,
    pub memory: String,
    pub timeout: String,
    pub scheduler: SchedulerSettings,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            region: "us-central1".into(),
            source_dir: ".".into(),
            http_function: HTTP_FUNCTION.into(),
            scheduled_function: SCHEDULED_FUNCTION.into(),
            topic: "etf-data-ingest-trigger".into(),
            memory: "512Mi".into(),
            timeout: "540s".into(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

/// Cloud Run service names allow lowercase letters, digits and hyphens only.
pub fn service_name(function: &str) -> String {
    function.to_ascii_lowercase().replace('_', "-")
}

/// Renders `--set-env-vars` values, switching to gcloud's `^@^` delimiter syntax when a
/// value contains a comma.
pub fn env_vars_arg(vars: &[(&str, &str)]) -> String {
    let delimiter = if vars.iter().any(|(_, v)| v.contains(',')) {
        "@"
    } else {
        ","
    };
    let joined = vars
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(delimiter);
    if delimiter == "," {
        joined
    } else {
        format!("^{delimiter}^{joined}")
    }
}

/// Quotes `arg` for display in a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,^%+".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPolicy {
    /// Any failure aborts the deployment.
    Required,
    /// "already exists" is recorded and the deployment continues.
    TolerateExisting,
    /// Required; stdout is the service URL used by later steps.
    CaptureUrl,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployStep {
    pub description: String,
    pub command: CommandSpec,
    pub policy: StepPolicy,
}

impl DeployStep {
    fn new(description: impl Into<String>, args: Vec<String>, policy: StepPolicy) -> Self {
        Self {
            description: description.into(),
            command: CommandSpec::new(GCLOUD, args),
            policy,
        }
    }

    /// Whether this step deploys a service.
    pub fn is_deployment(&self) -> bool {
        matches!(self.command.args.as_slice(), [group, verb, ..] if group == "run" && verb == "deploy")
    }
}

/// The ordered commands for one deployment.
#[derive(Clone)]
pub struct DeployPlan {
    pub function: String,
    /// Handler the deployed service runs, exported as `FUNCTION_TARGET`.
    pub entry_point: &'static str,
    pub service: String,
    pub steps: Vec<DeployStep>,
    /// Scheduler command printed for the operator when the job is not created.
    pub scheduler_example: Option<String>,
    secrets: Vec<(&'static str, String)>,
}

impl std::fmt::Debug for DeployPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployPlan")
            .field("function", &self.function)
            .field("service", &self.service)
            .field("steps", &self.rendered_steps())
            .finish()
    }
}

fn deploy_args(
    env: &DeployEnv,
    settings: &DeploySettings,
    function: &str,
    entry_point: &str,
    public: bool,
) -> Vec<String> {
    let env_vars = env_vars_arg(&[
        (FUNCTION_TARGET_ENV, entry_point),
        (API_KEY_ENV, &env.api_key),
        (BUCKET_ENV, &env.bucket_name),
    ]);
    let auth = if public {
        "--allow-unauthenticated"
    } else {
        "--no-allow-unauthenticated"
    };
    vec![
        "run".into(),
        "deploy".into(),
        service_name(function),
        "--source".into(),
        settings.source_dir.clone(),
        "--region".into(),
        settings.region.clone(),
        "--project".into(),
        env.project_id.clone(),
        auth.into(),
        "--memory".into(),
        settings.memory.clone(),
        "--timeout".into(),
        settings.timeout.clone(),
        "--set-env-vars".into(),
        env_vars,
        "--quiet".into(),
    ]
}

fn describe_args(env: &DeployEnv, settings: &DeploySettings, function: &str) -> Vec<String> {
    vec![
        "run".into(),
        "services".into(),
        "describe".into(),
        service_name(function),
        "--region".into(),
        settings.region.clone(),
        "--project".into(),
        env.project_id.clone(),
        "--format".into(),
        "value(status.url)".into(),
    ]
}

fn scheduler_job_args(env: &DeployEnv, settings: &DeploySettings) -> Result<Vec<String>, DeployError> {
    let scheduler = &settings.scheduler;
    let message = serde_json::to_string(&ScheduledRequest {
        symbols: scheduler.symbols.clone(),
        include_holdings: scheduler.include_holdings,
    })?;
    Ok(vec![
        "scheduler".into(),
        "jobs".into(),
        "create".into(),
        "pubsub".into(),
        scheduler.job_name.clone(),
        "--location".into(),
        settings.region.clone(),
        "--project".into(),
        env.project_id.clone(),
        "--schedule".into(),
        scheduler.schedule.clone(),
        "--time-zone".into(),
        scheduler.time_zone.clone(),
        "--topic".into(),
        settings.topic.clone(),
        "--message-body".into(),
        message,
    ])
}

impl DeployPlan {
    /// Plan for the public on-demand function.
    pub fn http(env: &DeployEnv, settings: &DeploySettings) -> Self {
        let function = settings.http_function.clone();
        let steps = vec![
            DeployStep::new(
                format!("deploy {function}"),
                deploy_args(env, settings, &function, HTTP_FUNCTION, true),
                StepPolicy::Required,
            ),
            DeployStep::new(
                format!("describe {function}"),
                describe_args(env, settings, &function),
                StepPolicy::CaptureUrl,
            ),
        ];
        Self {
            service: service_name(&function),
            function,
            entry_point: HTTP_FUNCTION,
            steps,
            scheduler_example: None,
            secrets: vec![(API_KEY_ENV, env.api_key.clone())],
        }
    }

    /// Plan for the scheduled function and its trigger topic.
    pub fn scheduled(env: &DeployEnv, settings: &DeploySettings) -> Result<Self, DeployError> {
        let function = settings.scheduled_function.clone();
        let mut steps = vec![
            DeployStep::new(
                format!("create topic {}", settings.topic),
                vec![
                    "pubsub".into(),
                    "topics".into(),
                    "create".into(),
                    settings.topic.clone(),
                    "--project".into(),
                    env.project_id.clone(),
                ],
                StepPolicy::TolerateExisting,
            ),
            DeployStep::new(
                format!("deploy {function}"),
                deploy_args(env, settings, &function, SCHEDULED_FUNCTION, false),
                StepPolicy::Required,
            ),
            DeployStep::new(
                format!("describe {function}"),
                describe_args(env, settings, &function),
                StepPolicy::CaptureUrl,
            ),
        ];

        let job_args = scheduler_job_args(env, settings)?;
        let scheduler_example = if settings.scheduler.create_job {
            let subscription = format!("{}-push", settings.topic);
            let mut sub_args: Vec<String> = vec![
                "pubsub".into(),
                "subscriptions".into(),
                "create".into(),
                subscription.clone(),
                "--topic".into(),
                settings.topic.clone(),
                "--project".into(),
                env.project_id.clone(),
                "--push-endpoint".into(),
                SERVICE_URL_PLACEHOLDER.into(),
                "--ack-deadline".into(),
                PUSH_ACK_DEADLINE_SECS.to_string(),
            ];
            match &settings.scheduler.service_account {
                Some(account) => {
                    sub_args.push("--push-auth-service-account".into());
                    sub_args.push(account.clone());
                }
                None => warn!(
                    subscription = %subscription,
                    "No scheduler.service_account configured; pushes to the private service will be rejected"
                ),
            }
            steps.push(DeployStep::new(
                format!("create subscription {subscription}"),
                sub_args,
                StepPolicy::TolerateExisting,
            ));
            steps.push(DeployStep::new(
                format!("create scheduler job {}", settings.scheduler.job_name),
                job_args,
                StepPolicy::TolerateExisting,
            ));
            None
        } else {
            let rendered = std::iter::once(GCLOUD.to_string())
                .chain(job_args.iter().map(|a| shell_quote(a)))
                .collect::<Vec<_>>()
                .join(" ");
            Some(rendered)
        };

        Ok(Self {
            service: service_name(&function),
            function,
            entry_point: SCHEDULED_FUNCTION,
            steps,
            scheduler_example,
            secrets: vec![(API_KEY_ENV, env.api_key.clone())],
        })
    }

    /// Number of service deployments the plan issues.
    pub fn deploy_invocations(&self) -> usize {
        self.steps.iter().filter(|s| s.is_deployment()).count()
    }

    /// Shell rendering of `command` with secrets masked.
    pub fn render(&self, command: &CommandSpec) -> String {
        let line = std::iter::once(command.program.clone())
            .chain(command.args.iter().map(|a| shell_quote(a)))
            .collect::<Vec<_>>()
            .join(" ");
        self.mask(&line)
    }

    pub fn rendered_steps(&self) -> Vec<String> {
        self.steps.iter().map(|s| self.render(&s.command)).collect()
    }

    fn mask(&self, text: &str) -> String {
        self.secrets
            .iter()
            .filter(|(_, secret)| !secret.is_empty())
            .fold(text.to_string(), |acc, (name, secret)| {
                let acc = acc.replace(&format!("{name}={secret}"), &format!("{name}={MASK}"));
                if secret.len() >= MIN_BARE_MASK_LEN {
                    acc.replace(secret.as_str(), MASK)
                } else {
                    acc
                }
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Done,
    AlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub description: String,
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub function: String,
    pub entry_point: &'static str,
    pub service: String,
    pub url: Option<String>,
    pub steps: Vec<StepReport>,
    pub scheduler_example: Option<String>,
}

impl DeployReport {
    /// Example invocation of the deployed on-demand endpoint.
    pub fn usage_example(&self) -> Option<String> {
        let url = self.url.as_deref()?;
        Some(format!(
            "curl -X POST {url} -H 'Content-Type: application/json' -d '{{\"symbol\": \"QQQ\", \"include_holdings\": true}}'"
        ))
    }
}

fn already_exists(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_ascii_lowercase();
    stderr.contains("already exists") || stderr.contains("already_exists")
}

fn substitute_url(command: &CommandSpec, url: Option<&str>, step: &str) -> Result<CommandSpec, DeployError> {
    if !command.args.iter().any(|a| a.contains(SERVICE_URL_PLACEHOLDER)) {
        return Ok(command.clone());
    }
    let url = url.ok_or_else(|| DeployError::MissingServiceUrl(step.to_string()))?;
    Ok(CommandSpec {
        program: command.program.clone(),
        args: command
            .args
            .iter()
            .map(|a| a.replace(SERVICE_URL_PLACEHOLDER, url))
            .collect(),
    })
}

/// Runs every step of `plan` in order.
pub fn execute<R>(plan: &DeployPlan, runner: &R) -> Result<DeployReport, DeployError>
where
    R: CommandRunner + ?Sized,
{
    info!(function = %plan.function, service = %plan.service, steps = plan.steps.len(), "[DEPLOY] Starting deployment");

    let mut url: Option<String> = None;
    let mut steps = Vec::with_capacity(plan.steps.len());

    for step in &plan.steps {
        let command = substitute_url(&step.command, url.as_deref(), &step.description)?;
        info!(step = %step.description, command = %plan.render(&command), "[DEPLOY] Running step");

        let output = runner.run(&command).map_err(|source| {
            error!(step = %step.description, error = %source, "[DEPLOY][ERROR] Failed to launch command");
            DeployError::Launch {
                step: step.description.clone(),
                source,
            }
        })?;

        let outcome = if output.success() {
            StepOutcome::Done
        } else if step.policy == StepPolicy::TolerateExisting && already_exists(&output) {
            info!(step = %step.description, "[DEPLOY] Resource already exists, continuing");
            StepOutcome::AlreadyExists
        } else {
            error!(step = %step.description, status = ?output.status, stderr = %output.stderr.trim(), "[DEPLOY][ERROR] Step failed");
            return Err(DeployError::CommandFailed {
                step: step.description.clone(),
                status: output.status,
                stderr: plan.mask(output.stderr.trim()),
            });
        };

        if step.policy == StepPolicy::CaptureUrl {
            let captured = output.stdout.trim();
            if captured.is_empty() {
                warn!(step = %step.description, "[DEPLOY] Describe step returned no URL");
            } else {
                url = Some(captured.to_string());
            }
        }

        steps.push(StepReport {
            description: step.description.clone(),
            outcome,
        });
    }

    info!(function = %plan.function, url = ?url, "[DEPLOY] Deployment complete");
    Ok(DeployReport {
        function: plan.function.clone(),
        entry_point: plan.entry_point,
        service: plan.service.clone(),
        url,
        steps,
        scheduler_example: plan.scheduler_example.clone(),
    })
}

/// Which function a deployment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployTarget {
    Http,
    Scheduled,
}

impl DeployTarget {
    pub fn plan(self, env: &DeployEnv, settings: &DeploySettings) -> Result<DeployPlan, DeployError> {
        match self {
            DeployTarget::Http => Ok(DeployPlan::http(env, settings)),
            DeployTarget::Scheduled => DeployPlan::scheduled(env, settings),
        }
    }
}

/// Validates the environment, then plans and executes the deployment of `target`.
///
/// Nothing is run when a required variable is missing.
pub fn deploy_from_env<R>(
    target: DeployTarget,
    settings: &DeploySettings,
    runner: &R,
) -> Result<DeployReport, DeployError>
where
    R: CommandRunner + ?Sized,
{
    let env = DeployEnv::from_env().map_err(|e| {
        error!(error = %e, "[DEPLOY][ERROR] Required environment missing");
        e
    })?;
    let plan = target.plan(&env, settings)?;
    execute(&plan, runner)
}
