//! Subcommand execution. Every command prints the re-read entity as JSON.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;

use dts_client::{NoToken, StaticToken, TokenProvider};
use dts_config::DtsConfig;
use dts_hooks::registry::{HookRegistry, WILDCARD, log_handler};
use dts_orchestrator::{Orchestrator, OrchestratorError};
use dts_storage::DtsStorage;
use dts_types::{ExecutionOutcome, JobPatch, JobSpec};

use crate::{ExecutionCommand, JobCommand, ScheduleCommand};

/// Build the orchestrator with intent events logged through `tracing`.
pub async fn orchestrator(config: &DtsConfig, local: bool) -> anyhow::Result<Orchestrator> {
    let hooks = HookRegistry::new();
    hooks.on(WILDCARD, log_handler()).await;

    let orch = if local {
        let path = config.database_path()?;
        let storage = DtsStorage::open(&path, config.server.capacity)
            .with_context(|| format!("opening database {}", path.display()))?;
        Orchestrator::local(Arc::new(storage)).with_call_timeout(config.services.request_timeout())
    } else {
        let tokens: Arc<dyn TokenProvider> = match &config.services.auth_token {
            Some(token) => Arc::new(StaticToken::new(token.clone())),
            None => Arc::new(NoToken),
        };
        Orchestrator::from_config(&config.services, tokens)?
    };
    Ok(orch.with_hooks(Arc::new(hooks)))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Add a retry hint to errors the user can act on.
fn explain(err: OrchestratorError) -> anyhow::Error {
    let hint = match &err {
        OrchestratorError::PartialFailure { job_id, .. } => {
            Some(format!("retry with `dts job cancel {job_id} --resume`"))
        }
        e if e.is_retryable() => Some("the request can be retried".to_string()),
        _ => None,
    };
    let kind = err.kind();
    let err = anyhow::Error::new(err).context(format!("request failed ({kind})"));
    match hint {
        Some(hint) => err.context(hint),
        None => err,
    }
}

pub async fn job(orch: &Orchestrator, command: JobCommand) -> anyhow::Result<()> {
    match command {
        JobCommand::Create {
            name,
            cron,
            description,
            priority,
            max_retries,
            timeout_seconds,
            metadata,
        } => {
            let spec = JobSpec {
                name,
                description,
                cron_expression: cron,
                priority,
                max_retries,
                timeout_seconds,
                metadata: metadata.into_iter().collect(),
            };
            print_json(&orch.create_job(spec).await.map_err(explain)?)
        }
        JobCommand::Get { id } => print_json(&orch.job_view(&id).await.map_err(explain)?),
        JobCommand::List { status } => print_json(&orch.list_jobs(status).await.map_err(explain)?),
        JobCommand::Edit {
            id,
            name,
            cron,
            description,
            priority,
            max_retries,
            timeout_seconds,
            metadata,
        } => {
            let patch = JobPatch {
                name,
                description,
                cron_expression: cron,
                priority,
                max_retries,
                timeout_seconds,
                metadata: (!metadata.is_empty())
                    .then(|| metadata.into_iter().collect::<HashMap<_, _>>()),
            };
            print_json(&orch.edit_job(&id, patch).await.map_err(explain)?)
        }
        JobCommand::Delete { id } => {
            orch.delete_job(&id).await.map_err(explain)?;
            println!("deleted job {id}");
            Ok(())
        }
        JobCommand::Cancel { id, resume } => {
            let job = if resume {
                orch.finish_cancel(&id).await
            } else {
                orch.cancel_job(&id).await
            };
            print_json(&job.map_err(explain)?)
        }
        JobCommand::Run { id, resources } => {
            print_json(&orch.run_now(&id, resources.into()).await.map_err(explain)?)
        }
    }
}

pub async fn schedule(orch: &Orchestrator, command: ScheduleCommand) -> anyhow::Result<()> {
    match command {
        ScheduleCommand::Create {
            job_id,
            resources,
            at,
        } => print_json(
            &orch
                .schedule_run(&job_id, resources.into(), at)
                .await
                .map_err(explain)?,
        ),
        ScheduleCommand::List { job } => print_json(
            &orch
                .list_scheduled_runs(job.as_deref())
                .await
                .map_err(explain)?,
        ),
        ScheduleCommand::Cancel { id } => {
            orch.cancel_scheduled_run(&id).await.map_err(explain)?;
            println!("cancelled scheduled run {id}");
            Ok(())
        }
    }
}

pub async fn execution(orch: &Orchestrator, command: ExecutionCommand) -> anyhow::Result<()> {
    match command {
        ExecutionCommand::List { job_id } => {
            print_json(&orch.list_executions(&job_id).await.map_err(explain)?)
        }
        ExecutionCommand::Finish {
            id,
            succeeded,
            failed,
        } => {
            let outcome = match (succeeded, failed) {
                (Some(result), _) => ExecutionOutcome::Succeeded { result },
                (None, Some(error)) => ExecutionOutcome::Failed { error },
                (None, None) => anyhow::bail!("one of --succeeded or --failed is required"),
            };
            print_json(&orch.finish_execution(&id, outcome).await.map_err(explain)?)
        }
    }
}

/// GET /health on each configured service.
pub async fn health(config: &DtsConfig) -> anyhow::Result<()> {
    let client = reqwest::Client::builder()
        .timeout(config.services.request_timeout())
        .build()?;
    let services = [
        ("job registry", &config.services.job_registry_url),
        ("scheduler", &config.services.scheduler_url),
        ("execution tracker", &config.services.execution_url),
    ];
    let mut healthy = true;
    for (name, base_url) in services {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body: serde_json::Value = resp.json().await.unwrap_or_default();
                let version = body["version"].as_str().unwrap_or("unknown");
                println!("{name}: ok ({base_url}, version {version})");
            }
            Ok(resp) => {
                healthy = false;
                println!("{name}: HTTP {} ({base_url})", resp.status());
            }
            Err(e) => {
                healthy = false;
                println!("{name}: unreachable ({base_url}): {e}");
            }
        }
    }
    if !healthy {
        anyhow::bail!("one or more services are unhealthy");
    }
    Ok(())
}
