use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use loam_config::LoamConfig;
use loam_core::{ContractSpec, LoamError, Predicate, ToolAdapter};
use loam_engine::{SessionRunner, SessionSpec};
use loam_memory::LessonStore;
use loam_model::{MockModel, ModelClient};
use loam_testing::{fluxtool, gridtool, ScriptedModel};

/// Arguments for `loam run`.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Task identifier (used for the task cluster and artifacts)
    #[arg(long)]
    pub task: String,

    /// Domain adapter to load (gridtool, fluxtool)
    #[arg(long)]
    pub domain: String,

    /// Session id (a fresh UUID when omitted)
    #[arg(long)]
    pub session: Option<Uuid>,

    /// Task text handed to the model (a canned demo task when omitted)
    #[arg(long)]
    pub task_text: Option<String>,

    /// Contract predicate: final state must contain this literal.
    /// Repeatable; predicates are evaluated in order.
    #[arg(long = "contains")]
    pub contains: Vec<String>,

    /// Replay script driving the model (JSONL, one turn per line).
    /// Session turns are consumed first, then one critic turn if present.
    /// Real transports implement the ModelClient SPI out of tree.
    #[arg(long, env = "LOAM_SCRIPT")]
    pub script: PathBuf,

    /// Separate replay script for the critic
    #[arg(long)]
    pub critic_script: Option<PathBuf>,

    /// Override session.max_steps
    #[arg(long)]
    pub max_steps: Option<u32>,

    /// Override learning.mode (strict, legacy, auto)
    #[arg(long)]
    pub mode: Option<String>,

    /// Override learning.transfer (off, auto, always)
    #[arg(long)]
    pub transfer: Option<String>,
}

pub async fn execute(args: RunArgs, mut config: LoamConfig) -> loam_core::Result<()> {
    if let Some(max_steps) = args.max_steps {
        config.session.max_steps = max_steps;
    }
    if let Some(mode) = &args.mode {
        config.learning.mode = mode
            .parse()
            .map_err(LoamError::Config)?;
    }
    if let Some(transfer) = &args.transfer {
        config.learning.transfer = transfer
            .parse()
            .map_err(LoamError::Config)?;
    }

    let adapter: Arc<dyn ToolAdapter> = match args.domain.as_str() {
        "gridtool" => Arc::new(gridtool()),
        "fluxtool" => Arc::new(fluxtool()),
        other => {
            return Err(LoamError::Config(format!(
                "unknown domain: {other} (bundled domains: gridtool, fluxtool)"
            )));
        }
    };

    let model: Arc<dyn ModelClient> = Arc::new(ScriptedModel::from_path(&args.script)?);
    let critic: Arc<dyn ModelClient> = match &args.critic_script {
        Some(path) => Arc::new(ScriptedModel::from_path(path)?),
        // An exhausted mock yields "[]"-equivalent critic output
        None => Arc::new(MockModel::new("critic").with_text("[]")),
    };

    let session_id = args.session.unwrap_or_else(Uuid::new_v4);
    let task_text = args.task_text.clone().unwrap_or_else(|| {
        format!(
            "Use the {} tool to complete task {}.",
            args.domain, args.task
        )
    });
    let contract = if args.contains.is_empty() {
        None
    } else {
        Some(ContractSpec {
            predicates: args
                .contains
                .iter()
                .map(|needle| Predicate::Contains {
                    needle: needle.clone(),
                })
                .collect(),
        })
    };

    let store_path = config.storage.data_dir.join("lessons.jsonl");
    let mut store = match LessonStore::open(&store_path) {
        Ok(store) => store,
        Err(e) => {
            warn!(error = %e, "cannot open lesson store, degrading to in-memory");
            LessonStore::in_memory()
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_cancel.cancel();
        }
    });

    // The replay transport drives every model call; the judge would
    // consume session turns out of order, so the reference CLI relies on
    // the deterministic contract referee.
    let runner = SessionRunner::new(config, model, adapter)
        .without_judge()
        .with_critic_client(critic)
        .with_cancel(cancel);

    let spec = SessionSpec {
        session_id,
        task_id: args.task.clone(),
        task_text,
        contract,
        task_cluster: None,
        knowledge_snippet: None,
    };

    let report = runner.run(&spec, &mut store).await?;
    info!(
        session = %session_id,
        passed = report.metrics.passed,
        score = report.metrics.score,
        steps = report.metrics.steps,
        tool_errors = report.metrics.tool_errors,
        lessons = store.len(),
        "session complete"
    );
    println!(
        "session {} {} (score {:.2}, {} steps, {} tool errors)",
        session_id,
        if report.metrics.passed { "PASS" } else { "FAIL" },
        report.metrics.score,
        report.metrics.steps,
        report.metrics.tool_errors,
    );

    // Only transport-level failure surfaces as a non-zero exit
    if report.transport_failure {
        return Err(LoamError::Transport(
            report
                .metrics
                .fail_reason
                .unwrap_or_else(|| "transport failure".into()),
        ));
    }
    Ok(())
}
